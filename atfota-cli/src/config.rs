//! Configuration file support for atfota.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (ATFOTA_*)
//! 3. Local config file (./atfota.toml)
//! 4. Global config file (~/.config/atfota/config.toml)
//!
//! Every field is optional so that a local file can override a single value of the
//! global one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail};
use atfota::{
    AgentConfig, HttpRangeEncoding, HttpSettings, JsonLineEncoding, LinkConfig, MqttEncoding,
    MqttSettings, TransferConfig, WireEncoding,
};
use directories::ProjectDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

/// Local config file name.
pub const LOCAL_CONFIG: &str = "atfota.toml";

/// Default baud rate for SIM800-class modems.
pub const DEFAULT_BAUD: u32 = 115200;

/// Which wire encoding the update server speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncodingKind {
    /// MQTT over a TCP socket.
    #[default]
    Mqtt,
    /// Newline-delimited JSON over a TCP socket.
    JsonLine,
    /// The modem's HTTP client.
    HttpRange,
}

/// `[device]`: who this client is.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier sent with every request.
    pub id: Option<String>,
    /// Version currently running.
    pub version: Option<String>,
}

/// `[modem]`: the serial link.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModemConfig {
    /// Serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
}

/// `[network]`: packet data settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Access point name.
    pub apn: Option<String>,
    /// APN user.
    pub user: Option<String>,
    /// APN password.
    pub password: Option<String>,
}

/// `[server]`: where updates come from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Wire encoding.
    pub encoding: Option<EncodingKind>,
    /// Host for the socket encodings.
    pub host: Option<String>,
    /// Port for the socket encodings.
    pub port: Option<u16>,
    /// MQTT topics and client id.
    pub mqtt: Option<MqttSettings>,
    /// HTTP endpoint.
    pub http: Option<HttpSettings>,
}

/// `[transfer]`: chunking and retries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransferSection {
    /// Largest chunk to request, in bytes.
    pub max_chunk: Option<u64>,
    /// Seconds to wait for one chunk.
    pub chunk_timeout_secs: Option<u64>,
    /// Seconds to wait for a check reply.
    pub check_timeout_secs: Option<u64>,
    /// Attempts per chunk.
    pub retries: Option<usize>,
    /// Where to write the image.
    pub output: Option<PathBuf>,
}

/// `[schedule]`: periodic work of `atfota run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Seconds between keep-alives.
    pub ping_interval_secs: Option<u64>,
    /// Seconds between update checks.
    pub check_interval_secs: Option<u64>,
    /// Seconds before the first check.
    pub initial_check_delay_secs: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Device identity.
    #[serde(default)]
    pub device: DeviceConfig,
    /// Serial link.
    #[serde(default)]
    pub modem: ModemConfig,
    /// Packet data settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Update server.
    #[serde(default)]
    pub server: ServerConfig,
    /// Transfer tuning.
    #[serde(default)]
    pub transfer: TransferSection,
    /// Background schedule.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

/// Take `other` where it is set.
fn overlay<T>(base: &mut Option<T>, other: Option<T>) {
    if other.is_some() {
        *base = other;
    }
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "atfota").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one, field by field.
    fn merge(&mut self, other: Self) {
        overlay(&mut self.device.id, other.device.id);
        overlay(&mut self.device.version, other.device.version);

        overlay(&mut self.modem.port, other.modem.port);
        overlay(&mut self.modem.baud, other.modem.baud);

        overlay(&mut self.network.apn, other.network.apn);
        overlay(&mut self.network.user, other.network.user);
        overlay(&mut self.network.password, other.network.password);

        overlay(&mut self.server.encoding, other.server.encoding);
        overlay(&mut self.server.host, other.server.host);
        overlay(&mut self.server.port, other.server.port);
        overlay(&mut self.server.mqtt, other.server.mqtt);
        overlay(&mut self.server.http, other.server.http);

        overlay(&mut self.transfer.max_chunk, other.transfer.max_chunk);
        overlay(
            &mut self.transfer.chunk_timeout_secs,
            other.transfer.chunk_timeout_secs,
        );
        overlay(
            &mut self.transfer.check_timeout_secs,
            other.transfer.check_timeout_secs,
        );
        overlay(&mut self.transfer.retries, other.transfer.retries);
        overlay(&mut self.transfer.output, other.transfer.output);

        overlay(
            &mut self.schedule.ping_interval_secs,
            other.schedule.ping_interval_secs,
        );
        overlay(
            &mut self.schedule.check_interval_secs,
            other.schedule.check_interval_secs,
        );
        overlay(
            &mut self.schedule.initial_check_delay_secs,
            other.schedule.initial_check_delay_secs,
        );
    }

    /// The configured wire encoding.
    pub fn encoding(&self) -> WireEncoding {
        match self.server.encoding.unwrap_or_default() {
            EncodingKind::Mqtt => WireEncoding::Mqtt(MqttEncoding::new(
                self.server.mqtt.clone().unwrap_or_default(),
            )),
            EncodingKind::JsonLine => WireEncoding::JsonLine(JsonLineEncoding),
            EncodingKind::HttpRange => WireEncoding::HttpRange(HttpRangeEncoding::new(
                self.server.http.clone().unwrap_or_default(),
            )),
        }
    }

    /// Library settings for the agent, with defaults for anything unset.
    pub fn agent_config(&self) -> Result<AgentConfig> {
        let Some(device_id) = self.device.id.clone().filter(|id| !id.is_empty()) else {
            bail!("No device id configured; set [device] id in {LOCAL_CONFIG}");
        };

        let encoding = self.server.encoding.unwrap_or_default();
        let mut link = LinkConfig::default();
        if let Some(apn) = &self.network.apn {
            link = link.with_apn(
                apn.clone(),
                self.network.user.clone().unwrap_or_default(),
                self.network.password.clone().unwrap_or_default(),
            );
        }
        match (&self.server.host, encoding) {
            (Some(host), _) => {
                let port = self.server.port.unwrap_or(link.server_port);
                link = link.with_server(host.clone(), port);
            },
            (None, EncodingKind::HttpRange) => {
                let has_url = self
                    .server
                    .http
                    .as_ref()
                    .is_some_and(|http| !http.base_url.is_empty());
                if !has_url {
                    bail!("No update server configured; set [server.http] base_url");
                }
            },
            (None, _) => bail!("No update server configured; set [server] host"),
        }

        let defaults = TransferConfig::default();
        let mut transfer = TransferConfig::new(
            device_id,
            self.device
                .version
                .clone()
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        )
        .with_max_chunk(self.transfer.max_chunk.unwrap_or(defaults.max_chunk))
        .with_timeouts(
            secs_or(self.transfer.check_timeout_secs, defaults.check_timeout),
            secs_or(self.transfer.chunk_timeout_secs, defaults.chunk_timeout),
        );
        if let Some(retries) = self.transfer.retries {
            transfer = transfer.with_retries(retries, defaults.retry_backoff);
        }
        if transfer.max_chunk == 0 {
            bail!("[transfer] max_chunk must be greater than zero");
        }

        let agent_defaults = AgentConfig::default();
        Ok(AgentConfig::new(link, transfer)
            .with_intervals(
                secs_or(
                    self.schedule.ping_interval_secs,
                    agent_defaults.ping_interval,
                ),
                secs_or(
                    self.schedule.check_interval_secs,
                    agent_defaults.check_interval,
                ),
            )
            .with_initial_check_delay(secs_or(
                self.schedule.initial_check_delay_secs,
                agent_defaults.initial_check_delay,
            )))
    }
}

fn secs_or(secs: Option<u64>, default: Duration) -> Duration {
    secs.map_or(default, Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        let mut config = Config::default();
        config.device.id = Some("esp32_001".into());
        config.server.host = Some("fota.example.com".into());
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.device.id.is_none());
        assert!(config.modem.port.is_none());
        assert!(config.server.encoding.is_none());
        assert!(config.transfer.output.is_none());
    }

    #[test]
    fn test_config_merge_overrides_field_by_field() {
        let mut base = Config::default();
        base.modem.port = Some("/dev/ttyUSB0".into());
        base.modem.baud = Some(57600);
        base.network.apn = Some("internet".into());

        let mut other = Config::default();
        other.modem.baud = Some(115200);
        other.server.encoding = Some(EncodingKind::JsonLine);

        base.merge(other);
        assert_eq!(base.modem.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(base.modem.baud, Some(115200));
        assert_eq!(base.network.apn.as_deref(), Some("internet"));
        assert_eq!(base.server.encoding, Some(EncodingKind::JsonLine));
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
[device]
id = "esp32_001"
version = "1.0.0"

[modem]
port = "/dev/ttyUSB0"
baud = 115200

[network]
apn = "cmnet"

[server]
encoding = "json-line"
host = "fota.example.com"
port = 5000

[transfer]
max_chunk = 512
retries = 5

[schedule]
check_interval_secs = 600
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.device.id.as_deref(), Some("esp32_001"));
        assert_eq!(config.modem.baud, Some(115200));
        assert_eq!(config.server.encoding, Some(EncodingKind::JsonLine));
        assert_eq!(config.server.port, Some(5000));
        assert_eq!(config.transfer.max_chunk, Some(512));
        assert_eq!(config.schedule.check_interval_secs, Some(600));
    }

    #[test]
    fn test_mqtt_section_fills_missing_fields_with_defaults() {
        let toml_str = r#"
[server]
encoding = "mqtt"
host = "broker.example.com"

[server.mqtt]
client_id = "sim800-7"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let mqtt = config.server.mqtt.unwrap();
        assert_eq!(mqtt.client_id, "sim800-7");
        assert_eq!(mqtt.data_topic, MqttSettings::default().data_topic);
    }

    #[test]
    fn test_unknown_encoding_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[server]\nencoding = \"carrier-pigeon\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_agent_config_applies_overrides() {
        let mut config = minimal();
        config.server.port = Some(5000);
        config.network.apn = Some("cmnet".into());
        config.transfer.max_chunk = Some(256);
        config.transfer.retries = Some(7);
        config.schedule.initial_check_delay_secs = Some(0);

        let agent = config.agent_config().unwrap();
        assert_eq!(agent.link.server_host, "fota.example.com");
        assert_eq!(agent.link.server_port, 5000);
        assert_eq!(agent.link.apn, "cmnet");
        assert_eq!(agent.transfer.device_id, "esp32_001");
        assert_eq!(agent.transfer.max_chunk, 256);
        assert_eq!(agent.transfer.chunk_retries, 7);
        assert_eq!(agent.initial_check_delay, Duration::ZERO);
        assert_eq!(agent.check_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_agent_config_requires_identity_and_server() {
        let mut config = minimal();
        config.device.id = None;
        assert!(config.agent_config().is_err());

        let mut config = minimal();
        config.server.host = None;
        assert!(config.agent_config().is_err());

        let mut config = minimal();
        config.server.host = None;
        config.server.encoding = Some(EncodingKind::HttpRange);
        config.server.http = Some(HttpSettings {
            base_url: "http://fota.example.com".into(),
            ..HttpSettings::default()
        });
        assert!(config.agent_config().is_ok());

        let mut config = minimal();
        config.transfer.max_chunk = Some(0);
        assert!(config.agent_config().is_err());
    }

    #[test]
    fn test_encoding_selection() {
        let mut config = minimal();
        assert_eq!(config.encoding().name(), "mqtt");
        config.server.encoding = Some(EncodingKind::HttpRange);
        assert_eq!(config.encoding().name(), "http-range");
    }

    #[test]
    fn test_load_from_path_valid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atfota.toml");
        fs::write(
            &path,
            r#"
[modem]
port = "/dev/ttyUSB1"
[device]
id = "tracker-9"
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path);
        assert_eq!(config.modem.port.as_deref(), Some("/dev/ttyUSB1"));
        assert_eq!(config.device.id.as_deref(), Some("tracker-9"));
    }

    #[test]
    fn test_load_from_path_invalid_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "invalid toml [[[").unwrap();
        let config = Config::load_from_path(&path);
        assert!(config.device.id.is_none());

        let config = Config::load_from_path(Path::new("/nonexistent/path/config.toml"));
        assert!(config.modem.port.is_none());
    }

    #[test]
    fn test_global_config_path() {
        if let Some(p) = Config::global_config_path() {
            let p = p.to_string_lossy().to_string();
            assert!(p.contains("atfota"));
            assert!(p.ends_with("config.toml"));
        }
    }
}
