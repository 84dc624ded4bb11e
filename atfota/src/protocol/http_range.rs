//! HTTP GET through the modem's built-in HTTP client, read back in ranges.
//!
//! The check is a GET of the check endpoint whose body comes back through
//! `AT+HTTPREAD`. A transfer opens the image URL once and then reads it slice by
//! slice with `AT+HTTPREAD=<offset>,<size>`, which the modem answers with:
//!
//! ```text
//! +HTTPREAD: <n>\r\n<n raw bytes>\r\nOK\r\n
//! ```
//!
//! The modem's header only carries the slice length, so the offset and image size
//! of a [`ChunkHeader`] come from the range cursor of the active transfer.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::at::AtCommand;
use crate::error::ProtocolError;
use crate::protocol::{
    Bearer, ChunkHeader, ChunkProtocol, FirmwareDescriptor, Request, has_key, json_object,
};

const READ_MARKER: &[u8] = b"+HTTPREAD:";
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    /// Scheme and host, e.g. `http://fota.example.com`.
    pub base_url: String,
    /// Path of the version-check endpoint.
    pub check_path: String,
    /// How long to wait for `+HTTPACTION`, in seconds.
    pub action_timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            check_path: "/api/firmware/latest".into(),
            action_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RangeCursor {
    offset: u64,
    total: Option<u64>,
}

/// Ranged-read encoding of the transfer contract.
#[derive(Debug, Default)]
pub struct HttpRangeEncoding {
    settings: HttpSettings,
    cursor: Mutex<RangeCursor>,
}

impl HttpRangeEncoding {
    /// Create an encoding for the given endpoint.
    pub fn new(settings: HttpSettings) -> Self {
        Self {
            settings,
            cursor: Mutex::new(RangeCursor::default()),
        }
    }

    /// Endpoint settings in use.
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    fn set_cursor(&self, cursor: RangeCursor) {
        *self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = cursor;
    }

    fn cursor(&self) -> RangeCursor {
        *self
            .cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, locator: &str) -> String {
        if locator.starts_with("http://") || locator.starts_with("https://") {
            locator.to_string()
        } else {
            format!(
                "{}{}",
                self.settings.base_url.trim_end_matches('/'),
                locator
            )
        }
    }

    /// Commands that start a GET of `url` and wait for a 200 status.
    fn open(&self, url: &str) -> Result<Vec<AtCommand>, ProtocolError> {
        if url.contains('"') {
            return Err(ProtocolError::MalformedMetadata(format!(
                "URL cannot be quoted for the modem: {url}"
            )));
        }
        Ok(vec![
            AtCommand::new("AT+HTTPTERM").optional(),
            AtCommand::new("AT+HTTPINIT"),
            AtCommand::new("AT+HTTPPARA=\"CID\",1"),
            AtCommand::new(format!("AT+HTTPPARA=\"URL\",\"{url}\"")),
            AtCommand::new("AT+HTTPACTION=0")
                .expect("+HTTPACTION: 0,200,")
                .fail_on("+HTTPACTION: 0,3")
                .fail_on("+HTTPACTION: 0,4")
                .fail_on("+HTTPACTION: 0,5")
                .fail_on("+HTTPACTION: 0,6")
                .timeout(Duration::from_secs(self.settings.action_timeout_secs)),
        ])
    }
}

impl ChunkProtocol for HttpRangeEncoding {
    fn bearer(&self) -> Bearer {
        Bearer::Http
    }

    fn build_check_request(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<Request, ProtocolError> {
        self.set_cursor(RangeCursor::default());
        let url = format!(
            "{}?device={device_id}&version={current_version}",
            self.url(&self.settings.check_path)
        );
        let mut commands = self.open(&url)?;
        commands.push(AtCommand::new("AT+HTTPREAD").timeout(READ_TIMEOUT));
        commands.push(AtCommand::new("AT+HTTPTERM").optional());
        Ok(Request::Commands(commands))
    }

    fn begin_transfer(
        &self,
        _device_id: &str,
        descriptor: &FirmwareDescriptor,
    ) -> Result<Vec<Request>, ProtocolError> {
        let locator = descriptor
            .source_locator
            .as_deref()
            .ok_or_else(|| {
                ProtocolError::MalformedMetadata("descriptor has no image locator".into())
            })?;
        self.set_cursor(RangeCursor {
            offset: 0,
            total: Some(descriptor.total_size),
        });
        Ok(vec![Request::Commands(self.open(&self.url(locator))?)])
    }

    fn build_chunk_request(
        &self,
        _device_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<Request, ProtocolError> {
        let mut cursor = self.cursor();
        cursor.offset = offset;
        self.set_cursor(cursor);
        Ok(Request::Commands(vec![
            AtCommand::new(format!("AT+HTTPREAD={offset},{size}")).timeout(READ_TIMEOUT),
        ]))
    }

    fn end_transfer(&self) -> Vec<Request> {
        self.set_cursor(RangeCursor::default());
        vec![Request::Commands(vec![AtCommand::new("AT+HTTPTERM").optional()])]
    }

    fn descriptor_span<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        json_object(bytes).filter(|object| has_key(object, "version"))
    }

    fn is_chunk_header(&self, line: &[u8]) -> bool {
        line.trim_ascii_start().starts_with(READ_MARKER)
    }

    fn parse_chunk_header(&self, line: &[u8]) -> Result<ChunkHeader, ProtocolError> {
        let value = line
            .trim_ascii()
            .strip_prefix(READ_MARKER)
            .ok_or_else(|| ProtocolError::MalformedMetadata("missing +HTTPREAD marker".into()))?;
        let size: u64 = std::str::from_utf8(value)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| {
                ProtocolError::MalformedMetadata(format!(
                    "non-numeric read length {:?}",
                    String::from_utf8_lossy(value)
                ))
            })?;
        let cursor = self.cursor();
        Ok(ChunkHeader {
            offset: cursor.offset,
            size,
            total: cursor.total.unwrap_or(cursor.offset + size),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoding() -> HttpRangeEncoding {
        HttpRangeEncoding::new(HttpSettings {
            base_url: "http://fota.example.com/".into(),
            ..HttpSettings::default()
        })
    }

    fn descriptor(locator: Option<&str>) -> FirmwareDescriptor {
        FirmwareDescriptor {
            version: "1.1.0".into(),
            display_name: "fw".into(),
            total_size: 3000,
            content_hash: "0".repeat(32),
            source_locator: locator.map(str::to_string),
        }
    }

    #[test]
    fn test_check_request_runs_get_then_read() {
        let enc = encoding();
        let Request::Commands(cmds) = enc.build_check_request("esp32_001", "1.0.0").unwrap() else {
            panic!("expected commands");
        };
        let lines: Vec<&str> = cmds.iter().map(|c| c.line.as_str()).collect();
        assert_eq!(lines, vec![
            "AT+HTTPTERM",
            "AT+HTTPINIT",
            "AT+HTTPPARA=\"CID\",1",
            "AT+HTTPPARA=\"URL\",\"http://fota.example.com/api/firmware/latest?device=esp32_001&version=1.0.0\"",
            "AT+HTTPACTION=0",
            "AT+HTTPREAD",
            "AT+HTTPTERM",
        ]);
        assert!(cmds[0].optional);
        assert_eq!(cmds[4].expect, "+HTTPACTION: 0,200,");
        assert_eq!(cmds[4].timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_transfer_requires_locator() {
        let enc = encoding();
        assert!(matches!(
            enc.begin_transfer("dev", &descriptor(None)),
            Err(ProtocolError::MalformedMetadata(_))
        ));

        let reqs = enc
            .begin_transfer("dev", &descriptor(Some("/fw/app-1.1.0.bin")))
            .unwrap();
        let Request::Commands(cmds) = &reqs[0] else {
            panic!("expected commands");
        };
        assert!(
            cmds.iter()
                .any(|c| c.line == "AT+HTTPPARA=\"URL\",\"http://fota.example.com/fw/app-1.1.0.bin\"")
        );
    }

    #[test]
    fn test_header_takes_position_from_cursor() {
        let enc = encoding();
        enc.begin_transfer("dev", &descriptor(Some("https://cdn.example.com/a.bin")))
            .unwrap();
        let Request::Commands(cmds) = enc.build_chunk_request("dev", 2048, 952).unwrap() else {
            panic!("expected commands");
        };
        assert_eq!(cmds[0].line, "AT+HTTPREAD=2048,952");

        assert!(enc.is_chunk_header(b"+HTTPREAD: 952"));
        assert_eq!(
            enc.parse_chunk_header(b"+HTTPREAD: 952").unwrap(),
            ChunkHeader {
                offset: 2048,
                size: 952,
                total: 3000,
            }
        );
        assert!(matches!(
            enc.parse_chunk_header(b"+HTTPREAD: lots"),
            Err(ProtocolError::MalformedMetadata(_))
        ));

        enc.end_transfer();
        assert_eq!(
            enc.parse_chunk_header(b"+HTTPREAD: 120").unwrap(),
            ChunkHeader {
                offset: 0,
                size: 120,
                total: 120,
            }
        );
    }

    #[test]
    fn test_quote_in_url_is_rejected() {
        let enc = encoding();
        assert!(enc.build_check_request("dev\"ice", "1.0.0").is_err());
    }
}
