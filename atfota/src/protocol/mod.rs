//! Chunked firmware transfer protocol.
//!
//! A transfer is two kinds of exchange: a check that yields a [`FirmwareDescriptor`],
//! then a run of chunk requests, each answered by a metadata record ([`ChunkHeader`])
//! immediately followed by exactly `size` raw bytes. How those messages look on the
//! wire is the job of a [`ChunkProtocol`] implementation:
//!
//! - [`mqtt`]: MQTT 3.1.1 framing (CONNECT/SUBSCRIBE/PUBLISH/PINGREQ) over a TCP socket
//! - [`json_line`]: newline-delimited JSON records over a TCP socket
//! - [`http_range`]: the modem's HTTP client with ranged `AT+HTTPREAD` reads
//!
//! [`WireEncoding`] is the tagged union the rest of the crate is written against.

pub mod http_range;
pub mod json_line;
pub mod mqtt;
pub mod version;

use serde::{Deserialize, Serialize};

use crate::at::AtCommand;
use crate::error::ProtocolError;

pub use http_range::{HttpRangeEncoding, HttpSettings};
pub use json_line::JsonLineEncoding;
pub use mqtt::{MqttEncoding, MqttSettings};
pub use version::{FirmwareVersion, compare_versions, is_newer};

/// Length of a hex-encoded MD5 digest.
pub const DIGEST_HEX_LEN: usize = 32;

/// What the update server announced in response to a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    /// Version of the offered image.
    pub version: String,
    /// Human-readable image name.
    pub display_name: String,
    /// Image size in bytes.
    pub total_size: u64,
    /// Hex MD5 digest of the whole image.
    pub content_hash: String,
    /// Where to fetch the image from, for encodings that need it.
    pub source_locator: Option<String>,
}

/// Metadata record that precedes every chunk payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Offset of the first payload byte within the image.
    pub offset: u64,
    /// Number of raw bytes that follow the record.
    pub size: u64,
    /// Image size as the server sees it.
    pub total: u64,
}

/// One slice of the image to ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRequest {
    /// Offset to start at.
    pub offset: u64,
    /// Number of bytes wanted.
    pub requested_size: u64,
}

impl ChunkRequest {
    /// The request that follows `committed` bytes of a `total`-byte image, or `None`
    /// once the image is complete.
    pub fn next(committed: u64, total: u64, max_chunk: u64) -> Option<Self> {
        (committed < total && max_chunk > 0).then(|| Self {
            offset: committed,
            requested_size: max_chunk.min(total - committed),
        })
    }
}

/// How the link manager must bring up the data path for an encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bearer {
    /// A single TCP socket through `AT+CIPSTART`.
    Socket,
    /// The modem's HTTP client on bearer profile 1 (`AT+SAPBR`).
    Http,
}

/// An outbound message, ready for the command transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Bytes to push through the open socket.
    Payload(Vec<u8>),
    /// AT commands to run in order.
    Commands(Vec<AtCommand>),
}

/// A wire encoding of the chunk transfer contract.
///
/// Implementations are shared between the orchestrator, which builds requests, and
/// the stream demultiplexer, which recognises metadata in the inbound stream, so
/// they must be `Send + Sync`.
pub trait ChunkProtocol: Send + Sync {
    /// Data path this encoding runs over.
    fn bearer(&self) -> Bearer;

    /// Messages to send once after every successful connect.
    fn session_start(&self) -> Result<Vec<Request>, ProtocolError> {
        Ok(Vec::new())
    }

    /// Message to send on every keep-alive tick, if the encoding has one.
    fn keep_alive(&self) -> Option<Request> {
        None
    }

    /// Encode a version check.
    fn build_check_request(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<Request, ProtocolError>;

    /// Messages that prepare the server side for fetching `descriptor`'s image.
    fn begin_transfer(
        &self,
        _device_id: &str,
        _descriptor: &FirmwareDescriptor,
    ) -> Result<Vec<Request>, ProtocolError> {
        Ok(Vec::new())
    }

    /// Encode a request for `size` bytes at `offset`.
    fn build_chunk_request(
        &self,
        device_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<Request, ProtocolError>;

    /// Messages that release server-side state after a transfer, successful or not.
    fn end_transfer(&self) -> Vec<Request> {
        Vec::new()
    }

    /// The JSON object of a complete descriptor record in `bytes`, if there is one.
    fn descriptor_span<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]>;

    /// Decode a descriptor record.
    fn parse_descriptor(&self, bytes: &[u8]) -> Result<FirmwareDescriptor, ProtocolError> {
        let object = self.descriptor_span(bytes).ok_or_else(|| {
            ProtocolError::MalformedMetadata("no descriptor object found".into())
        })?;
        parse_descriptor_object(object)
    }

    /// Whether a complete line carries the chunk header marker.
    fn is_chunk_header(&self, line: &[u8]) -> bool;

    /// Decode a chunk header line.
    fn parse_chunk_header(&self, line: &[u8]) -> Result<ChunkHeader, ProtocolError>;

    /// The server's error message, if `bytes` is an explicit rejection.
    fn rejection(&self, bytes: &[u8]) -> Option<String> {
        json_object(bytes).and_then(parse_rejection)
    }
}

/// Tagged union of the supported wire encodings.
#[derive(Debug)]
pub enum WireEncoding {
    /// MQTT 3.1.1 publish/subscribe framing.
    Mqtt(MqttEncoding),
    /// Newline-delimited JSON over TCP.
    JsonLine(JsonLineEncoding),
    /// HTTP GET with ranged reads.
    HttpRange(HttpRangeEncoding),
}

impl WireEncoding {
    /// Short name used in logs and configuration.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Mqtt(_) => "mqtt",
            Self::JsonLine(_) => "json-line",
            Self::HttpRange(_) => "http-range",
        }
    }

    fn inner(&self) -> &dyn ChunkProtocol {
        match self {
            Self::Mqtt(e) => e,
            Self::JsonLine(e) => e,
            Self::HttpRange(e) => e,
        }
    }
}

impl ChunkProtocol for WireEncoding {
    fn bearer(&self) -> Bearer {
        self.inner().bearer()
    }

    fn session_start(&self) -> Result<Vec<Request>, ProtocolError> {
        self.inner().session_start()
    }

    fn keep_alive(&self) -> Option<Request> {
        self.inner().keep_alive()
    }

    fn build_check_request(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<Request, ProtocolError> {
        self.inner()
            .build_check_request(device_id, current_version)
    }

    fn begin_transfer(
        &self,
        device_id: &str,
        descriptor: &FirmwareDescriptor,
    ) -> Result<Vec<Request>, ProtocolError> {
        self.inner()
            .begin_transfer(device_id, descriptor)
    }

    fn build_chunk_request(
        &self,
        device_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<Request, ProtocolError> {
        self.inner()
            .build_chunk_request(device_id, offset, size)
    }

    fn end_transfer(&self) -> Vec<Request> {
        self.inner().end_transfer()
    }

    fn descriptor_span<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        self.inner().descriptor_span(bytes)
    }

    fn parse_descriptor(&self, bytes: &[u8]) -> Result<FirmwareDescriptor, ProtocolError> {
        self.inner().parse_descriptor(bytes)
    }

    fn is_chunk_header(&self, line: &[u8]) -> bool {
        self.inner().is_chunk_header(line)
    }

    fn parse_chunk_header(&self, line: &[u8]) -> Result<ChunkHeader, ProtocolError> {
        self.inner().parse_chunk_header(line)
    }

    fn rejection(&self, bytes: &[u8]) -> Option<String> {
        self.inner().rejection(bytes)
    }
}

// ---- JSON records shared by every encoding ----

/// Check request body.
#[derive(Debug, Serialize)]
pub(crate) struct CheckBody<'a> {
    pub device: &'a str,
    pub action: &'static str,
    pub version: &'a str,
}

/// Chunk request body.
#[derive(Debug, Serialize)]
pub(crate) struct DownloadBody<'a> {
    pub device: &'a str,
    pub action: &'static str,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Deserialize)]
struct DescriptorRecord {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default, alias = "url")]
    file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkHeaderRecord {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    offset: Option<u64>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    total: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    status: String,
    #[serde(default)]
    message: Option<String>,
}

fn malformed(e: &serde_json::Error) -> ProtocolError {
    ProtocolError::MalformedMetadata(e.to_string())
}

fn missing(field: &str) -> ProtocolError {
    ProtocolError::MalformedMetadata(format!("missing field `{field}`"))
}

fn check_status(status: Option<String>, message: Option<String>) -> Result<(), ProtocolError> {
    match status {
        Some(status) if status != "success" => Err(ProtocolError::Rejected(
            message.unwrap_or(status),
        )),
        _ => Ok(()),
    }
}

/// Whether `hex` is a 32-digit hex string.
pub fn is_valid_digest(hex: &str) -> bool {
    hex.len() == DIGEST_HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Decode a descriptor from a JSON object.
pub(crate) fn parse_descriptor_object(object: &[u8]) -> Result<FirmwareDescriptor, ProtocolError> {
    let record: DescriptorRecord = serde_json::from_slice(object).map_err(|e| malformed(&e))?;
    check_status(record.status, record.message)?;

    let version = record.version.ok_or_else(|| missing("version"))?;
    let total_size = record.size.ok_or_else(|| missing("size"))?;
    let content_hash = record.md5.ok_or_else(|| missing("md5"))?;

    if total_size == 0 {
        return Err(ProtocolError::MalformedMetadata("image size is zero".into()));
    }
    if !is_valid_digest(&content_hash) {
        return Err(ProtocolError::MalformedMetadata(format!(
            "digest {content_hash:?} is not {DIGEST_HEX_LEN} hex digits"
        )));
    }

    Ok(FirmwareDescriptor {
        display_name: record.name.unwrap_or_else(|| version.clone()),
        version,
        total_size,
        content_hash,
        source_locator: record.file.filter(|f| !f.is_empty()),
    })
}

/// Decode a chunk header from a JSON object.
pub(crate) fn parse_header_object(object: &[u8]) -> Result<ChunkHeader, ProtocolError> {
    let record: ChunkHeaderRecord = serde_json::from_slice(object).map_err(|e| malformed(&e))?;
    check_status(record.status, record.message)?;

    Ok(ChunkHeader {
        offset: record.offset.ok_or_else(|| missing("offset"))?,
        size: record.size.ok_or_else(|| missing("size"))?,
        total: record.total.ok_or_else(|| missing("total"))?,
    })
}

fn parse_rejection(object: &[u8]) -> Option<String> {
    let record: StatusRecord = serde_json::from_slice(object).ok()?;
    (record.status == "error").then(|| {
        record
            .message
            .unwrap_or_else(|| "unspecified error".into())
    })
}

/// The server's error message in the JSON object following `marker`.
pub(crate) fn parse_rejection_after(bytes: &[u8], marker: &[u8]) -> Option<String> {
    after(bytes, marker)
        .and_then(json_object)
        .and_then(parse_rejection)
}

/// Locate the first complete JSON object in `bytes`.
///
/// Braces inside string literals are skipped. Returns `None` while the object is
/// still open.
pub(crate) fn json_object(bytes: &[u8]) -> Option<&[u8]> {
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&bytes[start..=start + i]);
                }
            },
            _ => {},
        }
    }
    None
}

/// The bytes after the first occurrence of `needle`.
pub(crate) fn after<'a>(haystack: &'a [u8], needle: &[u8]) -> Option<&'a [u8]> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|at| &haystack[at + needle.len()..])
}

/// Whether `object` has a top-level-looking `"key"` entry.
pub(crate) fn has_key(object: &[u8], key: &str) -> bool {
    let quoted = format!("\"{key}\"");
    after(object, quoted.as_bytes()).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";

    #[test]
    fn test_chunk_requests_cover_image_exactly_once() {
        for (total, max_chunk) in [(1u64, 1024u64), (1024, 1024), (1025, 1024), (5000, 333), (7, 1)] {
            let mut committed = 0;
            let mut covered = Vec::new();
            while let Some(req) = ChunkRequest::next(committed, total, max_chunk) {
                assert_eq!(req.offset, committed);
                assert!(req.requested_size > 0 && req.requested_size <= max_chunk);
                assert!(req.offset + req.requested_size <= total);
                covered.push((req.offset, req.requested_size));
                committed += req.requested_size;
            }
            assert_eq!(committed, total);
            let sum: u64 = covered.iter().map(|(_, s)| s).sum();
            assert_eq!(sum, total);
        }
        assert_eq!(ChunkRequest::next(0, 100, 0), None);
        assert_eq!(ChunkRequest::next(100, 100, 10), None);
    }

    #[test]
    fn test_json_object_skips_braces_in_strings() {
        let bytes = br#"noise {"name":"fw {beta}","size":3} trailing"#;
        assert_eq!(json_object(bytes).unwrap(), br#"{"name":"fw {beta}","size":3}"#);
        assert_eq!(json_object(br#"{"a":"\"}"}"#).unwrap(), br#"{"a":"\"}"}"#);
        assert!(json_object(br#"{"open":1"#).is_none());
        assert!(json_object(b"no object").is_none());
    }

    #[test]
    fn test_parse_descriptor_object() {
        let json = format!(
            r#"{{"status":"success","version":"1.2.0","name":"app","size":4096,"md5":"{MD5}","file":"/fw/app.bin"}}"#
        );
        let desc = parse_descriptor_object(json.as_bytes()).unwrap();
        assert_eq!(desc.version, "1.2.0");
        assert_eq!(desc.display_name, "app");
        assert_eq!(desc.total_size, 4096);
        assert_eq!(desc.content_hash, MD5);
        assert_eq!(desc.source_locator.as_deref(), Some("/fw/app.bin"));
    }

    #[test]
    fn test_parse_descriptor_rejects_bad_records() {
        let missing_size = format!(r#"{{"version":"1.2.0","md5":"{MD5}"}}"#);
        assert!(matches!(
            parse_descriptor_object(missing_size.as_bytes()),
            Err(ProtocolError::MalformedMetadata(_))
        ));

        let bad_digest = r#"{"version":"1.2.0","size":10,"md5":"xyz"}"#;
        assert!(matches!(
            parse_descriptor_object(bad_digest.as_bytes()),
            Err(ProtocolError::MalformedMetadata(_))
        ));

        let string_size = format!(r#"{{"version":"1.2.0","size":"big","md5":"{MD5}"}}"#);
        assert!(matches!(
            parse_descriptor_object(string_size.as_bytes()),
            Err(ProtocolError::MalformedMetadata(_))
        ));

        let rejected = r#"{"status":"error","message":"Unknown device"}"#;
        assert_eq!(
            parse_descriptor_object(rejected.as_bytes()),
            Err(ProtocolError::Rejected("Unknown device".into()))
        );
    }

    #[test]
    fn test_parse_header_object() {
        let header =
            parse_header_object(br#"{"status":"success","offset":1024,"size":512,"total":1536,"position":1024}"#)
                .unwrap();
        assert_eq!(
            header,
            ChunkHeader {
                offset: 1024,
                size: 512,
                total: 1536,
            }
        );

        assert!(matches!(
            parse_header_object(br#"{"offset":"zero","size":512,"total":1536}"#),
            Err(ProtocolError::MalformedMetadata(_))
        ));
        assert_eq!(
            parse_header_object(br#"{"offset":0,"total":1536}"#),
            Err(ProtocolError::MalformedMetadata("missing field `size`".into()))
        );
    }

    #[test]
    fn test_rejection() {
        let enc = JsonLineEncoding;
        assert_eq!(
            enc.rejection(br#"{"status":"error","message":"Invalid offset"}"#),
            Some("Invalid offset".into())
        );
        assert_eq!(enc.rejection(br#"{"status":"success"}"#), None);
        assert_eq!(enc.rejection(b"OK"), None);
    }

    #[test]
    fn test_after_and_has_key() {
        assert_eq!(after(b"abc/topic{x}", b"/topic").unwrap(), b"{x}");
        assert!(after(b"abc", b"abcd").is_none());
        assert!(has_key(br#"{"offset":1}"#, "offset"));
        assert!(!has_key(br#"{"size":1}"#, "offset"));
    }

    #[test]
    fn test_is_valid_digest() {
        assert!(is_valid_digest(MD5));
        assert!(is_valid_digest(&MD5.to_uppercase()));
        assert!(!is_valid_digest(&MD5[1..]));
        assert!(!is_valid_digest("g".repeat(32).as_str()));
    }
}
