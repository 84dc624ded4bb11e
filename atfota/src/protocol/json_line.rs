//! Newline-delimited JSON over a raw TCP socket.
//!
//! Requests are single JSON objects terminated by `\n`. A chunk response is a
//! header object, `\n`, then exactly `size` raw bytes:
//!
//! ```text
//! {"status":"success","offset":0,"size":1024,"total":81920,"position":0}\n<1024 bytes>
//! ```

use serde::Serialize;

use crate::error::ProtocolError;
use crate::protocol::{
    Bearer, CheckBody, ChunkHeader, ChunkProtocol, DownloadBody, Request, has_key, json_object,
    parse_header_object,
};

/// JSON-line encoding. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLineEncoding;

fn line(body: &impl Serialize) -> Result<Request, ProtocolError> {
    let mut bytes =
        serde_json::to_vec(body).map_err(|e| ProtocolError::MalformedMetadata(e.to_string()))?;
    bytes.push(b'\n');
    Ok(Request::Payload(bytes))
}

impl ChunkProtocol for JsonLineEncoding {
    fn bearer(&self) -> Bearer {
        Bearer::Socket
    }

    fn build_check_request(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<Request, ProtocolError> {
        line(&CheckBody {
            device: device_id,
            action: "check",
            version: current_version,
        })
    }

    fn build_chunk_request(
        &self,
        device_id: &str,
        offset: u64,
        size: u64,
    ) -> Result<Request, ProtocolError> {
        line(&DownloadBody {
            device: device_id,
            action: "download",
            offset,
            size,
        })
    }

    fn descriptor_span<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        json_object(bytes).filter(|object| has_key(object, "version"))
    }

    fn is_chunk_header(&self, line: &[u8]) -> bool {
        json_object(line).is_some_and(|object| has_key(object, "offset"))
    }

    fn parse_chunk_header(&self, line: &[u8]) -> Result<ChunkHeader, ProtocolError> {
        let object = json_object(line).ok_or_else(|| {
            ProtocolError::MalformedMetadata("chunk header is not a JSON object".into())
        })?;
        parse_header_object(object)
    }
}
