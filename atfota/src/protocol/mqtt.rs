//! MQTT 3.1.1 framing over the modem's TCP socket.
//!
//! Only the client-to-broker packets the update flow needs are built here:
//! CONNECT, SUBSCRIBE, PUBLISH (QoS 0) and PINGREQ. Inbound PUBLISH frames are not
//! decoded as MQTT; the demultiplexer finds the topic name in the byte stream and
//! reads the JSON that follows it, which is robust against broker packets
//! (CONNACK, SUBACK, PINGRESP) arriving glued to the data.
//!
//! Packet layout (fixed header, variable header, payload):
//!
//! ```text
//! +--------+------------------+-----------------+---------+
//! | type   | remaining length | variable header | payload |
//! | 1 byte | 1-4 bytes        |                 |         |
//! +--------+------------------+-----------------+---------+
//! ```

use byteorder::{BigEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::protocol::{
    Bearer, CheckBody, ChunkHeader, ChunkProtocol, DownloadBody, Request, after, json_object,
    parse_header_object, parse_rejection_after,
};

/// CONNECT packet type.
pub const CONNECT: u8 = 0x10;
/// PUBLISH packet type, QoS 0, no retain.
pub const PUBLISH: u8 = 0x30;
/// SUBSCRIBE packet type (reserved flags 0b0010).
pub const SUBSCRIBE: u8 = 0x82;
/// PINGREQ packet type.
pub const PINGREQ: u8 = 0xC0;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL: u8 = 4;
const CLEAN_SESSION: u8 = 0x02;
const MAX_REMAINING_LENGTH: usize = 268_435_455;
const SUBSCRIBE_PACKET_ID: u16 = 1;

/// Broker session settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    /// Client identifier sent in CONNECT.
    pub client_id: String,
    /// Topic that check and download requests are published to.
    pub request_topic: String,
    /// Topic the broker publishes descriptors on.
    pub info_topic: String,
    /// Topic the broker publishes chunks on.
    pub data_topic: String,
    /// Keep-alive announced in CONNECT, in seconds.
    pub keep_alive_secs: u16,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            client_id: "atfota".into(),
            request_topic: "device/firmware/request".into(),
            info_topic: "device/firmware/info".into(),
            data_topic: "device/firmware/data".into(),
            keep_alive_secs: 60,
        }
    }
}

/// Append an MQTT variable-length integer.
pub fn encode_remaining_length(mut len: usize, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::MalformedMetadata(format!(
            "MQTT packet too large: {len} bytes"
        )));
    }
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), ProtocolError> {
    let len = u16::try_from(s.len())
        .map_err(|_| ProtocolError::MalformedMetadata(format!("MQTT string too long: {s:.32}")))?;
    out.write_u16::<BigEndian>(len).unwrap();
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

fn packet(packet_type: u8, body: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::with_capacity(body.len() + 5);
    out.push(packet_type);
    encode_remaining_length(body.len(), &mut out)?;
    out.extend_from_slice(body);
    Ok(out)
}

/// Build a CONNECT packet with a clean session and no credentials.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn connect(client_id: &str, keep_alive_secs: u16) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(12 + client_id.len());
    put_str(&mut body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);
    body.push(CLEAN_SESSION);
    body.write_u16::<BigEndian>(keep_alive_secs).unwrap();
    put_str(&mut body, client_id)?;
    packet(CONNECT, &body)
}

/// Build a SUBSCRIBE packet requesting QoS 0 for every topic.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn subscribe(packet_id: u16, topics: &[&str]) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::new();
    body.write_u16::<BigEndian>(packet_id).unwrap();
    for topic in topics {
        put_str(&mut body, topic)?;
        body.push(0);
    }
    packet(SUBSCRIBE, &body)
}

/// Build a QoS 0 PUBLISH packet.
pub fn publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    put_str(&mut body, topic)?;
    body.extend_from_slice(payload);
    packet(PUBLISH, &body)
}

/// Build a PINGREQ packet.
pub fn pingreq() -> Vec<u8> {
    vec![PINGREQ, 0x00]
}

/// Publish/subscribe encoding of the transfer contract.
#[derive(Debug, Clone, Default)]
pub struct MqttEncoding {
    settings: MqttSettings,
}

impl MqttEncoding {
    /// Create an encoding with the given broker settings.
    pub fn new(settings: MqttSettings) -> Self {
        Self { settings }
    }

    /// Broker settings in use.
    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn request(&self, body: &impl Serialize) -> Result<Request, ProtocolError> {
        let json = serde_json::to_vec(body)
            .map_err(|e| ProtocolError::MalformedMetadata(e.to_string()))?;
        Ok(Request::Payload(publish(&self.settings.request_topic, &json)?))
    }
}

impl ChunkProtocol for MqttEncoding {
    fn bearer(&self) -> Bearer {
        Bearer::Socket
    }

    fn session_start(&self) -> Result<Vec<Request>, ProtocolError> {
        let s = &self.settings;
        Ok(vec![
            Request::Payload(connect(&s.client_id, s.keep_alive_secs)?),
            Request::Payload(subscribe(SUBSCRIBE_PACKET_ID, &[
                s.info_topic.as_str(),
                s.data_topic.as_str(),
            ])?),
        ])
    }

    fn keep_alive(&self) -> Option<Request> {
        Some(Request::Payload(pingreq()))
    }

    fn build_check_request(
        &self,
        device_id: &str,
        current_version: &str,
    ) -> Result<Request, ProtocolError> {
        self.request(&CheckBody {
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
        self.request(&DownloadBody {
            device: device_id,
            action: "download",
            offset,
            size,
        })
    }

    fn descriptor_span<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        after(bytes, self.settings.info_topic.as_bytes()).and_then(json_object)
    }

    fn is_chunk_header(&self, line: &[u8]) -> bool {
        after(line, self.settings.data_topic.as_bytes()).is_some()
    }

    fn parse_chunk_header(&self, line: &[u8]) -> Result<ChunkHeader, ProtocolError> {
        let object = after(line, self.settings.data_topic.as_bytes())
            .and_then(json_object)
            .ok_or_else(|| {
                ProtocolError::MalformedMetadata("data publish without JSON header".into())
            })?;
        parse_header_object(object)
    }

    fn rejection(&self, bytes: &[u8]) -> Option<String> {
        let s = &self.settings;
        parse_rejection_after(bytes, s.info_topic.as_bytes())
            .or_else(|| parse_rejection_after(bytes, s.data_topic.as_bytes()))
    }
}
