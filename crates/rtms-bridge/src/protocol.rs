//! RTMS wire protocol.
//!
//! Every control frame on both sockets is a JSON object carrying an
//! integer `msg_type`. The provider may send it as a text or a binary
//! WebSocket frame, so both are decoded the same way. This module owns the message-type constants, the
//! outbound encoders, the inbound control decoder and the media frame
//! classifier. It does no I/O.

use crate::errors::BridgeError;
use crate::transport::Frame;
use common::types::StreamKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Message type discriminators.
pub mod msg_type {
    pub const SIGNALING_HANDSHAKE_REQ: i64 = 1;
    pub const SIGNALING_HANDSHAKE_RESP: i64 = 2;
    pub const MEDIA_HANDSHAKE_REQ: i64 = 3;
    pub const MEDIA_HANDSHAKE_RESP: i64 = 4;
    pub const CLIENT_READY_ACK: i64 = 7;
    pub const STREAM_STATE_UPDATE: i64 = 8;
    pub const KEEP_ALIVE_REQ: i64 = 12;
    pub const KEEP_ALIVE_RESP: i64 = 13;
    pub const TRANSCRIPT: i64 = 17;
}

pub const PROTOCOL_VERSION: u32 = 1;

/// `status_code` value meaning success.
pub const STATUS_OK: i64 = 0;

/// Largest handshake sequence number (exclusive).
pub const SEQUENCE_RANGE: u32 = 1_000_000_000;

/// Media types a client can subscribe to on the media socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Audio,
    Video,
    Transcript,
    All,
}

impl MediaType {
    /// Bitmask sent as `media_type` in the media handshake.
    #[must_use]
    pub fn mask(self) -> u32 {
        match self {
            MediaType::Audio => 1,
            MediaType::Video => 2,
            MediaType::Transcript => 8,
            MediaType::All => 32,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
            MediaType::Transcript => "transcript",
            MediaType::All => "all",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown media type '{0}' (expected audio, video, transcript or all)")]
pub struct UnknownMediaType(pub String);

impl FromStr for MediaType {
    type Err = UnknownMediaType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "audio" => Ok(MediaType::Audio),
            "video" => Ok(MediaType::Video),
            "transcript" => Ok(MediaType::Transcript),
            "all" => Ok(MediaType::All),
            _ => Err(UnknownMediaType(s.to_string())),
        }
    }
}

/// Media server addresses offered in a signaling handshake ack.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MediaServerUrls {
    #[serde(default)]
    pub audio: Option<String>,
    #[serde(default)]
    pub video: Option<String>,
    #[serde(default)]
    pub transcript: Option<String>,
    #[serde(default)]
    pub all: Option<String>,
}

impl MediaServerUrls {
    /// Pick the media URL for `media_type`: `all` first, then the
    /// type-specific address. Empty strings count as absent.
    #[must_use]
    pub fn select(&self, media_type: MediaType) -> Option<&str> {
        let specific = match media_type {
            MediaType::Audio => self.audio.as_deref(),
            MediaType::Video => self.video.as_deref(),
            MediaType::Transcript => self.transcript.as_deref(),
            MediaType::All => None,
        };

        [self.all.as_deref(), specific]
            .into_iter()
            .flatten()
            .find(|url| !url.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SignalingHandshakeRequest {
    pub msg_type: i64,
    pub protocol_version: u32,
    pub meeting_uuid: String,
    pub rtms_stream_id: String,
    pub sequence: u32,
    pub signature: String,
}

impl SignalingHandshakeRequest {
    #[must_use]
    pub fn new(key: &StreamKey, signature: String, sequence: u32) -> Self {
        Self {
            msg_type: msg_type::SIGNALING_HANDSHAKE_REQ,
            protocol_version: PROTOCOL_VERSION,
            meeting_uuid: key.meeting_id.to_string(),
            rtms_stream_id: key.stream_id.to_string(),
            sequence,
            signature,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaHandshakeRequest {
    pub msg_type: i64,
    pub protocol_version: u32,
    pub meeting_uuid: String,
    pub rtms_stream_id: String,
    pub signature: String,
    pub media_type: u32,
    pub payload_encryption: bool,
}

impl MediaHandshakeRequest {
    #[must_use]
    pub fn new(key: &StreamKey, signature: String, media_type: MediaType) -> Self {
        Self {
            msg_type: msg_type::MEDIA_HANDSHAKE_REQ,
            protocol_version: PROTOCOL_VERSION,
            meeting_uuid: key.meeting_id.to_string(),
            rtms_stream_id: key.stream_id.to_string(),
            signature,
            media_type: media_type.mask(),
            payload_encryption: false,
        }
    }
}

/// Keepalive answer. The timestamp is echoed exactly as received; a request
/// without one gets an answer without one.
#[derive(Debug, Clone, Serialize)]
pub struct KeepAliveResponse {
    pub msg_type: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
}

impl KeepAliveResponse {
    #[must_use]
    pub fn echo(timestamp: Option<Value>) -> Self {
        Self {
            msg_type: msg_type::KEEP_ALIVE_RESP,
            timestamp,
        }
    }
}

/// Sent on the signaling socket once the media handshake succeeded.
#[derive(Debug, Clone, Serialize)]
pub struct ClientReadyAck {
    pub msg_type: i64,
    pub rtms_stream_id: String,
}

impl ClientReadyAck {
    #[must_use]
    pub fn new(key: &StreamKey) -> Self {
        Self {
            msg_type: msg_type::CLIENT_READY_ACK,
            rtms_stream_id: key.stream_id.to_string(),
        }
    }
}

/// Serialize an outbound message to frame text.
pub fn encode<T: Serialize>(message: &T) -> Result<String, BridgeError> {
    Ok(serde_json::to_string(message)?)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Decoded inbound control frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    HandshakeAck {
        status_code: i64,
        media_server: Option<MediaServerUrls>,
    },
    MediaHandshakeAck {
        status_code: i64,
    },
    KeepAliveRequest {
        timestamp: Option<Value>,
    },
    KeepAliveResponse {
        timestamp: Option<Value>,
    },
    StreamStateUpdate {
        state: Option<i64>,
        reason: Option<i64>,
    },
    Transcript,
    Unknown {
        msg_type: i64,
    },
}

impl ControlMessage {
    /// Short name for logs and metric labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::HandshakeAck { .. } => "handshake_ack",
            ControlMessage::MediaHandshakeAck { .. } => "media_handshake_ack",
            ControlMessage::KeepAliveRequest { .. } => "keepalive_request",
            ControlMessage::KeepAliveResponse { .. } => "keepalive_response",
            ControlMessage::StreamStateUpdate { .. } => "stream_state_update",
            ControlMessage::Transcript => "transcript",
            ControlMessage::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Deserialize)]
struct HandshakeAckWire {
    status_code: i64,
    #[serde(default)]
    media_server: Option<MediaServerWire>,
}

#[derive(Deserialize)]
struct MediaServerWire {
    #[serde(default)]
    server_urls: Option<MediaServerUrls>,
}

#[derive(Deserialize)]
struct StatusWire {
    status_code: i64,
}

#[derive(Deserialize)]
struct StateUpdateWire {
    #[serde(default)]
    state: Option<i64>,
    #[serde(default)]
    reason: Option<i64>,
}

/// Decode a control frame.
///
/// Fails when the text is not a JSON object with an integer `msg_type`, or
/// when a known message type is missing a required field.
pub fn decode_control(text: &str) -> Result<ControlMessage, BridgeError> {
    let value: Value = serde_json::from_str(text)?;

    let msg_type = value
        .as_object()
        .ok_or_else(|| BridgeError::Protocol("frame is not a JSON object".to_string()))?
        .get("msg_type")
        .and_then(Value::as_i64)
        .ok_or_else(|| BridgeError::Protocol("frame has no integer msg_type".to_string()))?;

    let message = match msg_type {
        msg_type::SIGNALING_HANDSHAKE_RESP => {
            let wire: HandshakeAckWire = serde_json::from_value(value)?;
            ControlMessage::HandshakeAck {
                status_code: wire.status_code,
                media_server: wire.media_server.and_then(|server| server.server_urls),
            }
        }
        msg_type::MEDIA_HANDSHAKE_RESP => {
            let wire: StatusWire = serde_json::from_value(value)?;
            ControlMessage::MediaHandshakeAck {
                status_code: wire.status_code,
            }
        }
        msg_type::KEEP_ALIVE_REQ => ControlMessage::KeepAliveRequest {
            timestamp: value.get("timestamp").cloned(),
        },
        msg_type::KEEP_ALIVE_RESP => ControlMessage::KeepAliveResponse {
            timestamp: value.get("timestamp").cloned(),
        },
        msg_type::STREAM_STATE_UPDATE => {
            let wire: StateUpdateWire = serde_json::from_value(value)?;
            ControlMessage::StreamStateUpdate {
                state: wire.state,
                reason: wire.reason,
            }
        }
        msg_type::TRANSCRIPT => ControlMessage::Transcript,
        other => ControlMessage::Unknown { msg_type: other },
    };

    Ok(message)
}

/// Frame payload as text, whatever the opcode.
///
/// Returns the payload length when a binary frame is not UTF-8.
pub fn frame_text(frame: Frame) -> Result<String, usize> {
    match frame {
        Frame::Text(text) => Ok(text),
        Frame::Binary(bytes) => {
            let len = bytes.len();
            String::from_utf8(bytes.to_vec()).map_err(|_| len)
        }
    }
}

/// What a media-socket frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaFrame {
    /// A control message other than a transcript.
    Control(ControlMessage),
    /// Transcript frame text exactly as received.
    Transcript(String),
    /// Frame that fails structured decoding. Only its size is kept.
    Raw { len: usize },
}

/// Classify a frame received on the media socket.
#[must_use]
pub fn classify_media_frame(frame: Frame) -> MediaFrame {
    let text = match frame_text(frame) {
        Ok(text) => text,
        Err(len) => return MediaFrame::Raw { len },
    };

    match decode_control(&text) {
        Ok(ControlMessage::Transcript) => MediaFrame::Transcript(text),
        Ok(control) => MediaFrame::Control(control),
        Err(_) => MediaFrame::Raw { len: text.len() },
    }
}
