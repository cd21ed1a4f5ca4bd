//! Per-stream WebSocket channels.
//!
//! A stream session is two actors: a [`SignalingChannel`] owning the
//! signaling socket, and a [`MediaChannel`] it spawns once the provider has
//! accepted the signaling handshake and named a media server. Each actor
//! publishes its state through a `watch` channel and handles its inputs one
//! at a time through a single dispatch function.
//!
//! # Lifecycle
//!
//! 1. The registry spawns the signaling actor with a fresh cancellation token
//! 2. Signaling spawns media with a child token, so media never outlives it
//! 3. Media may close on its own; signaling stays up
//! 4. When signaling closes it tears media down and reports to the registry

pub mod media;
pub mod signaling;

pub use media::{MediaChannel, MediaChannelHandle, MediaState, MediaStatsSnapshot};
pub use signaling::{SignalingChannel, SignalingChannelHandle, SignalingState};

use crate::errors::BridgeError;
use crate::forwarder::TranscriptForwarder;
use crate::protocol::MediaType;
use crate::signature::StreamSigner;
use crate::transport::TransportFactory;
use common::types::StreamKey;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Channel names, as used in logs and metric labels.
pub const SIGNALING: &str = "signaling";
pub const MEDIA: &str = "media";

/// Why a channel reached its terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CloseReason {
    /// The provider answered the handshake with a non-zero status.
    HandshakeRejected { status_code: i64 },
    /// Signaling handshake succeeded but offered no usable media URL.
    NoMediaServer,
    /// The socket could not be opened.
    ConnectFailed { error: String },
    /// A send on the socket failed.
    TransportError { error: String },
    /// The provider closed the socket or the read side ended.
    RemoteClosed,
    /// Stopped by the registry, a stop event, or process shutdown.
    Stopped,
}

impl CloseReason {
    /// Bounded label for metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            CloseReason::HandshakeRejected { .. } => "handshake_rejected",
            CloseReason::NoMediaServer => "no_media_server",
            CloseReason::ConnectFailed { .. } => "connect_failed",
            CloseReason::TransportError { .. } => "transport_error",
            CloseReason::RemoteClosed => "remote_closed",
            CloseReason::Stopped => "stopped",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::HandshakeRejected { status_code } => {
                write!(f, "handshake rejected with status {status_code}")
            }
            CloseReason::NoMediaServer => f.write_str("no media server offered"),
            CloseReason::ConnectFailed { error } => write!(f, "connect failed: {error}"),
            CloseReason::TransportError { error } => write!(f, "transport error: {error}"),
            CloseReason::RemoteClosed => f.write_str("closed by remote"),
            CloseReason::Stopped => f.write_str("stopped"),
        }
    }
}

/// Everything a session's channels share. Read-only after startup.
#[derive(Clone)]
pub struct ChannelContext {
    pub signer: Arc<StreamSigner>,
    pub media_type: MediaType,
    pub transports: Arc<dyn TransportFactory>,
    pub forwarder: TranscriptForwarder,
    /// Bound on tearing down one session. Signaling spends at most three
    /// quarters of it waiting on media and closing its own socket.
    pub teardown_timeout: Duration,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("signer", &self.signer)
            .field("media_type", &self.media_type)
            .field("forwarder", &self.forwarder)
            .field("teardown_timeout", &self.teardown_timeout)
            .finish_non_exhaustive()
    }
}

/// Permission to open a media channel.
///
/// Only a signaling channel in `Ready` can mint one, which is what ties
/// every media socket to a successful signaling handshake.
#[derive(Debug)]
pub struct MediaGrant {
    key: StreamKey,
    media_url: String,
}

impl MediaGrant {
    /// Mint a grant for `key` from the signaling state it is issued in.
    pub(crate) fn issue(
        state: &SignalingState,
        key: &StreamKey,
        media_url: &str,
    ) -> Result<Self, BridgeError> {
        if *state != SignalingState::Ready {
            return Err(BridgeError::ContractViolation(format!(
                "media grant requested for {key} while signaling is {}",
                state.label()
            )));
        }

        Ok(Self {
            key: key.clone(),
            media_url: media_url.to_string(),
        })
    }

    #[must_use]
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub fn media_url(&self) -> &str {
        &self.media_url
    }
}

/// Sent to the registry when a session's signaling channel has closed.
#[derive(Debug, Clone)]
pub struct SessionEnded {
    pub key: StreamKey,
    pub generation: u64,
    pub reason: CloseReason,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_only_from_ready() {
        let key = StreamKey::new("m1", "s1");

        let grant = MediaGrant::issue(&SignalingState::Ready, &key, "wss://media").unwrap();
        assert_eq!(grant.key(), &key);
        assert_eq!(grant.media_url(), "wss://media");

        for state in [
            SignalingState::Connecting,
            SignalingState::HandshakeSent,
            SignalingState::Closed {
                reason: CloseReason::Stopped,
            },
        ] {
            let result = MediaGrant::issue(&state, &key, "wss://media");
            assert!(matches!(result, Err(BridgeError::ContractViolation(_))));
        }
    }

    #[test]
    fn test_close_reason_labels_and_display() {
        let rejected = CloseReason::HandshakeRejected { status_code: 3 };
        assert_eq!(rejected.label(), "handshake_rejected");
        assert_eq!(rejected.to_string(), "handshake rejected with status 3");
        assert_eq!(CloseReason::RemoteClosed.label(), "remote_closed");
        assert_eq!(
            CloseReason::ConnectFailed {
                error: "refused".to_string()
            }
            .to_string(),
            "connect failed: refused"
        );
    }

    #[test]
    fn test_close_reason_serializes_tagged() {
        let value = serde_json::to_value(CloseReason::HandshakeRejected { status_code: 7 }).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"kind": "handshake_rejected", "status_code": 7})
        );
    }
}
