//! Handshake signatures and webhook challenge responses.
//!
//! Both are HMAC-SHA256, lowercase hex:
//!
//! - **Handshake**: `HMAC-SHA256(client_secret, "{client_id},{meeting_id},{stream_id}")`
//! - **Challenge**: `HMAC-SHA256(webhook_secret_token, plain_token)`
//!
//! Neither function checks the key for emptiness; configuration loading
//! rejects empty secrets before a signer can be built.

use common::secret::{ExposeSecret, SecretString};
use common::types::StreamKey;
use ring::hmac;
use std::fmt;

/// Sign a (client, meeting, stream) triple.
///
/// Deterministic: identical inputs always produce the identical 64-character
/// hex string, and changing any component changes the output.
#[must_use]
pub fn sign(client_id: &str, meeting_id: &str, stream_id: &str, secret: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
    let message = format!("{},{},{}", client_id, meeting_id, stream_id);
    let tag = hmac::sign(&key, message.as_bytes());
    hex::encode(tag.as_ref())
}

/// Compute the `encryptedToken` for a webhook endpoint validation challenge.
#[must_use]
pub fn encrypt_plain_token(secret_token: &[u8], plain_token: &str) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret_token);
    let tag = hmac::sign(&key, plain_token.as_bytes());
    hex::encode(tag.as_ref())
}

/// Signs handshakes with the configured client identity.
///
/// Shared read-only by every channel of every session.
#[derive(Clone)]
pub struct StreamSigner {
    client_id: String,
    client_secret: SecretString,
}

impl StreamSigner {
    #[must_use]
    pub fn new(client_id: impl Into<String>, client_secret: SecretString) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
        }
    }

    /// Signature for the handshake of either channel of `key`'s session.
    #[must_use]
    pub fn sign_stream(&self, key: &StreamKey) -> String {
        sign(
            &self.client_id,
            key.meeting_id.as_str(),
            key.stream_id.as_str(),
            self.client_secret.expose_secret().as_bytes(),
        )
    }
}

impl fmt::Debug for StreamSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSigner")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .finish()
    }
}
