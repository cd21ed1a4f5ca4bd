//! RTMS bridge configuration.
//!
//! Configuration is loaded from environment variables. All sensitive
//! fields are redacted in Debug output.

use crate::protocol::MediaType;
use common::secret::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Default HTTP bind address for the webhook and operational endpoints.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:3000";

/// Default ingestion sink for forwarded transcripts.
pub const DEFAULT_INGESTION_URL: &str = "http://localhost:5000/ingest";

/// Default timeout for a single transcript POST.
pub const DEFAULT_FORWARD_TIMEOUT_SECONDS: u64 = 10;

/// Default bound on waiting for a torn-down session's tasks to exit.
pub const DEFAULT_TEARDOWN_TIMEOUT_SECONDS: u64 = 5;

/// RTMS bridge configuration.
///
/// Loaded from environment variables with sensible defaults.
/// The client secret and webhook token are redacted in Debug output.
#[derive(Clone)]
pub struct Config {
    /// Server bind address (default: "0.0.0.0:3000").
    pub bind_address: String,

    /// OAuth client ID, first component of every handshake signature.
    pub client_id: String,

    /// OAuth client secret, the HMAC key for handshake signatures.
    pub client_secret: SecretString,

    /// Webhook secret token used to answer endpoint validation challenges.
    pub webhook_secret_token: SecretString,

    /// Where transcript frames are POSTed.
    pub ingestion_url: String,

    /// Media types requested in the media handshake (default: transcript).
    pub media_type: MediaType,

    /// Timeout for a single transcript POST, in seconds.
    pub forward_timeout_seconds: u64,

    /// Upper bound on waiting for a session's channels to close, in seconds.
    pub teardown_timeout_seconds: u64,

    /// Drain period after a shutdown signal, in seconds (default: 0).
    pub drain_seconds: u64,
}

/// Custom Debug implementation that redacts sensitive fields.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("webhook_secret_token", &"[REDACTED]")
            .field("ingestion_url", &self.ingestion_url)
            .field("media_type", &self.media_type)
            .field("forward_timeout_seconds", &self.forward_timeout_seconds)
            .field("teardown_timeout_seconds", &self.teardown_timeout_seconds)
            .field("drain_seconds", &self.drain_seconds)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let client_id = required_non_empty(vars, "RTMS_CLIENT_ID")?;

        // An empty signing key would produce valid-looking but useless
        // signatures, so it is rejected here rather than per connection.
        let client_secret = SecretString::from(required_non_empty(vars, "RTMS_CLIENT_SECRET")?);

        let webhook_secret_token =
            SecretString::from(required_non_empty(vars, "RTMS_WEBHOOK_SECRET_TOKEN")?);

        let bind_address = vars
            .get("BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let ingestion_url = vars
            .get("RTMS_INGESTION_URL")
            .cloned()
            .unwrap_or_else(|| DEFAULT_INGESTION_URL.to_string());

        if !ingestion_url.starts_with("http://") && !ingestion_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(format!(
                "RTMS_INGESTION_URL must be an http(s) URL, got '{}'",
                ingestion_url
            )));
        }

        let media_type = match vars.get("RTMS_MEDIA_TYPE") {
            Some(value) => value.parse::<MediaType>().map_err(|e| {
                ConfigError::InvalidValue(format!("RTMS_MEDIA_TYPE: {}", e))
            })?,
            None => MediaType::Transcript,
        };

        let forward_timeout_seconds = positive_seconds(
            vars,
            "RTMS_FORWARD_TIMEOUT_SECONDS",
            DEFAULT_FORWARD_TIMEOUT_SECONDS,
        )?;

        let teardown_timeout_seconds = positive_seconds(
            vars,
            "RTMS_TEARDOWN_TIMEOUT_SECONDS",
            DEFAULT_TEARDOWN_TIMEOUT_SECONDS,
        )?;

        let drain_seconds = match vars.get("RTMS_DRAIN_SECONDS") {
            Some(value_str) => value_str.parse().map_err(|e| {
                ConfigError::InvalidValue(format!(
                    "RTMS_DRAIN_SECONDS must be a valid non-negative integer, got '{}': {}",
                    value_str, e
                ))
            })?,
            None => 0,
        };

        Ok(Config {
            bind_address,
            client_id,
            client_secret,
            webhook_secret_token,
            ingestion_url,
            media_type,
            forward_timeout_seconds,
            teardown_timeout_seconds,
            drain_seconds,
        })
    }

    /// Timeout for one transcript POST.
    pub fn forward_timeout(&self) -> Duration {
        Duration::from_secs(self.forward_timeout_seconds)
    }

    /// Bound on waiting for session teardown.
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_seconds)
    }

    /// Webhook secret token bytes, for challenge responses.
    pub fn webhook_secret_bytes(&self) -> &[u8] {
        self.webhook_secret_token.expose_secret().as_bytes()
    }
}

fn required_non_empty(vars: &HashMap<String, String>, name: &str) -> Result<String, ConfigError> {
    let value = vars
        .get(name)
        .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))?;

    if value.trim().is_empty() {
        return Err(ConfigError::InvalidValue(format!("{} must not be empty", name)));
    }

    Ok(value.clone())
}

fn positive_seconds(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value_str) = vars.get(name) else {
        return Ok(default);
    };

    let value: u64 = value_str.parse().map_err(|e| {
        ConfigError::InvalidValue(format!(
            "{} must be a valid positive integer, got '{}': {}",
            name, value_str, e
        ))
    })?;

    if value == 0 {
        return Err(ConfigError::InvalidValue(format!(
            "{} must be greater than 0",
            name
        )));
    }

    Ok(value)
}
