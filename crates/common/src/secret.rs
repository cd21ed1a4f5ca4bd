//! Secret types for protecting sensitive values from accidental logging.
//!
//! Re-exports from the [`secrecy`] crate. The RTMS client secret and the
//! webhook secret token are both held as [`SecretString`] so that any struct
//! deriving `Debug` around them stays safe to log.
//!
//! # Example
//!
//! ```rust
//! use common::secret::SecretString;
//! use common::secret::ExposeSecret;
//!
//! #[derive(Debug)]
//! struct Credentials {
//!     client_id: String,
//!     client_secret: SecretString,
//! }
//!
//! let creds = Credentials {
//!     client_id: "client-123".to_string(),
//!     client_secret: SecretString::from("s3cr3t"),
//! };
//!
//! // Safe: client_secret is redacted
//! println!("{:?}", creds);
//!
//! // Signing code has to ask for the value explicitly
//! let key: &str = creds.client_secret.expose_secret();
//! ```
//!
//! # Usage
//!
//! Use `SecretString` for:
//! - OAuth client secrets used for handshake signatures
//! - Webhook verification tokens

pub use secrecy::{ExposeSecret, SecretString};
