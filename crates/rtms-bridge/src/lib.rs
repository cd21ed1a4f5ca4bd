//! RTMS Bridge Library
//!
//! Bridges a real-time meeting media streaming provider to an HTTP
//! ingestion sink:
//!
//! - Answers the provider's webhook URL validation challenge
//! - Opens a signed signaling WebSocket per started stream
//! - Opens the media WebSocket the signaling handshake points at
//! - Forwards every transcript frame to the ingestion sink, best effort
//!
//! # Architecture
//!
//! ```text
//! routes/mod.rs -> handlers/webhook.rs -> registry.rs (actor)
//!                                           -> channels/signaling.rs (actor per stream)
//!                                                -> channels/media.rs (actor per stream)
//!                                                     -> forwarder.rs
//! ```
//!
//! # Modules
//!
//! - `config` - Service configuration from environment
//! - `errors` - Error types with HTTP status code mapping
//! - `signature` - Handshake signatures and webhook challenge answers
//! - `protocol` - Provider wire messages
//! - `transport` - WebSocket transport abstraction
//! - `channels` - Signaling and media channel state machines
//! - `forwarder` - Transcript delivery to the ingestion sink
//! - `registry` - Live stream sessions keyed by (meeting, stream)
//! - `handlers` / `routes` - Axum HTTP surface
//! - `observability` - Metrics and health endpoints

pub mod channels;
pub mod config;
pub mod errors;
pub mod forwarder;
pub mod handlers;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod routes;
pub mod signature;
pub mod transport;
