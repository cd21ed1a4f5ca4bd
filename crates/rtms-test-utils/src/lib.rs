//! # RTMS Test Utilities
//!
//! Shared test utilities for the RTMS bridge.
//!
//! This crate provides:
//! - Mock provider WebSocket server (`MockRtmsServer`)
//! - Server test harness (`TestBridgeServer` for E2E tests)
//! - Webhook and wire message fixtures
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rtms_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let provider = MockRtmsServer::start().await?;
//!     let bridge = TestBridgeServer::spawn("http://127.0.0.1:9/ingest").await?;
//!
//!     bridge
//!         .post_webhook(&fixtures::rtms_started_event("m1", "s1", &provider.url()))
//!         .await?;
//!
//!     let mut signaling = provider.next_connection().await?;
//!     let handshake = signaling.recv_json().await?;
//!     assert_eq!(handshake["msg_type"], 1);
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod mock_rtms;
pub mod server_harness;

// Re-export commonly used items
pub use fixtures::*;
pub use mock_rtms::*;
pub use server_harness::*;
