//! HTTP request handlers for the RTMS bridge.

pub mod metrics;
pub mod streams;
pub mod webhook;

pub use metrics::metrics_handler;
pub use streams::list_streams;
pub use webhook::handle_webhook;
