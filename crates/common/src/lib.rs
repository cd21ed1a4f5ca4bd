//! Common utilities and types shared across RTMS bridge components.

#![warn(clippy::pedantic)]

/// Module for stream identity types
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
