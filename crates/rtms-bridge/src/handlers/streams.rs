//! Stream session status.
//!
//! `GET /api/v1/streams` reports the sessions the registry currently holds,
//! with their channel states and media counters. Read-only.

use crate::errors::BridgeError;
use crate::registry::RegistryStatus;
use crate::routes::AppState;
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::instrument;

/// Handler for GET /api/v1/streams
#[instrument(skip_all, name = "rtms.streams.list")]
pub async fn list_streams(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RegistryStatus>, BridgeError> {
    let status = state.registry.status().await?;
    Ok(Json(status))
}
