//! Webhook gateway.
//!
//! Implements `POST /webhook`, the single entry point for provider events:
//!
//! - `endpoint.url_validation` - answer the challenge with the encrypted token
//! - `meeting.rtms_started` / `stream.started` - start a stream session
//! - `meeting.rtms_stopped` / `stream.stopped` - stop a stream session
//!
//! Lifecycle and unknown events are always acknowledged with `200` and an
//! empty body. What happens to the session afterwards never changes the
//! response. Only a body that is not an event envelope is rejected.

use crate::errors::BridgeError;
use crate::observability::metrics;
use crate::routes::AppState;
use crate::signature::encrypt_plain_token;
use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use common::types::StreamKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub const EVENT_URL_VALIDATION: &str = "endpoint.url_validation";
pub const EVENT_RTMS_STARTED: &str = "meeting.rtms_started";
pub const EVENT_RTMS_STOPPED: &str = "meeting.rtms_stopped";
pub const EVENT_STREAM_STARTED: &str = "stream.started";
pub const EVENT_STREAM_STOPPED: &str = "stream.stopped";

/// Challenge answer for `endpoint.url_validation`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UrlValidationResponse {
    pub plain_token: String,
    pub encrypted_token: String,
}

#[derive(Debug, Deserialize)]
struct UrlValidationPayload {
    #[serde(rename = "plainToken")]
    plain_token: String,
}

#[derive(Debug, Deserialize)]
struct StreamStartedPayload {
    #[serde(alias = "meetingId")]
    meeting_uuid: String,
    #[serde(alias = "streamId")]
    rtms_stream_id: String,
    #[serde(alias = "signalingServerUrls")]
    server_urls: ServerUrls,
}

#[derive(Debug, Deserialize)]
struct StreamStoppedPayload {
    #[serde(alias = "meetingId")]
    meeting_uuid: String,
    #[serde(alias = "streamId")]
    rtms_stream_id: String,
}

/// Signaling URLs arrive either as one string or as a list.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ServerUrls {
    One(String),
    Many(Vec<String>),
}

impl ServerUrls {
    /// First non-empty URL.
    fn first(&self) -> Option<&str> {
        match self {
            ServerUrls::One(url) => Some(url.as_str()).filter(|u| !u.is_empty()),
            ServerUrls::Many(urls) => urls.iter().map(String::as_str).find(|u| !u.is_empty()),
        }
    }
}

/// Handler for POST /webhook
#[instrument(skip_all, name = "rtms.webhook.receive")]
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, BridgeError> {
    let (event, payload) = parse_envelope(&body)?;
    metrics::record_webhook_event(&event);

    debug!(target: "rtms.webhook", event = %event, "Webhook received");

    match event.as_str() {
        EVENT_URL_VALIDATION => Ok(url_validation(&state, payload)),
        EVENT_RTMS_STARTED | EVENT_STREAM_STARTED => {
            stream_started(&state, payload).await;
            Ok(StatusCode::OK.into_response())
        }
        EVENT_RTMS_STOPPED | EVENT_STREAM_STOPPED => {
            stream_stopped(&state, payload).await;
            Ok(StatusCode::OK.into_response())
        }
        other => {
            info!(target: "rtms.webhook", event = %other, "Ignoring unhandled webhook event");
            Ok(StatusCode::OK.into_response())
        }
    }
}

/// Split a request body into its event name and payload.
fn parse_envelope(body: &[u8]) -> Result<(String, Value), BridgeError> {
    let envelope: Value = serde_json::from_slice(body).map_err(|e| {
        warn!(target: "rtms.webhook", error = %e, "Webhook body is not JSON");
        BridgeError::BadRequest("Request body must be a JSON object".to_string())
    })?;

    let Value::Object(mut fields) = envelope else {
        return Err(BridgeError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };

    let event = match fields.remove("event") {
        Some(Value::String(event)) => event,
        _ => {
            warn!(target: "rtms.webhook", "Webhook body has no event name");
            return Err(BridgeError::BadRequest(
                "Missing or invalid 'event' field".to_string(),
            ));
        }
    };

    let payload = fields.remove("payload").unwrap_or(Value::Null);
    Ok((event, payload))
}

fn url_validation(state: &AppState, payload: Value) -> Response {
    let payload: UrlValidationPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(target: "rtms.webhook", error = %e, "URL validation without plainToken");
            return StatusCode::OK.into_response();
        }
    };

    let encrypted_token =
        encrypt_plain_token(state.config.webhook_secret_bytes(), &payload.plain_token);

    info!(target: "rtms.webhook", "Answered URL validation challenge");

    Json(UrlValidationResponse {
        plain_token: payload.plain_token,
        encrypted_token,
    })
    .into_response()
}

async fn stream_started(state: &AppState, payload: Value) {
    let payload: StreamStartedPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(target: "rtms.webhook", error = %e, "Undecodable stream start payload");
            return;
        }
    };

    let Some(signaling_url) = payload.server_urls.first() else {
        warn!(
            target: "rtms.webhook",
            meeting_id = %payload.meeting_uuid,
            stream_id = %payload.rtms_stream_id,
            "Stream start without a signaling URL"
        );
        return;
    };

    if payload.meeting_uuid.is_empty() || payload.rtms_stream_id.is_empty() {
        warn!(target: "rtms.webhook", "Stream start with empty meeting or stream id");
        return;
    }

    let key = StreamKey::new(payload.meeting_uuid, payload.rtms_stream_id);
    match state
        .registry
        .start_stream(key.clone(), signaling_url.to_string())
        .await
    {
        Ok(generation) => {
            info!(target: "rtms.webhook", stream = %key, generation, "Stream session started");
        }
        Err(e) => {
            warn!(target: "rtms.webhook", stream = %key, error = %e, "Stream session not started");
        }
    }
}

async fn stream_stopped(state: &AppState, payload: Value) {
    let payload: StreamStoppedPayload = match serde_json::from_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(target: "rtms.webhook", error = %e, "Undecodable stream stop payload");
            return;
        }
    };

    let key = StreamKey::new(payload.meeting_uuid, payload.rtms_stream_id);
    match state.registry.stop_stream(key.clone()).await {
        Ok(()) => {
            info!(target: "rtms.webhook", stream = %key, "Stream session stopped");
        }
        Err(BridgeError::SessionNotFound(_)) => {
            debug!(target: "rtms.webhook", stream = %key, "Stop for unknown stream");
        }
        Err(e) => {
            warn!(target: "rtms.webhook", stream = %key, error = %e, "Stream stop failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_envelope_extracts_event_and_payload() {
        let body = json!({"event": "meeting.rtms_started", "payload": {"a": 1}}).to_string();
        let (event, payload) = parse_envelope(body.as_bytes()).unwrap();
        assert_eq!(event, "meeting.rtms_started");
        assert_eq!(payload, json!({"a": 1}));
    }

    #[test]
    fn test_parse_envelope_missing_payload_is_null() {
        let (_, payload) = parse_envelope(br#"{"event":"x"}"#).unwrap();
        assert_eq!(payload, Value::Null);
    }

    #[test]
    fn test_parse_envelope_rejects_non_envelopes() {
        let bodies: [&[u8]; 5] = [
            b"not json",
            b"[1,2,3]",
            b"{}",
            br#"{"event": 5}"#,
            br#"{"payload": {}}"#,
        ];
        for body in bodies {
            assert!(matches!(
                parse_envelope(body),
                Err(BridgeError::BadRequest(_))
            ));
        }
    }

    #[test]
    fn test_server_urls_first_non_empty() {
        let many: ServerUrls = serde_json::from_value(json!(["", "wss://b", "wss://c"])).unwrap();
        assert_eq!(many.first(), Some("wss://b"));

        let one: ServerUrls = serde_json::from_value(json!("wss://a")).unwrap();
        assert_eq!(one.first(), Some("wss://a"));

        let empty: ServerUrls = serde_json::from_value(json!("")).unwrap();
        assert_eq!(empty.first(), None);

        let none: ServerUrls = serde_json::from_value(json!([])).unwrap();
        assert_eq!(none.first(), None);
    }

    #[test]
    fn test_started_payload_accepts_both_key_styles() {
        let snake: StreamStartedPayload = serde_json::from_value(json!({
            "meeting_uuid": "m1",
            "rtms_stream_id": "s1",
            "server_urls": "wss://sig"
        }))
        .unwrap();
        assert_eq!(snake.meeting_uuid, "m1");
        assert_eq!(snake.rtms_stream_id, "s1");

        let camel: StreamStartedPayload = serde_json::from_value(json!({
            "meetingId": "m2",
            "streamId": "s2",
            "signalingServerUrls": ["wss://sig"]
        }))
        .unwrap();
        assert_eq!(camel.meeting_uuid, "m2");
        assert_eq!(camel.rtms_stream_id, "s2");
        assert_eq!(camel.server_urls.first(), Some("wss://sig"));
    }

    #[test]
    fn test_validation_response_uses_camel_case() {
        let value = serde_json::to_value(UrlValidationResponse {
            plain_token: "p".to_string(),
            encrypted_token: "e".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"plainToken": "p", "encryptedToken": "e"}));
    }
}
