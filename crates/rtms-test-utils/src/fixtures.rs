//! Webhook events and provider wire messages for tests.

use serde_json::{json, Value};

pub const TEST_CLIENT_ID: &str = "test-client-id";
pub const TEST_CLIENT_SECRET: &str = "test-client-secret";
pub const TEST_WEBHOOK_SECRET: &str = "test-webhook-secret";

/// `endpoint.url_validation` envelope.
pub fn url_validation_event(plain_token: &str) -> Value {
    json!({
        "event": "endpoint.url_validation",
        "payload": {"plainToken": plain_token}
    })
}

/// `meeting.rtms_started` envelope in the provider's snake_case form.
pub fn rtms_started_event(meeting_uuid: &str, stream_id: &str, signaling_url: &str) -> Value {
    json!({
        "event": "meeting.rtms_started",
        "payload": {
            "meeting_uuid": meeting_uuid,
            "rtms_stream_id": stream_id,
            "server_urls": signaling_url
        }
    })
}

/// `stream.started` envelope with camelCase keys and a URL list.
pub fn stream_started_event(meeting_id: &str, stream_id: &str, signaling_urls: &[&str]) -> Value {
    json!({
        "event": "stream.started",
        "payload": {
            "meetingId": meeting_id,
            "streamId": stream_id,
            "signalingServerUrls": signaling_urls
        }
    })
}

/// `meeting.rtms_stopped` envelope.
pub fn rtms_stopped_event(meeting_uuid: &str, stream_id: &str) -> Value {
    json!({
        "event": "meeting.rtms_stopped",
        "payload": {
            "meeting_uuid": meeting_uuid,
            "rtms_stream_id": stream_id
        }
    })
}

/// Successful signaling handshake response offering one media URL for all
/// media types.
pub fn signaling_handshake_ack(media_url: &str) -> Value {
    json!({
        "msg_type": 2,
        "status_code": 0,
        "media_server": {"server_urls": {"all": media_url}}
    })
}

/// Signaling handshake response with a non-zero status.
pub fn signaling_handshake_rejected(status_code: i64) -> Value {
    json!({"msg_type": 2, "status_code": status_code})
}

pub fn media_handshake_ack() -> Value {
    json!({"msg_type": 4, "status_code": 0})
}

pub fn keepalive_request(timestamp: i64) -> Value {
    json!({"msg_type": 12, "timestamp": timestamp})
}

/// Transcript frame as the media server sends it.
pub fn transcript_frame(user_name: &str, text: &str) -> Value {
    json!({
        "msg_type": 17,
        "content": {
            "user_id": 16778240,
            "user_name": user_name,
            "data": text,
            "timestamp": 1_700_000_000_000_i64
        }
    })
}
