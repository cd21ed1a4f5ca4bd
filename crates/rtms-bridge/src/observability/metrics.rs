//! Metrics definitions for the RTMS bridge.
//!
//! All metrics follow Prometheus naming conventions:
//! - `rtms_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code, never by provider data:
//! - `event`: known webhook events plus `other`
//! - `channel`: `signaling`, `media`
//! - `outcome`: `success`, `rejected`, `error`
//! - `reason`: `CloseReason` labels
//!
//! Meeting and stream IDs are never used as labels.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record an inbound webhook event.
///
/// Metric: `rtms_webhook_events_total`
/// Labels: `event`
pub fn record_webhook_event(event: &str) {
    let event = normalize_event(event);
    counter!("rtms_webhook_events_total", "event" => event).increment(1);
}

/// Map webhook event names onto a fixed label set.
fn normalize_event(event: &str) -> &'static str {
    match event {
        "endpoint.url_validation" => "endpoint.url_validation",
        "meeting.rtms_started" | "stream.started" => "rtms_started",
        "meeting.rtms_stopped" | "stream.stopped" => "rtms_stopped",
        _ => "other",
    }
}

/// Record a handshake outcome.
///
/// Metric: `rtms_handshakes_total`
/// Labels: `channel`, `outcome`
pub fn record_handshake(channel: &'static str, outcome: &'static str) {
    counter!("rtms_handshakes_total",
        "channel" => channel,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a keepalive answered.
///
/// Metric: `rtms_keepalives_total`
/// Labels: `channel`
pub fn record_keepalive(channel: &'static str) {
    counter!("rtms_keepalives_total", "channel" => channel).increment(1);
}

/// Record a transcript delivery attempt.
///
/// Metric: `rtms_transcripts_forwarded_total`, `rtms_forward_duration_seconds`
/// Labels: `outcome`
pub fn record_transcript_forward(outcome: &'static str, duration: Duration) {
    histogram!("rtms_forward_duration_seconds", "outcome" => outcome)
        .record(duration.as_secs_f64());
    counter!("rtms_transcripts_forwarded_total", "outcome" => outcome).increment(1);
}

/// Record a raw media frame (binary or undecodable).
///
/// Metric: `rtms_raw_media_frames_total`, `rtms_raw_media_bytes_total`
pub fn record_raw_media_frame(len: usize) {
    counter!("rtms_raw_media_frames_total").increment(1);
    counter!("rtms_raw_media_bytes_total").increment(len as u64);
}

/// Record a channel reaching its terminal state.
///
/// Metric: `rtms_channel_closes_total`
/// Labels: `channel`, `reason`
pub fn record_channel_closed(channel: &'static str, reason: &'static str) {
    counter!("rtms_channel_closes_total",
        "channel" => channel,
        "reason" => reason
    )
    .increment(1);
}

/// Set the number of live stream sessions.
///
/// Metric: `rtms_sessions_active`
#[allow(clippy::cast_precision_loss)]
pub fn set_sessions_active(count: usize) {
    gauge!("rtms_sessions_active").set(count as f64);
}

/// Record a session task that ended by panicking.
///
/// Metric: `rtms_session_panics_total`
pub fn record_session_panic() {
    counter!("rtms_session_panics_total").increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_normalize_event() {
        assert_eq!(normalize_event("meeting.rtms_started"), "rtms_started");
        assert_eq!(normalize_event("stream.started"), "rtms_started");
        assert_eq!(normalize_event("meeting.rtms_stopped"), "rtms_stopped");
        assert_eq!(
            normalize_event("endpoint.url_validation"),
            "endpoint.url_validation"
        );
        assert_eq!(normalize_event("meeting.participant_joined"), "other");
    }

    #[test]
    fn test_recording_without_recorder_is_noop() {
        // No global recorder installed: every call must be harmless.
        record_webhook_event("meeting.rtms_started");
        record_handshake("signaling", "success");
        record_keepalive("media");
        record_transcript_forward("error", Duration::from_millis(3));
        record_raw_media_frame(1024);
        record_channel_closed("media", "remote_closed");
        set_sessions_active(2);
        record_session_panic();
    }

    #[test]
    fn test_metrics_are_recorded_with_expected_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_webhook_event("stream.stopped");
            record_handshake("media", "rejected");
            record_keepalive("signaling");
            record_transcript_forward("success", Duration::from_millis(12));
            record_raw_media_frame(100);
            record_raw_media_frame(28);
            record_channel_closed("signaling", "stopped");
            set_sessions_active(3);
        });

        let snapshot = snapshotter.snapshot().into_vec();

        let names: Vec<String> = snapshot
            .iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();

        for expected in [
            "rtms_webhook_events_total",
            "rtms_handshakes_total",
            "rtms_keepalives_total",
            "rtms_transcripts_forwarded_total",
            "rtms_forward_duration_seconds",
            "rtms_raw_media_frames_total",
            "rtms_raw_media_bytes_total",
            "rtms_channel_closes_total",
            "rtms_sessions_active",
        ] {
            assert!(
                names.iter().any(|n| n == expected),
                "missing metric {expected}, got {names:?}"
            );
        }

        let raw_bytes = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "rtms_raw_media_bytes_total")
            .map(|(_, _, _, value)| value.clone())
            .unwrap();
        assert_eq!(*raw_bytes, DebugValue::Counter(128));
    }
}
