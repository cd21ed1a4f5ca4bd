//! Common data types for RTMS bridge components.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider-assigned meeting identifier.
///
/// Meeting UUIDs are opaque base64-ish strings (they may contain `/`, `+`
/// and `=`), so they are carried as strings rather than parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MeetingId(pub String);

impl MeetingId {
    /// Create a meeting ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MeetingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Provider-assigned media stream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(pub String);

impl StreamId {
    /// Create a stream ID from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one streaming session: the (meeting, stream) pair.
///
/// At most one live session exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamKey {
    pub meeting_id: MeetingId,
    pub stream_id: StreamId,
}

impl StreamKey {
    #[must_use]
    pub fn new(meeting_id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self {
            meeting_id: MeetingId::new(meeting_id),
            stream_id: StreamId::new(stream_id),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.meeting_id, self.stream_id)
    }
}
