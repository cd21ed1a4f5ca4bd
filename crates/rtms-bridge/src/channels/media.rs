//! `MediaChannel` - per-stream media socket actor.
//!
//! States: `Connecting -> HandshakeSent -> Active -> Closed{reason}`.
//!
//! Spawned only by a `Ready` signaling channel through a [`MediaGrant`].
//! Its cancellation token is a child of the signaling token. Transcript
//! frames go to the forwarder without waiting on delivery; frames that do
//! not decode are counted and dropped.

use super::signaling::SignalingCommand;
use super::{ChannelContext, CloseReason, MediaGrant, MEDIA};
use crate::observability::metrics;
use crate::protocol::{
    self, classify_media_frame, ControlMessage, KeepAliveResponse, MediaFrame,
    MediaHandshakeRequest, STATUS_OK,
};
use crate::transport::{Transport, TransportEvent};
use common::types::StreamKey;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Media channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MediaState {
    Connecting,
    HandshakeSent,
    Active,
    Closed { reason: CloseReason },
}

impl MediaState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            MediaState::Connecting => "connecting",
            MediaState::HandshakeSent => "handshake_sent",
            MediaState::Active => "active",
            MediaState::Closed { .. } => "closed",
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, MediaState::Closed { .. })
    }
}

/// Frame counters for one media channel.
#[derive(Debug, Default)]
pub struct MediaStats {
    transcripts: AtomicU64,
    raw_frames: AtomicU64,
    raw_bytes: AtomicU64,
    keepalives: AtomicU64,
}

impl MediaStats {
    fn record_transcript(&self) {
        self.transcripts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_raw(&self, len: usize) {
        self.raw_frames.fetch_add(1, Ordering::Relaxed);
        self.raw_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    fn record_keepalive(&self) {
        self.keepalives.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> MediaStatsSnapshot {
        MediaStatsSnapshot {
            transcripts: self.transcripts.load(Ordering::Relaxed),
            raw_frames: self.raw_frames.load(Ordering::Relaxed),
            raw_bytes: self.raw_bytes.load(Ordering::Relaxed),
            keepalives: self.keepalives.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`MediaStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MediaStatsSnapshot {
    /// Transcript frames handed to the forwarder.
    pub transcripts: u64,
    pub raw_frames: u64,
    pub raw_bytes: u64,
    pub keepalives: u64,
}

/// Handle to a `MediaChannel`.
#[derive(Clone, Debug)]
pub struct MediaChannelHandle {
    key: StreamKey,
    cancel_token: CancellationToken,
    state: watch::Receiver<MediaState>,
    stats: Arc<MediaStats>,
}

impl MediaChannelHandle {
    #[must_use]
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    #[must_use]
    pub fn state(&self) -> MediaState {
        self.state.borrow().clone()
    }

    #[must_use]
    pub fn stats(&self) -> MediaStatsSnapshot {
        self.stats.snapshot()
    }

    /// Close the media socket. Signaling stays up.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Wait until the channel is closed and return why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let result = state.wait_for(MediaState::is_closed).await;
        match result.as_deref() {
            Ok(MediaState::Closed { reason }) => reason.clone(),
            _ => CloseReason::Stopped,
        }
    }
}

/// The `MediaChannel` actor.
pub struct MediaChannel {
    key: StreamKey,
    media_url: String,
    ctx: ChannelContext,
    cancel_token: CancellationToken,
    state: watch::Sender<MediaState>,
    stats: Arc<MediaStats>,
    signaling: mpsc::Sender<SignalingCommand>,
    transport: Option<Arc<dyn Transport>>,
}

impl MediaChannel {
    /// Spawn the media channel a grant allows.
    ///
    /// `cancel_token` must be a child of the signaling channel's token.
    pub(crate) fn spawn(
        grant: MediaGrant,
        ctx: ChannelContext,
        cancel_token: CancellationToken,
        signaling: mpsc::Sender<SignalingCommand>,
    ) -> (MediaChannelHandle, JoinHandle<()>) {
        let (state_tx, state_rx) = watch::channel(MediaState::Connecting);
        let stats = Arc::new(MediaStats::default());
        let MediaGrant { key, media_url } = grant;

        let actor = Self {
            key: key.clone(),
            media_url,
            ctx,
            cancel_token: cancel_token.clone(),
            state: state_tx,
            stats: Arc::clone(&stats),
            signaling,
            transport: None,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MediaChannelHandle {
            key,
            cancel_token,
            state: state_rx,
            stats,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "rtms.channel.media", fields(stream = %self.key))]
    async fn run(mut self) {
        debug!(
            target: "rtms.channel.media",
            stream = %self.key,
            url = %self.media_url,
            "MediaChannel started"
        );

        let reason = self.drive().await;
        self.finish(reason).await;
    }

    async fn drive(&mut self) -> CloseReason {
        let connected = tokio::select! {
            () = self.cancel_token.cancelled() => return CloseReason::Stopped,
            result = self.ctx.transports.connect(&self.media_url) => result,
        };

        let (transport, mut events) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    target: "rtms.channel.media",
                    stream = %self.key,
                    error = %e,
                    "Failed to open media socket"
                );
                return CloseReason::ConnectFailed {
                    error: e.to_string(),
                };
            }
        };
        self.transport = Some(Arc::clone(&transport));

        let signature = self.ctx.signer.sign_stream(&self.key);
        let request = MediaHandshakeRequest::new(&self.key, signature, self.ctx.media_type);
        if let Err(reason) = self.send(transport.as_ref(), &request).await {
            return reason;
        }
        self.state.send_replace(MediaState::HandshakeSent);

        loop {
            let event = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => return CloseReason::Stopped,
                event = events.recv() => event,
            };

            let frame = match event {
                Some(TransportEvent::Frame(frame)) => frame,
                Some(TransportEvent::Disconnected { reason }) => {
                    info!(
                        target: "rtms.channel.media",
                        stream = %self.key,
                        reason = ?reason,
                        "Media socket closed by remote"
                    );
                    return CloseReason::RemoteClosed;
                }
                None => return CloseReason::RemoteClosed,
            };

            if let Some(reason) = self
                .dispatch(transport.as_ref(), classify_media_frame(frame))
                .await
            {
                return reason;
            }
        }
    }

    /// Handle one classified frame. Returns the close reason if the channel
    /// must close.
    async fn dispatch(&mut self, transport: &dyn Transport, frame: MediaFrame) -> Option<CloseReason> {
        let state = self.state.borrow().clone();

        match (state, frame) {
            (_, MediaFrame::Control(ControlMessage::KeepAliveRequest { timestamp })) => {
                let result = self
                    .send(transport, &KeepAliveResponse::echo(timestamp))
                    .await;
                if result.is_ok() {
                    self.stats.record_keepalive();
                    metrics::record_keepalive(MEDIA);
                }
                result.err()
            }

            (
                MediaState::HandshakeSent,
                MediaFrame::Control(ControlMessage::MediaHandshakeAck {
                    status_code: STATUS_OK,
                }),
            ) => {
                metrics::record_handshake(MEDIA, "success");
                self.state.send_replace(MediaState::Active);
                info!(
                    target: "rtms.channel.media",
                    stream = %self.key,
                    media_type = %self.ctx.media_type,
                    "Media handshake accepted"
                );

                let notified = tokio::select! {
                    biased;
                    () = self.cancel_token.cancelled() => return Some(CloseReason::Stopped),
                    result = self.signaling.send(SignalingCommand::MediaActive) => result,
                };
                if let Err(e) = notified {
                    warn!(
                        target: "rtms.channel.media",
                        stream = %self.key,
                        error = %e,
                        "Could not notify signaling that media is active"
                    );
                }
                None
            }

            (
                MediaState::HandshakeSent,
                MediaFrame::Control(ControlMessage::MediaHandshakeAck { status_code }),
            ) => {
                metrics::record_handshake(MEDIA, "rejected");
                warn!(
                    target: "rtms.channel.media",
                    stream = %self.key,
                    status_code,
                    "Media handshake rejected"
                );
                Some(CloseReason::HandshakeRejected { status_code })
            }

            (_, MediaFrame::Transcript(payload)) => {
                self.stats.record_transcript();
                // Detached: delivery outcome is logged by the forwarder task.
                drop(self.ctx.forwarder.forward(&self.key, payload));
                None
            }

            (_, MediaFrame::Raw { len }) => {
                self.stats.record_raw(len);
                metrics::record_raw_media_frame(len);
                None
            }

            (state, MediaFrame::Control(message)) => {
                debug!(
                    target: "rtms.channel.media",
                    stream = %self.key,
                    state = state.label(),
                    message = message.kind(),
                    "Ignoring media control message"
                );
                None
            }
        }
    }

    async fn send<T: Serialize + Sync>(
        &self,
        transport: &dyn Transport,
        message: &T,
    ) -> Result<(), CloseReason> {
        let text = protocol::encode(message).map_err(|e| CloseReason::TransportError {
            error: e.to_string(),
        })?;

        transport.send_text(text).await.map_err(|e| {
            warn!(
                target: "rtms.channel.media",
                stream = %self.key,
                error = %e,
                "Media send failed"
            );
            CloseReason::TransportError {
                error: e.to_string(),
            }
        })
    }

    async fn finish(mut self, reason: CloseReason) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }

        let stats = self.stats.snapshot();
        metrics::record_channel_closed(MEDIA, reason.label());
        info!(
            target: "rtms.channel.media",
            stream = %self.key,
            reason = %reason,
            transcripts = stats.transcripts,
            raw_frames = stats.raw_frames,
            raw_bytes = stats.raw_bytes,
            "MediaChannel stopped"
        );

        self.state.send_replace(MediaState::Closed {
            reason: reason.clone(),
        });

        // The signaling mailbox is gone once signaling itself has finished.
        let _ = self
            .signaling
            .try_send(SignalingCommand::MediaClosed { reason });
    }
}
