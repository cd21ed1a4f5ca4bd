//! `SignalingChannel` - per-stream signaling socket actor.
//!
//! States: `Connecting -> HandshakeSent -> Ready -> Closed{reason}`.
//!
//! - Opens the signaling socket and sends the signed handshake
//! - On a successful ack naming a media server, becomes `Ready` and spawns
//!   the [`MediaChannel`]
//! - Sends the client ready ack once media reports its handshake succeeded
//! - Answers keepalives for its whole lifetime
//! - On close, tears down media and reports to the registry

use super::media::{MediaChannel, MediaChannelHandle};
use super::{ChannelContext, CloseReason, MediaGrant, SessionEnded, SIGNALING};
use crate::errors::BridgeError;
use crate::observability::metrics;
use crate::protocol::{
    self, ClientReadyAck, ControlMessage, KeepAliveResponse, MediaServerUrls,
    SignalingHandshakeRequest, SEQUENCE_RANGE, STATUS_OK,
};
use crate::transport::{Frame, Transport, TransportEvent};
use common::types::StreamKey;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Mailbox size. Inputs are media notifications and close requests only.
const SIGNALING_CHANNEL_BUFFER: usize = 32;

/// Signaling channel state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalingState {
    Connecting,
    HandshakeSent,
    Ready,
    Closed { reason: CloseReason },
}

impl SignalingState {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            SignalingState::Connecting => "connecting",
            SignalingState::HandshakeSent => "handshake_sent",
            SignalingState::Ready => "ready",
            SignalingState::Closed { .. } => "closed",
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, SignalingState::Closed { .. })
    }
}

/// Mailbox messages.
#[derive(Debug)]
pub(crate) enum SignalingCommand {
    /// Media handshake succeeded; send the ready ack.
    MediaActive,
    /// Media channel reached its terminal state.
    MediaClosed { reason: CloseReason },
    /// Close the session.
    Close { reason: CloseReason },
}

/// Handle to a `SignalingChannel`.
#[derive(Clone, Debug)]
pub struct SignalingChannelHandle {
    key: StreamKey,
    sender: mpsc::Sender<SignalingCommand>,
    cancel_token: CancellationToken,
    state: watch::Receiver<SignalingState>,
    media: watch::Receiver<Option<MediaChannelHandle>>,
}

impl SignalingChannelHandle {
    #[must_use]
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SignalingState {
        self.state.borrow().clone()
    }

    /// Watch state changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.state.clone()
    }

    /// The media channel, once signaling has spawned it.
    #[must_use]
    pub fn media(&self) -> Option<MediaChannelHandle> {
        self.media.borrow().clone()
    }

    /// Ask the channel to close. Processed after any input already queued.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.sender
            .send(SignalingCommand::Close {
                reason: CloseReason::Stopped,
            })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))
    }

    /// Cancel the channel immediately. Idempotent.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Wait until the channel is closed and return why.
    pub async fn closed(&self) -> CloseReason {
        let mut state = self.state.clone();
        let result = state.wait_for(SignalingState::is_closed).await;
        match result.as_deref() {
            Ok(SignalingState::Closed { reason }) => reason.clone(),
            _ => CloseReason::Stopped,
        }
    }
}

/// One input to the state machine.
#[derive(Debug)]
enum SignalingInput {
    Control(ControlMessage),
    MediaActive,
    MediaClosed(CloseReason),
    Close(CloseReason),
    Disconnected(Option<String>),
}

impl SignalingInput {
    fn kind(&self) -> &'static str {
        match self {
            SignalingInput::Control(message) => message.kind(),
            SignalingInput::MediaActive => "media_active",
            SignalingInput::MediaClosed(_) => "media_closed",
            SignalingInput::Close(_) => "close",
            SignalingInput::Disconnected(_) => "disconnected",
        }
    }
}

impl From<SignalingCommand> for SignalingInput {
    fn from(command: SignalingCommand) -> Self {
        match command {
            SignalingCommand::MediaActive => SignalingInput::MediaActive,
            SignalingCommand::MediaClosed { reason } => SignalingInput::MediaClosed(reason),
            SignalingCommand::Close { reason } => SignalingInput::Close(reason),
        }
    }
}

/// The `SignalingChannel` actor.
pub struct SignalingChannel {
    key: StreamKey,
    /// Registry generation of the session this channel belongs to.
    generation: u64,
    signaling_url: String,
    ctx: ChannelContext,
    receiver: mpsc::Receiver<SignalingCommand>,
    /// Given to the media channel for its notifications.
    command_tx: mpsc::Sender<SignalingCommand>,
    cancel_token: CancellationToken,
    state: watch::Sender<SignalingState>,
    media: watch::Sender<Option<MediaChannelHandle>>,
    media_task: Option<JoinHandle<()>>,
    transport: Option<Arc<dyn Transport>>,
    ended: mpsc::UnboundedSender<SessionEnded>,
    /// Cancelled once the session this one replaces has been torn down.
    prior_teardown: Option<CancellationToken>,
}

impl SignalingChannel {
    /// Spawn a signaling channel for `key`.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        key: StreamKey,
        generation: u64,
        signaling_url: String,
        ctx: ChannelContext,
        cancel_token: CancellationToken,
        ended: mpsc::UnboundedSender<SessionEnded>,
    ) -> (SignalingChannelHandle, JoinHandle<()>) {
        Self::spawn_inner(key, generation, signaling_url, ctx, cancel_token, ended, None)
    }

    /// Like [`SignalingChannel::spawn`], but the socket is only opened once
    /// `prior_teardown` is cancelled.
    pub(crate) fn spawn_after(
        prior_teardown: CancellationToken,
        key: StreamKey,
        generation: u64,
        signaling_url: String,
        ctx: ChannelContext,
        cancel_token: CancellationToken,
        ended: mpsc::UnboundedSender<SessionEnded>,
    ) -> (SignalingChannelHandle, JoinHandle<()>) {
        Self::spawn_inner(
            key,
            generation,
            signaling_url,
            ctx,
            cancel_token,
            ended,
            Some(prior_teardown),
        )
    }

    fn spawn_inner(
        key: StreamKey,
        generation: u64,
        signaling_url: String,
        ctx: ChannelContext,
        cancel_token: CancellationToken,
        ended: mpsc::UnboundedSender<SessionEnded>,
        prior_teardown: Option<CancellationToken>,
    ) -> (SignalingChannelHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SIGNALING_CHANNEL_BUFFER);
        let (state_tx, state_rx) = watch::channel(SignalingState::Connecting);
        let (media_tx, media_rx) = watch::channel(None);

        let actor = Self {
            key: key.clone(),
            generation,
            signaling_url,
            ctx,
            receiver,
            command_tx: sender.clone(),
            cancel_token: cancel_token.clone(),
            state: state_tx,
            media: media_tx,
            media_task: None,
            transport: None,
            ended,
            prior_teardown,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SignalingChannelHandle {
            key,
            sender,
            cancel_token,
            state: state_rx,
            media: media_rx,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rtms.channel.signaling",
        fields(stream = %self.key, generation = self.generation)
    )]
    async fn run(mut self) {
        debug!(
            target: "rtms.channel.signaling",
            stream = %self.key,
            url = %self.signaling_url,
            "SignalingChannel started"
        );

        let reason = self.drive().await;
        self.finish(reason).await;
    }

    /// Run the socket until something closes it.
    async fn drive(&mut self) -> CloseReason {
        if let Some(prior) = self.prior_teardown.take() {
            tokio::select! {
                () = self.cancel_token.cancelled() => return CloseReason::Stopped,
                () = prior.cancelled() => {}
            }
        }

        let connected = tokio::select! {
            () = self.cancel_token.cancelled() => return CloseReason::Stopped,
            result = self.ctx.transports.connect(&self.signaling_url) => result,
        };

        let (transport, mut events) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                warn!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    error = %e,
                    "Failed to open signaling socket"
                );
                return CloseReason::ConnectFailed {
                    error: e.to_string(),
                };
            }
        };
        self.transport = Some(Arc::clone(&transport));

        if let Err(reason) = self.send_handshake(transport.as_ref()).await {
            return reason;
        }
        self.state.send_replace(SignalingState::HandshakeSent);

        loop {
            let input = tokio::select! {
                biased;

                () = self.cancel_token.cancelled() => SignalingInput::Close(CloseReason::Stopped),

                command = self.receiver.recv() => match command {
                    Some(command) => command.into(),
                    None => SignalingInput::Close(CloseReason::Stopped),
                },

                event = events.recv() => match event {
                    Some(TransportEvent::Frame(frame)) => match self.decode(frame) {
                        Some(message) => SignalingInput::Control(message),
                        None => continue,
                    },
                    Some(TransportEvent::Disconnected { reason }) => SignalingInput::Disconnected(reason),
                    None => SignalingInput::Disconnected(None),
                },
            };

            if let Some(reason) = self.dispatch(transport.as_ref(), input).await {
                return reason;
            }
        }
    }

    /// Decode a signaling frame of either opcode. Undecodable frames are dropped.
    fn decode(&self, frame: Frame) -> Option<ControlMessage> {
        let text = match protocol::frame_text(frame) {
            Ok(text) => text,
            Err(len) => {
                debug!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    bytes = len,
                    "Ignoring non-UTF-8 signaling frame"
                );
                return None;
            }
        };

        match protocol::decode_control(&text) {
            Ok(message) => Some(message),
            Err(e) => {
                debug!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    error = %e,
                    "Ignoring undecodable signaling frame"
                );
                None
            }
        }
    }

    /// Handle one input. Returns the close reason if the channel must close.
    async fn dispatch(
        &mut self,
        transport: &dyn Transport,
        input: SignalingInput,
    ) -> Option<CloseReason> {
        let state = self.state.borrow().clone();

        match (state, input) {
            (_, SignalingInput::Close(reason)) => Some(reason),

            (_, SignalingInput::Disconnected(reason)) => {
                info!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    reason = ?reason,
                    "Signaling socket closed by remote"
                );
                Some(CloseReason::RemoteClosed)
            }

            (_, SignalingInput::Control(ControlMessage::KeepAliveRequest { timestamp })) => {
                let result = self
                    .send(transport, &KeepAliveResponse::echo(timestamp))
                    .await;
                if result.is_ok() {
                    metrics::record_keepalive(SIGNALING);
                }
                result.err()
            }

            (
                SignalingState::HandshakeSent,
                SignalingInput::Control(ControlMessage::HandshakeAck {
                    status_code,
                    media_server,
                }),
            ) => self.on_handshake_ack(status_code, media_server.as_ref()),

            (SignalingState::Ready, SignalingInput::MediaActive) => {
                let result = self.send(transport, &ClientReadyAck::new(&self.key)).await;
                if result.is_ok() {
                    info!(
                        target: "rtms.channel.signaling",
                        stream = %self.key,
                        "Media active, ready ack sent"
                    );
                }
                result.err()
            }

            (_, SignalingInput::MediaClosed(reason)) => {
                info!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    reason = %reason,
                    "Media channel closed, signaling stays up"
                );
                None
            }

            (_, SignalingInput::Control(ControlMessage::StreamStateUpdate { state, reason })) => {
                info!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    stream_state = ?state,
                    reason = ?reason,
                    "Stream state update"
                );
                None
            }

            (state, input) => {
                debug!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    state = state.label(),
                    input = input.kind(),
                    "Ignoring signaling input"
                );
                None
            }
        }
    }

    fn on_handshake_ack(
        &mut self,
        status_code: i64,
        media_server: Option<&MediaServerUrls>,
    ) -> Option<CloseReason> {
        if status_code != STATUS_OK {
            metrics::record_handshake(SIGNALING, "rejected");
            warn!(
                target: "rtms.channel.signaling",
                stream = %self.key,
                status_code,
                "Signaling handshake rejected"
            );
            return Some(CloseReason::HandshakeRejected { status_code });
        }

        metrics::record_handshake(SIGNALING, "success");

        let Some(media_url) = media_server
            .and_then(|urls| urls.select(self.ctx.media_type))
            .map(str::to_owned)
        else {
            warn!(
                target: "rtms.channel.signaling",
                stream = %self.key,
                media_type = %self.ctx.media_type,
                "Handshake ack carried no media server URL"
            );
            return Some(CloseReason::NoMediaServer);
        };

        self.state.send_replace(SignalingState::Ready);

        let grant = MediaGrant::issue(&self.state.borrow(), &self.key, &media_url);
        match grant {
            Ok(grant) => {
                let (handle, task) = MediaChannel::spawn(
                    grant,
                    self.ctx.clone(),
                    self.cancel_token.child_token(),
                    self.command_tx.clone(),
                );
                self.media.send_replace(Some(handle));
                self.media_task = Some(task);
                None
            }
            Err(e) => {
                error!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    error = %e,
                    "Media grant refused"
                );
                None
            }
        }
    }

    async fn send_handshake(&self, transport: &dyn Transport) -> Result<(), CloseReason> {
        let sequence = rand::thread_rng().gen_range(0..SEQUENCE_RANGE);
        let signature = self.ctx.signer.sign_stream(&self.key);
        let request = SignalingHandshakeRequest::new(&self.key, signature, sequence);

        self.send(transport, &request).await?;

        debug!(
            target: "rtms.channel.signaling",
            stream = %self.key,
            sequence,
            "Signaling handshake sent"
        );
        Ok(())
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
                target: "rtms.channel.signaling",
                stream = %self.key,
                error = %e,
                "Signaling send failed"
            );
            CloseReason::TransportError {
                error: e.to_string(),
            }
        })
    }

    /// Tear down media, close the socket, publish `Closed`, tell the registry.
    ///
    /// Finishes within three quarters of the teardown timeout, so the
    /// registry never has to abort a signaling task that is still closing.
    async fn finish(mut self, reason: CloseReason) {
        // Cancels the media child token as well.
        self.cancel_token.cancel();

        let quarter = self.ctx.teardown_timeout / 4;

        if let Some(mut task) = self.media_task.take() {
            if tokio::time::timeout(quarter * 2, &mut task).await.is_err() {
                warn!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    "Media channel did not stop in time, aborting"
                );
                task.abort();
            }
        }

        if let Some(transport) = self.transport.take() {
            if tokio::time::timeout(quarter, transport.close()).await.is_err() {
                warn!(
                    target: "rtms.channel.signaling",
                    stream = %self.key,
                    "Signaling socket close timed out"
                );
            }
        }

        metrics::record_channel_closed(SIGNALING, reason.label());
        info!(
            target: "rtms.channel.signaling",
            stream = %self.key,
            generation = self.generation,
            reason = %reason,
            "SignalingChannel stopped"
        );

        self.state.send_replace(SignalingState::Closed {
            reason: reason.clone(),
        });

        let _ = self.ended.send(SessionEnded {
            key: self.key.clone(),
            generation: self.generation,
            reason,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::channels::MediaState;
    use crate::forwarder::TranscriptForwarder;
    use crate::protocol::MediaType;
    use crate::signature::{self, StreamSigner};
    use crate::transport::testing::{next_connection, MockConnection, MockTransportFactory};
    use common::secret::SecretString;
    use serde_json::json;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        handle: SignalingChannelHandle,
        task: JoinHandle<()>,
        connections: mpsc::UnboundedReceiver<MockConnection>,
        ended: mpsc::UnboundedReceiver<SessionEnded>,
    }

    fn context(factory: Arc<MockTransportFactory>) -> ChannelContext {
        ChannelContext {
            signer: Arc::new(StreamSigner::new("client-id", SecretString::from("secret"))),
            media_type: MediaType::Transcript,
            transports: factory,
            forwarder: TranscriptForwarder::new("http://127.0.0.1:9/ingest", WAIT).unwrap(),
            teardown_timeout: WAIT,
        }
    }

    fn start() -> Harness {
        let (factory, connections) = MockTransportFactory::new();
        start_with(factory, connections)
    }

    fn start_with(
        factory: Arc<MockTransportFactory>,
        connections: mpsc::UnboundedReceiver<MockConnection>,
    ) -> Harness {
        let (ended_tx, ended) = mpsc::unbounded_channel();
        let (handle, task) = SignalingChannel::spawn(
            StreamKey::new("meeting-1", "stream-1"),
            7,
            "wss://signaling.example/1".to_string(),
            context(factory),
            CancellationToken::new(),
            ended_tx,
        );
        Harness {
            handle,
            task,
            connections,
            ended,
        }
    }

    async fn wait_state(handle: &SignalingChannelHandle, expected: SignalingState) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|s| *s == expected))
            .await
            .expect("timed out waiting for state")
            .expect("state sender dropped");
    }

    fn ack_with_media() -> serde_json::Value {
        json!({
            "msg_type": 2,
            "status_code": 0,
            "media_server": {"server_urls": {"all": "wss://media.example/all"}}
        })
    }

    /// Drive a session to Ready with an Active media channel.
    async fn ready_session(h: &mut Harness) -> (MockConnection, MockConnection) {
        let mut signaling = next_connection(&mut h.connections).await;
        let _ = signaling.next_sent().await;
        signaling.push_json(ack_with_media()).await;

        let mut media = next_connection(&mut h.connections).await;
        let handshake = media.next_sent().await;
        assert_eq!(handshake["msg_type"], 3);

        media.push_json(json!({"msg_type": 4, "status_code": 0})).await;
        let ready = signaling.next_sent().await;
        assert_eq!(ready, json!({"msg_type": 7, "rtms_stream_id": "stream-1"}));

        (signaling, media)
    }

    #[tokio::test]
    async fn test_sends_signed_handshake() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;

        assert_eq!(conn.url, "wss://signaling.example/1");

        let handshake = conn.next_sent().await;
        assert_eq!(handshake["msg_type"], 1);
        assert_eq!(handshake["protocol_version"], 1);
        assert_eq!(handshake["meeting_uuid"], "meeting-1");
        assert_eq!(handshake["rtms_stream_id"], "stream-1");
        assert_eq!(
            handshake["signature"],
            signature::sign("client-id", "meeting-1", "stream-1", b"secret")
        );
        let sequence = handshake["sequence"].as_u64().unwrap();
        assert!(sequence < u64::from(SEQUENCE_RANGE));

        wait_state(&h.handle, SignalingState::HandshakeSent).await;
        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_rejected_handshake_closes_without_media() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        conn.push_json(json!({"msg_type": 2, "status_code": 3})).await;

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::HandshakeRejected { status_code: 3 });
        assert!(conn.is_closed());
        assert!(h.handle.media().is_none());
        assert!(h.connections.try_recv().is_err(), "no media socket opened");

        let ended = h.ended.recv().await.unwrap();
        assert_eq!(ended.generation, 7);
        assert_eq!(ended.key, StreamKey::new("meeting-1", "stream-1"));
    }

    #[tokio::test]
    async fn test_success_without_media_url_closes() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        conn.push_json(json!({"msg_type": 2, "status_code": 0, "media_server": {"server_urls": {}}}))
            .await;

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::NoMediaServer);
        assert!(h.connections.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_keepalive_echoed_before_later_frames() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        conn.push_json(json!({"msg_type": 12, "timestamp": 1_700_000_000_123_i64}))
            .await;
        conn.push_json(json!({"msg_type": 12, "timestamp": "opaque"}))
            .await;

        assert_eq!(
            conn.next_sent().await,
            json!({"msg_type": 13, "timestamp": 1_700_000_000_123_i64})
        );
        assert_eq!(
            conn.next_sent().await,
            json!({"msg_type": 13, "timestamp": "opaque"})
        );
        assert_eq!(h.handle.state(), SignalingState::HandshakeSent);
        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_ready_opens_media_and_acks() {
        let mut h = start();
        let (signaling, media) = ready_session(&mut h).await;

        assert_eq!(h.handle.state(), SignalingState::Ready);
        assert_eq!(media.url, "wss://media.example/all");

        let media_handle = h.handle.media().unwrap();
        assert_eq!(media_handle.state(), MediaState::Active);

        h.handle.cancel();
        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::Stopped);
        assert!(signaling.is_closed());
        assert!(media.is_closed());
    }

    #[tokio::test]
    async fn test_media_close_keeps_signaling_up() {
        let mut h = start();
        let (mut signaling, media) = ready_session(&mut h).await;

        media.disconnect().await;
        let media_handle = h.handle.media().unwrap();
        tokio::time::timeout(WAIT, media_handle.closed())
            .await
            .unwrap();

        // Signaling still answers keepalives.
        signaling
            .push_json(json!({"msg_type": 12, "timestamp": 5}))
            .await;
        assert_eq!(
            signaling.next_sent().await,
            json!({"msg_type": 13, "timestamp": 5})
        );
        assert_eq!(h.handle.state(), SignalingState::Ready);
        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_remote_close_tears_down_media() {
        let mut h = start();
        let (signaling, media) = ready_session(&mut h).await;

        signaling.disconnect().await;

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::RemoteClosed);
        assert!(media.is_closed());
        assert!(h.handle.media().unwrap().state().is_closed());
        tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_command_stops_channel() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        h.handle.close().await.unwrap();

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::Stopped);
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_closes() {
        let (factory, connections) = MockTransportFactory::new();
        factory.refuse_connections();
        let mut h = start_with(factory, connections);

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert!(matches!(reason, CloseReason::ConnectFailed { .. }));
        assert!(h.ended.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_garbage_and_unknown_frames_ignored() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        conn.push_text("not json").await;
        conn.push_json(json!({"msg_type": 99})).await;
        conn.push_binary(b"\x00\x01").await;
        conn.push_json(json!({"msg_type": 12, "timestamp": 1})).await;

        assert_eq!(conn.next_sent().await, json!({"msg_type": 13, "timestamp": 1}));
        assert_eq!(h.handle.state(), SignalingState::HandshakeSent);
        assert!(conn.nothing_sent());
        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_binary_control_frames_decoded() {
        let mut h = start();
        let mut conn = next_connection(&mut h.connections).await;
        let _ = conn.next_sent().await;

        conn.push_binary(br#"{"msg_type":12,"timestamp":3}"#).await;
        assert_eq!(conn.next_sent().await, json!({"msg_type": 13, "timestamp": 3}));

        conn.push_binary(
            br#"{"msg_type":2,"status_code":0,"media_server":{"server_urls":{"all":"wss://media.example/all"}}}"#,
        )
        .await;
        let media = next_connection(&mut h.connections).await;
        assert_eq!(media.url, "wss://media.example/all");
        assert_eq!(h.handle.state(), SignalingState::Ready);
        h.handle.cancel();
    }

    #[tokio::test]
    async fn test_stalled_socket_close_still_finishes() {
        let (factory, connections) = MockTransportFactory::new();
        factory.stall_close();
        let mut h = start_with(factory, connections);
        let (signaling, media) = ready_session(&mut h).await;

        h.handle.cancel();

        // Media wait plus own close stay under the teardown timeout.
        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::Stopped);
        assert!(signaling.is_closed());
        assert!(media.is_closed());
        assert_eq!(h.ended.recv().await.map(|e| e.generation), Some(7));
    }

    #[tokio::test]
    async fn test_spawn_after_waits_for_prior_teardown() {
        let (factory, mut connections) = MockTransportFactory::new();
        let (ended_tx, _ended) = mpsc::unbounded_channel();
        let prior = CancellationToken::new();
        let (handle, _task) = SignalingChannel::spawn_after(
            prior.clone(),
            StreamKey::new("meeting-1", "stream-1"),
            8,
            "wss://signaling.example/1".to_string(),
            context(factory),
            CancellationToken::new(),
            ended_tx,
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(connections.try_recv().is_err(), "socket opened too early");
        assert_eq!(handle.state(), SignalingState::Connecting);

        prior.cancel();
        let conn = next_connection(&mut connections).await;
        assert_eq!(conn.url, "wss://signaling.example/1");
        handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let mut h = start();
        let _conn = next_connection(&mut h.connections).await;

        h.handle.cancel();
        h.handle.cancel();

        let reason = tokio::time::timeout(WAIT, h.handle.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::Stopped);
        assert!(h.handle.is_cancelled());
        assert_eq!(h.ended.recv().await.map(|e| e.reason), Some(CloseReason::Stopped));
        assert!(h.ended.try_recv().is_err(), "exactly one end notice");
    }
}
