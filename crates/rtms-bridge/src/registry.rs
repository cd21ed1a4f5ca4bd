//! `StreamRegistry` - process-wide owner of stream sessions.
//!
//! A single actor serializes every mutation of the session table:
//!
//! - At most one live session per [`StreamKey`]
//! - A second start for a live key tears the old session down (bounded by
//!   the teardown timeout) before its replacement opens a socket
//! - Each session carries a generation number; end notices from a replaced
//!   session never remove its successor
//! - Bounded teardown waits run in their own tasks, never in the actor loop,
//!   so a stuck session cannot hold up other streams
//! - Finished or panicked session tasks are reaped on every loop turn
//! - Session tokens are children of the registry token, so shutdown reaches
//!   every channel

use crate::channels::{
    ChannelContext, CloseReason, MediaState, MediaStatsSnapshot, SessionEnded, SignalingChannel,
    SignalingChannelHandle, SignalingState,
};
use crate::errors::BridgeError;
use crate::observability::metrics;
use chrono::{DateTime, Utc};
use common::types::StreamKey;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 256;

/// Capability over one live session: observe its channels, close it.
#[derive(Clone, Debug)]
pub struct StreamSessionHandle {
    generation: u64,
    created_at: DateTime<Utc>,
    signaling: SignalingChannelHandle,
}

impl StreamSessionHandle {
    #[must_use]
    pub fn key(&self) -> &StreamKey {
        self.signaling.key()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn signaling_state(&self) -> SignalingState {
        self.signaling.state()
    }

    /// Media state, once signaling has opened the media channel.
    #[must_use]
    pub fn media_state(&self) -> Option<MediaState> {
        self.signaling.media().map(|media| media.state())
    }

    /// Ask the session to close. The registry drops it once it has.
    pub async fn close(&self) -> Result<(), BridgeError> {
        self.signaling.close().await
    }

    /// Wait for the session's signaling channel to close.
    pub async fn closed(&self) -> CloseReason {
        self.signaling.closed().await
    }

    #[must_use]
    pub fn summary(&self) -> SessionSummary {
        let media = self.signaling.media();
        SessionSummary {
            meeting_id: self.key().meeting_id.to_string(),
            stream_id: self.key().stream_id.to_string(),
            generation: self.generation,
            created_at: self.created_at,
            signaling: self.signaling.state(),
            media: media.as_ref().map(|m| m.state()),
            media_stats: media.as_ref().map(|m| m.stats()),
        }
    }
}

/// One session as reported by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub meeting_id: String,
    pub stream_id: String,
    pub generation: u64,
    pub created_at: DateTime<Utc>,
    pub signaling: SignalingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_stats: Option<MediaStatsSnapshot>,
}

/// Registry status.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStatus {
    pub session_count: usize,
    pub accepting_new: bool,
    pub sessions: Vec<SessionSummary>,
}

/// Messages handled by the registry actor.
#[derive(Debug)]
enum RegistryMessage {
    StartStream {
        key: StreamKey,
        signaling_url: String,
        respond_to: oneshot::Sender<Result<u64, BridgeError>>,
    },
    StopStream {
        key: StreamKey,
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    },
    Lookup {
        key: StreamKey,
        respond_to: oneshot::Sender<Result<StreamSessionHandle, BridgeError>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to the `StreamRegistry` actor.
#[derive(Clone, Debug)]
pub struct StreamRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl StreamRegistryHandle {
    /// Spawn the registry actor and return a handle to it.
    #[must_use]
    pub fn new(ctx: ChannelContext) -> Self {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = StreamRegistry::new(ctx, receiver, cancel_token.clone());
        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
        }
    }

    /// Start a session for `key`, replacing any live one.
    ///
    /// Returns the new session's generation.
    pub async fn start_stream(
        &self,
        key: StreamKey,
        signaling_url: String,
    ) -> Result<u64, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::StartStream {
                key,
                signaling_url,
                respond_to: tx,
            })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BridgeError::Internal(format!("response receive failed: {e}")))?
    }

    /// Stop and remove the session for `key`.
    pub async fn stop_stream(&self, key: StreamKey) -> Result<(), BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::StopStream {
                key,
                respond_to: tx,
            })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BridgeError::Internal(format!("response receive failed: {e}")))?
    }

    /// Get the live session for `key`.
    pub async fn lookup(&self, key: StreamKey) -> Result<StreamSessionHandle, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Lookup {
                key,
                respond_to: tx,
            })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BridgeError::Internal(format!("response receive failed: {e}")))?
    }

    pub async fn status(&self) -> Result<RegistryStatus, BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BridgeError::Internal(format!("response receive failed: {e}")))
    }

    /// Tear down every session and stop the actor. Resolves once teardown
    /// has finished.
    pub async fn shutdown(&self) -> Result<(), BridgeError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::Shutdown { respond_to: tx })
            .await
            .map_err(|e| BridgeError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| BridgeError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the registry and, through child tokens, every session.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// A live session and its signaling task.
struct ManagedSession {
    session: StreamSessionHandle,
    task_handle: JoinHandle<()>,
}

/// The `StreamRegistry` actor.
struct StreamRegistry {
    ctx: ChannelContext,
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    sessions: HashMap<StreamKey, ManagedSession>,
    next_generation: u64,
    ended_tx: mpsc::UnboundedSender<SessionEnded>,
    ended_rx: mpsc::UnboundedReceiver<SessionEnded>,
    accepting_new: bool,
    /// Teardowns still in flight.
    teardowns: Vec<JoinHandle<()>>,
}

impl StreamRegistry {
    fn new(
        ctx: ChannelContext,
        receiver: mpsc::Receiver<RegistryMessage>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (ended_tx, ended_rx) = mpsc::unbounded_channel();

        Self {
            ctx,
            receiver,
            cancel_token,
            sessions: HashMap::new(),
            next_generation: 1,
            ended_tx,
            ended_rx,
            accepting_new: true,
            teardowns: Vec::new(),
        }
    }

    #[instrument(skip_all, name = "rtms.registry")]
    async fn run(mut self) {
        info!(target: "rtms.registry", "StreamRegistry started");

        loop {
            self.reap_finished().await;

            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rtms.registry",
                        "StreamRegistry received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            info!(
                                target: "rtms.registry",
                                "StreamRegistry channel closed, exiting"
                            );
                            self.graceful_shutdown().await;
                            break;
                        }
                    }
                }

                Some(ended) = self.ended_rx.recv() => {
                    self.on_session_ended(ended);
                }
            }
        }

        info!(
            target: "rtms.registry",
            sessions_remaining = self.sessions.len(),
            "StreamRegistry stopped"
        );
    }

    /// Handle a single message. Returns true if the actor should exit.
    async fn handle_message(&mut self, message: RegistryMessage) -> bool {
        match message {
            RegistryMessage::StartStream {
                key,
                signaling_url,
                respond_to,
            } => {
                let result = self.start_stream(key, signaling_url);
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::StopStream { key, respond_to } => {
                self.stop_stream(key, respond_to);
                false
            }

            RegistryMessage::Lookup { key, respond_to } => {
                let result = self
                    .sessions
                    .get(&key)
                    .map(|managed| managed.session.clone())
                    .ok_or_else(|| BridgeError::SessionNotFound(key.to_string()));
                let _ = respond_to.send(result);
                false
            }

            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
                false
            }

            RegistryMessage::Shutdown { respond_to } => {
                self.graceful_shutdown().await;
                self.cancel_token.cancel();
                let _ = respond_to.send(());
                true
            }
        }
    }

    fn start_stream(&mut self, key: StreamKey, signaling_url: String) -> Result<u64, BridgeError> {
        if !self.accepting_new {
            return Err(BridgeError::Internal(
                "registry is shutting down".to_string(),
            ));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (signaling, task_handle) = match self.sessions.remove(&key) {
            Some(previous) => {
                info!(
                    target: "rtms.registry",
                    stream = %key,
                    previous_generation = previous.session.generation,
                    "Replacing live session"
                );
                let torn_down = self.spawn_teardown(key.clone(), previous, None);
                SignalingChannel::spawn_after(
                    torn_down,
                    key.clone(),
                    generation,
                    signaling_url,
                    self.ctx.clone(),
                    self.cancel_token.child_token(),
                    self.ended_tx.clone(),
                )
            }
            None => SignalingChannel::spawn(
                key.clone(),
                generation,
                signaling_url,
                self.ctx.clone(),
                self.cancel_token.child_token(),
                self.ended_tx.clone(),
            ),
        };

        let session = StreamSessionHandle {
            generation,
            created_at: Utc::now(),
            signaling,
        };
        self.sessions.insert(
            key.clone(),
            ManagedSession {
                session,
                task_handle,
            },
        );
        metrics::set_sessions_active(self.sessions.len());

        info!(
            target: "rtms.registry",
            stream = %key,
            generation,
            total_sessions = self.sessions.len(),
            "Session started"
        );

        Ok(generation)
    }

    /// Remove the session and tear it down. `respond_to` is answered once
    /// teardown has finished; the actor itself moves on at once.
    fn stop_stream(
        &mut self,
        key: StreamKey,
        respond_to: oneshot::Sender<Result<(), BridgeError>>,
    ) {
        let Some(managed) = self.sessions.remove(&key) else {
            let _ = respond_to.send(Err(BridgeError::SessionNotFound(key.to_string())));
            return;
        };

        metrics::set_sessions_active(self.sessions.len());
        info!(
            target: "rtms.registry",
            stream = %key,
            total_sessions = self.sessions.len(),
            "Session stopping"
        );

        self.spawn_teardown(key, managed, Some(respond_to));
    }

    /// Cancel a session and wait for it from a separate task.
    ///
    /// The returned token is cancelled when the teardown is over, even if
    /// the teardown task itself is aborted.
    fn spawn_teardown(
        &mut self,
        key: StreamKey,
        managed: ManagedSession,
        respond_to: Option<oneshot::Sender<Result<(), BridgeError>>>,
    ) -> CancellationToken {
        let done = CancellationToken::new();
        let done_guard = done.clone().drop_guard();
        let timeout = self.ctx.teardown_timeout;

        self.teardowns.retain(|task| !task.is_finished());
        self.teardowns.push(tokio::spawn(async move {
            let _done_guard = done_guard;
            teardown(&key, managed, timeout).await;
            if let Some(respond_to) = respond_to {
                let _ = respond_to.send(Ok(()));
            }
        }));

        done
    }

    fn on_session_ended(&mut self, ended: SessionEnded) {
        let current = self
            .sessions
            .get(&ended.key)
            .is_some_and(|managed| managed.session.generation == ended.generation);

        if !current {
            debug!(
                target: "rtms.registry",
                stream = %ended.key,
                generation = ended.generation,
                "Ignoring end notice from a replaced or removed session"
            );
            return;
        }

        if let Some(managed) = self.sessions.remove(&ended.key) {
            // The task sends its notice last, so this teardown is short.
            self.spawn_teardown(ended.key.clone(), managed, None);
        }
        metrics::set_sessions_active(self.sessions.len());

        info!(
            target: "rtms.registry",
            stream = %ended.key,
            generation = ended.generation,
            reason = %ended.reason,
            total_sessions = self.sessions.len(),
            "Session ended"
        );
    }

    fn status(&self) -> RegistryStatus {
        let mut sessions: Vec<SessionSummary> = self
            .sessions
            .values()
            .map(|managed| managed.session.summary())
            .collect();
        sessions.sort_by_key(|s| s.generation);

        RegistryStatus {
            session_count: sessions.len(),
            accepting_new: self.accepting_new,
            sessions,
        }
    }

    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        info!(
            target: "rtms.registry",
            session_count = self.sessions.len(),
            "Tearing down all sessions"
        );

        let sessions: Vec<(StreamKey, ManagedSession)> = self.sessions.drain().collect();
        for (key, managed) in sessions {
            self.spawn_teardown(key, managed, None);
        }
        metrics::set_sessions_active(0);

        // Each teardown is bounded, so this ends within one teardown timeout.
        for task in std::mem::take(&mut self.teardowns) {
            if let Err(e) = task.await {
                warn!(target: "rtms.registry", error = ?e, "Teardown task failed");
            }
        }
    }

    /// Remove sessions whose task has already exited.
    async fn reap_finished(&mut self) {
        let finished: Vec<StreamKey> = self
            .sessions
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for key in finished {
            let Some(managed) = self.sessions.remove(&key) else {
                continue;
            };

            match managed.task_handle.await {
                Ok(()) => {
                    debug!(
                        target: "rtms.registry",
                        stream = %key,
                        generation = managed.session.generation,
                        "Reaped finished session"
                    );
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!(
                            target: "rtms.registry",
                            stream = %key,
                            error = ?join_error,
                            "Session task panicked"
                        );
                        metrics::record_session_panic();
                    }
                }
            }
            metrics::set_sessions_active(self.sessions.len());
        }
    }
}

/// Cancel a session and wait (bounded) for its task.
async fn teardown(key: &StreamKey, managed: ManagedSession, timeout: Duration) {
    managed.session.signaling.cancel();
    let mut task = managed.task_handle;

    match tokio::time::timeout(timeout, &mut task).await {
        Ok(Ok(())) => {
            debug!(
                target: "rtms.registry",
                stream = %key,
                generation = managed.session.generation,
                "Session task completed cleanly"
            );
        }
        Ok(Err(e)) => {
            if e.is_panic() {
                metrics::record_session_panic();
            }
            warn!(
                target: "rtms.registry",
                stream = %key,
                error = ?e,
                "Session task failed during teardown"
            );
        }
        Err(_) => {
            warn!(
                target: "rtms.registry",
                stream = %key,
                "Session teardown timed out, aborting task"
            );
            task.abort();
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::forwarder::TranscriptForwarder;
    use crate::protocol::MediaType;
    use crate::signature::StreamSigner;
    use crate::transport::testing::{next_connection, MockConnection, MockTransportFactory};
    use common::secret::SecretString;
    use serde_json::json;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(2);

    fn context(factory: Arc<MockTransportFactory>) -> ChannelContext {
        ChannelContext {
            signer: Arc::new(StreamSigner::new("client-id", SecretString::from("secret"))),
            media_type: MediaType::Transcript,
            transports: factory,
            forwarder: TranscriptForwarder::new("http://127.0.0.1:9/ingest", WAIT).unwrap(),
            teardown_timeout: WAIT,
        }
    }

    fn registry() -> (StreamRegistryHandle, mpsc::UnboundedReceiver<MockConnection>) {
        let (factory, connections) = MockTransportFactory::new();
        (StreamRegistryHandle::new(context(factory)), connections)
    }

    async fn wait_until_removed(registry: &StreamRegistryHandle, key: &StreamKey) {
        tokio::time::timeout(WAIT, async {
            while registry.lookup(key.clone()).await.is_ok() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("session was not removed");
    }

    #[tokio::test]
    async fn test_start_and_lookup() {
        let (registry, mut connections) = registry();
        let key = StreamKey::new("m1", "s1");

        let generation = registry
            .start_stream(key.clone(), "wss://signaling/1".to_string())
            .await
            .unwrap();
        assert_eq!(generation, 1);

        let conn = next_connection(&mut connections).await;
        assert_eq!(conn.url, "wss://signaling/1");

        let session = registry.lookup(key.clone()).await.unwrap();
        assert_eq!(session.key(), &key);
        assert_eq!(session.generation(), 1);
        assert!(session.media_state().is_none());

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_lookup_and_stop_unknown_key() {
        let (registry, _connections) = registry();
        let key = StreamKey::new("m1", "missing");

        assert!(matches!(
            registry.lookup(key.clone()).await,
            Err(BridgeError::SessionNotFound(_))
        ));
        assert!(matches!(
            registry.stop_stream(key).await,
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_tears_down_and_removes() {
        let (registry, mut connections) = registry();
        let key = StreamKey::new("m1", "s1");

        registry
            .start_stream(key.clone(), "wss://signaling/1".to_string())
            .await
            .unwrap();
        let conn = next_connection(&mut connections).await;
        let session = registry.lookup(key.clone()).await.unwrap();

        registry.stop_stream(key.clone()).await.unwrap();

        // stop_stream awaits teardown, so the socket is already closed.
        assert!(conn.is_closed());
        assert_eq!(session.signaling_state().label(), "closed");
        assert!(matches!(
            registry.lookup(key).await,
            Err(BridgeError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_start_replaces_session() {
        let (registry, mut connections) = registry();
        let key = StreamKey::new("m1", "s1");

        registry
            .start_stream(key.clone(), "wss://signaling/old".to_string())
            .await
            .unwrap();
        let old_conn = next_connection(&mut connections).await;
        let old_session = registry.lookup(key.clone()).await.unwrap();

        let generation = registry
            .start_stream(key.clone(), "wss://signaling/new".to_string())
            .await
            .unwrap();
        assert_eq!(generation, 2);

        // The new socket only opens once the old session is torn down.
        let new_conn = next_connection(&mut connections).await;
        assert_eq!(new_conn.url, "wss://signaling/new");
        assert!(old_conn.is_closed());
        assert_eq!(
            old_session.signaling_state(),
            SignalingState::Closed {
                reason: CloseReason::Stopped
            }
        );

        // The old session's end notice must not remove its successor.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let current = registry.lookup(key.clone()).await.unwrap();
        assert_eq!(current.generation(), 2);

        let status = registry.status().await.unwrap();
        assert_eq!(status.session_count, 1);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_self_closed_session_is_removed() {
        let (registry, mut connections) = registry();
        let key = StreamKey::new("m1", "s1");

        registry
            .start_stream(key.clone(), "wss://signaling/1".to_string())
            .await
            .unwrap();
        let mut conn = next_connection(&mut connections).await;
        let _ = conn.next_sent().await;

        conn.push_json(json!({"msg_type": 2, "status_code": 1})).await;

        wait_until_removed(&registry, &key).await;
        assert_eq!(registry.status().await.unwrap().session_count, 0);
    }

    #[tokio::test]
    async fn test_status_lists_sessions() {
        let (registry, mut connections) = registry();

        registry
            .start_stream(StreamKey::new("m1", "s1"), "wss://signaling/1".to_string())
            .await
            .unwrap();
        registry
            .start_stream(StreamKey::new("m2", "s2"), "wss://signaling/2".to_string())
            .await
            .unwrap();
        let _c1 = next_connection(&mut connections).await;
        let _c2 = next_connection(&mut connections).await;

        let status = registry.status().await.unwrap();
        assert_eq!(status.session_count, 2);
        assert!(status.accepting_new);
        assert_eq!(status.sessions.first().unwrap().meeting_id, "m1");
        assert_eq!(status.sessions.get(1).unwrap().stream_id, "s2");

        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["sessions"][0]["generation"], 1);

        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let (registry, mut connections) = registry();

        for n in 0..3 {
            registry
                .start_stream(
                    StreamKey::new(format!("m{n}"), "s"),
                    format!("wss://signaling/{n}"),
                )
                .await
                .unwrap();
        }
        let mut conns = Vec::new();
        for _ in 0..3 {
            conns.push(next_connection(&mut connections).await);
        }

        registry.shutdown().await.unwrap();

        assert!(conns.iter().all(MockConnection::is_closed));
        assert!(registry.is_cancelled());
        assert!(registry
            .start_stream(StreamKey::new("m9", "s9"), "wss://signaling/9".to_string())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stuck_teardown_does_not_block_other_streams() {
        let (factory, mut connections) = MockTransportFactory::new();
        factory.stall_close();
        let registry = StreamRegistryHandle::new(context(factory));
        let stuck = StreamKey::new("m1", "s1");

        registry
            .start_stream(stuck.clone(), "wss://signaling/1".to_string())
            .await
            .unwrap();
        let _stuck_conn = next_connection(&mut connections).await;
        let stuck_session = registry.lookup(stuck.clone()).await.unwrap();

        let stopping = tokio::spawn({
            let registry = registry.clone();
            async move { registry.stop_stream(stuck).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Other streams are served while the stuck session is still closing.
        let prompt = Duration::from_millis(200);
        let generation = tokio::time::timeout(
            prompt,
            registry.start_stream(StreamKey::new("m2", "s2"), "wss://signaling/2".to_string()),
        )
        .await
        .expect("registry blocked behind a stuck teardown")
        .unwrap();
        assert_eq!(generation, 2);
        let status = tokio::time::timeout(prompt, registry.status())
            .await
            .expect("registry blocked behind a stuck teardown")
            .unwrap();
        assert_eq!(status.session_count, 1);
        assert!(!stopping.is_finished());

        // Signaling bounds its own close, so it finishes instead of being aborted.
        tokio::time::timeout(WAIT, stopping)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            stuck_session.signaling_state(),
            SignalingState::Closed {
                reason: CloseReason::Stopped
            }
        );

        registry.cancel();
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_sessions() {
        let (registry, mut connections) = registry();
        let key = StreamKey::new("m1", "s1");

        registry
            .start_stream(key.clone(), "wss://signaling/1".to_string())
            .await
            .unwrap();
        let _conn = next_connection(&mut connections).await;
        let session = registry.lookup(key).await.unwrap();

        registry.cancel();

        let reason = tokio::time::timeout(WAIT, session.closed()).await.unwrap();
        assert_eq!(reason, CloseReason::Stopped);
    }
}
