//! Streaming session controller
//!
//! Owns at most one [`StreamSession`] (broadcaster or viewer) and drives it
//! through the lifecycle in [`SessionState`]. Every mutation, whether it comes
//! from a control call, a signaling message or a peer event, runs while
//! holding the session mutex, so handlers never interleave.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::state::{Role, SessionState, Trigger};
use crate::config::{AppConfig, IceServerConfig};
use crate::error::{AppError, Result};
use crate::events::{EventBus, EventKind, HandlerId, SessionEvent};
use crate::media::{MediaConstraints, MediaDevices, MediaPipeline};
use crate::peer::{
    ConnectionState, IceCandidate, PeerConnectionFactory, PeerEvent, PeerHandle, PeerTransport,
    RemoteTrackInfo, SdpType, SessionDescription,
};
use crate::signaling::{SignalingMessage, SignalingSink};
use crate::stats::StatsMonitor;

/// Identity of the active session, readable without the session lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub stream_id: String,
    pub role: Role,
    pub viewer_id: Option<String>,
}

/// One active streaming engagement
struct StreamSession {
    stream_id: String,
    role: Role,
    viewer_id: Option<String>,
    /// Viewer the relay addressed its last offer for (broadcaster side)
    remote_viewer_id: Option<String>,
    generation: u64,
    peer: Arc<dyn PeerTransport>,
    remote_tracks: Vec<RemoteTrackInfo>,
    pending_candidates: Vec<IceCandidate>,
    has_remote_description: bool,
    negotiated: bool,
    transport_connected: bool,
    ice_restarts: u32,
    stats: Option<StatsMonitor>,
    peer_task: JoinHandle<()>,
    token: CancellationToken,
}

impl StreamSession {
    /// Viewer id to put on outbound negotiation messages
    fn route_viewer_id(&self) -> Option<String> {
        match self.role {
            Role::Viewer => self.viewer_id.clone(),
            Role::Broadcaster => self.remote_viewer_id.clone(),
        }
    }

    async fn teardown(mut self) {
        self.token.cancel();
        if let Some(stats) = self.stats.take() {
            stats.stop();
        }
        self.peer_task.abort();
        if let Err(e) = self.peer.close().await {
            warn!("Failed to close peer {}: {}", self.peer.id(), e);
        }
        debug!(
            "Session {} torn down ({} remote tracks)",
            self.stream_id,
            self.remote_tracks.len()
        );
    }
}

struct Inner {
    state: SessionState,
    session: Option<StreamSession>,
    pipeline: MediaPipeline,
}

/// Run `fut` unless `token` is cancelled first
async fn cancellable<T>(token: &CancellationToken, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

fn negotiation_error(step: &str, err: AppError) -> AppError {
    match err {
        AppError::Negotiation(_) | AppError::Cancelled => err,
        other => AppError::Negotiation(format!("{}: {}", step, other)),
    }
}

/// Top-level orchestrator for one streaming session
pub struct SessionController {
    config: Arc<AppConfig>,
    ice_servers: Arc<[IceServerConfig]>,
    events: Arc<EventBus>,
    signaling: Arc<dyn SignalingSink>,
    peers: Arc<dyn PeerConnectionFactory>,
    inner: Mutex<Inner>,
    /// Token of the in-flight start/join; cancelled by stop/leave
    operation: SyncMutex<CancellationToken>,
    /// Token of the live session; cancelling it aborts pending negotiation
    /// so teardown can take the lock
    session_token: SyncMutex<CancellationToken>,
    generation: AtomicU64,
    state_tx: watch::Sender<SessionState>,
    info: RwLock<Option<SessionInfo>>,
    weak_self: Weak<SessionController>,
}

impl SessionController {
    pub fn new(
        config: Arc<AppConfig>,
        ice_servers: Arc<[IceServerConfig]>,
        events: Arc<EventBus>,
        signaling: Arc<dyn SignalingSink>,
        peers: Arc<dyn PeerConnectionFactory>,
        devices: Arc<dyn MediaDevices>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Arc::new_cyclic(|weak_self| Self {
            config,
            ice_servers,
            events,
            signaling,
            peers,
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                session: None,
                pipeline: MediaPipeline::new(devices),
            }),
            operation: SyncMutex::new(CancellationToken::new()),
            session_token: SyncMutex::new(CancellationToken::new()),
            generation: AtomicU64::new(0),
            state_tx,
            info: RwLock::new(None),
            weak_self: weak_self.clone(),
        })
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn info(&self) -> Option<SessionInfo> {
        self.info.read().clone()
    }

    pub fn stream_id(&self) -> Option<String> {
        self.info.read().as_ref().map(|i| i.stream_id.clone())
    }

    pub fn role(&self) -> Option<Role> {
        self.info.read().as_ref().map(|i| i.role)
    }

    pub fn viewer_id(&self) -> Option<String> {
        self.info.read().as_ref().and_then(|i| i.viewer_id.clone())
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Register an event handler
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&SessionEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, kind: EventKind, id: HandlerId) -> bool {
        self.events.off(kind, id)
    }

    // ------------------------------------------------------------------
    // Control API
    // ------------------------------------------------------------------

    /// Start broadcasting `stream_id`
    ///
    /// Any previous session is torn down first. On failure no connection or
    /// media is left allocated.
    pub async fn start_streaming(&self, stream_id: &str, constraints: MediaConstraints) -> Result<()> {
        if stream_id.is_empty() {
            return Err(AppError::InvalidOperation("stream_id must not be empty".to_string()));
        }
        let token = self.begin_operation();
        let mut inner = cancellable(&token, async { Ok(self.inner.lock().await) }).await?;
        self.replace_previous(&mut inner, stream_id).await?;

        let result = self.publish(&mut inner, stream_id, constraints, &token).await;
        if let Err(e) = &result {
            self.report_operation_error(stream_id, "start streaming", e);
        }
        result
    }

    /// Stop broadcasting; a no-op when nothing is live
    pub async fn stop_streaming(&self) -> Result<()> {
        self.operation.lock().cancel();
        if self.role() == Some(Role::Broadcaster) {
            self.session_token.lock().cancel();
        }
        let mut inner = self.inner.lock().await;
        match inner.session.as_ref().map(|s| s.role) {
            None => {
                debug!("stop_streaming: no live session");
                Ok(())
            }
            Some(Role::Viewer) => Err(AppError::InvalidOperation(
                "stop_streaming called on a viewer session, use leave_stream".to_string(),
            )),
            Some(Role::Broadcaster) => {
                self.close_session(&mut inner, true).await;
                Ok(())
            }
        }
    }

    /// Join `stream_id` as a viewer
    pub async fn join_stream(&self, stream_id: &str) -> Result<()> {
        if stream_id.is_empty() {
            return Err(AppError::InvalidOperation("stream_id must not be empty".to_string()));
        }
        let token = self.begin_operation();
        let mut inner = cancellable(&token, async { Ok(self.inner.lock().await) }).await?;
        self.replace_previous(&mut inner, stream_id).await?;

        let result = self.view(&mut inner, stream_id, &token).await;
        if let Err(e) = &result {
            self.report_operation_error(stream_id, "join stream", e);
        }
        result
    }

    /// Leave the viewed stream; a no-op when nothing is live
    pub async fn leave_stream(&self) -> Result<()> {
        self.operation.lock().cancel();
        if self.role() == Some(Role::Viewer) {
            self.session_token.lock().cancel();
        }
        let mut inner = self.inner.lock().await;
        match inner.session.as_ref().map(|s| s.role) {
            None => {
                debug!("leave_stream: no live session");
                Ok(())
            }
            Some(Role::Broadcaster) => Err(AppError::InvalidOperation(
                "leave_stream called on a broadcaster session, use stop_streaming".to_string(),
            )),
            Some(Role::Viewer) => {
                self.close_session(&mut inner, true).await;
                Ok(())
            }
        }
    }

    /// Re-cap every video sender of the active broadcast
    pub async fn set_max_bitrate(&self, max_bitrate_bps: u64) -> Result<()> {
        if max_bitrate_bps == 0 {
            return Err(AppError::InvalidOperation("bitrate cap must be positive".to_string()));
        }
        let inner = self.inner.lock().await;
        let peer = match inner.session.as_ref() {
            Some(session) if session.role == Role::Broadcaster => session.peer.clone(),
            Some(_) => {
                return Err(AppError::InvalidOperation(
                    "bitrate cap only applies to a broadcast".to_string(),
                ))
            }
            None => return Err(AppError::InvalidOperation("no live session".to_string())),
        };
        inner.pipeline.apply_bitrate_cap(peer.as_ref(), max_bitrate_bps).await?;
        Ok(())
    }

    /// Dispatch signaling messages from `rx` one at a time
    pub fn attach_signaling(&self, mut rx: mpsc::UnboundedReceiver<SignalingMessage>) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_message(message).await;
            }
            debug!("Signaling dispatcher stopped");
        })
    }

    /// Handle one inbound signaling message
    ///
    /// Failures are reported as `streaming-error` events.
    pub async fn handle_message(&self, message: SignalingMessage) {
        let stream_id = message.stream_id().map(str::to_string);
        let kind = message.type_name();
        let mut inner = self.inner.lock().await;
        match self.dispatch_message(&mut inner, message).await {
            Ok(()) => {}
            Err(AppError::Cancelled) => debug!("{} handling cancelled by teardown", kind),
            Err(e) => {
                warn!("Failed to handle {} message: {}", kind, e);
                self.events.emit(SessionEvent::error(stream_id.as_deref(), &e));
            }
        }
    }

    /// Handle one peer event of the connection created for `generation`
    pub async fn handle_peer_event(&self, generation: u64, event: PeerEvent) {
        let mut inner = self.inner.lock().await;
        let current = inner.session.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            debug!("Dropping stale peer event from generation {}", generation);
            return;
        }
        match self.dispatch_peer_event(&mut inner, event).await {
            Ok(()) => {}
            Err(AppError::Cancelled) => debug!("Peer event handling cancelled by teardown"),
            Err(e) => {
                let stream_id = inner.session.as_ref().map(|s| s.stream_id.clone());
                warn!("Peer event handling failed: {}", e);
                self.events.emit(SessionEvent::error(stream_id.as_deref(), &e));
            }
        }
    }

    // ------------------------------------------------------------------
    // Session setup and teardown
    // ------------------------------------------------------------------

    fn begin_operation(&self) -> CancellationToken {
        // The live session is about to be replaced
        self.session_token.lock().cancel();
        let token = CancellationToken::new();
        *self.operation.lock() = token.clone();
        token
    }

    fn report_operation_error(&self, stream_id: &str, operation: &str, err: &AppError) {
        if matches!(err, AppError::Cancelled) {
            info!("{} {} cancelled", operation, stream_id);
            return;
        }
        warn!("Failed to {} {}: {}", operation, stream_id, err);
        self.events.emit(SessionEvent::error(Some(stream_id), err));
    }

    /// Close whatever is live and return to `Idle`
    async fn replace_previous(&self, inner: &mut Inner, stream_id: &str) -> Result<()> {
        if let Some(previous) = inner.session.as_ref() {
            info!("Replacing live session {} with {}", previous.stream_id, stream_id);
            self.close_session(inner, true).await;
        }
        self.transition(inner, stream_id, Trigger::Reset)?;
        Ok(())
    }

    async fn create_peer(&self, token: &CancellationToken) -> Result<PeerHandle> {
        cancellable(token, self.peers.create(&self.ice_servers)).await
    }

    async fn publish(
        &self,
        inner: &mut Inner,
        stream_id: &str,
        constraints: MediaConstraints,
        token: &CancellationToken,
    ) -> Result<()> {
        cancellable(token, inner.pipeline.acquire(&constraints)).await?;

        let PeerHandle { transport, events } = match self.create_peer(token).await {
            Ok(handle) => handle,
            Err(e) => {
                inner.pipeline.release();
                return Err(e);
            }
        };

        let attached = async {
            inner.pipeline.attach(transport.as_ref()).await?;
            inner
                .pipeline
                .apply_bitrate_cap(transport.as_ref(), self.config.media.max_video_bitrate_bps())
                .await
        };
        let attached = cancellable(token, attached).await;
        if let Err(e) = attached {
            inner.pipeline.release();
            if let Err(close_err) = transport.close().await {
                warn!("Failed to close peer {}: {}", transport.id(), close_err);
            }
            return Err(e);
        }

        self.install_session(inner, stream_id, Role::Broadcaster, None, transport, events);
        self.transition(inner, stream_id, Trigger::Publish)?;

        self.signaling.send(SignalingMessage::StartStreaming {
            stream_id: stream_id.to_string(),
            constraints,
        });
        info!("Streaming started: {}", stream_id);
        self.events.emit(SessionEvent::StreamingStarted {
            stream_id: stream_id.to_string(),
        });
        Ok(())
    }

    async fn view(&self, inner: &mut Inner, stream_id: &str, token: &CancellationToken) -> Result<()> {
        let viewer_id = uuid::Uuid::new_v4().to_string();
        let PeerHandle { transport, events } = self.create_peer(token).await?;

        self.install_session(
            inner,
            stream_id,
            Role::Viewer,
            Some(viewer_id.clone()),
            transport,
            events,
        );
        self.transition(inner, stream_id, Trigger::View)?;

        self.signaling.send(SignalingMessage::JoinStream {
            stream_id: stream_id.to_string(),
            viewer_id: viewer_id.clone(),
        });
        info!("Joined stream {} as viewer {}", stream_id, viewer_id);
        self.events.emit(SessionEvent::StreamJoined {
            stream_id: stream_id.to_string(),
            viewer_id,
        });
        Ok(())
    }

    fn install_session(
        &self,
        inner: &mut Inner,
        stream_id: &str,
        role: Role,
        viewer_id: Option<String>,
        peer: Arc<dyn PeerTransport>,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let peer_task = self.spawn_peer_events(generation, peer_events);
        let token = CancellationToken::new();
        *self.session_token.lock() = token.clone();

        *self.info.write() = Some(SessionInfo {
            stream_id: stream_id.to_string(),
            role,
            viewer_id: viewer_id.clone(),
        });
        inner.session = Some(StreamSession {
            stream_id: stream_id.to_string(),
            role,
            viewer_id,
            remote_viewer_id: None,
            generation,
            peer,
            remote_tracks: Vec::new(),
            pending_candidates: Vec::new(),
            has_remote_description: false,
            negotiated: false,
            transport_connected: false,
            ice_restarts: 0,
            stats: None,
            peer_task,
            token,
        });
    }

    fn spawn_peer_events(&self, generation: u64, mut rx: mpsc::UnboundedReceiver<PeerEvent>) -> JoinHandle<()> {
        let weak = self.weak_self.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_peer_event(generation, event).await;
            }
        })
    }

    /// Release resources of the live session
    async fn teardown(&self, inner: &mut Inner) -> Option<(String, Role, Option<String>)> {
        let session = inner.session.take()?;
        let identity = (session.stream_id.clone(), session.role, session.viewer_id.clone());
        inner.pipeline.release();
        session.teardown().await;
        *self.info.write() = None;
        Some(identity)
    }

    /// Move the live session to `Closed`
    async fn close_session(&self, inner: &mut Inner, notify_server: bool) {
        let Some(stream_id) = inner.session.as_ref().map(|s| s.stream_id.clone()) else {
            return;
        };
        if let Err(e) = self.transition(inner, &stream_id, Trigger::Close) {
            warn!("Closing session {}: {}", stream_id, e);
        }
        let Some((stream_id, role, viewer_id)) = self.teardown(inner).await else {
            return;
        };

        match role {
            Role::Broadcaster => {
                if notify_server {
                    self.signaling.send(SignalingMessage::StopStreaming {
                        stream_id: stream_id.clone(),
                    });
                }
                info!("Streaming stopped: {}", stream_id);
                self.events.emit(SessionEvent::StreamingStopped { stream_id });
            }
            Role::Viewer => {
                let viewer_id = viewer_id.unwrap_or_default();
                if notify_server {
                    self.signaling.send(SignalingMessage::LeaveStream {
                        stream_id: stream_id.clone(),
                        viewer_id: viewer_id.clone(),
                    });
                }
                info!("Left stream {}", stream_id);
                self.events.emit(SessionEvent::StreamLeft {
                    stream_id,
                    viewer_id,
                });
            }
        }
    }

    /// Move the live session to `Failed` and tear it down
    async fn fail_session(&self, inner: &mut Inner, err: AppError) {
        let Some(stream_id) = inner.session.as_ref().map(|s| s.stream_id.clone()) else {
            return;
        };
        warn!("Session {} failed: {}", stream_id, err);
        if let Err(e) = self.transition(inner, &stream_id, Trigger::Fail) {
            warn!("Failing session {}: {}", stream_id, e);
        }
        if let Some((stream_id, role, viewer_id)) = self.teardown(inner).await {
            match role {
                Role::Broadcaster => self.signaling.send(SignalingMessage::StopStreaming {
                    stream_id: stream_id.clone(),
                }),
                Role::Viewer => self.signaling.send(SignalingMessage::LeaveStream {
                    stream_id: stream_id.clone(),
                    viewer_id: viewer_id.unwrap_or_default(),
                }),
            };
        }
        self.events.emit(SessionEvent::error(Some(stream_id.as_str()), &err));
    }

    fn transition(&self, inner: &mut Inner, stream_id: &str, trigger: Trigger) -> Result<SessionState> {
        let from = inner.state;
        let to = from.next(trigger)?;
        inner.state = to;
        self.state_tx.send_replace(to);
        if from != to {
            debug!("Session {}: {} -> {} ({})", stream_id, from, to, trigger);
            self.events.emit(SessionEvent::SessionStateChange {
                stream_id: stream_id.to_string(),
                from,
                to,
            });
        }
        Ok(to)
    }

    // ------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------

    /// Active session if `stream_id` matches it
    fn matching_session<'a>(inner: &'a mut Inner, stream_id: &str, kind: &str) -> Option<&'a mut StreamSession> {
        match inner.session.as_mut() {
            Some(session) if session.stream_id == stream_id => Some(session),
            Some(session) => {
                warn!(
                    "Ignoring {} for stream {} (active stream is {})",
                    kind, stream_id, session.stream_id
                );
                None
            }
            None => {
                warn!("Ignoring {} for stream {}: no live session", kind, stream_id);
                None
            }
        }
    }

    async fn dispatch_message(&self, inner: &mut Inner, message: SignalingMessage) -> Result<()> {
        match message {
            SignalingMessage::Offer {
                stream_id,
                offer,
                viewer_id,
            } => self.handle_offer(inner, &stream_id, offer, viewer_id).await,
            SignalingMessage::Answer { stream_id, answer, .. } => {
                self.handle_answer(inner, &stream_id, answer).await
            }
            SignalingMessage::IceCandidate {
                stream_id, candidate, ..
            } => self.handle_remote_candidate(inner, &stream_id, candidate).await,
            SignalingMessage::StreamStarted { stream_id } => {
                self.events.emit(SessionEvent::StreamStarted { stream_id });
                Ok(())
            }
            SignalingMessage::StreamEnded { stream_id } => {
                self.events.emit(SessionEvent::StreamEnded {
                    stream_id: stream_id.clone(),
                });
                let viewing = inner
                    .session
                    .as_ref()
                    .is_some_and(|s| s.role == Role::Viewer && s.stream_id == stream_id);
                if viewing {
                    info!("Stream {} ended by broadcaster", stream_id);
                    self.close_session(inner, false).await;
                }
                Ok(())
            }
            SignalingMessage::ViewerJoined { stream_id, viewer_id } => {
                self.events.emit(SessionEvent::ViewerJoined { stream_id, viewer_id });
                Ok(())
            }
            SignalingMessage::ViewerLeft { stream_id, viewer_id } => {
                self.events.emit(SessionEvent::ViewerLeft { stream_id, viewer_id });
                Ok(())
            }
            SignalingMessage::Error { stream_id, error } => {
                warn!("Signaling server error: {}", error);
                self.events.emit(SessionEvent::StreamingError {
                    stream_id,
                    kind: "server".to_string(),
                    message: error,
                });
                Ok(())
            }
            other => {
                debug!("Ignoring outbound-only message {}", other.type_name());
                Ok(())
            }
        }
    }

    /// Answer an inbound offer on the existing connection
    async fn handle_offer(
        &self,
        inner: &mut Inner,
        stream_id: &str,
        offer: SessionDescription,
        viewer_id: Option<String>,
    ) -> Result<()> {
        if offer.sdp_type != SdpType::Offer {
            return Err(AppError::Negotiation(format!(
                "expected an offer, got {:?}",
                offer.sdp_type
            )));
        }
        let Some(session) = Self::matching_session(inner, stream_id, "offer") else {
            return Ok(());
        };
        if viewer_id.is_some() {
            session.remote_viewer_id = viewer_id;
        }
        let peer = session.peer.clone();
        let token = session.token.clone();

        cancellable(&token, peer.set_remote_description(offer))
            .await
            .map_err(|e| negotiation_error("set remote offer", e))?;
        session.has_remote_description = true;
        self.flush_pending_candidates(session).await?;

        let answer = cancellable(&token, peer.create_answer())
            .await
            .map_err(|e| negotiation_error("create answer", e))?;
        cancellable(&token, peer.set_local_description(answer.clone()))
            .await
            .map_err(|e| negotiation_error("set local answer", e))?;

        self.signaling.send(SignalingMessage::Answer {
            stream_id: stream_id.to_string(),
            answer,
            viewer_id: session.route_viewer_id(),
        });
        session.negotiated = true;
        debug!("Answered offer for {}", stream_id);

        self.maybe_connected(inner)
    }

    async fn handle_answer(&self, inner: &mut Inner, stream_id: &str, answer: SessionDescription) -> Result<()> {
        if answer.sdp_type != SdpType::Answer && answer.sdp_type != SdpType::Pranswer {
            return Err(AppError::Negotiation(format!(
                "expected an answer, got {:?}",
                answer.sdp_type
            )));
        }
        let Some(session) = Self::matching_session(inner, stream_id, "answer") else {
            return Ok(());
        };
        let token = session.token.clone();
        cancellable(&token, session.peer.set_remote_description(answer))
            .await
            .map_err(|e| negotiation_error("set remote answer", e))?;
        session.has_remote_description = true;
        self.flush_pending_candidates(session).await?;
        session.negotiated = true;

        self.maybe_connected(inner)
    }

    async fn handle_remote_candidate(&self, inner: &mut Inner, stream_id: &str, candidate: IceCandidate) -> Result<()> {
        if inner.session.is_none() {
            return Err(AppError::Negotiation(format!(
                "ICE candidate for {} with no live session",
                stream_id
            )));
        }
        let Some(session) = Self::matching_session(inner, stream_id, "ice-candidate") else {
            return Ok(());
        };

        if !session.has_remote_description {
            let limit = self.config.negotiation.max_pending_candidates;
            if session.pending_candidates.len() >= limit {
                return Err(AppError::Negotiation(format!(
                    "more than {} ICE candidates before a remote description",
                    limit
                )));
            }
            debug!("Buffering early ICE candidate for {}", stream_id);
            session.pending_candidates.push(candidate);
            return Ok(());
        }

        cancellable(&session.token, session.peer.add_ice_candidate(candidate))
            .await
            .map_err(|e| negotiation_error("add ICE candidate", e))
    }

    /// Apply buffered candidates in arrival order; stops only on cancellation
    async fn flush_pending_candidates(&self, session: &mut StreamSession) -> Result<()> {
        if session.pending_candidates.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut session.pending_candidates);
        debug!("Applying {} buffered ICE candidates", pending.len());
        for candidate in pending {
            match cancellable(&session.token, session.peer.add_ice_candidate(candidate)).await {
                Ok(()) => {}
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    let err = negotiation_error("add buffered ICE candidate", e);
                    warn!("{}", err);
                    self.events.emit(SessionEvent::error(Some(session.stream_id.as_str()), &err));
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer events
    // ------------------------------------------------------------------

    async fn dispatch_peer_event(&self, inner: &mut Inner, event: PeerEvent) -> Result<()> {
        let Some(session) = inner.session.as_mut() else {
            return Ok(());
        };
        let stream_id = session.stream_id.clone();

        match event {
            PeerEvent::ConnectionState(state) => {
                self.events.emit(SessionEvent::ConnectionStateChange {
                    stream_id,
                    state,
                });
                match state {
                    ConnectionState::Connected => {
                        session.transport_connected = true;
                        self.maybe_connected(inner)
                    }
                    ConnectionState::Failed => {
                        session.transport_connected = false;
                        self.on_connection_failed(inner).await
                    }
                    ConnectionState::Disconnected => {
                        debug!("Connection for {} disconnected, waiting for recovery", session.stream_id);
                        Ok(())
                    }
                    ConnectionState::Closed => {
                        let err = AppError::ConnectionFailure("peer connection closed".to_string());
                        self.fail_session(inner, err).await;
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            PeerEvent::IceConnectionState(state) => {
                self.events.emit(SessionEvent::IceConnectionStateChange {
                    stream_id,
                    state,
                });
                Ok(())
            }
            PeerEvent::IceCandidate(candidate) => {
                self.signaling.send(SignalingMessage::IceCandidate {
                    stream_id,
                    candidate,
                    viewer_id: session.route_viewer_id(),
                });
                Ok(())
            }
            PeerEvent::RemoteTrack(track) => {
                info!("Remote {} track {} on {}", track.kind, track.track_id, stream_id);
                session.remote_tracks.push(track.clone());
                self.events.emit(SessionEvent::RemoteStream { stream_id, track });
                Ok(())
            }
        }
    }

    /// Enter `Connected` once negotiated and the transport is up
    fn maybe_connected(&self, inner: &mut Inner) -> Result<()> {
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        if !(session.negotiated && session.transport_connected) {
            return Ok(());
        }
        if !matches!(
            inner.state,
            SessionState::Publishing | SessionState::Viewing | SessionState::Reconnecting
        ) {
            return Ok(());
        }

        let stream_id = session.stream_id.clone();
        let recovered = inner.state == SessionState::Reconnecting;
        self.transition(inner, &stream_id, Trigger::TransportUp)?;

        let Some(session) = inner.session.as_mut() else {
            return Ok(());
        };
        if recovered {
            info!("Session {} recovered after {} ICE restarts", stream_id, session.ice_restarts);
            session.ice_restarts = 0;
        } else {
            info!("Session {} connected", stream_id);
        }
        if session.stats.is_none() {
            session.stats = Some(StatsMonitor::start(
                session.peer.clone(),
                self.events.clone(),
                stream_id,
                Duration::from_millis(self.config.stats.interval_ms),
                session.token.child_token(),
            ));
        }
        Ok(())
    }

    async fn on_connection_failed(&self, inner: &mut Inner) -> Result<()> {
        let max_restarts = self.config.recovery.max_ice_restarts;
        let state = inner.state;
        let Some(session) = inner.session.as_ref() else {
            return Ok(());
        };
        let stream_id = session.stream_id.clone();

        match state {
            SessionState::Connected | SessionState::Reconnecting => {
                if state == SessionState::Reconnecting
                    && max_restarts > 0
                    && session.ice_restarts >= max_restarts
                {
                    let err = AppError::ConnectionFailure(format!(
                        "gave up after {} ICE restarts",
                        session.ice_restarts
                    ));
                    self.fail_session(inner, err).await;
                    return Ok(());
                }

                self.transition(inner, &stream_id, Trigger::TransportFailed)?;
                let Some(session) = inner.session.as_mut() else {
                    return Ok(());
                };
                session.ice_restarts += 1;
                let attempt = session.ice_restarts;
                warn!("Connection for {} failed, ICE restart attempt {}", stream_id, attempt);
                self.events.emit(SessionEvent::ConnectionFailed {
                    stream_id: stream_id.clone(),
                    attempt,
                });

                match cancellable(&session.token, session.peer.restart_ice()).await {
                    Ok(()) | Err(AppError::Cancelled) => Ok(()),
                    Err(e) => Err(AppError::ConnectionFailure(format!("ICE restart failed: {}", e))),
                }
            }
            SessionState::Publishing | SessionState::Viewing => {
                let err = AppError::ConnectionFailure("connection failed before it was established".to_string());
                self.fail_session(inner, err).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
