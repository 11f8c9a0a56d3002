//! In-memory peer, device and signaling doubles for tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::config::IceServerConfig;
use crate::error::{AppError, Result};
use crate::media::{LocalMedia, LocalTrack, MediaConstraints, MediaDevices, MediaError};
use crate::peer::{
    IceCandidate, MediaKind, PeerConnectionFactory, PeerEvent, PeerHandle, PeerTransport, RawStat,
    SessionDescription, TrackSender,
};
use crate::signaling::{SignalingMessage, SignalingSink};

pub const ANSWER_SDP: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=answer\r\n";

pub struct MockPeer {
    id: String,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    live: Option<Arc<AtomicUsize>>,
    tracks: Mutex<Vec<String>>,
    caps: Mutex<Vec<u64>>,
    remote: Mutex<Option<SessionDescription>>,
    local: Mutex<Option<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    restarts: AtomicU32,
    closed: AtomicBool,
    stats: Mutex<std::result::Result<Vec<RawStat>, String>>,
    stats_calls: AtomicUsize,
    stall_answer: AtomicBool,
}

impl MockPeer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self::build(id, None, None))
    }

    fn build(id: &str, events: Option<mpsc::UnboundedSender<PeerEvent>>, live: Option<Arc<AtomicUsize>>) -> Self {
        Self {
            id: id.to_string(),
            events: Mutex::new(events),
            live,
            tracks: Mutex::new(Vec::new()),
            caps: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            local: Mutex::new(None),
            candidates: Mutex::new(Vec::new()),
            restarts: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            stats: Mutex::new(Ok(Vec::new())),
            stats_calls: AtomicUsize::new(0),
            stall_answer: AtomicBool::new(false),
        }
    }

    /// Push an event as if the connection produced it
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.events
            .lock()
            .as_ref()
            .map(|tx| tx.send(event).is_ok())
            .unwrap_or(false)
    }

    pub fn set_stats(&self, stats: std::result::Result<Vec<RawStat>, String>) {
        *self.stats.lock() = stats;
    }

    /// Make `create_answer` never complete
    pub fn stall_answer(&self) {
        self.stall_answer.store(true, Ordering::SeqCst);
    }

    pub fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.lock().len()
    }

    pub fn bitrate_caps(&self) -> Vec<u64> {
        self.caps.lock().clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.remote.lock().clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.local.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<TrackSender> {
        let mut tracks = self.tracks.lock();
        tracks.push(track.id().to_string());
        Ok(TrackSender {
            id: format!("{}-sender-{}", self.id, tracks.len()),
            track_id: track.id().to_string(),
            kind: track.kind(),
        })
    }

    async fn set_max_bitrate(&self, _sender: &TrackSender, max_bitrate_bps: u64) -> Result<()> {
        self.caps.lock().push(max_bitrate_bps);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        if !desc.sdp.starts_with("v=0") {
            return Err(AppError::Negotiation("malformed SDP".to_string()));
        }
        *self.remote.lock() = Some(desc);
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        if self.stall_answer.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.remote.lock().is_none() {
            return Err(AppError::Negotiation("no remote description".to_string()));
        }
        Ok(SessionDescription::answer(ANSWER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        *self.local.lock() = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.remote.lock().is_none() {
            return Err(AppError::Negotiation(
                "candidate applied before remote description".to_string(),
            ));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> Result<()> {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_stats(&self) -> Result<Vec<RawStat>> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        self.stats.lock().clone().map_err(AppError::WebRtc)
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(live) = &self.live {
                live.fetch_sub(1, Ordering::SeqCst);
            }
            self.events.lock().take();
        }
        Ok(())
    }
}

/// Factory that counts live connections
#[derive(Default)]
pub struct MockPeerFactory {
    created: Mutex<Vec<Arc<MockPeer>>>,
    live: Arc<AtomicUsize>,
    fail: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn live_connections(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }

    pub fn peer(&self, index: usize) -> Arc<MockPeer> {
        self.created.lock()[index].clone()
    }

    pub fn last_peer(&self) -> Arc<MockPeer> {
        self.created.lock().last().cloned().expect("no peer created")
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(&self, _ice_servers: &[IceServerConfig]) -> Result<PeerHandle> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AppError::WebRtc("peer connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut created = self.created.lock();
        let peer = Arc::new(MockPeer::build(
            &format!("peer-{}", created.len() + 1),
            Some(tx),
            Some(self.live.clone()),
        ));
        self.live.fetch_add(1, Ordering::SeqCst);
        created.push(peer.clone());
        Ok(PeerHandle {
            transport: peer,
            events: rx,
        })
    }
}

/// Devices that fail with a fixed error, or hand out tracks without a lease
#[derive(Default)]
pub struct MockDevices {
    error: Mutex<Option<MediaError>>,
    acquisitions: AtomicUsize,
}

impl MockDevices {
    pub fn failing(error: MediaError) -> Arc<Self> {
        Arc::new(Self {
            error: Mutex::new(Some(error)),
            acquisitions: AtomicUsize::new(0),
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaDevices for MockDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.error.lock().clone() {
            return Err(error.into());
        }
        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, "mock")));
        }
        if constraints.audio.is_some() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, "mock")));
        }
        Ok(LocalMedia::new(tracks, constraints.clone(), None))
    }
}

/// Signaling sink that records what was sent
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingMessage>>,
    open: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        })
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|m| m.type_name()).collect()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }

    /// Drop every message sent from now on, as a closed socket does
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, message: SignalingMessage) -> bool {
        if !self.open.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().push(message);
        true
    }
}
