//! Peer connection abstraction
//!
//! The session controller talks to its connection only through
//! [`PeerTransport`], created by a [`PeerConnectionFactory`]. Asynchronous
//! notifications (state changes, gathered candidates, remote tracks) arrive
//! on the [`PeerEvent`] channel handed out alongside the transport.
//!
//! ```text
//! SessionController
//!        |
//!        v
//! PeerConnectionFactory::create()  --->  PeerHandle { transport, events }
//!        |                                      |
//!        v                                      v
//! PeerTransport (SDP / ICE / stats)     mpsc<PeerEvent> (state, candidates, tracks)
//! ```

pub mod rtc;
pub mod types;

pub use rtc::RtcPeerFactory;
pub use types::{
    ConnectionState, IceCandidate, IceConnectionState, MediaKind, RawStat, RemoteTrackInfo,
    SdpType, SessionDescription, TrackSender,
};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::IceServerConfig;
use crate::error::Result;
use crate::media::LocalTrack;

/// Asynchronous notification from a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Aggregate connection state changed
    ConnectionState(ConnectionState),
    /// ICE transport state changed
    IceConnectionState(IceConnectionState),
    /// Local candidate gathered (trickle ICE)
    IceCandidate(IceCandidate),
    /// Inbound track negotiated
    RemoteTrack(RemoteTrackInfo),
}

/// Operations the session controller performs on its connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Unique connection id (for logging and identity checks)
    fn id(&self) -> &str;

    /// Add a local track; returns the sender that carries it
    async fn add_track(&self, track: &LocalTrack) -> Result<TrackSender>;

    /// Cap the encoded bitrate of one sender
    async fn set_max_bitrate(&self, sender: &TrackSender, max_bitrate_bps: u64) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote ICE candidate (requires a remote description)
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Restart ICE on this connection (same object, new credentials)
    async fn restart_ice(&self) -> Result<()>;

    /// Raw statistics report
    async fn get_stats(&self) -> Result<Vec<RawStat>>;

    async fn close(&self) -> Result<()>;
}

/// A freshly created connection and its event stream
pub struct PeerHandle {
    pub transport: Arc<dyn PeerTransport>,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

/// Creates peer connections from the process-wide ICE configuration
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, ice_servers: &[IceServerConfig]) -> Result<PeerHandle>;
}
