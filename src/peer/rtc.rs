//! webrtc-rs backed peer connection

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;

use super::types::{
    ConnectionState, IceCandidate, IceConnectionState, MediaKind, RawStat, RemoteTrackInfo,
    SdpType, SessionDescription, TrackSender,
};
use super::{PeerConnectionFactory, PeerEvent, PeerHandle, PeerTransport};
use crate::config::IceServerConfig;
use crate::error::{AppError, Result};
use crate::media::LocalTrack;

/// Builds webrtc-rs peer connections
#[derive(Debug, Default, Clone)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    pub fn new() -> Self {
        Self
    }
}

/// Convert configured ICE servers, skipping TURN entries without credentials
fn build_ice_servers(ice_servers: &[IceServerConfig]) -> Vec<RTCIceServer> {
    let mut servers = vec![];

    for server in ice_servers {
        if server.is_turn() && !server.has_credentials() {
            // webrtc-rs rejects TURN URLs without credentials
            warn!(
                "Skipping TURN server {:?} - credentials required but missing",
                server.urls
            );
            continue;
        }
        servers.push(RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        });
    }

    servers
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(&self, ice_servers: &[IceServerConfig]) -> Result<PeerHandle> {
        let id = uuid::Uuid::new_v4().to_string();

        // Create media engine
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| AppError::WebRtc(format!("Failed to register codecs: {}", e)))?;

        // Create interceptor registry
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| AppError::WebRtc(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: build_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = api
            .new_peer_connection(rtc_config)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to create peer connection: {}", e)))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peer = RtcPeer {
            id,
            pc: Arc::new(pc),
            senders: Mutex::new(HashMap::new()),
        };
        peer.setup_event_handlers(events_tx);

        info!("Peer connection {} created", peer.id);
        Ok(PeerHandle {
            transport: Arc::new(peer),
            events: events_rx,
        })
    }
}

/// Peer connection wrapper with event forwarding
pub struct RtcPeer {
    id: String,
    pc: Arc<RTCPeerConnection>,
    /// Senders by sender id
    senders: Mutex<HashMap<String, Arc<RTCRtpSender>>>,
}

impl RtcPeer {
    /// Set up peer connection event handlers
    fn setup_event_handlers(&self, events: mpsc::UnboundedSender<PeerEvent>) {
        let id = self.id.clone();
        let tx = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
                let id = id.clone();
                let tx = tx.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCPeerConnectionState::New => ConnectionState::New,
                        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                        RTCPeerConnectionState::Connected => ConnectionState::Connected,
                        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                        RTCPeerConnectionState::Failed => ConnectionState::Failed,
                        RTCPeerConnectionState::Closed => ConnectionState::Closed,
                        _ => return,
                    };

                    info!("Peer {} connection state: {}", id, state);
                    let _ = tx.send(PeerEvent::ConnectionState(state));
                })
            }));

        let id = self.id.clone();
        let tx = events.clone();
        self.pc
            .on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
                let id = id.clone();
                let tx = tx.clone();

                Box::pin(async move {
                    let state = match s {
                        RTCIceConnectionState::New => IceConnectionState::New,
                        RTCIceConnectionState::Checking => IceConnectionState::Checking,
                        RTCIceConnectionState::Connected => IceConnectionState::Connected,
                        RTCIceConnectionState::Completed => IceConnectionState::Completed,
                        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
                        RTCIceConnectionState::Failed => IceConnectionState::Failed,
                        RTCIceConnectionState::Closed => IceConnectionState::Closed,
                        _ => return,
                    };

                    debug!("[ICE] Peer {} connection state: {:?}", id, state);
                    let _ = tx.send(PeerEvent::IceConnectionState(state));
                })
            }));

        let tx = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let tx = tx.clone();

                Box::pin(async move {
                    if let Some(init) = candidate.and_then(|c| c.to_json().ok()) {
                        debug!("ICE candidate gathered: {}", init.candidate);
                        let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                })
            }));

        let id = self.id.clone();
        let tx = events;
        self.pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let id = id.clone();
            let tx = tx.clone();

            Box::pin(async move {
                let kind = match track.kind() {
                    RTPCodecType::Audio => MediaKind::Audio,
                    RTPCodecType::Video => MediaKind::Video,
                    _ => return,
                };
                let info = RemoteTrackInfo {
                    track_id: track.id(),
                    stream_label: track.stream_id(),
                    kind,
                    codec: track.codec().capability.mime_type,
                };

                info!("Peer {} remote {} track: {}", id, kind, info.track_id);
                let _ = tx.send(PeerEvent::RemoteTrack(info));
            })
        }));
    }

    fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription> {
        let parsed = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
            SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
            SdpType::Rollback => {
                return Err(AppError::Negotiation(
                    "Rollback descriptions are not supported".to_string(),
                ))
            }
        };
        parsed.map_err(|e| AppError::Negotiation(format!("Invalid SDP: {}", e)))
    }
}

fn media_kind(kind: &str) -> Option<MediaKind> {
    match kind {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    fn id(&self) -> &str {
        &self.id
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<TrackSender> {
        let rtp_track: Arc<dyn TrackLocal + Send + Sync> = track.rtp_track();
        let sender = self
            .pc
            .add_track(rtp_track)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to add {} track: {}", track.kind(), e)))?;

        // Drain RTCP so interceptors keep working
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        let handle = TrackSender {
            id: uuid::Uuid::new_v4().to_string(),
            track_id: track.id().to_string(),
            kind: track.kind(),
        };
        self.senders.lock().insert(handle.id.clone(), sender);
        info!("{} track {} added to peer {}", track.kind(), track.id(), self.id);

        Ok(handle)
    }

    async fn set_max_bitrate(&self, sender: &TrackSender, max_bitrate_bps: u64) -> Result<()> {
        if !self.senders.lock().contains_key(&sender.id) {
            return Err(AppError::WebRtc(format!("Unknown sender {}", sender.id)));
        }
        // webrtc-rs has no per-encoding parameters; the encoder feeding the
        // track reads the cap from LocalTrack::max_bitrate_bps
        debug!(
            "Peer {} sender {} capped at {} bps",
            self.id, sender.id, max_bitrate_bps
        );
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let sdp = Self::to_rtc_description(desc)?;
        self.pc
            .set_remote_description(sdp)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set remote description: {}", e)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to create answer: {}", e)))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let sdp = Self::to_rtc_description(desc)?;
        self.pc
            .set_local_description(sdp)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to set local description: {}", e)))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| AppError::Negotiation(format!("Failed to add ICE candidate: {}", e)))
    }

    async fn restart_ice(&self) -> Result<()> {
        // Fresh local credentials and a new gathering round on this same
        // connection; they reach the remote side with the next answer
        self.pc
            .restart_ice()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to restart ICE: {}", e)))?;
        info!("Peer {} ICE restarted", self.id);
        Ok(())
    }

    async fn get_stats(&self) -> Result<Vec<RawStat>> {
        let report = self.pc.get_stats().await;
        let mut stats = vec![];

        for entry in report.reports.values() {
            let stat = match entry {
                StatsReportType::OutboundRTP(s) => match media_kind(&s.kind) {
                    Some(kind) => RawStat::OutboundRtp {
                        kind,
                        bytes_sent: s.bytes_sent,
                        packets_sent: s.packets_sent,
                        packets_lost: None,
                    },
                    None => continue,
                },
                StatsReportType::InboundRTP(s) => match media_kind(&s.kind) {
                    Some(kind) => RawStat::InboundRtp {
                        kind,
                        bytes_received: s.bytes_received,
                        packets_received: s.packets_received,
                        jitter: None,
                    },
                    None => continue,
                },
                StatsReportType::RemoteInboundRTP(s) => match media_kind(&s.kind) {
                    Some(kind) => RawStat::RemoteInboundRtp {
                        kind,
                        packets_lost: s.packets_lost.max(0) as u64,
                        round_trip_time: s.round_trip_time,
                    },
                    None => continue,
                },
                StatsReportType::CandidatePair(s) => RawStat::CandidatePair {
                    succeeded: s.state.to_string() == "succeeded",
                    nominated: s.nominated,
                    current_round_trip_time: Some(s.current_round_trip_time),
                },
                _ => continue,
            };
            stats.push(stat);
        }

        trace!("Peer {} stats: {} entries", self.id, stats.len());
        Ok(stats)
    }

    async fn close(&self) -> Result<()> {
        self.senders.lock().clear();
        self.pc
            .close()
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to close peer connection: {}", e)))?;
        info!("Peer connection {} closed", self.id);
        Ok(())
    }
}
