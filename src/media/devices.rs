use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::{MediaConstraints, MediaError};
use crate::error::{AppError, Result};
use crate::peer::MediaKind;

/// H.264 constrained baseline, packetization mode 1
fn video_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

fn audio_codec_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// One local, sample-writable track
pub struct LocalTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
    /// Encoder bitrate ceiling in bps; 0 means uncapped
    max_bitrate_bps: AtomicU64,
}

impl LocalTrack {
    /// Create a track of `kind` labelled with `stream_label`
    pub fn new(kind: MediaKind, stream_label: &str) -> Self {
        let id = format!("{}-{}", kind, uuid::Uuid::new_v4());
        let capability = match kind {
            MediaKind::Video => video_codec_capability(),
            MediaKind::Audio => audio_codec_capability(),
        };
        let track = Arc::new(TrackLocalStaticSample::new(
            capability,
            id.clone(),
            stream_label.to_string(),
        ));
        Self {
            id,
            kind,
            track,
            stopped: AtomicBool::new(false),
            max_bitrate_bps: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn mime_type(&self) -> String {
        self.track.codec().mime_type
    }

    /// Track handed to the peer connection
    pub fn rtp_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.track.clone()
    }

    /// Bitrate the encoder feeding this track must stay under
    pub fn max_bitrate_bps(&self) -> Option<u64> {
        match self.max_bitrate_bps.load(Ordering::Acquire) {
            0 => None,
            bps => Some(bps),
        }
    }

    pub fn set_max_bitrate(&self, max_bitrate_bps: u64) {
        self.max_bitrate_bps.store(max_bitrate_bps, Ordering::Release);
    }

    /// Write one encoded frame (H.264 NAL units or an Opus packet)
    pub async fn write_sample(&self, data: Bytes, duration: Duration) -> Result<()> {
        if self.is_stopped() {
            return Err(AppError::InvalidOperation(format!(
                "Track {} is stopped",
                self.id
            )));
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.track
            .write_sample(&sample)
            .await
            .map_err(|e| AppError::WebRtc(format!("Failed to write sample: {}", e)))
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            debug!("Local {} track {} stopped", self.kind, self.id);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Exclusive hold on a capture device, released on drop
#[derive(Debug)]
pub struct DeviceLease {
    busy: Arc<AtomicBool>,
}

impl DeviceLease {
    /// Try to take the device; fails with `DeviceBusy` if already held
    pub fn acquire(busy: &Arc<AtomicBool>) -> std::result::Result<Self, MediaError> {
        busy.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| MediaError::DeviceBusy)?;
        Ok(Self { busy: busy.clone() })
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// The set of local tracks produced by one acquisition
#[derive(Debug)]
pub struct LocalMedia {
    tracks: Vec<Arc<LocalTrack>>,
    constraints: MediaConstraints,
    lease: Option<DeviceLease>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<Arc<LocalTrack>>, constraints: MediaConstraints, lease: Option<DeviceLease>) -> Self {
        Self {
            tracks,
            constraints,
            lease,
        }
    }

    pub fn tracks(&self) -> &[Arc<LocalTrack>] {
        &self.tracks
    }

    pub fn track(&self, kind: MediaKind) -> Option<&Arc<LocalTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn constraints(&self) -> &MediaConstraints {
        &self.constraints
    }

    /// Stop every track and release the device
    pub fn stop(&mut self) {
        for track in &self.tracks {
            track.stop();
        }
        if self.lease.take().is_some() {
            debug!("Media device released");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.lease.is_none() && self.tracks.iter().all(|t| t.is_stopped())
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Source of local media
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire tracks satisfying `constraints`
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia>;
}

/// Devices backed by sample-writable tracks
///
/// A capture/encode stage outside this crate writes frames into the
/// returned tracks with [`LocalTrack::write_sample`].
#[derive(Debug)]
pub struct SampleMediaDevices {
    label: String,
    has_video: bool,
    has_audio: bool,
    busy: Arc<AtomicBool>,
}

impl SampleMediaDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            has_video: true,
            has_audio: true,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Declare which kinds this source can produce
    pub fn with_kinds(mut self, video: bool, audio: bool) -> Self {
        self.has_video = video;
        self.has_audio = audio;
        self
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}

impl Default for SampleMediaDevices {
    fn default() -> Self {
        Self::new("rtc-session")
    }
}

#[async_trait]
impl MediaDevices for SampleMediaDevices {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<LocalMedia> {
        constraints.validate()?;
        if constraints.video.is_some() && !self.has_video {
            return Err(MediaError::Unavailable("no video source".to_string()).into());
        }
        if constraints.audio.is_some() && !self.has_audio {
            return Err(MediaError::Unavailable("no audio source".to_string()).into());
        }

        let lease = DeviceLease::acquire(&self.busy)?;

        let mut tracks = Vec::new();
        if constraints.video.is_some() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Video, &self.label)));
        }
        if constraints.audio.is_some() {
            tracks.push(Arc::new(LocalTrack::new(MediaKind::Audio, &self.label)));
        }

        info!(
            "Acquired local media: {}",
            tracks
                .iter()
                .map(|t| t.kind().to_string())
                .collect::<Vec<_>>()
                .join("+")
        );
        Ok(LocalMedia::new(tracks, constraints.clone(), Some(lease)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_requested_tracks() {
        let devices = SampleMediaDevices::default();
        let media = devices.acquire(&MediaConstraints::audio_video()).await.unwrap();
        assert_eq!(media.tracks().len(), 2);
        assert_eq!(media.track(MediaKind::Video).unwrap().mime_type(), "video/H264");
        assert_eq!(media.track(MediaKind::Audio).unwrap().mime_type(), "audio/opus");
        assert!(devices.is_busy());
    }

    #[tokio::test]
    async fn test_device_is_exclusive_until_released() {
        let devices = SampleMediaDevices::default();
        let mut first = devices.acquire(&MediaConstraints::video_only()).await.unwrap();

        let err = devices.acquire(&MediaConstraints::video_only()).await.unwrap_err();
        assert!(matches!(err, AppError::MediaAcquisition(MediaError::DeviceBusy)));

        first.stop();
        assert!(first.is_stopped());
        assert!(!devices.is_busy());
        let second = devices.acquire(&MediaConstraints::video_only()).await.unwrap();
        drop(second);
        assert!(!devices.is_busy());
    }

    #[tokio::test]
    async fn test_missing_source_is_unavailable() {
        let devices = SampleMediaDevices::default().with_kinds(true, false);
        let err = devices.acquire(&MediaConstraints::audio_video()).await.unwrap_err();
        assert!(matches!(err, AppError::MediaAcquisition(MediaError::Unavailable(_))));
        assert!(!devices.is_busy());
    }

    #[tokio::test]
    async fn test_write_after_stop_is_rejected() {
        let track = LocalTrack::new(MediaKind::Video, "test");
        track.stop();
        let err = track
            .write_sample(Bytes::from_static(&[0, 0, 0, 1, 0x65]), Duration::from_millis(33))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }
}
