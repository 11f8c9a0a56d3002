use std::sync::Arc;

use tracing::{debug, info, warn};

use super::{LocalMedia, MediaConstraints, MediaDevices};
use crate::error::Result;
use crate::peer::{MediaKind, PeerTransport, TrackSender};

/// Owns the local media of the active session
pub struct MediaPipeline {
    devices: Arc<dyn MediaDevices>,
    media: Option<LocalMedia>,
    senders: Vec<TrackSender>,
}

impl MediaPipeline {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            media: None,
            senders: Vec::new(),
        }
    }

    /// Acquire local media, releasing any previously held tracks first
    pub async fn acquire(&mut self, constraints: &MediaConstraints) -> Result<&LocalMedia> {
        self.release();
        let media = self.devices.acquire(constraints).await?;
        Ok(self.media.insert(media))
    }

    /// Add every held track to `peer`; returns the created senders
    pub async fn attach(&mut self, peer: &dyn PeerTransport) -> Result<Vec<TrackSender>> {
        let Some(media) = self.media.as_ref() else {
            return Ok(Vec::new());
        };
        let mut senders = Vec::with_capacity(media.tracks().len());
        for track in media.tracks() {
            senders.push(peer.add_track(track).await?);
        }
        debug!("Attached {} local tracks to peer {}", senders.len(), peer.id());
        self.senders = senders.clone();
        Ok(senders)
    }

    /// Apply one bitrate cap to each video sender and the track behind it;
    /// returns how many were capped
    pub async fn apply_bitrate_cap(&self, peer: &dyn PeerTransport, max_bitrate_bps: u64) -> Result<usize> {
        let mut applied = 0;
        for sender in self.senders.iter().filter(|s| s.kind == MediaKind::Video) {
            peer.set_max_bitrate(sender, max_bitrate_bps).await?;
            let track = self
                .media
                .as_ref()
                .and_then(|m| m.tracks().iter().find(|t| t.id() == sender.track_id));
            if let Some(track) = track {
                track.set_max_bitrate(max_bitrate_bps);
            }
            applied += 1;
        }
        if applied == 0 {
            warn!("No video sender to cap at {} bps", max_bitrate_bps);
        } else {
            info!("Video bitrate capped at {} kbps", max_bitrate_bps / 1000);
        }
        Ok(applied)
    }

    /// Stop all tracks and release the device
    pub fn release(&mut self) {
        self.senders.clear();
        if let Some(mut media) = self.media.take() {
            media.stop();
            info!("Local media released");
        }
    }

    pub fn media(&self) -> Option<&LocalMedia> {
        self.media.as_ref()
    }

    pub fn senders(&self) -> &[TrackSender] {
        &self.senders
    }

    pub fn has_media(&self) -> bool {
        self.media.is_some()
    }
}

impl Drop for MediaPipeline {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SampleMediaDevices;
    use crate::session::mock::MockPeer;

    #[tokio::test]
    async fn test_reacquire_releases_previous_media() {
        let devices = Arc::new(SampleMediaDevices::default());
        let mut pipeline = MediaPipeline::new(devices.clone());

        pipeline.acquire(&MediaConstraints::video_only()).await.unwrap();
        let first_track = pipeline.media().unwrap().tracks()[0].clone();

        // Exclusive device: this only succeeds if the first lease was dropped
        pipeline.acquire(&MediaConstraints::audio_video()).await.unwrap();
        assert!(first_track.is_stopped());
        assert_eq!(pipeline.media().unwrap().tracks().len(), 2);

        pipeline.release();
        assert!(!pipeline.has_media());
        assert!(!devices.is_busy());
    }

    #[tokio::test]
    async fn test_attach_and_cap_video_only() {
        let mut pipeline = MediaPipeline::new(Arc::new(SampleMediaDevices::default()));
        pipeline.acquire(&MediaConstraints::audio_video()).await.unwrap();

        let peer = MockPeer::new("peer-1");
        let senders = pipeline.attach(peer.as_ref()).await.unwrap();
        assert_eq!(senders.len(), 2);
        assert_eq!(peer.track_count(), 2);

        let capped = pipeline.apply_bitrate_cap(peer.as_ref(), 2_500_000).await.unwrap();
        assert_eq!(capped, 1);
        assert_eq!(peer.bitrate_caps(), vec![2_500_000]);

        let media = pipeline.media().unwrap();
        let video = media.track(MediaKind::Video).unwrap();
        let audio = media.track(MediaKind::Audio).unwrap();
        assert_eq!(video.max_bitrate_bps(), Some(2_500_000));
        assert_eq!(audio.max_bitrate_bps(), None);

        pipeline.apply_bitrate_cap(peer.as_ref(), 800_000).await.unwrap();
        assert_eq!(video.max_bitrate_bps(), Some(800_000));
    }

    #[tokio::test]
    async fn test_attach_without_media() {
        let mut pipeline = MediaPipeline::new(Arc::new(SampleMediaDevices::default()));
        let peer = MockPeer::new("peer-1");
        assert!(pipeline.attach(peer.as_ref()).await.unwrap().is_empty());
        assert_eq!(peer.track_count(), 0);
    }
}
