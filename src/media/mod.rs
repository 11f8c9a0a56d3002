//! Local media acquisition and attachment
//!
//! Local audio/video tracks are sample-writable tracks fed by an external
//! capture/encode stage. The [`MediaPipeline`] owns the tracks of the active
//! session, attaches them to a connection and applies bitrate caps.

pub mod constraints;
pub mod devices;
pub mod pipeline;

pub use constraints::{AudioConstraints, MediaConstraints, Range, VideoConstraints};
pub use devices::{LocalMedia, LocalTrack, MediaDevices, SampleMediaDevices};
pub use pipeline::MediaPipeline;

use thiserror::Error;

/// Why local media could not be acquired
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("Permission denied")]
    PermissionDenied,

    #[error("Device is busy")]
    DeviceBusy,

    #[error("Constraints cannot be satisfied: {0}")]
    OverConstrained(String),

    #[error("Device unavailable: {0}")]
    Unavailable(String),
}
