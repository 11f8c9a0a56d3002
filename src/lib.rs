//! rtc-session - peer-to-peer audio/video streaming session manager
//!
//! Handles the signaling protocol, the peer connection lifecycle, failure
//! recovery, bitrate caps and statistics for one broadcaster or viewer
//! session. Collaborators observe it through [`events::EventBus`] and drive
//! it through [`session::SessionController`].

pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod stats;
pub mod utils;

pub use error::{AppError, Result};
