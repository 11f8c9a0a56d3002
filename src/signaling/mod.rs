//! Signaling: wire protocol and the WebSocket channel to the server

pub mod channel;
pub mod protocol;

pub use channel::{SignalingChannel, SignalingSink};
pub use protocol::SignalingMessage;
