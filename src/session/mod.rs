//! Streaming session management
//!
//! ```text
//!              start_streaming            transport up
//!   Idle ─────────────────────> Publishing ───────────┐
//!     │        join_stream                            v
//!     └───────────────────────> Viewing ──────────> Connected <──┐
//!                                                     │          │ transport up
//!                                            failed   v          │
//!                                               Reconnecting ────┘
//!
//!   any live state ── stop/leave ──> Closed     any live state ── give up ──> Failed
//! ```

mod controller;
mod state;

#[cfg(test)]
pub(crate) mod mock;

pub use controller::{SessionController, SessionInfo};
pub use state::{Role, SessionState, Trigger};
