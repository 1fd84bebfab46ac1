//! Signaling for huddle voice channels
//!
//! A session-scoped event channel to a relay carrying join/leave/signal/update
//! notifications, plus the relay side of the protocol.

pub mod channel;
pub mod local;
pub mod protocol;
pub mod relay;
pub mod ws;

pub use channel::{OpenChannel, SignalingChannel, SignalingLink};
pub use local::LocalSignaling;
pub use protocol::{ClientMessage, ServerMessage};
pub use relay::Relay;
pub use ws::{serve, serve_with_join_timeout, WsSignalingChannel};

#[cfg(any(test, feature = "mock"))]
pub use channel::{MockSignalingChannel, MockSignalingLink};
