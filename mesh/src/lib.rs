//! Peer mesh for huddle voice sessions
//!
//! One peer link per remote participant. The mesh owns the links, routes
//! inbound negotiation payloads to them and keeps every link carrying the
//! current set of local tracks.

pub mod codec;
pub mod link;
pub mod mesh;
pub mod webrtc_link;

#[cfg(any(test, feature = "mock"))]
pub mod fake;

pub use link::{LinkContext, LinkEvent, LinkEventKind, LinkId, PeerLink, PeerLinkFactory};
pub use mesh::{PeerMesh, SignalBuffer};
pub use webrtc_link::{NegotiationMessage, WebRtcLink, WebRtcLinkFactory};

#[cfg(any(test, feature = "mock"))]
pub use fake::{RecordedLink, RecordingLinkFactory};
