//! Peer negotiation shared by the host and the devices: the per-slot session
//! state machine, the transport seam with its webrtc-rs and in-memory
//! implementations, and the relay connection.

pub mod fake;
pub mod relay_client;
pub mod rtc;
pub mod session;
pub mod transport;

pub use relay_client::{RelayLink, RelaySender};
pub use rtc::{WebRtcConnector, DEFAULT_STUN_URL};
pub use session::{NegotiationState, PeerSession};
pub use transport::{
    event_channel, DataChannel, EventReceiver, EventSink, PeerConnection, PeerConnector, PeerError,
    PeerEvent, SdpKind, SessionDescription, SessionEvent, SessionKey,
};
