//! Seams between the negotiation logic and the peer transport.
//!
//! Every transport callback and every long-running transport operation
//! reports back as a [`SessionEvent`] tagged with the [`SessionKey`] of the
//! session that started it. The owning loop compares the tag against its live
//! session and drops anything stale.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use tabletlink_proto::signal::IceCandidate;
use tabletlink_proto::Slot;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PeerError {
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("data channel is not open")]
    ChannelNotOpen,
    #[error("peer connection is closed")]
    Closed,
}

impl PeerError {
    pub fn negotiation(err: impl fmt::Display) -> Self {
        PeerError::Negotiation(err.to_string())
    }
}

/// Identifies one incarnation of a slot's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub slot: Slot,
    pub generation: u64,
}

impl SessionKey {
    pub fn new(slot: Slot, generation: u64) -> Self {
        Self { slot, generation }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

pub enum PeerEvent {
    /// The local offer was created and applied.
    OfferCreated(Result<SessionDescription, PeerError>),
    /// The local answer was created and applied.
    AnswerCreated(Result<SessionDescription, PeerError>),
    RemoteDescriptionApplied(Result<(), PeerError>),
    LocalCandidate(IceCandidate),
    ChannelOpen(Arc<dyn DataChannel>),
    ChannelMessage(Bytes),
    TransportFailed(String),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerEvent::OfferCreated(r) => f.debug_tuple("OfferCreated").field(&r.is_ok()).finish(),
            PeerEvent::AnswerCreated(r) => f.debug_tuple("AnswerCreated").field(&r.is_ok()).finish(),
            PeerEvent::RemoteDescriptionApplied(r) => f
                .debug_tuple("RemoteDescriptionApplied")
                .field(r)
                .finish(),
            PeerEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            PeerEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            PeerEvent::ChannelMessage(b) => f.debug_tuple("ChannelMessage").field(&b.len()).finish(),
            PeerEvent::TransportFailed(e) => f.debug_tuple("TransportFailed").field(e).finish(),
        }
    }
}

#[derive(Debug)]
pub struct SessionEvent {
    pub key: SessionKey,
    pub event: PeerEvent,
}

pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Posts events for one session into its owner's loop.
#[derive(Clone)]
pub struct EventSink {
    key: SessionKey,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub fn new(key: SessionKey, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { key, tx }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// Returns false once the owning loop has gone away.
    pub fn post(&self, event: PeerEvent) -> bool {
        self.tx
            .send(SessionEvent {
                key: self.key,
                event,
            })
            .is_ok()
    }
}

/// Creates the event channel shared by all sessions of one owner.
pub fn event_channel() -> (mpsc::UnboundedSender<SessionEvent>, EventReceiver) {
    mpsc::unbounded_channel()
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Builds a new peer connection whose callbacks post into `events`.
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Creates the unreliable, unordered channel telegrams travel on.
    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError>;
    async fn close(&self);
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> Result<(), PeerError>;
}
