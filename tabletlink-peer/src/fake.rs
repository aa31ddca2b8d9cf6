//! In-memory transport for exercising negotiation without a network.
//!
//! Each [`FakePeerConnection`] records what the negotiation logic did to it
//! and exposes hooks for a test to play the part of the transport: emit
//! local candidates, open the data channel, deliver messages or fail.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use tabletlink_proto::signal::IceCandidate;
use tabletlink_proto::Slot;

use crate::transport::{
    DataChannel, EventSink, PeerConnection, PeerConnector, PeerError, PeerEvent, SdpKind,
    SessionDescription, SessionKey,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
pub struct FakeConnector {
    connections: Mutex<Vec<Arc<FakePeerConnection>>>,
    gate: Mutex<Option<watch::Receiver<bool>>>,
    fail_offers: AtomicBool,
}

/// Holds remote-description application on gated connections until released.
pub struct RemoteGate(watch::Sender<bool>);

impl RemoteGate {
    pub fn release(&self) {
        self.0.send_replace(true);
    }
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connections(&self) -> Vec<Arc<FakePeerConnection>> {
        lock(&self.connections).clone()
    }

    pub fn latest(&self) -> Option<Arc<FakePeerConnection>> {
        lock(&self.connections).last().cloned()
    }

    pub fn latest_for(&self, slot: Slot) -> Option<Arc<FakePeerConnection>> {
        lock(&self.connections)
            .iter()
            .rev()
            .find(|c| c.key().slot == slot)
            .cloned()
    }

    /// Connections created after this call hold `set_remote_description`
    /// until the returned gate is released.
    pub fn hold_remote_descriptions(&self) -> RemoteGate {
        let (tx, rx) = watch::channel(false);
        *lock(&self.gate) = Some(rx);
        RemoteGate(tx)
    }

    /// Connections created after this call fail to create offers.
    pub fn fail_offers(&self) {
        self.fail_offers.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let connection = Arc::new(FakePeerConnection {
            key: events.key(),
            events,
            gate: lock(&self.gate).clone(),
            fail_offers: self.fail_offers.load(Ordering::SeqCst),
            state: Mutex::new(FakeState::default()),
        });
        lock(&self.connections).push(connection.clone());
        Ok(connection)
    }
}

#[derive(Default)]
struct FakeState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    channel: Option<Arc<FakeDataChannel>>,
    closed: bool,
}

pub struct FakePeerConnection {
    key: SessionKey,
    events: EventSink,
    gate: Option<watch::Receiver<bool>>,
    fail_offers: bool,
    state: Mutex<FakeState>,
}

impl FakePeerConnection {
    pub fn key(&self) -> SessionKey {
        self.key
    }

    /// The sink this connection's callbacks post into.
    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    pub fn data_channel(&self) -> Option<Arc<FakeDataChannel>> {
        lock(&self.state).channel.clone()
    }

    pub fn emit_local_candidate(&self, candidate: IceCandidate) -> bool {
        self.events.post(PeerEvent::LocalCandidate(candidate))
    }

    /// Opens the data channel, creating one first when this side did not
    /// (the answering side receives its channel from the remote).
    pub fn open_channel(&self) -> Arc<FakeDataChannel> {
        let channel = {
            let mut state = lock(&self.state);
            state
                .channel
                .get_or_insert_with(|| Arc::new(FakeDataChannel::new("input")))
                .clone()
        };
        channel.set_open(true);
        self.events.post(PeerEvent::ChannelOpen(channel.clone()));
        channel
    }

    pub fn deliver(&self, payload: impl Into<Bytes>) -> bool {
        self.events.post(PeerEvent::ChannelMessage(payload.into()))
    }

    pub fn fail(&self, reason: &str) -> bool {
        self.events.post(PeerEvent::TransportFailed(reason.to_string()))
    }

    fn check_open(&self) -> Result<(), PeerError> {
        if lock(&self.state).closed {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        if self.fail_offers {
            return Err(PeerError::Negotiation("fake offer failure".to_string()));
        }
        Ok(SessionDescription::offer(format!("v=0 fake-offer {}", self.key)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.check_open()?;
        match &lock(&self.state).remote {
            Some(remote) if remote.kind == SdpKind::Offer => Ok(SessionDescription::answer(format!(
                "v=0 fake-answer {}",
                self.key
            ))),
            _ => Err(PeerError::Negotiation("no remote offer to answer".to_string())),
        }
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.check_open()?;
        lock(&self.state).local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if let Some(gate) = &self.gate {
            let mut gate = gate.clone();
            let _ = gate.wait_for(|released| *released).await;
        }
        self.check_open()?;
        lock(&self.state).remote = Some(desc);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.check_open()?;
        let mut state = lock(&self.state);
        if state.remote.is_none() {
            return Err(PeerError::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        state.candidates.push(candidate);
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        self.check_open()?;
        let channel = Arc::new(FakeDataChannel::new(label));
        lock(&self.state).channel = Some(channel.clone());
        Ok(channel)
    }

    async fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        if let Some(channel) = &state.channel {
            channel.set_open(false);
        }
    }
}

pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    peer: Mutex<Option<EventSink>>,
}

impl FakeDataChannel {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            peer: Mutex::new(None),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    /// Everything successfully sent on this channel.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.sent).clone()
    }

    /// Forwards future sends to the other end as channel messages.
    pub fn link_to(&self, peer: EventSink) {
        *lock(&self.peer) = Some(peer);
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ChannelNotOpen);
        }
        lock(&self.sent).push(text.to_string());
        if let Some(peer) = lock(&self.peer).as_ref() {
            peer.post(PeerEvent::ChannelMessage(Bytes::from(text.to_string())));
        }
        Ok(())
    }
}
