use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, trace, warn};
use tokio::sync::{mpsc, watch};

use tabletlink_peer::{
    event_channel, EventReceiver, EventSink, NegotiationState, PeerConnector, PeerError, PeerEvent,
    PeerSession, RelaySender, SessionDescription, SessionEvent, SessionKey,
};
use tabletlink_proto::signal::{IceCandidate, SignalKind, SignalingEnvelope};
use tabletlink_proto::telegram::InputTelegram;
use tabletlink_proto::{Slot, HOST_ID};

use crate::inject::InjectionSink;

/// Label of the data channel telegrams arrive on.
pub const INPUT_CHANNEL: &str = "input";

/// Negotiation state of every slot that has a session.
pub type SlotStatus = BTreeMap<Slot, NegotiationState>;

/// Host-side bookkeeping around one slot's session.
struct HostSession {
    session: PeerSession,
    /// Local candidates gathered before the offer went out.
    early_candidates: Vec<IceCandidate>,
    /// An answer that overtook our own offer.
    early_answer: Option<SessionDescription>,
}

/// Owns one negotiation session per device slot and drives them from relay
/// envelopes and transport events, all on a single task.
pub struct Orchestrator {
    connector: Arc<dyn PeerConnector>,
    relay: RelaySender,
    sink: Arc<dyn InjectionSink>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: EventReceiver,
    sessions: HashMap<Slot, HostSession>,
    next_generation: u64,
    status: watch::Sender<SlotStatus>,
}

impl Orchestrator {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        relay: RelaySender,
        sink: Arc<dyn InjectionSink>,
    ) -> Self {
        let (events_tx, events_rx) = event_channel();
        let (status, _) = watch::channel(SlotStatus::new());
        Self {
            connector,
            relay,
            sink,
            events_tx,
            events_rx,
            sessions: HashMap::new(),
            next_generation: 0,
            status,
        }
    }

    pub fn session_state(&self, slot: Slot) -> Option<NegotiationState> {
        self.sessions.get(&slot).map(|s| s.session.state())
    }

    pub fn session_key(&self, slot: Slot) -> Option<SessionKey> {
        self.sessions.get(&slot).map(|s| s.session.key())
    }

    /// Follows slot states as the orchestrator runs.
    pub fn subscribe_status(&self) -> watch::Receiver<SlotStatus> {
        self.status.subscribe()
    }

    fn publish_status(&self) {
        let status: SlotStatus = self
            .sessions
            .iter()
            .map(|(slot, s)| (*slot, s.session.state()))
            .collect();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// Builds a fresh session for `slot` and starts the offer. A live session
    /// for the slot is closed first.
    pub async fn start_connection(&mut self, slot: Slot) -> Result<(), PeerError> {
        if let Some(existing) = self.sessions.get_mut(&slot) {
            if !existing.session.is_closed() {
                info!("{} restarted negotiation; replacing {}", slot, existing.session.key());
                existing.session.close().await;
            }
        }

        self.next_generation += 1;
        let key = SessionKey::new(slot, self.next_generation);
        let events = EventSink::new(key, self.events_tx.clone());
        let mut session = PeerSession::open(self.connector.as_ref(), events).await?;

        let result = session.connection().create_data_channel(INPUT_CHANNEL).await;
        let started = match result {
            Ok(channel) => {
                session.attach_channel(channel);
                session.begin_offer();
                Ok(())
            }
            Err(e) => {
                warn!("session {}: cannot create data channel: {}", key, e);
                session.close().await;
                Err(e)
            }
        };

        self.sessions.insert(
            slot,
            HostSession {
                session,
                early_candidates: Vec::new(),
                early_answer: None,
            },
        );
        self.publish_status();
        started
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        let sender = envelope.sender().map(str::to_string);
        match envelope.kind {
            SignalKind::LoginNotify => {
                let Some(slot) = sender.as_deref().and_then(Slot::from_id) else {
                    debug!("ignoring login from unknown identity {:?}", sender);
                    return;
                };
                info!("{} logged in", slot);
                if let Err(e) = self.start_connection(slot).await {
                    warn!("{}: failed to start negotiation: {}", slot, e);
                }
            }
            SignalKind::Answer => {
                let (Some(slot), Some(sdp)) = (sender.as_deref().and_then(Slot::from_id), envelope.sdp)
                else {
                    warn!("dropping answer from {:?} without slot or sdp", sender);
                    return;
                };
                self.apply_answer(slot, SessionDescription::answer(sdp));
            }
            SignalKind::Candidate => {
                let Some(slot) = sender.as_deref().and_then(Slot::from_id) else {
                    debug!("dropping candidate from unknown identity {:?}", sender);
                    return;
                };
                let Some(candidate) = envelope.ice_candidate() else {
                    warn!("dropping empty candidate from {}", slot);
                    return;
                };
                match self.sessions.get_mut(&slot) {
                    Some(s) if !s.session.is_closed() => s.session.add_remote_candidate(candidate).await,
                    _ => debug!("dropping candidate for {}: no live session", slot),
                }
            }
            SignalKind::Offer => {
                debug!("host ignores offer from {:?}", sender);
            }
        }
        self.publish_status();
    }

    fn apply_answer(&mut self, slot: Slot, answer: SessionDescription) {
        let Some(host) = self.sessions.get_mut(&slot) else {
            debug!("dropping answer for {}: no session", slot);
            return;
        };
        let session = &mut host.session;
        if session.remote_description().is_some() {
            debug!("session {}: duplicate answer ignored", session.key());
            return;
        }
        match session.state() {
            NegotiationState::New => {
                debug!("session {}: answer arrived before offer was sent; holding", session.key());
                host.early_answer = Some(answer);
            }
            NegotiationState::OfferSent | NegotiationState::AwaitingAnswer => {
                session.begin_remote_description(answer);
            }
            state => debug!("session {}: answer ignored in state {}", session.key(), state),
        }
    }

    /// Applies one transport event. Events from a replaced or closed session
    /// are dropped.
    pub async fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { key, event } = event;
        let Some(host) = self.sessions.get_mut(&key.slot) else {
            debug!("dropping {:?} for {}: no session", event, key);
            return;
        };
        if host.session.key() != key || host.session.is_closed() {
            debug!("dropping stale {:?} for {}", event, key);
            return;
        }

        match event {
            PeerEvent::OfferCreated(Ok(offer)) => {
                host.session.set_local_description(offer.clone());
                host.session.transition(NegotiationState::OfferSent);
                let slot = key.slot;
                if self
                    .relay
                    .send(SignalingEnvelope::offer(slot.id(), offer.sdp))
                {
                    host.session.transition(NegotiationState::AwaitingAnswer);
                } else {
                    warn!("session {}: relay is gone, offer not delivered", key);
                }
                for candidate in host.early_candidates.drain(..) {
                    self.relay.send(SignalingEnvelope::candidate(
                        slot.id(),
                        Some(HOST_ID.to_string()),
                        candidate,
                    ));
                }
                if let Some(answer) = host.early_answer.take() {
                    host.session.begin_remote_description(answer);
                }
            }
            PeerEvent::RemoteDescriptionApplied(Ok(())) => {
                host.session.remote_description_applied().await;
            }
            PeerEvent::LocalCandidate(candidate) => {
                if host.session.state() == NegotiationState::New {
                    host.early_candidates.push(candidate);
                } else {
                    self.relay.send(SignalingEnvelope::candidate(
                        key.slot.id(),
                        Some(HOST_ID.to_string()),
                        candidate,
                    ));
                }
            }
            PeerEvent::ChannelOpen(channel) => {
                info!("session {}: channel {:?} open", key, channel.label());
                host.session.attach_channel(channel);
                host.session.transition(NegotiationState::Connected);
            }
            PeerEvent::ChannelMessage(payload) => self.inject(key, payload),
            PeerEvent::AnswerCreated(_) => {
                debug!("session {}: host never answers; ignoring", key);
            }
            PeerEvent::OfferCreated(Err(e)) | PeerEvent::RemoteDescriptionApplied(Err(e)) => {
                warn!("session {}: {}", key, e);
                host.session.close().await;
            }
            PeerEvent::TransportFailed(reason) => {
                warn!("session {}: transport failed: {}", key, reason);
                host.session.close().await;
            }
        }
        self.publish_status();
    }

    fn inject(&self, key: SessionKey, payload: Bytes) {
        let telegram = match InputTelegram::decode(&payload) {
            Ok(t) => t,
            Err(e) => {
                warn!("session {}: discarding telegram: {}", key, e);
                return;
            }
        };
        let Some(slot) = Slot::from_player_id(telegram.player_id) else {
            warn!(
                "session {}: discarding telegram with playerId {}",
                key, telegram.player_id
            );
            return;
        };
        if slot != key.slot {
            debug!("session {} carried a telegram for {}", key, slot);
        }
        trace!("{} <- {:?}", slot, telegram.data);
        self.sink.inject(slot, &telegram.data);
    }

    /// Waits for the next transport event and applies it.
    pub async fn process_next_event(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
        }
    }

    /// Closes every session.
    pub async fn teardown(&mut self) {
        for host in self.sessions.values_mut() {
            host.session.close().await;
        }
        self.publish_status();
        info!("all sessions closed");
    }

    /// Serves relay envelopes and transport events until `shutdown`
    /// completes or the relay goes away, then tears everything down.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }
                envelope = inbound.recv() => match envelope {
                    Some(envelope) => self.handle_envelope(envelope).await,
                    None => {
                        warn!("relay connection lost");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }
        self.teardown().await;
    }
}
