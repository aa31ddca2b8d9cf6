use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use tabletlink_peer::{
    event_channel, EventReceiver, EventSink, NegotiationState, PeerConnector, PeerError, PeerEvent,
    PeerSession, RelaySender, SessionDescription, SessionEvent, SessionKey,
};
use tabletlink_proto::signal::{IceCandidate, SignalKind, SignalingEnvelope};
use tabletlink_proto::telegram::InputTelegram;
use tabletlink_proto::{Slot, HOST_ID};

use crate::input::InputSource;

/// Default period between telegrams, roughly one per display frame.
pub const DEFAULT_TICK: Duration = Duration::from_millis(16);

/// The answering side of one device slot: logs in, answers the host's
/// offers and streams input telegrams once the channel opens.
pub struct ControllerPeer {
    slot: Slot,
    connector: Arc<dyn PeerConnector>,
    relay: RelaySender,
    input: Arc<dyn InputSource>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: EventReceiver,
    session: Option<PeerSession>,
    next_generation: u64,
    /// Local candidates gathered before the answer went out.
    early_candidates: Vec<IceCandidate>,
}

impl ControllerPeer {
    pub fn new(
        slot: Slot,
        connector: Arc<dyn PeerConnector>,
        relay: RelaySender,
        input: Arc<dyn InputSource>,
    ) -> Self {
        let (events_tx, events_rx) = event_channel();
        Self {
            slot,
            connector,
            relay,
            input,
            events_tx,
            events_rx,
            session: None,
            next_generation: 0,
            early_candidates: Vec::new(),
        }
    }

    pub fn slot(&self) -> Slot {
        self.slot
    }

    pub fn state(&self) -> Option<NegotiationState> {
        self.session.as_ref().map(PeerSession::state)
    }

    pub fn session_key(&self) -> Option<SessionKey> {
        self.session.as_ref().map(PeerSession::key)
    }

    /// Announces this slot to the relay.
    pub fn login(&self) -> bool {
        info!("logging in as {}", self.slot);
        self.relay.send(SignalingEnvelope::login(self.slot.id()))
    }

    pub async fn handle_envelope(&mut self, envelope: SignalingEnvelope) {
        match envelope.kind {
            SignalKind::Offer => {
                if !envelope.target.as_deref().map_or(true, |t| t == self.slot.id()) {
                    debug!("{}: ignoring offer for {:?}", self.slot, envelope.target);
                    return;
                }
                let Some(sdp) = envelope.sdp else {
                    warn!("{}: dropping offer without sdp", self.slot);
                    return;
                };
                if let Err(e) = self.accept_offer(SessionDescription::offer(sdp)).await {
                    warn!("{}: cannot answer offer: {}", self.slot, e);
                }
            }
            SignalKind::Candidate => {
                let Some(candidate) = envelope.ice_candidate() else {
                    warn!("{}: dropping empty candidate", self.slot);
                    return;
                };
                match self.session.as_mut() {
                    Some(session) if !session.is_closed() => {
                        session.add_remote_candidate(candidate).await
                    }
                    _ => debug!("{}: dropping candidate, no live session", self.slot),
                }
            }
            kind => debug!("{}: ignoring {:?} from {:?}", self.slot, kind, envelope.sender()),
        }
    }

    /// Replaces whatever session exists with a fresh one answering `offer`.
    async fn accept_offer(&mut self, offer: SessionDescription) -> Result<(), PeerError> {
        if let Some(mut old) = self.session.take() {
            if !old.is_closed() {
                info!("{}: new offer replaces session {}", self.slot, old.key());
                old.close().await;
            }
        }
        self.early_candidates.clear();

        self.next_generation += 1;
        let key = SessionKey::new(self.slot, self.next_generation);
        let events = EventSink::new(key, self.events_tx.clone());
        let mut session = PeerSession::open(self.connector.as_ref(), events).await?;
        session.begin_remote_description(offer);
        self.session = Some(session);
        Ok(())
    }

    pub async fn handle_event(&mut self, event: SessionEvent) {
        let SessionEvent { key, event } = event;
        let Some(session) = self.session.as_mut() else {
            debug!("dropping {:?} for {}: no session", event, key);
            return;
        };
        if session.key() != key || session.is_closed() {
            debug!("dropping stale {:?} for {}", event, key);
            return;
        }

        match event {
            PeerEvent::RemoteDescriptionApplied(Ok(())) => {
                session.remote_description_applied().await;
                session.begin_answer();
            }
            PeerEvent::AnswerCreated(Ok(answer)) => {
                session.set_local_description(answer.clone());
                if !self.relay.send(SignalingEnvelope::answer(self.slot.id(), answer.sdp)) {
                    warn!("session {}: relay is gone, answer not delivered", key);
                }
                session.transition(NegotiationState::AnswerSent);
                for candidate in self.early_candidates.drain(..) {
                    self.relay.send(SignalingEnvelope::candidate(
                        HOST_ID,
                        Some(self.slot.id().to_string()),
                        candidate,
                    ));
                }
            }
            PeerEvent::LocalCandidate(candidate) => {
                if session.local_description().is_none() {
                    self.early_candidates.push(candidate);
                } else {
                    self.relay.send(SignalingEnvelope::candidate(
                        HOST_ID,
                        Some(self.slot.id().to_string()),
                        candidate,
                    ));
                }
            }
            PeerEvent::ChannelOpen(channel) => {
                info!("session {}: channel {:?} open", key, channel.label());
                session.attach_channel(channel);
                session.transition(NegotiationState::Connected);
            }
            PeerEvent::ChannelMessage(payload) => {
                trace!("session {}: ignoring {} byte message", key, payload.len());
            }
            PeerEvent::OfferCreated(_) => {
                debug!("session {}: devices never offer; ignoring", key);
            }
            PeerEvent::RemoteDescriptionApplied(Err(e)) | PeerEvent::AnswerCreated(Err(e)) => {
                warn!("session {}: {}", key, e);
                session.close().await;
            }
            PeerEvent::TransportFailed(reason) => {
                warn!("session {}: transport failed: {}", key, reason);
                session.close().await;
            }
        }
    }

    /// Samples the input source and sends one telegram. Returns whether a
    /// telegram went out; nothing is queued while the channel is not open.
    pub async fn sample_and_send(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let state = self.input.sample().sanitized();
        let text = match InputTelegram::new(self.slot.player_id(), state).encode() {
            Ok(text) => text,
            Err(e) => {
                warn!("{}: cannot encode telegram: {}", self.slot, e);
                return false;
            }
        };
        match session.send_text(&text).await {
            Ok(()) => true,
            Err(PeerError::ChannelNotOpen) | Err(PeerError::Closed) => {
                trace!("session {}: channel not open; skipping sample", session.key());
                false
            }
            Err(e) => {
                warn!("session {}: send failed: {}", session.key(), e);
                false
            }
        }
    }

    /// Waits for the next transport event and applies it.
    pub async fn process_next_event(&mut self) {
        if let Some(event) = self.events_rx.recv().await {
            self.handle_event(event).await;
        }
    }

    pub async fn teardown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.close().await;
        }
        info!("{}: session closed", self.slot);
    }

    /// Serves relay envelopes and transport events and sends a telegram
    /// every `tick` until `shutdown` completes or the relay goes away.
    pub async fn run(
        &mut self,
        mut inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
        tick: Duration,
        shutdown: impl Future<Output = ()>,
    ) {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
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
                _ = ticker.tick() => {
                    self.sample_and_send().await;
                }
            }
        }
        self.teardown().await;
    }
}
