use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, info, warn};

use tabletlink_proto::signal::IceCandidate;

use crate::transport::{
    DataChannel, EventSink, PeerConnection, PeerConnector, PeerError, PeerEvent, SessionDescription,
    SessionKey,
};

/// Where a session is in its offer/answer exchange.
///
/// The host walks `New -> OfferSent -> AwaitingAnswer -> Connected`, a device
/// walks `New -> AnswerSent -> Connected`. `Closed` is terminal for both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    AwaitingAnswer,
    AnswerSent,
    Connected,
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NegotiationState::New => "new",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::AwaitingAnswer => "awaiting-answer",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// One peer connection and everything negotiated on it so far.
///
/// A session is mutated only by the loop that owns it. Transport work that
/// takes time runs on spawned tasks which report back through the session's
/// [`EventSink`]; the owner feeds the results back in.
pub struct PeerSession {
    key: SessionKey,
    events: EventSink,
    connection: Arc<dyn PeerConnection>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_applied: bool,
    pending_candidates: VecDeque<IceCandidate>,
    channel: Option<Arc<dyn DataChannel>>,
}

impl PeerSession {
    pub async fn open(connector: &dyn PeerConnector, events: EventSink) -> Result<Self, PeerError> {
        let connection = connector.connect(events.clone()).await?;
        Ok(Self::new(events, connection))
    }

    pub fn new(events: EventSink, connection: Arc<dyn PeerConnection>) -> Self {
        let key = events.key();
        info!("session {} created", key);
        Self {
            key,
            events,
            connection,
            state: NegotiationState::New,
            local_description: None,
            remote_description: None,
            remote_applied: false,
            pending_candidates: VecDeque::new(),
            channel: None,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == NegotiationState::Closed
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    /// True once the remote description has settled and candidates can be
    /// applied directly.
    pub fn remote_applied(&self) -> bool {
        self.remote_applied
    }

    pub fn queued_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    /// Moves to `next`. A closed session never leaves `Closed`.
    pub fn transition(&mut self, next: NegotiationState) -> bool {
        if self.is_closed() {
            debug!("session {} is closed; ignoring transition to {}", self.key, next);
            return false;
        }
        if self.state != next {
            info!("session {}: {} -> {}", self.key, self.state, next);
            self.state = next;
        }
        true
    }

    /// Creates and applies the local offer on a background task. Completion
    /// arrives as [`PeerEvent::OfferCreated`].
    pub fn begin_offer(&self) {
        let connection = self.connection.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result: Result<SessionDescription, PeerError> = async {
                let offer = connection.create_offer().await?;
                connection.set_local_description(offer.clone()).await?;
                Ok(offer)
            }
            .await;
            events.post(PeerEvent::OfferCreated(result));
        });
    }

    /// Creates and applies the local answer on a background task. Completion
    /// arrives as [`PeerEvent::AnswerCreated`].
    pub fn begin_answer(&self) {
        let connection = self.connection.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result: Result<SessionDescription, PeerError> = async {
                let answer = connection.create_answer().await?;
                connection.set_local_description(answer.clone()).await?;
                Ok(answer)
            }
            .await;
            events.post(PeerEvent::AnswerCreated(result));
        });
    }

    pub fn set_local_description(&mut self, desc: SessionDescription) {
        self.local_description = Some(desc);
    }

    /// Starts applying `desc` as the remote description. Candidates keep
    /// queueing until [`PeerSession::remote_description_applied`] is called.
    pub fn begin_remote_description(&mut self, desc: SessionDescription) {
        self.remote_description = Some(desc.clone());
        let connection = self.connection.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = connection.set_remote_description(desc).await;
            events.post(PeerEvent::RemoteDescriptionApplied(result));
        });
    }

    /// Marks the remote description as applied and drains queued candidates
    /// in arrival order. Returns how many were drained.
    pub async fn remote_description_applied(&mut self) -> usize {
        self.remote_applied = true;
        let mut drained = 0;
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(candidate).await;
            drained += 1;
        }
        if drained > 0 {
            debug!("session {} applied {} queued candidates", self.key, drained);
        }
        drained
    }

    /// Applies a remote candidate now if possible, otherwise queues it.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.is_closed() {
            return;
        }
        if self.remote_applied {
            self.apply_candidate(candidate).await;
        } else {
            debug!(
                "session {} queueing candidate until remote description is set ({} queued)",
                self.key,
                self.pending_candidates.len() + 1
            );
            self.pending_candidates.push_back(candidate);
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.connection.add_ice_candidate(candidate).await {
            warn!("session {} rejected remote candidate: {}", self.key, e);
        }
    }

    pub fn attach_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
    }

    /// Sends on the session's channel. Nothing is queued when it is not open.
    pub async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::Closed);
        }
        match &self.channel {
            Some(channel) if channel.is_open() => channel.send_text(text).await,
            _ => Err(PeerError::ChannelNotOpen),
        }
    }

    /// Closes the transport and releases everything the session holds.
    pub async fn close(&mut self) {
        if self.is_closed() {
            return;
        }
        info!("session {}: {} -> {}", self.key, self.state, NegotiationState::Closed);
        self.state = NegotiationState::Closed;
        self.pending_candidates.clear();
        self.channel = None;
        self.connection.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeConnector;
    use crate::transport::{event_channel, SessionEvent};
    use k9::assert_equal;
    use tabletlink_proto::Slot;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    async fn session(connector: &FakeConnector) -> (PeerSession, UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = event_channel();
        let events = EventSink::new(SessionKey::new(Slot::P1, 1), tx);
        (PeerSession::open(connector, events).await.unwrap(), rx)
    }

    #[tokio::test]
    async fn early_candidates_are_applied_in_order_after_remote_description() {
        let connector = FakeConnector::new();
        let (mut session, mut rx) = session(&connector).await;
        let fake = connector.latest().unwrap();

        session.add_remote_candidate(candidate(1)).await;
        session.add_remote_candidate(candidate(2)).await;
        assert_equal!(session.queued_candidates(), 2);
        assert!(fake.applied_candidates().is_empty());

        session.begin_remote_description(SessionDescription::offer("remote"));
        let applied = rx.recv().await.unwrap();
        assert!(matches!(applied.event, PeerEvent::RemoteDescriptionApplied(Ok(()))));

        assert_equal!(session.remote_description_applied().await, 2);
        session.add_remote_candidate(candidate(3)).await;

        assert_equal!(
            fake.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );
        assert_equal!(session.queued_candidates(), 0);
    }

    #[tokio::test]
    async fn offer_completion_is_posted_with_session_key() {
        let connector = FakeConnector::new();
        let (session, mut rx) = session(&connector).await;

        session.begin_offer();
        let event = rx.recv().await.unwrap();
        assert_equal!(event.key, session.key());
        match event.event {
            PeerEvent::OfferCreated(Ok(desc)) => {
                assert_equal!(connector.latest().unwrap().local_description(), Some(desc));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn send_before_open_is_skipped() {
        let connector = FakeConnector::new();
        let (mut session, _rx) = session(&connector).await;
        assert_equal!(session.send_text("x").await, Err(PeerError::ChannelNotOpen));

        let channel = session.connection().create_data_channel("input").await.unwrap();
        session.attach_channel(channel);
        assert_equal!(session.send_text("x").await, Err(PeerError::ChannelNotOpen));
    }

    #[tokio::test]
    async fn closed_is_terminal() {
        let connector = FakeConnector::new();
        let (mut session, _rx) = session(&connector).await;
        session.add_remote_candidate(candidate(1)).await;

        session.close().await;
        assert!(session.is_closed());
        assert!(connector.latest().unwrap().is_closed());
        assert_equal!(session.queued_candidates(), 0);
        assert!(!session.transition(NegotiationState::Connected));
        assert_equal!(session.state(), NegotiationState::Closed);
        assert_equal!(session.send_text("x").await, Err(PeerError::Closed));
    }
}
