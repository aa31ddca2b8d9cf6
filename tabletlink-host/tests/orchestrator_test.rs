use std::sync::Arc;
use std::time::Duration;

use k9::assert_equal;
use tokio::sync::mpsc;

use tabletlink_host::{Orchestrator, RecordingSink, INPUT_CHANNEL};
use tabletlink_peer::fake::{FakeConnector, FakePeerConnection};
use tabletlink_peer::{DataChannel, NegotiationState, RelayLink, RelaySender};
use tabletlink_proto::{
    IceCandidate, InputState, InputTelegram, SignalKind, SignalingEnvelope, Slot, Vec2,
};

struct Harness {
    connector: Arc<FakeConnector>,
    sink: Arc<RecordingSink>,
    relay_rx: mpsc::UnboundedReceiver<SignalingEnvelope>,
    orchestrator: Orchestrator,
}

fn harness() -> Harness {
    let connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(RecordingSink::default());
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let orchestrator = Orchestrator::new(connector.clone(), RelaySender::new(relay_tx), sink.clone());
    Harness {
        connector,
        sink,
        relay_rx,
        orchestrator,
    }
}

fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 1 192.168.1.{n} 6000 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

/// Stamps `envelope` the way the relay does for traffic from `slot`.
fn from(slot: Slot, mut envelope: SignalingEnvelope) -> SignalingEnvelope {
    envelope.from = Some(slot.id().to_string());
    envelope
}

fn login(slot: Slot) -> SignalingEnvelope {
    from(slot, SignalingEnvelope::login(slot.id()))
}

fn answer(slot: Slot, sdp: &str) -> SignalingEnvelope {
    from(slot, SignalingEnvelope::answer(slot.id(), sdp))
}

fn device_candidate(slot: Slot, n: u32) -> SignalingEnvelope {
    from(
        slot,
        SignalingEnvelope::candidate("host", Some(slot.id().to_string()), candidate(n)),
    )
}

fn telegram(player_id: i32, state: InputState) -> String {
    InputTelegram::new(player_id, state).encode().unwrap()
}

/// Logs `slot` in and runs the session until the offer is on the relay.
async fn offer_sent(h: &mut Harness, slot: Slot) -> SignalingEnvelope {
    h.orchestrator.handle_envelope(login(slot)).await;
    h.orchestrator.process_next_event().await;
    h.relay_rx.recv().await.unwrap()
}

/// Runs `slot` all the way to an open channel.
async fn connected(h: &mut Harness, slot: Slot) -> Arc<FakePeerConnection> {
    offer_sent(h, slot).await;
    h.orchestrator.handle_envelope(answer(slot, "v=0 device-answer")).await;
    h.orchestrator.process_next_event().await;
    let fake = h.connector.latest_for(slot).unwrap();
    fake.open_channel();
    h.orchestrator.process_next_event().await;
    assert_equal!(h.orchestrator.session_state(slot), Some(NegotiationState::Connected));
    fake
}

#[tokio::test]
async fn login_sends_offer_to_the_slot() {
    let mut h = harness();
    let offer = offer_sent(&mut h, Slot::P1).await;

    assert_equal!(offer.kind, SignalKind::Offer);
    assert_equal!(offer.target.as_deref(), Some("P1"));
    assert!(offer.sdp.unwrap().contains("fake-offer"));
    assert_equal!(
        h.orchestrator.session_state(Slot::P1),
        Some(NegotiationState::AwaitingAnswer)
    );

    let fake = h.connector.latest_for(Slot::P1).unwrap();
    assert_equal!(fake.data_channel().unwrap().label(), INPUT_CHANNEL);
    assert!(fake.local_description().is_some());
    assert!(h.orchestrator.session_state(Slot::P2).is_none());
}

#[tokio::test]
async fn login_from_unknown_identity_is_ignored() {
    let mut h = harness();
    let mut stranger = SignalingEnvelope::login("P9");
    stranger.from = Some("P9".to_string());
    h.orchestrator.handle_envelope(stranger).await;

    assert!(h.connector.connections().is_empty());
    for slot in Slot::ALL {
        assert!(h.orchestrator.session_state(slot).is_none());
    }
}

#[tokio::test]
async fn signals_without_a_session_are_dropped() {
    let mut h = harness();
    h.orchestrator.handle_envelope(answer(Slot::P1, "v=0 orphan")).await;
    h.orchestrator.handle_envelope(device_candidate(Slot::P1, 1)).await;

    assert!(h.connector.connections().is_empty());
    assert!(h.orchestrator.session_state(Slot::P1).is_none());
    assert!(h.relay_rx.try_recv().is_err());
}

#[tokio::test]
async fn candidates_queue_until_answer_is_applied() {
    let mut h = harness();
    let gate = h.connector.hold_remote_descriptions();
    offer_sent(&mut h, Slot::P2).await;

    h.orchestrator.handle_envelope(answer(Slot::P2, "v=0 answer")).await;
    h.orchestrator.handle_envelope(device_candidate(Slot::P2, 1)).await;
    h.orchestrator.handle_envelope(device_candidate(Slot::P2, 2)).await;
    let fake = h.connector.latest_for(Slot::P2).unwrap();
    assert!(fake.applied_candidates().is_empty());

    gate.release();
    h.orchestrator.process_next_event().await;
    h.orchestrator.handle_envelope(device_candidate(Slot::P2, 3)).await;

    assert_equal!(
        fake.applied_candidates(),
        vec![candidate(1), candidate(2), candidate(3)]
    );
    assert_equal!(fake.remote_description().unwrap().sdp, "v=0 answer");
}

#[tokio::test]
async fn answer_before_offer_is_held_until_offer_goes_out() {
    let mut h = harness();
    h.orchestrator.handle_envelope(login(Slot::P1)).await;
    h.orchestrator.handle_envelope(answer(Slot::P1, "v=0 eager")).await;
    assert_equal!(h.orchestrator.session_state(Slot::P1), Some(NegotiationState::New));

    h.orchestrator.process_next_event().await; // offer created
    let offer = h.relay_rx.recv().await.unwrap();
    assert_equal!(offer.kind, SignalKind::Offer);

    h.orchestrator.process_next_event().await; // held answer applied
    let fake = h.connector.latest_for(Slot::P1).unwrap();
    assert_equal!(fake.remote_description().unwrap().sdp, "v=0 eager");
}

#[tokio::test]
async fn duplicate_answer_is_ignored() {
    let mut h = harness();
    connected(&mut h, Slot::P1).await;
    h.orchestrator.handle_envelope(answer(Slot::P1, "v=0 again")).await;

    let fake = h.connector.latest_for(Slot::P1).unwrap();
    assert_equal!(fake.remote_description().unwrap().sdp, "v=0 device-answer");
    assert_equal!(h.orchestrator.session_state(Slot::P1), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn local_candidates_follow_the_offer() {
    let mut h = harness();
    h.orchestrator.handle_envelope(login(Slot::P1)).await;
    let fake = h.connector.latest_for(Slot::P1).unwrap();
    fake.emit_local_candidate(candidate(4));

    h.orchestrator.process_next_event().await;
    h.orchestrator.process_next_event().await;

    let offer = h.relay_rx.recv().await.unwrap();
    assert_equal!(offer.kind, SignalKind::Offer);
    let sent = h.relay_rx.recv().await.unwrap();
    assert_equal!(sent.kind, SignalKind::Candidate);
    assert_equal!(sent.target.as_deref(), Some("P1"));
    assert_equal!(sent.id.as_deref(), Some("host"));
    assert_equal!(sent.ice_candidate(), Some(candidate(4)));
}

#[tokio::test]
async fn offer_failure_closes_the_session() {
    let mut h = harness();
    h.connector.fail_offers();
    let status = h.orchestrator.subscribe_status();

    h.orchestrator.handle_envelope(login(Slot::P2)).await;
    h.orchestrator.process_next_event().await;

    assert_equal!(h.orchestrator.session_state(Slot::P2), Some(NegotiationState::Closed));
    assert!(h.connector.latest_for(Slot::P2).unwrap().is_closed());
    assert_equal!(
        status.borrow().get(&Slot::P2).copied(),
        Some(NegotiationState::Closed)
    );
    assert!(h.relay_rx.try_recv().is_err());
}

#[tokio::test]
async fn relogin_replaces_the_session_and_drops_stale_events() {
    let mut h = harness();
    offer_sent(&mut h, Slot::P1).await;
    let first = h.connector.latest_for(Slot::P1).unwrap();
    let first_key = h.orchestrator.session_key(Slot::P1).unwrap();

    offer_sent(&mut h, Slot::P1).await;
    assert!(first.is_closed());
    let second_key = h.orchestrator.session_key(Slot::P1).unwrap();
    assert_equal!(second_key.slot, Slot::P1);
    assert!(second_key.generation > first_key.generation);

    first.fail("late failure");
    h.orchestrator.process_next_event().await;
    assert_equal!(
        h.orchestrator.session_state(Slot::P1),
        Some(NegotiationState::AwaitingAnswer)
    );
}

#[tokio::test]
async fn transport_failure_closes_only_that_slot() {
    let mut h = harness();
    let p1 = connected(&mut h, Slot::P1).await;
    connected(&mut h, Slot::P2).await;

    p1.fail("ice disconnected");
    h.orchestrator.process_next_event().await;

    assert_equal!(h.orchestrator.session_state(Slot::P1), Some(NegotiationState::Closed));
    assert_equal!(h.orchestrator.session_state(Slot::P2), Some(NegotiationState::Connected));
}

#[tokio::test]
async fn telegrams_are_injected_by_player_id() {
    let mut h = harness();
    let fake = connected(&mut h, Slot::P2).await;

    let state = InputState {
        stick: Vec2 { x: -1.0, y: 0.5 },
        button_a: true,
        touch_x: 0.5,
        touch_y: 0.5,
        touch_press: true,
        ..InputState::default()
    };
    fake.deliver("not json");
    fake.deliver(telegram(5, state));
    fake.deliver(telegram(1, state));
    for _ in 0..3 {
        h.orchestrator.process_next_event().await;
    }

    assert_equal!(h.sink.count(), 1);
    let sample = h.sink.latest(Slot::P2).unwrap();
    assert_equal!(sample.stick, Vec2 { x: -1.0, y: 0.5 });
    assert_equal!(sample.button_a, 1.0);
    assert_equal!(sample.touch_position, Vec2 { x: 960.0, y: 540.0 });
    assert_equal!(sample.touch_press, 1.0);
    assert!(h.sink.latest(Slot::P1).is_none());
}

#[tokio::test]
async fn teardown_closes_every_session() {
    let mut h = harness();
    connected(&mut h, Slot::P1).await;
    offer_sent(&mut h, Slot::P2).await;

    h.orchestrator.teardown().await;
    for slot in Slot::ALL {
        assert_equal!(h.orchestrator.session_state(slot), Some(NegotiationState::Closed));
        assert!(h.connector.latest_for(slot).unwrap().is_closed());
    }
}

#[tokio::test]
async fn run_stops_when_relay_goes_away() {
    let connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(RecordingSink::default());
    let (relay_tx, mut relay_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let link = RelayLink::from_channels(inbound_rx, relay_tx);
    let mut orchestrator = Orchestrator::new(connector.clone(), link.outbound, sink);

    inbound_tx.send(login(Slot::P1)).unwrap();
    let driver = tokio::spawn(async move {
        orchestrator.run(link.inbound, std::future::pending::<()>()).await;
        orchestrator
    });

    let offer = tokio::time::timeout(Duration::from_secs(2), relay_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_equal!(offer.kind, SignalKind::Offer);

    drop(inbound_tx);
    let orchestrator = driver.await.unwrap();
    assert_equal!(orchestrator.session_state(Slot::P1), Some(NegotiationState::Closed));
}
