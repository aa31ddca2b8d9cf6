use std::sync::Arc;
use std::time::Duration;

use k9::assert_equal;
use tokio::sync::oneshot;

use tabletlink_device::{ControllerPeer, SharedInput};
use tabletlink_host::{Orchestrator, RecordingSink};
use tabletlink_peer::fake::FakeConnector;
use tabletlink_peer::{relay_client, NegotiationState};
use tabletlink_proto::{IceCandidate, SignalingEnvelope, Slot, Vec2, HOST_ID};

async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

#[tokio::test]
async fn device_input_reaches_host_through_relay() {
    let (addr, _relay) = tabletlink_relay::spawn("127.0.0.1:0".parse().unwrap()).unwrap();
    let relay_url = format!("ws://{}", addr);

    // Host
    let host_connector = Arc::new(FakeConnector::new());
    let sink = Arc::new(RecordingSink::default());
    let host_link = relay_client::connect(&relay_url).await.unwrap();
    assert!(host_link.outbound.send(SignalingEnvelope::login(HOST_ID)));
    let mut orchestrator = Orchestrator::new(
        host_connector.clone(),
        host_link.outbound.clone(),
        sink.clone(),
    );
    let status = orchestrator.subscribe_status();
    let (host_stop, host_stopped) = oneshot::channel::<()>();
    let host = tokio::spawn(async move {
        orchestrator
            .run(host_link.inbound, async {
                let _ = host_stopped.await;
            })
            .await;
        orchestrator
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Device
    let device_connector = Arc::new(FakeConnector::new());
    let input = Arc::new(SharedInput::new());
    input.update(|s| {
        s.stick = Vec2 { x: 0.25, y: -0.75 };
        s.button_a = true;
    });
    input.set_pointer(100.0, 50.0, 200.0, 100.0, true);
    let device_link = relay_client::connect(&relay_url).await.unwrap();
    let mut device = ControllerPeer::new(
        Slot::P1,
        device_connector.clone(),
        device_link.outbound.clone(),
        input.clone(),
    );
    assert!(device.login());
    let (device_stop, device_stopped) = oneshot::channel::<()>();
    let device_task = tokio::spawn(async move {
        device
            .run(device_link.inbound, Duration::from_millis(10), async {
                let _ = device_stopped.await;
            })
            .await;
        device
    });

    // Offer and answer cross the relay.
    eventually("host to apply the answer", || {
        host_connector
            .latest_for(Slot::P1)
            .and_then(|c| c.remote_description())
            .is_some()
    })
    .await;
    let host_pc = host_connector.latest_for(Slot::P1).unwrap();
    let device_pc = device_connector.latest().unwrap();
    assert!(device_pc.remote_description().unwrap().sdp.contains("fake-offer"));
    assert!(host_pc.remote_description().unwrap().sdp.contains("fake-answer"));

    // A device candidate reaches the host's connection.
    let device_candidate = IceCandidate {
        candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    };
    device_pc.emit_local_candidate(device_candidate.clone());
    eventually("host to apply the device candidate", || {
        !host_pc.applied_candidates().is_empty()
    })
    .await;
    assert_equal!(host_pc.applied_candidates(), vec![device_candidate]);

    // Open both ends and let telegrams flow.
    host_pc.open_channel();
    device_pc.open_channel().link_to(host_pc.events().clone());

    assert!(sink.wait_for(1, Duration::from_secs(5)).await);
    let sample = sink.latest(Slot::P1).unwrap();
    assert_equal!(sample.stick, Vec2 { x: 0.25, y: -0.75 });
    assert_equal!(sample.button_a, 1.0);
    assert_equal!(sample.touch_position, Vec2 { x: 960.0, y: 540.0 });
    assert!(sink.latest(Slot::P2).is_none());
    assert_equal!(
        status.borrow().get(&Slot::P1).copied(),
        Some(NegotiationState::Connected)
    );

    device_stop.send(()).unwrap();
    host_stop.send(()).unwrap();
    let device = device_task.await.unwrap();
    let orchestrator = host.await.unwrap();
    assert_equal!(device.state(), Some(NegotiationState::Closed));
    assert_equal!(orchestrator.session_state(Slot::P1), Some(NegotiationState::Closed));
}
