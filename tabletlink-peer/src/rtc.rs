//! Peer transport backed by webrtc-rs.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use log::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use tabletlink_proto::signal::IceCandidate;

use crate::transport::{
    DataChannel, EventSink, PeerConnection, PeerConnector, PeerError, PeerEvent, SdpKind,
    SessionDescription,
};

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Result<Self, PeerError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(PeerError::negotiation)?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(PeerError::negotiation)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, ice_servers })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(&self, events: EventSink) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.configuration())
                .await
                .map_err(PeerError::negotiation)?,
        );

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let sink = sink.clone();
            Box::pin(async move {
                // `None` marks the end of gathering.
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        sink.post(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => warn!("session {}: unusable local candidate: {}", sink.key(), e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let sink = sink.clone();
            Box::pin(async move {
                debug!("session {}: peer connection {}", sink.key(), state);
                if state == RTCPeerConnectionState::Failed {
                    sink.post(PeerEvent::TransportFailed(
                        "peer connection failed".to_string(),
                    ));
                }
            })
        }));

        // The answering side is handed its channel by the offerer.
        let sink = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            info!("session {}: remote opened channel {:?}", sink.key(), dc.label());
            watch_channel(&dc, sink.clone());
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcPeerConnection { pc, events }))
    }
}

/// Posts open and message callbacks of `dc` into the session loop.
fn watch_channel(dc: &Arc<RTCDataChannel>, events: EventSink) {
    let weak: Weak<RTCDataChannel> = Arc::downgrade(dc);
    let sink = events.clone();
    dc.on_open(Box::new(move || {
        if let Some(dc) = weak.upgrade() {
            sink.post(PeerEvent::ChannelOpen(Arc::new(WebRtcDataChannel { inner: dc })));
        }
        Box::pin(async {})
    }));

    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        events.post(PeerEvent::ChannelMessage(msg.data));
        Box::pin(async {})
    }));
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp),
    }
    .map_err(PeerError::negotiation)
}

pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    events: EventSink,
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(PeerError::negotiation)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(PeerError::negotiation)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(PeerError::negotiation)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(PeerError::negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(PeerError::negotiation)
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(init))
            .await
            .map_err(PeerError::negotiation)?;
        watch_channel(&dc, self.events.clone());
        Ok(Arc::new(WebRtcDataChannel { inner: dc }))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("session {}: close: {}", self.events.key(), e);
        }
    }
}

pub struct WebRtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for WebRtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::ChannelNotOpen);
        }
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(PeerError::negotiation)
    }
}
