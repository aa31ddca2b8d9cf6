use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use url::Url;

use tabletlink_proto::signal::SignalingEnvelope;

/// Outbound half of a relay connection. Cheap to clone.
#[derive(Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<SignalingEnvelope>,
}

impl RelaySender {
    pub fn new(tx: mpsc::UnboundedSender<SignalingEnvelope>) -> Self {
        Self { tx }
    }

    /// Queues `envelope` for the relay. Returns false once the connection is
    /// gone; nothing is retried.
    pub fn send(&self, envelope: SignalingEnvelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

/// A live relay connection split into decoded inbound envelopes and an
/// outbound sender.
pub struct RelayLink {
    pub inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
    pub outbound: RelaySender,
}

impl RelayLink {
    /// Wires a link from plain channels, for driving a loop without a relay.
    pub fn from_channels(
        inbound: mpsc::UnboundedReceiver<SignalingEnvelope>,
        outbound: mpsc::UnboundedSender<SignalingEnvelope>,
    ) -> Self {
        Self {
            inbound,
            outbound: RelaySender::new(outbound),
        }
    }
}

/// Connect to relay server via WebSocket
pub async fn connect(relay_url: &str) -> Result<RelayLink> {
    let url = Url::parse(relay_url).context("Invalid relay URL")?;

    info!("Connecting to relay: {}", url);
    let (ws_stream, _) = connect_async(url.as_str())
        .await
        .context("Failed to connect to relay")?;
    info!("Connected to relay server!");

    let (mut write, mut read) = ws_stream.split();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalingEnvelope>();

    tokio::spawn(async move {
        while let Some(envelope) = out_rx.recv().await {
            let text = match serde_json::to_string(&envelope) {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to encode {:?} envelope: {}", envelope.kind, e);
                    continue;
                }
            };
            if write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = read.next().await {
            let bytes = match msg {
                Ok(Message::Text(text)) => text.into_bytes(),
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(frame)) => {
                    info!("Relay connection closed: {:?}", frame);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("Relay WebSocket error: {}", e);
                    break;
                }
            };
            match serde_json::from_slice::<SignalingEnvelope>(&bytes) {
                Ok(envelope) => {
                    debug!("relay -> {:?} from {:?}", envelope.kind, envelope.sender());
                    if in_tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("dropping malformed relay message: {}", e),
            }
        }
    });

    Ok(RelayLink {
        inbound: in_rx,
        outbound: RelaySender::new(out_tx),
    })
}
