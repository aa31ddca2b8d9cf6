//! TabletLink signaling relay.
//!
//! Routes signaling envelopes between the host and its handheld devices over
//! WebSocket connections keyed by the identity each client announces with
//! `login_notify`. Shared by the binary and the integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use tabletlink_proto::signal::SignalingEnvelope;

pub mod registry;

use registry::{ConnectionId, Delivery, Registry, Tx};

/// Channel buffer size - prevents unbounded memory growth
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Close code sent to a connection whose identity was taken by a newer login.
pub const IDENTITY_REPLACED_CODE: u16 = 4409;

pub const DEFAULT_LISTEN: &str = "0.0.0.0:3000";

/// Default timeout for [`probe`].
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(500);

const BANNER: &str = "TabletLink Relay is Active";

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen: SocketAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen = std::env::var("TABLETLINK_RELAY_LISTEN")
            .unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
        let listen = listen
            .parse()
            .with_context(|| format!("invalid TABLETLINK_RELAY_LISTEN {listen:?} (expected host:port)"))?;
        Ok(Self { listen })
    }
}

/// Process-scoped relay state. Created empty at startup and dropped with the
/// server; nothing survives a restart.
#[derive(Default)]
pub struct RelayState {
    registry: Mutex<Registry>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes one envelope received on `conn`.
    pub async fn dispatch(&self, conn: ConnectionId, tx: &Tx, envelope: SignalingEnvelope) {
        let dispatch = {
            let mut registry = self.registry.lock().await;
            registry.route(conn, tx, envelope)
        };

        if let Some(stale) = dispatch.displaced {
            if stale
                .tx
                .try_send(Message::close_with(IDENTITY_REPLACED_CODE, "identity_replaced"))
                .is_err()
            {
                log::debug!("stale connection {} already gone", stale.conn);
            }
        }

        if let Some(delivery) = dispatch.delivery {
            forward(delivery);
        }
    }

    /// Drops the registration held by `conn`, if it still owns one.
    pub async fn disconnect(&self, conn: ConnectionId) -> Option<String> {
        let mut registry = self.registry.lock().await;
        registry.unregister(conn)
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.registry.lock().await.is_registered(id)
    }

    pub async fn client_count(&self) -> usize {
        self.registry.lock().await.len()
    }
}

fn forward(delivery: Delivery) {
    let text = match serde_json::to_string(&delivery.envelope) {
        Ok(text) => text,
        Err(e) => {
            log::warn!("failed to encode envelope for {}: {}", delivery.target, e);
            return;
        }
    };
    log::debug!(
        "forwarding {:?} from {:?} to {}",
        delivery.envelope.kind,
        delivery.envelope.from,
        delivery.target
    );

    // Use try_send to avoid blocking; if channel is full, drop message (backpressure)
    if let Err(e) = delivery.tx.try_send(Message::text(text)) {
        match e {
            mpsc::error::TrySendError::Full(_) => log::warn!(
                "Dropping message for {}: channel full (backpressure)",
                delivery.target
            ),
            mpsc::error::TrySendError::Closed(_) => {
                log::debug!("Dropping message for {}: connection closed", delivery.target)
            }
        }
    }
}

/// Serves one client WebSocket until it disconnects.
pub async fn client_connection(ws: WebSocket, state: Arc<RelayState>) {
    let conn = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(CHANNEL_BUFFER_SIZE);

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = msg.is_close();
            if ws_tx.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    log::info!("client connected conn={}", conn);

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                log::debug!("conn={} read error: {}", conn, e);
                break;
            }
        };
        if msg.is_close() {
            break;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }

        let envelope: SignalingEnvelope = match serde_json::from_slice(msg.as_bytes()) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::warn!("conn={} sent malformed envelope: {}", conn, e);
                continue;
            }
        };

        state.dispatch(conn, &out_tx, envelope).await;
    }

    let id = state.disconnect(conn).await;
    writer.abort();
    log::info!("client disconnected conn={} id={:?}", conn, id);
}

pub fn routes(
    state: Arc<RelayState>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let ws = warp::path::end()
        .and(warp::ws())
        .and(with_state)
        .map(|ws: warp::ws::Ws, state: Arc<RelayState>| {
            ws.on_upgrade(move |socket| client_connection(socket, state))
        });
    let healthz = warp::path!("healthz").map(|| "ok");
    let hello = warp::path::end().map(|| BANNER);

    ws.or(healthz).or(hello).with(warp::log("tabletlink_relay"))
}

/// Runs the relay on `addr` until the future is dropped.
pub async fn serve(addr: SocketAddr) {
    let state = Arc::new(RelayState::new());
    log::info!("tabletlink-relay listening on {}", addr);
    warp::serve(routes(state)).run(addr).await;
}

/// Binds the relay (port 0 picks a free port) and runs it on a background
/// task. Returns the bound address.
pub fn spawn(addr: SocketAddr) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    spawn_with_state(addr, Arc::new(RelayState::new()))
}

/// Like [`spawn`], serving an existing `state` the caller can inspect.
pub fn spawn_with_state(
    addr: SocketAddr,
    state: Arc<RelayState>,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    let (bound, server) = warp::serve(routes(state))
        .try_bind_ephemeral(addr)
        .with_context(|| format!("binding relay on {addr}"))?;
    log::info!("tabletlink-relay listening on {}", bound);
    Ok((bound, tokio::spawn(server)))
}

/// Reports whether something accepts TCP connections at `addr` within
/// `timeout`.
pub async fn probe(addr: &str, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}
