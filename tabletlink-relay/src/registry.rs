use std::collections::HashMap;

use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;
use warp::ws::Message;

use tabletlink_proto::signal::{SignalKind, SignalingEnvelope};
use tabletlink_proto::HOST_ID;

pub type Tx = mpsc::Sender<Message>;
pub type ConnectionId = Uuid;

/// Identity assigned to a `login_notify` that carries no `id`.
pub const UNKNOWN_ID: &str = "unknown";

#[derive(Clone)]
pub struct ClientHandle {
    pub conn: ConnectionId,
    pub tx: Tx,
}

impl ClientHandle {
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// A forwarded envelope and the queue it should be written to.
pub struct Delivery {
    pub target: String,
    pub tx: Tx,
    pub envelope: SignalingEnvelope,
}

/// Outcome of routing one inbound envelope.
#[derive(Default)]
pub struct Dispatch {
    pub delivery: Option<Delivery>,
    /// A live connection that lost its identity to this registration.
    pub displaced: Option<ClientHandle>,
}

/// Identity -> connection table. Last registration wins.
#[derive(Default)]
pub struct Registry {
    clients: HashMap<String, ClientHandle>,
    identities: HashMap<ConnectionId, String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to `conn`, returning the handle of a different connection
    /// that previously held `id`.
    pub fn register(&mut self, id: String, conn: ConnectionId, tx: Tx) -> Option<ClientHandle> {
        if let Some(previous_id) = self.identities.insert(conn, id.clone()) {
            if previous_id != id {
                debug!("connection {} renamed {} -> {}", conn, previous_id, id);
                if self.clients.get(&previous_id).map(|c| c.conn) == Some(conn) {
                    self.clients.remove(&previous_id);
                }
            }
        }

        let displaced = self
            .clients
            .insert(id.clone(), ClientHandle { conn, tx })
            .filter(|old| old.conn != conn);

        if let Some(old) = &displaced {
            self.identities.remove(&old.conn);
            info!("identity {} re-registered; replacing connection {}", id, old.conn);
        } else {
            info!("registered {} on connection {}", id, conn);
        }
        displaced
    }

    /// Removes whatever identity `conn` holds, unless it was since taken over
    /// by another connection.
    pub fn unregister(&mut self, conn: ConnectionId) -> Option<String> {
        let id = self.identities.remove(&conn)?;
        if self.clients.get(&id).map(|c| c.conn) == Some(conn) {
            self.clients.remove(&id);
        }
        Some(id)
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<&str> {
        self.identities.get(&conn).map(String::as_str)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn open(&self, id: &str) -> Option<&ClientHandle> {
        self.clients.get(id).filter(|c| c.is_open())
    }

    /// Applies the routing rules to one envelope received on `conn`.
    pub fn route(&mut self, conn: ConnectionId, tx: &Tx, mut envelope: SignalingEnvelope) -> Dispatch {
        if envelope.kind == SignalKind::LoginNotify {
            let id = envelope.id.clone().unwrap_or_else(|| UNKNOWN_ID.to_string());
            let displaced = self.register(id.clone(), conn, tx.clone());

            let delivery = if id != HOST_ID {
                self.open(HOST_ID).map(|host| {
                    envelope.from = Some(id);
                    Delivery {
                        target: HOST_ID.to_string(),
                        tx: host.tx.clone(),
                        envelope,
                    }
                })
            } else {
                None
            };
            return Dispatch { delivery, displaced };
        }

        let from = self.identity_of(conn).map(str::to_string);
        envelope.from = from;

        if let Some(target) = envelope.target.clone() {
            if let Some(client) = self.open(&target) {
                return Dispatch {
                    delivery: Some(Delivery {
                        target,
                        tx: client.tx.clone(),
                        envelope,
                    }),
                    displaced: None,
                };
            }
        }

        // Fallback reply path: anything unroutable from a device goes to the host.
        if let Some(host) = self.clients.get(HOST_ID) {
            if host.conn != conn {
                return Dispatch {
                    delivery: Some(Delivery {
                        target: HOST_ID.to_string(),
                        tx: host.tx.clone(),
                        envelope,
                    }),
                    displaced: None,
                };
            }
        }

        debug!(
            "dropping {:?} from {:?}: target {:?} not registered",
            envelope.kind, envelope.from, envelope.target
        );
        Dispatch::default()
    }
}
