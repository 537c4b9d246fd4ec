use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use at_driver_proto::{Capabilities, ServerEvent};
use dashmap::DashMap;
use metrics::{counter, gauge};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const ERROR_CHANNEL_CAPACITY: usize = 64;

/// Frames a connection may have waiting for its writer before broadcasts to
/// it start failing.
pub const OUTBOUND_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: String,
    pub capabilities: Capabilities,
}

/// A frame that could not be handed to, or written on, one connection.
#[derive(Debug, Clone, thiserror::Error)]
#[error("failed to deliver event to {connection_id}: {reason}")]
pub struct DeliveryError {
    pub connection_id: ConnectionId,
    pub reason: String,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub skipped: usize,
    pub failed: usize,
}

struct ClientEntry {
    outbound: mpsc::Sender<String>,
    session: Option<Session>,
}

/// Every open command connection, keyed by connection id.
#[derive(Clone)]
pub struct ClientRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    clients: DashMap<ConnectionId, ClientEntry>,
    next_id: AtomicU64,
    errors: broadcast::Sender<DeliveryError>,
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientRegistry {
    pub fn new() -> Self {
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RegistryInner {
                clients: DashMap::new(),
                next_id: AtomicU64::new(1),
                errors,
            }),
        }
    }

    pub fn register(&self, outbound: mpsc::Sender<String>) -> ConnectionId {
        let id = ConnectionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.clients.insert(
            id,
            ClientEntry {
                outbound,
                session: None,
            },
        );
        counter!("at_driver_connections_total", 1);
        gauge!("at_driver_connections_active", self.len() as f64);
        id
    }

    /// Drop a connection and its session. Returns the session it held.
    pub fn unregister(&self, id: ConnectionId) -> Option<Session> {
        let removed = self.inner.clients.remove(&id).and_then(|(_, entry)| entry.session);
        gauge!("at_driver_connections_active", self.len() as f64);
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.clients.is_empty()
    }

    pub fn session(&self, id: ConnectionId) -> Option<Session> {
        self.inner
            .clients
            .get(&id)
            .and_then(|entry| entry.session.clone())
    }

    /// Attach `candidate` unless the connection already holds a session, and
    /// return whichever session the connection ends up with.
    pub fn attach_session(&self, id: ConnectionId, candidate: Session) -> Session {
        match self.inner.clients.get_mut(&id) {
            Some(mut entry) => entry.session.get_or_insert(candidate).clone(),
            None => {
                debug!(connection_id = %id, "session requested for closed connection");
                candidate
            }
        }
    }

    pub fn errors(&self) -> broadcast::Receiver<DeliveryError> {
        self.inner.errors.subscribe()
    }

    pub fn broadcaster(&self) -> Broadcaster {
        Broadcaster {
            clients: self.clone(),
        }
    }

    /// Publish `err` to every `errors()` subscriber.
    pub fn report_failure(&self, err: DeliveryError) {
        counter!("at_driver_delivery_failures_total", 1);
        if self.inner.errors.send(err).is_err() {
            warn!("delivery failed with no error subscriber");
        }
    }

    fn broadcast_text(&self, text: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for entry in self.inner.clients.iter() {
            if entry.session.is_none() {
                report.skipped += 1;
                continue;
            }
            let reason = match entry.outbound.try_send(text.to_owned()) {
                Ok(()) => {
                    report.delivered += 1;
                    continue;
                }
                Err(TrySendError::Full(_)) => "outbound queue full",
                Err(TrySendError::Closed(_)) => "connection closed",
            };
            report.failed += 1;
            self.report_failure(DeliveryError {
                connection_id: *entry.key(),
                reason: reason.to_string(),
            });
        }
        counter!("at_driver_broadcast_deliveries_total", report.delivered as u64);
        report
    }
}

/// Cloneable handle for pushing events to every sessioned client.
#[derive(Clone)]
pub struct Broadcaster {
    clients: ClientRegistry,
}

impl Broadcaster {
    pub fn broadcast(&self, event: &ServerEvent) -> Result<BroadcastReport, serde_json::Error> {
        let text = serde_json::to_string(event)?;
        Ok(self.clients.broadcast_text(&text))
    }
}

/// What a command handler may know about the connection it serves.
pub struct ConnectionContext<'a> {
    id: ConnectionId,
    clients: &'a ClientRegistry,
}

impl<'a> ConnectionContext<'a> {
    pub fn new(id: ConnectionId, clients: &'a ClientRegistry) -> Self {
        Self { id, clients }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn session(&self) -> Option<Session> {
        self.clients.session(self.id)
    }

    pub fn attach_session(&self, candidate: Session) -> Session {
        self.clients.attach_session(self.id, candidate)
    }
}
