use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::rooms::key::RoomKey;

pub type ConnectionId = Uuid;

/// Pre-encoded frame, shared by every recipient of a broadcast.
pub type Payload = Arc<str>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("connection {0} is closed")]
    Closed(ConnectionId),
    #[error("outbox of connection {0} is full")]
    Full(ConnectionId),
}

/// Sending half of a connection's outbox. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<Payload>,
    disconnected: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn new(capacity: usize) -> (ConnectionHandle, mpsc::Receiver<Payload>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        let handle = ConnectionHandle {
            id: Uuid::now_v7(),
            outbox,
            disconnected: Arc::new(AtomicBool::new(false)),
        };
        (handle, rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queues `payload` for the socket writer without waiting on it.
    pub fn deliver(&self, payload: Payload) -> Result<(), DeliveryError> {
        self.outbox.try_send(payload).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full(self.id),
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed(self.id),
        })
    }

    pub(crate) fn mark_disconnected(&self) {
        self.disconnected.store(true, Ordering::Release);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct Membership {
    rooms: HashMap<RoomKey, HashMap<ConnectionId, ConnectionHandle>>,
    joined: HashMap<ConnectionId, HashSet<RoomKey>>,
}

#[derive(Default, Clone)]
pub struct Registry {
    inner: Arc<RwLock<Membership>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `conn` to `room`. Registering twice changes nothing.
    /// Returns whether the connection was newly added.
    pub async fn register(&self, room: &RoomKey, conn: &ConnectionHandle) -> bool {
        let mut membership = self.inner.write().await;
        let added = membership
            .rooms
            .entry(room.clone())
            .or_default()
            .insert(conn.id(), conn.clone())
            .is_none();
        membership.joined.entry(conn.id()).or_default().insert(room.clone());
        added
    }

    /// Removes `conn` from every room it joined. Unknown connections are ignored.
    /// Returns the rooms it was removed from.
    pub async fn deregister(&self, conn: ConnectionId) -> HashSet<RoomKey> {
        let mut membership = self.inner.write().await;
        let Some(rooms) = membership.joined.remove(&conn) else {
            return HashSet::new();
        };

        for room in &rooms {
            if let Some(members) = membership.rooms.get_mut(room) {
                members.remove(&conn);
                if members.is_empty() {
                    membership.rooms.remove(room);
                }
            }
        }
        rooms
    }

    /// Hands `payload` to every connection in `room`, including the sender if
    /// it joined. A failed recipient is logged and skipped.
    /// Returns how many connections accepted the payload.
    pub async fn broadcast(&self, room: &RoomKey, payload: Payload) -> usize {
        let members: Vec<ConnectionHandle> = {
            let membership = self.inner.read().await;
            match membership.rooms.get(room) {
                Some(members) => members.values().cloned().collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        for member in members {
            match member.deliver(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(err) => warn!(%room, error = %err, "delivery failed"),
            }
        }
        debug!(%room, delivered, "broadcast");
        delivered
    }

    pub async fn rooms_of(&self, conn: ConnectionId) -> HashSet<RoomKey> {
        self.inner
            .read()
            .await
            .joined
            .get(&conn)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn members_of(&self, room: &RoomKey) -> usize {
        self.inner
            .read()
            .await
            .rooms
            .get(room)
            .map_or(0, HashMap::len)
    }
}
