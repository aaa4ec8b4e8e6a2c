use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    db::{MessageStore, StoreError},
    protocol::ServerEvent,
    registry::{ConnectionHandle, ConnectionId, Payload, Registry},
    rooms::{
        key::RoomKey,
        msg::{timestamp_now, Message, MessageId, SendMessageQuery},
    },
};

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    Validation(&'static str),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not format timestamp: {0}")]
    Clock(#[from] time::error::Format),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Joined(HashSet<RoomKey>),
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub room_key: RoomKey,
    pub messages: Vec<Message>,
}

pub struct Relay<S> {
    store: S,
    registry: Registry,
    outbox_capacity: usize,
}

impl<S: MessageStore> Relay<S> {
    pub fn new(store: S, outbox_capacity: usize) -> Self {
        Self {
            store,
            registry: Registry::new(),
            outbox_capacity,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn open_connection(&self) -> (ConnectionHandle, tokio::sync::mpsc::Receiver<Payload>) {
        let (conn, rx) = ConnectionHandle::new(self.outbox_capacity);
        debug!(connection = %conn.id(), "connection opened");
        (conn, rx)
    }

    /// Puts `conn` in the room shared by `user_id` and `receiver_id`.
    ///
    /// Joining is lenient: blank ids or an already disconnected handle are
    /// logged and ignored.
    pub async fn join(&self, conn: &ConnectionHandle, user_id: &str, receiver_id: &str) -> Option<RoomKey> {
        if user_id.trim().is_empty() || receiver_id.trim().is_empty() {
            warn!(connection = %conn.id(), "join ignored: missing participant id");
            return None;
        }
        if conn.is_disconnected() {
            debug!(connection = %conn.id(), "join ignored: connection already closed");
            return None;
        }

        let room = RoomKey::resolve(user_id, receiver_id);
        if self.registry.register(&room, conn).await {
            info!(connection = %conn.id(), user = user_id, %room, "joined room");
        }
        Some(room)
    }

    /// Realtime send: fingerprint, persist, then broadcast to the room.
    /// Nothing is broadcast unless the store accepted the message.
    pub async fn send(&self, query: SendMessageQuery) -> Result<Message, RelayError> {
        query.validate()?;

        let room = RoomKey::resolve(&query.sender_id, &query.receiver_id);
        let timestamp = timestamp_now()?;
        let id = MessageId::fingerprint(&query.sender_id, &query.receiver_id, &query.message, &timestamp);
        let message = Message {
            id: Some(id.clone()),
            sender_id: query.sender_id,
            receiver_id: query.receiver_id,
            message: query.message,
            timestamp,
        };
        let payload = encode(&ServerEvent::MessageDelivered {
            id,
            sender_id: message.sender_id.clone(),
            message: message.message.clone(),
            timestamp: message.timestamp.clone(),
        })?;

        let message = self.store.append(message).await.map_err(|err| {
            error!(%room, error = %err, "message not persisted, skipping broadcast");
            err
        })?;

        let delivered = self.registry.broadcast(&room, payload).await;
        info!(%room, sender = %message.sender_id, delivered, "message sent");
        Ok(message)
    }

    /// Stores a message without fingerprinting or broadcasting it.
    pub async fn submit(&self, query: SendMessageQuery) -> Result<Message, RelayError> {
        query.validate()?;

        let message = Message {
            id: None,
            sender_id: query.sender_id,
            receiver_id: query.receiver_id,
            message: query.message,
            timestamp: timestamp_now()?,
        };
        let message = self.store.append(message).await?;
        debug!(sender = %message.sender_id, receiver = %message.receiver_id, "message submitted");
        Ok(message)
    }

    pub async fn history(&self, a: &str, b: &str) -> Result<History, RelayError> {
        let room_key = RoomKey::resolve(a, b);
        let messages = self.store.query(a, b).await.map_err(|err| {
            error!(room = %room_key, error = %err, "history fetch failed");
            err
        })?;
        debug!(room = %room_key, count = messages.len(), "history fetched");
        Ok(History { room_key, messages })
    }

    /// Leaves every room. Safe to call more than once.
    pub async fn disconnect(&self, conn: &ConnectionHandle) {
        conn.mark_disconnected();
        let rooms = self.registry.deregister(conn.id()).await;
        info!(connection = %conn.id(), rooms = rooms.len(), "disconnected");
    }

    pub async fn state_of(&self, conn: &ConnectionHandle) -> ConnectionState {
        if conn.is_disconnected() {
            return ConnectionState::Disconnected;
        }
        let rooms = self.registry.rooms_of(conn.id()).await;
        if rooms.is_empty() {
            ConnectionState::Connected
        } else {
            ConnectionState::Joined(rooms)
        }
    }

    pub async fn rooms_of(&self, conn: ConnectionId) -> HashSet<RoomKey> {
        self.registry.rooms_of(conn).await
    }
}

pub fn encode(event: &ServerEvent) -> Result<Payload, serde_json::Error> {
    Ok(Arc::from(serde_json::to_string(event)?))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::db::SqliteMessageStore;

    async fn relay() -> Relay<SqliteMessageStore> {
        Relay::new(SqliteMessageStore::connect("sqlite::memory:", 1).await.unwrap(), 8)
    }

    fn query(sender: &str, receiver: &str, body: &str) -> SendMessageQuery {
        SendMessageQuery {
            sender_id: sender.to_owned(),
            receiver_id: receiver.to_owned(),
            message: body.to_owned(),
        }
    }

    fn decode(payload: Payload) -> ServerEvent {
        serde_json::from_str(&payload).unwrap()
    }

    /// Fails appends while `broken` is set.
    struct FlakyStore {
        inner: SqliteMessageStore,
        broken: AtomicBool,
    }

    impl MessageStore for FlakyStore {
        async fn append(&self, message: Message) -> Result<Message, StoreError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StoreError::Rejected("disk full".to_owned()));
            }
            self.inner.append(message).await
        }

        async fn query(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
            self.inner.query(a, b).await
        }
    }

    #[tokio::test]
    async fn both_participants_receive_the_stored_message() {
        let relay = relay().await;
        let (u1, mut u1_rx) = relay.open_connection();
        let (u2, mut u2_rx) = relay.open_connection();
        relay.join(&u1, "U1", "U2").await.unwrap();
        relay.join(&u2, "U2", "U1").await.unwrap();

        let sent = relay.send(query("U1", "U2", "hi")).await.unwrap();
        let fingerprint = MessageId::fingerprint("U1", "U2", "hi", &sent.timestamp);
        assert_eq!(sent.id.as_ref(), Some(&fingerprint));

        for rx in [&mut u1_rx, &mut u2_rx] {
            let ServerEvent::MessageDelivered { id, sender_id, message, timestamp } =
                decode(rx.recv().await.unwrap())
            else {
                panic!("expected a delivery");
            };
            assert_eq!(id, fingerprint);
            assert_eq!(sender_id, "U1");
            assert_eq!(message, "hi");
            assert_eq!(timestamp, sent.timestamp);
        }

        let history = relay.history("U2", "U1").await.unwrap();
        assert_eq!(history.room_key.as_str(), "U1-U2");
        assert_eq!(history.messages, vec![sent]);
    }

    #[tokio::test]
    async fn sequential_sends_keep_their_order() {
        let relay = relay().await;
        relay.send(query("U1", "U2", "a")).await.unwrap();
        relay.send(query("U1", "U2", "b")).await.unwrap();

        let bodies: Vec<_> = relay
            .history("U1", "U2")
            .await
            .unwrap()
            .messages
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(bodies, ["a", "b"]);
    }

    #[tokio::test]
    async fn failed_persistence_means_no_broadcast() {
        let store = FlakyStore {
            inner: SqliteMessageStore::connect("sqlite::memory:", 1).await.unwrap(),
            broken: AtomicBool::new(true),
        };
        let relay = Relay::new(store, 8);
        let (u2, mut u2_rx) = relay.open_connection();
        relay.join(&u2, "U2", "U1").await;

        let err = relay.send(query("U1", "U2", "lost")).await.unwrap_err();
        assert!(matches!(err, RelayError::Store(StoreError::Rejected(_))));
        assert!(u2_rx.try_recv().is_err());
        assert!(relay.history("U1", "U2").await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn invalid_send_has_no_side_effects() {
        let relay = relay().await;
        let (u2, mut u2_rx) = relay.open_connection();
        relay.join(&u2, "U2", "U1").await;

        let err = relay.send(query("U1", "U2", "")).await.unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        assert!(u2_rx.try_recv().is_err());
        assert!(relay.history("U1", "U2").await.unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn send_succeeds_when_a_recipient_is_gone() {
        let relay = relay().await;
        let (gone, gone_rx) = relay.open_connection();
        relay.join(&gone, "U2", "U1").await;
        drop(gone_rx);

        let sent = relay.send(query("U1", "U2", "still stored")).await.unwrap();
        assert_eq!(relay.history("U1", "U2").await.unwrap().messages, vec![sent]);
    }

    #[tokio::test]
    async fn submit_stores_without_fingerprint_or_broadcast() {
        let relay = relay().await;
        let (u2, mut u2_rx) = relay.open_connection();
        relay.join(&u2, "U2", "U1").await;

        let stored = relay.submit(query("U1", "U2", "offline")).await.unwrap();
        assert!(stored.id.is_none());
        assert!(u2_rx.try_recv().is_err());
        assert_eq!(relay.history("U1", "U2").await.unwrap().messages, vec![stored]);
    }

    #[tokio::test]
    async fn lifecycle_states() {
        let relay = relay().await;
        let (conn, _rx) = relay.open_connection();
        assert_eq!(relay.state_of(&conn).await, ConnectionState::Connected);

        let a = relay.join(&conn, "U1", "U2").await.unwrap();
        let b = relay.join(&conn, "U1", "U3").await.unwrap();
        assert_eq!(relay.state_of(&conn).await, ConnectionState::Joined(HashSet::from([a, b])));

        relay.disconnect(&conn).await;
        relay.disconnect(&conn).await;
        assert_eq!(relay.state_of(&conn).await, ConnectionState::Disconnected);
        assert!(relay.rooms_of(conn.id()).await.is_empty());

        assert!(relay.join(&conn, "U1", "U2").await.is_none());
        assert!(relay.rooms_of(conn.id()).await.is_empty());
    }

    #[tokio::test]
    async fn disconnected_connection_gets_no_more_messages() {
        let relay = relay().await;
        let (conn, mut rx) = relay.open_connection();
        relay.join(&conn, "U2", "U1").await;
        relay.disconnect(&conn).await;

        relay.send(query("U1", "U2", "after")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn blank_join_is_ignored() {
        let relay = relay().await;
        let (conn, _rx) = relay.open_connection();
        assert!(relay.join(&conn, "", "U2").await.is_none());
        assert_eq!(relay.state_of(&conn).await, ConnectionState::Connected);
    }
}
