use std::future::Future;

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

use crate::rooms::msg::{Message, MessageId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("message store unavailable: {0}")]
    Database(#[from] sqlx::Error),
    #[error("message store rejected the write: {0}")]
    Rejected(String),
}

/// Durable, append-only message history.
///
/// Implementations handle their own concurrency; the relay calls them from
/// many connection tasks at once.
pub trait MessageStore: Send + Sync + 'static {
    fn append(&self, message: Message) -> impl Future<Output = Result<Message, StoreError>> + Send;

    /// Every message exchanged between `a` and `b` in either direction,
    /// oldest first.
    fn query(&self, a: &str, b: &str) -> impl Future<Output = Result<Vec<Message>, StoreError>> + Send;
}

#[derive(Clone)]
pub struct SqliteMessageStore {
    db_pool: SqlitePool,
}

impl SqliteMessageStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let mut options = SqlitePoolOptions::new().max_connections(max_connections);
        // every in-memory connection is its own database
        if database_url.contains(":memory:") {
            options = options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let store = Self::new(options.connect(database_url).await?);
        store.migrate().await?;
        info!(database_url, "message store ready");
        Ok(store)
    }

    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT,
                sender_id TEXT NOT NULL,
                receiver_id TEXT NOT NULL,
                message TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )",
        )
        .execute(&self.db_pool)
        .await?;
        sqlx::query("CREATE UNIQUE INDEX IF NOT EXISTS messages_id ON messages (id)")
            .execute(&self.db_pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS messages_pair ON messages (sender_id, receiver_id, timestamp)")
            .execute(&self.db_pool)
            .await?;
        Ok(())
    }
}

impl MessageStore for SqliteMessageStore {
    async fn append(&self, message: Message) -> Result<Message, StoreError> {
        // a fingerprint that is already stored is the same logical message
        sqlx::query(
            "INSERT INTO messages (id,sender_id,receiver_id,message,timestamp) VALUES (?,?,?,?,?)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(message.id.as_ref().map(MessageId::as_str))
        .bind(&message.sender_id)
        .bind(&message.receiver_id)
        .bind(&message.message)
        .bind(&message.timestamp)
        .execute(&self.db_pool)
        .await?;

        Ok(message)
    }

    async fn query(&self, a: &str, b: &str) -> Result<Vec<Message>, StoreError> {
        let rows: Vec<(Option<String>, String, String, String, String)> = sqlx::query_as(
            "SELECT id,sender_id,receiver_id,message,timestamp FROM messages
             WHERE (sender_id=?1 AND receiver_id=?2) OR (sender_id=?2 AND receiver_id=?1)
             ORDER BY timestamp ASC, rowid ASC",
        )
        .bind(a)
        .bind(b)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, sender_id, receiver_id, message, timestamp)| Message {
                id: id.map(MessageId::from),
                sender_id,
                receiver_id,
                message,
                timestamp,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteMessageStore {
        SqliteMessageStore::connect("sqlite::memory:", 1).await.unwrap()
    }

    fn msg(sender: &str, receiver: &str, body: &str, timestamp: &str) -> Message {
        Message {
            id: Some(MessageId::fingerprint(sender, receiver, body, timestamp)),
            sender_id: sender.to_owned(),
            receiver_id: receiver.to_owned(),
            message: body.to_owned(),
            timestamp: timestamp.to_owned(),
        }
    }

    #[tokio::test]
    async fn query_matches_both_directions_in_time_order() {
        let store = store().await;
        store.append(msg("U2", "U1", "second", "2024-01-01T00:00:02.000Z")).await.unwrap();
        store.append(msg("U1", "U2", "first", "2024-01-01T00:00:01.000Z")).await.unwrap();
        store.append(msg("U1", "U3", "elsewhere", "2024-01-01T00:00:00.000Z")).await.unwrap();

        let history = store.query("U1", "U2").await.unwrap();
        let bodies: Vec<_> = history.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(bodies, ["first", "second"]);
        assert_eq!(store.query("U2", "U1").await.unwrap(), history);
    }

    #[tokio::test]
    async fn equal_timestamps_keep_insertion_order() {
        let store = store().await;
        store.append(msg("U1", "U2", "a", "2024-01-01T00:00:00.000Z")).await.unwrap();
        store.append(msg("U1", "U2", "b", "2024-01-01T00:00:00.000Z")).await.unwrap();

        let bodies: Vec<_> = store
            .query("U1", "U2")
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.message)
            .collect();
        assert_eq!(bodies, ["a", "b"]);
    }

    #[tokio::test]
    async fn same_fingerprint_is_stored_once() {
        let store = store().await;
        let m = msg("U1", "U2", "hi", "2024-01-01T00:00:00.000Z");
        store.append(m.clone()).await.unwrap();
        store.append(m.clone()).await.unwrap();

        assert_eq!(store.query("U1", "U2").await.unwrap(), vec![m]);
    }

    #[tokio::test]
    async fn messages_without_fingerprint_are_never_merged() {
        let store = store().await;
        let mut m = msg("U1", "U2", "hi", "2024-01-01T00:00:00.000Z");
        m.id = None;
        store.append(m.clone()).await.unwrap();
        store.append(m).await.unwrap();

        assert_eq!(store.query("U1", "U2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_history_is_not_an_error() {
        assert!(store().await.query("nobody", "else").await.unwrap().is_empty());
    }
}
