//! Durable conversation records in SQLite
//!
//! One row per conversation. Messages live in a JSON column and are always
//! written as a whole, so a record is either fully the old value or fully the
//! new one. A non-unique index on `created_at` backs the newest-first listing.

use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::conversation::{Conversation, ConversationId, Message};

type ConversationRow = (i64, i64, String, i64);

/// Errors from the record store
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("Message encoding error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation not found: {0}")]
    NotFound(ConversationId),

    #[error("Conversation {0} was modified by another writer")]
    Conflict(ConversationId),
}

/// Record store for conversation persistence
#[derive(Debug, Clone)]
pub struct RecordStore {
    pool: SqlitePool,
}

impl RecordStore {
    /// Open (or create) the store at the given SQLite database path
    pub async fn new(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        tracing::debug!(path = %db_path.display(), "record store opened");
        Ok(store)
    }

    /// Create an in-memory store for testing
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self, StoreError> {
        // Every connection to `sqlite::memory:` is its own database, so pin
        // the pool to a single connection that never expires.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<std::time::Duration>)
            .max_lifetime(None::<std::time::Duration>)
            .connect("sqlite::memory:")
            .await?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                messages TEXT NOT NULL DEFAULT '[]',
                revision INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_conversations_created_at
            ON conversations(created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS preferences (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a conversation and return its id.
    ///
    /// With no initial value an empty conversation stamped with the current
    /// time is created. An initial value is inserted verbatim, keeping its id
    /// and timestamp; this is how restore brings records back.
    pub async fn create(&self, initial: Option<&Conversation>) -> Result<ConversationId, StoreError> {
        let id = match initial {
            None => {
                let created_at = Utc::now().timestamp_millis();
                sqlx::query("INSERT INTO conversations (created_at, messages) VALUES (?, '[]')")
                    .bind(created_at)
                    .execute(&self.pool)
                    .await?
                    .last_insert_rowid()
            }
            Some(conversation) => {
                let messages = serde_json::to_string(&conversation.messages)?;
                sqlx::query("INSERT INTO conversations (id, created_at, messages) VALUES (?, ?, ?)")
                    .bind(conversation.id)
                    .bind(conversation.created_at)
                    .bind(messages)
                    .execute(&self.pool)
                    .await?;
                conversation.id
            }
        };

        tracing::debug!(conversation = id, "conversation created");
        Ok(id)
    }

    /// Fetch one conversation
    pub async fn get(&self, id: ConversationId) -> Result<Conversation, StoreError> {
        let row: Option<ConversationRow> = sqlx::query_as(
            "SELECT id, created_at, messages, revision FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => decode_row(row),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Overwrite a conversation's messages.
    ///
    /// The write only lands if the stored revision still matches the one the
    /// caller read; on success `conversation.revision` is advanced to match.
    pub async fn put(&self, conversation: &mut Conversation) -> Result<(), StoreError> {
        let messages = serde_json::to_string(&conversation.messages)?;

        let result = sqlx::query(
            r#"
            UPDATE conversations
            SET messages = ?, revision = revision + 1
            WHERE id = ? AND revision = ?
            "#,
        )
        .bind(messages)
        .bind(conversation.id)
        .bind(conversation.revision)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(if self.exists(conversation.id).await? {
                StoreError::Conflict(conversation.id)
            } else {
                StoreError::NotFound(conversation.id)
            });
        }

        conversation.revision += 1;
        tracing::debug!(
            conversation = conversation.id,
            messages = conversation.messages.len(),
            "conversation written"
        );
        Ok(())
    }

    /// Delete a conversation. Deleting a missing id is not an error.
    pub async fn delete(&self, id: ConversationId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        tracing::debug!(conversation = id, "conversation deleted");
        Ok(())
    }

    /// Walk all conversations newest first.
    ///
    /// Rows are pulled from a live cursor, so each call starts a fresh
    /// traversal. Writes made while the stream is open may or may not show up.
    pub fn list_by_creation_desc(&self) -> BoxStream<'_, Result<Conversation, StoreError>> {
        sqlx::query_as::<_, ConversationRow>(
            r#"
            SELECT id, created_at, messages, revision
            FROM conversations
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .fetch(&self.pool)
        .map(|row| row.map_err(StoreError::from).and_then(decode_row))
        .boxed()
    }

    /// Every conversation in key order
    pub async fn all(&self) -> Result<Vec<Conversation>, StoreError> {
        let rows: Vec<ConversationRow> = sqlx::query_as(
            "SELECT id, created_at, messages, revision FROM conversations ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode_row).collect()
    }

    /// Replace every conversation with `conversations`, kept verbatim.
    ///
    /// Runs in one transaction: if any record is rejected the previous
    /// contents stay in place.
    pub async fn replace_all(&self, conversations: &[Conversation]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM conversations")
            .execute(&mut *tx)
            .await?
            .rows_affected();

        for conversation in conversations {
            let messages = serde_json::to_string(&conversation.messages)?;
            sqlx::query("INSERT INTO conversations (id, created_at, messages) VALUES (?, ?, ?)")
                .bind(conversation.id)
                .bind(conversation.created_at)
                .bind(messages)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::info!(removed, inserted = conversations.len(), "record store replaced");
        Ok(())
    }

    /// Read a preference value
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<(String,)> = sqlx::query_as("SELECT value FROM preferences WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.map(|(value,)| value))
    }

    /// Write a preference value
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO preferences (key, value) VALUES (?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn exists(&self, id: ConversationId) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }
}

fn decode_row((id, created_at, messages, revision): ConversationRow) -> Result<Conversation, StoreError> {
    let messages: Vec<Message> = serde_json::from_str(&messages)?;
    Ok(Conversation {
        id,
        created_at,
        messages,
        revision,
    })
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn restored(id: ConversationId, created_at: i64, messages: Vec<Message>) -> Conversation {
        Conversation {
            id,
            created_at,
            messages,
            revision: 0,
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = RecordStore::new_in_memory().await.unwrap();

        let id = store.create(None).await.unwrap();
        let conversation = store.get(id).await.unwrap();

        assert_eq!(conversation.id, id);
        assert!(conversation.messages.is_empty());
        assert!(conversation.created_at > 0);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let store = RecordStore::new_in_memory().await.unwrap();

        let first = store.create(None).await.unwrap();
        let second = store.create(None).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_create_preserves_restored_record() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let original = restored(42, 1_700_000_000_000, vec![Message::user("Hello")]);

        let id = store.create(Some(&original)).await.unwrap();
        assert_eq!(id, 42);

        let fetched = store.get(42).await.unwrap();
        assert_eq!(fetched.created_at, 1_700_000_000_000);
        assert_eq!(fetched.messages, vec![Message::user("Hello")]);

        // New ids never collide with restored ones
        let next = store.create(None).await.unwrap();
        assert!(next > 42);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_id() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let original = restored(3, 1, vec![]);

        store.create(Some(&original)).await.unwrap();
        let err = store.create(Some(&original)).await.unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let err = store.get(999).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(999)));
    }

    #[tokio::test]
    async fn test_put_overwrites_messages() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let id = store.create(None).await.unwrap();

        let mut conversation = store.get(id).await.unwrap();
        conversation.messages.push(Message::user("Hello"));
        conversation.messages.push(Message::assistant("Hi there!"));
        store.put(&mut conversation).await.unwrap();
        assert_eq!(conversation.revision, 1);

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.messages.len(), 2);
        assert_eq!(fetched.messages[1].content, "Hi there!");
        assert_eq!(fetched.revision, 1);
    }

    #[tokio::test]
    async fn test_put_missing_is_not_found() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let mut ghost = restored(5, 1, vec![Message::user("?")]);

        let err = store.put(&mut ghost).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(5)));
    }

    #[tokio::test]
    async fn test_stale_put_is_a_conflict() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let id = store.create(None).await.unwrap();

        let mut first = store.get(id).await.unwrap();
        let mut second = store.get(id).await.unwrap();

        first.messages.push(Message::user("one"));
        store.put(&mut first).await.unwrap();

        second.messages.push(Message::user("two"));
        let err = store.put(&mut second).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(c) if c == id));

        let fetched = store.get(id).await.unwrap();
        assert_eq!(fetched.messages, vec![Message::user("one")]);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = RecordStore::new_in_memory().await.unwrap();
        let id = store.create(None).await.unwrap();

        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_listing_is_newest_first() {
        let store = RecordStore::new_in_memory().await.unwrap();
        for (id, created_at) in [(1, 3_000), (2, 1_000), (3, 2_000)] {
            store.create(Some(&restored(id, created_at, vec![]))).await.unwrap();
        }

        let listed: Vec<Conversation> = store.list_by_creation_desc().try_collect().await.unwrap();
        let stamps: Vec<i64> = listed.iter().map(|c| c.created_at).collect();
        assert_eq!(stamps, vec![3_000, 2_000, 1_000]);

        // A second traversal sees the current state
        store.delete(1).await.unwrap();
        let listed: Vec<Conversation> = store.list_by_creation_desc().try_collect().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, 3);
    }

    #[tokio::test]
    async fn test_replace_all_and_all() {
        let store = RecordStore::new_in_memory().await.unwrap();
        store.create(Some(&restored(9, 10, vec![]))).await.unwrap();
        store.create(Some(&restored(4, 20, vec![]))).await.unwrap();

        let ids: Vec<ConversationId> = store.all().await.unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![4, 9]);

        store
            .replace_all(&[restored(2, 30, vec![Message::user("kept")])])
            .await
            .unwrap();
        let ids: Vec<ConversationId> = store.all().await.unwrap().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![2]);

        store.replace_all(&[]).await.unwrap();
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_replace_keeps_previous_records() {
        let store = RecordStore::new_in_memory().await.unwrap();
        store
            .create(Some(&restored(1, 10, vec![Message::user("precious")])))
            .await
            .unwrap();

        let duplicate = restored(7, 20, vec![Message::user("x")]);
        let err = store
            .replace_all(&[duplicate.clone(), duplicate])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Storage(_)));

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, 1);
        assert_eq!(all[0].messages, vec![Message::user("precious")]);
    }

    #[tokio::test]
    async fn test_settings_round_trip() {
        let store = RecordStore::new_in_memory().await.unwrap();
        assert_eq!(store.get_setting("system_prompt").await.unwrap(), None);

        store.set_setting("system_prompt", "Be brief.").await.unwrap();
        store.set_setting("system_prompt", "Be thorough.").await.unwrap();
        assert_eq!(
            store.get_setting("system_prompt").await.unwrap(),
            Some("Be thorough.".to_string())
        );
    }
}
