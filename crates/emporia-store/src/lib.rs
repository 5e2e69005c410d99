use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

/// Cart rows are keyed by their owner: the user id when the shopper is
/// logged in (shared across conversations), otherwise the conversation id
/// (guest cart, scoped to that conversation).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOwner {
    User(String),
    Conversation(String),
}

impl CartOwner {
    pub fn resolve(user_id: Option<&str>, conversation_id: &str) -> Self {
        match user_id {
            Some(uid) if !uid.trim().is_empty() => Self::User(uid.to_string()),
            _ => Self::Conversation(conversation_id.to_string()),
        }
    }

    fn key(&self) -> String {
        match self {
            Self::User(id) => format!("user:{id}"),
            Self::Conversation(id) => format!("conv:{id}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CartRow {
    pub product_id: i64,
    pub quantity: i64,
}

/// SQLite-backed store for conversations, messages and cart rows.
///
/// One connection behind an async mutex; WAL mode so concurrent turns do not
/// serialize on reads.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(db_path)?;
        Self::from_connection(conn).await
    }

    pub async fn in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?).await
    }

    async fn from_connection(conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(Duration::from_secs(10))?;
        // PRAGMA journal_mode returns a row, so query_row and ignore it.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .or_else(|e| match e {
                // In-memory databases report "memory" and that is fine.
                rusqlite::Error::QueryReturnedNoRows => Ok(()),
                other => Err(other),
            })?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(id),
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages(conversation_id);
            CREATE TABLE IF NOT EXISTS cart_items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                product_id INTEGER NOT NULL,
                quantity INTEGER NOT NULL DEFAULT 1,
                added_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(owner, product_id)
            );
            CREATE INDEX IF NOT EXISTS idx_cart_items_owner ON cart_items(owner);
            "#,
        )?;
        Ok(())
    }

    /// Record one completed exchange in a single transaction: the user turn
    /// and its paired assistant reply either both land or neither does.
    pub async fn record_exchange(
        &self,
        conversation_id: &str,
        user_text: &str,
        assistant_text: &str,
    ) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO conversations (id) VALUES (?1)
             ON CONFLICT(id) DO UPDATE SET updated_at = datetime('now')",
            params![conversation_id],
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content) VALUES (?1, 'user', ?2)",
            params![conversation_id, user_text],
        )?;
        tx.execute(
            "INSERT INTO messages (conversation_id, role, content) VALUES (?1, 'assistant', ?2)",
            params![conversation_id, assistant_text],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Most recent `limit` messages in chronological order.
    pub async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> StoreResult<Vec<StoredMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT role, content FROM messages
             WHERE conversation_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let mut rows = stmt
            .query_map(params![conversation_id, limit as i64], |row| {
                Ok(StoredMessage {
                    role: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.reverse();
        Ok(rows)
    }

    /// Upsert a cart row, incrementing the quantity if it already exists.
    /// Returns `(line_quantity, total_items)` where the total is the sum of
    /// all quantities in the owner's cart. One transaction per the increment
    /// so concurrent adds never lose updates.
    pub async fn add_cart_item(
        &self,
        owner: &CartOwner,
        product_id: i64,
        quantity: i64,
    ) -> StoreResult<(i64, i64)> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO cart_items (owner, product_id, quantity) VALUES (?1, ?2, ?3)
             ON CONFLICT(owner, product_id)
             DO UPDATE SET quantity = quantity + excluded.quantity",
            params![owner.key(), product_id, quantity],
        )?;
        let line_quantity: i64 = tx.query_row(
            "SELECT quantity FROM cart_items WHERE owner = ?1 AND product_id = ?2",
            params![owner.key(), product_id],
            |row| row.get(0),
        )?;
        let total_items: i64 = tx.query_row(
            "SELECT COALESCE(SUM(quantity), 0) FROM cart_items WHERE owner = ?1",
            params![owner.key()],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((line_quantity, total_items))
    }

    pub async fn cart_items(&self, owner: &CartOwner) -> StoreResult<Vec<CartRow>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT product_id, quantity FROM cart_items WHERE owner = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![owner.key()], |row| {
                Ok(CartRow {
                    product_id: row.get(0)?,
                    quantity: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a cart row entirely. Returns whether a row existed.
    pub async fn remove_cart_item(
        &self,
        owner: &CartOwner,
        product_id: i64,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM cart_items WHERE owner = ?1 AND product_id = ?2",
            params![owner.key(), product_id],
        )?;
        Ok(deleted > 0)
    }

    pub async fn message_count(&self, conversation_id: &str) -> StoreResult<i64> {
        let conn = self.conn.lock().await;
        let count = conn
            .query_row(
                "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
                params![conversation_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_exchange_pairs_user_and_assistant_rows() {
        let store = Store::in_memory().await.unwrap();
        store
            .record_exchange("c1", "hello", "hi there")
            .await
            .unwrap();

        let messages = store.recent_messages("c1", 10).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].content, "hi there");
    }

    #[tokio::test]
    async fn recent_messages_returns_latest_window_chronologically() {
        let store = Store::in_memory().await.unwrap();
        for i in 0..5 {
            store
                .record_exchange("c1", &format!("u{i}"), &format!("a{i}"))
                .await
                .unwrap();
        }
        let messages = store.recent_messages("c1", 4).await.unwrap();
        let contents = messages.iter().map(|m| m.content.as_str()).collect::<Vec<_>>();
        assert_eq!(contents, vec!["u3", "a3", "u4", "a4"]);
    }

    #[tokio::test]
    async fn add_to_cart_increments_existing_line() {
        let store = Store::in_memory().await.unwrap();
        let owner = CartOwner::Conversation("c1".to_string());

        let (line, total) = store.add_cart_item(&owner, 7, 2).await.unwrap();
        assert_eq!((line, total), (2, 2));

        let (line, total) = store.add_cart_item(&owner, 7, 3).await.unwrap();
        assert_eq!((line, total), (5, 5));

        let rows = store.cart_items(&owner).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, 5);
    }

    #[tokio::test]
    async fn total_items_sums_across_lines() {
        let store = Store::in_memory().await.unwrap();
        let owner = CartOwner::User("u1".to_string());

        store.add_cart_item(&owner, 1, 1).await.unwrap();
        let (_, total) = store.add_cart_item(&owner, 9, 2).await.unwrap();
        assert_eq!(total, 3);
    }

    #[tokio::test]
    async fn remove_reports_whether_row_existed() {
        let store = Store::in_memory().await.unwrap();
        let owner = CartOwner::Conversation("c1".to_string());

        assert!(!store.remove_cart_item(&owner, 7).await.unwrap());
        store.add_cart_item(&owner, 7, 1).await.unwrap();
        assert!(store.remove_cart_item(&owner, 7).await.unwrap());
        assert!(store.cart_items(&owner).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_cart_is_distinct_from_guest_cart() {
        let store = Store::in_memory().await.unwrap();
        let user = CartOwner::resolve(Some("u1"), "c1");
        let guest = CartOwner::resolve(None, "c1");
        assert_eq!(user, CartOwner::User("u1".to_string()));
        assert_eq!(guest, CartOwner::Conversation("c1".to_string()));

        store.add_cart_item(&user, 1, 1).await.unwrap();
        assert!(store.cart_items(&guest).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn open_persists_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emporia.db");
        {
            let store = Store::open(&path).await.unwrap();
            store.record_exchange("c1", "u", "a").await.unwrap();
        }
        let store = Store::open(&path).await.unwrap();
        assert_eq!(store.message_count("c1").await.unwrap(), 2);
    }
}
