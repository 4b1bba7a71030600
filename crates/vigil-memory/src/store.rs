use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use vigil_core::error::StoreError;
use vigil_core::state::ConversationState;
use vigil_core::traits::StateStore;
use vigil_core::types::ConversationId;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS conversations (
        conversation_id TEXT PRIMARY KEY,
        state_json TEXT NOT NULL,
        passes INTEGER NOT NULL DEFAULT 0,
        updated_at TEXT NOT NULL
    );";

/// SQLite-backed conversation store. One row per conversation, upserted on save.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Backend(format!("Failed to create store directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        debug!(path = %path.display(), "SQLite state store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Backend(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Conversation identities with persisted state, most recently updated first.
    pub fn list(&self, limit: usize) -> Result<Vec<ConversationId>, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT conversation_id FROM conversations
                 ORDER BY updated_at DESC
                 LIMIT ?1",
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut ids = Vec::new();
        for row in rows {
            let id = row.map_err(|e| StoreError::Backend(e.to_string()))?;
            ids.push(ConversationId(id));
        }
        Ok(ids)
    }
}

impl StateStore for SqliteStore {
    fn load(&self, id: &ConversationId) -> BoxFuture<'_, Result<ConversationState, StoreError>> {
        let id = id.clone();
        Box::pin(async move {
            let conn = self
                .conn
                .lock()
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            let json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM conversations WHERE conversation_id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            match json {
                Some(json) => serde_json::from_str(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string())),
                None => Ok(ConversationState::new(id)),
            }
        })
    }

    fn save(
        &self,
        id: &ConversationId,
        state: &ConversationState,
    ) -> BoxFuture<'_, Result<(), StoreError>> {
        let id = id.clone();
        let passes = state.passes() as i64;
        let json = serde_json::to_string(state).map_err(|e| StoreError::Serialization(e.to_string()));

        Box::pin(async move {
            let json = json?;
            let conn = self
                .conn
                .lock()
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            conn.execute(
                "INSERT INTO conversations (conversation_id, state_json, passes, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(conversation_id) DO UPDATE SET
                     state_json = excluded.state_json,
                     passes = excluded.passes,
                     updated_at = excluded.updated_at",
                params![id.0, json, passes, Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::Backend(e.to_string()))?;

            debug!(conversation = %id, passes, "Conversation state saved");
            Ok(())
        })
    }
}
