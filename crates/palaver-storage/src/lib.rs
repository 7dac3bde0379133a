//! Palaver Storage
//!
//! Per-sender conversation state behind the `ConversationStore` trait, with a
//! SQLite backend and an in-memory backend

mod memory;

pub use memory::MemoryStore;

use chrono::{DateTime, Utc};
use palaver_events::Locale;
use rusqlite::OptionalExtension;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const STATE_COLUMNS: &str = "sender_id, first_seen_at, turn_count, last_inbound_text, last_generated_reply, preferred_language, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderState {
    pub sender_id: String,
    pub first_seen_at: DateTime<Utc>,
    pub turn_count: u64,
    pub last_inbound_text: Option<String>,
    pub last_generated_reply: Option<String>,
    pub preferred_language: Locale,
    pub updated_at: DateTime<Utc>,
}

impl SenderState {
    /// Defaults for a sender that has never been seen, before the first increment.
    pub(crate) fn unseen(sender_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            first_seen_at: now,
            turn_count: 0,
            last_inbound_text: None,
            last_generated_reply: None,
            preferred_language: Locale::default(),
            updated_at: now,
        }
    }
}

/// Partial update; `None` fields keep their stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDelta {
    pub last_inbound_text: Option<String>,
    pub last_generated_reply: Option<String>,
    pub preferred_language: Option<Locale>,
}

impl StateDelta {
    pub fn is_empty(&self) -> bool {
        self.last_inbound_text.is_none()
            && self.last_generated_reply.is_none()
            && self.preferred_language.is_none()
    }

    pub fn apply_to(&self, state: &mut SenderState, now: DateTime<Utc>) {
        if let Some(text) = &self.last_inbound_text {
            state.last_inbound_text = Some(text.clone());
        }
        if let Some(reply) = &self.last_generated_reply {
            state.last_generated_reply = Some(reply.clone());
        }
        if let Some(language) = self.preferred_language {
            state.preferred_language = language;
        }
        state.updated_at = now;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreFailure {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt state for sender {sender_id}: {detail}")]
    Corrupt { sender_id: String, detail: String },
    #[error("no state stored for sender {0}")]
    UnknownSender(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait::async_trait]
pub trait ConversationStore: Send + Sync {
    /// Creates the sender with defaults if absent and increments `turn_count`,
    /// as one atomic read-modify-write.
    async fn upsert_and_increment(&self, sender_id: &str) -> Result<SenderState, StoreFailure>;

    async fn update(&self, sender_id: &str, delta: &StateDelta) -> Result<(), StoreFailure>;

    async fn get(&self, sender_id: &str) -> Result<Option<SenderState>, StoreFailure>;
}

/// SQLite backend. Statements run on the blocking pool so a busy database
/// never stalls a runtime worker.
pub struct Storage {
    conn: Arc<Mutex<rusqlite::Connection>>,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreFailure> {
        let conn = rusqlite::Connection::open(db_path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sender_states (
                sender_id TEXT PRIMARY KEY,
                first_seen_at TEXT NOT NULL,
                turn_count INTEGER NOT NULL DEFAULT 0,
                last_inbound_text TEXT,
                last_generated_reply TEXT,
                preferred_language TEXT NOT NULL DEFAULT 'en',
                updated_at TEXT NOT NULL
            );
            ",
        )?;

        tracing::debug!(
            path = %db_path.as_ref().display(),
            journal_mode = %journal_mode,
            "Conversation store opened"
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreFailure>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> Result<T, StoreFailure> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&conn)
        })
        .await
        .map_err(|e| StoreFailure::Unavailable(format!("store task failed: {}", e)))?
    }
}

#[async_trait::async_trait]
impl ConversationStore for Storage {
    async fn upsert_and_increment(&self, sender_id: &str) -> Result<SenderState, StoreFailure> {
        let sender_id = sender_id.to_string();
        let now = Utc::now().to_rfc3339();
        let row = self
            .with_conn(move |conn| {
                Ok(conn.query_row(
                    &format!(
                        "INSERT INTO sender_states (sender_id, first_seen_at, turn_count, preferred_language, updated_at)
                         VALUES (?1, ?2, 1, ?3, ?2)
                         ON CONFLICT(sender_id)
                         DO UPDATE SET turn_count = turn_count + 1, updated_at = excluded.updated_at
                         RETURNING {}",
                        STATE_COLUMNS
                    ),
                    (&sender_id, &now, Locale::default().code()),
                    StateRow::read,
                )?)
            })
            .await?;
        row.into_state()
    }

    async fn update(&self, sender_id: &str, delta: &StateDelta) -> Result<(), StoreFailure> {
        let sender_id = sender_id.to_string();
        let delta = delta.clone();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE sender_states
                 SET last_inbound_text = COALESCE(?2, last_inbound_text),
                     last_generated_reply = COALESCE(?3, last_generated_reply),
                     preferred_language = COALESCE(?4, preferred_language),
                     updated_at = ?5
                 WHERE sender_id = ?1",
                (
                    &sender_id,
                    delta.last_inbound_text.as_deref(),
                    delta.last_generated_reply.as_deref(),
                    delta.preferred_language.map(Locale::code),
                    now,
                ),
            )?;

            if changed == 0 {
                return Err(StoreFailure::UnknownSender(sender_id));
            }
            Ok(())
        })
        .await
    }

    async fn get(&self, sender_id: &str) -> Result<Option<SenderState>, StoreFailure> {
        let sender_id = sender_id.to_string();
        let row = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {} FROM sender_states WHERE sender_id = ?1",
                    STATE_COLUMNS
                ))?;
                Ok(stmt.query_row([&sender_id], StateRow::read).optional()?)
            })
            .await?;
        row.map(StateRow::into_state).transpose()
    }
}

struct StateRow {
    sender_id: String,
    first_seen_at: String,
    turn_count: i64,
    last_inbound_text: Option<String>,
    last_generated_reply: Option<String>,
    preferred_language: String,
    updated_at: String,
}

impl StateRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            sender_id: row.get(0)?,
            first_seen_at: row.get(1)?,
            turn_count: row.get(2)?,
            last_inbound_text: row.get(3)?,
            last_generated_reply: row.get(4)?,
            preferred_language: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_state(self) -> Result<SenderState, StoreFailure> {
        let StateRow {
            sender_id,
            first_seen_at,
            turn_count,
            last_inbound_text,
            last_generated_reply,
            preferred_language,
            updated_at,
        } = self;
        let corrupt = |detail: String| StoreFailure::Corrupt {
            sender_id: sender_id.clone(),
            detail,
        };

        let first_seen_at = parse_timestamp(&first_seen_at).map_err(corrupt)?;
        let updated_at = parse_timestamp(&updated_at).map_err(corrupt)?;
        let turn_count = u64::try_from(turn_count)
            .map_err(|_| corrupt(format!("negative turn_count {}", turn_count)))?;
        let preferred_language = preferred_language.parse::<Locale>().map_err(corrupt)?;

        Ok(SenderState {
            sender_id,
            first_seen_at,
            turn_count,
            last_inbound_text,
            last_generated_reply,
            preferred_language,
            updated_at,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("invalid timestamp '{}': {}", value, e))
}

#[cfg(test)]
mod tests {
    use super::{ConversationStore, StateDelta, Storage, StoreFailure};
    use palaver_events::Locale;
    use rusqlite::Connection;
    use std::sync::Arc;
    use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

    fn temp_db_path(name: &str) -> std::path::PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        std::env::temp_dir().join(format!("palaver-storage-{}-{}.db", name, ts))
    }

    #[tokio::test]
    async fn upsert_creates_state_with_defaults() {
        let path = temp_db_path("create");
        let storage = Storage::new(&path).expect("storage init");

        let state = storage.upsert_and_increment("100").await.expect("upsert");
        assert_eq!(state.sender_id, "100");
        assert_eq!(state.turn_count, 1);
        assert_eq!(state.preferred_language, Locale::English);
        assert!(state.last_inbound_text.is_none());
        assert!(state.last_generated_reply.is_none());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn upsert_increments_and_keeps_first_seen() {
        let path = temp_db_path("increment");
        let storage = Storage::new(&path).expect("storage init");

        let first = storage.upsert_and_increment("100").await.expect("first");
        let second = storage.upsert_and_increment("100").await.expect("second");
        let third = storage.upsert_and_increment("100").await.expect("third");

        assert_eq!(second.turn_count, 2);
        assert_eq!(third.turn_count, 3);
        assert_eq!(third.first_seen_at, first.first_seen_at);
        assert!(third.updated_at >= first.updated_at);

        let other = storage.upsert_and_increment("200").await.expect("other");
        assert_eq!(other.turn_count, 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn update_only_touches_provided_fields() {
        let path = temp_db_path("update");
        let storage = Storage::new(&path).expect("storage init");
        storage.upsert_and_increment("100").await.expect("upsert");

        storage
            .update(
                "100",
                &StateDelta {
                    last_inbound_text: Some("capital of France?".to_string()),
                    last_generated_reply: Some("Paris.".to_string()),
                    preferred_language: None,
                },
            )
            .await
            .expect("update");
        storage
            .update(
                "100",
                &StateDelta {
                    preferred_language: Some(Locale::Arabic),
                    ..Default::default()
                },
            )
            .await
            .expect("update language");

        let state = storage.get("100").await.expect("get").expect("present");
        assert_eq!(state.last_inbound_text.as_deref(), Some("capital of France?"));
        assert_eq!(state.last_generated_reply.as_deref(), Some("Paris."));
        assert_eq!(state.preferred_language, Locale::Arabic);
        assert_eq!(state.turn_count, 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn update_unknown_sender_fails() {
        let path = temp_db_path("unknown");
        let storage = Storage::new(&path).expect("storage init");

        let err = storage
            .update("nobody", &StateDelta::default())
            .await
            .expect_err("unknown sender");
        assert!(matches!(err, StoreFailure::UnknownSender(id) if id == "nobody"));
        assert!(storage.get("nobody").await.expect("get").is_none());

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn corrupt_language_is_reported() {
        let path = temp_db_path("corrupt");
        let storage = Storage::new(&path).expect("storage init");
        storage.upsert_and_increment("100").await.expect("upsert");
        drop(storage);

        let conn = Connection::open(&path).expect("open");
        conn.execute(
            "UPDATE sender_states SET preferred_language = 'klingon' WHERE sender_id = '100'",
            [],
        )
        .expect("tamper");
        drop(conn);

        let storage = Storage::new(&path).expect("reopen");
        let err = storage.get("100").await.expect_err("corrupt row");
        assert!(matches!(err, StoreFailure::Corrupt { .. }));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn negative_turn_count_names_the_sender() {
        let path = temp_db_path("negative");
        let storage = Storage::new(&path).expect("storage init");
        storage.upsert_and_increment("100").await.expect("upsert");

        let conn = Connection::open(&path).expect("open");
        conn.execute("UPDATE sender_states SET turn_count = -3", [])
            .expect("tamper");
        drop(conn);

        let err = storage.get("100").await.expect_err("corrupt row");
        assert!(matches!(
            err,
            StoreFailure::Corrupt { ref sender_id, ref detail }
                if sender_id == "100" && detail.contains("negative turn_count -3")
        ));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn locked_database_does_not_stall_the_runtime() {
        let path = temp_db_path("locked");
        let storage = Arc::new(Storage::new(&path).expect("storage init"));

        let writer = Connection::open(&path).expect("open writer");
        writer.execute_batch("BEGIN EXCLUSIVE").expect("lock");

        let pending = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.upsert_and_increment("100").await })
        };

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!pending.is_finished());

        writer.execute_batch("COMMIT").expect("unlock");
        let state = pending.await.expect("join").expect("upsert after unlock");
        assert_eq!(state.turn_count, 1);

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_increments_across_connections_are_not_lost() {
        let path = temp_db_path("concurrent");
        let a = Arc::new(Storage::new(&path).expect("storage a"));
        let b = Arc::new(Storage::new(&path).expect("storage b"));

        let mut handles = Vec::new();
        for i in 0..40 {
            let storage = if i % 2 == 0 { Arc::clone(&a) } else { Arc::clone(&b) };
            handles.push(tokio::spawn(async move {
                storage.upsert_and_increment("shared").await.map(|s| s.turn_count)
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.expect("join").expect("upsert"));
        }
        counts.sort_unstable();
        assert_eq!(counts, (1..=40).collect::<Vec<u64>>());

        let _ = std::fs::remove_file(path);
    }
}
