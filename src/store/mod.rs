//! The conversation store — a durable, indexed log of every exchange.
//!
//! Single-file SQLite via rusqlite with one writer: the connection sits
//! behind a mutex held only for the duration of a statement or transaction,
//! never across an await (async callers go through `spawn_blocking`).
//!
//! Store-layer guarantees, enforced here rather than left to callers:
//! - assistant messages always carry a model reference
//! - messages cannot be inserted for unknown conversations
//! - topic names are unique; topic parents form a forest (no cycles)
//! - `conversations.updated_at` is touched by trigger on every insert
//!
//! A single observer list receives `StoreEvent`s synchronously after the
//! write commits. Observers get an unbounded channel endpoint; a dropped
//! receiver just gets pruned. Nothing an observer does can fail the writer.

pub mod export;

use std::{
    path::Path,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use rusqlite::{named_params, params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::backends::Role;

/// Conversation lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Active,
    Paused,
    Closed,
    Archived,
}

impl ConversationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Closed => "closed",
            Self::Archived => "archived",
        }
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "active" => Self::Active,
            "paused" => Self::Paused,
            "closed" => Self::Closed,
            "archived" => Self::Archived,
            other => anyhow::bail!("unknown conversation status `{other}`"),
        })
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Topic {
    pub id: i64,
    pub name: String,
    pub parent_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: i64,
    pub title: String,
    pub topic_id: Option<i64>,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub role: Role,
    pub content: String,
    pub model_ref: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Events delivered to observers after the corresponding write commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "event")]
pub enum StoreEvent {
    ConversationCreated { id: i64 },
    MessageAppended { conversation_id: i64, message_id: i64 },
    ConversationDeleted { id: i64 },
    TitleChanged { id: i64 },
}

/// Filters for listing conversations.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub topic_id: Option<i64>,
    pub status: Option<ConversationStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Filters for full-text search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub topic_id: Option<i64>,
    pub status: Option<ConversationStatus>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

/// One search result: a conversation and how strongly it matched.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub conversation: Conversation,
    /// Number of messages containing the query.
    pub matched_messages: u32,
    /// Whether the title itself matched.
    pub title_matched: bool,
}

/// Aggregate counts for the stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub conversations: u64,
    pub messages: u64,
    pub topics: u64,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS topics (
    id         INTEGER PRIMARY KEY,
    name       TEXT NOT NULL UNIQUE,
    parent_id  INTEGER REFERENCES topics(id),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversations (
    id         INTEGER PRIMARY KEY,
    title      TEXT NOT NULL,
    topic_id   INTEGER REFERENCES topics(id) ON DELETE SET NULL,
    status     TEXT NOT NULL DEFAULT 'active'
               CHECK (status IN ('active', 'paused', 'closed', 'archived')),
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id              INTEGER PRIMARY KEY,
    conversation_id INTEGER NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role            TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content         TEXT NOT NULL,
    model_ref       TEXT,
    timestamp       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_topic      ON conversations(topic_id);
CREATE INDEX IF NOT EXISTS idx_conversations_updated_at ON conversations(updated_at);
CREATE INDEX IF NOT EXISTS idx_messages_conversation    ON messages(conversation_id);
CREATE INDEX IF NOT EXISTS idx_messages_timestamp       ON messages(timestamp);
CREATE INDEX IF NOT EXISTS idx_messages_content         ON messages(content);

CREATE TRIGGER IF NOT EXISTS trg_messages_touch_conversation
AFTER INSERT ON messages
BEGIN
    UPDATE conversations
    SET updated_at = NEW.timestamp
    WHERE id = NEW.conversation_id AND updated_at < NEW.timestamp;
END;
"#;

/// The store handle. Cheap to share via `Arc`.
pub struct ConversationStore {
    conn: Mutex<Connection>,
    observers: Mutex<Vec<mpsc::UnboundedSender<StoreEvent>>>,
}

impl ConversationStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> anyhow::Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> anyhow::Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            observers: Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store connection lock poisoned")
    }

    /// Subscribe to store events. Observers must be non-blocking consumers;
    /// anything slow belongs in the observer's own task, not the writer's.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.lock().expect("observer lock poisoned").push(tx);
        rx
    }

    fn notify(&self, event: StoreEvent) {
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    // -- topics -------------------------------------------------------------

    /// Create a topic, or return the existing one with the same name.
    pub fn get_or_create_topic(&self, name: &str, parent_id: Option<i64>) -> anyhow::Result<i64> {
        anyhow::ensure!(!name.trim().is_empty(), "topic name must not be empty");
        let conn = self.conn();
        if let Some(id) = conn
            .query_row("SELECT id FROM topics WHERE name = ?1", params![name], |r| r.get(0))
            .optional()?
        {
            return Ok(id);
        }
        if let Some(parent) = parent_id {
            ensure_acyclic(&conn, parent)?;
        }
        conn.execute(
            "INSERT INTO topics (name, parent_id, created_at) VALUES (?1, ?2, ?3)",
            params![name, parent_id, Utc::now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn topic_by_name(&self, name: &str) -> anyhow::Result<Option<Topic>> {
        let conn = self.conn();
        let topic = conn
            .query_row(
                "SELECT id, name, parent_id, created_at FROM topics WHERE name = ?1",
                params![name],
                row_to_topic,
            )
            .optional()?;
        Ok(topic)
    }

    pub fn list_topics(&self) -> anyhow::Result<Vec<Topic>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, parent_id, created_at FROM topics ORDER BY name")?;
        let topics = stmt.query_map([], row_to_topic)?.collect::<Result<_, _>>()?;
        Ok(topics)
    }

    // -- conversations ------------------------------------------------------

    pub fn create_conversation(&self, title: &str, topic_id: Option<i64>) -> anyhow::Result<i64> {
        let id = {
            let conn = self.conn();
            let now = Utc::now();
            conn.execute(
                "INSERT INTO conversations (title, topic_id, status, created_at, updated_at)
                 VALUES (?1, ?2, 'active', ?3, ?3)",
                params![title, topic_id, now],
            )?;
            conn.last_insert_rowid()
        };
        self.notify(StoreEvent::ConversationCreated { id });
        Ok(id)
    }

    pub fn get_conversation(&self, id: i64) -> anyhow::Result<Option<Conversation>> {
        let conn = self.conn();
        let conversation = conn
            .query_row(
                "SELECT id, title, topic_id, status, created_at, updated_at
                 FROM conversations WHERE id = ?1",
                params![id],
                row_to_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    pub fn set_title(&self, id: i64, title: &str) -> anyhow::Result<()> {
        let changed = self
            .conn()
            .execute("UPDATE conversations SET title = ?2 WHERE id = ?1", params![id, title])?;
        anyhow::ensure!(changed == 1, "conversation {id} does not exist");
        self.notify(StoreEvent::TitleChanged { id });
        Ok(())
    }

    pub fn set_status(&self, id: i64, status: ConversationStatus) -> anyhow::Result<()> {
        let changed = self.conn().execute(
            "UPDATE conversations SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        anyhow::ensure!(changed == 1, "conversation {id} does not exist");
        Ok(())
    }

    /// Delete a conversation and, by cascade, its messages.
    pub fn delete_conversation(&self, id: i64) -> anyhow::Result<()> {
        let changed = self
            .conn()
            .execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
        anyhow::ensure!(changed == 1, "conversation {id} does not exist");
        self.notify(StoreEvent::ConversationDeleted { id });
        Ok(())
    }

    pub fn list_conversations(&self, filter: &ListFilter) -> anyhow::Result<Vec<Conversation>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, title, topic_id, status, created_at, updated_at
             FROM conversations
             WHERE (:topic_id IS NULL OR topic_id = :topic_id)
               AND (:status IS NULL OR status = :status)
             ORDER BY updated_at DESC
             LIMIT :limit OFFSET :offset",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":topic_id": filter.topic_id,
                ":status": filter.status.map(|s| s.as_str()),
                ":limit": filter.limit.unwrap_or(100),
                ":offset": filter.offset.unwrap_or(0),
            },
            row_to_conversation,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -- messages -----------------------------------------------------------

    /// Append a message. Atomic with the `updated_at` touch (same statement
    /// set, trigger fires inside the insert's transaction).
    pub fn append_message(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_ref: Option<&str>,
    ) -> anyhow::Result<i64> {
        self.insert_message_at(conversation_id, role, content, model_ref, Utc::now())
    }

    /// Insert with an explicit timestamp — used by import to preserve history.
    pub(crate) fn insert_message_at(
        &self,
        conversation_id: i64,
        role: Role,
        content: &str,
        model_ref: Option<&str>,
        timestamp: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        anyhow::ensure!(
            role != Role::Assistant || model_ref.is_some(),
            "assistant messages must carry a model reference"
        );
        let message_id = {
            let conn = self.conn();
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, model_ref, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![conversation_id, role.as_str(), content, model_ref, timestamp],
            )?;
            conn.last_insert_rowid()
        };
        self.notify(StoreEvent::MessageAppended { conversation_id, message_id });
        Ok(message_id)
    }

    pub fn get_messages(
        &self,
        conversation_id: i64,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> anyhow::Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, model_ref, timestamp
             FROM messages
             WHERE conversation_id = :conversation_id
             ORDER BY timestamp, id
             LIMIT :limit OFFSET :offset",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":conversation_id": conversation_id,
                ":limit": limit.unwrap_or(u32::MAX),
                ":offset": offset.unwrap_or(0),
            },
            row_to_message,
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -- search -------------------------------------------------------------

    /// Substring search over titles and message content, ranked by how many
    /// messages matched, then by recency.
    pub fn search_conversations(
        &self,
        query: &str,
        filter: &SearchFilter,
    ) -> anyhow::Result<Vec<SearchHit>> {
        let pattern = format!("%{}%", escape_like(query));
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM (
                 SELECT c.id, c.title, c.topic_id, c.status, c.created_at, c.updated_at,
                        (SELECT COUNT(*) FROM messages m
                          WHERE m.conversation_id = c.id
                            AND m.content LIKE :pattern ESCAPE '\\') AS matched_messages,
                        (c.title LIKE :pattern ESCAPE '\\') AS title_matched
                 FROM conversations c
                 WHERE (:topic_id IS NULL OR c.topic_id = :topic_id)
                   AND (:status IS NULL OR c.status = :status)
                   AND (:date_from IS NULL OR c.updated_at >= :date_from)
                   AND (:date_to IS NULL OR c.updated_at <= :date_to)
             )
             WHERE matched_messages > 0 OR title_matched
             ORDER BY matched_messages DESC, updated_at DESC",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":pattern": pattern,
                ":topic_id": filter.topic_id,
                ":status": filter.status.map(|s| s.as_str()),
                ":date_from": filter.date_from,
                ":date_to": filter.date_to,
            },
            |row| {
                Ok(SearchHit {
                    conversation: row_to_conversation(row)?,
                    matched_messages: row.get("matched_messages")?,
                    title_matched: row.get("title_matched")?,
                })
            },
        )?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // -- stats --------------------------------------------------------------

    pub fn stats(&self) -> anyhow::Result<StoreStats> {
        let conn = self.conn();
        let count = |sql: &str| -> anyhow::Result<u64> {
            Ok(conn.query_row(sql, [], |r| r.get::<_, i64>(0))? as u64)
        };
        Ok(StoreStats {
            conversations: count("SELECT COUNT(*) FROM conversations")?,
            messages: count("SELECT COUNT(*) FROM messages")?,
            topics: count("SELECT COUNT(*) FROM topics")?,
        })
    }
}

/// Refuse a topic parent that would close a cycle.
fn ensure_acyclic(conn: &Connection, mut parent: i64) -> anyhow::Result<()> {
    // Walk up the parent chain; a forest has short chains, so the loop is
    // bounded by the tree depth.
    let mut hops = 0;
    loop {
        let next: Option<i64> = conn
            .query_row("SELECT parent_id FROM topics WHERE id = ?1", params![parent], |r| r.get(0))
            .optional()?
            .flatten();
        match next {
            Some(p) => {
                parent = p;
                hops += 1;
                anyhow::ensure!(hops < 1_000, "topic parent chain does not terminate");
            }
            None => return Ok(()),
        }
    }
}

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern.
fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn row_to_topic(row: &rusqlite::Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get("id")?,
        name: row.get("name")?,
        parent_id: row.get("parent_id")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status: String = row.get("status")?;
    Ok(Conversation {
        id: row.get("id")?,
        title: row.get("title")?,
        topic_id: row.get("topic_id")?,
        status: status.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "status".into(), rusqlite::types::Type::Text)
        })?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let role: String = row.get("role")?;
    Ok(Message {
        id: row.get("id")?,
        conversation_id: row.get("conversation_id")?,
        role: role.parse().map_err(|_| {
            rusqlite::Error::InvalidColumnType(0, "role".into(), rusqlite::types::Type::Text)
        })?,
        content: row.get("content")?,
        model_ref: row.get("model_ref")?,
        timestamp: row.get("timestamp")?,
    })
}
