//! Conversation JSON export and import.
//!
//! The document format is versioned with `major.minor`: an importer accepts
//! any minor revision of the same major. Fields this build does not know are
//! captured in flattened maps and written back verbatim on re-export, so a
//! round trip through an older router never strips a newer writer's data.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{ConversationStore, ListFilter};
use crate::backends::Role;

/// Format version written by this build.
pub const EXPORT_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportDocument {
    pub version: String,
    /// ISO-8601 timestamp of the export.
    pub export_date: String,
    pub conversations: Vec<ExportConversation>,
    pub metadata: ExportMetadata,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConversation {
    pub id: i64,
    pub title: String,
    /// Topic name, not id — names survive re-import, ids do not.
    pub topic: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<ExportMessage>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMessage {
    pub role: String,
    pub content: String,
    pub model: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportMetadata {
    pub message_count: u64,
    pub user_messages: u64,
    pub assistant_messages: u64,
    pub models_used: Vec<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Export selected conversations (or everything under a topic, or everything).
pub fn export_to_json(
    store: &ConversationStore,
    conversation_ids: Option<&[i64]>,
    topic_id: Option<i64>,
) -> anyhow::Result<ExportDocument> {
    let conversations = match conversation_ids {
        Some(ids) => {
            let mut out = Vec::with_capacity(ids.len());
            for &id in ids {
                let conv = store
                    .get_conversation(id)?
                    .ok_or_else(|| anyhow::anyhow!("conversation {id} does not exist"))?;
                out.push(conv);
            }
            out
        }
        None => store.list_conversations(&ListFilter {
            topic_id,
            limit: Some(u32::MAX),
            ..Default::default()
        })?,
    };

    let topics: HashMap<i64, String> = store
        .list_topics()?
        .into_iter()
        .map(|t| (t.id, t.name))
        .collect();

    let mut exported = Vec::with_capacity(conversations.len());
    let mut message_count = 0u64;
    let mut user_messages = 0u64;
    let mut assistant_messages = 0u64;
    let mut models_used: Vec<String> = Vec::new();

    for conv in conversations {
        let messages = store.get_messages(conv.id, None, None)?;
        let mut out_messages = Vec::with_capacity(messages.len());
        for msg in messages {
            message_count += 1;
            match msg.role {
                Role::User => user_messages += 1,
                Role::Assistant => assistant_messages += 1,
                Role::System => {}
            }
            if let Some(model) = &msg.model_ref {
                if !models_used.contains(model) {
                    models_used.push(model.clone());
                }
            }
            out_messages.push(ExportMessage {
                role: msg.role.as_str().to_string(),
                content: msg.content,
                model: msg.model_ref,
                timestamp: msg.timestamp,
                extra: HashMap::new(),
            });
        }
        exported.push(ExportConversation {
            id: conv.id,
            title: conv.title,
            topic: conv.topic_id.and_then(|id| topics.get(&id).cloned()),
            created_at: conv.created_at,
            updated_at: conv.updated_at,
            messages: out_messages,
            extra: HashMap::new(),
        });
    }

    models_used.sort();

    Ok(ExportDocument {
        version: EXPORT_VERSION.to_string(),
        export_date: Utc::now().to_rfc3339(),
        conversations: exported,
        metadata: ExportMetadata {
            message_count,
            user_messages,
            assistant_messages,
            models_used,
            extra: HashMap::new(),
        },
        extra: HashMap::new(),
    })
}

/// Import a document, materializing unknown topics and reusing topics whose
/// name already exists. Returns the ids of the created conversations.
pub fn import_from_json(
    store: &ConversationStore,
    document: &ExportDocument,
) -> anyhow::Result<Vec<i64>> {
    anyhow::ensure!(
        version_compatible(&document.version),
        "unsupported export version `{}` (this build reads major version {})",
        document.version,
        EXPORT_VERSION.split('.').next().unwrap_or("1"),
    );

    let mut created = Vec::with_capacity(document.conversations.len());
    for conv in &document.conversations {
        let topic_id = conv
            .topic
            .as_deref()
            .map(|name| store.get_or_create_topic(name, None))
            .transpose()?;

        let id = store.create_conversation(&conv.title, topic_id)?;
        for msg in &conv.messages {
            let role: Role = msg.role.parse()?;
            store.insert_message_at(id, role, &msg.content, msg.model.as_deref(), msg.timestamp)?;
        }
        created.push(id);
    }

    info!(
        conversations = created.len(),
        version = %document.version,
        "imported conversation document"
    );
    Ok(created)
}

/// An importer accepts any minor version with the same major.
fn version_compatible(version: &str) -> bool {
    version.split('.').next() == EXPORT_VERSION.split('.').next()
}
