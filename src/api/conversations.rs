//! Conversation CRUD, search, and import/export over HTTP.
//!
//! These handlers talk to the store directly — its operations are short
//! synchronous SQLite statements, and no lock is ever held across an await.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::{
    backends::Role,
    error::AppError,
    facade::RouterFacade,
    store::{
        export::{export_to_json, import_from_json, ExportDocument},
        ConversationStatus, ListFilter, SearchFilter,
    },
};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// `GET /api/v1/conversations`
pub async fn list(
    State(facade): State<Arc<RouterFacade>>,
    Query(q): Query<ListQuery>,
) -> Result<impl IntoResponse, AppError> {
    let topic_id = match &q.topic {
        Some(name) => match facade.store.topic_by_name(name)? {
            Some(topic) => Some(topic.id),
            None => return Ok(Json(json!({ "conversations": [] }))),
        },
        None => None,
    };
    let status = parse_status(q.status.as_deref())?;
    let conversations = facade.store.list_conversations(&ListFilter {
        topic_id,
        status,
        limit: q.limit,
        offset: q.offset,
    })?;
    Ok(Json(json!({ "conversations": conversations })))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    pub title: String,
    #[serde(default)]
    pub topic: Option<String>,
}

/// `POST /api/v1/conversations`
pub async fn create(
    State(facade): State<Arc<RouterFacade>>,
    Json(body): Json<CreateBody>,
) -> Result<impl IntoResponse, AppError> {
    let topic_id = body
        .topic
        .as_deref()
        .map(|name| facade.store.get_or_create_topic(name, None))
        .transpose()?;
    let id = facade.store.create_conversation(&body.title, topic_id)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

/// `GET /api/v1/conversations/{id}`
pub async fn show(
    State(facade): State<Arc<RouterFacade>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let conversation = facade
        .store
        .get_conversation(id)?
        .ok_or_else(|| AppError::not_found(format!("conversation {id} does not exist")))?;
    let messages = facade.store.get_messages(id, None, None)?;
    Ok(Json(json!({ "conversation": conversation, "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateBody {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

/// `PUT /api/v1/conversations/{id}`
pub async fn update(
    State(facade): State<Arc<RouterFacade>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateBody>,
) -> Result<impl IntoResponse, AppError> {
    facade
        .store
        .get_conversation(id)?
        .ok_or_else(|| AppError::not_found(format!("conversation {id} does not exist")))?;
    if let Some(title) = &body.title {
        facade.store.set_title(id, title)?;
    }
    if let Some(status) = parse_status(body.status.as_deref())? {
        facade.store.set_status(id, status)?;
    }
    Ok(Json(json!({ "status": "updated" })))
}

/// `DELETE /api/v1/conversations/{id}`
pub async fn delete(
    State(facade): State<Arc<RouterFacade>>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    facade
        .store
        .get_conversation(id)?
        .ok_or_else(|| AppError::not_found(format!("conversation {id} does not exist")))?;
    facade.store.delete_conversation(id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

/// `GET /api/v1/conversations/{id}/messages`
pub async fn messages(
    State(facade): State<Arc<RouterFacade>>,
    Path(id): Path<i64>,
    Query(q): Query<MessagesQuery>,
) -> Result<impl IntoResponse, AppError> {
    facade
        .store
        .get_conversation(id)?
        .ok_or_else(|| AppError::not_found(format!("conversation {id} does not exist")))?;
    let messages = facade.store.get_messages(id, q.limit, q.offset)?;
    Ok(Json(json!({ "messages": messages })))
}

#[derive(Debug, Deserialize)]
pub struct AppendBody {
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub model_ref: Option<String>,
}

/// `POST /api/v1/conversations/{id}/messages`
pub async fn append(
    State(facade): State<Arc<RouterFacade>>,
    Path(id): Path<i64>,
    Json(body): Json<AppendBody>,
) -> Result<impl IntoResponse, AppError> {
    facade
        .store
        .get_conversation(id)?
        .ok_or_else(|| AppError::not_found(format!("conversation {id} does not exist")))?;
    let role: Role = body
        .role
        .parse()
        .map_err(|e| AppError::bad_request(format!("{e}")))?;
    if role == Role::Assistant && body.model_ref.is_none() {
        return Err(AppError::bad_request(
            "assistant messages must carry a model_ref",
        ));
    }
    let message_id = facade
        .store
        .append_message(id, role, &body.content, body.model_ref.as_deref())?;
    Ok((StatusCode::CREATED, Json(json!({ "id": message_id }))))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub date_from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub date_to: Option<DateTime<Utc>>,
}

/// `GET /api/v1/search?q=...`
pub async fn search(
    State(facade): State<Arc<RouterFacade>>,
    Query(q): Query<SearchQuery>,
) -> Result<impl IntoResponse, AppError> {
    if q.q.is_empty() {
        return Err(AppError::bad_request("query parameter `q` must not be empty"));
    }
    let topic_id = match &q.topic {
        Some(name) => match facade.store.topic_by_name(name)? {
            Some(topic) => Some(topic.id),
            None => return Ok(Json(json!({ "hits": [] }))),
        },
        None => None,
    };
    let hits = facade.store.search_conversations(
        &q.q,
        &SearchFilter {
            topic_id,
            status: parse_status(q.status.as_deref())?,
            date_from: q.date_from,
            date_to: q.date_to,
        },
    )?;
    Ok(Json(json!({ "hits": hits })))
}

#[derive(Debug, Deserialize)]
pub struct ExportBody {
    #[serde(default)]
    pub conversation_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub topic: Option<String>,
}

/// `POST /api/v1/export`
pub async fn export(
    State(facade): State<Arc<RouterFacade>>,
    Json(body): Json<ExportBody>,
) -> Result<impl IntoResponse, AppError> {
    let topic_id = match &body.topic {
        Some(name) => Some(
            facade
                .store
                .topic_by_name(name)?
                .ok_or_else(|| AppError::not_found(format!("topic `{name}` does not exist")))?
                .id,
        ),
        None => None,
    };
    let document = export_to_json(&facade.store, body.conversation_ids.as_deref(), topic_id)?;
    Ok(Json(document))
}

/// `POST /api/v1/import`
pub async fn import(
    State(facade): State<Arc<RouterFacade>>,
    Json(document): Json<ExportDocument>,
) -> Result<impl IntoResponse, AppError> {
    let created = import_from_json(&facade.store, &document)
        .map_err(|e| AppError::bad_request(e.to_string()))?;
    Ok((StatusCode::CREATED, Json(json!({ "created": created }))))
}

fn parse_status(status: Option<&str>) -> Result<Option<ConversationStatus>, AppError> {
    status
        .map(|s| {
            s.parse::<ConversationStatus>()
                .map_err(|e| AppError::bad_request(e.to_string()))
        })
        .transpose()
}
