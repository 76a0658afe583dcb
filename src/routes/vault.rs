//! The vault RPC surface.
//!
//! Every route here operates on exactly one vault, addressed by the
//! `X-Memory-Key` header plus an optional `X-Session-ID` or
//! `X-Conversation-ID` scope. Handlers validate, then run the operation on
//! the vault's execution slot.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::MAX_RESULTS_PER_SEARCH;
use crate::error::{AppError, AppResult};
use crate::kronos::WindowSpec;
use crate::state::AppState;
use crate::vault::{
    now_ms, ArchivalStatsResponse, ChunkedResponse, DeleteResponse, ExportResponse,
    SearchResponse, StatsResponse, StoreResponse, WarmthResponse, WindowsResponse,
};
use crate::vaults::{Scope, VaultName};

const DEFAULT_K: usize = 10;

/// Resolve the addressed vault from request headers.
pub fn vault_name(headers: &HeaderMap) -> AppResult<VaultName> {
    let key = headers
        .get("x-memory-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("X-Memory-Key header is required".to_string()))?;
    let session = headers.get("x-session-id").and_then(|v| v.to_str().ok());
    let conversation = headers.get("x-conversation-id").and_then(|v| v.to_str().ok());
    VaultName::new(key, session, conversation)
}

fn clamp_k(k: Option<usize>) -> usize {
    k.unwrap_or(DEFAULT_K).min(MAX_RESULTS_PER_SEARCH)
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub query: Vec<f32>,
    pub k: Option<usize>,
    #[serde(rename = "minTimestamp")]
    pub min_timestamp: Option<f64>,
    #[serde(rename = "maxTimestamp")]
    pub max_timestamp: Option<f64>,
}

pub async fn search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> AppResult<Json<SearchResponse>> {
    if req.query.is_empty() {
        return Err(AppError::BadRequest("query embedding must not be empty".to_string()));
    }
    let name = vault_name(&headers)?;
    let k = clamp_k(req.k);
    let response = state
        .vaults
        .with_vault(&name, move |vault| {
            vault.search(&req.query, k, req.min_timestamp, req.max_timestamp)
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct SearchAllRequest {
    pub query: Vec<f32>,
    pub windows: Vec<WindowSpec>,
}

pub async fn search_all(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SearchAllRequest>,
) -> AppResult<Json<WindowsResponse>> {
    if req.query.is_empty() {
        return Err(AppError::BadRequest("query embedding must not be empty".to_string()));
    }
    if req.windows.is_empty() {
        return Err(AppError::BadRequest("at least one window is required".to_string()));
    }
    let name = vault_name(&headers)?;
    let response = state
        .vaults
        .with_vault(&name, move |vault| vault.search_windows(&req.query, &req.windows))
        .await?;
    Ok(Json(response))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct StoreRequest {
    pub embedding: Vec<f32>,
    pub content: String,
    pub role: String,
    pub model: Option<String>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

pub async fn store(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StoreRequest>,
) -> AppResult<Json<StoreResponse>> {
    if req.embedding.is_empty() {
        return Err(AppError::BadRequest("embedding must not be empty".to_string()));
    }
    if req.content.is_empty() {
        return Err(AppError::BadRequest("content must not be empty".to_string()));
    }
    let name = vault_name(&headers)?;
    let response = state
        .vaults
        .with_vault(&name, move |vault| {
            vault.store(
                &req.embedding,
                &req.content,
                &req.role,
                req.model,
                req.request_id,
                None,
                now_ms(),
            )
        })
        .await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct StoreChunkedRequest {
    pub content: String,
    pub role: String,
}

pub async fn store_chunked(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<StoreChunkedRequest>,
) -> AppResult<Json<ChunkedResponse>> {
    if req.content.is_empty() {
        return Err(AppError::BadRequest("content must not be empty".to_string()));
    }
    let name = vault_name(&headers)?;
    let now = now_ms();
    let response = state
        .vaults
        .with_vault(&name, move |vault| {
            vault.store_chunked(&req.content, &req.role, now)
        })
        .await?;

    // Keep the cold path's buffer mirror in step; losing this write only
    // staleness the mirror, never the vault.
    let replica = state.replica.clone();
    let vault_name = name.as_str();
    let buffer = response.buffer_content.clone();
    let tokens = response.buffer_tokens as i64;
    tokio::task::spawn_blocking(move || {
        if let Err(e) = replica.save_buffer(&vault_name, &buffer, tokens, now) {
            warn!("buffer mirror write failed: {}", e);
        }
    });

    Ok(Json(response))
}

pub async fn bulk_store(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<Json<crate::retrieval::BulkOutcome>> {
    let name = vault_name(&headers)?;
    let session = match &name.scope {
        Scope::Session(s) => Some(s.clone()),
        Scope::Conversation(c) => Some(c.clone()),
        Scope::Core => None,
    };
    let outcome = state
        .coordinator
        .bulk_store(&name.memory_key, session.as_deref(), &body)
        .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// Deletion / lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeleteRequest {
    pub ids: Option<Vec<i64>>,
    #[serde(rename = "olderThan")]
    pub older_than: Option<f64>,
}

pub async fn delete(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeleteRequest>,
) -> AppResult<Json<DeleteResponse>> {
    let name = vault_name(&headers)?;
    let response = state
        .vaults
        .with_vault(&name, move |vault| {
            vault.delete(req.ids, req.older_than, now_ms())
        })
        .await?;
    Ok(Json(response))
}

pub async fn clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let name = vault_name(&headers)?;
    state
        .vaults
        .with_vault(&name, move |vault| vault.clear(now_ms()))
        .await?;
    drop_replica_scope(&state, &name);
    Ok(Json(json!({ "cleared": true })))
}

pub async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let name = vault_name(&headers)?;
    state
        .vaults
        .with_vault(&name, move |vault| vault.reset(now_ms()))
        .await?;
    drop_replica_scope(&state, &name);
    Ok(Json(json!({ "reset": true })))
}

/// Clearing a vault invalidates its replica partition and buffer mirror.
fn drop_replica_scope(state: &AppState, name: &VaultName) {
    let replica = state.replica.clone();
    let key = name.memory_key.clone();
    let session = match &name.scope {
        Scope::Session(s) => Some(s.clone()),
        Scope::Conversation(c) => Some(c.clone()),
        Scope::Core => None,
    };
    let vault_name = name.as_str();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = replica.remove_scope(&key, session.as_deref()) {
            warn!("replica scope removal failed: {}", e);
        }
        if let Err(e) = replica.save_buffer(&vault_name, "", 0, now_ms()) {
            warn!("buffer mirror removal failed: {}", e);
        }
    });
}

// ---------------------------------------------------------------------------
// Buffer
// ---------------------------------------------------------------------------

pub async fn buffer_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<serde_json::Value>> {
    let name = vault_name(&headers)?;
    let buffer = state
        .vaults
        .with_vault(&name, |vault| vault.buffer_get())
        .await?;
    let body = match buffer {
        Some(info) => json!({
            "content": info.content,
            "tokenCount": info.token_count,
            "lastUpdated": info.last_updated,
        }),
        None => json!({
            "content": "",
            "tokenCount": 0,
            "lastUpdated": null,
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct BufferActionRequest {
    pub action: String,
}

pub async fn buffer_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<BufferActionRequest>,
) -> AppResult<Response> {
    let name = vault_name(&headers)?;
    match req.action.as_str() {
        "clear" => {
            state
                .vaults
                .with_vault(&name, |vault| vault.buffer_clear())
                .await?;
            mirror_buffer(&state, &name, String::new(), 0);
            Ok(Json(json!({ "cleared": true })).into_response())
        }
        "flush" => {
            let response = state
                .vaults
                .with_vault(&name, |vault| vault.buffer_flush(now_ms()))
                .await?;
            mirror_buffer(&state, &name, String::new(), 0);
            Ok(Json(response).into_response())
        }
        other => Err(AppError::BadRequest(format!(
            "unknown buffer action: {}",
            other
        ))),
    }
}

fn mirror_buffer(state: &AppState, name: &VaultName, content: String, tokens: i64) {
    let replica = state.replica.clone();
    let vault_name = name.as_str();
    tokio::task::spawn_blocking(move || {
        if let Err(e) = replica.save_buffer(&vault_name, &content, tokens, now_ms()) {
            warn!("buffer mirror write failed: {}", e);
        }
    });
}

// ---------------------------------------------------------------------------
// Introspection / export
// ---------------------------------------------------------------------------

pub async fn stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<StatsResponse>> {
    let name = vault_name(&headers)?;
    let response = state.vaults.with_vault(&name, |vault| vault.stats()).await?;
    Ok(Json(response))
}

pub async fn warmth(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<WarmthResponse>> {
    let name = vault_name(&headers)?;
    let response = state.vaults.with_vault(&name, |vault| vault.warmth()).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct ArchivalStatsRequest {
    #[serde(rename = "archivalCutoff")]
    pub archival_cutoff: f64,
}

pub async fn archival_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ArchivalStatsRequest>,
) -> AppResult<Json<ArchivalStatsResponse>> {
    let name = vault_name(&headers)?;
    let response = state
        .vaults
        .with_vault(&name, move |vault| vault.archival_stats(req.archival_cutoff))
        .await?;
    Ok(Json(response))
}

pub async fn export(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<ExportResponse>> {
    let name = vault_name(&headers)?;
    let response = state.vaults.with_vault(&name, |vault| vault.export()).await?;
    Ok(Json(response))
}

/// NDJSON stream of `{id, content, role, timestamp, embedding_b64}` lines.
pub async fn export_raw(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let name = vault_name(&headers)?;
    let lines = state
        .vaults
        .with_vault(&name, |vault| vault.export_raw_lines())
        .await?;
    let mut body = lines.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}
