//! Coordinator routes: the end-to-end retrieval and ingestion flows.
//!
//! `/retrieve` takes free text, embeds it, and runs the planned hot/cold
//! race; `/ingest` feeds role-tagged text through the chunk buffer, embeds
//! whatever drains out, and stores it. Vault addressing works like the rest
//! of the surface (headers), with a body fallback for `memoryKey`.

use axum::{extract::State, http::HeaderMap, Json};
use serde::Deserialize;

use crate::config::{MAX_QUERY_LENGTH, MAX_RESULTS_PER_SEARCH};
use crate::error::{AppError, AppResult};
use crate::retrieval::{IngestOutcome, RetrieveOutcome};
use crate::state::AppState;

const DEFAULT_RETRIEVE_K: usize = 10;

fn resolve_key<'a>(headers: &'a HeaderMap, body_key: Option<&'a str>) -> AppResult<&'a str> {
    headers
        .get("x-memory-key")
        .and_then(|v| v.to_str().ok())
        .or(body_key)
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            AppError::BadRequest("memory key is required (X-Memory-Key header or memoryKey)".to_string())
        })
}

fn resolve_session<'a>(headers: &'a HeaderMap, body_session: Option<&'a str>) -> Option<&'a str> {
    headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .or(body_session)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

#[derive(Debug, Deserialize)]
pub struct RetrieveRequest {
    pub query: String,
    pub k: Option<usize>,
    #[serde(rename = "memoryKey")]
    pub memory_key: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn retrieve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<RetrieveRequest>,
) -> AppResult<Json<RetrieveOutcome>> {
    if req.query.trim().is_empty() {
        return Err(AppError::BadRequest("query must not be empty".to_string()));
    }
    if req.query.len() > MAX_QUERY_LENGTH {
        return Err(AppError::BadRequest(format!(
            "query too long ({} chars), maximum is {}",
            req.query.len(),
            MAX_QUERY_LENGTH
        )));
    }
    let key = resolve_key(&headers, req.memory_key.as_deref())?;
    let session = resolve_session(&headers, req.session_id.as_deref());
    let k = req.k.unwrap_or(DEFAULT_RETRIEVE_K).min(MAX_RESULTS_PER_SEARCH);

    let outcome = state
        .coordinator
        .retrieve_text(key, session, &req.query, k)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub content: String,
    pub role: String,
    #[serde(rename = "memoryKey")]
    pub memory_key: Option<String>,
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> AppResult<Json<IngestOutcome>> {
    if req.content.is_empty() {
        return Err(AppError::BadRequest("content must not be empty".to_string()));
    }
    if req.role.trim().is_empty() {
        return Err(AppError::BadRequest("role must not be empty".to_string()));
    }
    let key = resolve_key(&headers, req.memory_key.as_deref())?;
    let session = resolve_session(&headers, req.session_id.as_deref());

    let outcome = state
        .coordinator
        .ingest(key, session, &req.role, &req.content)
        .await?;
    Ok(Json(outcome))
}
