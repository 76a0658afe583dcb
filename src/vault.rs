//! The per-tenant vault.
//!
//! One vault owns a SQLite store (the authoritative record), an in-memory
//! [`VectorIndex`] hydrated lazily from it, and the pending chunk buffer.
//! All operations run on the vault's single execution slot (see
//! [`crate::vaults`]); there is no internal locking. When the runtime drops
//! an idle vault only the SQLite file survives, and the next call pays the
//! re-hydration cost.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::chunker::{self, estimate_tokens};
use crate::error::{AppError, AppResult};
use crate::index::VectorIndex;
use crate::kronos::WindowSpec;
use crate::persist::{BufferRow, ItemRow, VaultState, VaultStore};

/// Current wall clock in milliseconds since epoch, as the fractional type
/// timestamps are stored in.
pub fn now_ms() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64
}

/// Low 64 bits of SHA-256 over the content, as 16 hex chars.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    let tail: [u8; 8] = digest[24..32].try_into().unwrap();
    format!("{:016x}", u64::from_be_bytes(tail))
}

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultRow {
    pub id: i64,
    pub score: f32,
    pub content: String,
    pub role: String,
    pub timestamp: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferInfo {
    pub content: String,
    pub token_count: i64,
    pub last_updated: f64,
}

impl From<BufferRow> for BufferInfo {
    fn from(row: BufferRow) -> Self {
        Self {
            content: row.content,
            token_count: row.token_count,
            last_updated: row.last_updated,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultRow>,
    pub hot_vectors: usize,
    pub total_vectors: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowsResponse {
    pub windows: BTreeMap<String, Vec<SearchResultRow>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buffer: Option<BufferInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreResponse {
    pub id: i64,
    pub stored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub token_count: i64,
    pub total_vectors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkedResponse {
    pub chunks_to_embed: Vec<String>,
    pub buffer_tokens: usize,
    pub buffer_content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    pub deleted: usize,
    pub bytes_deleted: i64,
    pub total_vectors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub vector_count: usize,
    pub dims: usize,
    pub created_at: f64,
    pub last_access: f64,
    pub total_vectors: usize,
    pub oldest_timestamp: Option<f64>,
    pub newest_timestamp: Option<f64>,
    pub buffer_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WarmthResponse {
    pub is_warm: bool,
    pub vector_count: usize,
    pub hot_vectors: usize,
    pub last_active: f64,
    pub loaded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchivalStatsResponse {
    pub total: usize,
    pub archived: usize,
    pub bytes_archived: i64,
    pub oldest: Option<f64>,
    pub newest: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportItem {
    pub id: i64,
    pub content: String,
    pub role: String,
    pub content_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: f64,
    pub token_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResponse {
    pub vault_state: VaultState,
    pub items: Vec<ExportItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_b64: Option<String>,
}

/// A chunk stored through the vault, echoed back for replica mirroring.
#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: i64,
    pub content: String,
    pub role: String,
    pub content_hash: String,
    pub embedding: Vec<f32>,
    pub timestamp: f64,
}

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

pub struct Vault {
    name: String,
    path: PathBuf,
    default_dims: usize,
    store: Option<VaultStore>,
    index: Option<VectorIndex>,
    state: Option<VaultState>,
    loaded: bool,
    next_id: i64,
    last_used: Instant,
}

impl Vault {
    /// A cold vault handle. No I/O happens until [`wake`](Self::wake).
    pub fn cold(name: String, path: PathBuf, default_dims: usize) -> Self {
        Self {
            name,
            path,
            default_dims,
            store: None,
            index: None,
            state: None,
            loaded: false,
            next_id: 0,
            last_used: Instant::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.elapsed()
    }

    /// Open the store, initialize state on first touch, and hydrate the
    /// in-memory index. Idempotent; every operation goes through here.
    pub fn wake(&mut self, now: f64) -> AppResult<()> {
        if self.store.is_none() {
            let store = VaultStore::open(&self.path)?;
            let state = match store.load_state()? {
                Some(state) => state,
                None => {
                    let state = VaultState {
                        vector_count: 0,
                        dims: self.default_dims,
                        last_access: now,
                        created_at: now,
                    };
                    store.save_state(&state)?;
                    state
                }
            };
            self.next_id = store.max_id()?;
            self.store = Some(store);
            self.state = Some(state);
        }
        if !self.loaded {
            let started = Instant::now();
            self.hydrate()?;
            let hot = self.index.as_ref().map(|i| i.len()).unwrap_or(0);
            if hot > 0 {
                info!(
                    vault = %self.name,
                    vectors = hot,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "vault hydrated"
                );
            }
        }
        if let Some(state) = &mut self.state {
            state.last_access = now;
        }
        self.last_used = Instant::now();
        Ok(())
    }

    /// Load every persisted vector, newest first, into a fresh index.
    /// With dims still unpinned (post-reset) the index stays absent until
    /// the first store arrives.
    fn hydrate(&mut self) -> AppResult<()> {
        let state = self.state.clone().ok_or_else(|| {
            AppError::VaultError("hydrate before state load".to_string())
        })?;
        if state.dims == 0 {
            self.index = None;
            self.loaded = true;
            return Ok(());
        }
        let store = self.store_ref()?;
        let rows = store.load_all_vectors_desc()?;
        let mut index = VectorIndex::new(state.dims);
        for (id, embedding, ts) in rows {
            index.add(id, &embedding, ts)?;
        }
        self.index = Some(index);
        self.loaded = true;
        Ok(())
    }

    fn store_ref(&self) -> AppResult<&VaultStore> {
        self.store
            .as_ref()
            .ok_or_else(|| AppError::VaultError("vault not awake".to_string()))
    }

    fn store_mut(&mut self) -> AppResult<&mut VaultStore> {
        self.store
            .as_mut()
            .ok_or_else(|| AppError::VaultError("vault not awake".to_string()))
    }

    fn state_ref(&self) -> AppResult<&VaultState> {
        self.state
            .as_ref()
            .ok_or_else(|| AppError::VaultError("vault not awake".to_string()))
    }

    fn buffer_info(&self) -> AppResult<Option<BufferInfo>> {
        Ok(self.store_ref()?.load_buffer()?.map(BufferInfo::from))
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        min_ts: Option<f64>,
        max_ts: Option<f64>,
    ) -> AppResult<SearchResponse> {
        let state = self.state_ref()?;
        let total = state.vector_count;
        let Some(index) = &self.index else {
            return Ok(SearchResponse {
                results: Vec::new(),
                hot_vectors: 0,
                total_vectors: total,
                buffer: self.buffer_info()?,
            });
        };

        let hits = index.search_top_k(query, k, min_ts, max_ts)?;
        let ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        let items = self.store_ref()?.get_items(&ids)?;
        let by_id: std::collections::HashMap<i64, ItemRow> =
            items.into_iter().map(|i| (i.id, i)).collect();

        let results = hits
            .iter()
            .filter_map(|h| {
                by_id.get(&h.id).map(|item| SearchResultRow {
                    id: h.id,
                    score: h.score,
                    content: item.content.clone(),
                    role: item.role.clone(),
                    timestamp: item.timestamp,
                    model: item.model.clone(),
                })
            })
            .collect();

        Ok(SearchResponse {
            results,
            hot_vectors: index.len(),
            total_vectors: total,
            buffer: self.buffer_info()?,
        })
    }

    /// One bounded top-k per requested window, all against the live index.
    pub fn search_windows(&self, query: &[f32], specs: &[WindowSpec]) -> AppResult<WindowsResponse> {
        let mut windows = BTreeMap::new();
        for spec in specs {
            let response = self.search(query, spec.k, Some(spec.min_ts), Some(spec.max_ts))?;
            windows.insert(spec.name.clone(), response.results);
        }
        Ok(WindowsResponse {
            windows,
            buffer: self.buffer_info()?,
        })
    }

    // ------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------

    /// Instant add-then-search write: after this returns, the vector is
    /// visible to every subsequent search on this vault.
    pub fn store(
        &mut self,
        embedding: &[f32],
        content: &str,
        role: &str,
        model: Option<String>,
        request_id: Option<String>,
        timestamp: Option<f64>,
        now: f64,
    ) -> AppResult<StoreResponse> {
        if embedding.is_empty() {
            return Err(AppError::BadRequest("embedding must not be empty".to_string()));
        }
        if crate::index::l2_norm(embedding) < 1e-12 {
            return Err(AppError::BadRequest("embedding has zero norm".to_string()));
        }

        let state = self.state_ref()?.clone();
        // Dims are validated against the live index whenever one exists;
        // only an unpinned vault (fresh reset, dims = 0) adopts the incoming
        // width. Changing width on a pinned vault requires `reset`.
        if let Some(index) = &self.index {
            if embedding.len() != index.dims() {
                return Err(AppError::DimensionMismatch {
                    expected: index.dims(),
                    got: embedding.len(),
                });
            }
        }

        let token_count = estimate_tokens(content) as i64;
        let hash = content_hash(content);
        if let Some(existing) = self.store_ref()?.find_by_hash(&hash)? {
            return Ok(StoreResponse {
                id: existing,
                stored: false,
                reason: Some("duplicate".to_string()),
                token_count,
                total_vectors: state.vector_count,
            });
        }

        let dims = embedding.len();
        if self.index.is_none() {
            self.index = Some(VectorIndex::new(dims));
        }

        let id = self.next_id + 1;
        let ts = timestamp.unwrap_or(now);
        let item = ItemRow {
            id,
            content: content.to_string(),
            role: role.to_string(),
            content_hash: hash,
            model,
            request_id,
            timestamp: ts,
            token_count,
        };
        let new_state = VaultState {
            vector_count: state.vector_count + 1,
            dims,
            last_access: now,
            created_at: state.created_at,
        };

        // Persistence first; the index only sees vectors the store accepted.
        self.store_mut()?.insert(&item, embedding, dims, &new_state)?;
        if let Some(index) = self.index.as_mut() {
            index.add(id, embedding, ts)?;
        }

        self.next_id = id;
        self.state = Some(new_state.clone());
        debug!(vault = %self.name, id, "vector stored");

        Ok(StoreResponse {
            id,
            stored: true,
            reason: None,
            token_count,
            total_vectors: new_state.vector_count,
        })
    }

    /// Feed text through the chunk buffer and persist the remainder.
    /// Emitted chunks go back to the caller for embedding.
    pub fn store_chunked(&mut self, content: &str, role: &str, now: f64) -> AppResult<ChunkedResponse> {
        let buffer = self
            .store_ref()?
            .load_buffer()?
            .map(|b| b.content)
            .unwrap_or_default();
        let plan = chunker::append(&buffer, role, content);
        let tokens = plan.buffer_tokens();
        self.store_ref()?.save_buffer(&plan.buffer, tokens as i64, now)?;
        Ok(ChunkedResponse {
            chunks_to_embed: plan.chunks,
            buffer_tokens: tokens,
            buffer_content: plan.buffer,
        })
    }

    pub fn buffer_get(&self) -> AppResult<Option<BufferInfo>> {
        self.buffer_info()
    }

    /// Emit the whole pending buffer as one undersized chunk.
    pub fn buffer_flush(&mut self, now: f64) -> AppResult<ChunkedResponse> {
        let buffer = self
            .store_ref()?
            .load_buffer()?
            .map(|b| b.content)
            .unwrap_or_default();
        let plan = chunker::flush(&buffer);
        self.store_ref()?.save_buffer("", 0, now)?;
        Ok(ChunkedResponse {
            chunks_to_embed: plan.chunks,
            buffer_tokens: 0,
            buffer_content: String::new(),
        })
    }

    pub fn buffer_clear(&mut self) -> AppResult<()> {
        self.store_ref()?.clear_buffer()
    }

    // ------------------------------------------------------------------
    // Deletion and lifecycle
    // ------------------------------------------------------------------

    pub fn delete(
        &mut self,
        ids: Option<Vec<i64>>,
        older_than: Option<f64>,
        now: f64,
    ) -> AppResult<DeleteResponse> {
        let state = self.state_ref()?.clone();

        let (deleted, bytes_deleted) = match (ids, older_than) {
            (Some(ids), _) if !ids.is_empty() => {
                let remaining = state.vector_count.saturating_sub(ids.len());
                let new_state = VaultState {
                    vector_count: remaining,
                    last_access: now,
                    ..state
                };
                let n = self.store_mut()?.delete_ids(&ids, &new_state)?;
                (n, 0i64)
            }
            (_, Some(cutoff)) => {
                let (_, bytes) = self.store_ref()?.bytes_older_than(cutoff)?;
                let new_state = VaultState {
                    last_access: now,
                    ..state
                };
                let n = self.store_mut()?.delete_older_than(cutoff, &new_state)?;
                (n, bytes)
            }
            _ => (0, 0),
        };

        // Reconcile counts from the authoritative tables, then rebuild the
        // in-memory index so it matches persistence exactly.
        let total = self.store_ref()?.count()?;
        if let Some(state) = &mut self.state {
            state.vector_count = total;
        }
        if let Some(state) = &self.state {
            self.store_ref()?.save_state(state)?;
        }
        if deleted > 0 {
            self.loaded = false;
            self.hydrate()?;
            info!(vault = %self.name, deleted, total, "vectors deleted, index rebuilt");
        }

        Ok(DeleteResponse {
            deleted,
            bytes_deleted,
            total_vectors: total,
        })
    }

    /// Drop all data; dimensionality stays pinned.
    pub fn clear(&mut self, now: f64) -> AppResult<()> {
        let state = self.state_ref()?.clone();
        let new_state = VaultState {
            vector_count: 0,
            dims: state.dims,
            last_access: now,
            created_at: state.created_at,
        };
        self.store_mut()?.wipe(&new_state)?;
        self.index = if new_state.dims > 0 {
            Some(VectorIndex::new(new_state.dims))
        } else {
            None
        };
        self.next_id = 0;
        self.state = Some(new_state);
        info!(vault = %self.name, "vault cleared");
        Ok(())
    }

    /// Like clear, but also unpins dims so the next store re-pins them.
    /// This is the switch-embedding-model path.
    pub fn reset(&mut self, now: f64) -> AppResult<()> {
        let state = self.state_ref()?.clone();
        let new_state = VaultState {
            vector_count: 0,
            dims: 0,
            last_access: now,
            created_at: state.created_at,
        };
        self.store_mut()?.wipe(&new_state)?;
        self.index = None;
        self.next_id = 0;
        self.state = Some(new_state);
        info!(vault = %self.name, "vault reset, dims unpinned");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn stats(&self) -> AppResult<StatsResponse> {
        let state = self.state_ref()?;
        let (oldest, newest) = self.store_ref()?.timestamp_range()?;
        let buffer_tokens = self
            .store_ref()?
            .load_buffer()?
            .map(|b| b.token_count)
            .unwrap_or(0);
        Ok(StatsResponse {
            vector_count: state.vector_count,
            dims: state.dims,
            created_at: state.created_at,
            last_access: state.last_access,
            total_vectors: self.store_ref()?.count()?,
            oldest_timestamp: oldest,
            newest_timestamp: newest,
            buffer_tokens,
        })
    }

    pub fn warmth(&self) -> AppResult<WarmthResponse> {
        let state = self.state_ref()?;
        let hot = self.index.as_ref().map(|i| i.len()).unwrap_or(0);
        Ok(WarmthResponse {
            is_warm: self.loaded && self.index.is_some(),
            vector_count: state.vector_count,
            hot_vectors: hot,
            last_active: state.last_access,
            loaded: self.loaded,
        })
    }

    pub fn archival_stats(&self, cutoff: f64) -> AppResult<ArchivalStatsResponse> {
        let total = self.store_ref()?.count()?;
        let (archived, bytes_archived) = self.store_ref()?.bytes_older_than(cutoff)?;
        let (oldest, newest) = self.store_ref()?.timestamp_range()?;
        Ok(ArchivalStatsResponse {
            total,
            archived,
            bytes_archived,
            oldest,
            newest,
        })
    }

    pub fn export(&self) -> AppResult<ExportResponse> {
        let state = self.state_ref()?.clone();
        let rows = self.store_ref()?.export_rows()?;
        let items = rows
            .iter()
            .map(|r| ExportItem {
                id: r.item.id,
                content: r.item.content.clone(),
                role: r.item.role.clone(),
                content_hash: r.item.content_hash.clone(),
                model: r.item.model.clone(),
                request_id: r.item.request_id.clone(),
                timestamp: r.item.timestamp,
                token_count: r.item.token_count,
            })
            .collect();
        let index_b64 = match &self.index {
            Some(index) => Some(
                base64::engine::general_purpose::STANDARD.encode(index.serialize()?),
            ),
            None => None,
        };
        Ok(ExportResponse {
            vault_state: state,
            items,
            index_b64,
        })
    }

    /// NDJSON lines for the raw export stream: one object per stored vector
    /// with the embedding base64-encoded.
    pub fn export_raw_lines(&self) -> AppResult<Vec<String>> {
        let rows = self.store_ref()?.export_rows()?;
        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let blob = crate::persist::vec_to_blob(&row.embedding);
            let line = serde_json::to_string(&serde_json::json!({
                "id": row.item.id,
                "content": row.item.content,
                "role": row.item.role,
                "timestamp": row.item.timestamp,
                "embedding_b64": base64::engine::general_purpose::STANDARD.encode(blob),
            }))?;
            lines.push(line);
        }
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kronos::{TemporalWindows, WINDOW_HOT, WINDOW_LONGTERM, WINDOW_WORKING};

    fn temp_vault_dims(dir: &tempfile::TempDir, name: &str, dims: usize) -> Vault {
        let path = dir.path().join(format!("{}.db", name));
        let mut vault = Vault::cold(name.to_string(), path, dims);
        vault.wake(now_ms()).unwrap();
        vault
    }

    fn temp_vault(dir: &tempfile::TempDir, name: &str) -> Vault {
        temp_vault_dims(dir, name, 4)
    }

    fn basis(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn content_hash_is_16_hex_chars() {
        let h = content_hash("hello");
        assert_eq!(h.len(), 16);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(h, content_hash("hello"));
        assert_ne!(h, content_hash("hello!"));
    }

    #[test]
    fn read_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault_dims(&dir, "raw", 8);

        let emb = basis(8, 0);
        let stored = vault
            .store(&emb, "A", "user", None, None, None, now_ms())
            .unwrap();
        assert!(stored.stored);

        let found = vault.search(&emb, 1, None, None).unwrap();
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].content, "A");
        assert_eq!(found.results[0].id, stored.id);
        assert!(found.results[0].score >= 0.9999);
        assert_eq!(found.hot_vectors, 1);
        assert_eq!(found.total_vectors, 1);
    }

    #[test]
    fn duplicate_store_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "dup");

        let first = vault
            .store(&basis(4, 0), "hello", "user", None, None, None, now_ms())
            .unwrap();
        let second = vault
            .store(&basis(4, 1), "hello", "user", None, None, None, now_ms())
            .unwrap();

        assert!(first.stored);
        assert!(!second.stored);
        assert_eq!(second.reason.as_deref(), Some("duplicate"));
        assert_eq!(second.id, first.id);
        assert_eq!(vault.stats().unwrap().total_vectors, 1);
    }

    #[test]
    fn configured_dims_are_enforced_from_the_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault_dims(&dir, "dims", 8);

        vault
            .store(&basis(8, 0), "a", "user", None, None, None, now_ms())
            .unwrap();
        let err = vault
            .store(&basis(16, 0), "b", "user", None, None, None, now_ms())
            .unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { expected: 8, got: 16 }));

        // An empty-but-pinned vault enforces too.
        let dir2 = tempfile::tempdir().unwrap();
        let mut fresh = temp_vault_dims(&dir2, "dims2", 8);
        let err = fresh
            .store(&basis(4, 0), "c", "user", None, None, None, now_ms())
            .unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { expected: 8, got: 4 }));
    }

    #[test]
    fn clear_keeps_dims_reset_unpins() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault_dims(&dir, "lifecycle", 8);
        vault
            .store(&basis(8, 0), "a", "user", None, None, None, now_ms())
            .unwrap();

        vault.clear(now_ms()).unwrap();
        assert!(vault.search(&basis(8, 0), 5, None, None).unwrap().results.is_empty());
        // Dims stay pinned after clear: a different width is still rejected.
        let err = vault
            .store(&basis(4, 0), "b", "user", None, None, None, now_ms())
            .unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { .. }));

        vault.reset(now_ms()).unwrap();
        // After reset the next store re-pins dimensionality.
        let stored = vault
            .store(&basis(4, 0), "c", "user", None, None, None, now_ms())
            .unwrap();
        assert!(stored.stored);
        assert_eq!(vault.stats().unwrap().dims, 4);
    }

    #[test]
    fn clear_rejects_mismatched_dims_on_next_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault_dims(&dir, "clear-dims", 8);
        vault
            .store(&basis(8, 0), "a", "user", None, None, None, now_ms())
            .unwrap();
        vault.clear(now_ms()).unwrap();

        // vector_count is 0 but dims are pinned at 8, so 8 works again.
        let ok = vault
            .store(&basis(8, 1), "d", "user", None, None, None, now_ms())
            .unwrap();
        assert!(ok.stored);
    }

    #[test]
    fn delete_older_than_accounts_bytes_and_rehydrates() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "del");
        let now = now_ms();

        vault
            .store(&basis(4, 0), "ancient", "user", None, None, Some(now - 1_000_000.0), now)
            .unwrap();
        vault
            .store(&basis(4, 1), "recent", "user", None, None, Some(now), now)
            .unwrap();

        let out = vault.delete(None, Some(now - 500_000.0), now).unwrap();
        assert_eq!(out.deleted, 1);
        // 16 embedding bytes + 7 content bytes.
        assert_eq!(out.bytes_deleted, 23);
        assert_eq!(out.total_vectors, 1);

        let found = vault.search(&basis(4, 0), 5, None, None).unwrap();
        assert_eq!(found.results.len(), 1);
        assert_eq!(found.results[0].content, "recent");
        assert_eq!(found.hot_vectors, 1);
    }

    #[test]
    fn delete_by_ids() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "del-ids");
        let a = vault
            .store(&basis(4, 0), "a", "user", None, None, None, now_ms())
            .unwrap();
        vault
            .store(&basis(4, 1), "b", "user", None, None, None, now_ms())
            .unwrap();

        let out = vault.delete(Some(vec![a.id]), None, now_ms()).unwrap();
        assert_eq!(out.deleted, 1);
        assert_eq!(out.bytes_deleted, 0);
        assert_eq!(out.total_vectors, 1);
    }

    #[test]
    fn delete_with_neither_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "del-noop");
        vault
            .store(&basis(4, 0), "a", "user", None, None, None, now_ms())
            .unwrap();
        let out = vault.delete(None, None, now_ms()).unwrap();
        assert_eq!(out.deleted, 0);
        assert_eq!(out.total_vectors, 1);
    }

    #[test]
    fn hibernation_survives_via_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hib.db");
        let now = now_ms();

        {
            let mut vault = Vault::cold("hib".to_string(), path.clone(), 4);
            vault.wake(now).unwrap();
            vault
                .store(&basis(4, 2), "survives", "user", None, None, None, now)
                .unwrap();
            vault.store_chunked("partial message", "user", now).unwrap();
        }

        // Process state dropped; a fresh handle re-hydrates from disk.
        let mut vault = Vault::cold("hib".to_string(), path, 4);
        vault.wake(now_ms()).unwrap();

        let warmth = vault.warmth().unwrap();
        assert!(warmth.loaded);
        assert_eq!(warmth.hot_vectors, 1);

        let found = vault.search(&basis(4, 2), 1, None, None).unwrap();
        assert_eq!(found.results[0].content, "survives");
        let buffer = found.buffer.expect("pending buffer survives hibernation");
        assert!(buffer.content.contains("partial message"));
    }

    #[test]
    fn store_chunked_emits_and_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "chunk");
        let text = "Lorem ipsum. ".repeat(116);

        let out = vault.store_chunked(&text, "user", now_ms()).unwrap();
        assert_eq!(out.chunks_to_embed.len(), 1);
        assert!(out.chunks_to_embed[0].ends_with('.'));
        assert!(out.buffer_tokens > 0);
        assert!(out.buffer_tokens < chunker::TARGET_TOKENS);

        let info = vault.buffer_get().unwrap().unwrap();
        assert_eq!(info.content, out.buffer_content);
    }

    #[test]
    fn buffer_flush_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "buf");
        vault.store_chunked("short message", "user", now_ms()).unwrap();

        let flushed = vault.buffer_flush(now_ms()).unwrap();
        assert_eq!(flushed.chunks_to_embed.len(), 1);
        assert!(flushed.chunks_to_embed[0].contains("short message"));
        assert!(vault.buffer_get().unwrap().is_none());

        vault.store_chunked("again", "user", now_ms()).unwrap();
        vault.buffer_clear().unwrap();
        assert!(vault.buffer_get().unwrap().is_none());
    }

    #[test]
    fn window_search_buckets_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "windows");
        let now = chrono::Utc::now().timestamp_millis() as f64;
        let hour = 3_600_000.0;
        let day = 86_400_000.0;

        let q = basis(4, 0);
        vault.store(&q, "four hours", "user", None, None, Some(now - 4.0 * hour), now).unwrap();
        vault.store(&q, "one day", "user", None, None, Some(now - 24.0 * hour), now).unwrap();
        vault.store(&q, "one week", "user", None, None, Some(now - 7.0 * day), now).unwrap();
        vault.store(&q, "hundred days", "user", None, None, Some(now - 100.0 * day), now).unwrap();

        let windows = TemporalWindows {
            hot_hours: 4.0,
            working_days: 3.0,
            longterm_days: 90.0,
        };
        let specs = windows.plan(now, 10);
        let out = vault.search_windows(&q, &specs).unwrap();

        let contents = |name: &str| -> Vec<String> {
            out.windows[name].iter().map(|r| r.content.clone()).collect()
        };
        assert_eq!(contents(WINDOW_HOT), vec!["four hours"]);
        assert_eq!(contents(WINDOW_WORKING), vec!["one day"]);
        assert_eq!(contents(WINDOW_LONGTERM), vec!["one week"]);
        // The 100-day-old item is expired: present in no window.
        let all: Vec<String> = out.windows.values().flatten().map(|r| r.content.clone()).collect();
        assert!(!all.contains(&"hundred days".to_string()));
    }

    #[test]
    fn stats_and_archival() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "stats");
        let now = now_ms();
        vault.store(&basis(4, 0), "old", "user", None, None, Some(now - 10_000.0), now).unwrap();
        vault.store(&basis(4, 1), "new", "user", None, None, Some(now), now).unwrap();

        let stats = vault.stats().unwrap();
        assert_eq!(stats.total_vectors, 2);
        assert_eq!(stats.dims, 4);
        assert!(stats.oldest_timestamp.unwrap() < stats.newest_timestamp.unwrap());

        let arch = vault.archival_stats(now - 5_000.0).unwrap();
        assert_eq!(arch.total, 2);
        assert_eq!(arch.archived, 1);
        assert!(arch.bytes_archived > 0);
    }

    #[test]
    fn export_round_trips_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = temp_vault(&dir, "export");
        vault.store(&basis(4, 0), "x", "user", None, None, None, now_ms()).unwrap();
        vault.store(&basis(4, 1), "y", "assistant", None, None, None, now_ms()).unwrap();

        let export = vault.export().unwrap();
        assert_eq!(export.items.len(), 2);
        let blob = base64::engine::general_purpose::STANDARD
            .decode(export.index_b64.unwrap())
            .unwrap();
        let restored = VectorIndex::deserialize(&blob).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.dims(), 4);

        let lines = vault.export_raw_lines().unwrap();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert!(first["embedding_b64"].is_string());
    }
}
