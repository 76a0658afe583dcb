//! Retrieval coordination: temporal planning plus the hot/cold race.
//!
//! Every retrieval runs two paths at once. The authoritative path asks the
//! vault itself — complete, but a hibernated vault pays seconds of hydration
//! first. The replica path asks the always-warm partial mirror. A
//! coverage-aware select picks the winner: a small vault is fully covered by
//! the replica, so the replica's answer is taken outright; a large vault
//! gets the authoritative answer unless it misses its deadline, in which
//! case the replica's partial answer ships instead. The pending chunk
//! buffer always joins the final set as a synthetic HOT result.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::embedder::{Embedder, EMBED_BATCH_SIZE};
use crate::error::{AppError, AppResult};
use crate::kronos::{
    self, per_window_budget, vault_budget, ScoredChunk, TemporalWindows, WindowBreakdown,
    WINDOW_HOT,
};
use crate::replica::ReplicaIndex;
use crate::vault::{content_hash, now_ms};
use crate::vaults::{VaultManager, VaultName};

/// Replica rows per key; at or below this the replica covers the whole vault.
pub const REPLICA_COVERAGE_LIMIT: usize = 2000;

#[derive(Debug, Clone, Serialize)]
pub struct RetrieveOutcome {
    pub results: Vec<ScoredChunk>,
    pub window_breakdown: WindowBreakdown,
    pub token_count: usize,
    /// Which side of the race produced the results.
    pub source: String,
    /// Estimated vault size (replica row count).
    pub vault_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub chunks_stored: usize,
    pub buffer_tokens: usize,
    pub ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkOutcome {
    pub stored: usize,
    pub failed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    pub d1_synced: usize,
    pub d1_chunks_synced: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub d1_errors: Option<Vec<String>>,
}

/// Decide the race between the authoritative and replica searches.
///
/// Both futures are spawned (started) before anything is awaited. The loser
/// is aborted where possible; blocking work already underway finishes as an
/// orphan and is discarded.
pub async fn race(
    authoritative: impl Future<Output = AppResult<Vec<ScoredChunk>>> + Send + 'static,
    replica: impl Future<Output = AppResult<Vec<ScoredChunk>>> + Send + 'static,
    replica_count: usize,
    coverage_limit: usize,
    deadline: Duration,
) -> (Vec<ScoredChunk>, &'static str) {
    let auth_task = tokio::spawn(authoritative);
    let replica_task = tokio::spawn(replica);

    // Small vault: the replica holds everything the vault does, so its
    // answer wins on coverage even when the authoritative side is fast.
    if replica_count <= coverage_limit {
        match replica_task.await {
            Ok(Ok(hits)) if !hits.is_empty() => {
                auth_task.abort();
                return (hits, "replica");
            }
            Ok(Ok(_)) => debug!("replica empty on small vault, deferring to authoritative"),
            Ok(Err(e)) => warn!("replica search failed: {}", e),
            Err(e) => warn!("replica task failed: {}", e),
        }
        return match tokio::time::timeout(deadline, auth_task).await {
            Ok(Ok(Ok(hits))) => (hits, "authoritative"),
            Ok(Ok(Err(e))) => {
                warn!("authoritative search failed: {}", e);
                (Vec::new(), "authoritative")
            }
            Ok(Err(e)) => {
                warn!("authoritative task failed: {}", e);
                (Vec::new(), "authoritative")
            }
            Err(_) => (Vec::new(), "authoritative"),
        };
    }

    // Large vault: full coverage needs the authoritative answer, so it gets
    // the whole deadline. A timeout or an empty answer degrades to the
    // replica's partial view rather than erroring.
    match tokio::time::timeout(deadline, auth_task).await {
        Ok(Ok(Ok(hits))) if !hits.is_empty() => {
            replica_task.abort();
            (hits, "authoritative")
        }
        outcome => {
            match &outcome {
                Err(_) => debug!("authoritative search missed its deadline, using replica"),
                Ok(Ok(Ok(_))) => debug!("authoritative search empty, using replica"),
                Ok(Ok(Err(e))) => warn!("authoritative search failed: {}", e),
                Ok(Err(e)) => warn!("authoritative task failed: {}", e),
            }
            match replica_task.await {
                Ok(Ok(hits)) => (hits, "replica"),
                Ok(Err(e)) => {
                    warn!("replica search failed after fallback: {}", e);
                    (Vec::new(), "replica")
                }
                Err(e) => {
                    warn!("replica task failed after fallback: {}", e);
                    (Vec::new(), "replica")
                }
            }
        }
    }
}

pub struct RetrievalCoordinator {
    vaults: Arc<VaultManager>,
    replica: Arc<ReplicaIndex>,
    embedder: Arc<dyn Embedder>,
    windows: TemporalWindows,
    race_timeout: Duration,
    coverage_limit: usize,
}

impl RetrievalCoordinator {
    pub fn new(
        vaults: Arc<VaultManager>,
        replica: Arc<ReplicaIndex>,
        embedder: Arc<dyn Embedder>,
        windows: TemporalWindows,
        race_timeout: Duration,
        coverage_limit: usize,
    ) -> Self {
        Self {
            vaults,
            replica,
            embedder,
            windows,
            race_timeout,
            coverage_limit,
        }
    }

    /// Free-text entry point: embed the query, then run the planned race.
    pub async fn retrieve_text(
        &self,
        memory_key: &str,
        session_id: Option<&str>,
        query: &str,
        k: usize,
    ) -> AppResult<RetrieveOutcome> {
        let embedding = self.embedder.embed(query).await?;
        self.retrieve(memory_key, session_id, embedding, k).await
    }

    /// Plan windows per vault, race authoritative against replica, merge.
    pub async fn retrieve(
        &self,
        memory_key: &str,
        session_id: Option<&str>,
        query: Vec<f32>,
        k: usize,
    ) -> AppResult<RetrieveOutcome> {
        let now = now_ms();
        let mut names = vec![VaultName::core(memory_key)?];
        if let Some(session) = session_id {
            names.push(VaultName::new(memory_key, Some(session), None)?);
        }
        // The vault whose buffer represents in-flight conversation state:
        // session-scoped when one is addressed, core otherwise.
        let buffer_vault = names.last().cloned().unwrap_or_else(|| names[0].clone());

        let allocation = 1.0 / names.len() as f64;
        let per_window = per_window_budget(vault_budget(k, allocation));
        let specs = self.windows.plan(now, per_window);
        let longterm_floor = specs.last().map(|s| s.min_ts);

        // Everything launches before anything is awaited: replica count,
        // buffer fetch, replica search, authoritative fan-out.
        let count_task = {
            let replica = self.replica.clone();
            let key = memory_key.to_string();
            tokio::task::spawn_blocking(move || replica.count(&key))
        };
        let buffer_task = {
            let replica = self.replica.clone();
            let name = buffer_vault.as_str();
            tokio::task::spawn_blocking(move || replica.get_buffer(&name))
        };

        let replica_future = {
            let replica = self.replica.clone();
            let key = memory_key.to_string();
            let q = query.clone();
            let windows = self.windows;
            async move {
                tokio::task::spawn_blocking(move || {
                    let hits = replica.search(&key, &q, k, longterm_floor, Some(now))?;
                    Ok(hits
                        .into_iter()
                        .filter_map(|h| {
                            windows.classify(now, h.timestamp).map(|window| ScoredChunk {
                                id: None,
                                content: h.content,
                                role: h.role,
                                score: h.score,
                                timestamp: h.timestamp,
                                window: window.to_string(),
                                source: "replica".to_string(),
                                model: None,
                            })
                        })
                        .collect::<Vec<_>>())
                })
                .await
                .map_err(|e| AppError::VaultError(format!("replica task failed: {}", e)))?
            }
        };

        let authoritative_future = {
            let vaults = self.vaults.clone();
            let q = query.clone();
            let specs = specs.clone();
            async move {
                let searches = names.iter().map(|name| {
                    let vaults = vaults.clone();
                    let q = q.clone();
                    let specs = specs.clone();
                    let name = name.clone();
                    async move {
                        let out = vaults
                            .with_vault(&name, move |vault| vault.search_windows(&q, &specs))
                            .await;
                        (name, out)
                    }
                });
                let mut chunks = Vec::new();
                for (name, outcome) in join_all(searches).await {
                    match outcome {
                        Ok(response) => {
                            for (window, rows) in response.windows {
                                for row in rows {
                                    chunks.push(ScoredChunk {
                                        id: Some(row.id),
                                        content: row.content,
                                        role: row.role,
                                        score: row.score,
                                        timestamp: row.timestamp,
                                        window: window.clone(),
                                        source: "vault".to_string(),
                                        model: row.model,
                                    });
                                }
                            }
                        }
                        // One failed vault window set degrades to empty
                        // rather than failing the whole retrieval.
                        Err(e) => warn!(vault = %name, "vault search failed: {}", e),
                    }
                }
                Ok(chunks)
            }
        };

        let vault_size = match count_task.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                warn!("replica count failed, assuming large vault: {}", e);
                self.coverage_limit + 1
            }
            Err(e) => {
                warn!("replica count task failed, assuming large vault: {}", e);
                self.coverage_limit + 1
            }
        };

        let (mut candidates, source) = race(
            authoritative_future,
            replica_future,
            vault_size,
            self.coverage_limit,
            self.race_timeout,
        )
        .await;

        // The pending buffer is the freshest context there is: it joins as a
        // synthetic HOT result at full score.
        if let Ok(Ok(Some(buffer))) = buffer_task.await {
            if !buffer.trim().is_empty() {
                candidates.push(ScoredChunk {
                    id: None,
                    content: buffer,
                    role: "chunk".to_string(),
                    score: 1.0,
                    timestamp: now,
                    window: WINDOW_HOT.to_string(),
                    source: "buffer".to_string(),
                    model: None,
                });
            }
        }

        let merged = kronos::merge(candidates, k);
        Ok(RetrieveOutcome {
            results: merged.results,
            window_breakdown: merged.window_breakdown,
            token_count: merged.token_count,
            source: source.to_string(),
            vault_size,
        })
    }

    /// Ingestion flow: text through the chunk buffer, emitted chunks through
    /// the embedder, stored in the vault, mirrored to the replica.
    pub async fn ingest(
        &self,
        memory_key: &str,
        session_id: Option<&str>,
        role: &str,
        content: &str,
    ) -> AppResult<IngestOutcome> {
        let name = VaultName::new(memory_key, session_id, None)?;
        let now = now_ms();

        let role_owned = role.to_string();
        let content_owned = content.to_string();
        let chunked = self
            .vaults
            .with_vault(&name, move |vault| {
                vault.store_chunked(&content_owned, &role_owned, now)
            })
            .await?;

        // Keep the replica's buffer mirror fresh so the cold path can serve it.
        {
            let replica = self.replica.clone();
            let vault_name = name.as_str();
            let buffer = chunked.buffer_content.clone();
            let tokens = chunked.buffer_tokens as i64;
            tokio::task::spawn_blocking(move || {
                if let Err(e) = replica.save_buffer(&vault_name, &buffer, tokens, now) {
                    warn!("buffer mirror write failed: {}", e);
                }
            });
        }

        if chunked.chunks_to_embed.is_empty() {
            return Ok(IngestOutcome {
                chunks_stored: 0,
                buffer_tokens: chunked.buffer_tokens,
                ids: Vec::new(),
            });
        }

        let embeddings = self.embedder.embed_batch(&chunked.chunks_to_embed).await?;
        // One request id ties every chunk of this ingestion together.
        let request_id = uuid::Uuid::new_v4().to_string();
        let mut ids = Vec::new();
        for (chunk, embedding) in chunked.chunks_to_embed.iter().zip(embeddings) {
            let chunk_owned = chunk.clone();
            let emb = embedding.clone();
            let req_id = request_id.clone();
            let stored = self
                .vaults
                .with_vault(&name, move |vault| {
                    vault.store(&emb, &chunk_owned, "chunk", None, Some(req_id), None, now_ms())
                })
                .await?;
            if stored.stored {
                ids.push(stored.id);
                // Interactive mirror is fire-and-forget by policy; bulk
                // ingestion is the tracked path.
                let replica = self.replica.clone();
                let key = memory_key.to_string();
                let session = session_id.map(|s| s.to_string());
                let chunk = chunk.clone();
                tokio::task::spawn_blocking(move || {
                    let hash = content_hash(&chunk);
                    if let Err(e) = replica.append(
                        &key,
                        session.as_deref(),
                        &chunk,
                        "chunk",
                        &hash,
                        &embedding,
                        now_ms(),
                    ) {
                        warn!("replica mirror write failed: {}", e);
                    }
                });
            }
        }

        Ok(IngestOutcome {
            chunks_stored: ids.len(),
            buffer_tokens: chunked.buffer_tokens,
            ids,
        })
    }

    /// JSONL bulk ingestion with per-item error isolation and tracked
    /// replica mirroring.
    pub async fn bulk_store(
        &self,
        memory_key: &str,
        session_id: Option<&str>,
        body: &str,
    ) -> AppResult<BulkOutcome> {
        #[derive(serde::Deserialize)]
        struct BulkLine {
            content: String,
            role: Option<String>,
            timestamp: Option<f64>,
        }

        let name = VaultName::new(memory_key, session_id, None)?;

        let mut lines = Vec::new();
        let mut errors: Vec<String> = Vec::new();
        let mut failed = 0usize;
        for (lineno, raw) in body.lines().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            match serde_json::from_str::<BulkLine>(raw) {
                Ok(line) if !line.content.trim().is_empty() => lines.push(line),
                Ok(_) => {
                    failed += 1;
                    errors.push(format!("line {}: empty content", lineno + 1));
                }
                Err(e) => {
                    failed += 1;
                    errors.push(format!("line {}: {}", lineno + 1, e));
                }
            }
        }
        if lines.is_empty() && errors.is_empty() {
            return Err(AppError::BadRequest("bulk payload is empty".to_string()));
        }

        let mut stored = 0usize;
        let mut mirrored: Vec<(String, String, Vec<f32>, f64)> = Vec::new();

        for batch in lines.chunks(EMBED_BATCH_SIZE) {
            let texts: Vec<String> = batch.iter().map(|l| l.content.clone()).collect();
            let embeddings = match self.embedder.embed_batch(&texts).await {
                Ok(embs) => embs.into_iter().map(Some).collect::<Vec<_>>(),
                Err(batch_err) => {
                    // Whole batch failed: retry item by item so one bad
                    // record cannot sink its neighbors.
                    debug!("embedding batch failed ({}), retrying item-by-item", batch_err);
                    let mut singles = Vec::with_capacity(batch.len());
                    for line in batch {
                        match self.embedder.embed(&line.content).await {
                            Ok(emb) => singles.push(Some(emb)),
                            Err(e) => {
                                failed += 1;
                                errors.push(format!(
                                    "embed failed for {:?}: {}",
                                    line.content.chars().take(40).collect::<String>(),
                                    e
                                ));
                                singles.push(None);
                            }
                        }
                    }
                    singles
                }
            };

            for (line, embedding) in batch.iter().zip(embeddings) {
                let Some(embedding) = embedding else { continue };
                let content = line.content.clone();
                let role = line.role.clone().unwrap_or_else(|| "user".to_string());
                let ts = line.timestamp;
                let emb = embedding.clone();
                let role_for_store = role.clone();
                let outcome = self
                    .vaults
                    .with_vault(&name, move |vault| {
                        vault.store(&emb, &content, &role_for_store, None, None, ts, now_ms())
                    })
                    .await;
                match outcome {
                    Ok(resp) if resp.stored => {
                        stored += 1;
                        mirrored.push((
                            line.content.clone(),
                            role,
                            embedding,
                            ts.unwrap_or_else(now_ms),
                        ));
                    }
                    Ok(_) => {} // duplicate: idempotent, not an error
                    Err(e) => {
                        failed += 1;
                        errors.push(format!(
                            "store failed for {:?}: {}",
                            line.content.chars().take(40).collect::<String>(),
                            e
                        ));
                    }
                }
            }
        }

        // Replica mirroring for bulk is tracked: the response reports exactly
        // how much of the write reached the replica.
        let mut d1_synced = 0usize;
        let mut d1_chunks_synced = 0usize;
        let mut d1_errors: Vec<String> = Vec::new();
        let mirror_tasks: Vec<_> = mirrored
            .into_iter()
            .map(|(content, role, embedding, ts)| {
                let replica = self.replica.clone();
                let key = memory_key.to_string();
                let session = session_id.map(|s| s.to_string());
                tokio::task::spawn_blocking(move || {
                    let hash = content_hash(&content);
                    replica
                        .append(&key, session.as_deref(), &content, &role, &hash, &embedding, ts)
                        .map(|_| role == "chunk")
                })
            })
            .collect();
        for task in join_all(mirror_tasks).await {
            match task {
                Ok(Ok(is_chunk)) => {
                    d1_synced += 1;
                    if is_chunk {
                        d1_chunks_synced += 1;
                    }
                }
                Ok(Err(e)) => d1_errors.push(e.to_string()),
                Err(e) => d1_errors.push(format!("mirror task failed: {}", e)),
            }
        }

        Ok(BulkOutcome {
            stored,
            failed,
            errors: if errors.is_empty() { None } else { Some(errors) },
            d1_synced,
            d1_chunks_synced,
            d1_errors: if d1_errors.is_empty() {
                None
            } else {
                Some(d1_errors)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::testing::HashEmbedder;

    fn chunk(content: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            id: None,
            content: content.to_string(),
            role: "chunk".to_string(),
            score,
            timestamp: 0.0,
            window: WINDOW_HOT.to_string(),
            source: "vault".to_string(),
            model: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_authoritative_loses_within_budget() {
        // Large vault (replica does not cover it) and an authoritative
        // search stuck for five seconds: the replica's partial answer ships
        // inside the 2.5 s budget.
        let authoritative = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(vec![chunk("authoritative", 0.9)])
        };
        let replica = async { Ok(vec![chunk("replica partial", 0.7)]) };

        let started = tokio::time::Instant::now();
        let (hits, source) = race(
            authoritative,
            replica,
            3000,
            REPLICA_COVERAGE_LIMIT,
            Duration::from_millis(2500),
        )
        .await;

        assert_eq!(source, "replica");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "replica partial");
        assert!(started.elapsed() <= Duration::from_millis(2600));
    }

    #[tokio::test(start_paused = true)]
    async fn small_vault_prefers_replica_coverage() {
        // Authoritative would answer instantly, but the replica covers the
        // whole vault so its answer wins.
        let authoritative = async { Ok(vec![chunk("authoritative", 0.99)]) };
        let replica = async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(vec![chunk("replica full", 0.5)])
        };

        let (hits, source) = race(
            authoritative,
            replica,
            100,
            REPLICA_COVERAGE_LIMIT,
            Duration::from_millis(2500),
        )
        .await;

        assert_eq!(source, "replica");
        assert_eq!(hits[0].content, "replica full");
    }

    #[tokio::test(start_paused = true)]
    async fn small_vault_with_empty_replica_waits_for_authoritative() {
        let authoritative = async { Ok(vec![chunk("authoritative", 0.9)]) };
        let replica = async { Ok(Vec::new()) };

        let (hits, source) = race(
            authoritative,
            replica,
            0,
            REPLICA_COVERAGE_LIMIT,
            Duration::from_millis(2500),
        )
        .await;

        assert_eq!(source, "authoritative");
        assert_eq!(hits[0].content, "authoritative");
    }

    #[tokio::test(start_paused = true)]
    async fn large_vault_fast_authoritative_wins() {
        let authoritative = async { Ok(vec![chunk("authoritative", 0.9)]) };
        let replica = async { Ok(vec![chunk("replica", 0.5)]) };

        let (hits, source) = race(
            authoritative,
            replica,
            5000,
            REPLICA_COVERAGE_LIMIT,
            Duration::from_millis(2500),
        )
        .await;

        assert_eq!(source, "authoritative");
        assert_eq!(hits[0].content, "authoritative");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_authoritative_falls_back_to_replica() {
        let authoritative = async { Ok(Vec::new()) };
        let replica = async { Ok(vec![chunk("replica", 0.5)]) };

        let (hits, source) = race(
            authoritative,
            replica,
            5000,
            REPLICA_COVERAGE_LIMIT,
            Duration::from_millis(2500),
        )
        .await;

        assert_eq!(source, "replica");
        assert_eq!(hits[0].content, "replica");
    }

    fn coordinator(dir: &tempfile::TempDir, dims: usize) -> RetrievalCoordinator {
        let vaults = Arc::new(VaultManager::new(dir.path().to_path_buf(), dims));
        let replica = Arc::new(ReplicaIndex::open_in_memory(REPLICA_COVERAGE_LIMIT).unwrap());
        let embedder = Arc::new(HashEmbedder { dims });
        RetrievalCoordinator::new(
            vaults,
            replica,
            embedder,
            TemporalWindows {
                hot_hours: 4.0,
                working_days: 3.0,
                longterm_days: 90.0,
            },
            Duration::from_millis(2500),
            REPLICA_COVERAGE_LIMIT,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ingest_then_retrieve_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir, 64);

        // Long enough to force at least one chunk out of the buffer.
        let text = format!(
            "{} The database migration plan needs a rollback step. ",
            "We discussed the quarterly infrastructure budget at length. ".repeat(30)
        );
        let out = coord.ingest("tenant", None, "user", &text).await.unwrap();
        assert!(out.chunks_stored >= 1);

        let found = coord
            .retrieve_text("tenant", None, "quarterly infrastructure budget", 5)
            .await
            .unwrap();
        assert!(!found.results.is_empty());
        assert!(found
            .results
            .iter()
            .any(|r| r.content.contains("infrastructure budget")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pending_buffer_surfaces_as_synthetic_hot_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir, 32);

        // Short message: everything stays in the buffer, nothing is stored.
        let out = coord
            .ingest("tenant", None, "user", "remember the blue door code 4471")
            .await
            .unwrap();
        assert_eq!(out.chunks_stored, 0);
        assert!(out.buffer_tokens > 0);

        // Buffer mirror write is fire-and-forget; let it land.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let found = coord
            .retrieve_text("tenant", None, "door code", 5)
            .await
            .unwrap();
        let buffered: Vec<_> = found
            .results
            .iter()
            .filter(|r| r.source == "buffer")
            .collect();
        assert_eq!(buffered.len(), 1);
        assert!(buffered[0].content.contains("4471"));
        assert_eq!(buffered[0].score, 1.0);
        assert_eq!(buffered[0].window, WINDOW_HOT);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_store_reports_sync_counts() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir, 32);

        let body = [
            r#"{"content": "first memory about sailing"}"#,
            r#"{"content": "second memory about cooking", "role": "assistant"}"#,
            r#"not json at all"#,
            r#"{"content": ""}"#,
        ]
        .join("\n");

        let out = coord.bulk_store("tenant", None, &body).await.unwrap();
        assert_eq!(out.stored, 2);
        assert_eq!(out.failed, 2);
        assert_eq!(out.errors.as_ref().unwrap().len(), 2);
        assert_eq!(out.d1_synced, 2);
        assert_eq!(out.d1_chunks_synced, 0);
        assert!(out.d1_errors.is_none());

        // Idempotent on replay: duplicates are skipped, not errors.
        let again = coord
            .bulk_store("tenant", None, r#"{"content": "first memory about sailing"}"#)
            .await
            .unwrap();
        assert_eq!(again.stored, 0);
        assert_eq!(again.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bulk_store_rejects_empty_payload() {
        let dir = tempfile::tempdir().unwrap();
        let coord = coordinator(&dir, 32);
        let err = coord.bulk_store("tenant", None, "\n\n").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failing_embedder_isolates_errors() {
        let dir = tempfile::tempdir().unwrap();
        let vaults = Arc::new(VaultManager::new(dir.path().to_path_buf(), 32));
        let replica = Arc::new(ReplicaIndex::open_in_memory(REPLICA_COVERAGE_LIMIT).unwrap());
        let coord = RetrievalCoordinator::new(
            vaults,
            replica,
            Arc::new(crate::embedder::testing::FailingEmbedder),
            TemporalWindows {
                hot_hours: 4.0,
                working_days: 3.0,
                longterm_days: 90.0,
            },
            Duration::from_millis(2500),
            REPLICA_COVERAGE_LIMIT,
        );

        let body = r#"{"content": "doomed record"}"#;
        let out = coord.bulk_store("tenant", None, body).await.unwrap();
        assert_eq!(out.stored, 0);
        assert_eq!(out.failed, 1);
        assert_eq!(out.errors.unwrap().len(), 1);
    }
}
