//! Shared replica index.
//!
//! A single SQLite database mirroring the newest ~2000 chunks per memory key,
//! with embeddings inline. It is the always-warm side of the retrieval race:
//! complete only for small vaults, but answerable immediately while an
//! authoritative vault hydrates. Writers append under `(memory_key,
//! session_id?)` partition keys; reads are brute-force scans bounded to the
//! newest rows for one key.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{AppError, AppResult};
use crate::index::l2_norm;
use crate::persist::{blob_to_vec, vec_to_blob};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS replica_chunks (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    memory_key   TEXT NOT NULL,
    session_id   TEXT,
    content      TEXT NOT NULL,
    role         TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    embedding    BLOB NOT NULL,
    timestamp    REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_replica_key_ts ON replica_chunks(memory_key, timestamp);
CREATE UNIQUE INDEX IF NOT EXISTS idx_replica_key_hash ON replica_chunks(memory_key, content_hash);

CREATE TABLE IF NOT EXISTS replica_buffers (
    vault_name   TEXT PRIMARY KEY,
    content      TEXT NOT NULL,
    token_count  INTEGER NOT NULL,
    last_updated REAL NOT NULL
);
";

#[derive(Debug, Clone)]
pub struct ReplicaHit {
    pub content: String,
    pub role: String,
    pub score: f32,
    pub timestamp: f64,
}

pub struct ReplicaIndex {
    conn: Mutex<Connection>,
    max_chunks: usize,
}

impl ReplicaIndex {
    pub fn open(path: impl AsRef<Path>, max_chunks: usize) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_chunks,
        })
    }

    #[cfg(test)]
    pub fn open_in_memory(max_chunks: usize) -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_chunks,
        })
    }

    /// Append one chunk, normalizing the embedding before storage.
    /// Returns false when the key already holds this content hash.
    pub fn append(
        &self,
        memory_key: &str,
        session_id: Option<&str>,
        content: &str,
        role: &str,
        content_hash: &str,
        embedding: &[f32],
        timestamp: f64,
    ) -> AppResult<bool> {
        let norm = l2_norm(embedding);
        if norm < 1e-12 {
            return Err(AppError::BadRequest(
                "cannot mirror a zero-norm embedding".to_string(),
            ));
        }
        let unit: Vec<f32> = embedding.iter().map(|x| x / norm).collect();

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO replica_chunks
                 (memory_key, session_id, content, role, content_hash, embedding, timestamp)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                memory_key,
                session_id,
                content,
                role,
                content_hash,
                vec_to_blob(&unit),
                timestamp
            ],
        )?;
        if inserted == 0 {
            return Ok(false);
        }

        // Retention: keep only the newest rows for this key.
        conn.execute(
            "DELETE FROM replica_chunks
             WHERE memory_key = ?1
               AND id NOT IN (
                   SELECT id FROM replica_chunks
                   WHERE memory_key = ?1
                   ORDER BY timestamp DESC, id DESC
                   LIMIT ?2
               )",
            params![memory_key, self.max_chunks as i64],
        )?;
        Ok(true)
    }

    /// Chunk count for one key. Doubles as the race's vault-size estimate.
    pub fn count(&self, memory_key: &str) -> AppResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM replica_chunks WHERE memory_key = ?1",
            params![memory_key],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    /// Brute-force cosine top-k over the newest rows for a key, with optional
    /// timestamp bounds.
    pub fn search(
        &self,
        memory_key: &str,
        query: &[f32],
        k: usize,
        min_ts: Option<f64>,
        max_ts: Option<f64>,
    ) -> AppResult<Vec<ReplicaHit>> {
        let norm = l2_norm(query);
        if norm < 1e-12 {
            return Ok(Vec::new());
        }
        let q: Vec<f32> = query.iter().map(|x| x / norm).collect();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT content, role, embedding, timestamp
             FROM replica_chunks
             WHERE memory_key = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![memory_key, self.max_chunks as i64], |row| {
            let content: String = row.get(0)?;
            let role: String = row.get(1)?;
            let blob: Vec<u8> = row.get(2)?;
            let ts: f64 = row.get(3)?;
            Ok((content, role, blob, ts))
        })?;

        let mut hits = Vec::new();
        for row in rows {
            let (content, role, blob, ts) = row?;
            if let Some(min) = min_ts {
                if ts < min {
                    continue;
                }
            }
            if let Some(max) = max_ts {
                if ts > max {
                    continue;
                }
            }
            let emb = blob_to_vec(&blob)?;
            if emb.len() != q.len() {
                // Rows written under a previous embedding model; skip rather
                // than poison the whole scan.
                continue;
            }
            let score: f32 = q.iter().zip(&emb).map(|(a, b)| a * b).sum();
            hits.push(ReplicaHit {
                content,
                role,
                score,
                timestamp: ts,
            });
        }

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }

    /// Mirror a vault's pending-buffer snapshot so the cold retrieval path
    /// can surface it without waking the vault.
    pub fn save_buffer(
        &self,
        vault_name: &str,
        content: &str,
        token_count: i64,
        now_ms: f64,
    ) -> AppResult<()> {
        let conn = self.conn.lock();
        if content.is_empty() {
            conn.execute(
                "DELETE FROM replica_buffers WHERE vault_name = ?1",
                params![vault_name],
            )?;
            return Ok(());
        }
        conn.execute(
            "INSERT INTO replica_buffers(vault_name, content, token_count, last_updated)
             VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(vault_name) DO UPDATE SET
                 content = excluded.content,
                 token_count = excluded.token_count,
                 last_updated = excluded.last_updated",
            params![vault_name, content, token_count, now_ms],
        )?;
        Ok(())
    }

    pub fn get_buffer(&self, vault_name: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT content FROM replica_buffers WHERE vault_name = ?1",
            params![vault_name],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    /// Drop the mirror rows for one vault scope (clear/reset propagate here).
    /// Session partitions go untouched when the core scope clears, and vice
    /// versa.
    pub fn remove_scope(&self, memory_key: &str, session_id: Option<&str>) -> AppResult<usize> {
        let conn = self.conn.lock();
        let n = match session_id {
            Some(session) => conn.execute(
                "DELETE FROM replica_chunks WHERE memory_key = ?1 AND session_id = ?2",
                params![memory_key, session],
            )?,
            None => conn.execute(
                "DELETE FROM replica_chunks WHERE memory_key = ?1 AND session_id IS NULL",
                params![memory_key],
            )?,
        };
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(dims: usize, axis: usize) -> Vec<f32> {
        let mut v = vec![0.0; dims];
        v[axis] = 1.0;
        v
    }

    #[test]
    fn append_and_search_by_similarity() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        replica
            .append("tenant", None, "about cats", "chunk", "h1", &unit(4, 0), 1000.0)
            .unwrap();
        replica
            .append("tenant", None, "about dogs", "chunk", "h2", &unit(4, 1), 2000.0)
            .unwrap();

        let hits = replica.search("tenant", &unit(4, 0), 5, None, None).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].content, "about cats");
        assert!(hits[0].score > 0.999);
        assert!(hits[1].score < 0.001);
    }

    #[test]
    fn keys_are_isolated() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        replica
            .append("a", None, "alpha", "chunk", "h1", &unit(2, 0), 1.0)
            .unwrap();
        replica
            .append("b", None, "beta", "chunk", "h1", &unit(2, 0), 1.0)
            .unwrap();

        assert_eq!(replica.count("a").unwrap(), 1);
        let hits = replica.search("b", &unit(2, 0), 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "beta");
    }

    #[test]
    fn dedup_on_content_hash() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        assert!(replica
            .append("t", None, "same", "chunk", "hash", &unit(2, 0), 1.0)
            .unwrap());
        assert!(!replica
            .append("t", None, "same", "chunk", "hash", &unit(2, 1), 2.0)
            .unwrap());
        assert_eq!(replica.count("t").unwrap(), 1);
    }

    #[test]
    fn retention_keeps_newest() {
        let replica = ReplicaIndex::open_in_memory(3).unwrap();
        for i in 0..10 {
            replica
                .append(
                    "t",
                    None,
                    &format!("chunk {}", i),
                    "chunk",
                    &format!("h{}", i),
                    &unit(2, 0),
                    i as f64,
                )
                .unwrap();
        }
        assert_eq!(replica.count("t").unwrap(), 3);
        let hits = replica.search("t", &unit(2, 0), 10, None, None).unwrap();
        let mut contents: Vec<&str> = hits.iter().map(|h| h.content.as_str()).collect();
        contents.sort();
        assert_eq!(contents, vec!["chunk 7", "chunk 8", "chunk 9"]);
    }

    #[test]
    fn window_bounds_filter() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        for i in 0..5 {
            replica
                .append("t", None, &format!("c{}", i), "chunk", &format!("h{}", i), &unit(2, 0), i as f64 * 100.0)
                .unwrap();
        }
        let hits = replica
            .search("t", &unit(2, 0), 10, Some(150.0), Some(350.0))
            .unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn remove_scope_spares_other_partitions() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        replica
            .append("t", None, "core chunk", "chunk", "h1", &unit(2, 0), 1.0)
            .unwrap();
        replica
            .append("t", Some("s1"), "session chunk", "chunk", "h2", &unit(2, 0), 2.0)
            .unwrap();

        assert_eq!(replica.remove_scope("t", None).unwrap(), 1);
        assert_eq!(replica.count("t").unwrap(), 1);
        let hits = replica.search("t", &unit(2, 0), 10, None, None).unwrap();
        assert_eq!(hits[0].content, "session chunk");
    }

    #[test]
    fn buffer_mirror_round_trip() {
        let replica = ReplicaIndex::open_in_memory(10).unwrap();
        assert!(replica.get_buffer("t:core").unwrap().is_none());

        replica.save_buffer("t:core", "[USER] partial", 4, 1000.0).unwrap();
        assert_eq!(replica.get_buffer("t:core").unwrap().unwrap(), "[USER] partial");

        // Empty content clears the mirror row.
        replica.save_buffer("t:core", "", 0, 2000.0).unwrap();
        assert!(replica.get_buffer("t:core").unwrap().is_none());
    }

    #[test]
    fn mismatched_dims_are_skipped() {
        let replica = ReplicaIndex::open_in_memory(100).unwrap();
        replica
            .append("t", None, "old model", "chunk", "h1", &unit(3, 0), 1.0)
            .unwrap();
        replica
            .append("t", None, "new model", "chunk", "h2", &unit(4, 0), 2.0)
            .unwrap();
        let hits = replica.search("t", &unit(4, 0), 10, None, None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "new model");
    }
}
