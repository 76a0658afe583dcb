//! Per-vault SQLite persistence.
//!
//! The authoritative record for one vault: `vectors` and `items` share ids 1:1,
//! `meta` holds the serialized vault state, and `pending_buffer` is a singleton
//! row carrying the chunk buffer across hibernation. Embeddings are stored as
//! little-endian `f32` blobs. The schema is applied idempotently on open and
//! every multi-table write happens inside one transaction.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

/// Serialized under `meta` key `vault_state`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultState {
    pub vector_count: usize,
    pub dims: usize,
    pub last_access: f64,
    pub created_at: f64,
}

/// One `items` row as read back for search results and export.
#[derive(Debug, Clone)]
pub struct ItemRow {
    pub id: i64,
    pub content: String,
    pub role: String,
    pub content_hash: String,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub timestamp: f64,
    pub token_count: i64,
}

/// A full row pair for export and replica mirroring.
#[derive(Debug, Clone)]
pub struct ExportRow {
    pub item: ItemRow,
    pub embedding: Vec<f32>,
}

/// Pending chunk buffer snapshot.
#[derive(Debug, Clone)]
pub struct BufferRow {
    pub content: String,
    pub token_count: i64,
    pub last_updated: f64,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS vectors (
    id        INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,
    timestamp REAL NOT NULL,
    dims      INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_vectors_timestamp ON vectors(timestamp);

CREATE TABLE IF NOT EXISTS items (
    id           INTEGER PRIMARY KEY,
    content      TEXT NOT NULL,
    role         TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    model        TEXT,
    request_id   TEXT,
    timestamp    REAL NOT NULL,
    token_count  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_items_timestamp ON items(timestamp);
CREATE UNIQUE INDEX IF NOT EXISTS idx_items_content_hash ON items(content_hash);

CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_buffer (
    id           INTEGER PRIMARY KEY CHECK (id = 1),
    content      TEXT NOT NULL,
    token_count  INTEGER NOT NULL,
    last_updated REAL NOT NULL
);
";

pub struct VaultStore {
    conn: Connection,
}

impl VaultStore {
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> AppResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    // ------------------------------------------------------------------
    // Vault state
    // ------------------------------------------------------------------

    pub fn load_state(&self) -> AppResult<Option<VaultState>> {
        let raw: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'vault_state'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn save_state(&self, state: &VaultState) -> AppResult<()> {
        let json = serde_json::to_string(state)?;
        self.conn.execute(
            "INSERT INTO meta(key, value) VALUES('vault_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Vector + item writes
    // ------------------------------------------------------------------

    pub fn max_id(&self) -> AppResult<i64> {
        let max: Option<i64> = self
            .conn
            .query_row("SELECT MAX(id) FROM vectors", [], |row| row.get(0))?;
        Ok(max.unwrap_or(0))
    }

    pub fn find_by_hash(&self, content_hash: &str) -> AppResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id FROM items WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Write one vector/item pair and the refreshed state in a single
    /// transaction. On any failure nothing is visible.
    pub fn insert(
        &mut self,
        item: &ItemRow,
        embedding: &[f32],
        dims: usize,
        state: &VaultState,
    ) -> AppResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO vectors(id, embedding, timestamp, dims) VALUES(?1, ?2, ?3, ?4)",
            params![item.id, vec_to_blob(embedding), item.timestamp, dims as i64],
        )?;
        tx.execute(
            "INSERT INTO items(id, content, role, content_hash, model, request_id, timestamp, token_count)
             VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                item.id,
                item.content,
                item.role,
                item.content_hash,
                item.model,
                item.request_id,
                item.timestamp,
                item.token_count
            ],
        )?;
        let json = serde_json::to_string(state)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES('vault_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// All vectors ordered newest-first, for hydration.
    pub fn load_all_vectors_desc(&self) -> AppResult<Vec<(i64, Vec<f32>, f64)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, embedding, timestamp FROM vectors ORDER BY timestamp DESC")?;
        let rows = stmt.query_map([], |row| {
            let id: i64 = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            let ts: f64 = row.get(2)?;
            Ok((id, blob, ts))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, blob, ts) = row?;
            out.push((id, blob_to_vec(&blob)?, ts));
        }
        Ok(out)
    }

    pub fn get_items(&self, ids: &[i64]) -> AppResult<Vec<ItemRow>> {
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = self.conn.prepare(
            "SELECT id, content, role, content_hash, model, request_id, timestamp, token_count
             FROM items WHERE id = ?1",
        )?;
        for &id in ids {
            let item = stmt
                .query_row(params![id], |row| {
                    Ok(ItemRow {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        role: row.get(2)?,
                        content_hash: row.get(3)?,
                        model: row.get(4)?,
                        request_id: row.get(5)?,
                        timestamp: row.get(6)?,
                        token_count: row.get(7)?,
                    })
                })
                .optional()?;
            if let Some(item) = item {
                out.push(item);
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> AppResult<usize> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM vectors", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    pub fn timestamp_range(&self) -> AppResult<(Option<f64>, Option<f64>)> {
        self.conn
            .query_row(
                "SELECT MIN(timestamp), MAX(timestamp) FROM items",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(AppError::from)
    }

    pub fn export_rows(&self) -> AppResult<Vec<ExportRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.content, i.role, i.content_hash, i.model, i.request_id,
                    i.timestamp, i.token_count, v.embedding
             FROM items i JOIN vectors v ON v.id = i.id
             ORDER BY i.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let blob: Vec<u8> = row.get(8)?;
            Ok((
                ItemRow {
                    id: row.get(0)?,
                    content: row.get(1)?,
                    role: row.get(2)?,
                    content_hash: row.get(3)?,
                    model: row.get(4)?,
                    request_id: row.get(5)?,
                    timestamp: row.get(6)?,
                    token_count: row.get(7)?,
                },
                blob,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (item, blob) = row?;
            out.push(ExportRow {
                item,
                embedding: blob_to_vec(&blob)?,
            });
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    pub fn delete_ids(&mut self, ids: &[i64], state: &VaultState) -> AppResult<usize> {
        let tx = self.conn.transaction()?;
        let mut deleted = 0usize;
        for &id in ids {
            deleted += tx.execute("DELETE FROM vectors WHERE id = ?1", params![id])?;
            tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
        }
        let json = serde_json::to_string(state)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES('vault_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Byte accounting over rows strictly older than `cutoff`:
    /// embedding blob bytes plus content bytes.
    pub fn bytes_older_than(&self, cutoff: f64) -> AppResult<(usize, i64)> {
        self.conn
            .query_row(
                "SELECT COUNT(*),
                        COALESCE((SELECT SUM(LENGTH(embedding)) FROM vectors WHERE timestamp < ?1), 0)
                      + COALESCE((SELECT SUM(LENGTH(content)) FROM items WHERE timestamp < ?1), 0)
                 FROM vectors WHERE timestamp < ?1",
                params![cutoff],
                |row| {
                    let n: i64 = row.get(0)?;
                    let bytes: i64 = row.get(1)?;
                    Ok((n as usize, bytes))
                },
            )
            .map_err(AppError::from)
    }

    pub fn delete_older_than(&mut self, cutoff: f64, state: &VaultState) -> AppResult<usize> {
        let tx = self.conn.transaction()?;
        let deleted = tx.execute("DELETE FROM vectors WHERE timestamp < ?1", params![cutoff])?;
        tx.execute("DELETE FROM items WHERE timestamp < ?1", params![cutoff])?;
        let json = serde_json::to_string(state)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES('vault_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Wipe vector/item/buffer data. `meta` is rewritten by the caller with
    /// whatever state survives the wipe (dims survive `clear`, not `reset`).
    pub fn wipe(&mut self, state: &VaultState) -> AppResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM vectors", [])?;
        tx.execute("DELETE FROM items", [])?;
        tx.execute("DELETE FROM pending_buffer", [])?;
        let json = serde_json::to_string(state)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES('vault_state', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![json],
        )?;
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending buffer singleton
    // ------------------------------------------------------------------

    pub fn load_buffer(&self) -> AppResult<Option<BufferRow>> {
        Ok(self
            .conn
            .query_row(
                "SELECT content, token_count, last_updated FROM pending_buffer WHERE id = 1",
                [],
                |row| {
                    Ok(BufferRow {
                        content: row.get(0)?,
                        token_count: row.get(1)?,
                        last_updated: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn save_buffer(&self, content: &str, token_count: i64, now_ms: f64) -> AppResult<()> {
        if content.is_empty() {
            self.conn.execute("DELETE FROM pending_buffer WHERE id = 1", [])?;
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO pending_buffer(id, content, token_count, last_updated)
             VALUES(1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                 content = excluded.content,
                 token_count = excluded.token_count,
                 last_updated = excluded.last_updated",
            params![content, token_count, now_ms],
        )?;
        Ok(())
    }

    pub fn clear_buffer(&self) -> AppResult<()> {
        self.conn.execute("DELETE FROM pending_buffer WHERE id = 1", [])?;
        Ok(())
    }
}

pub fn vec_to_blob(v: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(v.len() * 4);
    for x in v {
        out.extend_from_slice(&x.to_le_bytes());
    }
    out
}

pub fn blob_to_vec(blob: &[u8]) -> AppResult<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(AppError::VaultError(format!(
            "embedding blob of {} bytes is not f32-aligned",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect())
}
