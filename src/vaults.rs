//! Vault registry and execution model.
//!
//! Vaults are addressed by hierarchical name (`<key>:core`,
//! `<key>:s:<session>`, `<key>:e:<conversation>`) which maps
//! deterministically to one cell in the registry and one SQLite file on
//! disk. Each cell is a `tokio::sync::Mutex<Vault>`: the mutex is the
//! vault's single execution slot, so stores, searches, chunking and schema
//! work never interleave within one vault. Work runs on the blocking pool —
//! a cold hydration can take seconds and must not stall the reactor.
//!
//! Hibernation is eviction: a sweeper drops cells that have sat idle past
//! the configured TTL. Only the SQLite file survives; the next call
//! re-opens and re-hydrates transparently.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AppError, AppResult};
use crate::vault::{content_hash, now_ms, Vault};

/// Scope component of a vault name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Core,
    Session(String),
    Conversation(String),
}

/// A fully-qualified vault address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultName {
    pub memory_key: String,
    pub scope: Scope,
}

impl VaultName {
    pub fn new(memory_key: &str, session_id: Option<&str>, conversation_id: Option<&str>) -> AppResult<Self> {
        if memory_key.trim().is_empty() {
            return Err(AppError::BadRequest("memory key must not be empty".to_string()));
        }
        let scope = match (session_id, conversation_id) {
            (Some(_), Some(_)) => {
                return Err(AppError::BadRequest(
                    "session and conversation scopes are mutually exclusive".to_string(),
                ));
            }
            (Some(s), None) => Scope::Session(s.to_string()),
            (None, Some(c)) => Scope::Conversation(c.to_string()),
            (None, None) => Scope::Core,
        };
        Ok(Self {
            memory_key: memory_key.to_string(),
            scope,
        })
    }

    pub fn core(memory_key: &str) -> AppResult<Self> {
        Self::new(memory_key, None, None)
    }

    pub fn as_str(&self) -> String {
        match &self.scope {
            Scope::Core => format!("{}:core", self.memory_key),
            Scope::Session(s) => format!("{}:s:{}", self.memory_key, s),
            Scope::Conversation(c) => format!("{}:e:{}", self.memory_key, c),
        }
    }

    /// Filesystem-safe database file name: a sanitized prefix for
    /// debuggability plus the name's content hash for uniqueness.
    pub fn file_name(&self) -> String {
        let full = self.as_str();
        let safe: String = full
            .chars()
            .take(48)
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}-{}.db", safe, content_hash(&full))
    }
}

impl std::fmt::Display for VaultName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.as_str())
    }
}

pub struct VaultManager {
    cells: DashMap<String, Arc<Mutex<Vault>>>,
    dir: PathBuf,
    default_dims: usize,
}

impl VaultManager {
    pub fn new(data_dir: PathBuf, default_dims: usize) -> Self {
        Self {
            cells: DashMap::new(),
            dir: data_dir.join("vaults"),
            default_dims,
        }
    }

    fn cell(&self, name: &VaultName) -> Arc<Mutex<Vault>> {
        let key = name.as_str();
        if let Some(cell) = self.cells.get(&key) {
            return cell.value().clone();
        }
        let vault = Vault::cold(key.clone(), self.dir.join(name.file_name()), self.default_dims);
        let cell = Arc::new(Mutex::new(vault));
        // Another caller may have raced the insert; keep whichever landed.
        self.cells.entry(key).or_insert(cell).value().clone()
    }

    /// Run one operation on the vault's execution slot.
    ///
    /// The closure runs on the blocking pool with the cell locked, after a
    /// transparent wake (schema + hydration). If the caller's future is
    /// dropped mid-race the blocking task finishes as an orphan and its
    /// result is discarded, which is acceptable by design.
    pub async fn with_vault<R>(
        &self,
        name: &VaultName,
        f: impl FnOnce(&mut Vault) -> AppResult<R> + Send + 'static,
    ) -> AppResult<R>
    where
        R: Send + 'static,
    {
        let cell = self.cell(name);
        tokio::task::spawn_blocking(move || {
            let mut vault = cell.blocking_lock();
            vault.wake(now_ms())?;
            f(&mut vault)
        })
        .await
        .map_err(|e| AppError::VaultError(format!("vault task failed: {}", e)))?
    }

    /// Drop in-memory state for vaults idle past `ttl`. Cells currently in
    /// use (locked) are skipped and picked up on a later sweep.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0usize;
        self.cells.retain(|name, cell| {
            match cell.try_lock() {
                Ok(vault) => {
                    if vault.idle_for() >= ttl {
                        debug!(vault = %name, idle_secs = vault.idle_for().as_secs(), "hibernating vault");
                        evicted += 1;
                        false
                    } else {
                        true
                    }
                }
                Err(_) => true,
            }
        });
        if evicted > 0 {
            info!(evicted, resident = self.cells.len(), "hibernation sweep complete");
        }
        evicted
    }

    pub fn resident_count(&self) -> usize {
        self.cells.len()
    }
}
