use serde::{Deserialize, Serialize};

/// Maximum accepted length for free-text retrieval queries (characters).
pub const MAX_QUERY_LENGTH: usize = 4000;

/// Upper bound on `k` for any single search request.
pub const MAX_RESULTS_PER_SEARCH: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub listen_addr: String,
    pub data_dir: String,
    /// Default dimensionality adopted by a fresh vault before its first store.
    pub default_embedding_dims: usize,
    /// HOT window span in hours.
    pub hot_window_hours: f64,
    /// WORKING window span in days (measured back from now).
    pub working_window_days: f64,
    /// LONG_TERM window span in days; anything older is EXPIRED.
    pub longterm_window_days: f64,
    /// Budget for the authoritative side of the hot/cold race, in milliseconds.
    pub race_timeout_ms: u64,
    /// Newest-chunk retention per memory key in the replica index.
    pub replica_max_chunks: usize,
    /// Seconds of inactivity before a vault's in-memory state is dropped.
    pub hibernate_secs: u64,
    pub embed_url: String,
    pub embed_model: String,
    pub embed_api_key: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("MEMVAULT_PORT").unwrap_or_else(|_| "9821".to_string());

        let data_dir = std::env::var("MEMVAULT_DATA_DIR").unwrap_or_else(|_| {
            dirs::data_local_dir()
                .map(|d| d.join("memvault-backend").to_string_lossy().to_string())
                .unwrap_or_else(|| ".memvault-data".to_string())
        });

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            data_dir,
            default_embedding_dims: env_parse("DEFAULT_EMBEDDING_DIMS", 1024),
            hot_window_hours: env_parse("HOT_WINDOW_HOURS", 4.0),
            working_window_days: env_parse("WORKING_WINDOW_DAYS", 3.0),
            longterm_window_days: env_parse("LONGTERM_WINDOW_DAYS", 90.0),
            race_timeout_ms: env_parse("MEMVAULT_RACE_TIMEOUT_MS", 2500),
            replica_max_chunks: env_parse("REPLICA_MAX_CHUNKS", 2000),
            hibernate_secs: env_parse("MEMVAULT_HIBERNATE_SECS", 300),
            embed_url: std::env::var("MEMVAULT_EMBED_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8080/v1/embeddings".to_string()),
            embed_model: std::env::var("MEMVAULT_EMBED_MODEL")
                .unwrap_or_else(|_| "qwen3-embedding-0.6b".to_string()),
            embed_api_key: std::env::var("MEMVAULT_EMBED_API_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
