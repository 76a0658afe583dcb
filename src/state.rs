use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::embedder::{Embedder, HttpEmbedder};
use crate::error::AppResult;
use crate::kronos::TemporalWindows;
use crate::replica::ReplicaIndex;
use crate::retrieval::RetrievalCoordinator;
use crate::vaults::VaultManager;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub vaults: Arc<VaultManager>,
    pub replica: Arc<ReplicaIndex>,
    pub coordinator: Arc<RetrievalCoordinator>,
}

impl AppState {
    pub async fn new(config: AppConfig) -> AppResult<Self> {
        let data_dir = std::path::PathBuf::from(&config.data_dir);
        tokio::fs::create_dir_all(&data_dir)
            .await
            .map_err(crate::error::AppError::Io)?;

        let vaults = Arc::new(VaultManager::new(
            data_dir.clone(),
            config.default_embedding_dims,
        ));
        let replica = Arc::new(ReplicaIndex::open(
            data_dir.join("replica.db"),
            config.replica_max_chunks,
        )?);
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
            config.embed_url.clone(),
            config.embed_model.clone(),
            config.embed_api_key.clone(),
        ));
        let coordinator = Arc::new(RetrievalCoordinator::new(
            vaults.clone(),
            replica.clone(),
            embedder,
            TemporalWindows::from_config(&config),
            Duration::from_millis(config.race_timeout_ms),
            config.replica_max_chunks,
        ));

        Ok(Self {
            config,
            vaults,
            replica,
            coordinator,
        })
    }
}
