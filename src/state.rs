//! Shared process state: the one bundle of `Arc`s both the JSON-RPC stdio
//! server and the REST server hold, so either surface can be started from
//! the same wiring in `main.rs`.

use crate::config::Config;
use crate::context_generator::ContextGenerator;
use crate::embedding::EmbeddingProvider;
use crate::git_sync::GitSync;
use crate::plugin::PluginRegistry;
use crate::scheduler::Scheduler;
use crate::vector_index::VectorIndex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct AppState {
    pub config: RwLock<Config>,
    pub config_path: PathBuf,
    pub git_sync: Arc<GitSync>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub index: Arc<dyn VectorIndex>,
    pub context_generator: Arc<ContextGenerator>,
    pub plugins: Arc<PluginRegistry>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Looks up a configured repository by name, or the sole configured
    /// repository when exactly one exists and none was named.
    pub async fn resolve_repository(&self, name: Option<&str>) -> Result<crate::document::Repository, crate::error::ServiceError> {
        let config = self.config.read().await;
        match name {
            Some(n) => config
                .find_repository(n)
                .cloned()
                .ok_or_else(|| crate::error::ServiceError::NotFound(format!("repository '{n}' is not configured"))),
            None => match config.repositories.as_slice() {
                [single] => Ok(single.clone()),
                [] => Err(crate::error::ServiceError::Validation("no repositories configured".to_string())),
                _ => Err(crate::error::ServiceError::Validation(
                    "multiple repositories configured; a 'repository' argument is required".to_string(),
                )),
            },
        }
    }
}
