//! Scheduler (§5, §9 Design notes): a per-repository periodic sync
//! timer/task pair. Cancellation drops the timer and signals the task's
//! context; in-flight I/O observes the signal at the next suspension point.
//!
//! Grounded on the teacher's cooperative-task idiom generalized to repeated
//! scheduled work (the teacher itself runs one-shot tasks per request; here
//! each repository with a non-zero `sync_interval` gets its own
//! `tokio::time::interval` loop).

use crate::config::ChunkingConfig;
use crate::document::Repository;
use crate::embedding::EmbeddingProvider;
use crate::git_sync::GitSync;
use crate::vector_index::VectorIndex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct ScheduledTask {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

/// Holds one timer/task pair per repository with a non-zero `sync_interval`.
/// `sync_interval == 0` means "disabled" (Open Question 1) — such
/// repositories are simply never scheduled; `sync_repository` remains
/// callable on demand regardless.
///
/// Each scheduled tick runs the same sync-then-reindex pipeline as the
/// on-demand paths (CLI, REST, the `sync_repository` tool) rather than just
/// refreshing the git clone, so a repository configured with a
/// `sync_interval` stays searchable without an operator ever calling sync
/// by hand.
pub struct Scheduler {
    git_sync: Arc<GitSync>,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    chunking: ChunkingConfig,
    tasks: RwLock<HashMap<String, ScheduledTask>>,
}

impl Scheduler {
    pub fn new(
        git_sync: Arc<GitSync>,
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        chunking: ChunkingConfig,
    ) -> Self {
        Scheduler { git_sync, embedder, index, chunking, tasks: RwLock::new(HashMap::new()) }
    }

    /// Starts or replaces the periodic task for `repo`. A `sync_interval` of
    /// 0 stops any existing task and schedules nothing.
    pub async fn schedule(&self, repo: Repository) {
        self.stop(&repo.name).await;

        if repo.sync_interval == 0 {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let git_sync = self.git_sync.clone();
        let embedder = self.embedder.clone();
        let index = self.index.clone();
        let chunking = self.chunking;
        let period = std::time::Duration::from_secs(repo.sync_interval * 60);
        let name = repo.name.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        info!(repository = %name, "scheduled sync starting");
                        let outcome = crate::ingest::ingest_repository(
                            &repo,
                            git_sync.as_ref(),
                            index.as_ref(),
                            embedder.as_ref(),
                            &chunking,
                        ).await;
                        if let Err(e) = outcome {
                            warn!(repository = %name, error = %e, "scheduled sync failed");
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        self.tasks
            .write()
            .await
            .insert(repo.name.clone(), ScheduledTask { handle, stop: stop_tx });
    }

    /// Stops the repository's task, if one is running. Idempotent.
    pub async fn stop(&self, repository: &str) {
        if let Some(task) = self.tasks.write().await.remove(repository) {
            let _ = task.stop.send(true);
            task.handle.abort();
        }
    }

    pub async fn stop_all(&self) {
        let mut tasks = self.tasks.write().await;
        for (_, task) in tasks.drain() {
            let _ = task.stop.send(true);
            task.handle.abort();
        }
    }

    pub async fn is_scheduled(&self, repository: &str) -> bool {
        self.tasks.read().await.contains_key(repository)
    }
}
