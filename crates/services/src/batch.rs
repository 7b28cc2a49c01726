//! Periodic refresh of every learner's stale cache kinds.
//!
//! One process at a time: the job holds a named lock row in the shared
//! database while it selects users and spawns chunk tasks. The lock is
//! released before the chunks are awaited.

use std::sync::Arc;

use futures::future::join_all;
use progress_core::model::UserId;
use storage::repository::{CacheRepository, JobLockRepository, UserRepository};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::Clock;
use crate::cache::RemoteDataCache;
use crate::config::BatchConfig;
use crate::error::BatchError;

/// Name of the lock row guarding the refresh job.
pub const REFRESH_JOB_LOCK: &str = "batch_refresh_cache";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Users with at least one stale kind.
    pub selected: usize,
    pub refreshed: usize,
    pub failed: usize,
    /// Users skipped because they failed too many times in a row.
    pub skipped_failing: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Another process holds the lock; nothing was done.
    LockHeld,
    Completed(BatchReport),
}

#[derive(Clone)]
pub struct BatchRefreshJob {
    clock: Clock,
    config: BatchConfig,
    cache: RemoteDataCache,
    users: Arc<dyn UserRepository>,
    cache_repo: Arc<dyn CacheRepository>,
    locks: Arc<dyn JobLockRepository>,
}

impl BatchRefreshJob {
    #[must_use]
    pub fn new(
        config: BatchConfig,
        cache: RemoteDataCache,
        users: Arc<dyn UserRepository>,
        cache_repo: Arc<dyn CacheRepository>,
        locks: Arc<dyn JobLockRepository>,
    ) -> Self {
        Self {
            clock: cache.clock(),
            config,
            cache,
            users,
            cache_repo,
            locks,
        }
    }

    /// Run one pass over all users.
    ///
    /// # Errors
    ///
    /// Returns `BatchError` when the lock or the user selection cannot be read.
    /// Failures of single users are only counted.
    pub async fn run(&self) -> Result<BatchOutcome, BatchError> {
        let holder = Uuid::new_v4();
        let acquired = self
            .locks
            .try_acquire(REFRESH_JOB_LOCK, holder, self.clock.now(), self.config.lock_ttl)
            .await?;
        if !acquired {
            info!(lock = REFRESH_JOB_LOCK, "refresh job already running elsewhere");
            return Ok(BatchOutcome::LockHeld);
        }

        let dispatched = self.dispatch().await;

        if let Err(err) = self.locks.release(REFRESH_JOB_LOCK, holder).await {
            warn!(lock = REFRESH_JOB_LOCK, error = %err, "failed to release job lock");
        }
        let (mut report, chunks) = dispatched?;

        let (sizes, handles): (Vec<usize>, Vec<_>) = chunks.into_iter().unzip();
        for (size, joined) in sizes.into_iter().zip(join_all(handles).await) {
            match joined {
                Ok((refreshed, failed)) => {
                    report.refreshed += refreshed;
                    report.failed += failed;
                }
                Err(err) => {
                    warn!(error = %err, users = size, "refresh chunk task aborted");
                    report.failed += size;
                }
            }
        }

        info!(
            selected = report.selected,
            refreshed = report.refreshed,
            failed = report.failed,
            skipped_failing = report.skipped_failing,
            "refresh batch finished"
        );
        Ok(BatchOutcome::Completed(report))
    }

    /// Select stale users and spawn one task per chunk. Returns the partial
    /// report with each chunk's size and handle.
    async fn dispatch(&self) -> Result<(BatchReport, Vec<ChunkHandle>), BatchError> {
        let mut report = BatchReport::default();
        let mut selected = Vec::new();
        for user in self.users.list_user_ids().await? {
            if self.cache_repo.refresh_failures(user).await? >= self.config.max_refresh_failures {
                report.skipped_failing += 1;
                continue;
            }
            if !self.cache.stale_kinds(user).await?.is_empty() {
                selected.push(user);
            }
        }
        report.selected = selected.len();

        let chunk_size = self.config.chunk_size.max(1);
        let chunks = selected
            .chunks(chunk_size)
            .map(|chunk| {
                let worker = ChunkWorker {
                    clock: self.clock,
                    cache: self.cache.clone(),
                    users: Arc::clone(&self.users),
                    cache_repo: Arc::clone(&self.cache_repo),
                };
                let chunk = chunk.to_vec();
                let size = chunk.len();
                (size, tokio::spawn(async move { worker.refresh(chunk).await }))
            })
            .collect();
        Ok((report, chunks))
    }
}

type ChunkHandle = (usize, JoinHandle<(usize, usize)>);

struct ChunkWorker {
    clock: Clock,
    cache: RemoteDataCache,
    users: Arc<dyn UserRepository>,
    cache_repo: Arc<dyn CacheRepository>,
}

impl ChunkWorker {
    /// Returns `(refreshed, failed)`.
    async fn refresh(&self, chunk: Vec<UserId>) -> (usize, usize) {
        let (mut refreshed, mut failed) = (0, 0);
        for user_id in chunk {
            let outcome = match self.users.get_user(user_id).await {
                Ok(user) => self
                    .cache
                    .refresh_all_if_stale(&user)
                    .await
                    .map_err(|err| err.to_string()),
                Err(err) => Err(err.to_string()),
            };
            match outcome {
                Ok(_) => {
                    refreshed += 1;
                    if let Err(err) = self.cache_repo.reset_refresh_failures(user_id).await {
                        warn!(user_id = %user_id, error = %err, "failed to reset failure count");
                    }
                }
                Err(reason) => {
                    failed += 1;
                    match self
                        .cache_repo
                        .record_refresh_failure(user_id, self.clock.now())
                        .await
                    {
                        Ok(count) => {
                            warn!(user_id = %user_id, failures = count, error = %reason, "user refresh failed");
                        }
                        Err(err) => {
                            warn!(user_id = %user_id, error = %err, "failed to record refresh failure");
                        }
                    }
                }
            }
        }
        (refreshed, failed)
    }
}
