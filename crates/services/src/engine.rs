use std::sync::Arc;

use progress_core::model::{CourseId, CourseRunId, FinalGrade, ProgramId, UserId};
use storage::repository::Storage;

use crate::Clock;
use crate::batch::{BatchOutcome, BatchRefreshJob};
use crate::cache::RemoteDataCache;
use crate::config::EngineConfig;
use crate::dashboard::{ProgramProgress, get_program_progress};
use crate::error::{BatchError, EngineError, FreezeError, LedgerError, ProgressError};
use crate::events::EventBus;
use crate::facade::{ProgressReader, Viewer};
use crate::freezer::{GradeFreezer, RunFreezeReport};
use crate::ledger::ExamAttemptLedger;
use crate::remote::{HttpRemoteClient, RemoteClient};

/// Wires storage, the remote client and every service together.
#[derive(Clone)]
pub struct ProgressEngine {
    storage: Storage,
    events: EventBus,
    cache: RemoteDataCache,
    reader: ProgressReader,
    freezer: GradeFreezer,
    ledger: ExamAttemptLedger,
    batch: BatchRefreshJob,
}

impl ProgressEngine {
    #[must_use]
    pub fn new(
        storage: Storage,
        client: Arc<dyn RemoteClient>,
        config: &EngineConfig,
        clock: Clock,
    ) -> Self {
        let events = EventBus::default();
        let cache = RemoteDataCache::new(
            clock,
            config.staleness,
            client,
            Arc::clone(&storage.catalog),
            Arc::clone(&storage.cache),
        )
        .with_remote_timeout(config.remote_timeout)
        .with_events(events.clone());

        let reader = ProgressReader::new(
            cache.clone(),
            Arc::clone(&storage.catalog),
            Arc::clone(&storage.final_grades),
            Arc::clone(&storage.ledger),
        );
        let freezer = GradeFreezer::new(
            cache.clone(),
            Arc::clone(&storage.catalog),
            Arc::clone(&storage.users),
            Arc::clone(&storage.final_grades),
        );
        let ledger = ExamAttemptLedger::new(
            clock,
            Arc::clone(&storage.catalog),
            Arc::clone(&storage.ledger),
            Arc::clone(&storage.final_grades),
        );
        let batch = BatchRefreshJob::new(
            config.batch,
            cache.clone(),
            Arc::clone(&storage.users),
            Arc::clone(&storage.cache),
            Arc::clone(&storage.locks),
        );

        Self {
            storage,
            events,
            cache,
            reader,
            freezer,
            ledger,
            batch,
        }
    }

    /// Build an engine backed by `SQLite` and the platform's HTTP API.
    ///
    /// # Errors
    ///
    /// Returns `EngineError` if storage or the HTTP client cannot be set up.
    pub async fn new_sqlite(
        db_url: &str,
        config: &EngineConfig,
        clock: Clock,
    ) -> Result<Self, EngineError> {
        let storage = Storage::sqlite(db_url).await?;
        let client = HttpRemoteClient::new(config.remote_base_url.clone(), config.remote_timeout)?;
        Ok(Self::new(storage, Arc::new(client), config, clock))
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    #[must_use]
    pub fn cache(&self) -> &RemoteDataCache {
        &self.cache
    }

    #[must_use]
    pub fn reader(&self) -> &ProgressReader {
        &self.reader
    }

    #[must_use]
    pub fn freezer(&self) -> &GradeFreezer {
        &self.freezer
    }

    #[must_use]
    pub fn ledger(&self) -> &ExamAttemptLedger {
        &self.ledger
    }

    /// # Errors
    ///
    /// Returns `ProgressError` if the learner is unknown or the snapshot
    /// cannot be built.
    pub async fn get_program_progress(
        &self,
        user: UserId,
        program: ProgramId,
        viewer: Viewer,
    ) -> Result<ProgramProgress, ProgressError> {
        let user = self.storage.users.get_user(user).await?;
        get_program_progress(&self.reader, &user, program, viewer).await
    }

    /// # Errors
    ///
    /// Returns `FreezeError` if the learner is unknown or freezing fails.
    pub async fn freeze_run(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<FinalGrade, FreezeError> {
        let user = self.storage.users.get_user(user).await?;
        self.freezer.freeze(&user, run).await
    }

    /// # Errors
    ///
    /// See [`GradeFreezer::freeze_course_run`].
    pub async fn freeze_course_run(
        &self,
        run: CourseRunId,
    ) -> Result<RunFreezeReport, FreezeError> {
        self.freezer.freeze_course_run(run).await
    }

    /// # Errors
    ///
    /// See [`ExamAttemptLedger::remaining_attempts`].
    pub async fn remaining_exam_attempts(
        &self,
        user: UserId,
        course: CourseId,
    ) -> Result<i64, LedgerError> {
        self.ledger.remaining_attempts(user, course).await
    }

    /// # Errors
    ///
    /// See [`BatchRefreshJob::run`].
    pub async fn refresh_batch(&self) -> Result<BatchOutcome, BatchError> {
        self.batch.run().await
    }
}
