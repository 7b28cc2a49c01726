use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use progress_core::model::{
    CacheKind, CacheRefreshMarker, CachedRecord, Course, CourseId, CoursePrice, CourseRun,
    CourseRunId, ExamAuthorization, ExamRun, ExamRunId, FinalGrade, FinancialAid, GradingStatus,
    Payment, PlatformUser, Program, ProgramId, TierProgram, TierProgramId, UserId,
};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub use crate::memory::InMemoryRepository;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// One entry of a replace-by-kind write: the run and its payload, `None`
/// meaning the platform confirmed nothing exists for that run.
pub type CacheEntry = (CourseRunId, Option<Value>);

//
// ─── CATALOG ───────────────────────────────────────────────────────────────────
//

/// Programs, courses, runs and their pricing. Seeded locally, read by the engine.
#[async_trait]
pub trait CatalogRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the program cannot be stored.
    async fn upsert_program(&self, program: &Program) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_program(&self, id: ProgramId) -> Result<Program, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the course cannot be stored.
    async fn upsert_course(&self, course: &Course) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_course(&self, id: CourseId) -> Result<Course, StorageError>;

    /// Courses of a program ordered by their position.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn courses_for_program(&self, program: ProgramId) -> Result<Vec<Course>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the run cannot be stored.
    async fn upsert_course_run(&self, run: &CourseRun) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_course_run(&self, id: CourseRunId) -> Result<CourseRun, StorageError>;

    /// Every run of every course in the program, discontinued ones included.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn runs_for_program(&self, program: ProgramId) -> Result<Vec<CourseRun>, StorageError>;

    /// Runs the remote cache mirrors: not discontinued, with a platform key,
    /// in a live program.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn candidate_runs(&self) -> Result<Vec<CourseRun>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the price cannot be stored.
    async fn upsert_course_price(&self, price: &CoursePrice) -> Result<(), StorageError>;

    /// Prices attached to any run of the program.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn prices_for_program(&self, program: ProgramId)
    -> Result<Vec<CoursePrice>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the tier cannot be stored.
    async fn upsert_tier_program(&self, tier: &TierProgram) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_tier_program(&self, id: TierProgramId) -> Result<TierProgram, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn tiers_for_program(&self, program: ProgramId)
    -> Result<Vec<TierProgram>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the exam run cannot be stored.
    async fn upsert_exam_run(&self, exam_run: &ExamRun) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_exam_run(&self, id: ExamRunId) -> Result<ExamRun, StorageError>;
}

//
// ─── USERS ─────────────────────────────────────────────────────────────────────
//

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the user cannot be stored.
    async fn upsert_user(&self, user: &PlatformUser) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_user(&self, id: UserId) -> Result<PlatformUser, StorageError>;

    /// All known user ids in ascending order.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn list_user_ids(&self) -> Result<Vec<UserId>, StorageError>;
}

//
// ─── REMOTE DATA CACHE ─────────────────────────────────────────────────────────
//

/// Snapshot storage for the remote data cache.
///
/// Only the cache service writes here.
#[async_trait]
pub trait CacheRepository: Send + Sync {
    /// Records of one kind for a user, skipping discontinued runs and runs of
    /// programs that are not live.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn records(
        &self,
        user: UserId,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, StorageError>;

    /// Upsert one record per entry and move the marker for `kind` to
    /// `refreshed_at`, all or nothing.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot be committed; nothing
    /// is written in that case.
    async fn replace_kind(
        &self,
        user: UserId,
        kind: CacheKind,
        entries: &[CacheEntry],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// The refresh marker, empty when the user was never refreshed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn marker(&self, user: UserId) -> Result<CacheRefreshMarker, StorageError>;

    /// Users whose cached enrollment in the run is present and active.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn users_enrolled_in_run(&self, run: CourseRunId) -> Result<Vec<UserId>, StorageError>;

    /// Increment the consecutive refresh failure count and return the new value.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn record_refresh_failure(
        &self,
        user: UserId,
        at: DateTime<Utc>,
    ) -> Result<u32, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn reset_refresh_failures(&self, user: UserId) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn refresh_failures(&self, user: UserId) -> Result<u32, StorageError>;
}

//
// ─── FINAL GRADES ──────────────────────────────────────────────────────────────
//

#[async_trait]
pub trait FinalGradeRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn get_final_grade(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<FinalGrade>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn final_grades_for_user(&self, user: UserId) -> Result<Vec<FinalGrade>, StorageError>;

    /// Persist a complete grade unless one is already complete, then return
    /// what is stored. A complete row is never rewritten.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the transaction cannot be committed.
    async fn save_complete(&self, grade: &FinalGrade) -> Result<FinalGrade, StorageError>;

    /// Users holding a complete grade for the run.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn users_with_complete_grade(
        &self,
        run: CourseRunId,
    ) -> Result<Vec<UserId>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn grading_status(&self, run: CourseRunId)
    -> Result<Option<GradingStatus>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn set_grading_status(
        &self,
        run: CourseRunId,
        status: GradingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError>;
}

//
// ─── LEDGER ────────────────────────────────────────────────────────────────────
//

/// Payments, financial aid and exam authorizations written by collaborators.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// # Errors
    ///
    /// Returns `StorageError` if the payment cannot be stored.
    async fn upsert_payment(&self, payment: &Payment) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn payments_for_user(&self, user: UserId) -> Result<Vec<Payment>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the application cannot be stored.
    async fn upsert_financial_aid(&self, aid: &FinancialAid) -> Result<(), StorageError>;

    /// Applications of the user against any tier of the program, newest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn financial_aid_for_program(
        &self,
        user: UserId,
        program: ProgramId,
    ) -> Result<Vec<FinancialAid>, StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` if the authorization cannot be stored.
    async fn upsert_exam_authorization(
        &self,
        authorization: &ExamAuthorization,
    ) -> Result<(), StorageError>;

    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn exam_authorizations(
        &self,
        user: UserId,
        course: CourseId,
    ) -> Result<Vec<ExamAuthorization>, StorageError>;
}

//
// ─── JOB LOCKS ─────────────────────────────────────────────────────────────────
//

/// Named locks shared by every process using the same database.
#[async_trait]
pub trait JobLockRepository: Send + Sync {
    /// Take the lock for `holder` until `now + ttl`. An expired lock held by
    /// someone else is taken over.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError>;

    /// Release the lock if `holder` still owns it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failures.
    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StorageError>;
}

/// Aggregates repositories behind trait objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub catalog: Arc<dyn CatalogRepository>,
    pub users: Arc<dyn UserRepository>,
    pub cache: Arc<dyn CacheRepository>,
    pub final_grades: Arc<dyn FinalGradeRepository>,
    pub ledger: Arc<dyn LedgerRepository>,
    pub locks: Arc<dyn JobLockRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        Self::from_repository(InMemoryRepository::new())
    }

    /// Wire every repository to clones of one backend.
    #[must_use]
    pub fn from_repository<R>(repo: R) -> Self
    where
        R: CatalogRepository
            + UserRepository
            + CacheRepository
            + FinalGradeRepository
            + LedgerRepository
            + JobLockRepository
            + Clone
            + 'static,
    {
        Self {
            catalog: Arc::new(repo.clone()),
            users: Arc::new(repo.clone()),
            cache: Arc::new(repo.clone()),
            final_grades: Arc::new(repo.clone()),
            ledger: Arc::new(repo.clone()),
            locks: Arc::new(repo),
        }
    }
}
