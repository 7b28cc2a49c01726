use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use progress_core::model::{
    CacheKind, CacheRefreshMarker, CachedRecord, Course, CourseId, CoursePrice, CourseRun,
    CourseRunId, ExamAuthorization, ExamRun, ExamRunId, FinalGrade, FinancialAid, GradingStatus,
    Payment, PaymentId, PlatformUser, Program, ProgramId, TierProgram, TierProgramId, UserId,
};
use uuid::Uuid;

use crate::repository::{
    CacheEntry, CacheRepository, CatalogRepository, FinalGradeRepository, JobLockRepository,
    LedgerRepository, StorageError, UserRepository,
};

#[derive(Default)]
struct State {
    programs: HashMap<ProgramId, Program>,
    courses: HashMap<CourseId, Course>,
    runs: HashMap<CourseRunId, CourseRun>,
    prices: HashMap<CourseRunId, CoursePrice>,
    tiers: HashMap<TierProgramId, TierProgram>,
    exam_runs: HashMap<ExamRunId, ExamRun>,
    users: HashMap<UserId, PlatformUser>,
    records: HashMap<(UserId, CourseRunId, CacheKind), CachedRecord>,
    markers: HashMap<UserId, CacheRefreshMarker>,
    failures: HashMap<UserId, u32>,
    final_grades: HashMap<(UserId, CourseRunId), FinalGrade>,
    grading: HashMap<CourseRunId, GradingStatus>,
    payments: HashMap<PaymentId, Payment>,
    financial_aid: HashMap<(UserId, TierProgramId), FinancialAid>,
    authorizations: HashMap<(UserId, ExamRunId), ExamAuthorization>,
    locks: HashMap<String, (Uuid, DateTime<Utc>)>,
}

impl State {
    fn program_of_run(&self, run: &CourseRun) -> Option<&Program> {
        self.courses
            .get(&run.course_id)
            .and_then(|course| self.programs.get(&course.program_id))
    }

    /// Soft filter shared by every cache read.
    fn is_visible(&self, run_id: CourseRunId) -> bool {
        self.runs.get(&run_id).is_some_and(|run| {
            !run.is_discontinued && self.program_of_run(run).is_some_and(|p| p.live)
        })
    }

    fn program_runs(&self, program: ProgramId) -> Vec<CourseRun> {
        let mut runs: Vec<CourseRun> = self
            .runs
            .values()
            .filter(|run| {
                self.courses
                    .get(&run.course_id)
                    .is_some_and(|course| course.program_id == program)
            })
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        runs
    }
}

/// Simple in-memory repository implementation for testing and prototyping.
///
/// One mutex guards all tables, so multi-table writes are atomic.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    state: Arc<Mutex<State>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StorageError> {
        self.state
            .lock()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }
}

#[async_trait]
impl CatalogRepository for InMemoryRepository {
    async fn upsert_program(&self, program: &Program) -> Result<(), StorageError> {
        program
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.lock()?.programs.insert(program.id, program.clone());
        Ok(())
    }

    async fn get_program(&self, id: ProgramId) -> Result<Program, StorageError> {
        self.lock()?
            .programs
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn upsert_course(&self, course: &Course) -> Result<(), StorageError> {
        course
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut guard = self.lock()?;
        if !guard.programs.contains_key(&course.program_id) {
            return Err(StorageError::Conflict);
        }
        guard.courses.insert(course.id, course.clone());
        Ok(())
    }

    async fn get_course(&self, id: CourseId) -> Result<Course, StorageError> {
        self.lock()?
            .courses
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn courses_for_program(&self, program: ProgramId) -> Result<Vec<Course>, StorageError> {
        let guard = self.lock()?;
        let mut courses: Vec<Course> = guard
            .courses
            .values()
            .filter(|course| course.program_id == program)
            .cloned()
            .collect();
        courses.sort_by_key(|course| (course.position_in_program, course.id));
        Ok(courses)
    }

    async fn upsert_course_run(&self, run: &CourseRun) -> Result<(), StorageError> {
        run.validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        let mut guard = self.lock()?;
        if !guard.courses.contains_key(&run.course_id) {
            return Err(StorageError::Conflict);
        }
        let key_taken = run.platform_key.as_deref().is_some_and(|key| {
            guard
                .runs
                .values()
                .any(|other| other.id != run.id && other.platform_key.as_deref() == Some(key))
        });
        if key_taken {
            return Err(StorageError::Conflict);
        }
        guard.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_course_run(&self, id: CourseRunId) -> Result<CourseRun, StorageError> {
        self.lock()?
            .runs
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn runs_for_program(&self, program: ProgramId) -> Result<Vec<CourseRun>, StorageError> {
        Ok(self.lock()?.program_runs(program))
    }

    async fn candidate_runs(&self) -> Result<Vec<CourseRun>, StorageError> {
        let guard = self.lock()?;
        let mut runs: Vec<CourseRun> = guard
            .runs
            .values()
            .filter(|run| run.platform_key.is_some() && guard.is_visible(run.id))
            .cloned()
            .collect();
        runs.sort_by_key(|run| run.id);
        Ok(runs)
    }

    async fn upsert_course_price(&self, price: &CoursePrice) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.runs.contains_key(&price.course_run_id) {
            return Err(StorageError::Conflict);
        }
        guard.prices.insert(price.course_run_id, price.clone());
        Ok(())
    }

    async fn prices_for_program(
        &self,
        program: ProgramId,
    ) -> Result<Vec<CoursePrice>, StorageError> {
        let guard = self.lock()?;
        Ok(guard
            .program_runs(program)
            .iter()
            .filter_map(|run| guard.prices.get(&run.id).cloned())
            .collect())
    }

    async fn upsert_tier_program(&self, tier: &TierProgram) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.programs.contains_key(&tier.program_id) {
            return Err(StorageError::Conflict);
        }
        guard.tiers.insert(tier.id, tier.clone());
        Ok(())
    }

    async fn get_tier_program(&self, id: TierProgramId) -> Result<TierProgram, StorageError> {
        self.lock()?
            .tiers
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn tiers_for_program(
        &self,
        program: ProgramId,
    ) -> Result<Vec<TierProgram>, StorageError> {
        let guard = self.lock()?;
        let mut tiers: Vec<TierProgram> = guard
            .tiers
            .values()
            .filter(|tier| tier.program_id == program)
            .cloned()
            .collect();
        tiers.sort_by_key(|tier| tier.id);
        Ok(tiers)
    }

    async fn upsert_exam_run(&self, exam_run: &ExamRun) -> Result<(), StorageError> {
        exam_run
            .validate()
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.lock()?.exam_runs.insert(exam_run.id, exam_run.clone());
        Ok(())
    }

    async fn get_exam_run(&self, id: ExamRunId) -> Result<ExamRun, StorageError> {
        self.lock()?
            .exam_runs
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }
}

#[async_trait]
impl UserRepository for InMemoryRepository {
    async fn upsert_user(&self, user: &PlatformUser) -> Result<(), StorageError> {
        self.lock()?.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user(&self, id: UserId) -> Result<PlatformUser, StorageError> {
        self.lock()?
            .users
            .get(&id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn list_user_ids(&self) -> Result<Vec<UserId>, StorageError> {
        let mut ids: Vec<UserId> = self.lock()?.users.keys().copied().collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl CacheRepository for InMemoryRepository {
    async fn records(
        &self,
        user: UserId,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, StorageError> {
        let guard = self.lock()?;
        let mut records: Vec<CachedRecord> = guard
            .records
            .values()
            .filter(|r| r.user_id == user && r.kind == kind && guard.is_visible(r.course_run_id))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.course_run_id);
        Ok(records)
    }

    async fn replace_kind(
        &self,
        user: UserId,
        kind: CacheKind,
        entries: &[CacheEntry],
        refreshed_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if let Some((run, _)) = entries.iter().find(|(run, _)| !guard.runs.contains_key(run)) {
            return Err(StorageError::Serialization(format!(
                "unknown course run {run} in {kind} refresh"
            )));
        }
        for (run, payload) in entries {
            guard.records.insert(
                (user, *run, kind),
                CachedRecord {
                    user_id: user,
                    course_run_id: *run,
                    kind,
                    payload: payload.clone(),
                    last_request: refreshed_at,
                },
            );
        }
        guard
            .markers
            .entry(user)
            .or_insert_with(|| CacheRefreshMarker::empty(user))
            .set(kind, refreshed_at);
        Ok(())
    }

    async fn marker(&self, user: UserId) -> Result<CacheRefreshMarker, StorageError> {
        Ok(self
            .lock()?
            .markers
            .get(&user)
            .cloned()
            .unwrap_or_else(|| CacheRefreshMarker::empty(user)))
    }

    async fn users_enrolled_in_run(&self, run: CourseRunId) -> Result<Vec<UserId>, StorageError> {
        let guard = self.lock()?;
        let mut users = Vec::new();
        for record in guard
            .records
            .values()
            .filter(|r| r.course_run_id == run && r.kind == CacheKind::Enrollment)
        {
            let enrollment = record
                .enrollment()
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            if enrollment.is_some_and(|e| e.is_active) {
                users.push(record.user_id);
            }
        }
        users.sort();
        Ok(users)
    }

    async fn record_refresh_failure(
        &self,
        user: UserId,
        _at: DateTime<Utc>,
    ) -> Result<u32, StorageError> {
        let mut guard = self.lock()?;
        let count = guard.failures.entry(user).or_insert(0);
        *count = count.saturating_add(1);
        Ok(*count)
    }

    async fn reset_refresh_failures(&self, user: UserId) -> Result<(), StorageError> {
        self.lock()?.failures.remove(&user);
        Ok(())
    }

    async fn refresh_failures(&self, user: UserId) -> Result<u32, StorageError> {
        Ok(self.lock()?.failures.get(&user).copied().unwrap_or(0))
    }
}

#[async_trait]
impl FinalGradeRepository for InMemoryRepository {
    async fn get_final_grade(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<FinalGrade>, StorageError> {
        Ok(self.lock()?.final_grades.get(&(user, run)).cloned())
    }

    async fn final_grades_for_user(&self, user: UserId) -> Result<Vec<FinalGrade>, StorageError> {
        let guard = self.lock()?;
        let mut grades: Vec<FinalGrade> = guard
            .final_grades
            .values()
            .filter(|g| g.user_id == user)
            .cloned()
            .collect();
        grades.sort_by_key(|g| g.course_run_id);
        Ok(grades)
    }

    async fn save_complete(&self, grade: &FinalGrade) -> Result<FinalGrade, StorageError> {
        let mut guard = self.lock()?;
        let key = (grade.user_id, grade.course_run_id);
        match guard.final_grades.get(&key) {
            Some(existing) if existing.is_complete() => Ok(existing.clone()),
            Some(existing) => {
                let mut updated = grade.clone();
                updated.created_at = existing.created_at;
                guard.final_grades.insert(key, updated.clone());
                Ok(updated)
            }
            None => {
                guard.final_grades.insert(key, grade.clone());
                Ok(grade.clone())
            }
        }
    }

    async fn users_with_complete_grade(
        &self,
        run: CourseRunId,
    ) -> Result<Vec<UserId>, StorageError> {
        let guard = self.lock()?;
        let mut users: Vec<UserId> = guard
            .final_grades
            .values()
            .filter(|g| g.course_run_id == run && g.is_complete())
            .map(|g| g.user_id)
            .collect();
        users.sort();
        Ok(users)
    }

    async fn grading_status(
        &self,
        run: CourseRunId,
    ) -> Result<Option<GradingStatus>, StorageError> {
        Ok(self.lock()?.grading.get(&run).copied())
    }

    async fn set_grading_status(
        &self,
        run: CourseRunId,
        status: GradingStatus,
        _at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.lock()?.grading.insert(run, status);
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryRepository {
    async fn upsert_payment(&self, payment: &Payment) -> Result<(), StorageError> {
        self.lock()?.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn payments_for_user(&self, user: UserId) -> Result<Vec<Payment>, StorageError> {
        let guard = self.lock()?;
        let mut payments: Vec<Payment> = guard
            .payments
            .values()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect();
        payments.sort_by_key(|p| (p.paid_at, p.id));
        Ok(payments)
    }

    async fn upsert_financial_aid(&self, aid: &FinancialAid) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if !guard.tiers.contains_key(&aid.tier_program_id) {
            return Err(StorageError::Conflict);
        }
        guard
            .financial_aid
            .insert((aid.user_id, aid.tier_program_id), aid.clone());
        Ok(())
    }

    async fn financial_aid_for_program(
        &self,
        user: UserId,
        program: ProgramId,
    ) -> Result<Vec<FinancialAid>, StorageError> {
        let guard = self.lock()?;
        let mut aid: Vec<FinancialAid> = guard
            .financial_aid
            .values()
            .filter(|a| {
                a.user_id == user
                    && guard
                        .tiers
                        .get(&a.tier_program_id)
                        .is_some_and(|tier| tier.program_id == program)
            })
            .cloned()
            .collect();
        aid.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(aid)
    }

    async fn upsert_exam_authorization(
        &self,
        authorization: &ExamAuthorization,
    ) -> Result<(), StorageError> {
        self.lock()?.authorizations.insert(
            (authorization.user_id, authorization.exam_run_id),
            authorization.clone(),
        );
        Ok(())
    }

    async fn exam_authorizations(
        &self,
        user: UserId,
        course: CourseId,
    ) -> Result<Vec<ExamAuthorization>, StorageError> {
        let guard = self.lock()?;
        let mut found: Vec<ExamAuthorization> = guard
            .authorizations
            .values()
            .filter(|a| a.user_id == user && a.course_id == course)
            .cloned()
            .collect();
        found.sort_by_key(|a| a.exam_run_id);
        Ok(found)
    }
}

#[async_trait]
impl JobLockRepository for InMemoryRepository {
    async fn try_acquire(
        &self,
        name: &str,
        holder: Uuid,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<bool, StorageError> {
        let mut guard = self.lock()?;
        let held_by_other = guard
            .locks
            .get(name)
            .is_some_and(|(owner, expires_at)| *owner != holder && *expires_at > now);
        if held_by_other {
            return Ok(false);
        }
        guard.locks.insert(name.to_string(), (holder, now + ttl));
        Ok(true)
    }

    async fn release(&self, name: &str, holder: Uuid) -> Result<(), StorageError> {
        let mut guard = self.lock()?;
        if guard.locks.get(name).is_some_and(|(owner, _)| *owner == holder) {
            guard.locks.remove(name);
        }
        Ok(())
    }
}
