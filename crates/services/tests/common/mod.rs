#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use progress_core::model::{
    CacheKind, CertificateData, Course, CourseId, CoursePrice, CourseRun, CourseRunId,
    CurrentGradeData, EnrollmentData, ExamRun, ExamRunId, FinalGrade, GradingStatus,
    PlatformUser, Program, ProgramId, TierProgram, TierProgramId, UserId,
};
use progress_core::time::fixed_now;
use services::{Clock, EngineConfig, ProgressEngine, RemoteClient, RemoteError};
use storage::repository::{
    CatalogRepository, FinalGradeRepository, Storage, StorageError, UserRepository,
};

pub const PROGRAM: u64 = 1;
pub const FA_PROGRAM: u64 = 2;

pub const COURSE_MICRO: u64 = 1;
pub const COURSE_POLICY: u64 = 2;
pub const FA_COURSE: u64 = 3;

pub const RUN_CURRENT: u64 = 11;
pub const RUN_PAST: u64 = 12;
pub const RUN_DISCONTINUED: u64 = 13;
pub const RUN_OLDER: u64 = 21;
pub const RUN_NEWER: u64 = 22;
pub const FA_RUN_CURRENT: u64 = 31;
pub const FA_RUN_PAST: u64 = 32;

pub const EXAM_OPEN: u64 = 301;
pub const EXAM_OLD: u64 = 302;

pub const NO_DISCOUNT_TIER: u64 = 201;
pub const DISCOUNT_TIER: u64 = 202;
pub const FA_PRICE: u64 = 100_000;
pub const FA_DISCOUNT: u64 = 25_000;

pub fn key(run: u64) -> String {
    format!("course-v1:MITx+R{run}+T")
}

pub fn run_id(run: u64) -> CourseRunId {
    CourseRunId::new(run)
}

pub fn enrollment(run: u64, mode: &str) -> EnrollmentData {
    EnrollmentData {
        course_key: key(run),
        is_active: true,
        mode: mode.to_string(),
    }
}

pub fn certificate(run: u64, certificate_type: &str, grade: f64) -> CertificateData {
    CertificateData {
        course_key: key(run),
        certificate_type: certificate_type.to_string(),
        status: "downloadable".to_string(),
        grade,
        download_url: Some(format!("https://lms.example.org/certificates/{run}")),
    }
}

pub fn current_grade(run: u64, percent: f64, passed: bool) -> CurrentGradeData {
    CurrentGradeData {
        course_key: key(run),
        percent,
        passed,
        letter_grade: None,
    }
}

//
// ─── SCRIPTED REMOTE ───────────────────────────────────────────────────────────
//

#[derive(Default)]
struct RemoteState {
    enrollments: Vec<EnrollmentData>,
    certificates: Vec<CertificateData>,
    grades: Vec<CurrentGradeData>,
    failure: Option<(Option<CacheKind>, RemoteError)>,
    calls: HashMap<CacheKind, usize>,
    asked: HashMap<CacheKind, Vec<String>>,
}

/// `RemoteClient` answering from scripted data and counting calls.
#[derive(Default)]
pub struct ScriptedRemote {
    state: Mutex<RemoteState>,
}

impl ScriptedRemote {
    fn with_state<T>(&self, f: impl FnOnce(&mut RemoteState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn set_enrollments(&self, enrollments: Vec<EnrollmentData>) {
        self.with_state(|s| s.enrollments = enrollments);
    }

    pub fn set_certificates(&self, certificates: Vec<CertificateData>) {
        self.with_state(|s| s.certificates = certificates);
    }

    pub fn set_grades(&self, grades: Vec<CurrentGradeData>) {
        self.with_state(|s| s.grades = grades);
    }

    /// Fail calls for `kind`, or every call when `kind` is `None`.
    pub fn fail(&self, kind: Option<CacheKind>, err: RemoteError) {
        self.with_state(|s| s.failure = Some((kind, err)));
    }

    pub fn recover(&self) {
        self.with_state(|s| s.failure = None);
    }

    pub fn calls(&self, kind: CacheKind) -> usize {
        self.with_state(|s| s.calls.get(&kind).copied().unwrap_or(0))
    }

    pub fn total_calls(&self) -> usize {
        self.with_state(|s| s.calls.values().sum())
    }

    /// Run keys of the last certificate or grade call.
    pub fn asked(&self, kind: CacheKind) -> Vec<String> {
        self.with_state(|s| s.asked.get(&kind).cloned().unwrap_or_default())
    }

    fn begin(&self, kind: CacheKind, keys: &[String]) -> Result<(), RemoteError> {
        self.with_state(|s| {
            *s.calls.entry(kind).or_default() += 1;
            s.asked.insert(kind, keys.to_vec());
            match &s.failure {
                Some((None, err)) => Err(err.clone()),
                Some((Some(failing), err)) if *failing == kind => Err(err.clone()),
                _ => Ok(()),
            }
        })
    }
}

#[async_trait]
impl RemoteClient for ScriptedRemote {
    async fn fetch_enrollments(
        &self,
        _user: &PlatformUser,
    ) -> Result<Vec<EnrollmentData>, RemoteError> {
        self.begin(CacheKind::Enrollment, &[])?;
        Ok(self.with_state(|s| s.enrollments.clone()))
    }

    async fn fetch_certificates(
        &self,
        _user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CertificateData>, RemoteError> {
        self.begin(CacheKind::Certificate, run_keys)?;
        // answers more than asked; the cache must ignore the extra ones
        Ok(self.with_state(|s| s.certificates.clone()))
    }

    async fn fetch_current_grades(
        &self,
        _user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CurrentGradeData>, RemoteError> {
        self.begin(CacheKind::CurrentGrade, run_keys)?;
        Ok(self.with_state(|s| {
            s.grades
                .iter()
                .filter(|grade| run_keys.contains(&grade.course_key))
                .cloned()
                .collect()
        }))
    }
}

//
// ─── WRITE-COUNTING FINAL GRADES ───────────────────────────────────────────────
//

pub struct CountingFinalGrades {
    inner: Arc<dyn FinalGradeRepository>,
    saves: AtomicUsize,
}

impl CountingFinalGrades {
    pub fn new(inner: Arc<dyn FinalGradeRepository>) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FinalGradeRepository for CountingFinalGrades {
    async fn get_final_grade(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<FinalGrade>, StorageError> {
        self.inner.get_final_grade(user, run).await
    }

    async fn final_grades_for_user(&self, user: UserId) -> Result<Vec<FinalGrade>, StorageError> {
        self.inner.final_grades_for_user(user).await
    }

    async fn save_complete(&self, grade: &FinalGrade) -> Result<FinalGrade, StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_complete(grade).await
    }

    async fn users_with_complete_grade(
        &self,
        run: CourseRunId,
    ) -> Result<Vec<UserId>, StorageError> {
        self.inner.users_with_complete_grade(run).await
    }

    async fn grading_status(
        &self,
        run: CourseRunId,
    ) -> Result<Option<GradingStatus>, StorageError> {
        self.inner.grading_status(run).await
    }

    async fn set_grading_status(
        &self,
        run: CourseRunId,
        status: GradingStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.inner.set_grading_status(run, status, at).await
    }
}

//
// ─── CATALOG FIXTURE ───────────────────────────────────────────────────────────
//

fn weeks(n: i64) -> DateTime<Utc> {
    fixed_now() + Duration::weeks(n)
}

fn course_run(id: u64, course: u64, start: i64, end: i64) -> CourseRun {
    CourseRun::new(CourseRunId::new(id), CourseId::new(course), format!("Run {id}"))
        .with_platform_key(key(id))
        .with_dates(Some(weeks(start)), Some(weeks(end)))
}

fn learner(id: u64, username: &str) -> PlatformUser {
    PlatformUser {
        id: UserId::new(id),
        username: username.to_string(),
        access_token: format!("token-{id}"),
        token_expires_at: Some(weeks(1)),
    }
}

async fn seed(storage: &Storage) -> Result<(), StorageError> {
    let catalog = &storage.catalog;

    catalog
        .upsert_program(&Program::new(ProgramId::new(PROGRAM), "Data Economics"))
        .await?;
    catalog
        .upsert_course(&Course::new(
            CourseId::new(COURSE_MICRO),
            ProgramId::new(PROGRAM),
            "Microeconomics",
            1,
        ))
        .await?;
    catalog
        .upsert_course(&Course::new(
            CourseId::new(COURSE_POLICY),
            ProgramId::new(PROGRAM),
            "Development Policy",
            2,
        ))
        .await?;

    let mut current = course_run(RUN_CURRENT, COURSE_MICRO, -1, 2);
    current.upgrade_deadline = Some(weeks(1));
    let mut past = course_run(RUN_PAST, COURSE_MICRO, -20, -10);
    past.freeze_grade_date = Some(weeks(-9));
    let mut discontinued = course_run(RUN_DISCONTINUED, COURSE_MICRO, -1, 3);
    discontinued.is_discontinued = true;
    let mut older = course_run(RUN_OLDER, COURSE_POLICY, -60, -45);
    older.freeze_grade_date = Some(weeks(-44));
    let newer = course_run(RUN_NEWER, COURSE_POLICY, 1, 62);
    for run in [current, past, discontinued, older, newer] {
        catalog.upsert_course_run(&run).await?;
    }

    let mut fa_program = Program::new(ProgramId::new(FA_PROGRAM), "Supply Chain");
    fa_program.financial_aid_availability = true;
    fa_program.exam_attempts_first_date = Some(weeks(-30));
    fa_program.exam_attempts_second_date = Some(weeks(-15));
    catalog.upsert_program(&fa_program).await?;
    catalog
        .upsert_course(&Course::new(
            CourseId::new(FA_COURSE),
            ProgramId::new(FA_PROGRAM),
            "Logistics",
            1,
        ))
        .await?;
    let mut fa_past = course_run(FA_RUN_PAST, FA_COURSE, -20, -10);
    fa_past.freeze_grade_date = Some(weeks(-9));
    for run in [course_run(FA_RUN_CURRENT, FA_COURSE, -1, 2), fa_past] {
        catalog.upsert_course_run(&run).await?;
    }
    catalog
        .upsert_course_price(&CoursePrice {
            course_run_id: CourseRunId::new(FA_RUN_CURRENT),
            price: FA_PRICE,
            is_valid: true,
        })
        .await?;
    for (id, discount_amount, income_threshold) in
        [(NO_DISCOUNT_TIER, 0, 0), (DISCOUNT_TIER, FA_DISCOUNT, 50_000)]
    {
        catalog
            .upsert_tier_program(&TierProgram {
                id: TierProgramId::new(id),
                program_id: ProgramId::new(FA_PROGRAM),
                discount_amount,
                income_threshold,
                current: true,
            })
            .await?;
    }

    catalog
        .upsert_exam_run(&ExamRun {
            id: ExamRunId::new(EXAM_OPEN),
            course_id: CourseId::new(FA_COURSE),
            date_first_eligible: fixed_now() - Duration::days(1),
            date_last_eligible: fixed_now() + Duration::days(10),
        })
        .await?;
    catalog
        .upsert_exam_run(&ExamRun {
            id: ExamRunId::new(EXAM_OLD),
            course_id: CourseId::new(FA_COURSE),
            date_first_eligible: weeks(-40),
            date_last_eligible: weeks(-38),
        })
        .await?;

    storage.users.upsert_user(&learner(10, "learner")).await?;
    storage.users.upsert_user(&learner(11, "classmate")).await?;
    Ok(())
}

pub struct Fixture {
    pub storage: Storage,
    pub remote: Arc<ScriptedRemote>,
    pub clock: Clock,
    pub user: PlatformUser,
    pub classmate: PlatformUser,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_storage(Storage::in_memory()).await
    }

    pub async fn with_storage(storage: Storage) -> Self {
        seed(&storage).await.expect("seed catalog");
        Self {
            storage,
            remote: Arc::new(ScriptedRemote::default()),
            clock: Clock::fixed(fixed_now()),
            user: learner(10, "learner"),
            classmate: learner(11, "classmate"),
        }
    }

    pub fn engine(&self) -> ProgressEngine {
        self.engine_at(self.clock)
    }

    pub fn engine_at(&self, clock: Clock) -> ProgressEngine {
        self.engine_with(self.storage.clone(), clock)
    }

    pub fn engine_with(&self, storage: Storage, clock: Clock) -> ProgressEngine {
        let remote: Arc<dyn RemoteClient> = self.remote.clone();
        ProgressEngine::new(storage, remote, &EngineConfig::default(), clock)
    }

    /// Storage whose final-grade writes are counted.
    pub fn counting_storage(&self) -> (Storage, Arc<CountingFinalGrades>) {
        let counting = Arc::new(CountingFinalGrades::new(Arc::clone(
            &self.storage.final_grades,
        )));
        let storage = Storage {
            final_grades: counting.clone(),
            ..self.storage.clone()
        };
        (storage, counting)
    }
}
