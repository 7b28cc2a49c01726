//! Per-learner, per-program view over cached remote data and local records.
//!
//! A [`ProgressFacade`] is a snapshot: [`ProgressReader::build`] does all the
//! I/O, every query afterwards is a cheap lookup.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use progress_core::model::{
    CacheKind, CachedRecord, CertificateData, Course, CourseId, CourseRun, CourseRunId,
    CurrentGradeData, EnrollmentData, FinalGrade, FinancialAid, FinancialAidStatus,
    PayloadError, PlatformUser, Program, ProgramId, UserId,
};
use progress_core::status::RunFacts;
use storage::repository::{CatalogRepository, FinalGradeRepository, LedgerRepository};
use tracing::debug;

use crate::Clock;
use crate::cache::RemoteDataCache;
use crate::error::{CacheError, ProgressError};

/// Who is looking at the learner's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Viewer {
    /// The learner. Stale cache kinds are refreshed before reading.
    Subject,
    /// Staff or another learner. Reads whatever is cached.
    Observer,
}

/// Builds [`ProgressFacade`] snapshots.
#[derive(Clone)]
pub struct ProgressReader {
    clock: Clock,
    cache: RemoteDataCache,
    catalog: Arc<dyn CatalogRepository>,
    final_grades: Arc<dyn FinalGradeRepository>,
    ledger: Arc<dyn LedgerRepository>,
}

impl ProgressReader {
    #[must_use]
    pub fn new(
        cache: RemoteDataCache,
        catalog: Arc<dyn CatalogRepository>,
        final_grades: Arc<dyn FinalGradeRepository>,
        ledger: Arc<dyn LedgerRepository>,
    ) -> Self {
        Self {
            clock: cache.clock(),
            cache,
            catalog,
            final_grades,
            ledger,
        }
    }

    /// Snapshot everything needed to answer progress questions about `user`
    /// in `program`.
    ///
    /// # Errors
    ///
    /// Returns `ProgressError::Cache` when a refresh fails,
    /// `ProgressError::MisconfiguredProgram` when a financial-aid program
    /// lacks pricing data, and storage or payload errors otherwise.
    pub async fn build(
        &self,
        user: &PlatformUser,
        program: ProgramId,
        viewer: Viewer,
    ) -> Result<ProgressFacade, ProgressError> {
        let program = self.catalog.get_program(program).await?;
        let courses = self.catalog.courses_for_program(program.id).await?;
        let mut runs_by_course: HashMap<CourseId, Vec<CourseRun>> = HashMap::new();
        for run in self.catalog.runs_for_program(program.id).await? {
            runs_by_course.entry(run.course_id).or_default().push(run);
        }

        let financial_aid = self
            .ledger
            .financial_aid_for_program(user.id, program.id)
            .await?
            .into_iter()
            .find(|aid| aid.status != FinancialAidStatus::Reset);

        // pricing is checked before any refresh reaches the platform
        let price = if program.financial_aid_availability {
            Some(self.learner_price(&program, financial_aid.as_ref()).await?)
        } else {
            None
        };

        let enrollments = self.read_kind(user, viewer, CacheKind::Enrollment).await?;
        let certificates = self.read_kind(user, viewer, CacheKind::Certificate).await?;
        let current_grades = self.read_kind(user, viewer, CacheKind::CurrentGrade).await?;

        let final_grades: HashMap<CourseRunId, FinalGrade> = self
            .final_grades
            .final_grades_for_user(user.id)
            .await?
            .into_iter()
            .filter(FinalGrade::is_complete)
            .map(|grade| (grade.course_run_id, grade))
            .collect();

        let fulfilled_keys: HashSet<String> = self
            .ledger
            .payments_for_user(user.id)
            .await?
            .into_iter()
            .filter(|payment| payment.is_fulfilled())
            .map(|payment| payment.course_key)
            .collect();

        debug!(
            user_id = %user.id,
            program_id = %program.id,
            ?viewer,
            enrollments = enrollments.len(),
            "progress snapshot built"
        );

        Ok(ProgressFacade {
            user: user.id,
            now: self.clock.now(),
            program,
            courses,
            runs_by_course,
            enrollments: decode_all(&enrollments, CachedRecord::enrollment)?,
            certificates: decode_all(&certificates, CachedRecord::certificate)?,
            current_grades: decode_all(&current_grades, CachedRecord::current_grade)?,
            final_grades,
            fulfilled_keys,
            financial_aid,
            price,
        })
    }

    async fn read_kind(
        &self,
        user: &PlatformUser,
        viewer: Viewer,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, CacheError> {
        match viewer {
            Viewer::Subject => self.cache.get_or_refresh(user, kind).await,
            Viewer::Observer => self.cache.records(user.id, kind).await,
        }
    }

    /// Valid course price minus the discount of the learner's tier: the
    /// financial-aid tier if they applied, the no-discount tier otherwise.
    async fn learner_price(
        &self,
        program: &Program,
        aid: Option<&FinancialAid>,
    ) -> Result<u64, ProgressError> {
        let misconfigured = |reason: &str| ProgressError::MisconfiguredProgram {
            program: program.id,
            reason: reason.to_string(),
        };

        let price = self
            .catalog
            .prices_for_program(program.id)
            .await?
            .into_iter()
            .find(|price| price.is_valid)
            .ok_or_else(|| misconfigured("no valid course price"))?;

        let tiers: Vec<_> = self
            .catalog
            .tiers_for_program(program.id)
            .await?
            .into_iter()
            .filter(|tier| tier.current)
            .collect();
        if tiers.is_empty() {
            return Err(misconfigured("no current tier program"));
        }

        let tier = match aid {
            Some(aid) => tiers
                .iter()
                .find(|tier| tier.id == aid.tier_program_id)
                .ok_or_else(|| misconfigured("financial aid tier is not current"))?,
            None => tiers
                .iter()
                .find(|tier| tier.is_no_discount())
                .ok_or_else(|| misconfigured("no no-discount tier"))?,
        };

        Ok(price.price.saturating_sub(tier.discount_amount))
    }
}

fn decode_all<T>(
    records: &[CachedRecord],
    decode: fn(&CachedRecord) -> Result<Option<T>, PayloadError>,
) -> Result<HashMap<CourseRunId, T>, PayloadError> {
    let mut decoded = HashMap::new();
    for record in records {
        if let Some(payload) = decode(record)? {
            decoded.insert(record.course_run_id, payload);
        }
    }
    Ok(decoded)
}

/// Everything known about one learner in one program, at one instant.
#[derive(Debug, Clone)]
pub struct ProgressFacade {
    user: UserId,
    now: DateTime<Utc>,
    program: Program,
    courses: Vec<Course>,
    runs_by_course: HashMap<CourseId, Vec<CourseRun>>,
    enrollments: HashMap<CourseRunId, EnrollmentData>,
    certificates: HashMap<CourseRunId, CertificateData>,
    current_grades: HashMap<CourseRunId, CurrentGradeData>,
    final_grades: HashMap<CourseRunId, FinalGrade>,
    fulfilled_keys: HashSet<String>,
    financial_aid: Option<FinancialAid>,
    price: Option<u64>,
}

impl ProgressFacade {
    #[must_use]
    pub fn user(&self) -> UserId {
        self.user
    }

    #[must_use]
    pub fn program(&self) -> &Program {
        &self.program
    }

    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Courses ordered by position in the program.
    #[must_use]
    pub fn courses(&self) -> &[Course] {
        &self.courses
    }

    #[must_use]
    pub fn runs_of(&self, course: CourseId) -> &[CourseRun] {
        self.runs_by_course
            .get(&course)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn run(&self, run: CourseRunId) -> Option<&CourseRun> {
        self.runs_by_course
            .values()
            .flatten()
            .find(|candidate| candidate.id == run)
    }

    /// The run belongs to the program and the learner holds an active
    /// enrollment in it.
    #[must_use]
    pub fn is_enrolled(&self, run: CourseRunId) -> bool {
        self.run(run).is_some()
            && self
                .enrollments
                .get(&run)
                .is_some_and(|enrollment| enrollment.is_active)
    }

    /// Whether the learner paid for the run.
    ///
    /// Financial-aid programs are paid through local orders, and a payment for
    /// any run of the course covers them all. Other programs are paid on the
    /// platform: a frozen grade remembers that, otherwise the enrollment mode
    /// tells.
    #[must_use]
    pub fn has_paid(&self, run: CourseRunId) -> bool {
        let Some(course_run) = self.run(run) else {
            return false;
        };

        if self.program.financial_aid_availability {
            return self
                .runs_of(course_run.course_id)
                .iter()
                .filter_map(|sibling| sibling.platform_key.as_ref())
                .any(|key| self.fulfilled_keys.contains(key));
        }

        if self
            .final_grades
            .get(&run)
            .is_some_and(|grade| grade.paid_on_platform)
        {
            return true;
        }
        self.enrollments
            .get(&run)
            .is_some_and(EnrollmentData::is_verified)
    }

    #[must_use]
    pub fn is_enrolled_mmtrack(&self, run: CourseRunId) -> bool {
        self.is_enrolled(run) && self.has_paid(run)
    }

    #[must_use]
    pub fn has_passed(&self, run: CourseRunId) -> bool {
        self.certificates
            .get(&run)
            .is_some_and(CertificateData::is_verified)
            || self.final_grades.get(&run).is_some_and(|grade| grade.passed)
    }

    #[must_use]
    pub fn has_passed_course(&self, course: CourseId) -> bool {
        self.runs_of(course).iter().any(|run| self.has_passed(run.id))
    }

    /// Live grade on the 0–100 scale, only while enrolled.
    #[must_use]
    pub fn current_grade(&self, run: CourseRunId) -> Option<f64> {
        if !self.is_enrolled(run) {
            return None;
        }
        self.current_grades
            .get(&run)
            .map(|grade| grade.percent * 100.0)
    }

    /// Frozen grade on the 0–100 scale.
    #[must_use]
    pub fn final_grade(&self, run: CourseRunId) -> Option<f64> {
        self.final_grades.get(&run).map(FinalGrade::percent)
    }

    #[must_use]
    pub fn certificate_url(&self, run: CourseRunId) -> Option<&str> {
        self.certificates
            .get(&run)
            .and_then(|cert| cert.download_url.as_deref())
    }

    /// Price in cents the learner pays per course; financial-aid programs
    /// only.
    #[must_use]
    pub fn price(&self) -> Option<u64> {
        self.price
    }

    #[must_use]
    pub fn count_courses_passed(&self) -> usize {
        self.courses
            .iter()
            .filter(|course| self.has_passed_course(course.id))
            .count()
    }

    /// Status of the newest application that was not reset.
    #[must_use]
    pub fn financial_aid_status(&self) -> Option<FinancialAidStatus> {
        self.financial_aid.as_ref().map(|aid| aid.status)
    }

    /// Input for the run status resolver.
    #[must_use]
    pub fn run_facts(&self, run: &CourseRun) -> RunFacts {
        RunFacts {
            enrolled: self.is_enrolled(run.id),
            enrolled_and_paid: self.is_enrolled_mmtrack(run.id),
            passed: self.has_passed(run.id),
        }
    }
}
