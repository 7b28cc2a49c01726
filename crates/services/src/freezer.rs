use std::collections::HashSet;
use std::sync::Arc;

use progress_core::model::{
    CacheKind, CertificateData, CourseRunId, CurrentGradeData, FinalGrade, GradingStatus,
    PlatformUser, UserId, is_paid_mode,
};
use storage::repository::{CatalogRepository, FinalGradeRepository, UserRepository};
use tracing::{info, warn};

use crate::Clock;
use crate::cache::RemoteDataCache;
use crate::error::FreezeError;
use crate::events::ProgressEvent;

/// Outcome of freezing a whole course run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFreezeReport {
    pub frozen: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
    /// The run was already marked complete; nobody was looked at.
    pub already_complete: bool,
    /// The run is now marked complete.
    pub completed: bool,
}

/// Computes final grades once and never changes them afterwards.
#[derive(Clone)]
pub struct GradeFreezer {
    clock: Clock,
    cache: RemoteDataCache,
    catalog: Arc<dyn CatalogRepository>,
    users: Arc<dyn UserRepository>,
    final_grades: Arc<dyn FinalGradeRepository>,
}

impl GradeFreezer {
    #[must_use]
    pub fn new(
        cache: RemoteDataCache,
        catalog: Arc<dyn CatalogRepository>,
        users: Arc<dyn UserRepository>,
        final_grades: Arc<dyn FinalGradeRepository>,
    ) -> Self {
        Self {
            clock: cache.clock(),
            cache,
            catalog,
            users,
            final_grades,
        }
    }

    /// Freeze the learner's grade for a run.
    ///
    /// An existing complete grade is returned as is. Otherwise every cache
    /// kind is refreshed and the grade computed from the fresh snapshot.
    ///
    /// # Errors
    ///
    /// Returns `FreezeError::NotReadyToFreeze` before the run's freeze date,
    /// `FreezeError::Cache` if the refresh fails (nothing is written), and
    /// storage or grade errors otherwise.
    pub async fn freeze(
        &self,
        user: &PlatformUser,
        run: CourseRunId,
    ) -> Result<FinalGrade, FreezeError> {
        if let Some(existing) = self.final_grades.get_final_grade(user.id, run).await? {
            if existing.is_complete() {
                return Ok(existing);
            }
        }

        let course_run = self.catalog.get_course_run(run).await?;
        let now = self.clock.now();
        if !course_run.can_freeze_grades(now) {
            return Err(FreezeError::NotReadyToFreeze(run));
        }

        if let Err(err) = self.cache.refresh_all(user).await {
            self.cache.events().publish(ProgressEvent::FreezeFailed {
                user_id: user.id,
                course_run_id: run,
                reason: err.to_string(),
                at: now,
            });
            return Err(err.into());
        }

        let course = self.catalog.get_course(course_run.course_id).await?;
        let program = self.catalog.get_program(course.program_id).await?;

        let certificate = self.certificate(user.id, run).await?;
        let current = self.current_grade(user.id, run).await?;

        let (grade, passed) = match (&certificate, &current) {
            (Some(cert), _) => (cert.grade, true),
            (None, Some(current)) if program.financial_aid_availability => {
                (current.percent, current.passed)
            }
            (None, Some(current)) => (current.percent, false),
            (None, None) => (0.0, false),
        };
        let paid_on_platform = certificate
            .as_ref()
            .is_some_and(|cert| is_paid_mode(&cert.certificate_type));

        let computed = FinalGrade::complete(user.id, run, grade, passed, paid_on_platform, now)?;
        let stored = self.final_grades.save_complete(&computed).await?;

        info!(
            user_id = %user.id,
            course_run_id = %run,
            grade = stored.grade,
            passed = stored.passed,
            paid_on_platform = stored.paid_on_platform,
            "final grade frozen"
        );
        self.cache.events().publish(ProgressEvent::GradeFrozen {
            user_id: user.id,
            course_run_id: run,
            grade: stored.grade,
            passed: stored.passed,
            at: now,
        });
        Ok(stored)
    }

    async fn certificate(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<CertificateData>, FreezeError> {
        let records = self.cache.records(user, CacheKind::Certificate).await?;
        match records.iter().find(|record| record.course_run_id == run) {
            Some(record) => Ok(record.certificate()?),
            None => Ok(None),
        }
    }

    async fn current_grade(
        &self,
        user: UserId,
        run: CourseRunId,
    ) -> Result<Option<CurrentGradeData>, FreezeError> {
        let records = self.cache.records(user, CacheKind::CurrentGrade).await?;
        match records.iter().find(|record| record.course_run_id == run) {
            Some(record) => Ok(record.current_grade()?),
            None => Ok(None),
        }
    }

    /// Freeze every actively enrolled learner of a run that has no complete
    /// grade yet. The run is marked complete once nobody is left.
    ///
    /// Per-learner failures are collected in the report, not returned.
    ///
    /// # Errors
    ///
    /// Returns `FreezeError::NotReadyToFreeze` before the run's freeze date and
    /// storage errors on bookkeeping failures.
    pub async fn freeze_course_run(
        &self,
        run: CourseRunId,
    ) -> Result<RunFreezeReport, FreezeError> {
        let course_run = self.catalog.get_course_run(run).await?;
        let now = self.clock.now();
        if !course_run.can_freeze_grades(now) {
            return Err(FreezeError::NotReadyToFreeze(run));
        }

        if self.final_grades.grading_status(run).await? == Some(GradingStatus::Complete) {
            return Ok(RunFreezeReport {
                already_complete: true,
                ..RunFreezeReport::default()
            });
        }

        let done: HashSet<UserId> = self
            .final_grades
            .users_with_complete_grade(run)
            .await?
            .into_iter()
            .collect();
        let outstanding: Vec<UserId> = self
            .cache
            .users_enrolled_in_run(run)
            .await?
            .into_iter()
            .filter(|user| !done.contains(user))
            .collect();

        let mut report = RunFreezeReport::default();
        for user_id in outstanding {
            let result = match self.users.get_user(user_id).await {
                Ok(user) => self.freeze(&user, run).await.map(|_| ()),
                Err(err) => Err(err.into()),
            };
            match result {
                Ok(()) => report.frozen.push(user_id),
                Err(err) => {
                    warn!(user_id = %user_id, course_run_id = %run, error = %err, "freeze failed");
                    if !matches!(err, FreezeError::Cache(_)) {
                        // cache failures are published by `freeze` itself
                        self.cache.events().publish(ProgressEvent::FreezeFailed {
                            user_id,
                            course_run_id: run,
                            reason: err.to_string(),
                            at: now,
                        });
                    }
                    report.failed.push((user_id, err.to_string()));
                }
            }
        }

        report.completed = report.failed.is_empty();
        let status = if report.completed {
            GradingStatus::Complete
        } else {
            GradingStatus::Pending
        };
        self.final_grades.set_grading_status(run, status, now).await?;
        info!(
            course_run_id = %run,
            frozen = report.frozen.len(),
            failed = report.failed.len(),
            status = status.as_str(),
            "course run freeze finished"
        );
        Ok(report)
    }
}
