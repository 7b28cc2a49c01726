use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use progress_core::attempts::remaining_attempts;
use progress_core::model::{CourseId, ExamRunId, UserId};
use storage::repository::{CatalogRepository, FinalGradeRepository, LedgerRepository};
use tracing::{debug, warn};

use crate::Clock;
use crate::error::LedgerError;

/// Read side of proctored-exam attempts.
#[derive(Clone)]
pub struct ExamAttemptLedger {
    clock: Clock,
    catalog: Arc<dyn CatalogRepository>,
    ledger: Arc<dyn LedgerRepository>,
    final_grades: Arc<dyn FinalGradeRepository>,
}

impl ExamAttemptLedger {
    #[must_use]
    pub fn new(
        clock: Clock,
        catalog: Arc<dyn CatalogRepository>,
        ledger: Arc<dyn LedgerRepository>,
        final_grades: Arc<dyn FinalGradeRepository>,
    ) -> Self {
        Self {
            clock,
            catalog,
            ledger,
            final_grades,
        }
    }

    /// Attempts the learner can still book for the course.
    ///
    /// A payment counts when it is fulfilled for any run of the course. A
    /// consumed attempt is an authorization whose exam was taken, dated by its
    /// exam run's first eligible day. Inconsistent histories are logged and
    /// still answered.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the course or its records cannot be
    /// read.
    pub async fn remaining_attempts(
        &self,
        user: UserId,
        course: CourseId,
    ) -> Result<i64, LedgerError> {
        let course = self.catalog.get_course(course).await?;
        let program = self.catalog.get_program(course.program_id).await?;

        let run_keys: HashSet<String> = self
            .catalog
            .runs_for_program(program.id)
            .await?
            .into_iter()
            .filter(|run| run.course_id == course.id)
            .filter_map(|run| run.platform_key)
            .collect();

        let payment_dates: Vec<DateTime<Utc>> = self
            .ledger
            .payments_for_user(user)
            .await?
            .into_iter()
            .filter(|payment| payment.is_fulfilled() && run_keys.contains(&payment.course_key))
            .map(|payment| payment.paid_at)
            .collect();

        let mut attempt_dates = Vec::new();
        for authorization in self.ledger.exam_authorizations(user, course.id).await? {
            if !authorization.exam_taken {
                continue;
            }
            let exam_run = self.catalog.get_exam_run(authorization.exam_run_id).await?;
            attempt_dates.push(exam_run.date_first_eligible);
        }

        let tally = remaining_attempts(program.attempt_cutover(), &payment_dates, &attempt_dates);
        if tally.inconsistent_history {
            warn!(
                user_id = %user,
                course_id = %course.id,
                payments = payment_dates.len(),
                attempts = attempt_dates.len(),
                remaining = tally.remaining,
                "exam attempt history is inconsistent with the payments on record"
            );
        }
        Ok(tally.remaining)
    }

    /// Whether the learner may be authorized for `exam_run`: it belongs to the
    /// course and is open now, a run of the course was passed, and an attempt
    /// is left.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if any record cannot be read.
    pub async fn is_eligible(
        &self,
        user: UserId,
        course: CourseId,
        exam_run: ExamRunId,
    ) -> Result<bool, LedgerError> {
        let exam_run = self.catalog.get_exam_run(exam_run).await?;
        if exam_run.course_id != course || !exam_run.is_window_open(self.clock.now()) {
            debug!(user_id = %user, exam_run_id = %exam_run.id, "exam run not open for course");
            return Ok(false);
        }

        let course_runs: HashSet<_> = {
            let course_row = self.catalog.get_course(course).await?;
            self.catalog
                .runs_for_program(course_row.program_id)
                .await?
                .into_iter()
                .filter(|run| run.course_id == course)
                .map(|run| run.id)
                .collect()
        };
        let passed = self
            .final_grades
            .final_grades_for_user(user)
            .await?
            .iter()
            .any(|grade| {
                grade.is_complete()
                    && grade.passed
                    && course_runs.contains(&grade.course_run_id)
            });
        if !passed {
            return Ok(false);
        }

        Ok(self.remaining_attempts(user, course).await? > 0)
    }
}
