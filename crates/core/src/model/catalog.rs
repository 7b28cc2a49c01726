use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{CourseId, CourseRunId, ExamRunId, ProgramId, TierProgramId};

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CatalogError {
    #[error("title cannot be empty")]
    EmptyTitle,

    #[error("course run {0} ends before it starts")]
    InvalidRunDates(CourseRunId),

    #[error("course run {0} closes enrollment before opening it")]
    InvalidEnrollmentWindow(CourseRunId),

    #[error("platform key for course run {0} cannot be blank")]
    BlankPlatformKey(CourseRunId),

    #[error("exam attempt cutover dates are out of order for program {0}")]
    InvalidAttemptCutover(ProgramId),

    #[error("exam run {0} eligibility window is inverted")]
    InvalidEligibilityWindow(ExamRunId),
}

//
// ─── PROGRAM ───────────────────────────────────────────────────────────────────
//

/// The two dates at which the proctored-exam attempt policy changed.
///
/// Payments made before `first_date` granted two attempts each; attempts
/// consumed from `second_date` onward are counted at one per payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCutover {
    pub first_date: DateTime<Utc>,
    pub second_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    pub id: ProgramId,
    pub title: String,
    pub live: bool,
    pub financial_aid_availability: bool,
    pub exam_attempts_first_date: Option<DateTime<Utc>>,
    pub exam_attempts_second_date: Option<DateTime<Utc>>,
}

impl Program {
    #[must_use]
    pub fn new(id: ProgramId, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            live: true,
            financial_aid_availability: false,
            exam_attempts_first_date: None,
            exam_attempts_second_date: None,
        }
    }

    /// Checks invariants that storage relies on.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` for an empty title or inverted cutover dates.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.title.trim().is_empty() {
            return Err(CatalogError::EmptyTitle);
        }
        if let Some(cutover) = self.attempt_cutover() {
            if cutover.second_date < cutover.first_date {
                return Err(CatalogError::InvalidAttemptCutover(self.id));
            }
        }
        Ok(())
    }

    /// The attempt policy cutover, only when both dates are configured.
    #[must_use]
    pub fn attempt_cutover(&self) -> Option<AttemptCutover> {
        match (self.exam_attempts_first_date, self.exam_attempts_second_date) {
            (Some(first_date), Some(second_date)) => Some(AttemptCutover {
                first_date,
                second_date,
            }),
            _ => None,
        }
    }
}

//
// ─── COURSE ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: CourseId,
    pub program_id: ProgramId,
    pub title: String,
    pub position_in_program: u32,
}

impl Course {
    #[must_use]
    pub fn new(
        id: CourseId,
        program_id: ProgramId,
        title: impl Into<String>,
        position_in_program: u32,
    ) -> Self {
        Self {
            id,
            program_id,
            title: title.into(),
            position_in_program,
        }
    }

    /// # Errors
    ///
    /// Returns `CatalogError::EmptyTitle` if the title is blank.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.title.trim().is_empty() {
            return Err(CatalogError::EmptyTitle);
        }
        Ok(())
    }
}

//
// ─── COURSE RUN ────────────────────────────────────────────────────────────────
//

/// One scheduled offering of a course, with its own calendar and the key the
/// remote learning platform knows it by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseRun {
    pub id: CourseRunId,
    pub course_id: CourseId,
    pub title: String,
    pub platform_key: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub enrollment_start: Option<DateTime<Utc>>,
    pub enrollment_end: Option<DateTime<Utc>>,
    pub upgrade_deadline: Option<DateTime<Utc>>,
    pub freeze_grade_date: Option<DateTime<Utc>>,
    pub is_discontinued: bool,
}

impl CourseRun {
    /// A run with no calendar yet.
    #[must_use]
    pub fn new(id: CourseRunId, course_id: CourseId, title: impl Into<String>) -> Self {
        Self {
            id,
            course_id,
            title: title.into(),
            platform_key: None,
            start_date: None,
            end_date: None,
            enrollment_start: None,
            enrollment_end: None,
            upgrade_deadline: None,
            freeze_grade_date: None,
            is_discontinued: false,
        }
    }

    #[must_use]
    pub fn with_platform_key(mut self, key: impl Into<String>) -> Self {
        self.platform_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_dates(
        mut self,
        start_date: Option<DateTime<Utc>>,
        end_date: Option<DateTime<Utc>>,
    ) -> Self {
        self.start_date = start_date;
        self.end_date = end_date;
        self
    }

    /// # Errors
    ///
    /// Returns `CatalogError` for a blank title or platform key, or inverted
    /// run / enrollment windows.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.title.trim().is_empty() {
            return Err(CatalogError::EmptyTitle);
        }
        if self
            .platform_key
            .as_deref()
            .is_some_and(|key| key.trim().is_empty())
        {
            return Err(CatalogError::BlankPlatformKey(self.id));
        }
        if matches!((self.start_date, self.end_date), (Some(start), Some(end)) if end < start) {
            return Err(CatalogError::InvalidRunDates(self.id));
        }
        if matches!(
            (self.enrollment_start, self.enrollment_end),
            (Some(open), Some(close)) if close < open
        ) {
            return Err(CatalogError::InvalidEnrollmentWindow(self.id));
        }
        Ok(())
    }

    /// Started and not yet ended.
    #[must_use]
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.start_date.is_some_and(|start| start <= now)
            && self.end_date.is_none_or(|end| end > now)
    }

    #[must_use]
    pub fn is_past(&self, now: DateTime<Utc>) -> bool {
        self.end_date.is_some_and(|end| end <= now)
    }

    #[must_use]
    pub fn is_future(&self, now: DateTime<Utc>) -> bool {
        self.start_date.is_some_and(|start| start > now)
    }

    /// No upgrade deadline, or one that has not passed yet.
    #[must_use]
    pub fn is_upgradable(&self, now: DateTime<Utc>) -> bool {
        self.upgrade_deadline.is_none_or(|deadline| deadline > now)
    }

    #[must_use]
    pub fn can_freeze_grades(&self, now: DateTime<Utc>) -> bool {
        self.freeze_grade_date.is_some_and(|date| date <= now)
    }

    /// Whether a learner could still enroll in this run.
    #[must_use]
    pub fn is_offerable(&self, now: DateTime<Utc>) -> bool {
        !self.is_discontinued
            && self.start_date.is_some()
            && self.end_date.is_none_or(|end| end > now)
            && self.enrollment_end.is_none_or(|close| close > now)
    }
}

/// Picks the run a learner would be offered next: the earliest-starting
/// offerable run of the course.
#[must_use]
pub fn next_offerable_run<'a, I>(runs: I, now: DateTime<Utc>) -> Option<&'a CourseRun>
where
    I: IntoIterator<Item = &'a CourseRun>,
{
    runs.into_iter()
        .filter(|run| run.is_offerable(now))
        .min_by_key(|run| (run.start_date, run.id))
}

//
// ─── PRICING ───────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoursePrice {
    pub course_run_id: CourseRunId,
    /// Price in cents.
    pub price: u64,
    pub is_valid: bool,
}

/// A financial-aid income tier and the discount it grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierProgram {
    pub id: TierProgramId,
    pub program_id: ProgramId,
    /// Discount in cents.
    pub discount_amount: u64,
    pub income_threshold: u64,
    pub current: bool,
}

impl TierProgram {
    /// The tier learners land in when they never applied for aid.
    #[must_use]
    pub fn is_no_discount(&self) -> bool {
        self.discount_amount == 0 && self.income_threshold == 0
    }
}

//
// ─── EXAM RUN ──────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamRun {
    pub id: ExamRunId,
    pub course_id: CourseId,
    pub date_first_eligible: DateTime<Utc>,
    pub date_last_eligible: DateTime<Utc>,
}

impl ExamRun {
    /// # Errors
    ///
    /// Returns `CatalogError::InvalidEligibilityWindow` if the window is inverted.
    pub fn validate(&self) -> Result<(), CatalogError> {
        if self.date_last_eligible < self.date_first_eligible {
            return Err(CatalogError::InvalidEligibilityWindow(self.id));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_window_open(&self, now: DateTime<Utc>) -> bool {
        self.date_first_eligible <= now && now <= self.date_last_eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::fixed_now;
    use chrono::Duration;

    fn run(id: u64) -> CourseRun {
        CourseRun::new(CourseRunId::new(id), CourseId::new(1), format!("Run {id}"))
    }

    #[test]
    fn calendar_predicates_cover_each_phase() {
        let now = fixed_now();
        let current = run(1).with_dates(Some(now - Duration::weeks(1)), Some(now + Duration::weeks(2)));
        assert!(current.is_current(now));
        assert!(!current.is_past(now));
        assert!(!current.is_future(now));

        let past = run(2).with_dates(Some(now - Duration::weeks(10)), Some(now - Duration::weeks(1)));
        assert!(past.is_past(now));
        assert!(!past.is_current(now));

        let future = run(3).with_dates(Some(now + Duration::weeks(1)), None);
        assert!(future.is_future(now));
        assert!(!future.is_current(now));
    }

    #[test]
    fn open_ended_run_is_current_once_started() {
        let now = fixed_now();
        let ongoing = run(1).with_dates(Some(now - Duration::days(1)), None);
        assert!(ongoing.is_current(now));
        assert!(!ongoing.is_past(now));
    }

    #[test]
    fn upgrade_deadline_controls_upgradability() {
        let now = fixed_now();
        let mut r = run(1);
        assert!(r.is_upgradable(now));
        r.upgrade_deadline = Some(now - Duration::hours(1));
        assert!(!r.is_upgradable(now));
        r.upgrade_deadline = Some(now + Duration::hours(1));
        assert!(r.is_upgradable(now));
    }

    #[test]
    fn freeze_requires_configured_past_date() {
        let now = fixed_now();
        let mut r = run(1);
        assert!(!r.can_freeze_grades(now));
        r.freeze_grade_date = Some(now + Duration::days(1));
        assert!(!r.can_freeze_grades(now));
        r.freeze_grade_date = Some(now - Duration::days(1));
        assert!(r.can_freeze_grades(now));
    }

    #[test]
    fn next_offerable_skips_discontinued_and_closed_runs() {
        let now = fixed_now();
        let mut discontinued = run(1).with_dates(Some(now + Duration::days(1)), None);
        discontinued.is_discontinued = true;
        let mut closed = run(2).with_dates(Some(now + Duration::days(2)), None);
        closed.enrollment_end = Some(now - Duration::days(1));
        let later = run(3).with_dates(Some(now + Duration::days(30)), None);
        let sooner = run(4).with_dates(Some(now + Duration::days(3)), None);
        let ended = run(5).with_dates(Some(now - Duration::days(30)), Some(now - Duration::days(1)));

        let runs = vec![discontinued, closed, later, sooner, ended];
        let next = next_offerable_run(&runs, now).unwrap();
        assert_eq!(next.id, CourseRunId::new(4));
    }

    #[test]
    fn validation_rejects_inverted_dates() {
        let now = fixed_now();
        let bad = run(9).with_dates(Some(now), Some(now - Duration::days(1)));
        assert_eq!(
            bad.validate(),
            Err(CatalogError::InvalidRunDates(CourseRunId::new(9)))
        );

        let mut program = Program::new(ProgramId::new(1), "Data");
        program.exam_attempts_first_date = Some(now);
        program.exam_attempts_second_date = Some(now - Duration::days(1));
        assert_eq!(
            program.validate(),
            Err(CatalogError::InvalidAttemptCutover(ProgramId::new(1)))
        );
    }

    #[test]
    fn cutover_requires_both_dates() {
        let now = fixed_now();
        let mut program = Program::new(ProgramId::new(1), "Data");
        program.exam_attempts_first_date = Some(now);
        assert!(program.attempt_cutover().is_none());
        program.exam_attempts_second_date = Some(now + Duration::days(10));
        assert!(program.attempt_cutover().is_some());
    }
}
