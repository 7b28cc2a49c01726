//! Program progress as the dashboard renders it.

use chrono::{DateTime, Utc};
use progress_core::model::{
    CourseId, CourseRun, CourseRunId, FinancialAidStatus, PlatformUser, ProgramId,
};
use progress_core::status::{RunStatus, resolve_course_runs};
use serde::Serialize;
use tracing::warn;

use crate::error::ProgressError;
use crate::facade::{ProgressFacade, ProgressReader, Viewer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormattedRun {
    pub run_id: CourseRunId,
    pub title: String,
    pub platform_key: Option<String>,
    pub status: RunStatus,
    /// Order of the run within its course's list.
    pub position: usize,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub final_grade: Option<f64>,
    pub current_grade: Option<f64>,
    pub certificate_url: Option<String>,
    /// Cents; only for runs the learner can still pay for.
    pub price: Option<u64>,
    pub has_paid: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CourseProgress {
    pub course_id: CourseId,
    pub title: String,
    pub position_in_program: u32,
    pub runs: Vec<FormattedRun>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramProgress {
    pub program_id: ProgramId,
    pub title: String,
    pub financial_aid_availability: bool,
    pub financial_aid_status: Option<FinancialAidStatus>,
    pub courses_passed: usize,
    pub courses: Vec<CourseProgress>,
}

/// Build the learner's snapshot and format it.
///
/// # Errors
///
/// Returns `ProgressError` if the snapshot cannot be built.
pub async fn get_program_progress(
    reader: &ProgressReader,
    user: &PlatformUser,
    program: ProgramId,
    viewer: Viewer,
) -> Result<ProgramProgress, ProgressError> {
    let facade = reader.build(user, program, viewer).await?;
    Ok(format_program(&facade))
}

/// Resolve and format every course of the facade's program.
#[must_use]
pub fn format_program(facade: &ProgressFacade) -> ProgramProgress {
    let program = facade.program();
    let courses = facade
        .courses()
        .iter()
        .map(|course| {
            let resolved = resolve_course_runs(
                facade.runs_of(course.id),
                |run| facade.run_facts(run),
                facade.now(),
            );
            let runs = resolved
                .iter()
                .filter_map(|resolved| format_run(facade, resolved.run, resolved.status))
                .enumerate()
                .map(|(position, run)| FormattedRun { position, ..run })
                .collect();
            CourseProgress {
                course_id: course.id,
                title: course.title.clone(),
                position_in_program: course.position_in_program,
                runs,
            }
        })
        .collect();

    ProgramProgress {
        program_id: program.id,
        title: program.title.clone(),
        financial_aid_availability: program.financial_aid_availability,
        financial_aid_status: facade.financial_aid_status(),
        courses_passed: facade.count_courses_passed(),
        courses,
    }
}

fn format_run(facade: &ProgressFacade, run: &CourseRun, status: RunStatus) -> Option<FormattedRun> {
    let (current_grade, certificate_url, price) = match status {
        RunStatus::Passed => (None, facade.certificate_url(run.id), None),
        RunStatus::CurrentlyEnrolled => (facade.current_grade(run.id), None, None),
        RunStatus::CanUpgrade => (facade.current_grade(run.id), None, facade.price()),
        RunStatus::Offered => (None, None, facade.price()),
        RunStatus::NotPassed | RunStatus::NotActionable | RunStatus::MissedDeadline => {
            (facade.current_grade(run.id), None, None)
        }
        RunStatus::WillAttend | RunStatus::NotEnrolled => {
            warn!(
                user_id = %facade.user(),
                course_run_id = %run.id,
                status = %status,
                "dropping run with a status the dashboard does not show"
            );
            return None;
        }
    };

    Some(FormattedRun {
        run_id: run.id,
        title: run.title.clone(),
        platform_key: run.platform_key.clone(),
        status,
        position: 0,
        start_date: run.start_date,
        end_date: run.end_date,
        final_grade: facade.final_grade(run.id),
        current_grade,
        certificate_url: certificate_url.map(str::to_string),
        price,
        has_paid: facade.has_paid(run.id),
    })
}
