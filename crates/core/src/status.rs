//! Course-run status resolution.
//!
//! Everything here is pure: the caller supplies per-run facts (enrolled,
//! counted as paid, passed) and a point in time, and gets back the statuses a
//! dashboard shows for one course.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{CourseRun, CourseRunId, next_offerable_run};

/// Status of one course run for one learner.
///
/// `NotEnrolled` only exists between resolution and formatting; it is never
/// shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    NotEnrolled,
    CurrentlyEnrolled,
    Passed,
    WillAttend,
    CanUpgrade,
    NotPassed,
    Offered,
    NotActionable,
    MissedDeadline,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotEnrolled => "not-enrolled",
            RunStatus::CurrentlyEnrolled => "currently-enrolled",
            RunStatus::Passed => "passed",
            RunStatus::WillAttend => "will-attend",
            RunStatus::CanUpgrade => "can-upgrade",
            RunStatus::NotPassed => "not-passed",
            RunStatus::Offered => "offered",
            RunStatus::NotActionable => "not-actionable",
            RunStatus::MissedDeadline => "missed-deadline",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the progress facade knows about a learner and one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunFacts {
    pub enrolled: bool,
    /// Enrolled and paid in the program's sense.
    pub enrolled_and_paid: bool,
    pub passed: bool,
}

/// Status of a single run, without looking at sibling runs.
#[must_use]
pub fn resolve_run_status(run: &CourseRun, facts: RunFacts, now: DateTime<Utc>) -> RunStatus {
    if !facts.enrolled {
        return RunStatus::NotEnrolled;
    }

    if facts.enrolled_and_paid {
        if run.is_current(now) {
            RunStatus::CurrentlyEnrolled
        } else if run.is_past(now) {
            if facts.passed {
                RunStatus::Passed
            } else {
                RunStatus::NotPassed
            }
        } else if run.is_future(now) {
            RunStatus::WillAttend
        } else {
            // no start date: nothing the learner can act on yet
            RunStatus::NotActionable
        }
    } else if run.is_current(now) || run.is_future(now) {
        if run.is_upgradable(now) {
            RunStatus::CanUpgrade
        } else {
            RunStatus::MissedDeadline
        }
    } else {
        RunStatus::NotActionable
    }
}

/// A run paired with the status to display for it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRun<'a> {
    pub run: &'a CourseRun,
    pub status: RunStatus,
}

/// Most recent first: later end dates first, open-ended runs before all.
fn by_recency(a: &CourseRun, b: &CourseRun) -> Ordering {
    match (a.end_date, b.end_date) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => y.cmp(&x),
    }
    .then_with(|| b.start_date.cmp(&a.start_date))
    .then_with(|| b.id.cmp(&a.id))
}

/// Resolve the statuses shown for one course.
///
/// Only the most recent enrolled run can be actionable. When it failed in any
/// way, the course's next offerable run (if different) is appended as
/// `Offered`. Older enrolled runs are reported as passed or not passed.
/// Without any enrollment, only the next offerable run is reported.
pub fn resolve_course_runs<'a, F>(
    runs: &'a [CourseRun],
    facts_for: F,
    now: DateTime<Utc>,
) -> Vec<ResolvedRun<'a>>
where
    F: Fn(&CourseRun) -> RunFacts,
{
    let mut enrolled: Vec<(&CourseRun, RunStatus, RunFacts)> = runs
        .iter()
        .filter(|run| !run.is_discontinued)
        .filter_map(|run| {
            let facts = facts_for(run);
            match resolve_run_status(run, facts, now) {
                RunStatus::NotEnrolled => None,
                status => Some((run, status, facts)),
            }
        })
        .collect();
    enrolled.sort_by(|a, b| by_recency(a.0, b.0));

    let mut out = CourseRunsOut::default();

    let Some((&(latest, latest_status, _), older)) = enrolled.split_first() else {
        if let Some(next) = next_offerable_run(runs, now) {
            out.push(next, RunStatus::Offered);
        }
        return out.runs;
    };

    match latest_status {
        RunStatus::CurrentlyEnrolled | RunStatus::CanUpgrade | RunStatus::Passed => {
            out.push(latest, latest_status);
        }
        RunStatus::WillAttend => out.push(latest, RunStatus::CurrentlyEnrolled),
        RunStatus::NotPassed | RunStatus::NotActionable | RunStatus::MissedDeadline => {
            let shown = if latest_status == RunStatus::MissedDeadline {
                RunStatus::MissedDeadline
            } else {
                RunStatus::NotPassed
            };
            out.push(latest, shown);
            let others = runs.iter().filter(|run| run.id != latest.id);
            if let Some(next) = next_offerable_run(others, now) {
                out.push(next, RunStatus::Offered);
            }
        }
        RunStatus::NotEnrolled | RunStatus::Offered => {}
    }

    for &(run, _, facts) in older {
        let status = if facts.passed {
            RunStatus::Passed
        } else {
            RunStatus::NotPassed
        };
        out.push(run, status);
    }

    out.runs
}

/// Output accumulator that keeps the first status given to each run.
#[derive(Default)]
struct CourseRunsOut<'a> {
    seen: HashSet<CourseRunId>,
    runs: Vec<ResolvedRun<'a>>,
}

impl<'a> CourseRunsOut<'a> {
    fn push(&mut self, run: &'a CourseRun, status: RunStatus) {
        if self.seen.insert(run.id) {
            self.runs.push(ResolvedRun { run, status });
        }
    }
}
