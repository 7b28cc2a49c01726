use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{CourseRunId, UserId};

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum FinalGradeError {
    #[error("grade must be within 0.0..=1.0, got {0}")]
    OutOfRange(f64),

    #[error("unknown final grade status: {0}")]
    UnknownStatus(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalGradeStatus {
    Pending,
    Complete,
}

impl FinalGradeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FinalGradeStatus::Pending => "pending",
            FinalGradeStatus::Complete => "complete",
        }
    }
}

impl fmt::Display for FinalGradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FinalGradeStatus {
    type Err = FinalGradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FinalGradeStatus::Pending),
            "complete" => Ok(FinalGradeStatus::Complete),
            other => Err(FinalGradeError::UnknownStatus(other.to_string())),
        }
    }
}

/// The frozen outcome of one learner in one course run.
///
/// Once `status` is `Complete` the grade, pass flag and payment flag are
/// never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalGrade {
    pub user_id: UserId,
    pub course_run_id: CourseRunId,
    /// Fraction in 0.0..=1.0.
    pub grade: f64,
    pub passed: bool,
    pub status: FinalGradeStatus,
    pub paid_on_platform: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FinalGrade {
    /// Build a complete final grade.
    ///
    /// # Errors
    ///
    /// Returns `FinalGradeError::OutOfRange` if `grade` is not a fraction.
    pub fn complete(
        user_id: UserId,
        course_run_id: CourseRunId,
        grade: f64,
        passed: bool,
        paid_on_platform: bool,
        now: DateTime<Utc>,
    ) -> Result<Self, FinalGradeError> {
        if !grade.is_finite() || !(0.0..=1.0).contains(&grade) {
            return Err(FinalGradeError::OutOfRange(grade));
        }
        Ok(Self {
            user_id,
            course_run_id,
            grade,
            passed,
            status: FinalGradeStatus::Complete,
            paid_on_platform,
            created_at: now,
            updated_at: now,
        })
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.status == FinalGradeStatus::Complete
    }

    /// Grade on the 0–100 scale used by the dashboard.
    #[must_use]
    pub fn percent(&self) -> f64 {
        self.grade * 100.0
    }
}

/// Batch-freeze bookkeeping for a whole course run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradingStatus {
    Pending,
    Complete,
}

impl GradingStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GradingStatus::Pending => "pending",
            GradingStatus::Complete => "complete",
        }
    }
}

impl FromStr for GradingStatus {
    type Err = FinalGradeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GradingStatus::Pending),
            "complete" => Ok(GradingStatus::Complete),
            other => Err(FinalGradeError::UnknownStatus(other.to_string())),
        }
    }
}
