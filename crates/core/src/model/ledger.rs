//! Locally owned financial and exam records the engine reads but never writes.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::ids::{CourseId, ExamRunId, PaymentId, TierProgramId, UserId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown {kind} value: {raw}")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub raw: String,
}

/// Parses and prints a fieldless enum through a fixed string table.
macro_rules! string_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            #[must_use]
            pub fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownVariant {
                        kind: $label,
                        raw: other.to_string(),
                    }),
                }
            }
        }
    };
}

//
// ─── PAYMENTS ──────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Created,
    Fulfilled,
    Failed,
    Refunded,
}

string_enum!(PaymentStatus, "payment status", {
    Created => "created",
    Fulfilled => "fulfilled",
    Failed => "failed",
    Refunded => "refunded",
});

/// One order line paying for a course run, identified by its platform key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub user_id: UserId,
    pub course_key: String,
    pub status: PaymentStatus,
    pub paid_at: DateTime<Utc>,
}

impl Payment {
    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.status == PaymentStatus::Fulfilled
    }
}

//
// ─── FINANCIAL AID ─────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinancialAidStatus {
    Created,
    PendingDocs,
    DocsSent,
    PendingManualApproval,
    Approved,
    AutoApproved,
    Skipped,
    Reset,
}

string_enum!(FinancialAidStatus, "financial aid status", {
    Created => "created",
    PendingDocs => "pending-docs",
    DocsSent => "docs-sent",
    PendingManualApproval => "pending-manual-approval",
    Approved => "approved",
    AutoApproved => "auto-approved",
    Skipped => "skipped",
    Reset => "reset",
});

impl FinancialAidStatus {
    /// Statuses under which the tier discount applies to the learner's price.
    #[must_use]
    pub fn grants_discount(self) -> bool {
        matches!(
            self,
            FinancialAidStatus::Approved | FinancialAidStatus::AutoApproved
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialAid {
    pub user_id: UserId,
    pub tier_program_id: TierProgramId,
    pub status: FinancialAidStatus,
    pub created_at: DateTime<Utc>,
}

//
// ─── EXAM AUTHORIZATIONS ───────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamAuthorizationStatus {
    Success,
    Failure,
}

string_enum!(ExamAuthorizationStatus, "exam authorization status", {
    Success => "success",
    Failure => "failure",
});

/// The right to schedule a proctored exam for a course within an exam run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamAuthorization {
    pub user_id: UserId,
    pub course_id: CourseId,
    pub exam_run_id: ExamRunId,
    pub status: ExamAuthorizationStatus,
    pub exam_taken: bool,
}
