//! Proctored-exam attempt arithmetic.
//!
//! Payments made before the program's first cutover date granted two
//! attempts each. From the second cutover date onward every payment grants
//! one attempt, and double attempts left over from the old policy carry
//! forward at half rate.

use chrono::{DateTime, Utc};

use crate::model::AttemptCutover;

/// Attempts granted per payment under the old policy.
pub const ATTEMPTS_PER_OLD_PAYMENT: i64 = 2;

/// Result of counting attempts for one learner and course.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptTally {
    pub remaining: i64,
    /// More attempts were consumed before the second cutover than old
    /// payments could have granted.
    pub inconsistent_history: bool,
}

fn count(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

/// Count remaining attempts from payment dates and the dates of consumed
/// attempts.
///
/// Without a configured cutover every payment is worth one attempt.
#[must_use]
pub fn remaining_attempts(
    cutover: Option<AttemptCutover>,
    payment_dates: &[DateTime<Utc>],
    attempt_dates: &[DateTime<Utc>],
) -> AttemptTally {
    let total_payments = count(payment_dates.len());
    let total_attempts = count(attempt_dates.len());

    let Some(cutover) = cutover else {
        return AttemptTally {
            remaining: total_payments - total_attempts,
            inconsistent_history: false,
        };
    };

    let old_payments = count(
        payment_dates
            .iter()
            .filter(|paid_at| **paid_at < cutover.first_date)
            .count(),
    );
    let new_payments = total_payments - old_payments;
    let old_attempts = count(
        attempt_dates
            .iter()
            .filter(|taken_at| **taken_at < cutover.second_date)
            .count(),
    );
    let new_attempts = total_attempts - old_attempts;

    let unused_double = old_payments * ATTEMPTS_PER_OLD_PAYMENT - old_attempts;
    match unused_double {
        n if n > 0 => AttemptTally {
            remaining: new_payments - new_attempts + n / 2,
            inconsistent_history: false,
        },
        0 => AttemptTally {
            remaining: new_payments - new_attempts,
            inconsistent_history: false,
        },
        _ => AttemptTally {
            remaining: new_payments
                - (total_attempts - old_payments * ATTEMPTS_PER_OLD_PAYMENT),
            inconsistent_history: true,
        },
    }
}
