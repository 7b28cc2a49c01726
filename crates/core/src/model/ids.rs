use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Declares a `u64`-backed identifier with the same surface for every entity:
/// `new`/`value`, `Debug` as `Name(n)`, `Display` as `n`, and `FromStr`.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            #[must_use]
            pub fn new(id: u64) -> Self {
                Self(id)
            }

            /// Returns the underlying u64 value
            #[must_use]
            pub fn value(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim()
                    .parse::<u64>()
                    .map($name::new)
                    .map_err(|_| ParseIdError {
                        kind: stringify!($name).to_string(),
                    })
            }
        }
    };
}

define_id!(
    /// Local learner identifier.
    UserId
);
define_id!(
    /// Identifier of a program (a bundle of courses).
    ProgramId
);
define_id!(
    /// Identifier of a course inside a program.
    CourseId
);
define_id!(
    /// Identifier of one scheduled offering of a course.
    CourseRunId
);
define_id!(
    /// Identifier of a proctored exam run.
    ExamRunId
);
define_id!(TierProgramId);
define_id!(PaymentId);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    kind: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {} from string", self.kind)
    }
}

impl std::error::Error for ParseIdError {}

// ─── Tests ─────────────────────────────────────────────────────────────────────
