use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::ids::{CourseRunId, UserId};

/// Enrollment modes that mean the learner paid on the platform.
pub const PAID_MODES: [&str; 3] = ["verified", "professional", "no-id-professional"];

/// Returns true when `mode` is one of [`PAID_MODES`].
#[must_use]
pub fn is_paid_mode(mode: &str) -> bool {
    PAID_MODES.contains(&mode)
}

//
// ─── ERRORS ────────────────────────────────────────────────────────────────────
//

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PayloadError {
    #[error("unknown cache kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {reason}")]
    Malformed { kind: CacheKind, reason: String },
}

//
// ─── KIND ──────────────────────────────────────────────────────────────────────
//

/// The three kinds of remote data mirrored per course run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Enrollment,
    Certificate,
    CurrentGrade,
}

/// Decoder signature used by the kind lookup table.
type Decoder = fn(Value) -> Result<CachedPayload, PayloadError>;

impl CacheKind {
    /// Refresh order: certificate and grade refreshes read active enrollments.
    pub const ALL: [CacheKind; 3] = [
        CacheKind::Enrollment,
        CacheKind::Certificate,
        CacheKind::CurrentGrade,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CacheKind::Enrollment => "enrollment",
            CacheKind::Certificate => "certificate",
            CacheKind::CurrentGrade => "current_grade",
        }
    }

    fn decoder(self) -> Decoder {
        match self {
            CacheKind::Enrollment => |value| {
                decode_as::<EnrollmentData>(CacheKind::Enrollment, value)
                    .map(CachedPayload::Enrollment)
            },
            CacheKind::Certificate => |value| {
                decode_as::<CertificateData>(CacheKind::Certificate, value)
                    .map(CachedPayload::Certificate)
            },
            CacheKind::CurrentGrade => |value| {
                decode_as::<CurrentGradeData>(CacheKind::CurrentGrade, value)
                    .map(CachedPayload::CurrentGrade)
            },
        }
    }

    /// Decode a raw payload stored under this kind.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError::Malformed` if the JSON does not have the shape
    /// expected for the kind.
    pub fn decode(self, value: Value) -> Result<CachedPayload, PayloadError> {
        (self.decoder())(value)
    }
}

fn decode_as<T: for<'de> Deserialize<'de>>(
    kind: CacheKind,
    value: Value,
) -> Result<T, PayloadError> {
    serde_json::from_value(value).map_err(|e| PayloadError::Malformed {
        kind,
        reason: e.to_string(),
    })
}

impl fmt::Display for CacheKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheKind {
    type Err = PayloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrollment" => Ok(CacheKind::Enrollment),
            "certificate" => Ok(CacheKind::Certificate),
            "current_grade" => Ok(CacheKind::CurrentGrade),
            other => Err(PayloadError::UnknownKind(other.to_string())),
        }
    }
}

//
// ─── PAYLOADS ──────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentData {
    pub course_key: String,
    pub is_active: bool,
    pub mode: String,
}

impl EnrollmentData {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        is_paid_mode(&self.mode)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertificateData {
    pub course_key: String,
    /// Enrollment mode the certificate was issued under.
    pub certificate_type: String,
    pub status: String,
    /// Grade in 0.0..=1.0.
    pub grade: f64,
    #[serde(default)]
    pub download_url: Option<String>,
}

impl CertificateData {
    #[must_use]
    pub fn is_verified(&self) -> bool {
        is_paid_mode(&self.certificate_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentGradeData {
    pub course_key: String,
    /// Fraction in 0.0..=1.0.
    pub percent: f64,
    pub passed: bool,
    #[serde(default)]
    pub letter_grade: Option<String>,
}

/// A decoded cache payload, tagged by kind.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedPayload {
    Enrollment(EnrollmentData),
    Certificate(CertificateData),
    CurrentGrade(CurrentGradeData),
}

//
// ─── RECORD ────────────────────────────────────────────────────────────────────
//

/// One remote-platform record snapshotted locally.
///
/// `payload == None` means the platform confirmed there is nothing for this
/// run, which is different from "never asked".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub user_id: UserId,
    pub course_run_id: CourseRunId,
    pub kind: CacheKind,
    pub payload: Option<Value>,
    pub last_request: DateTime<Utc>,
}

impl CachedRecord {
    /// Decode the payload through the kind lookup table.
    ///
    /// # Errors
    ///
    /// Returns `PayloadError` if the stored JSON is malformed for its kind.
    pub fn decode(&self) -> Result<Option<CachedPayload>, PayloadError> {
        self.payload
            .clone()
            .map(|value| self.kind.decode(value))
            .transpose()
    }

    /// # Errors
    ///
    /// Returns `PayloadError` if the record is not an enrollment or is malformed.
    pub fn enrollment(&self) -> Result<Option<EnrollmentData>, PayloadError> {
        match self.decode()? {
            Some(CachedPayload::Enrollment(data)) => Ok(Some(data)),
            Some(_) => Err(self.wrong_kind(CacheKind::Enrollment)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns `PayloadError` if the record is not a certificate or is malformed.
    pub fn certificate(&self) -> Result<Option<CertificateData>, PayloadError> {
        match self.decode()? {
            Some(CachedPayload::Certificate(data)) => Ok(Some(data)),
            Some(_) => Err(self.wrong_kind(CacheKind::Certificate)),
            None => Ok(None),
        }
    }

    /// # Errors
    ///
    /// Returns `PayloadError` if the record is not a current grade or is malformed.
    pub fn current_grade(&self) -> Result<Option<CurrentGradeData>, PayloadError> {
        match self.decode()? {
            Some(CachedPayload::CurrentGrade(data)) => Ok(Some(data)),
            Some(_) => Err(self.wrong_kind(CacheKind::CurrentGrade)),
            None => Ok(None),
        }
    }

    fn wrong_kind(&self, expected: CacheKind) -> PayloadError {
        PayloadError::Malformed {
            kind: expected,
            reason: format!("record holds {} data", self.kind),
        }
    }
}

//
// ─── REFRESH MARKER ────────────────────────────────────────────────────────────
//

/// Time of the last committed refresh of each kind for one user.
///
/// A missing timestamp means the kind was never refreshed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheRefreshMarker {
    pub user_id: UserId,
    pub enrollment: Option<DateTime<Utc>>,
    pub certificate: Option<DateTime<Utc>>,
    pub current_grade: Option<DateTime<Utc>>,
}

impl CacheRefreshMarker {
    #[must_use]
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            enrollment: None,
            certificate: None,
            current_grade: None,
        }
    }

    #[must_use]
    pub fn refreshed_at(&self, kind: CacheKind) -> Option<DateTime<Utc>> {
        match kind {
            CacheKind::Enrollment => self.enrollment,
            CacheKind::Certificate => self.certificate,
            CacheKind::CurrentGrade => self.current_grade,
        }
    }

    pub fn set(&mut self, kind: CacheKind, at: DateTime<Utc>) {
        let slot = match kind {
            CacheKind::Enrollment => &mut self.enrollment,
            CacheKind::Certificate => &mut self.certificate,
            CacheKind::CurrentGrade => &mut self.current_grade,
        };
        *slot = Some(at);
    }
}
