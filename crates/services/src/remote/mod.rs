//! Access to the external learning-record platform.

mod http;

use async_trait::async_trait;
use progress_core::model::{CertificateData, CurrentGradeData, EnrollmentData, PlatformUser};

use crate::error::RemoteError;

pub use http::HttpRemoteClient;

/// The three reads the cache needs from the platform.
///
/// Each call returns the records that exist; a run key missing from the
/// result means the platform has nothing for it.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Every enrollment the platform knows for the learner.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::InvalidCredential` when the token is rejected,
    /// `RemoteError::Unavailable` for any other failure.
    async fn fetch_enrollments(&self, user: &PlatformUser)
    -> Result<Vec<EnrollmentData>, RemoteError>;

    /// Certificates for the given run keys.
    ///
    /// # Errors
    ///
    /// See [`RemoteClient::fetch_enrollments`].
    async fn fetch_certificates(
        &self,
        user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CertificateData>, RemoteError>;

    /// Current grades for the given run keys.
    ///
    /// # Errors
    ///
    /// See [`RemoteClient::fetch_enrollments`].
    async fn fetch_current_grades(
        &self,
        user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CurrentGradeData>, RemoteError>;
}
