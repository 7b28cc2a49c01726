use std::time::Duration;

use async_trait::async_trait;
use futures::future::try_join_all;
use progress_core::model::{CertificateData, CurrentGradeData, EnrollmentData, PlatformUser};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use super::RemoteClient;
use crate::error::{EngineError, RemoteError};

/// `RemoteClient` speaking the platform's REST API with the learner's bearer
/// token.
#[derive(Clone)]
pub struct HttpRemoteClient {
    client: Client,
    base_url: String,
}

impl HttpRemoteClient {
    /// # Errors
    ///
    /// Returns `EngineError::Http` if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, EngineError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, RemoteError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| RemoteError::Unavailable("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// GET a JSON body; `Ok(None)` when the platform answers 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        user: &PlatformUser,
        url: Url,
    ) -> Result<Option<T>, RemoteError> {
        debug!(user_id = %user.id, url = %url, "remote request");
        let response = self
            .client
            .get(url)
            .bearer_auth(&user.access_token)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        check_status(status)?;

        let body = response.json::<T>().await.map_err(transport)?;
        Ok(Some(body))
    }
}

fn check_status(status: StatusCode) -> Result<(), RemoteError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(RemoteError::InvalidCredential),
        s => Err(RemoteError::Unavailable(format!("unexpected status {s}"))),
    }
}

fn transport(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Unavailable("request timed out".into())
    } else if err.is_decode() {
        RemoteError::Unavailable(format!("malformed response: {err}"))
    } else {
        RemoteError::Unavailable(err.to_string())
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn fetch_enrollments(
        &self,
        user: &PlatformUser,
    ) -> Result<Vec<EnrollmentData>, RemoteError> {
        let mut url = self.endpoint(&["api", "enrollment", "v1", "enrollment"])?;
        url.query_pairs_mut().append_pair("user", &user.username);
        let wire: Option<Vec<WireEnrollment>> = self.get_json(user, url).await?;
        Ok(wire
            .unwrap_or_default()
            .into_iter()
            .map(EnrollmentData::from)
            .collect())
    }

    async fn fetch_certificates(
        &self,
        user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CertificateData>, RemoteError> {
        let requests = run_keys.iter().map(|key| async move {
            let url = self.endpoint(&[
                "api",
                "certificates",
                "v0",
                "certificates",
                user.username.as_str(),
                "courses",
                key.as_str(),
                "",
            ])?;
            let wire: Option<WireCertificate> = self.get_json(user, url).await?;
            wire.map(CertificateData::try_from).transpose()
        });
        let found = try_join_all(requests).await?;
        Ok(found.into_iter().flatten().collect())
    }

    async fn fetch_current_grades(
        &self,
        user: &PlatformUser,
        run_keys: &[String],
    ) -> Result<Vec<CurrentGradeData>, RemoteError> {
        let requests = run_keys.iter().map(|key| async move {
            let mut url = self.endpoint(&["api", "grades", "v1", "courses", key.as_str(), ""])?;
            url.query_pairs_mut().append_pair("username", &user.username);
            let wire: Option<Vec<WireGrade>> = self.get_json(user, url).await?;
            Ok::<_, RemoteError>(wire.and_then(|rows| rows.into_iter().next()))
        });
        let found = try_join_all(requests).await?;
        Ok(found
            .into_iter()
            .flatten()
            .map(CurrentGradeData::from)
            .collect())
    }
}

//
// ─── WIRE SHAPES ───────────────────────────────────────────────────────────────
//

#[derive(Debug, Deserialize)]
struct WireCourseDetails {
    course_id: String,
}

#[derive(Debug, Deserialize)]
struct WireEnrollment {
    course_details: WireCourseDetails,
    is_active: bool,
    mode: String,
}

impl From<WireEnrollment> for EnrollmentData {
    fn from(wire: WireEnrollment) -> Self {
        Self {
            course_key: wire.course_details.course_id,
            is_active: wire.is_active,
            mode: wire.mode,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireCertificate {
    course_id: String,
    certificate_type: String,
    status: String,
    /// Sent as a decimal string, e.g. `"0.82"`.
    grade: String,
    #[serde(default)]
    download_url: Option<String>,
}

impl TryFrom<WireCertificate> for CertificateData {
    type Error = RemoteError;

    fn try_from(wire: WireCertificate) -> Result<Self, Self::Error> {
        let grade = wire.grade.trim().parse::<f64>().map_err(|_| {
            RemoteError::Unavailable(format!(
                "malformed certificate grade {:?} for {}",
                wire.grade, wire.course_id
            ))
        })?;
        Ok(Self {
            course_key: wire.course_id,
            certificate_type: wire.certificate_type,
            status: wire.status,
            grade,
            download_url: wire.download_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireGrade {
    course_id: String,
    percent: f64,
    passed: bool,
    #[serde(default)]
    letter_grade: Option<String>,
}

impl From<WireGrade> for CurrentGradeData {
    fn from(wire: WireGrade) -> Self {
        Self {
            course_key: wire.course_id,
            percent: wire.percent,
            passed: wire.passed,
            letter_grade: wire.letter_grade,
        }
    }
}
