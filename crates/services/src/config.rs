use std::env;
use std::time::Duration as StdDuration;

use chrono::Duration;
use progress_core::model::CacheKind;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("{name} must be a positive integer, got {raw:?}")]
    InvalidNumber { name: &'static str, raw: String },
    #[error("{name} must be greater than zero")]
    Zero { name: &'static str },
    #[error("invalid remote base url {raw:?}: {reason}")]
    InvalidUrl { raw: String, reason: String },
}

/// How long each kind of cached remote data stays fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessWindows {
    pub enrollment: Duration,
    pub certificate: Duration,
    pub current_grade: Duration,
}

impl StalenessWindows {
    #[must_use]
    pub fn for_kind(&self, kind: CacheKind) -> Duration {
        match kind {
            CacheKind::Enrollment => self.enrollment,
            CacheKind::Certificate => self.certificate,
            CacheKind::CurrentGrade => self.current_grade,
        }
    }
}

impl Default for StalenessWindows {
    fn default() -> Self {
        Self {
            enrollment: Duration::minutes(5),
            certificate: Duration::hours(6),
            current_grade: Duration::hours(1),
        }
    }
}

/// Batch refresh tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub chunk_size: usize,
    pub lock_ttl: Duration,
    /// Users with this many consecutive failures are skipped.
    pub max_refresh_failures: u32,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chunk_size: 50,
            lock_ttl: Duration::minutes(30),
            max_refresh_failures: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub staleness: StalenessWindows,
    /// Validated, without a trailing slash.
    pub remote_base_url: String,
    pub remote_timeout: StdDuration,
    pub batch: BatchConfig,
}

const DEFAULT_REMOTE_BASE_URL: &str = "http://localhost:18000";
const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 20;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staleness: StalenessWindows::default(),
            remote_base_url: DEFAULT_REMOTE_BASE_URL.to_string(),
            remote_timeout: StdDuration::from_secs(DEFAULT_REMOTE_TIMEOUT_SECS),
            batch: BatchConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read `PROGRESS_*` variables, falling back to defaults for unset ones.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when a variable is set but not a positive number,
    /// or the remote base URL does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Same as [`EngineConfig::from_env`] over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`EngineConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |name: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match lookup(name) {
                None => Ok(default),
                Some(raw) => {
                    let value = positive(name, &raw)?;
                    i64::try_from(value)
                        .ok()
                        .and_then(Duration::try_seconds)
                        .ok_or(ConfigError::InvalidNumber { name, raw })
                }
            }
        };

        let staleness = StalenessWindows {
            enrollment: secs(
                "PROGRESS_ENROLLMENT_STALENESS_SECS",
                defaults.staleness.enrollment,
            )?,
            certificate: secs(
                "PROGRESS_CERTIFICATE_STALENESS_SECS",
                defaults.staleness.certificate,
            )?,
            current_grade: secs(
                "PROGRESS_CURRENT_GRADE_STALENESS_SECS",
                defaults.staleness.current_grade,
            )?,
        };

        let remote_base_url = match lookup("PROGRESS_REMOTE_BASE_URL") {
            None => defaults.remote_base_url,
            Some(raw) => {
                let url = Url::parse(raw.trim()).map_err(|e| ConfigError::InvalidUrl {
                    reason: e.to_string(),
                    raw: raw.clone(),
                })?;
                if url.cannot_be_a_base() {
                    return Err(ConfigError::InvalidUrl {
                        raw,
                        reason: "not a base url".into(),
                    });
                }
                url.as_str().trim_end_matches('/').to_string()
            }
        };

        let remote_timeout = match lookup("PROGRESS_REMOTE_TIMEOUT_SECS") {
            None => defaults.remote_timeout,
            Some(raw) => StdDuration::from_secs(positive("PROGRESS_REMOTE_TIMEOUT_SECS", &raw)?),
        };

        let chunk_size = match lookup("PROGRESS_BATCH_CHUNK_SIZE") {
            None => defaults.batch.chunk_size,
            Some(raw) => {
                let value = positive("PROGRESS_BATCH_CHUNK_SIZE", &raw)?;
                usize::try_from(value).map_err(|_| ConfigError::InvalidNumber {
                    name: "PROGRESS_BATCH_CHUNK_SIZE",
                    raw,
                })?
            }
        };

        let max_refresh_failures = match lookup("PROGRESS_MAX_REFRESH_FAILURES") {
            None => defaults.batch.max_refresh_failures,
            Some(raw) => {
                let value = positive("PROGRESS_MAX_REFRESH_FAILURES", &raw)?;
                u32::try_from(value).map_err(|_| ConfigError::InvalidNumber {
                    name: "PROGRESS_MAX_REFRESH_FAILURES",
                    raw,
                })?
            }
        };

        Ok(Self {
            staleness,
            remote_base_url,
            remote_timeout,
            batch: BatchConfig {
                chunk_size,
                lock_ttl: secs("PROGRESS_BATCH_LOCK_TTL_SECS", defaults.batch.lock_ttl)?,
                max_refresh_failures,
            },
        })
    }
}

fn positive(name: &'static str, raw: &str) -> Result<u64, ConfigError> {
    let value = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber {
            name,
            raw: raw.to_string(),
        })?;
    if value == 0 {
        return Err(ConfigError::Zero { name });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.staleness.enrollment, Duration::minutes(5));
        assert_eq!(config.staleness.certificate, Duration::hours(6));
        assert_eq!(config.staleness.current_grade, Duration::hours(1));
    }

    #[test]
    fn overrides_are_read() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PROGRESS_ENROLLMENT_STALENESS_SECS", "60"),
            ("PROGRESS_REMOTE_BASE_URL", "https://lms.example.org/"),
            ("PROGRESS_BATCH_CHUNK_SIZE", "7"),
        ]))
        .unwrap();
        assert_eq!(config.staleness.for_kind(CacheKind::Enrollment), Duration::seconds(60));
        assert_eq!(config.remote_base_url, "https://lms.example.org");
        assert_eq!(config.batch.chunk_size, 7);
    }

    #[test]
    fn zero_and_garbage_are_rejected() {
        assert_eq!(
            EngineConfig::from_lookup(lookup(&[("PROGRESS_REMOTE_TIMEOUT_SECS", "0")])),
            Err(ConfigError::Zero {
                name: "PROGRESS_REMOTE_TIMEOUT_SECS"
            })
        );
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("PROGRESS_BATCH_CHUNK_SIZE", "lots")])),
            Err(ConfigError::InvalidNumber { .. })
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("PROGRESS_REMOTE_BASE_URL", "not a url")])),
            Err(ConfigError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn out_of_range_durations_are_rejected() {
        let result = EngineConfig::from_lookup(lookup(&[(
            "PROGRESS_ENROLLMENT_STALENESS_SECS",
            "9223372036854775807",
        )]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidNumber {
                name: "PROGRESS_ENROLLMENT_STALENESS_SECS",
                ..
            })
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[(
                "PROGRESS_BATCH_LOCK_TTL_SECS",
                "18446744073709551615"
            )])),
            Err(ConfigError::InvalidNumber { .. })
        ));
    }
}
