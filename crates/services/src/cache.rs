//! Per-kind snapshot of a learner's remote platform data.
//!
//! Each kind (enrollments, certificates, current grades) is refreshed as a
//! whole: one record per candidate run, payload or explicit absence, written
//! together with the kind's refresh marker in a single transaction.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use progress_core::model::{
    CacheKind, CacheRefreshMarker, CachedRecord, CourseRun, CourseRunId, PlatformUser, UserId,
};
use serde::Serialize;
use serde_json::Value;
use storage::repository::{CacheEntry, CacheRepository, CatalogRepository, StorageError};
use tracing::{debug, info, warn};

use crate::Clock;
use crate::config::StalenessWindows;
use crate::error::{CacheError, RemoteError};
use crate::events::{EventBus, ProgressEvent};
use crate::remote::RemoteClient;

const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
pub struct RemoteDataCache {
    clock: Clock,
    windows: StalenessWindows,
    remote_timeout: Duration,
    client: Arc<dyn RemoteClient>,
    catalog: Arc<dyn CatalogRepository>,
    repo: Arc<dyn CacheRepository>,
    events: EventBus,
}

impl RemoteDataCache {
    #[must_use]
    pub fn new(
        clock: Clock,
        windows: StalenessWindows,
        client: Arc<dyn RemoteClient>,
        catalog: Arc<dyn CatalogRepository>,
        repo: Arc<dyn CacheRepository>,
    ) -> Self {
        Self {
            clock,
            windows,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            client,
            catalog,
            repo,
            events: EventBus::default(),
        }
    }

    /// Bound every remote call; an elapsed call counts as the platform being
    /// unavailable.
    #[must_use]
    pub fn with_remote_timeout(mut self, timeout: Duration) -> Self {
        self.remote_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    fn marker_is_fresh(&self, marker: &CacheRefreshMarker, kind: CacheKind) -> bool {
        marker
            .refreshed_at(kind)
            .is_some_and(|at| self.clock.elapsed_since(at) < self.windows.for_kind(kind))
    }

    /// True iff `kind` was refreshed for `user` within its staleness window.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` if the marker cannot be read.
    pub async fn is_fresh(&self, user: UserId, kind: CacheKind) -> Result<bool, CacheError> {
        let marker = self.repo.marker(user).await?;
        Ok(self.marker_is_fresh(&marker, kind))
    }

    /// Kinds that need a refresh, in refresh order.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` if the marker cannot be read.
    pub async fn stale_kinds(&self, user: UserId) -> Result<Vec<CacheKind>, CacheError> {
        let marker = self.repo.marker(user).await?;
        Ok(CacheKind::ALL
            .into_iter()
            .filter(|kind| !self.marker_is_fresh(&marker, *kind))
            .collect())
    }

    /// Current records, without ever contacting the platform.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on persistence failures.
    pub async fn records(
        &self,
        user: UserId,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, CacheError> {
        Ok(self.repo.records(user, kind).await?)
    }

    /// Users whose cached enrollment in `run` is active.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::Storage` on persistence failures.
    pub async fn users_enrolled_in_run(&self, run: CourseRunId) -> Result<Vec<UserId>, CacheError> {
        Ok(self.repo.users_enrolled_in_run(run).await?)
    }

    /// Cached records when fresh, otherwise refresh first.
    ///
    /// # Errors
    ///
    /// Returns `CacheError` if a needed refresh fails; nothing is written then.
    pub async fn get_or_refresh(
        &self,
        user: &PlatformUser,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, CacheError> {
        if self.is_fresh(user.id, kind).await? {
            debug!(user_id = %user.id, kind = %kind, "cache fresh");
            return self.records(user.id, kind).await;
        }
        self.refresh(user, kind).await
    }

    /// Replace every record of `kind` for `user` with what the platform
    /// reports now.
    ///
    /// # Errors
    ///
    /// Returns `CacheError::InvalidUpstreamCredential` or
    /// `CacheError::RemoteUnavailable` when the platform call fails, and
    /// `CacheError::Storage` when the snapshot cannot be committed. Records
    /// and marker are untouched in every error case.
    pub async fn refresh(
        &self,
        user: &PlatformUser,
        kind: CacheKind,
    ) -> Result<Vec<CachedRecord>, CacheError> {
        let candidates = self.catalog.candidate_runs().await?;
        let fetched = self.fetch(user, kind, &candidates).await?;

        let entries: Vec<CacheEntry> = candidates
            .iter()
            .filter_map(|run| {
                let key = run.platform_key.as_deref()?;
                Some((run.id, fetched.get(key).cloned()))
            })
            .collect();
        let present = entries.iter().filter(|(_, payload)| payload.is_some()).count();

        let now = self.clock.now();
        self.repo.replace_kind(user.id, kind, &entries, now).await?;
        info!(
            user_id = %user.id,
            kind = %kind,
            records = entries.len(),
            present,
            "cache refreshed"
        );
        self.events.publish(ProgressEvent::CacheRefreshed {
            user_id: user.id,
            kind,
            records: entries.len(),
            at: now,
        });

        self.records(user.id, kind).await
    }

    /// Refresh all kinds unconditionally: enrollments first, because the
    /// other two only ask about actively enrolled runs.
    ///
    /// # Errors
    ///
    /// Returns the first `CacheError`; kinds refreshed before it stay
    /// committed.
    pub async fn refresh_all(&self, user: &PlatformUser) -> Result<(), CacheError> {
        for kind in CacheKind::ALL {
            self.refresh(user, kind).await?;
        }
        Ok(())
    }

    /// Refresh the kinds that are stale and return them.
    ///
    /// # Errors
    ///
    /// See [`RemoteDataCache::refresh_all`].
    pub async fn refresh_all_if_stale(
        &self,
        user: &PlatformUser,
    ) -> Result<Vec<CacheKind>, CacheError> {
        let stale = self.stale_kinds(user.id).await?;
        for kind in &stale {
            self.refresh(user, *kind).await?;
        }
        Ok(stale)
    }

    async fn fetch(
        &self,
        user: &PlatformUser,
        kind: CacheKind,
        candidates: &[CourseRun],
    ) -> Result<HashMap<String, Value>, CacheError> {
        if kind == CacheKind::Enrollment {
            let enrollments = self
                .call(user, kind, self.client.fetch_enrollments(user))
                .await?;
            return index(enrollments, |e| e.course_key.clone());
        }

        let keys = self.active_enrollment_keys(user.id, candidates).await?;
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut fetched = match kind {
            CacheKind::Certificate => {
                let certificates = self
                    .call(user, kind, self.client.fetch_certificates(user, &keys))
                    .await?;
                index(certificates, |c| c.course_key.clone())?
            }
            _ => {
                let grades = self
                    .call(user, kind, self.client.fetch_current_grades(user, &keys))
                    .await?;
                index(grades, |g| g.course_key.clone())?
            }
        };

        let asked: HashSet<&String> = keys.iter().collect();
        fetched.retain(|key, _| asked.contains(key));
        Ok(fetched)
    }

    /// Platform keys of candidate runs with an active cached enrollment.
    async fn active_enrollment_keys(
        &self,
        user: UserId,
        candidates: &[CourseRun],
    ) -> Result<Vec<String>, CacheError> {
        let keys_by_run: HashMap<_, _> = candidates
            .iter()
            .filter_map(|run| run.platform_key.as_ref().map(|key| (run.id, key)))
            .collect();

        let mut keys = Vec::new();
        for record in self.repo.records(user, CacheKind::Enrollment).await? {
            let enrollment = record
                .enrollment()
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            if !enrollment.is_some_and(|e| e.is_active) {
                continue;
            }
            if let Some(key) = keys_by_run.get(&record.course_run_id) {
                keys.push((*key).clone());
            }
        }
        Ok(keys)
    }

    async fn call<T, F>(
        &self,
        user: &PlatformUser,
        kind: CacheKind,
        call: F,
    ) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let result = match tokio::time::timeout(self.remote_timeout, call).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::RemoteUnavailable(format!(
                "no answer within {}s",
                self.remote_timeout.as_secs()
            ))),
        };
        if let Err(err) = &result {
            warn!(user_id = %user.id, kind = %kind, error = %err, "remote fetch failed");
        }
        result
    }
}

fn index<T, K>(items: Vec<T>, key: K) -> Result<HashMap<String, Value>, CacheError>
where
    T: Serialize,
    K: Fn(&T) -> String,
{
    items
        .into_iter()
        .map(|item| -> Result<(String, Value), CacheError> {
            let value = serde_json::to_value(&item)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok((key(&item), value))
        })
        .collect()
}
