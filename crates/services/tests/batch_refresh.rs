mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::*;
use progress_core::model::{
    CacheKind, CertificateData, CurrentGradeData, EnrollmentData, PlatformUser,
};
use services::batch::REFRESH_JOB_LOCK;
use services::{BatchOutcome, BatchReport, EngineConfig, ProgressEngine, RemoteClient, RemoteError};
use storage::repository::{CacheRepository, JobLockRepository};
use uuid::Uuid;

fn completed(outcome: BatchOutcome) -> BatchReport {
    match outcome {
        BatchOutcome::Completed(report) => report,
        BatchOutcome::LockHeld => panic!("lock unexpectedly held"),
    }
}

#[tokio::test]
async fn stale_users_are_refreshed_and_fresh_ones_left_alone() {
    let fixture = Fixture::new().await;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "verified")]);
    let engine = fixture.engine();

    let first = completed(engine.refresh_batch().await.expect("first batch"));
    assert_eq!(
        first,
        BatchReport {
            selected: 2,
            refreshed: 2,
            failed: 0,
            skipped_failing: 0,
        }
    );
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 2);

    let second = completed(engine.refresh_batch().await.expect("second batch"));
    assert_eq!(second.selected, 0);
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 2);
}

#[tokio::test]
async fn a_held_lock_keeps_the_job_from_running() {
    let fixture = Fixture::new().await;
    let acquired = fixture
        .storage
        .locks
        .try_acquire(
            REFRESH_JOB_LOCK,
            Uuid::new_v4(),
            fixture.clock.now(),
            Duration::minutes(30),
        )
        .await
        .expect("lock");
    assert!(acquired);

    let outcome = fixture.engine().refresh_batch().await.expect("batch");

    assert_eq!(outcome, BatchOutcome::LockHeld);
    assert_eq!(fixture.remote.total_calls(), 0);
}

#[tokio::test]
async fn an_expired_lock_is_taken_over() {
    let fixture = Fixture::new().await;
    fixture
        .storage
        .locks
        .try_acquire(
            REFRESH_JOB_LOCK,
            Uuid::new_v4(),
            fixture.clock.now() - Duration::hours(1),
            Duration::minutes(30),
        )
        .await
        .expect("stale lock");

    let outcome = fixture.engine().refresh_batch().await.expect("batch");

    assert!(matches!(outcome, BatchOutcome::Completed(_)));
}

#[tokio::test]
async fn the_lock_is_released_after_a_run() {
    let fixture = Fixture::new().await;
    fixture.engine().refresh_batch().await.expect("batch");

    let reacquired = fixture
        .storage
        .locks
        .try_acquire(
            REFRESH_JOB_LOCK,
            Uuid::new_v4(),
            fixture.clock.now(),
            Duration::minutes(30),
        )
        .await
        .expect("lock");
    assert!(reacquired);
}

#[tokio::test]
async fn repeatedly_failing_users_are_skipped() {
    let fixture = Fixture::new().await;
    fixture.remote.fail(
        None,
        RemoteError::Unavailable("503 Service Unavailable".to_string()),
    );
    let engine = fixture.engine();

    for _ in 0..3 {
        let report = completed(engine.refresh_batch().await.expect("batch"));
        assert_eq!(report.failed, 2);
        assert_eq!(report.refreshed, 0);
    }
    assert_eq!(
        fixture
            .storage
            .cache
            .refresh_failures(fixture.user.id)
            .await
            .expect("failures"),
        3
    );
    let calls = fixture.remote.total_calls();

    let report = completed(engine.refresh_batch().await.expect("batch"));
    assert_eq!(report.skipped_failing, 2);
    assert_eq!(report.selected, 0);
    assert_eq!(fixture.remote.total_calls(), calls);
}

#[tokio::test]
async fn a_successful_refresh_clears_the_failure_count() {
    let fixture = Fixture::new().await;
    fixture.remote.fail(None, RemoteError::InvalidCredential);
    let engine = fixture.engine();
    completed(engine.refresh_batch().await.expect("failing batch"));

    fixture.remote.recover();
    let report = completed(engine.refresh_batch().await.expect("batch"));

    assert_eq!(report.refreshed, 2);
    assert_eq!(
        fixture
            .storage
            .cache
            .refresh_failures(fixture.classmate.id)
            .await
            .expect("failures"),
        0
    );
}

/// Tries to take the job lock from inside a chunk task.
struct LockGrabbingRemote {
    locks: Arc<dyn JobLockRepository>,
    now: DateTime<Utc>,
    acquired: Mutex<Vec<bool>>,
}

#[async_trait]
impl RemoteClient for LockGrabbingRemote {
    async fn fetch_enrollments(
        &self,
        _user: &PlatformUser,
    ) -> Result<Vec<EnrollmentData>, RemoteError> {
        let holder = Uuid::new_v4();
        let mut acquired = false;
        for _ in 0..100 {
            acquired = self
                .locks
                .try_acquire(REFRESH_JOB_LOCK, holder, self.now, Duration::minutes(30))
                .await
                .expect("lock");
            if acquired {
                break;
            }
            tokio::task::yield_now().await;
        }
        if acquired {
            self.locks
                .release(REFRESH_JOB_LOCK, holder)
                .await
                .expect("release");
        }
        self.acquired.lock().expect("acquired").push(acquired);
        Ok(Vec::new())
    }

    async fn fetch_certificates(
        &self,
        _user: &PlatformUser,
        _run_keys: &[String],
    ) -> Result<Vec<CertificateData>, RemoteError> {
        Ok(Vec::new())
    }

    async fn fetch_current_grades(
        &self,
        _user: &PlatformUser,
        _run_keys: &[String],
    ) -> Result<Vec<CurrentGradeData>, RemoteError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn the_lock_is_free_while_chunks_are_still_running() {
    let fixture = Fixture::new().await;
    let remote = Arc::new(LockGrabbingRemote {
        locks: Arc::clone(&fixture.storage.locks),
        now: fixture.clock.now(),
        acquired: Mutex::new(Vec::new()),
    });
    let client: Arc<dyn RemoteClient> = remote.clone();
    let engine = ProgressEngine::new(
        fixture.storage.clone(),
        client,
        &EngineConfig::default(),
        fixture.clock,
    );

    let report = completed(engine.refresh_batch().await.expect("batch"));

    assert_eq!(report.refreshed, 2);
    assert_eq!(*remote.acquired.lock().expect("acquired"), vec![true, true]);
}
