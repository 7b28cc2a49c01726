mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use common::*;
use progress_core::model::{
    CacheKind, CertificateData, CurrentGradeData, EnrollmentData, PlatformUser,
};
use services::{
    CacheError, ProgressEvent, RemoteClient, RemoteDataCache, RemoteError, StalenessWindows,
};
use storage::repository::CacheRepository;

#[tokio::test]
async fn never_refreshed_kind_is_fetched_once_then_served_from_cache() {
    let fixture = Fixture::new().await;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "verified")]);
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    assert!(
        !cache
            .is_fresh(user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );

    let first = cache
        .get_or_refresh(user, CacheKind::Enrollment)
        .await
        .expect("first read");
    let second = cache
        .get_or_refresh(user, CacheKind::Enrollment)
        .await
        .expect("second read");

    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 1);
    assert_eq!(first, second);
    assert!(
        cache
            .is_fresh(user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );
}

#[tokio::test]
async fn staleness_window_expires_per_kind() {
    let fixture = Fixture::new().await;
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    cache
        .refresh(user, CacheKind::Enrollment)
        .await
        .expect("refresh");

    let within = cache
        .clone()
        .with_clock(fixture.clock.advanced(Duration::minutes(4)));
    assert!(
        within
            .is_fresh(user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );
    within
        .get_or_refresh(user, CacheKind::Enrollment)
        .await
        .expect("fresh read");
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 1);

    let expired = cache
        .clone()
        .with_clock(fixture.clock.advanced(Duration::minutes(5)));
    assert!(
        !expired
            .is_fresh(user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );
    expired
        .get_or_refresh(user, CacheKind::Enrollment)
        .await
        .expect("stale read");
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 2);
}

#[tokio::test]
async fn refresh_records_absence_for_every_candidate_run() {
    let fixture = Fixture::new().await;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "audit")]);
    let cache = fixture.engine().cache().clone();

    let records = cache
        .refresh(&fixture.user, CacheKind::Enrollment)
        .await
        .expect("refresh");

    let runs: Vec<_> = records.iter().map(|r| r.course_run_id).collect();
    assert_eq!(
        runs,
        vec![
            run_id(RUN_CURRENT),
            run_id(RUN_PAST),
            run_id(RUN_OLDER),
            run_id(RUN_NEWER),
            run_id(FA_RUN_CURRENT),
            run_id(FA_RUN_PAST),
        ]
    );
    for record in &records {
        let present = record.enrollment().expect("decode").is_some();
        assert_eq!(present, record.course_run_id == run_id(RUN_CURRENT));
    }
    assert!(!runs.contains(&run_id(RUN_DISCONTINUED)));
}

#[tokio::test]
async fn a_later_refresh_replaces_the_previous_snapshot() {
    let fixture = Fixture::new().await;
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "audit")]);
    cache
        .refresh(user, CacheKind::Enrollment)
        .await
        .expect("first refresh");

    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_NEWER, "verified")]);
    let records = cache
        .refresh(user, CacheKind::Enrollment)
        .await
        .expect("second refresh");

    let present: Vec<_> = records
        .iter()
        .filter(|r| r.payload.is_some())
        .map(|r| r.course_run_id)
        .collect();
    assert_eq!(present, vec![run_id(RUN_NEWER)]);
}

#[tokio::test]
async fn certificates_are_asked_only_for_active_enrollments() {
    let fixture = Fixture::new().await;
    let mut inactive = enrollment(RUN_PAST, "verified");
    inactive.is_active = false;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "verified"), inactive]);
    fixture.remote.set_certificates(vec![
        certificate(RUN_CURRENT, "verified", 0.9),
        certificate(RUN_PAST, "verified", 0.8),
    ]);
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    cache.refresh_all(user).await.expect("refresh all");

    assert_eq!(fixture.remote.asked(CacheKind::Certificate), vec![key(RUN_CURRENT)]);
    let certificates = cache
        .records(user.id, CacheKind::Certificate)
        .await
        .expect("records");
    for record in &certificates {
        let present = record.certificate().expect("decode").is_some();
        assert_eq!(present, record.course_run_id == run_id(RUN_CURRENT));
    }
}

#[tokio::test]
async fn without_active_enrollments_the_platform_is_not_asked_for_grades() {
    let fixture = Fixture::new().await;
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    cache.refresh_all(user).await.expect("refresh all");

    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 1);
    assert_eq!(fixture.remote.calls(CacheKind::Certificate), 0);
    assert_eq!(fixture.remote.calls(CacheKind::CurrentGrade), 0);
    assert!(
        cache
            .stale_kinds(user.id)
            .await
            .expect("stale kinds")
            .is_empty()
    );
}

#[tokio::test]
async fn rejected_credential_leaves_records_and_marker_untouched() {
    let fixture = Fixture::new().await;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "verified")]);
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;
    let before = cache
        .refresh(user, CacheKind::Enrollment)
        .await
        .expect("refresh");

    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_NEWER, "verified")]);
    fixture
        .remote
        .fail(Some(CacheKind::Enrollment), RemoteError::InvalidCredential);
    let later = cache
        .clone()
        .with_clock(fixture.clock.advanced(Duration::hours(1)));
    let err = later
        .get_or_refresh(user, CacheKind::Enrollment)
        .await
        .expect_err("credential rejected");

    assert!(matches!(err, CacheError::InvalidUpstreamCredential));
    let after = later
        .records(user.id, CacheKind::Enrollment)
        .await
        .expect("records");
    assert_eq!(before, after);
    assert!(
        !later
            .is_fresh(user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );
}

#[tokio::test]
async fn first_refresh_failure_writes_nothing() {
    let fixture = Fixture::new().await;
    fixture.remote.fail(
        None,
        RemoteError::Unavailable("connection reset".to_string()),
    );
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;

    let err = cache
        .refresh(user, CacheKind::Enrollment)
        .await
        .expect_err("remote down");

    assert!(matches!(err, CacheError::RemoteUnavailable(_)));
    assert!(
        cache
            .records(user.id, CacheKind::Enrollment)
            .await
            .expect("records")
            .is_empty()
    );
    let marker = fixture
        .storage
        .cache
        .marker(user.id)
        .await
        .expect("marker");
    assert!(marker.enrollment.is_none());
}

#[tokio::test]
async fn refresh_announces_itself_on_the_event_bus() {
    let fixture = Fixture::new().await;
    let engine = fixture.engine();
    let mut events = engine.events().subscribe();

    engine
        .cache()
        .refresh(&fixture.user, CacheKind::Enrollment)
        .await
        .expect("refresh");

    match events.try_recv().expect("event published") {
        ProgressEvent::CacheRefreshed {
            user_id,
            kind,
            records,
            ..
        } => {
            assert_eq!(user_id, fixture.user.id);
            assert_eq!(kind, CacheKind::Enrollment);
            assert_eq!(records, 6);
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test]
async fn refresh_all_if_stale_skips_fresh_kinds() {
    let fixture = Fixture::new().await;
    fixture
        .remote
        .set_enrollments(vec![enrollment(RUN_CURRENT, "verified")]);
    fixture
        .remote
        .set_grades(vec![current_grade(RUN_CURRENT, 0.55, false)]);
    let cache = fixture.engine().cache().clone();
    let user = &fixture.user;
    cache.refresh_all(user).await.expect("refresh all");

    // enrollment window is 5 minutes, current grades 1 hour, certificates 6 hours
    let later = cache
        .clone()
        .with_clock(fixture.clock.advanced(Duration::minutes(30)));
    let refreshed = later.refresh_all_if_stale(user).await.expect("refresh");

    assert_eq!(refreshed, vec![CacheKind::Enrollment]);
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), 2);
    assert_eq!(fixture.remote.calls(CacheKind::Certificate), 1);
    assert_eq!(fixture.remote.calls(CacheKind::CurrentGrade), 1);
}

struct StalledRemote;

#[async_trait]
impl RemoteClient for StalledRemote {
    async fn fetch_enrollments(
        &self,
        _user: &PlatformUser,
    ) -> Result<Vec<EnrollmentData>, RemoteError> {
        tokio::time::sleep(StdDuration::from_secs(3600)).await;
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

#[tokio::test(start_paused = true)]
async fn slow_platform_counts_as_unavailable() {
    let fixture = Fixture::new().await;
    let cache = RemoteDataCache::new(
        fixture.clock,
        StalenessWindows::default(),
        Arc::new(StalledRemote),
        Arc::clone(&fixture.storage.catalog),
        Arc::clone(&fixture.storage.cache),
    )
    .with_remote_timeout(StdDuration::from_secs(2));

    let err = cache
        .refresh(&fixture.user, CacheKind::Enrollment)
        .await
        .expect_err("timed out");

    assert!(matches!(err, CacheError::RemoteUnavailable(_)));
    assert!(
        !cache
            .is_fresh(fixture.user.id, CacheKind::Enrollment)
            .await
            .expect("marker")
    );
}
