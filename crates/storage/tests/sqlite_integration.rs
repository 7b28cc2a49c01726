use chrono::Duration;
use progress_core::model::{
    CacheKind, Course, CourseId, CoursePrice, CourseRun, CourseRunId, ExamAuthorization,
    ExamAuthorizationStatus, ExamRun, ExamRunId, FinalGrade, FinancialAid, FinancialAidStatus,
    GradingStatus, Payment, PaymentId, PaymentStatus, PlatformUser, Program, ProgramId,
    TierProgram, TierProgramId, UserId,
};
use progress_core::time::fixed_now;
use serde_json::json;
use storage::repository::{
    CacheRepository, CatalogRepository, FinalGradeRepository, JobLockRepository,
    LedgerRepository, UserRepository,
};
use storage::sqlite::SqliteRepository;
use storage::StorageError;
use uuid::Uuid;

async fn connect(name: &str) -> SqliteRepository {
    let repo = SqliteRepository::connect(&format!("sqlite:file:{name}?mode=memory&cache=shared"))
        .await
        .expect("connect");
    repo.migrate().await.expect("migrate");
    repo
}

async fn seed_catalog(repo: &SqliteRepository) {
    let now = fixed_now();
    repo.upsert_program(&Program::new(ProgramId::new(1), "Data Economics"))
        .await
        .unwrap();
    repo.upsert_course(&Course::new(CourseId::new(1), ProgramId::new(1), "Micro", 1))
        .await
        .unwrap();
    let current = CourseRun::new(CourseRunId::new(1), CourseId::new(1), "Micro 2023")
        .with_platform_key("course-v1:MITx+14.1x+2023")
        .with_dates(Some(now - Duration::weeks(2)), Some(now + Duration::weeks(8)));
    let mut retired = CourseRun::new(CourseRunId::new(2), CourseId::new(1), "Micro 2019")
        .with_platform_key("course-v1:MITx+14.1x+2019");
    retired.is_discontinued = true;
    repo.upsert_course_run(&current).await.unwrap();
    repo.upsert_course_run(&retired).await.unwrap();
}

#[tokio::test]
async fn catalog_round_trips_and_filters_candidates() {
    let repo = connect("memdb_catalog").await;
    seed_catalog(&repo).await;

    let run = repo.get_course_run(CourseRunId::new(1)).await.unwrap();
    assert_eq!(run.platform_key.as_deref(), Some("course-v1:MITx+14.1x+2023"));
    assert_eq!(repo.runs_for_program(ProgramId::new(1)).await.unwrap().len(), 2);

    let candidates = repo.candidate_runs().await.unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, CourseRunId::new(1));

    let mut program = repo.get_program(ProgramId::new(1)).await.unwrap();
    program.live = false;
    repo.upsert_program(&program).await.unwrap();
    assert!(repo.candidate_runs().await.unwrap().is_empty());

    assert!(matches!(
        repo.get_course(CourseId::new(99)).await,
        Err(StorageError::NotFound)
    ));
}

#[tokio::test]
async fn duplicate_platform_key_is_a_conflict() {
    let repo = connect("memdb_conflict").await;
    seed_catalog(&repo).await;
    let clash = CourseRun::new(CourseRunId::new(3), CourseId::new(1), "Clash")
        .with_platform_key("course-v1:MITx+14.1x+2023");
    assert!(matches!(
        repo.upsert_course_run(&clash).await,
        Err(StorageError::Conflict)
    ));
}

#[tokio::test]
async fn replace_kind_persists_payloads_absences_and_marker() {
    let repo = connect("memdb_cache").await;
    seed_catalog(&repo).await;
    let user = UserId::new(10);
    let now = fixed_now();

    let entries = vec![
        (
            CourseRunId::new(1),
            Some(json!({
                "course_key": "course-v1:MITx+14.1x+2023",
                "is_active": true,
                "mode": "verified"
            })),
        ),
        (CourseRunId::new(2), None),
    ];
    repo.replace_kind(user, CacheKind::Enrollment, &entries, now)
        .await
        .unwrap();

    // run 2 is discontinued: stored, but filtered from reads
    let records = repo.records(user, CacheKind::Enrollment).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].enrollment().unwrap().unwrap().is_verified());

    let marker = repo.marker(user).await.unwrap();
    assert_eq!(marker.refreshed_at(CacheKind::Enrollment), Some(now));
    assert_eq!(marker.refreshed_at(CacheKind::CurrentGrade), None);

    assert_eq!(
        repo.users_enrolled_in_run(CourseRunId::new(1)).await.unwrap(),
        vec![user]
    );

    let later = now + Duration::minutes(10);
    repo.replace_kind(user, CacheKind::Enrollment, &[(CourseRunId::new(1), None)], later)
        .await
        .unwrap();
    let records = repo.records(user, CacheKind::Enrollment).await.unwrap();
    assert!(records[0].payload.is_none());
    assert_eq!(records[0].last_request, later);
    assert!(repo.users_enrolled_in_run(CourseRunId::new(1)).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_replace_leaves_marker_untouched() {
    let repo = connect("memdb_cache_rollback").await;
    seed_catalog(&repo).await;
    let user = UserId::new(11);

    let entries = vec![(CourseRunId::new(1), None), (CourseRunId::new(404), None)];
    let result = repo
        .replace_kind(user, CacheKind::Certificate, &entries, fixed_now())
        .await;
    assert!(result.is_err());
    assert!(repo.records(user, CacheKind::Certificate).await.unwrap().is_empty());
    assert_eq!(repo.marker(user).await.unwrap().refreshed_at(CacheKind::Certificate), None);
}

#[tokio::test]
async fn refresh_failures_count_and_reset() {
    let repo = connect("memdb_failures").await;
    let user = UserId::new(12);
    assert_eq!(repo.refresh_failures(user).await.unwrap(), 0);
    assert_eq!(repo.record_refresh_failure(user, fixed_now()).await.unwrap(), 1);
    assert_eq!(repo.record_refresh_failure(user, fixed_now()).await.unwrap(), 2);
    repo.reset_refresh_failures(user).await.unwrap();
    assert_eq!(repo.refresh_failures(user).await.unwrap(), 0);
}

#[tokio::test]
async fn complete_final_grade_is_not_overwritten() {
    let repo = connect("memdb_final_grades").await;
    seed_catalog(&repo).await;
    let user = UserId::new(13);
    let run = CourseRunId::new(1);

    let first = FinalGrade::complete(user, run, 0.82, true, true, fixed_now()).unwrap();
    let stored = repo.save_complete(&first).await.unwrap();
    assert_eq!(stored, first);

    let second = FinalGrade::complete(user, run, 0.2, false, false, fixed_now() + Duration::days(1))
        .unwrap();
    let stored = repo.save_complete(&second).await.unwrap();
    assert_eq!(stored, first);
    assert_eq!(repo.users_with_complete_grade(run).await.unwrap(), vec![user]);

    assert_eq!(repo.grading_status(run).await.unwrap(), None);
    repo.set_grading_status(run, GradingStatus::Complete, fixed_now())
        .await
        .unwrap();
    assert_eq!(
        repo.grading_status(run).await.unwrap(),
        Some(GradingStatus::Complete)
    );
}

#[tokio::test]
async fn ledger_reads_back_what_collaborators_wrote() {
    let repo = connect("memdb_ledger").await;
    seed_catalog(&repo).await;
    let user = UserId::new(14);
    let now = fixed_now();

    repo.upsert_user(&PlatformUser {
        id: user,
        username: "learner".into(),
        access_token: "token".into(),
        token_expires_at: None,
    })
    .await
    .unwrap();
    assert_eq!(repo.list_user_ids().await.unwrap(), vec![user]);

    repo.upsert_payment(&Payment {
        id: PaymentId::new(1),
        user_id: user,
        course_key: "course-v1:MITx+14.1x+2023".into(),
        status: PaymentStatus::Fulfilled,
        paid_at: now,
    })
    .await
    .unwrap();
    assert!(repo.payments_for_user(user).await.unwrap()[0].is_fulfilled());

    repo.upsert_tier_program(&TierProgram {
        id: TierProgramId::new(1),
        program_id: ProgramId::new(1),
        discount_amount: 500,
        income_threshold: 10_000,
        current: true,
    })
    .await
    .unwrap();
    repo.upsert_financial_aid(&FinancialAid {
        user_id: user,
        tier_program_id: TierProgramId::new(1),
        status: FinancialAidStatus::Approved,
        created_at: now,
    })
    .await
    .unwrap();
    let aid = repo
        .financial_aid_for_program(user, ProgramId::new(1))
        .await
        .unwrap();
    assert_eq!(aid.len(), 1);
    assert!(aid[0].status.grants_discount());

    repo.upsert_course_price(&CoursePrice {
        course_run_id: CourseRunId::new(1),
        price: 100_000,
        is_valid: true,
    })
    .await
    .unwrap();
    assert_eq!(repo.prices_for_program(ProgramId::new(1)).await.unwrap().len(), 1);

    repo.upsert_exam_run(&ExamRun {
        id: ExamRunId::new(1),
        course_id: CourseId::new(1),
        date_first_eligible: now - Duration::days(5),
        date_last_eligible: now + Duration::days(5),
    })
    .await
    .unwrap();
    repo.upsert_exam_authorization(&ExamAuthorization {
        user_id: user,
        course_id: CourseId::new(1),
        exam_run_id: ExamRunId::new(1),
        status: ExamAuthorizationStatus::Success,
        exam_taken: true,
    })
    .await
    .unwrap();
    let auths = repo.exam_authorizations(user, CourseId::new(1)).await.unwrap();
    assert_eq!(auths.len(), 1);
    assert!(auths[0].exam_taken);
}

#[tokio::test]
async fn job_lock_excludes_second_holder() {
    let repo = connect("memdb_locks").await;
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());
    let now = fixed_now();
    let ttl = Duration::minutes(30);

    assert!(repo.try_acquire("batch", first, now, ttl).await.unwrap());
    assert!(!repo.try_acquire("batch", second, now, ttl).await.unwrap());
    repo.release("batch", first).await.unwrap();
    assert!(repo.try_acquire("batch", second, now, ttl).await.unwrap());
    // expired locks are taken over
    assert!(
        repo.try_acquire("batch", first, now + Duration::hours(1), ttl)
            .await
            .unwrap()
    );
}
