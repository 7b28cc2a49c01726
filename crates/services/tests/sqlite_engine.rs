mod common;

use common::*;
use progress_core::model::{CacheKind, ProgramId};
use progress_core::status::RunStatus;
use services::Viewer;
use storage::repository::Storage;

async fn sqlite_fixture(name: &str) -> Fixture {
    let storage = Storage::sqlite(&format!("sqlite:file:{name}?mode=memory&cache=shared"))
        .await
        .expect("sqlite storage");
    Fixture::with_storage(storage).await
}

#[tokio::test]
async fn dashboard_freeze_and_batch_work_against_sqlite() {
    let fixture = sqlite_fixture("memdb_progress_engine").await;
    fixture.remote.set_enrollments(vec![
        enrollment(RUN_PAST, "verified"),
        enrollment(RUN_NEWER, "audit"),
    ]);
    fixture
        .remote
        .set_certificates(vec![certificate(RUN_PAST, "verified", 0.75)]);
    let engine = fixture.engine();

    let progress = engine
        .get_program_progress(fixture.user.id, ProgramId::new(PROGRAM), Viewer::Subject)
        .await
        .expect("progress");
    let statuses: Vec<_> = progress
        .courses
        .iter()
        .flat_map(|course| course.runs.iter().map(|run| (run.run_id, run.status)))
        .collect();
    assert_eq!(
        statuses,
        vec![
            (run_id(RUN_PAST), RunStatus::Passed),
            (run_id(RUN_NEWER), RunStatus::CanUpgrade),
        ]
    );

    let grade = engine
        .freeze_run(fixture.user.id, run_id(RUN_PAST))
        .await
        .expect("freeze");
    assert!(grade.passed && grade.paid_on_platform);

    let observed = engine
        .get_program_progress(fixture.user.id, ProgramId::new(PROGRAM), Viewer::Observer)
        .await
        .expect("observer view");
    let micro = &observed.courses[0];
    assert_eq!(micro.runs[0].final_grade, Some(75.0));

    let calls = fixture.remote.calls(CacheKind::Enrollment);
    engine.refresh_batch().await.expect("batch");
    // only the classmate was never refreshed
    assert_eq!(fixture.remote.calls(CacheKind::Enrollment), calls + 1);
}
