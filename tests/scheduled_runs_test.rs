// Integration tests for the scheduled run store and the schedule/edit/delete
// protocol: upsert semantics, the atomic status claim, and the rule that the
// external scheduler is confirmed before anything is committed.

mod helpers;

use helpers::{seed_assignment, seed_course, MockScheduler, TestDb};
use ondemand::runs::{self, ScheduleRunRequest};
use ondemand::storage::{self, RunStatus, ScheduledRunParams};

fn params(job_id: &str) -> ScheduledRunParams {
    ScheduledRunParams {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Final Run".to_string(),
        roster: Some(vec!["alice".to_string(), "bob".to_string()]),
        scheduler_job_id: job_id.to_string(),
    }
}

#[tokio::test]
async fn test_scheduled_run_round_trip() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("j1"))
        .await
        .expect("Failed to create scheduled run");

    let run = storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Failed to fetch")
        .expect("Run not found");
    assert_eq!(run.status, "scheduled");
    assert_eq!(run.scheduler_job_id, "j1");
    assert_eq!(run.backend_run_id, None);
    let roster = storage::scheduled_run_roster(&run)
        .expect("Roster should parse")
        .expect("Roster should be fixed");
    assert_eq!(roster, vec!["alice".to_string(), "bob".to_string()]);
}

#[tokio::test]
async fn test_upsert_preserves_status_and_backend_id() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("j1"))
        .await
        .expect("Failed to create scheduled run");
    storage::set_scheduled_run_backend_id(db, "run-1", "backend-77")
        .await
        .expect("Failed to set backend id");

    // Edit the caller-facing fields; status and backend id must survive.
    let mut edited = params("j2");
    edited.name = "Renamed Run".to_string();
    edited.roster = None;
    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &edited)
        .await
        .expect("Failed to upsert scheduled run");

    let run = storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Failed to fetch")
        .expect("Run not found");
    assert_eq!(run.name, "Renamed Run");
    assert_eq!(run.scheduler_job_id, "j2");
    assert_eq!(run.roster, None);
    assert_eq!(run.status, "scheduled");
    assert_eq!(run.backend_run_id.as_deref(), Some("backend-77"));
}

#[tokio::test]
async fn test_claim_is_first_writer_wins() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("j1"))
        .await
        .expect("Failed to create scheduled run");

    let first = storage::claim_scheduled_run(db, "run-1", RunStatus::Ran)
        .await
        .expect("Claim failed");
    assert!(first, "First claim should win");

    let second = storage::claim_scheduled_run(db, "run-1", RunStatus::Failed)
        .await
        .expect("Claim failed");
    assert!(!second, "Second claim must lose");

    let run = storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Failed to fetch")
        .expect("Run not found");
    assert_eq!(run.status, "ran", "Losing claim must not overwrite status");
}

#[tokio::test]
async fn test_lookup_by_scheduler_id_returns_all_matches() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("shared"))
        .await
        .expect("Failed to create scheduled run");
    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-2", &params("shared"))
        .await
        .expect("Failed to create scheduled run");
    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-3", &params("other"))
        .await
        .expect("Failed to create scheduled run");

    let matches = storage::get_scheduled_runs_by_scheduler_id(db, "cs225", "mp1", "shared")
        .await
        .expect("Lookup failed");
    assert_eq!(matches.len(), 2);

    let count = storage::count_runs_referencing_job(db, "shared")
        .await
        .expect("Count failed");
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_schedule_confirms_with_daemon_then_commits() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice", "bob"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::new();
    let request = ScheduleRunRequest {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Final Run".to_string(),
        roster: None,
    };
    let run = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect("Scheduling should succeed");

    assert_eq!(run.scheduler_job_id, "job-1");
    assert_eq!(scheduler.schedule_calls.lock().unwrap().len(), 1);
    let (time, course, assignment) = scheduler.schedule_calls.lock().unwrap()[0].clone();
    assert_eq!(time, 2_000_000_000);
    assert_eq!(course, "cs225");
    assert_eq!(assignment, "mp1");
}

#[tokio::test]
async fn test_schedule_rejects_past_run_time() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::new();
    let request = ScheduleRunRequest {
        run_time: 1_600_000_000,
        due_time: 1_599_999_700,
        name: "Late".to_string(),
        roster: None,
    };
    let err = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect_err("Past run time must be rejected");
    assert!(matches!(err, ondemand::errors::OnDemandError::Validation(_)));
    assert!(scheduler.schedule_calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_rejects_unenrolled_roster_member() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::new();
    let request = ScheduleRunRequest {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Bad roster".to_string(),
        roster: Some(vec!["alice".to_string(), "mallory".to_string()]),
    };
    let err = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect_err("Unenrolled netid must be rejected");
    assert!(matches!(err, ondemand::errors::OnDemandError::Validation(_)));
}

#[tokio::test]
async fn test_scheduler_failure_commits_nothing() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::failing_schedule();
    let request = ScheduleRunRequest {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Doomed".to_string(),
        roster: None,
    };
    let err = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect_err("Daemon failure must abort");
    assert!(matches!(
        err,
        ondemand::errors::OnDemandError::SchedulerUnavailable(_)
    ));

    let stored = storage::get_scheduled_runs_for_assignment(db, "cs225", "mp1")
        .await
        .expect("Listing failed");
    assert!(stored.is_empty(), "No partial state may be committed");
}

#[tokio::test]
async fn test_edit_reschedules_existing_job() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::new();
    let request = ScheduleRunRequest {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Final Run".to_string(),
        roster: None,
    };
    let created = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect("Scheduling should succeed");

    let edit = ScheduleRunRequest {
        run_time: 2_100_000_000,
        ..request
    };
    let edited = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &edit,
        Some(&created.scheduler_job_id),
        1_700_000_000,
    )
    .await
    .expect("Editing should succeed");

    // Edit moves the existing job instead of scheduling a new one.
    assert_eq!(edited.scheduler_job_id, created.scheduler_job_id);
    assert_eq!(edited.run_time, 2_100_000_000);
    assert_eq!(scheduler.schedule_calls.lock().unwrap().len(), 1);
    assert_eq!(
        scheduler.update_calls.lock().unwrap().as_slice(),
        &[(created.scheduler_job_id.clone(), 2_100_000_000)]
    );
}

#[tokio::test]
async fn test_completed_run_cannot_be_edited() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    let scheduler = MockScheduler::new();
    let request = ScheduleRunRequest {
        run_time: 2_000_000_000,
        due_time: 1_999_999_700,
        name: "Final Run".to_string(),
        roster: None,
    };
    let created = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        None,
        1_700_000_000,
    )
    .await
    .expect("Scheduling should succeed");

    assert!(storage::claim_scheduled_run(db, "run-1", RunStatus::Ran)
        .await
        .expect("Claim failed"));

    let err = runs::schedule_or_edit(
        db,
        &scheduler,
        "cs225",
        "mp1",
        "run-1",
        &request,
        Some(&created.scheduler_job_id),
        1_700_000_000,
    )
    .await
    .expect_err("Past runs are immutable");
    assert!(matches!(err, ondemand::errors::OnDemandError::Validation(_)));
}

#[tokio::test]
async fn test_delete_cancels_job_with_sole_reference() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("j1"))
        .await
        .expect("Failed to create scheduled run");

    let scheduler = MockScheduler::new();
    runs::delete_scheduled_run(db, &scheduler, "cs225", "mp1", "run-1")
        .await
        .expect("Deletion should succeed");

    assert_eq!(
        scheduler.delete_calls.lock().unwrap().as_slice(),
        &["j1".to_string()]
    );
    assert!(storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Fetch failed")
        .is_none());
}

#[tokio::test]
async fn test_delete_spares_job_shared_with_sibling() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    // Two records referencing one external job, as left behind by a
    // historical duplicate-scheduling bug.
    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("shared"))
        .await
        .expect("Failed to create scheduled run");
    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-2", &params("shared"))
        .await
        .expect("Failed to create scheduled run");

    let scheduler = MockScheduler::new();
    runs::delete_scheduled_run(db, &scheduler, "cs225", "mp1", "run-1")
        .await
        .expect("Deletion should succeed");

    // The sibling still needs the job; it must not be cancelled.
    assert!(scheduler.delete_calls.lock().unwrap().is_empty());
    assert!(storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Fetch failed")
        .is_none());
    assert!(storage::get_scheduled_run(db, "cs225", "mp1", "run-2")
        .await
        .expect("Fetch failed")
        .is_some());
}

#[tokio::test]
async fn test_delete_tolerates_daemon_refusal() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();
    seed_course(db, "cs225", &["alice"], &["prof"]).await;
    seed_assignment(db, "cs225", "mp1", 3, "daily", 1_000_000, 3_000_000_000).await;

    storage::create_or_update_scheduled_run(db, "cs225", "mp1", "run-1", &params("j1"))
        .await
        .expect("Failed to create scheduled run");

    // Job already fired or was removed on the daemon side.
    let scheduler = MockScheduler::new();
    scheduler
        .fail_delete
        .store(true, std::sync::atomic::Ordering::SeqCst);
    runs::delete_scheduled_run(db, &scheduler, "cs225", "mp1", "run-1")
        .await
        .expect("Record deletion proceeds despite daemon refusal");

    assert!(storage::get_scheduled_run(db, "cs225", "mp1", "run-1")
        .await
        .expect("Fetch failed")
        .is_none());
}
