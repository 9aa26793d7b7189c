// Integration tests for the scheduler daemon's durable job queue.

mod helpers;

use helpers::TestDb;
use ondemand::daemon;

#[tokio::test]
async fn test_job_round_trip() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    let job = daemon::insert_job(db, 1_900_000_000, "cs225", "mp1")
        .await
        .expect("Insert failed");
    assert!(!job.job_id.is_empty());

    let fetched = daemon::get_job(db, &job.job_id)
        .await
        .expect("Fetch failed")
        .expect("Job not found");
    assert_eq!(fetched.fire_time, 1_900_000_000);
    assert_eq!(fetched.course_id, "cs225");
    assert_eq!(fetched.assignment_id, "mp1");
}

#[tokio::test]
async fn test_reschedule_moves_fire_time() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    let job = daemon::insert_job(db, 1_900_000_000, "cs225", "mp1")
        .await
        .expect("Insert failed");

    assert!(daemon::update_job_time(db, &job.job_id, 1_950_000_000)
        .await
        .expect("Update failed"));
    let fetched = daemon::get_job(db, &job.job_id)
        .await
        .expect("Fetch failed")
        .expect("Job not found");
    assert_eq!(fetched.fire_time, 1_950_000_000);

    assert!(!daemon::update_job_time(db, "no-such-job", 1_950_000_000)
        .await
        .expect("Update failed"));
}

#[tokio::test]
async fn test_delete_consumes_job_once() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    let job = daemon::insert_job(db, 1_900_000_000, "cs225", "mp1")
        .await
        .expect("Insert failed");

    assert!(daemon::delete_job(db, &job.job_id).await.expect("Delete failed"));
    assert!(!daemon::delete_job(db, &job.job_id).await.expect("Delete failed"));
    assert!(daemon::get_job(db, &job.job_id)
        .await
        .expect("Fetch failed")
        .is_none());
}

#[tokio::test]
async fn test_due_jobs_cutoff_and_ordering() {
    let test_db = TestDb::new().await;
    let db = test_db.connection();

    let late = daemon::insert_job(db, 1_800_000_000, "cs225", "mp3")
        .await
        .expect("Insert failed");
    let early = daemon::insert_job(db, 1_700_000_000, "cs225", "mp1")
        .await
        .expect("Insert failed");
    let future = daemon::insert_job(db, 2_000_000_000, "cs225", "mp9")
        .await
        .expect("Insert failed");

    let due = daemon::due_jobs(db, 1_800_000_000)
        .await
        .expect("Query failed");
    let ids: Vec<&str> = due.iter().map(|j| j.job_id.as_str()).collect();
    // Soonest first; fire_time == now is due; the future job is not.
    assert_eq!(ids, vec![early.job_id.as_str(), late.job_id.as_str()]);
    assert!(due.iter().all(|j| j.job_id != future.job_id));

    let all = daemon::list_jobs(db).await.expect("Listing failed");
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].job_id, early.job_id);
    assert_eq!(all[2].job_id, future.job_id);
}
