//! Staff- and student-facing orchestration over the scheduled run store, the
//! scheduler daemon client, and the grading backend client.

use crate::errors::OnDemandError;
use crate::grading_api::GradingBackendApi;
use crate::quota;
use crate::sched_api::SchedulerApi;
use crate::storage::{self, RunStatus, ScheduledRunParams};
use chrono_tz::Tz;
use sea_orm::DatabaseConnection;
use uuid::Uuid;

/// Deadline-triggered runs fire this long after the student-visible due
/// time, so a submission landing exactly at the deadline is never racing the
/// trigger. Race-avoidance policy inherited from the original deployment,
/// not an incidental offset.
pub const DEADLINE_GRACE_PERIOD_SECS: i64 = 5 * 60;

/// Caller-supplied fields for scheduling or editing a run.
#[derive(Debug, Clone)]
pub struct ScheduleRunRequest {
    pub run_time: i64,
    pub due_time: i64,
    pub name: String,
    /// `None` resolves to the full course roster at fire time.
    pub roster: Option<Vec<String>>,
}

pub fn valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Schedule a new run or edit an existing one.
///
/// The external scheduler is confirmed first and the store written second:
/// if the daemon call fails, no partial state is committed. Editing is only
/// permitted while the record is still `scheduled`; past triggers are
/// immutable history.
pub async fn schedule_or_edit(
    db: &DatabaseConnection,
    scheduler: &dyn SchedulerApi,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
    request: &ScheduleRunRequest,
    existing_job_id: Option<&str>,
    now: i64,
) -> Result<crate::entities::scheduled_run::Model, OnDemandError> {
    let course = storage::get_course(db, course_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such course: {course_id}")))?;
    storage::get_assignment(db, course_id, assignment_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such assignment: {assignment_id}")))?;

    if request.run_time <= now {
        return Err(OnDemandError::Validation(
            "Run time must be in the future.".to_string(),
        ));
    }
    if let Some(roster) = &request.roster {
        if roster.is_empty() {
            return Err(OnDemandError::Validation(
                "Roster must not be empty when provided.".to_string(),
            ));
        }
        for netid in roster {
            if !storage::is_student(&course, netid) {
                return Err(OnDemandError::Validation(format!(
                    "Invalid or non-existent student NetID: {netid}"
                )));
            }
        }
    }

    if let Some(existing) = storage::get_scheduled_run(db, course_id, assignment_id, run_id).await? {
        if RunStatus::parse(&existing.status) != Some(RunStatus::Scheduled) {
            return Err(OnDemandError::Validation(format!(
                "Scheduled run {run_id} has already {}; past runs cannot be edited.",
                existing.status
            )));
        }
    }

    // Confirm with the scheduler daemon before touching the store.
    let scheduler_job_id = match existing_job_id {
        None => {
            scheduler
                .schedule_run(request.run_time, course_id, assignment_id)
                .await?
        }
        Some(job_id) => {
            if !scheduler.update_scheduled_run(job_id, request.run_time).await {
                return Err(OnDemandError::SchedulerUnavailable(format!(
                    "Failed to reschedule job {job_id}; no changes were saved."
                )));
            }
            job_id.to_string()
        }
    };

    let params = ScheduledRunParams {
        run_time: request.run_time,
        due_time: request.due_time,
        name: request.name.clone(),
        roster: request.roster.clone(),
        scheduler_job_id,
    };
    storage::create_or_update_scheduled_run(db, course_id, assignment_id, run_id, &params).await
}

/// Delete a scheduled run, cancelling its external job when this record is
/// the job id's last reference. Cancellation is attempted before the store
/// record disappears, because the record is the only holder of the job id.
pub async fn delete_scheduled_run(
    db: &DatabaseConnection,
    scheduler: &dyn SchedulerApi,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
) -> Result<(), OnDemandError> {
    let run = storage::get_scheduled_run(db, course_id, assignment_id, run_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("Cannot find scheduled run {run_id}")))?;

    let references = storage::count_runs_referencing_job(db, &run.scheduler_job_id).await?;
    if references > 1 {
        tracing::warn!(
            scheduler_job_id = %run.scheduler_job_id,
            references,
            "Scheduler job shared by multiple records; leaving external job intact"
        );
    } else if !scheduler.delete_scheduled_run(&run.scheduler_job_id).await {
        // Best effort: the job may already have fired or been removed.
        tracing::warn!(
            scheduler_job_id = %run.scheduler_job_id,
            "Could not cancel external scheduler job; deleting record anyway"
        );
    }

    if !storage::delete_scheduled_run(db, course_id, assignment_id, run_id).await? {
        return Err(OnDemandError::Other(format!(
            "Failed to delete scheduled run {run_id}"
        )));
    }
    Ok(())
}

/// Record and start an on-demand grading run for one student, enforcing the
/// assignment quota and consuming an extension run when the base quota is
/// exhausted. `bypass_quota` is the staff escape hatch.
pub async fn record_student_run(
    db: &DatabaseConnection,
    backend: &dyn GradingBackendApi,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
    tz: Tz,
    now: i64,
    bypass_quota: bool,
) -> Result<crate::entities::grading_run::Model, OnDemandError> {
    let assignment = storage::get_assignment(db, course_id, assignment_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such assignment: {assignment_id}")))?;

    let mut extension_used: Option<i64> = None;
    if !bypass_quota {
        let history =
            storage::get_assignment_runs_for_student(db, course_id, assignment_id, netid).await?;
        let available = quota::available_runs(&assignment, &history, now, tz);
        let extensions = storage::get_extensions(db, course_id, assignment_id, netid).await?;
        let (active, extension_runs) = quota::active_extensions(&extensions, now);

        if available + extension_runs <= 0 {
            return Err(OnDemandError::Validation(
                "No grading runs available.".to_string(),
            ));
        }
        if available <= 0 {
            let ext = quota::pick_extension(&active).ok_or_else(|| {
                OnDemandError::Validation("No grading runs available.".to_string())
            })?;
            // Guarded decrement: only applied if the extension is still
            // active with runs remaining at decrement time.
            if !storage::consume_extension_run(db, ext.id, now).await? {
                return Err(OnDemandError::Validation(
                    "No grading runs available.".to_string(),
                ));
            }
            extension_used = Some(ext.id);
        }
    }

    let due = quota::round_up_minute(now);
    let roster = vec![netid.to_string()];

    // Record first, start second, retract on refusal. A crash mid-protocol
    // leaves a surplus history record (one run the student loses) rather
    // than a started backend run the quota never counted.
    let provisional_id = Uuid::new_v4().to_string();
    storage::add_grading_run(
        db,
        &provisional_id,
        course_id,
        assignment_id,
        netid,
        now,
        extension_used,
    )
    .await?;

    match backend.start_run(course_id, assignment_id, &roster, due).await {
        Some(backend_run_id) => storage::set_grading_run_id(db, &provisional_id, &backend_run_id)
            .await?
            .ok_or_else(|| {
                OnDemandError::Other(format!(
                    "Grading run {provisional_id} disappeared while starting"
                ))
            }),
        None => {
            retract_grading_run(db, course_id, assignment_id, &provisional_id).await?;
            Err(OnDemandError::BackendStartFailure(
                "Failed to start grading run. Please try again.".to_string(),
            ))
        }
    }
}

/// Retract a recorded grading run, restoring the extension run it consumed.
pub async fn retract_grading_run(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
) -> Result<(), OnDemandError> {
    let removed = storage::remove_grading_run(db, course_id, assignment_id, run_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such grading run: {run_id}")))?;
    if let Some(ext_id) = removed.extension_used {
        storage::restore_extension_run(db, ext_id).await?;
    }
    Ok(())
}

/// How many runs an extension of `num_hours` is worth. DAILY assignments get
/// the daily allowance once per extended day; TOTAL assignments get a
/// pro-rated share of the overall allowance, rounded up.
pub fn extension_run_allowance(
    assignment: &crate::entities::assignment::Model,
    num_hours: i64,
) -> i64 {
    match quota::Quota::parse(&assignment.quota) {
        Some(quota::Quota::Daily) => (num_hours / 24) * assignment.max_runs,
        Some(quota::Quota::Total) => {
            let period_hours = ((assignment.end - assignment.start) as f64 / 3600.0).max(1.0);
            (num_hours as f64 / period_hours * assignment.max_runs as f64).ceil() as i64
        }
        None => 0,
    }
}

/// Staff grant of additional runs; no deadline trigger involved.
#[allow(clippy::too_many_arguments)]
pub async fn grant_extension(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
    max_runs: i64,
    start: i64,
    end: i64,
) -> Result<crate::entities::extension::Model, OnDemandError> {
    let course = storage::get_course(db, course_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such course: {course_id}")))?;
    storage::get_assignment(db, course_id, assignment_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such assignment: {assignment_id}")))?;
    if !valid_id(netid) || !storage::is_student(&course, netid) {
        return Err(OnDemandError::Validation(format!(
            "Invalid or non-existent student NetID: {netid}"
        )));
    }
    if max_runs < 1 {
        return Err(OnDemandError::Validation(
            "Max Runs must be a positive integer.".to_string(),
        ));
    }
    if start >= end {
        return Err(OnDemandError::Validation(
            "Start must be before End.".to_string(),
        ));
    }
    storage::add_extension(
        db,
        course_id,
        assignment_id,
        netid,
        max_runs,
        start,
        end,
        None,
        false,
    )
    .await
}

/// Self-service extension request. Schedules the extension's own deadline
/// run first (fixed single-student roster, fired a grace period after the
/// extended due time); only once the trigger is durably scheduled is the
/// extension itself recorded and linked to that run. A scheduling failure
/// aborts the grant with nothing committed.
#[allow(clippy::too_many_arguments)]
pub async fn request_extension(
    db: &DatabaseConnection,
    scheduler: &dyn SchedulerApi,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
    num_runs: i64,
    extension_end: i64,
    now: i64,
) -> Result<crate::entities::extension::Model, OnDemandError> {
    let assignment = storage::get_assignment(db, course_id, assignment_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such assignment: {assignment_id}")))?;

    // One self-service extension per student per assignment. Without this a
    // student could stack requests, each with fresh runs and a later
    // deadline.
    let existing = storage::get_extensions(db, course_id, assignment_id, netid).await?;
    if existing.iter().any(|ext| ext.user_requested != 0) {
        return Err(OnDemandError::Validation(
            "An extension has already been requested for this assignment.".to_string(),
        ));
    }

    if num_runs < 0 {
        return Err(OnDemandError::Validation(
            "Extension run count cannot be negative.".to_string(),
        ));
    }
    if extension_end <= assignment.end {
        return Err(OnDemandError::Validation(
            "Extension must end after the assignment deadline.".to_string(),
        ));
    }

    let run_id = Uuid::new_v4().to_string();
    let request = ScheduleRunRequest {
        run_time: extension_end + DEADLINE_GRACE_PERIOD_SECS,
        due_time: extension_end,
        name: format!("Extension Run - {netid}"),
        roster: Some(vec![netid.to_string()]),
    };
    schedule_or_edit(
        db,
        scheduler,
        course_id,
        assignment_id,
        &run_id,
        &request,
        None,
        now,
    )
    .await?;

    storage::add_extension(
        db,
        course_id,
        assignment_id,
        netid,
        num_runs,
        assignment.end + 1,
        extension_end,
        Some(run_id),
        true,
    )
    .await
}

/// Staff removal of an extension; cascades deletion of its linked scheduled
/// run (and that run's external job, via the deletion protocol).
pub async fn delete_extension(
    db: &DatabaseConnection,
    scheduler: &dyn SchedulerApi,
    ext_id: i64,
) -> Result<(), OnDemandError> {
    let ext = storage::get_extension(db, ext_id)
        .await?
        .ok_or_else(|| OnDemandError::Validation(format!("No such extension: {ext_id}")))?;

    if let Some(run_id) = &ext.run_id {
        match delete_scheduled_run(db, scheduler, &ext.course_id, &ext.assignment_id, run_id).await
        {
            Ok(()) => {}
            Err(OnDemandError::Validation(_)) => {
                // Linked run already fired or was removed; nothing to cancel.
                tracing::warn!(ext_id, run_id = %run_id, "Extension's linked scheduled run no longer exists");
            }
            Err(e) => return Err(e),
        }
    }

    storage::remove_extension(db, ext_id).await?;
    Ok(())
}

/// Remove an assignment and cascade: every scheduled run is deleted through
/// the deletion protocol (cancelling external jobs), then extensions, then
/// the assignment record itself.
pub async fn delete_assignment(
    db: &DatabaseConnection,
    scheduler: &dyn SchedulerApi,
    course_id: &str,
    assignment_id: &str,
) -> Result<(), OnDemandError> {
    if storage::get_assignment(db, course_id, assignment_id).await?.is_none() {
        return Err(OnDemandError::Validation(
            "Assignment doesn't exist".to_string(),
        ));
    }

    let runs = storage::get_scheduled_runs_for_assignment(db, course_id, assignment_id).await?;
    for run in &runs {
        delete_scheduled_run(db, scheduler, course_id, assignment_id, &run.run_id).await?;
    }

    let extensions = storage::get_extensions_for_assignment(db, course_id, assignment_id).await?;
    for ext in &extensions {
        storage::remove_extension(db, ext.id).await?;
    }

    storage::remove_assignment(db, course_id, assignment_id).await?;
    Ok(())
}
