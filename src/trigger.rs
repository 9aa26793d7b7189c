//! Fire-time handling for scheduled runs. The scheduler daemon guarantees
//! at-least-once delivery, so everything here must tolerate duplicate and
//! replayed invocations for the same job id.

use crate::errors::OnDemandError;
use crate::grading_api::GradingBackendApi;
use crate::storage::{self, RunStatus};
use sea_orm::DatabaseConnection;

/// Process a trigger delivery from the scheduler daemon.
///
/// Looks up every store record referencing the job id (legacy duplicate
/// scheduling can produce more than one), claims each via the atomic status
/// transition, resolves its roster, and starts the backend run. Returns an
/// error if any matched record failed to start; a failed trigger requires
/// manual staff intervention, because a blind retry could double-grade
/// students whose run already started.
pub async fn handle_trigger(
    db: &DatabaseConnection,
    backend: &dyn GradingBackendApi,
    course_id: &str,
    assignment_id: &str,
    scheduler_job_id: &str,
) -> Result<(), OnDemandError> {
    let runs =
        storage::get_scheduled_runs_by_scheduler_id(db, course_id, assignment_id, scheduler_job_id)
            .await?;

    if runs.is_empty() {
        tracing::warn!(
            course_id,
            assignment_id,
            scheduler_job_id,
            "Trigger fired for a job id with no scheduled run records"
        );
        return Err(OnDemandError::InconsistentReference(format!(
            "No scheduled run for job id {scheduler_job_id}"
        )));
    }

    if runs.len() > 1 {
        tracing::warn!(
            scheduler_job_id,
            count = runs.len(),
            "Scheduler job id referenced by multiple records; processing all"
        );
    }

    let mut failures = 0usize;
    for run in &runs {
        if !process_one(db, backend, run).await? {
            failures += 1;
        }
    }

    if failures > 0 {
        return Err(OnDemandError::BackendStartFailure(format!(
            "{failures} of {} scheduled run(s) for job {scheduler_job_id} failed to start",
            runs.len()
        )));
    }
    Ok(())
}

/// Handle a single matched record. Returns Ok(true) on success or benign
/// skip, Ok(false) if the record terminally failed. A failure here never
/// aborts processing of sibling records.
async fn process_one(
    db: &DatabaseConnection,
    backend: &dyn GradingBackendApi,
    run: &crate::entities::scheduled_run::Model,
) -> Result<bool, OnDemandError> {
    if RunStatus::parse(&run.status) != Some(RunStatus::Scheduled) {
        // Already processed: this is the idempotency guard against duplicate
        // daemon deliveries.
        tracing::warn!(
            run_id = %run.run_id,
            status = %run.status,
            "Skipping scheduled run that is not in 'scheduled' state"
        );
        return Ok(true);
    }

    let roster = match resolve_roster(db, run).await {
        Ok(roster) => roster,
        Err(e) => {
            tracing::error!(run_id = %run.run_id, error = %e, "Roster resolution failed");
            // Claim before marking failed so a concurrent delivery cannot
            // also act on this record.
            storage::claim_scheduled_run(db, &run.run_id, RunStatus::Failed).await?;
            return Ok(false);
        }
    };

    // First delivery to observe 'scheduled' wins; everyone else backs off.
    if !storage::claim_scheduled_run(db, &run.run_id, RunStatus::Ran).await? {
        tracing::warn!(
            run_id = %run.run_id,
            "Scheduled run was claimed by a concurrent delivery; skipping"
        );
        return Ok(true);
    }

    match backend
        .start_run(&run.course_id, &run.assignment_id, &roster, run.due_time)
        .await
    {
        Some(backend_run_id) => {
            storage::set_scheduled_run_backend_id(db, &run.run_id, &backend_run_id).await?;
            tracing::info!(
                run_id = %run.run_id,
                backend_run_id = %backend_run_id,
                students = roster.len(),
                "Scheduled grading run started"
            );
            Ok(true)
        }
        None => {
            // We hold the claim; correct the optimistic `ran`. Scoped to the
            // transient claimed state (`ran` with no backend id) so a record
            // that genuinely started can never be flipped to `failed`.
            use crate::entities::scheduled_run::{Column, Entity};
            use sea_orm::sea_query::Expr;
            use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
            Entity::update_many()
                .col_expr(Column::Status, Expr::value(RunStatus::Failed.as_str()))
                .filter(Column::RunId.eq(run.run_id.clone()))
                .filter(Column::Status.eq(RunStatus::Ran.as_str()))
                .filter(Column::BackendRunId.is_null())
                .exec(db)
                .await?;
            tracing::error!(run_id = %run.run_id, "Backend refused to start scheduled run");
            Ok(false)
        }
    }
}

/// A stored fixed roster wins; `NULL` resolves to the full course roster at
/// fire time.
async fn resolve_roster(
    db: &DatabaseConnection,
    run: &crate::entities::scheduled_run::Model,
) -> Result<Vec<String>, OnDemandError> {
    if let Some(fixed) = storage::scheduled_run_roster(run)? {
        return Ok(fixed);
    }
    let course = storage::get_course(db, &run.course_id)
        .await?
        .ok_or_else(|| {
            OnDemandError::InconsistentReference(format!(
                "Course {} not found while resolving roster",
                run.course_id
            ))
        })?;
    storage::course_roster(&course)
}
