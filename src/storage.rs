use crate::entities;
use crate::errors::OnDemandError;
use crate::settings::Database as DbCfg;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Database, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set,
};

/// Lifecycle of a scheduled run. `Scheduled` is the only non-terminal state;
/// transitions out of it happen exactly once, through [`claim_scheduled_run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Scheduled,
    Ran,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Scheduled => "scheduled",
            RunStatus::Ran => "ran",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<RunStatus> {
        match s {
            "scheduled" => Some(RunStatus::Scheduled),
            "ran" => Some(RunStatus::Ran),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

/// Fields a caller may set when creating or editing a scheduled run. Status
/// and backend run id are deliberately absent; those move only through their
/// dedicated operations.
#[derive(Debug, Clone)]
pub struct ScheduledRunParams {
    pub run_time: i64,
    pub due_time: i64,
    pub name: String,
    /// `None` means "resolve to the full course roster at fire time"
    pub roster: Option<Vec<String>>,
    pub scheduler_job_id: String,
}

pub async fn init(cfg: &DbCfg) -> Result<DatabaseConnection, OnDemandError> {
    let db = Database::connect(&cfg.url).await?;
    Ok(db)
}

// ─── Courses ────────────────────────────────────────────────────────────

pub async fn create_course(
    db: &DatabaseConnection,
    course_id: &str,
    name: &str,
    student_ids: &[String],
    staff_ids: &[String],
    backend_token: &str,
) -> Result<entities::course::Model, OnDemandError> {
    let course = entities::course::ActiveModel {
        course_id: Set(course_id.to_string()),
        name: Set(name.to_string()),
        student_ids: Set(serde_json::to_string(student_ids)?),
        staff_ids: Set(serde_json::to_string(staff_ids)?),
        backend_token: Set(backend_token.to_string()),
    };
    Ok(course.insert(db).await?)
}

pub async fn get_course(
    db: &DatabaseConnection,
    course_id: &str,
) -> Result<Option<entities::course::Model>, OnDemandError> {
    use entities::course::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .one(db)
        .await?)
}

/// Parse a JSON netid-array column.
pub fn parse_netids(json: &str) -> Result<Vec<String>, OnDemandError> {
    Ok(serde_json::from_str(json)?)
}

pub fn course_roster(course: &entities::course::Model) -> Result<Vec<String>, OnDemandError> {
    parse_netids(&course.student_ids)
}

pub fn is_student(course: &entities::course::Model, netid: &str) -> bool {
    parse_netids(&course.student_ids)
        .map(|ids| ids.iter().any(|id| id == netid))
        .unwrap_or(false)
}

pub fn is_staff(course: &entities::course::Model, netid: &str) -> bool {
    parse_netids(&course.staff_ids)
        .map(|ids| ids.iter().any(|id| id == netid))
        .unwrap_or(false)
}

// ─── Assignments ────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn add_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    max_runs: i64,
    quota: &str,
    start: i64,
    end: i64,
    visibility: &str,
) -> Result<entities::assignment::Model, OnDemandError> {
    let assignment = entities::assignment::ActiveModel {
        course_id: Set(course_id.to_string()),
        assignment_id: Set(assignment_id.to_string()),
        max_runs: Set(max_runs),
        quota: Set(quota.to_string()),
        start: Set(start),
        end: Set(end),
        visibility: Set(visibility.to_string()),
    };
    Ok(assignment.insert(db).await?)
}

pub async fn get_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
) -> Result<Option<entities::assignment::Model>, OnDemandError> {
    use entities::assignment::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .one(db)
        .await?)
}

pub async fn get_assignments_for_course(
    db: &DatabaseConnection,
    course_id: &str,
) -> Result<Vec<entities::assignment::Model>, OnDemandError> {
    use entities::assignment::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .order_by_asc(Column::Start)
        .all(db)
        .await?)
}

#[allow(clippy::too_many_arguments)]
pub async fn update_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    max_runs: i64,
    quota: &str,
    start: i64,
    end: i64,
    visibility: &str,
) -> Result<bool, OnDemandError> {
    use entities::assignment::{Column, Entity};
    let result = Entity::update_many()
        .col_expr(Column::MaxRuns, Expr::value(max_runs))
        .col_expr(Column::Quota, Expr::value(quota))
        .col_expr(Column::Start, Expr::value(start))
        .col_expr(Column::End, Expr::value(end))
        .col_expr(Column::Visibility, Expr::value(visibility))
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

pub async fn remove_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
) -> Result<bool, OnDemandError> {
    use entities::assignment::{Column, Entity};
    let result = Entity::delete_many()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

// ─── Scheduled runs ─────────────────────────────────────────────────────

/// Upsert a scheduled run. Creates the record with status `scheduled` if it
/// does not exist; otherwise merges the given fields into the existing record,
/// leaving status and backend run id untouched. Used both for first
/// scheduling and for edits.
pub async fn create_or_update_scheduled_run(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
    params: &ScheduledRunParams,
) -> Result<entities::scheduled_run::Model, OnDemandError> {
    let roster_json = match &params.roster {
        Some(netids) => Some(serde_json::to_string(netids)?),
        None => None,
    };

    match get_scheduled_run(db, course_id, assignment_id, run_id).await? {
        Some(existing) => {
            let mut active: entities::scheduled_run::ActiveModel = existing.into();
            active.run_time = Set(params.run_time);
            active.due_time = Set(params.due_time);
            active.name = Set(params.name.clone());
            active.roster = Set(roster_json);
            active.scheduler_job_id = Set(params.scheduler_job_id.clone());
            Ok(active.update(db).await?)
        }
        None => {
            let run = entities::scheduled_run::ActiveModel {
                run_id: Set(run_id.to_string()),
                course_id: Set(course_id.to_string()),
                assignment_id: Set(assignment_id.to_string()),
                run_time: Set(params.run_time),
                due_time: Set(params.due_time),
                roster: Set(roster_json),
                name: Set(params.name.clone()),
                scheduler_job_id: Set(params.scheduler_job_id.clone()),
                backend_run_id: Set(None),
                status: Set(RunStatus::Scheduled.as_str().to_string()),
            };
            Ok(run.insert(db).await?)
        }
    }
}

pub async fn get_scheduled_run(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
) -> Result<Option<entities::scheduled_run::Model>, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::RunId.eq(run_id))
        .one(db)
        .await?)
}

pub async fn get_scheduled_runs_for_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
) -> Result<Vec<entities::scheduled_run::Model>, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .order_by_asc(Column::RunTime)
        .all(db)
        .await?)
}

/// All records referencing a scheduler job id within one assignment. Returns
/// a list: legacy duplicate-scheduling bugs can associate one external job
/// with more than one record, and callers must process every match.
pub async fn get_scheduled_runs_by_scheduler_id(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    scheduler_job_id: &str,
) -> Result<Vec<entities::scheduled_run::Model>, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::SchedulerJobId.eq(scheduler_job_id))
        .all(db)
        .await?)
}

/// Atomically transition a run out of `scheduled` into a terminal status.
/// Returns false if the run was not in `scheduled` (already claimed by a
/// concurrent or earlier delivery). This compare-and-set is the idempotency
/// guard; callers must not read-then-write the status column.
pub async fn claim_scheduled_run(
    db: &DatabaseConnection,
    run_id: &str,
    to: RunStatus,
) -> Result<bool, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    let result = Entity::update_many()
        .col_expr(Column::Status, Expr::value(to.as_str()))
        .filter(Column::RunId.eq(run_id))
        .filter(Column::Status.eq(RunStatus::Scheduled.as_str()))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

pub async fn set_scheduled_run_backend_id(
    db: &DatabaseConnection,
    run_id: &str,
    backend_run_id: &str,
) -> Result<(), OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    Entity::update_many()
        .col_expr(Column::BackendRunId, Expr::value(backend_run_id))
        .filter(Column::RunId.eq(run_id))
        .exec(db)
        .await?;
    Ok(())
}

pub async fn delete_scheduled_run(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
) -> Result<bool, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    let result = Entity::delete_many()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::RunId.eq(run_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// How many scheduled runs reference this external job id, across the whole
/// store. Checked before cancelling the external job so a shared reference
/// is never cancelled out from under a sibling record.
pub async fn count_runs_referencing_job(
    db: &DatabaseConnection,
    scheduler_job_id: &str,
) -> Result<u64, OnDemandError> {
    use entities::scheduled_run::{Column, Entity};
    use sea_orm::PaginatorTrait;
    Ok(Entity::find()
        .filter(Column::SchedulerJobId.eq(scheduler_job_id))
        .count(db)
        .await?)
}

pub fn scheduled_run_roster(
    run: &entities::scheduled_run::Model,
) -> Result<Option<Vec<String>>, OnDemandError> {
    match &run.roster {
        Some(json) => Ok(Some(parse_netids(json)?)),
        None => Ok(None),
    }
}

// ─── Extensions ─────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn add_extension(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
    max_runs: i64,
    start: i64,
    end: i64,
    run_id: Option<String>,
    user_requested: bool,
) -> Result<entities::extension::Model, OnDemandError> {
    let extension = entities::extension::ActiveModel {
        id: sea_orm::NotSet,
        course_id: Set(course_id.to_string()),
        assignment_id: Set(assignment_id.to_string()),
        netid: Set(netid.to_string()),
        max_runs: Set(max_runs),
        remaining_runs: Set(max_runs),
        start: Set(start),
        end: Set(end),
        run_id: Set(run_id),
        user_requested: Set(if user_requested { 1 } else { 0 }),
    };
    Ok(extension.insert(db).await?)
}

pub async fn get_extension(
    db: &DatabaseConnection,
    id: i64,
) -> Result<Option<entities::extension::Model>, OnDemandError> {
    use entities::extension::{Column, Entity};
    Ok(Entity::find().filter(Column::Id.eq(id)).one(db).await?)
}

pub async fn get_extensions(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
) -> Result<Vec<entities::extension::Model>, OnDemandError> {
    use entities::extension::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::Netid.eq(netid))
        .order_by_asc(Column::End)
        .all(db)
        .await?)
}

pub async fn get_extensions_for_assignment(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
) -> Result<Vec<entities::extension::Model>, OnDemandError> {
    use entities::extension::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .order_by_asc(Column::End)
        .all(db)
        .await?)
}

pub async fn remove_extension(db: &DatabaseConnection, id: i64) -> Result<bool, OnDemandError> {
    use entities::extension::{Column, Entity};
    let result = Entity::delete_many()
        .filter(Column::Id.eq(id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Decrement `remaining_runs` by one, but only if the extension still has
/// runs left and its validity window contains `now`. The guard is part of the
/// update itself so concurrent consumers cannot drive the counter negative.
pub async fn consume_extension_run(
    db: &DatabaseConnection,
    id: i64,
    now: i64,
) -> Result<bool, OnDemandError> {
    use entities::extension::{Column, Entity};
    let result = Entity::update_many()
        .col_expr(
            Column::RemainingRuns,
            Expr::col(Column::RemainingRuns).sub(1),
        )
        .filter(Column::Id.eq(id))
        .filter(Column::RemainingRuns.gt(0))
        .filter(Column::Start.lte(now))
        .filter(Column::End.gte(now))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

/// Give back a previously consumed run (run retraction path). Guarded so the
/// counter can never exceed `max_runs`.
pub async fn restore_extension_run(db: &DatabaseConnection, id: i64) -> Result<bool, OnDemandError> {
    use entities::extension::{Column, Entity};
    let result = Entity::update_many()
        .col_expr(
            Column::RemainingRuns,
            Expr::col(Column::RemainingRuns).add(1),
        )
        .filter(Column::Id.eq(id))
        .filter(Expr::col(Column::RemainingRuns).lt(Expr::col(Column::MaxRuns)))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

// ─── Grading run history ────────────────────────────────────────────────

pub async fn add_grading_run(
    db: &DatabaseConnection,
    run_id: &str,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
    timestamp: i64,
    extension_used: Option<i64>,
) -> Result<entities::grading_run::Model, OnDemandError> {
    let run = entities::grading_run::ActiveModel {
        run_id: Set(run_id.to_string()),
        course_id: Set(course_id.to_string()),
        assignment_id: Set(assignment_id.to_string()),
        netid: Set(netid.to_string()),
        timestamp: Set(timestamp),
        extension_used: Set(extension_used),
    };
    Ok(run.insert(db).await?)
}

/// Rekey a history record once the backend assigns the real run id. Returns
/// the rekeyed record, or `None` if the provisional record is gone.
pub async fn set_grading_run_id(
    db: &DatabaseConnection,
    run_id: &str,
    new_run_id: &str,
) -> Result<Option<entities::grading_run::Model>, OnDemandError> {
    use entities::grading_run::{Column, Entity};
    Entity::update_many()
        .col_expr(Column::RunId, Expr::value(new_run_id))
        .filter(Column::RunId.eq(run_id))
        .exec(db)
        .await?;
    Ok(Entity::find()
        .filter(Column::RunId.eq(new_run_id))
        .one(db)
        .await?)
}

/// A student's runs for an assignment, most recent first.
pub async fn get_assignment_runs_for_student(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    netid: &str,
) -> Result<Vec<entities::grading_run::Model>, OnDemandError> {
    use entities::grading_run::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::Netid.eq(netid))
        .order_by_desc(Column::Timestamp)
        .all(db)
        .await?)
}

/// Retract a recorded run (used when the backend refuses to start it).
/// Returns the removed record so the caller can restore any consumed
/// extension run.
pub async fn remove_grading_run(
    db: &DatabaseConnection,
    course_id: &str,
    assignment_id: &str,
    run_id: &str,
) -> Result<Option<entities::grading_run::Model>, OnDemandError> {
    use entities::grading_run::{Column, Entity};
    let existing = Entity::find()
        .filter(Column::CourseId.eq(course_id))
        .filter(Column::AssignmentId.eq(assignment_id))
        .filter(Column::RunId.eq(run_id))
        .one(db)
        .await?;
    if let Some(run) = &existing {
        Entity::delete_many()
            .filter(Column::RunId.eq(run.run_id.clone()))
            .exec(db)
            .await?;
    }
    Ok(existing)
}
