//! The scheduler daemon: a dumb, durable timer running as its own process.
//!
//! It owns a database-backed job queue (so pending triggers survive
//! restarts), exposes a small HTTP API for the portal to schedule,
//! reschedule, cancel, and list jobs, and runs a polling dispatch loop that
//! fires an authenticated HTTP callback into the portal when a job comes
//! due. No business logic lives here; delivery is at-least-once and the
//! portal's trigger handler is responsible for idempotency.

use crate::entities;
use crate::errors::OnDemandError;
use crate::settings::Settings;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

// ─── Durable job queue ──────────────────────────────────────────────────

pub async fn insert_job(
    db: &DatabaseConnection,
    fire_time: i64,
    course_id: &str,
    assignment_id: &str,
) -> Result<entities::scheduler_job::Model, OnDemandError> {
    let job = entities::scheduler_job::ActiveModel {
        job_id: Set(Uuid::new_v4().simple().to_string()),
        fire_time: Set(fire_time),
        course_id: Set(course_id.to_string()),
        assignment_id: Set(assignment_id.to_string()),
        created_at: Set(Utc::now().timestamp()),
    };
    Ok(job.insert(db).await?)
}

pub async fn get_job(
    db: &DatabaseConnection,
    job_id: &str,
) -> Result<Option<entities::scheduler_job::Model>, OnDemandError> {
    use entities::scheduler_job::{Column, Entity};
    Ok(Entity::find().filter(Column::JobId.eq(job_id)).one(db).await?)
}

pub async fn update_job_time(
    db: &DatabaseConnection,
    job_id: &str,
    fire_time: i64,
) -> Result<bool, OnDemandError> {
    use entities::scheduler_job::{Column, Entity};
    let result = Entity::update_many()
        .col_expr(Column::FireTime, Expr::value(fire_time))
        .filter(Column::JobId.eq(job_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

pub async fn delete_job(db: &DatabaseConnection, job_id: &str) -> Result<bool, OnDemandError> {
    use entities::scheduler_job::{Column, Entity};
    let result = Entity::delete_many()
        .filter(Column::JobId.eq(job_id))
        .exec(db)
        .await?;
    Ok(result.rows_affected > 0)
}

pub async fn list_jobs(
    db: &DatabaseConnection,
) -> Result<Vec<entities::scheduler_job::Model>, OnDemandError> {
    use entities::scheduler_job::{Column, Entity};
    Ok(Entity::find().order_by_asc(Column::FireTime).all(db).await?)
}

/// Jobs whose fire time has arrived, soonest first.
pub async fn due_jobs(
    db: &DatabaseConnection,
    now: i64,
) -> Result<Vec<entities::scheduler_job::Model>, OnDemandError> {
    use entities::scheduler_job::{Column, Entity};
    Ok(Entity::find()
        .filter(Column::FireTime.lte(now))
        .order_by_asc(Column::FireTime)
        .all(db)
        .await?)
}

// ─── HTTP API ───────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct DaemonState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    time: i64,
    course_id: String,
    assignment_id: String,
}

#[derive(Debug, Serialize)]
struct ScheduleResponse {
    scheduled_run_id: String,
}

#[derive(Debug, Deserialize)]
struct RescheduleRequest {
    time: i64,
}

fn internal_error(e: OnDemandError) -> (StatusCode, String) {
    tracing::error!(error = %e, "Scheduler daemon storage error");
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
}

async fn list_scheduled_runs(State(state): State<DaemonState>) -> impl IntoResponse {
    match list_jobs(&state.db).await {
        Ok(jobs) => {
            let runs: HashMap<String, i64> =
                jobs.into_iter().map(|j| (j.job_id, j.fire_time)).collect();
            Json(json!({ "scheduled_runs": runs })).into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn schedule_run(
    State(state): State<DaemonState>,
    Json(req): Json<ScheduleRequest>,
) -> impl IntoResponse {
    if req.time <= Utc::now().timestamp() {
        return (
            StatusCode::BAD_REQUEST,
            "Time must be in the future".to_string(),
        )
            .into_response();
    }
    match insert_job(&state.db, req.time, &req.course_id, &req.assignment_id).await {
        Ok(job) => {
            tracing::info!(
                job_id = %job.job_id,
                fire_time = job.fire_time,
                course_id = %job.course_id,
                assignment_id = %job.assignment_id,
                "Scheduled job"
            );
            Json(ScheduleResponse {
                scheduled_run_id: job.job_id,
            })
            .into_response()
        }
        Err(e) => internal_error(e).into_response(),
    }
}

async fn update_scheduled_run(
    State(state): State<DaemonState>,
    Path(job_id): Path<String>,
    Json(req): Json<RescheduleRequest>,
) -> impl IntoResponse {
    match update_job_time(&state.db, &job_id, req.time).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            format!("Scheduler does not contain run with id {job_id}"),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

async fn delete_scheduled_run(
    State(state): State<DaemonState>,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    match delete_job(&state.db, &job_id).await {
        Ok(true) => StatusCode::OK.into_response(),
        Ok(false) => (
            StatusCode::BAD_REQUEST,
            format!("Scheduler does not contain run with id {job_id}"),
        )
            .into_response(),
        Err(e) => internal_error(e).into_response(),
    }
}

pub fn router(state: DaemonState) -> Router {
    Router::new()
        .route("/api/scheduled_runs", get(list_scheduled_runs))
        .route("/api/schedule_run", post(schedule_run))
        .route(
            "/api/{job_id}",
            post(update_scheduled_run).delete(delete_scheduled_run),
        )
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Dispatch loop ──────────────────────────────────────────────────────

/// Fire one job: POST the trigger callback into the portal, then remove the
/// job row. A crash between the callback and the delete replays the
/// delivery on restart; the portal's trigger handler absorbs duplicates.
async fn fire_job(state: DaemonState, job: entities::scheduler_job::Model) {
    let url = format!(
        "{}/api/trigger/{}/{}/{}",
        state.settings.public_base_url(),
        job.course_id,
        job.assignment_id,
        job.job_id
    );

    let result = state
        .http
        .post(&url)
        .bearer_auth(&state.settings.auth.system_token)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::info!(job_id = %job.job_id, %url, "Successfully triggered scheduled run");
        }
        Ok(resp) => {
            tracing::warn!(
                job_id = %job.job_id,
                %url,
                status = %resp.status(),
                "Trigger callback was rejected"
            );
        }
        Err(e) => {
            tracing::warn!(job_id = %job.job_id, %url, error = %e, "Trigger callback failed");
        }
    }

    // The job is consumed whether or not the portal accepted the trigger:
    // the daemon never retries on its own.
    if let Err(e) = delete_job(&state.db, &job.job_id).await {
        tracing::error!(job_id = %job.job_id, error = %e, "Failed to remove fired job");
    }
}

/// Cooperative polling over the durable queue. Each due job is dispatched as
/// its own task so one slow or unreachable trigger handler cannot block
/// other jobs' timers.
pub async fn dispatch_loop(state: DaemonState) {
    let mut interval =
        tokio::time::interval(Duration::from_secs(state.settings.scheduler.poll_interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let now = Utc::now().timestamp();
        let due = match due_jobs(&state.db, now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to poll job queue");
                continue;
            }
        };
        for job in due {
            tracing::info!(job_id = %job.job_id, fire_time = job.fire_time, "Job due; dispatching");
            // A delivery still in flight at the next poll is dispatched
            // again; the trigger handler's status claim absorbs duplicates.
            tokio::spawn(fire_job(state.clone(), job));
        }
    }
}

/// Run the daemon: HTTP API plus the dispatch loop, until shutdown.
pub async fn serve(settings: Settings, db: DatabaseConnection) -> miette::Result<()> {
    let state = DaemonState {
        settings: Arc::new(settings),
        db,
        http: reqwest::Client::new(),
    };

    tokio::spawn(dispatch_loop(state.clone()));

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.scheduler.host, state.settings.scheduler.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, "Scheduler daemon listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| miette::miette!("bind failed: {e}"))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| miette::miette!("server error: {e}"))?;
    Ok(())
}
