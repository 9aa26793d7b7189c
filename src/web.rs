//! HTTP surface of the grading portal: the trigger callback invoked by the
//! scheduler daemon, staff management of scheduled runs / extensions /
//! assignments, and the student on-demand run and extension-request paths.
//!
//! Interactive login is handled upstream (reverse proxy / SSO); API callers
//! authenticate with the shared system bearer token and identify the acting
//! user via the `X-Netid` header, which is checked against course rosters.

use crate::errors::OnDemandError;
use crate::grading_api::GradingBackendApi;
use crate::quota;
use crate::runs;
use crate::sched_api::SchedulerApi;
use crate::settings::Settings;
use crate::storage;
use crate::trigger;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub scheduler: Arc<dyn SchedulerApi>,
    pub backend: Arc<dyn GradingBackendApi>,
}

type ApiError = (StatusCode, String);

fn map_error(e: OnDemandError) -> ApiError {
    match &e {
        OnDemandError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
        OnDemandError::SchedulerUnavailable(_) => (
            StatusCode::BAD_GATEWAY,
            "Failed to schedule, try again".to_string(),
        ),
        OnDemandError::BackendStartFailure(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
        OnDemandError::InconsistentReference(msg) => (StatusCode::NOT_FOUND, msg.clone()),
        _ => {
            tracing::error!(error = %e, "Internal error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal error".to_string(),
            )
        }
    }
}

// ─── Auth helpers ───────────────────────────────────────────────────────

fn require_bearer(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = format!("Bearer {}", state.settings.auth.system_token);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err((StatusCode::UNAUTHORIZED, "Unauthorized".to_string())),
    }
}

fn acting_netid(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-netid")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .filter(|s| runs::valid_id(s))
        .ok_or((
            StatusCode::BAD_REQUEST,
            "Missing or invalid X-Netid header".to_string(),
        ))
}

async fn require_staff(
    state: &AppState,
    headers: &HeaderMap,
    course_id: &str,
) -> Result<String, ApiError> {
    require_bearer(state, headers)?;
    let netid = acting_netid(headers)?;
    let course = storage::get_course(&state.db, course_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such course".to_string()))?;
    if !storage::is_staff(&course, &netid) {
        return Err((StatusCode::FORBIDDEN, "Forbidden".to_string()));
    }
    Ok(netid)
}

/// Students and staff may both act on student routes; returns whether the
/// caller is staff (staff bypass quota checks).
async fn require_student_or_staff(
    state: &AppState,
    headers: &HeaderMap,
    course_id: &str,
) -> Result<(String, bool), ApiError> {
    require_bearer(state, headers)?;
    let netid = acting_netid(headers)?;
    let course = storage::get_course(&state.db, course_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such course".to_string()))?;
    let staff = storage::is_staff(&course, &netid);
    if !staff && !storage::is_student(&course, &netid) {
        return Err((StatusCode::FORBIDDEN, "Forbidden".to_string()));
    }
    Ok((netid, staff))
}

// ─── Trigger callback (scheduler daemon → portal) ───────────────────────

async fn trigger_scheduled_run(
    State(state): State<AppState>,
    Path((course_id, assignment_id, job_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_bearer(&state, &headers)?;
    trigger::handle_trigger(
        &state.db,
        state.backend.as_ref(),
        &course_id,
        &assignment_id,
        &job_id,
    )
    .await
    .map_err(map_error)?;
    Ok(StatusCode::OK)
}

// ─── Staff: scheduled runs ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ScheduleRunBody {
    run_time: i64,
    due_time: i64,
    name: String,
    #[serde(default)]
    roster: Option<Vec<String>>,
}

async fn staff_list_scheduled_runs(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let runs = storage::get_scheduled_runs_for_assignment(&state.db, &course_id, &assignment_id)
        .await
        .map_err(map_error)?;
    Ok(Json(json!({ "scheduled_runs": runs })))
}

async fn staff_create_scheduled_run(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ScheduleRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let run_id = Uuid::new_v4().to_string();
    let request = runs::ScheduleRunRequest {
        run_time: body.run_time,
        due_time: body.due_time,
        name: body.name,
        roster: body.roster,
    };
    let run = runs::schedule_or_edit(
        &state.db,
        state.scheduler.as_ref(),
        &course_id,
        &assignment_id,
        &run_id,
        &request,
        None,
        Utc::now().timestamp(),
    )
    .await
    .map_err(map_error)?;
    Ok(Json(json!({ "run_id": run.run_id })))
}

async fn staff_edit_scheduled_run(
    State(state): State<AppState>,
    Path((course_id, assignment_id, run_id)): Path<(String, String, String)>,
    headers: HeaderMap,
    Json(body): Json<ScheduleRunBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let existing = storage::get_scheduled_run(&state.db, &course_id, &assignment_id, &run_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such scheduled run".to_string()))?;
    let request = runs::ScheduleRunRequest {
        run_time: body.run_time,
        due_time: body.due_time,
        name: body.name,
        roster: body.roster,
    };
    runs::schedule_or_edit(
        &state.db,
        state.scheduler.as_ref(),
        &course_id,
        &assignment_id,
        &run_id,
        &request,
        Some(&existing.scheduler_job_id),
        Utc::now().timestamp(),
    )
    .await
    .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn staff_delete_scheduled_run(
    State(state): State<AppState>,
    Path((course_id, assignment_id, run_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    runs::delete_scheduled_run(
        &state.db,
        state.scheduler.as_ref(),
        &course_id,
        &assignment_id,
        &run_id,
    )
    .await
    .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Pending jobs as the daemon sees them, for operational dashboards.
async fn staff_list_daemon_jobs(
    State(state): State<AppState>,
    Path(course_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let jobs = state
        .scheduler
        .list_scheduled_runs()
        .await
        .map_err(map_error)?;
    Ok(Json(json!({ "scheduled_runs": jobs })))
}

// ─── Staff: assignments ─────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AssignmentBody {
    max_runs: i64,
    quota: String,
    start: i64,
    end: i64,
    visibility: String,
}

fn validate_assignment_body(body: &AssignmentBody) -> Result<(), ApiError> {
    if body.max_runs < 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Max Runs must be a positive integer.".to_string(),
        ));
    }
    if quota::Quota::parse(&body.quota).is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Quota Type is invalid.".to_string(),
        ));
    }
    if body.start >= body.end {
        return Err((
            StatusCode::BAD_REQUEST,
            "Start must be before End.".to_string(),
        ));
    }
    Ok(())
}

async fn staff_add_assignment(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<AssignmentBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    if !runs::valid_id(&assignment_id) {
        return Err((
            StatusCode::BAD_REQUEST,
            "Invalid Assignment ID. Allowed characters: a-z A-Z 0-9 _ - .".to_string(),
        ));
    }
    validate_assignment_body(&body)?;
    if storage::get_assignment(&state.db, &course_id, &assignment_id)
        .await
        .map_err(map_error)?
        .is_some()
    {
        return Err((
            StatusCode::BAD_REQUEST,
            "Assignment ID already exists.".to_string(),
        ));
    }
    storage::add_assignment(
        &state.db,
        &course_id,
        &assignment_id,
        body.max_runs,
        &body.quota,
        body.start,
        body.end,
        &body.visibility,
    )
    .await
    .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn staff_edit_assignment(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<AssignmentBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    validate_assignment_body(&body)?;
    let updated = storage::update_assignment(
        &state.db,
        &course_id,
        &assignment_id,
        body.max_runs,
        &body.quota,
        body.start,
        body.end,
        &body.visibility,
    )
    .await
    .map_err(map_error)?;
    if !updated {
        return Err((
            StatusCode::BAD_REQUEST,
            "Save failed or no changes were made.".to_string(),
        ));
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn staff_delete_assignment(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    runs::delete_assignment(
        &state.db,
        state.scheduler.as_ref(),
        &course_id,
        &assignment_id,
    )
    .await
    .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Staff: extensions ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ExtensionBody {
    netids: Vec<String>,
    max_runs: i64,
    start: i64,
    end: i64,
}

async fn staff_list_extensions(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let extensions =
        storage::get_extensions_for_assignment(&state.db, &course_id, &assignment_id)
            .await
            .map_err(map_error)?;
    Ok(Json(json!({ "extensions": extensions })))
}

async fn staff_add_extensions(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ExtensionBody>,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    if body.netids.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Missing fields.".to_string()));
    }
    for netid in &body.netids {
        runs::grant_extension(
            &state.db,
            &course_id,
            &assignment_id,
            &netid.to_lowercase(),
            body.max_runs,
            body.start,
            body.end,
        )
        .await
        .map_err(map_error)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn staff_delete_extension(
    State(state): State<AppState>,
    Path((course_id, assignment_id, ext_id)): Path<(String, String, i64)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    require_staff(&state, &headers, &course_id).await?;
    let ext = storage::get_extension(&state.db, ext_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such extension".to_string()))?;
    if ext.course_id != course_id || ext.assignment_id != assignment_id {
        return Err((StatusCode::NOT_FOUND, "No such extension".to_string()));
    }
    runs::delete_extension(&state.db, state.scheduler.as_ref(), ext_id)
        .await
        .map_err(map_error)?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── Student routes ─────────────────────────────────────────────────────

async fn student_assignment_status(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (netid, staff) = require_student_or_staff(&state, &headers, &course_id).await?;
    let assignment = storage::get_assignment(&state.db, &course_id, &assignment_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such assignment".to_string()))?;
    let tz = state.settings.tz().map_err(map_error)?;
    let now = Utc::now().timestamp();

    let history =
        storage::get_assignment_runs_for_student(&state.db, &course_id, &assignment_id, &netid)
            .await
            .map_err(map_error)?;
    let extensions = storage::get_extensions(&state.db, &course_id, &assignment_id, &netid)
        .await
        .map_err(map_error)?;

    let mut available = quota::available_runs(&assignment, &history, now, tz);
    let (_, extension_runs) = quota::active_extensions(&extensions, now);
    if staff {
        available = available.max(1);
    }

    Ok(Json(json!({
        "runs": history,
        "available_runs": available,
        "extension_runs": extension_runs,
    })))
}

async fn student_start_run(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (netid, staff) = require_student_or_staff(&state, &headers, &course_id).await?;
    let tz = state.settings.tz().map_err(map_error)?;
    let run = runs::record_student_run(
        &state.db,
        state.backend.as_ref(),
        &course_id,
        &assignment_id,
        &netid,
        tz,
        Utc::now().timestamp(),
        staff,
    )
    .await
    .map_err(map_error)?;
    Ok(Json(json!({ "run_id": run.run_id })))
}

/// Proxy the backend's status for one of the caller's own runs.
async fn student_run_status(
    State(state): State<AppState>,
    Path((course_id, assignment_id, run_id)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let (netid, staff) = require_student_or_staff(&state, &headers, &course_id).await?;
    let history =
        storage::get_assignment_runs_for_student(&state.db, &course_id, &assignment_id, &netid)
            .await
            .map_err(map_error)?;
    if !staff && !history.iter().any(|run| run.run_id == run_id) {
        return Err((StatusCode::NOT_FOUND, "No such grading run".to_string()));
    }
    let status = state
        .backend
        .get_run_status(&course_id, &run_id)
        .await
        .ok_or((
            StatusCode::BAD_GATEWAY,
            "Failed to get run status".to_string(),
        ))?;
    Ok(Json(json!({ "status": status })))
}

#[derive(Debug, Deserialize)]
struct ExtensionRequestBody {
    num_hours: i64,
}

async fn student_request_extension(
    State(state): State<AppState>,
    Path((course_id, assignment_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<ExtensionRequestBody>,
) -> Result<impl IntoResponse, ApiError> {
    let (netid, _) = require_student_or_staff(&state, &headers, &course_id).await?;
    let assignment = storage::get_assignment(&state.db, &course_id, &assignment_id)
        .await
        .map_err(map_error)?
        .ok_or((StatusCode::NOT_FOUND, "No such assignment".to_string()))?;
    if body.num_hours < 1 {
        return Err((
            StatusCode::BAD_REQUEST,
            "Extension hours must be positive.".to_string(),
        ));
    }

    // The allowance may legitimately be zero (e.g. a sub-day extension on a
    // DAILY assignment): the deadline still moves, no extra runs come with it.
    let num_runs = runs::extension_run_allowance(&assignment, body.num_hours);
    let extension_end = assignment.end + body.num_hours * 3600;
    let ext = runs::request_extension(
        &state.db,
        state.scheduler.as_ref(),
        &course_id,
        &assignment_id,
        &netid,
        num_runs,
        extension_end,
        Utc::now().timestamp(),
    )
    .await
    .map_err(map_error)?;
    Ok(Json(json!({ "extension_id": ext.id, "remaining_runs": ext.remaining_runs })))
}

// ─── Router / server ────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/trigger/{course_id}/{assignment_id}/{job_id}",
            post(trigger_scheduled_run),
        )
        .route(
            "/staff/course/{course_id}/scheduler_jobs",
            get(staff_list_daemon_jobs),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/scheduled_runs",
            get(staff_list_scheduled_runs).post(staff_create_scheduled_run),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/scheduled_runs/{run_id}",
            post(staff_edit_scheduled_run).delete(staff_delete_scheduled_run),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/add",
            post(staff_add_assignment),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/edit",
            post(staff_edit_assignment),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/delete",
            post(staff_delete_assignment),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/extensions",
            get(staff_list_extensions).post(staff_add_extensions),
        )
        .route(
            "/staff/course/{course_id}/{assignment_id}/extensions/{ext_id}",
            axum::routing::delete(staff_delete_extension),
        )
        .route(
            "/student/course/{course_id}/{assignment_id}",
            get(student_assignment_status),
        )
        .route(
            "/student/course/{course_id}/{assignment_id}/run",
            post(student_start_run),
        )
        .route(
            "/student/course/{course_id}/{assignment_id}/run/{run_id}/status",
            get(student_run_status),
        )
        .route(
            "/student/course/{course_id}/{assignment_id}/extensions",
            post(student_request_extension),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(
    settings: Settings,
    db: DatabaseConnection,
    scheduler: Arc<dyn SchedulerApi>,
    backend: Arc<dyn GradingBackendApi>,
) -> miette::Result<()> {
    let state = AppState {
        settings: Arc::new(settings),
        db,
        scheduler,
        backend,
    };

    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    tracing::info!(%addr, "Portal listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| miette::miette!("bind failed: {e}"))?;
    axum::serve(listener, router(state))
        .await
        .map_err(|e| miette::miette!("server error: {e}"))?;
    Ok(())
}
