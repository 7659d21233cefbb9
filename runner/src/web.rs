//! Web interface of the runner.
//!
//! Workers talk to this API: they request assignments, stream logs (which
//! doubles as their heartbeat), and post results. Operators use the same
//! surface for queue introspection and administrative scheduling.

use crate::auth::{AuthError, WorkerAuthService};
use crate::AppState;
use axum::{
    body::Bytes,
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use janitor::api::{AssignRequest, FinishReport, HeartbeatResponse};
use janitor::error::JanitorError;
use serde_json::json;
use std::sync::Arc;

/// Error wrapper that renders the shared taxonomy as HTTP.
pub struct AppError(JanitorError);

impl From<JanitorError> for AppError {
    fn from(e: JanitorError) -> Self {
        AppError(e)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        AppError(e.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            log::error!("Request failed: {}", self.0);
        }
        let mut response = (status, Json(json!({"reason": self.0.to_string()}))).into_response();
        if let Some(retry_after) = self.0.retry_after() {
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

fn auth_header(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError(JanitorError::Auth("missing authorization header".into())))
}

fn map_auth_error(e: AuthError) -> AppError {
    match e {
        AuthError::Database(e) => AppError(e.into()),
        other => AppError(JanitorError::Auth(other.to_string())),
    }
}

async fn assign(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, AppError> {
    let auth = WorkerAuthService::new(state.database.clone());
    let worker = auth
        .authenticate_worker(auth_header(&headers)?)
        .await
        .map_err(map_auth_error)?;

    let request: AssignRequest = if body.is_empty() {
        AssignRequest::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| JanitorError::validation(format!("bad request body: {}", e)))?
    };

    match state
        .assign(&worker.name, worker.link.as_deref(), &request)
        .await
    {
        Ok(Some(bundle)) => Ok((StatusCode::CREATED, Json(bundle)).into_response()),
        Ok(None) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(crate::AssignmentError::Sql(e)) => Err(e.into()),
        Err(e) => Err(AppError(JanitorError::internal(e.to_string()))),
    }
}

async fn append_log(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let auth = WorkerAuthService::new(state.database.clone());
    auth.authenticate_run(&id, auth_header(&headers)?)
        .await
        .map_err(map_auth_error)?;

    if !janitor::logs::is_log_filename(&name) {
        return Err(AppError(JanitorError::validation(format!(
            "not a log filename: {}",
            name
        ))));
    }

    let active = state
        .database
        .get_active_run(&id)
        .await?
        .ok_or_else(|| JanitorError::not_found("active run", id.clone()))?;

    let position = state
        .log_manager
        .append_log(&active.codebase, &id, &name, &body)
        .await
        .map_err(|e| JanitorError::internal(format!("log append failed: {}", e)))?;

    // A log chunk is also a heartbeat.
    let kill = state
        .database
        .record_ping(&id, Some(position as i64))
        .await?
        .ok_or_else(|| JanitorError::conflict(format!("run {} no longer active", id)))?;

    Ok(Json(HeartbeatResponse { kill }))
}

async fn ping(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let auth = WorkerAuthService::new(state.database.clone());
    auth.authenticate_run(&id, auth_header(&headers)?)
        .await
        .map_err(map_auth_error)?;

    let kill = state
        .database
        .record_ping(&id, None)
        .await?
        .ok_or_else(|| JanitorError::conflict(format!("run {} no longer active", id)))?;

    Ok(Json(HeartbeatResponse { kill }))
}

async fn finish(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let auth = WorkerAuthService::new(state.database.clone());
    let worker = auth
        .authenticate_run(&id, auth_header(&headers)?)
        .await
        .map_err(map_auth_error)?;

    let mut report: Option<FinishReport> = None;
    let mut files: Vec<(String, Vec<u8>)> = vec![];

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| JanitorError::validation(format!("bad multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(|f| f.to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| JanitorError::validation(format!("bad multipart body: {}", e)))?;
        if name == "result" {
            report = Some(
                serde_json::from_slice(&data)
                    .map_err(|e| JanitorError::validation(format!("bad result JSON: {}", e)))?,
            );
        } else {
            files.push((filename.unwrap_or(name), data.to_vec()));
        }
    }

    let report =
        report.ok_or_else(|| JanitorError::validation("missing result field".to_string()))?;

    let summary = state.finish_run(&id, &worker.name, &report, files).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

async fn kill(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.database.request_kill(&id).await? {
        log::info!("Kill requested for run {}", id);
        Ok(Json(json!({"id": id, "kill_requested": true})))
    } else {
        Err(AppError(JanitorError::not_found("active run", id)))
    }
}

async fn get_active_runs(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let runs = state.database.get_active_runs().await?;
    Ok(Json(json!({
        "processing": runs.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
    })))
}

async fn get_active_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    match state.database.get_active_run(&id).await? {
        Some(run) => Ok(Json(run.to_json())),
        None => Err(AppError(JanitorError::not_found("active run", id))),
    }
}

async fn get_queue(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let queue = state.database.queue();
    let items = queue.peek(100).await?;
    let buckets = queue.get_buckets().await?;
    let total_estimated = state.database.estimated_duration_sum().await?;
    Ok(Json(json!({
        "total_estimated_duration_seconds": total_estimated.map(|d| d.num_seconds()),
        "queue": items
            .iter()
            .map(|item| json!({
                "id": item.id,
                "codebase": item.codebase,
                "campaign": item.campaign,
                "bucket": item.bucket,
                "requester": item.requester,
                "refresh": item.refresh,
                "attempt_count": item.attempt_count,
            }))
            .collect::<Vec<_>>(),
        "buckets": buckets
            .into_iter()
            .map(|(name, count)| json!({"name": name, "count": count}))
            .collect::<Vec<_>>(),
    })))
}

#[derive(serde::Deserialize)]
struct PositionQuery {
    codebase: String,
    campaign: String,
}

async fn queue_position(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PositionQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let queue = state.database.queue();
    match queue.get_position(&query.campaign, &query.codebase).await? {
        Some(eta) => Ok(Json(json!({
            "position": eta.position,
            "wait_time": eta.wait_time.microseconds / 1_000_000,
        }))),
        None => Ok(Json(json!({"position": null, "wait_time": null}))),
    }
}

async fn drop_queue_item(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    if state.database.queue().drop_item(id).await? {
        Ok(Json(json!({"id": id, "dropped": true})))
    } else {
        Err(AppError(JanitorError::not_found(
            "queue entry",
            id.to_string(),
        )))
    }
}

#[derive(serde::Deserialize)]
struct ScheduleBody {
    codebase: String,
    campaign: String,
    offset: Option<f64>,
    bucket: Option<String>,
    #[serde(default)]
    refresh: bool,
    requester: Option<String>,
}

async fn schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (offset, estimated_duration, queue_id, bucket) = janitor::schedule::do_schedule(
        state.database.pool(),
        &body.campaign,
        &body.codebase,
        body.bucket.as_deref().unwrap_or("manual"),
        body.offset,
        body.refresh,
        body.requester.as_deref(),
        None,
        None,
    )
    .await
    .map_err(|e| match e {
        janitor::schedule::Error::CandidateUnavailable { .. } => {
            JanitorError::validation(e.to_string())
        }
        janitor::schedule::Error::Sql(e) => e.into(),
    })?;
    Ok(Json(json!({
        "codebase": body.codebase,
        "campaign": body.campaign,
        "offset": offset,
        "bucket": bucket,
        "queue_id": queue_id,
        "estimated_duration_seconds": estimated_duration.num_seconds(),
    })))
}

#[derive(serde::Deserialize)]
struct ScheduleControlBody {
    codebase: String,
    main_branch_revision: Option<String>,
    offset: Option<f64>,
    #[serde(default)]
    refresh: bool,
    requester: Option<String>,
}

async fn schedule_control(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleControlBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    let (offset, estimated_duration, queue_id, bucket) = janitor::schedule::do_schedule_control(
        state.database.pool(),
        &body.codebase,
        body.main_branch_revision.as_deref(),
        body.offset,
        body.refresh,
        None,
        body.requester.as_deref(),
        None,
    )
    .await
    .map_err(|e| match e {
        janitor::schedule::Error::CandidateUnavailable { .. } => {
            JanitorError::validation(e.to_string())
        }
        janitor::schedule::Error::Sql(e) => e.into(),
    })?;
    Ok(Json(json!({
        "codebase": body.codebase,
        "campaign": "control",
        "offset": offset,
        "bucket": bucket,
        "queue_id": queue_id,
        "estimated_duration_seconds": estimated_duration.num_seconds(),
    })))
}

async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let run = janitor::state::get_run(state.database.pool(), &id)
        .await?
        .ok_or_else(|| JanitorError::not_found("run", id.clone()))?;
    let branches = janitor::state::get_result_branches(state.database.pool(), &id).await?;
    Ok(Json(json!({
        "id": run.id,
        "codebase": run.codebase,
        "campaign": run.suite,
        "result_code": run.result_code,
        "description": run.description,
        "value": run.value,
        "start_time": run.start_time.to_rfc3339(),
        "finish_time": run.finish_time.to_rfc3339(),
        "revision": run.revision,
        "main_branch_revision": run.main_branch_revision,
        "target_branch_url": run.target_branch_url,
        "worker": run.worker_name,
        "logfilenames": run.logfilenames,
        "failure_transient": run.failure_transient,
        "branches": branches,
    })))
}

#[derive(serde::Deserialize)]
struct RunUpdateBody {
    failure_transient: Option<bool>,
}

async fn update_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RunUpdateBody>,
) -> Result<Json<serde_json::Value>, AppError> {
    if !state.database.run_exists(&id).await? {
        return Err(AppError(JanitorError::not_found("run", id)));
    }
    if let Some(failure_transient) = body.failure_transient {
        sqlx::query("UPDATE run SET failure_transient = $2 WHERE id = $1")
            .bind(&id)
            .bind(failure_transient)
            .execute(state.database.pool())
            .await?;
    }
    Ok(Json(json!({"id": id})))
}

async fn log_index(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>, AppError> {
    let codebase = run_codebase(&state, &id).await?;
    let names = state
        .log_manager
        .list_logs(&codebase, &id)
        .await
        .map_err(|e| JanitorError::internal(e.to_string()))?;
    Ok(Json(names))
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    Path((id, name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let codebase = run_codebase(&state, &id).await?;
    let mut reader = state
        .log_manager
        .get_log(&codebase, &id, &name)
        .await
        .map_err(|e| match e {
            janitor::logs::Error::NotFound => JanitorError::not_found("log", name.clone()),
            other => JanitorError::internal(other.to_string()),
        })?;
    let mut content = Vec::new();
    use std::io::Read;
    reader
        .read_to_end(&mut content)
        .map_err(JanitorError::from)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        content,
    )
        .into_response())
}

/// Codebase a run (active or finished) belongs to.
async fn run_codebase(state: &AppState, run_id: &str) -> Result<String, AppError> {
    if let Some(active) = state.database.get_active_run(run_id).await? {
        return Ok(active.codebase);
    }
    janitor::state::get_run(state.database.pool(), run_id)
        .await?
        .map(|run| run.codebase)
        .ok_or_else(|| AppError(JanitorError::not_found("run", run_id.to_string())))
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.log_manager.health_check().await {
        Ok(()) => (StatusCode::OK, "OK").into_response(),
        Err(e) => {
            log::warn!("Health check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "log store unavailable").into_response()
        }
    }
}

async fn ready() -> impl IntoResponse {
    "OK"
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
}

/// Create the runner router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/active-runs", post(assign).get(get_active_runs))
        .route("/active-runs/{id}", get(get_active_run))
        .route("/active-runs/{id}/ping", post(ping))
        .route("/active-runs/{id}/log/{name}", post(append_log))
        .route("/active-runs/{id}/finish", post(finish))
        .route("/active-runs/{id}/kill", post(kill))
        .route("/queue", get(get_queue))
        .route("/queue/position", get(queue_position))
        .route("/queue/{id}", axum::routing::delete(drop_queue_item))
        .route("/schedule", post(schedule))
        .route("/schedule-control", post(schedule_control))
        .route("/runs/{id}", get(get_run).post(update_run))
        .route("/log/{id}", get(log_index))
        .route("/log/{id}/{name}", get(get_log))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}
