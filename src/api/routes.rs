//! API route definitions.

use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::error::ApiError;
use super::state::AppState;
use crate::healing::{FailureReport, RecordFilter};
use crate::scheduler::{
    BrowserMode, ExecutionOptionsOverride, NewSchedule, Run, ScheduleFilter, ScheduleView,
};

type ApiResult = Result<Json<Value>, ApiError>;
type ApiCreated = Result<(StatusCode, Json<Value>), ApiError>;

const RECENT_RUNS: usize = 10;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        // schedules
        .route("/schedules", post(create_schedule).get(list_schedules))
        .route("/schedules/stats/summary", get(schedule_summary))
        .route("/schedules/{id}", get(get_schedule).delete(delete_schedule))
        .route("/schedules/{id}/run-now", post(run_now))
        .route("/schedules/{id}/cancel", post(cancel_schedule))
        .route("/schedules/{id}/stop", post(stop_schedule))
        .route("/schedules/{id}/reschedule", post(reschedule))
        .route("/schedules/{id}/runs", get(schedule_runs))
        // healing
        .route("/healing/analyze", post(analyze_failure))
        .route("/healing/stats", get(healing_stats))
        .route("/healing/health", get(healing_health))
        .route("/healing/records", get(list_records))
        .route("/healing/records/{id}", get(get_record))
        .route("/healing/records/{id}/accept", post(accept_record))
        .route("/healing/records/{id}/reject", post(reject_record))
        // tests and workers
        .route("/tests/run/{test_id}", post(run_test))
        .route("/tests/watch/status", get(watch_status))
        .route("/tests/watch/start", post(watch_start))
        .route("/workers/status", get(worker_status))
}

// ---------------------------------------------------------------------------
// Envelope helpers
// ---------------------------------------------------------------------------

fn meta() -> Value {
    json!({
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

fn envelope<T: Serialize>(data: T) -> Json<Value> {
    Json(json!({ "data": data, "meta": meta() }))
}

fn listing<T: Serialize>(items: Vec<T>) -> Json<Value> {
    let total = items.len();
    Json(json!({ "data": items, "meta": { "total": total, "timestamp": Utc::now().to_rfc3339() } }))
}

fn required<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    body.map(|Json(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

fn query<T>(q: Result<Query<T>, QueryRejection>) -> Result<T, ApiError> {
    q.map(|Query(v)| v)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// Parse a body that may be omitted entirely.
fn optional<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {e}")))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    envelope(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime
    }))
}

// ---------------------------------------------------------------------------
// Schedules
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ScheduleDetail {
    #[serde(flatten)]
    view: ScheduleView,
    recent_runs: Vec<Run>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunNowRequest {
    notes: Option<String>,
    #[serde(alias = "executionOptions")]
    execution_options: ExecutionOptionsOverride,
}

#[derive(Debug, Deserialize)]
struct RescheduleRequest {
    #[serde(alias = "runAt")]
    run_at: String,
    #[serde(default = "utc")]
    timezone: String,
}

fn utc() -> String {
    "UTC".to_string()
}

#[derive(Debug, Default, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn create_schedule(
    State(state): State<AppState>,
    body: Result<Json<NewSchedule>, JsonRejection>,
) -> ApiCreated {
    let spec = required(body)?;
    let now = Utc::now();
    let schedule = state.store.create(spec, now)?;
    Ok((StatusCode::CREATED, envelope(schedule.view(now))))
}

async fn list_schedules(
    State(state): State<AppState>,
    filter: Result<Query<ScheduleFilter>, QueryRejection>,
) -> ApiResult {
    let filter = query(filter)?;
    let now = Utc::now();
    let views: Vec<ScheduleView> = state.store.list(&filter)?.iter().map(|s| s.view(now)).collect();
    Ok(listing(views))
}

async fn get_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let schedule = state.store.get(&id)?;
    let recent_runs = state.ledger.list_by_schedule(&id, Some(RECENT_RUNS))?;
    Ok(envelope(ScheduleDetail {
        view: schedule.view(Utc::now()),
        recent_runs,
    }))
}

async fn delete_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    state.store.delete(&id)?;
    Ok(envelope(json!({ "id": id, "deleted": true })))
}

async fn run_now(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> ApiCreated {
    let req: RunNowRequest = optional(&body)?;
    let result = state
        .dispatcher
        .run_now(&id, &req.execution_options, req.notes, Utc::now())
        .await?;
    Ok((StatusCode::ACCEPTED, envelope(result)))
}

async fn cancel_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let now = Utc::now();
    let schedule = state.dispatcher.cancel(&id, now)?;
    Ok(envelope(schedule.view(now)))
}

async fn stop_schedule(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    let now = Utc::now();
    let schedule = state.dispatcher.stop(&id, now).await?;
    Ok(envelope(schedule.view(now)))
}

async fn reschedule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<RescheduleRequest>, JsonRejection>,
) -> ApiResult {
    let req = required(body)?;
    let now = Utc::now();
    let schedule = state.store.reschedule(&id, &req.run_at, &req.timezone, now)?;
    Ok(envelope(schedule.view(now)))
}

async fn schedule_runs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    q: Result<Query<RunsQuery>, QueryRejection>,
) -> ApiResult {
    let q = query(q)?;
    // 404 for unknown schedules rather than an empty list
    state.store.get(&id)?;
    Ok(listing(state.ledger.list_by_schedule(&id, q.limit)?))
}

async fn schedule_summary(State(state): State<AppState>) -> ApiResult {
    Ok(envelope(state.ledger.stats_summary(Utc::now())?))
}

// ---------------------------------------------------------------------------
// Healing
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AcceptRequest {
    selector: Option<String>,
}

async fn analyze_failure(
    State(state): State<AppState>,
    body: Result<Json<FailureReport>, JsonRejection>,
) -> ApiCreated {
    let report = required(body)?;
    let result = state.healing.analyze(&report, Utc::now())?;

    let status = if result.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let mut meta = meta();
    if let Some(message) = &result.low_confidence {
        meta["warning"] = json!({ "kind": "HealingLowConfidence", "message": message });
    }
    Ok((status, Json(json!({ "data": result, "meta": meta }))))
}

async fn healing_stats(State(state): State<AppState>) -> ApiResult {
    Ok(envelope(state.healing.stats()?))
}

async fn healing_health(State(state): State<AppState>) -> Json<Value> {
    envelope(state.healing.health())
}

async fn list_records(
    State(state): State<AppState>,
    filter: Result<Query<RecordFilter>, QueryRejection>,
) -> ApiResult {
    let filter = query(filter)?;
    Ok(listing(state.healing.list(&filter)?))
}

async fn get_record(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.healing.get(&id)?))
}

async fn accept_record(State(state): State<AppState>, Path(id): Path<String>, body: Bytes) -> ApiResult {
    let req: AcceptRequest = optional(&body)?;
    let record = state.healing.accept(&id, req.selector.as_deref(), Utc::now())?;
    Ok(envelope(record))
}

async fn reject_record(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult {
    Ok(envelope(state.healing.reject(&id, Utc::now())?))
}

// ---------------------------------------------------------------------------
// Tests and workers
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RunTestRequest {
    #[serde(alias = "executionMode", alias = "mode")]
    execution_mode: BrowserMode,
}

async fn run_test(State(state): State<AppState>, Path(test_id): Path<String>, body: Bytes) -> ApiCreated {
    let req: RunTestRequest = optional(&body)?;
    let run = state
        .dispatcher
        .run_adhoc(&test_id, req.execution_mode, Utc::now())
        .await?;
    Ok((StatusCode::ACCEPTED, envelope(run)))
}

async fn watch_status(State(state): State<AppState>) -> Json<Value> {
    envelope(state.watcher.status())
}

async fn watch_start(State(state): State<AppState>) -> ApiResult {
    Ok(envelope(state.watcher.start()?))
}

async fn worker_status(State(state): State<AppState>) -> Json<Value> {
    envelope(state.dispatcher.status().await)
}
