//! Admin HTTP API under `/api/v1`.
//!
//! Every response is a JSON envelope: `{"code": 0, "data": ...}` on
//! success, `{"code": <n>, "msg": ...}` on failure, always with CORS wide
//! open so external dashboards can call any node directly.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::agent::Agent;
use crate::error::CronError;

pub fn router(agent: Arc<Agent>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/add", get(add_handler))
        .route("/api/v1/active", get(active_handler))
        .route("/api/v1/pause", get(pause_handler))
        .route("/api/v1/remove", get(remove_handler))
        .route("/api/v1/execute", get(execute_handler))
        .route("/api/v1/schedule", get(schedule_handler))
        .route("/api/v1/running", get(running_handler))
        .route("/api/v1/history", get(history_handler))
        .route("/api/v1/jobs", get(jobs_handler))
        .route("/api/v1/members", get(members_handler))
        .layer(cors)
        .with_state(agent)
}

fn render(data: impl Serialize) -> Json<Value> {
    Json(json!({ "code": 0, "data": data }))
}

fn render_err(code: i64, err: CronError) -> Json<Value> {
    Json(json!({ "code": code, "msg": err.to_string() }))
}

#[derive(Deserialize)]
struct AddParams {
    #[serde(default)]
    spec: String,
    #[serde(default)]
    job: String,
}

#[derive(Deserialize)]
struct JobParams {
    #[serde(default)]
    job: String,
}

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default)]
    job: String,
    #[serde(default)]
    offset: i64,
    #[serde(default)]
    size: i64,
}

async fn add_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<AddParams>,
) -> Json<Value> {
    match agent.add(&params.spec, &params.job).await {
        Ok(()) => render("ok"),
        Err(e) => render_err(1000, e),
    }
}

async fn active_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<JobParams>,
) -> Json<Value> {
    match agent.active(&params.job).await {
        Ok(()) => render("ok"),
        Err(e) => render_err(1001, e),
    }
}

async fn pause_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<JobParams>,
) -> Json<Value> {
    match agent.pause(&params.job).await {
        Ok(()) => render("ok"),
        Err(e) => render_err(1002, e),
    }
}

async fn remove_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<JobParams>,
) -> Json<Value> {
    match agent.remove(&params.job).await {
        Ok(()) => render("ok"),
        Err(e) => render_err(1003, e),
    }
}

async fn execute_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<JobParams>,
) -> Json<Value> {
    match agent.execute_once(&params.job).await {
        Ok(()) => render("ok"),
        Err(e) => render_err(1004, e),
    }
}

async fn schedule_handler(State(agent): State<Arc<Agent>>) -> Json<Value> {
    match agent.schedule().await {
        Ok(records) => render(records),
        Err(e) => render_err(1005, e),
    }
}

async fn running_handler(State(agent): State<Arc<Agent>>) -> Json<Value> {
    match agent.running().await {
        Ok(executions) => render(executions),
        Err(e) => render_err(1006, e),
    }
}

async fn history_handler(
    State(agent): State<Arc<Agent>>,
    Query(params): Query<HistoryParams>,
) -> Json<Value> {
    match agent
        .history(&params.job, params.offset, params.size)
        .await
    {
        Ok(page) => render(page),
        Err(e) => render_err(1007, e),
    }
}

async fn jobs_handler(State(agent): State<Arc<Agent>>) -> Json<Value> {
    render(agent.jobs())
}

async fn members_handler(State(agent): State<Arc<Agent>>) -> Json<Value> {
    render(agent.members())
}
