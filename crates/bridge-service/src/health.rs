//! A minimal axum health endpoint, in the shape the teacher exposes for
//! its own orchestration service: liveness always `200`, readiness
//! reflecting whether the robot is currently reachable.

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use bridge_shared::messaging::RobotConnectionWatcher;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    robot_online: bool,
}

async fn healthz(State(watcher): State<Arc<dyn RobotConnectionWatcher>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        robot_online: watcher.is_online(),
    })
}

pub fn router(watcher: Arc<dyn RobotConnectionWatcher>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .with_state(watcher)
}
