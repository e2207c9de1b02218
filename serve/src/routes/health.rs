use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::dto::HealthResponse;
use crate::state::AppState;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let agents_loaded = state.runtime.templates.list().await.len();
    Json(HealthResponse { status: "ok", agents_loaded })
}
