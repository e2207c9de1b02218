//! `GET/PUT /agents/files/*path` (spec §6): read/write through an instance's
//! sandbox backend. The instance is selected by an `agent_id` query param
//! (spec §6 leaves this unspecified beyond "through the instance's backend";
//! this is the resolved Open Question, recorded in DESIGN.md).

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;

use crate::auth::Caller;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct FilesQuery {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

fn default_agent_id() -> String {
    "default".to_string()
}

pub async fn read_file(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(path): Path<String>,
    Query(q): Query<FilesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let instance = state
        .runtime
        .instances
        .get_or_clone(&q.agent_id, &caller.username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await?;
    let backend = instance.backend().await;
    let downloads = backend.download(vec![path]).await?;
    let download = downloads.into_iter().next().ok_or_else(|| ApiError(warden::WardenError::NotFound("file".into())))?;
    match download.content {
        Some(bytes) => Ok((StatusCode::OK, bytes)),
        None => Err(ApiError(warden::WardenError::NotFound(download.error.unwrap_or_else(|| "file not found".into())))),
    }
}

pub async fn write_file(
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(path): Path<String>,
    Query(q): Query<FilesQuery>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let instance = state
        .runtime
        .instances
        .get_or_clone(&q.agent_id, &caller.username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await?;
    let backend = instance.backend().await;
    let results = backend.upload(vec![(path, body.to_vec())]).await?;
    match results.into_iter().next() {
        Some(r) if r.error.is_none() => Ok(StatusCode::NO_CONTENT),
        Some(r) => Err(ApiError(warden::WardenError::BadRequest(r.error.unwrap()))),
        None => Err(ApiError(warden::WardenError::BackendError("no upload result".into()))),
    }
}
