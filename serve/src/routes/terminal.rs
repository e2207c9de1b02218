//! `WS /agents/{id}/terminal` (spec §6): duplex pipe to the instance's
//! sandbox. There is no persistent PTY in [`warden::sandbox::SandboxBackend`],
//! so each inbound text frame is run as one command via `execute` and the
//! combined output is sent back as one frame, matching the trait's
//! command-in, output-out contract (spec §4.B).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use tracing::warn;

use crate::auth::Caller;
use crate::state::AppState;

pub async fn terminal(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    caller: Caller,
    Path(agent_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| handle_terminal(socket, state, caller.username, agent_id))
}

async fn handle_terminal(mut socket: WebSocket, state: Arc<AppState>, username: String, agent_id: String) {
    let instance = match state
        .runtime
        .instances
        .get_or_clone(&agent_id, &username, &state.runtime.templates, &state.runtime.tool_registry, state.runtime.backend_factory.as_ref())
        .await
    {
        Ok(instance) => instance,
        Err(e) => {
            let _ = socket.send(Message::Text(format!("error: {e}"))).await;
            return;
        }
    };
    let backend = instance.backend().await;

    while let Some(Ok(msg)) = socket.recv().await {
        let command = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        match backend.execute(&command).await {
            Ok(resp) => {
                if socket.send(Message::Text(resp.output)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "terminal command failed");
                if socket.send(Message::Text(format!("error: {e}"))).await.is_err() {
                    break;
                }
            }
        }
    }
}
