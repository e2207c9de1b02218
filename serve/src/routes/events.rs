//! `GET /agents/events` (spec §6, §4.H): process-wide SSE, scoped to the
//! caller's username, with a 30s keep-alive.

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;

use crate::auth::Caller;
use crate::state::AppState;

pub async fn events(State(state): State<Arc<AppState>>, caller: Caller) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    let mut sub = state.runtime.events.subscribe(Some(caller.username));

    let stream = async_stream::stream! {
        while let Some(scoped) = sub.recv().await {
            if let Ok(data) = serde_json::to_string(&scoped.event) {
                yield Ok(Event::default().event(scoped.event.kind.as_sse_name()).data(data));
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::new().interval(std::time::Duration::from_secs(30)).text("keep-alive"))
}
