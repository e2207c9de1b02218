//! Per-invocation [`Trace`] accumulation and the process-global [`EventBus`]
//! (spec §3, §4.H).
//!
//! Two distinct fan-out paths share the same wire type (`warden_stream::TraceEvent`):
//! - a `Trace` is an in-memory ordered log for one invocation, optionally attached
//!   to a non-streaming response body;
//! - the `EventBus` is process-wide and carries `container_status`/`config_changed`
//!   events to every subscribed client, each with its own bounded queue and optional
//!   username filter. A slow subscriber is dropped rather than allowed to block
//!   publishers (teacher's `try_send` + drop-counter idiom, `serve/src/run/stream.rs`).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::warn;

pub use warden_stream::{TraceEvent, TraceKind, SSE_KEEPALIVE_LINE};

/// The bounded depth of a process-global subscriber's queue (spec §4.H: "bounded, 32 deep").
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 32;

/// An ordered, in-memory log of the events produced by one invocation.
#[derive(Debug, Default, Clone)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    /// `true` once a terminal event (`done`/`error`/`interrupt`) has been recorded.
    pub fn is_terminated(&self) -> bool {
        self.events.last().map(|e| e.kind.is_terminal()).unwrap_or(false)
    }
}

/// An event carrying the username it is scoped to, for subscriber-side filtering.
/// Events with `username: None` are process-wide and reach every subscriber.
#[derive(Clone, Debug)]
pub struct ScopedEvent {
    pub username: Option<String>,
    pub event: TraceEvent,
}

/// A live subscription to the process-global bus.
pub struct EventSubscription {
    rx: mpsc::Receiver<ScopedEvent>,
    dropped: Arc<AtomicUsize>,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Option<ScopedEvent> {
        self.rx.recv().await
    }

    /// Count of events this subscriber has missed due to a full queue.
    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Process-wide publisher of `container_status`/`config_changed` events (spec §4.H).
///
/// Internally a `tokio::sync::broadcast` fans out to a relay task per subscriber,
/// which re-homes events into that subscriber's own bounded `mpsc` so one slow
/// client can't starve others (broadcast itself would simply lag/drop for everyone).
pub struct EventBus {
    tx: broadcast::Sender<ScopedEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    /// Publishes an event. Scoped to `username` when `Some`, else process-wide.
    pub fn publish(&self, username: Option<String>, event: TraceEvent) {
        // No receivers is not an error: the bus may be idle between SSE clients.
        let _ = self.tx.send(ScopedEvent { username, event });
    }

    /// Subscribes with an optional username filter. Events scoped to a different
    /// user are dropped before reaching this subscriber's queue; when the queue
    /// fills (the client reads too slowly), further events for this subscriber
    /// are dropped and counted rather than blocking the publisher.
    pub fn subscribe(&self, filter_username: Option<String>) -> EventSubscription {
        let mut broadcast_rx = self.tx.subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        let dropped = Arc::new(AtomicUsize::new(0));
        let dropped_clone = dropped.clone();

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(scoped) => {
                        if let (Some(want), Some(got)) = (&filter_username, &scoped.username) {
                            if want != got {
                                continue;
                            }
                        }
                        if tx.try_send(scoped).is_err() {
                            dropped_clone.fetch_add(1, Ordering::Relaxed);
                            warn!("event bus subscriber queue full, dropping event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        dropped_clone.fetch_add(n as usize, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        EventSubscription { rx, dropped }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
