//! Bridges the append-only event log to SSE clients. A single background
//! task tails `events.ndjson` (the same file-based contract the orchestrator
//! and a standalone dashboard both already speak) and fans new rows out
//! through a broadcast channel; each client request subscribes, first
//! replaying the tailer's ring buffer so a late-joining client isn't left
//! staring at a blank log.

use crate::ipc::EventTailer;
use crate::model::Event;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const CHANNEL_CAPACITY: usize = 1024;

pub struct EventHub {
    sender: broadcast::Sender<Event>,
    ring: Mutex<Vec<Event>>,
}

impl EventHub {
    /// Spawns the polling task and returns a handle clients subscribe to.
    pub fn spawn(events_path: PathBuf, mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let (sender, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        let hub = Arc::new(Self {
            sender,
            ring: Mutex::new(Vec::new()),
        });

        let hub_for_task = hub.clone();
        tokio::spawn(async move {
            let mut tailer = EventTailer::new(events_path);
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for event in tailer.poll() {
                            let _ = hub_for_task.sender.send(event);
                        }
                        *hub_for_task.ring.lock().expect("ring poisoned") = tailer.ring_snapshot();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        hub
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn ring_snapshot(&self) -> Vec<Event> {
        self.ring.lock().expect("ring poisoned").clone()
    }
}

fn frame(event: &Event) -> String {
    let data = serde_json::to_string(&event.data).unwrap_or_else(|_| "null".to_string());
    format!("event: {}\ndata: {}\n\n", event.event, data)
}

pub async fn log_stream(State(state): State<Arc<super::AppState>>) -> impl IntoResponse {
    let hub = &state.event_hub;
    let burst = hub.ring_snapshot();
    let receiver = hub.subscribe();
    let live = BroadcastStream::new(receiver).filter_map(|item| item.ok());

    let mut body = String::from("retry: 10000\n\n");
    for event in &burst {
        body.push_str(&frame(event));
    }

    let initial = futures::stream::once(async move { Ok::<_, Infallible>(Bytes::from(body)) });
    let rest = live.map(|event| Ok::<_, Infallible>(Bytes::from(frame(&event))));
    let stream = initial.chain(rest);

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .expect("static SSE response headers are always valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_renders_event_and_data_lines() {
        let event = Event {
            seq: 1,
            timestamp: chrono::Utc::now(),
            event: "phase-started".to_string(),
            data: serde_json::json!({"phase": "1"}),
        };
        let rendered = frame(&event);
        assert!(rendered.starts_with("event: phase-started\n"));
        assert!(rendered.contains("\"phase\":\"1\""));
        assert!(rendered.ends_with("\n\n"));
    }
}
