//! File-based IPC between the orchestrator process and the dashboard
//! process: an append-only NDJSON event log with a bounded tailer, an
//! answer drop-directory, a heartbeat file, and a shutdown marker.

pub mod answers;
pub mod events;
pub mod heartbeat;
pub mod shutdown_marker;

pub use answers::{AnswerPoller, AnswerWriter};
pub use events::{EventTailer, EventWriter};
pub use heartbeat::{HeartbeatReader, HeartbeatWriter};
pub use shutdown_marker::ShutdownMarker;
