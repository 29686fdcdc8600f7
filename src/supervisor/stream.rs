//! Structured messages emitted by the agent subprocess on stdout, one JSON
//! object per line. The supervisor tolerates message types it doesn't
//! recognize (`#[serde(other)]` on the outer tag) since the agent's
//! protocol evolves independently of this crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        subtype: String,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "assistant")]
    Assistant {
        message: AssistantMessage,
        #[serde(default)]
        session_id: String,
    },

    #[serde(rename = "user")]
    User {
        #[serde(default)]
        tool_use_result: Option<ToolUseResult>,
    },

    #[serde(rename = "stream_event")]
    StreamEventInner { event: Value },

    #[serde(rename = "tool_progress")]
    ToolProgress {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        message: String,
    },

    #[serde(rename = "tool_use_summary")]
    ToolUseSummary {
        #[serde(default)]
        tool_use_id: String,
        #[serde(default)]
        summary: String,
    },

    #[serde(rename = "result")]
    Result {
        subtype: String,
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        errors: Option<Value>,
        #[serde(default)]
        is_error: bool,
        #[serde(default)]
        total_cost_usd: Option<f64>,
        #[serde(default)]
        num_turns: Option<u32>,
        #[serde(default)]
        duration_ms: Option<u64>,
        #[serde(default)]
        usage: Option<Value>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: Value,
        #[serde(default)]
        id: String,
    },
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolUseResult {
    #[serde(default)]
    pub file: Option<FileInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileInfo {
    #[serde(rename = "filePath")]
    pub file_path: String,
}

/// Reserved tool name whose `tool_use` content block is routed to the
/// question handler instead of being auto-allowed.
pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

/// True once the `result` subtype and `is_error` agree that the run
/// succeeded. Subtypes other than `"success"` are always treated as a
/// failure even if `is_error` was (incorrectly) false.
pub fn result_is_success(subtype: &str, is_error: bool) -> bool {
    subtype == "success" && !is_error
}
