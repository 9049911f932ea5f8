//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Transport connection status for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Run status - what the agent is currently doing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Compacting,
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// One block of message content, kept in the order the agent produced it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    /// Invocation id and tool name, if this block is a tool invocation.
    pub fn as_tool_use(&self) -> Option<(&str, &str, &Value)> {
        match self {
            ContentBlock::ToolUse { id, name, input } => Some((id, name, input)),
            _ => None,
        }
    }
}

/// A finalized message in a session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
    /// Tool invocation this message was produced within (sub-agent traffic).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    /// Unix milliseconds
    pub timestamp: u64,
}

impl Message {
    /// All tool invocations in block order.
    pub fn tool_uses(&self) -> impl Iterator<Item = (&str, &str, &Value)> {
        self.content_blocks.iter().filter_map(ContentBlock::as_tool_use)
    }
}

/// Pending request for a human decision before the agent may proceed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    /// Opaque description of the requested action.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl PermissionRequest {
    pub fn tool_name(&self) -> Option<&str> {
        self.payload.get("tool_name").and_then(Value::as_str)
    }
}

/// Human decision on a permission request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    Deny,
}

/// How close the session is to exhausting its context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextWarning {
    #[default]
    Ok,
    Filling,
    NearlyFull,
}

impl ContextWarning {
    pub const FILLING_PERCENT: f64 = 80.0;
    pub const NEARLY_FULL_PERCENT: f64 = 95.0;

    pub fn from_percent(percent: f64) -> Self {
        if percent >= Self::NEARLY_FULL_PERCENT {
            ContextWarning::NearlyFull
        } else if percent >= Self::FILLING_PERCENT {
            ContextWarning::Filling
        } else {
            ContextWarning::Ok
        }
    }
}

/// The in-flight assistant message being assembled from deltas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingState {
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
    /// Unix milliseconds
    pub started_at: u64,
    pub output_tokens: u64,
}

/// Summary of a session for list views
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub connection: ConnectionStatus,
    /// Whether the remote agent process answers, independent of the transport.
    pub live: bool,
    pub run_status: RunStatus,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub context_used_percent: f64,
    pub context_warning: ContextWarning,
    pub pending_permissions: usize,
    pub message_count: usize,
    pub revision: u64,
    pub created_at: u64,
    pub last_activity_at: Option<u64>,
}

/// Full session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    #[serde(flatten)]
    pub summary: SessionSummary,
    pub messages: Vec<Message>,
    pub streaming: Option<StreamingState>,
    /// Pending requests, first-arrived first.
    pub permissions: Vec<PermissionRequest>,
}

/// Changes to apply to a session state (delta updates)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<Option<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_used_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_warning: Option<ContextWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<u64>,
}

impl StateChanges {
    pub fn is_empty(&self) -> bool {
        *self == StateChanges::default()
    }
}
