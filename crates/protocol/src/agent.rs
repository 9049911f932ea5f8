//! Agent host ↔ core events
//!
//! `AgentEvent` is what the agent host streams in for each session;
//! `OutboundEvent` is what the core sends back.

use serde::{Deserialize, Serialize};

use crate::types::{ContentBlock, Message, PermissionDecision, PermissionRequest, RunStatus};

/// Events received from the agent host, scoped to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Opens a streaming buffer for a new assistant message
    MessageStart {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    TextDelta {
        session_id: String,
        text: String,
        #[serde(default)]
        output_tokens: u64,
    },
    ContentBlock {
        session_id: String,
        block: ContentBlock,
    },
    MessageEnd {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
    },
    /// A complete message (history replay, echoed user input, notices)
    Message {
        session_id: String,
        message: Message,
    },
    StatusChange {
        session_id: String,
        status: RunStatus,
    },
    PermissionRequest {
        session_id: String,
        request: PermissionRequest,
    },
    PermissionResolved {
        session_id: String,
        request_id: String,
    },
    LivenessChange {
        session_id: String,
        live: bool,
    },
    SessionInfo {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        context_used_percent: Option<f64>,
    },
}

impl AgentEvent {
    pub fn session_id(&self) -> &str {
        match self {
            AgentEvent::MessageStart { session_id, .. }
            | AgentEvent::TextDelta { session_id, .. }
            | AgentEvent::ContentBlock { session_id, .. }
            | AgentEvent::MessageEnd { session_id, .. }
            | AgentEvent::Message { session_id, .. }
            | AgentEvent::StatusChange { session_id, .. }
            | AgentEvent::PermissionRequest { session_id, .. }
            | AgentEvent::PermissionResolved { session_id, .. }
            | AgentEvent::LivenessChange { session_id, .. }
            | AgentEvent::SessionInfo { session_id, .. } => session_id,
        }
    }

    /// Wire tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::MessageStart { .. } => "message_start",
            AgentEvent::TextDelta { .. } => "text_delta",
            AgentEvent::ContentBlock { .. } => "content_block",
            AgentEvent::MessageEnd { .. } => "message_end",
            AgentEvent::Message { .. } => "message",
            AgentEvent::StatusChange { .. } => "status_change",
            AgentEvent::PermissionRequest { .. } => "permission_request",
            AgentEvent::PermissionResolved { .. } => "permission_resolved",
            AgentEvent::LivenessChange { .. } => "liveness_change",
            AgentEvent::SessionInfo { .. } => "session_info",
        }
    }
}

/// Events the core sends to the agent host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundEvent {
    UserMessage {
        session_id: String,
        content: String,
    },
    PermissionResolved {
        session_id: String,
        request_id: String,
        decision: PermissionDecision,
    },
    /// Ask the host to restart the unreachable remote process
    Relaunch {
        session_id: String,
    },
}

impl OutboundEvent {
    pub fn session_id(&self) -> &str {
        match self {
            OutboundEvent::UserMessage { session_id, .. }
            | OutboundEvent::PermissionResolved { session_id, .. }
            | OutboundEvent::Relaunch { session_id } => session_id,
        }
    }
}
