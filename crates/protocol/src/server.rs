//! Core → renderer messages

use serde::{Deserialize, Serialize};

use crate::feed::FeedEntry;
use crate::types::{
    ContentBlock, Message, PermissionRequest, SessionState, SessionSummary, StateChanges,
};

/// Messages sent from the core to rendering clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state
    SessionsList {
        sessions: Vec<SessionSummary>,
    },
    SessionSnapshot {
        session: SessionState,
    },

    // Lifecycle
    SessionCreated {
        session: SessionSummary,
    },
    SessionClosed {
        session_id: String,
    },

    // Delta updates
    SessionDelta {
        session_id: String,
        changes: StateChanges,
    },
    MessageAppended {
        session_id: String,
        message: Message,
    },

    // Streaming
    StreamStarted {
        session_id: String,
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_tool_use_id: Option<String>,
    },
    StreamDelta {
        session_id: String,
        message_id: String,
        text: String,
        output_tokens: u64,
    },
    StreamBlock {
        session_id: String,
        message_id: String,
        block: ContentBlock,
    },
    StreamCleared {
        session_id: String,
    },

    // Permissions
    PermissionRequested {
        session_id: String,
        request: PermissionRequest,
    },
    PermissionRemoved {
        session_id: String,
        request_id: String,
    },
    PermissionsCleared {
        session_id: String,
    },

    // Reads
    Feed {
        session_id: String,
        revision: u64,
        entries: Vec<FeedEntry>,
    },

    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            session_id: None,
        }
    }

    pub fn session_error(
        session_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        ServerMessage::Error {
            code: code.into(),
            message: message.into(),
            session_id: Some(session_id.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionStatus;

    #[test]
    fn session_delta_omits_untouched_fields() {
        let msg = ServerMessage::SessionDelta {
            session_id: "s1".to_string(),
            changes: StateChanges {
                connection: Some(ConnectionStatus::Connected),
                name: Some(None),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "type": "session_delta",
                "session_id": "s1",
                "changes": { "connection": "connected", "name": null },
            })
        );
    }

    #[test]
    fn session_error_carries_session_id() {
        let msg = ServerMessage::session_error("s1", "not_found", "no such session");
        match msg {
            ServerMessage::Error {
                code, session_id, ..
            } => {
                assert_eq!(code, "not_found");
                assert_eq!(session_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
