//! Renderer → core messages

use serde::{Deserialize, Serialize};

use crate::types::PermissionDecision;

/// Messages sent from a rendering client to the core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    SubscribeList,
    SubscribeSession {
        session_id: String,
    },
    UnsubscribeSession {
        session_id: String,
    },

    // Session lifecycle
    CreateSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(default = "default_connect")]
        connect: bool,
    },
    CloseSession {
        session_id: String,
    },
    ConnectSession {
        session_id: String,
    },
    DisconnectSession {
        session_id: String,
    },

    // Actions
    SendMessage {
        session_id: String,
        content: String,
    },
    ResolvePermission {
        session_id: String,
        request_id: String,
        decision: PermissionDecision,
    },
    RelaunchSession {
        session_id: String,
    },
    RetryLastMessage {
        session_id: String,
    },

    // Reads
    GetFeed {
        session_id: String,
    },
}

fn default_connect() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_session_defaults_to_connecting() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"create_session"}"#).expect("deserialize");
        match msg {
            ClientMessage::CreateSession {
                session_id,
                connect,
                ..
            } => {
                assert!(session_id.is_none());
                assert!(connect);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn resolve_permission_parses_decision() {
        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"resolve_permission","session_id":"s1","request_id":"r1","decision":"allow"}"#,
        )
        .expect("deserialize");
        match msg {
            ClientMessage::ResolvePermission { decision, .. } => {
                assert_eq!(decision, PermissionDecision::Allow)
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
