//! Reconstructed feed types
//!
//! A feed is the hierarchical, display-oriented view of a flat transcript.
//! Entries are derived on demand and never stored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Message;

/// One tool invocation inside a tool group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolItem {
    pub id: String,
    pub name: String,
    pub input: Value,
    /// One-line human summary of the input (path, command, pattern).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FeedEntry {
    Message {
        message: Message,
    },
    /// A run of consecutive tool-only assistant messages sharing one tool name
    ToolGroup {
        tool_name: String,
        first_message_id: String,
        items: Vec<ToolItem>,
    },
    /// The nested conversation spawned by a Task invocation
    Subagent {
        task_tool_use_id: String,
        description: String,
        agent_type: String,
        children: Vec<FeedEntry>,
    },
}
