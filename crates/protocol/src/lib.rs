//! Companion Protocol
//!
//! Shared types for communication between the agent host, the session core
//! and rendering clients. Everything here is serialized as JSON.

use uuid::Uuid;

pub mod agent;
pub mod client;
pub mod feed;
pub mod server;
pub mod types;

pub use agent::{AgentEvent, OutboundEvent};
pub use client::ClientMessage;
pub use feed::{FeedEntry, ToolItem};
pub use server::ServerMessage;
pub use types::*;

/// Name of the tool invocation that spawns a nested sub-agent conversation.
pub const TASK_TOOL_NAME: &str = "Task";

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
