//! Markdown export of a session transcript

use companion_protocol::{Message, MessageRole};

const SEPARATOR: &str = "\n\n---\n\n";

/// Render user and assistant messages as markdown sections. System
/// messages and messages without text are skipped.
pub fn transcript_markdown(messages: &[Message]) -> String {
    messages
        .iter()
        .filter_map(|message| {
            let heading = match message.role {
                MessageRole::User => "## User",
                MessageRole::Assistant => "## Assistant",
                MessageRole::System => return None,
            };
            let content = message.content.trim();
            if content.is_empty() {
                return None;
            }
            Some(format!("{heading}\n\n{content}"))
        })
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}
