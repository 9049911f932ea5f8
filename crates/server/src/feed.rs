//! Feed reconstruction
//!
//! Pure function from a flat, ordered transcript to the nested feed that
//! renderers display: consecutive tool-only assistant messages collapse
//! into tool groups, and messages produced inside a `Task` invocation are
//! nested under the entry that spawned them.
//!
//! Output depends only on the input slice. Nothing here allocates state
//! that outlives a call.

use std::collections::{HashMap, HashSet};

use companion_protocol::{ContentBlock, FeedEntry, Message, MessageRole, ToolItem, TASK_TOOL_NAME};
use serde_json::Value;

use crate::preview::tool_summary;

const DEFAULT_SUBAGENT_DESCRIPTION: &str = "Subagent";

struct TaskInfo {
    /// Index of the first message carrying this invocation.
    index: usize,
    description: String,
    agent_type: String,
}

impl TaskInfo {
    fn from_input(index: usize, input: &Value) -> Self {
        let field = |key: &str| {
            input
                .get(key)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            index,
            description: field("description")
                .unwrap_or_else(|| DEFAULT_SUBAGENT_DESCRIPTION.to_string()),
            agent_type: field("subagent_type").unwrap_or_default(),
        }
    }
}

/// Rebuild the display feed for a transcript.
pub fn reconstruct(messages: &[Message]) -> Vec<FeedEntry> {
    let tasks = discover_tasks(messages);
    let all: Vec<&Message> = messages.iter().collect();
    if tasks.is_empty() {
        return group_tool_messages(&all);
    }

    let mut top_level: Vec<&Message> = Vec::new();
    let mut children: HashMap<&str, Vec<&Message>> = HashMap::new();

    for (index, message) in messages.iter().enumerate() {
        // A parent only counts once its Task has been seen; anything else
        // (unknown id, forward or self reference) stays top-level.
        let parent = message
            .parent_tool_use_id
            .as_deref()
            .and_then(|id| tasks.get_key_value(id))
            .filter(|(_, info)| info.index < index)
            .map(|(id, _)| *id);

        match parent {
            Some(task_id) => children.entry(task_id).or_default().push(message),
            None => top_level.push(message),
        }
    }

    let mut emitted = HashSet::new();
    build_entries(&top_level, &tasks, &children, &mut emitted)
}

fn discover_tasks(messages: &[Message]) -> HashMap<&str, TaskInfo> {
    let mut tasks = HashMap::new();
    for (index, message) in messages.iter().enumerate() {
        for (id, name, input) in message.tool_uses() {
            if name == TASK_TOOL_NAME {
                tasks
                    .entry(id)
                    .or_insert_with(|| TaskInfo::from_input(index, input));
            }
        }
    }
    tasks
}

fn build_entries<'a>(
    messages: &[&'a Message],
    tasks: &HashMap<&'a str, TaskInfo>,
    children: &HashMap<&'a str, Vec<&'a Message>>,
    emitted: &mut HashSet<String>,
) -> Vec<FeedEntry> {
    let mut result = Vec::new();

    for entry in group_tool_messages(messages) {
        let task_ids = task_ids_in(&entry);
        result.push(entry);

        for task_id in task_ids {
            let Some((key, bucket)) = children.get_key_value(task_id.as_str()) else {
                continue;
            };
            if bucket.is_empty() || !emitted.insert(task_id.clone()) {
                continue;
            }
            let Some(info) = tasks.get(key) else {
                continue;
            };
            let nested = build_entries(bucket, tasks, children, emitted);
            result.push(FeedEntry::Subagent {
                task_tool_use_id: task_id,
                description: info.description.clone(),
                agent_type: info.agent_type.clone(),
                children: nested,
            });
        }
    }

    result
}

/// Tool name when the message is nothing but invocations of one tool.
///
/// Assistant only, at least one block, no thinking, no non-blank text
/// (blocks or plain content). Tool results do not count either way.
pub fn tool_only_name(message: &Message) -> Option<&str> {
    if message.role != MessageRole::Assistant
        || message.content_blocks.is_empty()
        || !message.content.trim().is_empty()
    {
        return None;
    }

    let mut tool_name: Option<&str> = None;
    for block in &message.content_blocks {
        match block {
            ContentBlock::Text { text } if !text.trim().is_empty() => return None,
            ContentBlock::Thinking { .. } => return None,
            ContentBlock::ToolUse { name, .. } => match tool_name {
                None => tool_name = Some(name.as_str()),
                Some(existing) if existing != name.as_str() => return None,
                Some(_) => {}
            },
            ContentBlock::Text { .. } | ContentBlock::ToolResult { .. } => {}
        }
    }
    tool_name
}

fn tool_items(message: &Message) -> impl Iterator<Item = ToolItem> + '_ {
    message.tool_uses().map(|(id, name, input)| ToolItem {
        id: id.to_string(),
        name: name.to_string(),
        input: input.clone(),
        summary: tool_summary(name, input),
    })
}

fn group_tool_messages(messages: &[&Message]) -> Vec<FeedEntry> {
    let mut entries: Vec<FeedEntry> = Vec::new();

    for message in messages {
        let Some(name) = tool_only_name(message) else {
            entries.push(FeedEntry::Message {
                message: (*message).clone(),
            });
            continue;
        };

        if let Some(FeedEntry::ToolGroup {
            tool_name, items, ..
        }) = entries.last_mut()
        {
            if tool_name.as_str() == name {
                items.extend(tool_items(message));
                continue;
            }
        }

        entries.push(FeedEntry::ToolGroup {
            tool_name: name.to_string(),
            first_message_id: message.id.clone(),
            items: tool_items(message).collect(),
        });
    }

    entries
}

fn task_ids_in(entry: &FeedEntry) -> Vec<String> {
    match entry {
        FeedEntry::Message { message } => message
            .tool_uses()
            .filter(|(_, name, _)| *name == TASK_TOOL_NAME)
            .map(|(id, _, _)| id.to_string())
            .collect(),
        FeedEntry::ToolGroup {
            tool_name, items, ..
        } if tool_name == TASK_TOOL_NAME => items.iter().map(|item| item.id.clone()).collect(),
        _ => Vec::new(),
    }
}
