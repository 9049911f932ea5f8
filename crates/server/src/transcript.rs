//! Per-session transcript: finalized messages plus at most one stream
//!
//! Messages live behind an `Arc<Vec<_>>` so snapshots and feed
//! reconstruction share them without copying. Appends copy-on-write only
//! while a snapshot is still holding the previous vector.

use std::collections::HashSet;
use std::sync::Arc;

use companion_protocol::{ContentBlock, Message, MessageRole, StreamingState};

#[derive(Debug, Clone, Default)]
pub struct TranscriptStore {
    messages: Arc<Vec<Message>>,
    ids: HashSet<String>,
    streaming: Option<StreamingState>,
}

impl TranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Shared handle to the finalized messages.
    pub fn shared(&self) -> Arc<Vec<Message>> {
        Arc::clone(&self.messages)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn streaming(&self) -> Option<&StreamingState> {
        self.streaming.as_ref()
    }

    /// Append a finalized message. Returns false for a duplicate id.
    pub fn append(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        Arc::make_mut(&mut self.messages).push(message);
        true
    }

    /// Open a new stream. The caller finalizes any previous one first.
    pub fn begin(&mut self, message_id: String, parent_tool_use_id: Option<String>, now: u64) {
        self.streaming = Some(StreamingState {
            message_id,
            parent_tool_use_id,
            text: String::new(),
            content_blocks: Vec::new(),
            started_at: now,
            output_tokens: 0,
        });
    }

    /// Returns false when no stream is open.
    pub fn append_delta(&mut self, text: &str, output_tokens: u64) -> bool {
        match self.streaming.as_mut() {
            Some(stream) => {
                stream.text.push_str(text);
                stream.output_tokens = stream.output_tokens.saturating_add(output_tokens);
                true
            }
            None => false,
        }
    }

    /// Returns false when no stream is open.
    pub fn push_block(&mut self, block: ContentBlock) -> bool {
        match self.streaming.as_mut() {
            Some(stream) => {
                stream.content_blocks.push(block);
                true
            }
            None => false,
        }
    }

    /// Close the stream into an assistant message and append it.
    ///
    /// `None` when there was no stream, or when its id was already in the
    /// transcript (the buffer is discarded either way).
    pub fn finalize(&mut self) -> Option<Message> {
        let stream = self.streaming.take()?;
        let message = Message {
            id: stream.message_id,
            role: MessageRole::Assistant,
            content: stream.text,
            content_blocks: stream.content_blocks,
            parent_tool_use_id: stream.parent_tool_use_id,
            timestamp: stream.started_at,
        };
        if self.append(message.clone()) {
            Some(message)
        } else {
            None
        }
    }

    /// Drop the in-flight stream without producing a message.
    pub fn discard_stream(&mut self) -> bool {
        self.streaming.take().is_some()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Most recent user message with non-blank content.
    pub fn last_user_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User && !m.content.trim().is_empty())
    }
}
