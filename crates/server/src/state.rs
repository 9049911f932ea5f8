//! Application state
//!
//! Owned, injected registry of session actors. The supervisor and the
//! HTTP/WebSocket layer share one `SessionRegistry` behind an `Arc`.

use std::sync::Arc;

use companion_protocol::{Message, ServerMessage, SessionSummary};
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::info;

use crate::error::SessionError;
use crate::session::SessionHandle;
use crate::session_actor::SessionActorHandle;
use crate::session_command::SessionCommand;
use crate::supervisor::ConnectionSupervisor;
use crate::transition::Input;

const LIST_CAPACITY: usize = 256;

/// Shared state handed to the HTTP and WebSocket handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub supervisor: Arc<ConnectionSupervisor>,
}

impl AppState {
    pub fn new(supervisor: Arc<ConnectionSupervisor>) -> Self {
        Self {
            registry: Arc::clone(supervisor.registry()),
            supervisor,
        }
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, SessionActorHandle>,
    list_tx: broadcast::Sender<ServerMessage>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        let (list_tx, _) = broadcast::channel(LIST_CAPACITY);
        Self {
            sessions: DashMap::new(),
            list_tx,
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Spawn an actor for a new session and announce it to list subscribers.
    pub fn create_session(
        &self,
        id: String,
        cwd: Option<String>,
        model: Option<String>,
    ) -> Result<SessionActorHandle, SessionError> {
        use dashmap::mapref::entry::Entry;

        let actor = match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(SessionError::AlreadyExists(id)),
            Entry::Vacant(slot) => {
                let handle = SessionHandle::new(id.clone())
                    .with_details(cwd, model)
                    .with_list_channel(self.list_tx.clone());
                slot.insert(SessionActorHandle::spawn(handle)).clone()
            }
        };

        let summary = actor.snapshot().summary.clone();
        let _ = self.list_tx.send(ServerMessage::SessionCreated { session: summary });
        info!(
            component = "registry",
            event = "session.created",
            session_id = %id,
            "Session created"
        );
        Ok(actor)
    }

    pub fn get_session(&self, id: &str) -> Option<SessionActorHandle> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    fn require(&self, id: &str) -> Result<SessionActorHandle, SessionError> {
        self.get_session(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    /// Stop the session actor and forget it. Returns false when unknown.
    pub async fn remove_session(&self, id: &str) -> bool {
        let Some((_, actor)) = self.sessions.remove(id) else {
            return false;
        };
        actor.send(SessionCommand::Close).await;
        let _ = self.list_tx.send(ServerMessage::SessionClosed {
            session_id: id.to_string(),
        });
        info!(
            component = "registry",
            event = "session.removed",
            session_id = %id,
            "Session removed"
        );
        true
    }

    /// Summaries of every session, oldest first.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| entry.value().snapshot().summary.clone())
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        summaries
    }

    pub fn subscribe_list(&self) -> broadcast::Receiver<ServerMessage> {
        self.list_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    // -- Direct transcript mutation --

    pub async fn append_message(&self, id: &str, message: Message) -> Result<bool, SessionError> {
        let applied = self.require(id)?.apply(Input::Message(message)).await?;
        Ok(!applied.appended.is_empty())
    }

    pub async fn begin_stream(
        &self,
        id: &str,
        message_id: String,
        parent_tool_use_id: Option<String>,
    ) -> Result<(), SessionError> {
        self.require(id)?
            .apply(Input::MessageStart {
                message_id,
                parent_tool_use_id,
            })
            .await?;
        Ok(())
    }

    pub async fn append_stream_delta(
        &self,
        id: &str,
        text: String,
        output_tokens: u64,
    ) -> Result<(), SessionError> {
        self.require(id)?
            .apply(Input::TextDelta {
                text,
                output_tokens,
            })
            .await?;
        Ok(())
    }

    /// Close the open stream. `None` when there was nothing to finalize.
    pub async fn finalize_stream(&self, id: &str) -> Result<Option<Message>, SessionError> {
        let applied = self
            .require(id)?
            .apply(Input::MessageEnd { message_id: None })
            .await?;
        Ok(applied.appended.into_iter().next())
    }
}
