//! Session actor: owns a SessionHandle and processes commands sequentially.
//!
//! Each session runs as an independent tokio task. External callers
//! communicate via `SessionActorHandle` which sends `SessionCommand`
//! messages over an mpsc channel. Lock-free reads go through `ArcSwap`.

use std::sync::Arc;

use arc_swap::ArcSwap;
use companion_protocol::{
    new_id, AgentEvent, ConnectionStatus, Message, MessageRole, OutboundEvent, RunStatus,
    ServerMessage,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::session::{now_millis, SessionHandle, SessionSnapshot};
use crate::session_command::{Applied, SessionCommand};
use crate::transition::Input;

const COMMAND_CAPACITY: usize = 256;

/// Handle to a running session actor (cheap to Clone).
#[derive(Clone)]
pub struct SessionActorHandle {
    pub id: String,
    command_tx: mpsc::Sender<SessionCommand>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionActorHandle {
    /// Spawn the actor task for `handle`, returning a handle to it.
    pub fn spawn(handle: SessionHandle) -> SessionActorHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CAPACITY);
        let snapshot = handle.snapshot_arc();
        let id = handle.id().to_string();
        handle.refresh_snapshot();

        tokio::spawn(actor_loop(handle, command_rx));

        SessionActorHandle {
            id,
            command_tx,
            snapshot,
        }
    }

    /// Send a command to the actor (fire-and-forget).
    pub async fn send(&self, cmd: SessionCommand) {
        if self.command_tx.send(cmd).await.is_err() {
            warn!(
                component = "session_actor",
                session_id = %self.id,
                "Actor channel closed, command dropped"
            );
        }
    }

    /// Send a command carrying a reply channel and wait for the answer.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| SessionError::Closed(self.id.clone()))?;
        rx.await.map_err(|_| SessionError::Closed(self.id.clone()))
    }

    /// Apply an input and wait until it has been processed.
    pub async fn apply(&self, input: Input) -> Result<Applied, SessionError> {
        self.request(|reply| SessionCommand::Apply {
            input,
            reply: Some(reply),
        })
        .await
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snapshot.load_full()
    }

    pub fn is_closed(&self) -> bool {
        self.command_tx.is_closed()
    }
}

async fn actor_loop(mut handle: SessionHandle, mut command_rx: mpsc::Receiver<SessionCommand>) {
    while let Some(cmd) = command_rx.recv().await {
        if let SessionCommand::Close = cmd {
            let session_id = handle.id().to_string();
            handle.broadcast(ServerMessage::SessionClosed {
                session_id: session_id.clone(),
            });
            info!(
                component = "session_actor",
                event = "session.closed",
                session_id = %session_id,
                "Session actor stopped"
            );
            return;
        }
        handle_session_command(cmd, &mut handle).await;
    }
}

/// Process one command against the session. Commands never fail the actor;
/// errors go back through the reply channel.
pub async fn handle_session_command(cmd: SessionCommand, handle: &mut SessionHandle) {
    match cmd {
        SessionCommand::GetState { reply } => {
            let _ = reply.send(handle.full_state());
        }

        SessionCommand::Subscribe { reply } => {
            let _ = reply.send((handle.full_state(), handle.subscribe()));
        }

        SessionCommand::Apply { input, reply } => {
            let appended = handle.apply(input);
            if let Some(reply) = reply {
                let _ = reply.send(Applied {
                    appended,
                    revision: handle.revision(),
                });
            }
        }

        // -- Connection lifecycle --
        SessionCommand::Ingest { epoch, event } => {
            if !handle.accepts(epoch) || handle.connection() != ConnectionStatus::Connected {
                handle.record_dropped();
                debug!(
                    component = "session_actor",
                    event = "session.stale_event",
                    session_id = %handle.id(),
                    epoch,
                    current_epoch = handle.connection_epoch(),
                    kind = event.kind(),
                    "Dropped event from a torn-down connection"
                );
                return;
            }
            if let AgentEvent::PermissionRequest { request, .. } = &event {
                info!(
                    component = "session_actor",
                    event = "session.permission_requested",
                    session_id = %handle.id(),
                    request_id = %request.request_id,
                    tool = request.tool_name().unwrap_or("unknown"),
                    "Permission requested"
                );
            }
            handle.apply(Input::from(event));
        }

        SessionCommand::FrameDropped { epoch, error } => {
            if handle.accepts(epoch) {
                handle.record_dropped();
                warn!(
                    component = "session_actor",
                    event = "session.frame_dropped",
                    session_id = %handle.id(),
                    error = %error,
                    dropped_events = handle.dropped_events(),
                    "Dropped malformed frame"
                );
            }
        }

        SessionCommand::SetConnecting { epoch } => {
            handle.set_connection_epoch(epoch);
            handle.set_outbound(None);
            handle.apply(Input::Connecting);
        }

        SessionCommand::Attached { epoch, outbound } => {
            if handle.connection_epoch() != epoch {
                debug!(
                    component = "session_actor",
                    event = "session.attach_stale",
                    session_id = %handle.id(),
                    epoch,
                    current_epoch = handle.connection_epoch(),
                    "Ignoring attach for superseded connection"
                );
                return;
            }
            handle.set_outbound(Some(outbound));
            handle.apply(Input::Attached);
            info!(
                component = "session_actor",
                event = "session.connected",
                session_id = %handle.id(),
                epoch,
                "Session connected"
            );
        }

        SessionCommand::ConnectionLost {
            epoch,
            reason,
            reconnecting,
        } => {
            if !handle.accepts(epoch) {
                return;
            }
            handle.set_outbound(None);
            if !reconnecting {
                handle.set_connection_epoch(0);
            }
            handle.apply(Input::ConnectionLost { reconnecting });
            warn!(
                component = "session_actor",
                event = "session.connection_lost",
                session_id = %handle.id(),
                reason = %reason,
                reconnecting,
                "Session connection lost"
            );
        }

        SessionCommand::ConnectFailed { epoch, error } => {
            if handle.connection_epoch() != epoch {
                return;
            }
            handle.set_connection_epoch(0);
            handle.set_outbound(None);
            handle.apply(Input::ConnectFailed { error });
        }

        SessionCommand::ConnectCancelled { epoch } => {
            // A Disconnect queued before this connect's SetConnecting would
            // otherwise leave the session connecting with no link behind it.
            if handle.connection_epoch() != epoch {
                return;
            }
            handle.set_connection_epoch(0);
            handle.set_outbound(None);
            handle.apply(Input::Disconnected);
            debug!(
                component = "session_actor",
                event = "session.connect_cancelled",
                session_id = %handle.id(),
                epoch,
                "Abandoned connect reset to disconnected"
            );
        }

        SessionCommand::SetLive { epoch, live } => {
            if handle.accepts(epoch) {
                handle.apply(Input::LivenessChange(live));
            }
        }

        SessionCommand::Disconnect => {
            handle.set_connection_epoch(0);
            handle.set_outbound(None);
            handle.apply(Input::Disconnected);
        }

        // -- Operator actions --
        SessionCommand::SendUserMessage { content, reply } => {
            let result = send_user_message(handle, content, format!("user-{}", new_id())).await;
            let _ = reply.send(result);
        }

        SessionCommand::ResolvePermission {
            request_id,
            decision,
            reply,
        } => {
            let result = async {
                if !handle.state().permissions.contains(&request_id) {
                    return Err(SessionError::UnknownPermission(request_id));
                }
                let event = OutboundEvent::PermissionResolved {
                    session_id: handle.id().to_string(),
                    request_id: request_id.clone(),
                    decision,
                };
                send_outbound(handle, event).await?;
                handle.apply(Input::PermissionDecided { request_id });
                Ok(())
            }
            .await;
            let _ = reply.send(result);
        }

        SessionCommand::Relaunch { reply } => {
            let event = OutboundEvent::Relaunch {
                session_id: handle.id().to_string(),
            };
            let result = send_outbound(handle, event).await;
            if result.is_ok() {
                info!(
                    component = "session_actor",
                    event = "session.relaunch_requested",
                    session_id = %handle.id(),
                    "Requested agent relaunch"
                );
            }
            let _ = reply.send(result);
        }

        SessionCommand::RetryLastMessage { reply } => {
            let result = match retry_content(handle) {
                Ok(content) => {
                    send_user_message(handle, content, format!("user-{}", new_id())).await
                }
                Err(err) => Err(err),
            };
            let _ = reply.send(result);
        }

        SessionCommand::Close => {}
    }
}

/// Send over the attached connection, if any.
async fn send_outbound(handle: &SessionHandle, event: OutboundEvent) -> Result<(), SessionError> {
    let outbound = handle.outbound().ok_or(SessionError::NotConnected)?;
    outbound
        .send(event)
        .await
        .map_err(|_| SessionError::NotConnected)
}

async fn send_user_message(
    handle: &mut SessionHandle,
    content: String,
    message_id: String,
) -> Result<Message, SessionError> {
    if content.trim().is_empty() {
        return Err(SessionError::EmptyMessage);
    }

    let event = OutboundEvent::UserMessage {
        session_id: handle.id().to_string(),
        content: content.clone(),
    };
    send_outbound(handle, event).await?;

    let message = Message {
        id: message_id,
        role: MessageRole::User,
        content,
        content_blocks: Vec::new(),
        parent_tool_use_id: None,
        timestamp: now_millis(),
    };
    handle.apply(Input::LocalUserMessage(message.clone()));
    Ok(message)
}

/// The prompt to resend, when a retry makes sense right now.
fn retry_content(handle: &SessionHandle) -> Result<String, SessionError> {
    let state = handle.state();
    if state.run_status == RunStatus::Running {
        return Err(SessionError::RetryUnavailable("agent is still running"));
    }
    if !state.live {
        return Err(SessionError::RetryUnavailable("agent is not live"));
    }
    match state.transcript.last() {
        Some(last) if last.role == MessageRole::Assistant => {}
        _ => {
            return Err(SessionError::RetryUnavailable(
                "last message is not from the assistant",
            ))
        }
    }
    state
        .transcript
        .last_user_message()
        .map(|m| m.content.clone())
        .ok_or(SessionError::RetryUnavailable("no prompt to resend"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session_command::Reply;
    use companion_protocol::{PermissionDecision, PermissionRequest};
    use serde_json::Map;

    fn spawn() -> SessionActorHandle {
        SessionActorHandle::spawn(SessionHandle::new("s1".to_string()))
    }

    async fn attach(actor: &SessionActorHandle, epoch: u64) -> mpsc::Receiver<OutboundEvent> {
        let (outbound, rx) = mpsc::channel(16);
        actor.send(SessionCommand::SetConnecting { epoch }).await;
        actor
            .send(SessionCommand::Attached { epoch, outbound })
            .await;
        rx
    }

    async fn ingest(actor: &SessionActorHandle, epoch: u64, event: AgentEvent) {
        actor.send(SessionCommand::Ingest { epoch, event }).await;
    }

    async fn state(actor: &SessionActorHandle) -> companion_protocol::SessionState {
        actor
            .request(|reply| SessionCommand::GetState { reply })
            .await
            .unwrap()
    }

    fn permission(id: &str) -> PermissionRequest {
        PermissionRequest {
            request_id: id.to_string(),
            payload: Map::new(),
        }
    }

    #[tokio::test]
    async fn connect_cancelled_resets_only_its_own_epoch() {
        let actor = spawn();

        actor.send(SessionCommand::Disconnect).await;
        actor.send(SessionCommand::SetConnecting { epoch: 5 }).await;
        actor.send(SessionCommand::ConnectCancelled { epoch: 4 }).await;
        assert_eq!(state(&actor).await.summary.connection, ConnectionStatus::Connecting);

        actor.send(SessionCommand::ConnectCancelled { epoch: 5 }).await;
        assert_eq!(
            state(&actor).await.summary.connection,
            ConnectionStatus::Disconnected
        );

        // A late attach for the abandoned epoch must not revive the session.
        let (outbound, _rx) = mpsc::channel(1);
        actor
            .send(SessionCommand::Attached { epoch: 5, outbound })
            .await;
        assert_eq!(
            state(&actor).await.summary.connection,
            ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn ingests_stream_into_transcript() {
        let actor = spawn();
        let _outbound = attach(&actor, 1).await;

        ingest(
            &actor,
            1,
            AgentEvent::MessageStart {
                session_id: "s1".to_string(),
                message_id: Some("m1".to_string()),
                parent_tool_use_id: None,
            },
        )
        .await;
        for text in ["Hel", "lo"] {
            ingest(
                &actor,
                1,
                AgentEvent::TextDelta {
                    session_id: "s1".to_string(),
                    text: text.to_string(),
                    output_tokens: 1,
                },
            )
            .await;
        }
        ingest(
            &actor,
            1,
            AgentEvent::MessageEnd {
                session_id: "s1".to_string(),
                message_id: None,
            },
        )
        .await;

        let state = state(&actor).await;
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.messages[0].role, MessageRole::Assistant);
        assert_eq!(state.messages[0].content, "Hello");
        assert!(state.streaming.is_none());
        assert_eq!(actor.snapshot().messages.len(), 1);
    }

    #[tokio::test]
    async fn events_after_disconnect_are_dropped() {
        let actor = spawn();
        let _outbound = attach(&actor, 1).await;
        ingest(
            &actor,
            1,
            AgentEvent::PermissionRequest {
                session_id: "s1".to_string(),
                request: permission("r1"),
            },
        )
        .await;

        actor.send(SessionCommand::Disconnect).await;
        ingest(
            &actor,
            1,
            AgentEvent::PermissionRequest {
                session_id: "s1".to_string(),
                request: permission("r2"),
            },
        )
        .await;

        let state = state(&actor).await;
        assert!(state.permissions.is_empty());
        assert_eq!(state.summary.connection, ConnectionStatus::Disconnected);
        assert_eq!(actor.snapshot().dropped_events, 1);
    }

    #[tokio::test]
    async fn stale_epoch_is_ignored_after_reconnect() {
        let actor = spawn();
        let _first = attach(&actor, 1).await;
        actor
            .send(SessionCommand::ConnectionLost {
                epoch: 1,
                reason: "reset".to_string(),
                reconnecting: true,
            })
            .await;
        let _second = attach(&actor, 2).await;

        ingest(
            &actor,
            1,
            AgentEvent::StatusChange {
                session_id: "s1".to_string(),
                status: RunStatus::Compacting,
            },
        )
        .await;
        assert_eq!(state(&actor).await.summary.run_status, RunStatus::Idle);

        ingest(
            &actor,
            2,
            AgentEvent::StatusChange {
                session_id: "s1".to_string(),
                status: RunStatus::Compacting,
            },
        )
        .await;
        assert_eq!(state(&actor).await.summary.run_status, RunStatus::Compacting);
    }

    #[tokio::test]
    async fn send_message_requires_connection() {
        let actor = spawn();
        let result = actor
            .request(|reply| SessionCommand::SendUserMessage {
                content: "hello".to_string(),
                reply,
            })
            .await
            .unwrap();
        assert!(matches!(result, Err(SessionError::NotConnected)));

        let mut outbound = attach(&actor, 1).await;
        let message = actor
            .request(|reply| SessionCommand::SendUserMessage {
                content: "hello".to_string(),
                reply,
            })
            .await
            .unwrap()
            .unwrap();
        assert!(message.id.starts_with("user-"));
        assert!(matches!(
            outbound.recv().await,
            Some(OutboundEvent::UserMessage { content, .. }) if content == "hello"
        ));
        assert_eq!(state(&actor).await.summary.name.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn resolve_permission_routes_decision_outbound() {
        let actor = spawn();
        let mut outbound = attach(&actor, 1).await;
        for id in ["r1", "r2"] {
            ingest(
                &actor,
                1,
                AgentEvent::PermissionRequest {
                    session_id: "s1".to_string(),
                    request: permission(id),
                },
            )
            .await;
        }

        let resolve = |id: &str| {
            let request_id = id.to_string();
            move |reply: Reply<()>| SessionCommand::ResolvePermission {
                request_id,
                decision: PermissionDecision::Allow,
                reply,
            }
        };

        actor.request(resolve("r1")).await.unwrap().unwrap();
        assert!(matches!(
            outbound.recv().await,
            Some(OutboundEvent::PermissionResolved { request_id, decision: PermissionDecision::Allow, .. })
                if request_id == "r1"
        ));

        let second = actor.request(resolve("r1")).await.unwrap();
        assert!(matches!(second, Err(SessionError::UnknownPermission(_))));

        let pending: Vec<_> = state(&actor)
            .await
            .permissions
            .into_iter()
            .map(|p| p.request_id)
            .collect();
        assert_eq!(pending, ["r2"]);
    }

    #[tokio::test]
    async fn retry_resends_last_prompt_after_assistant_reply() {
        let actor = spawn();
        let mut outbound = attach(&actor, 1).await;

        let early = actor
            .request(|reply| SessionCommand::RetryLastMessage { reply })
            .await
            .unwrap();
        assert!(matches!(early, Err(SessionError::RetryUnavailable(_))));

        let first = actor
            .request(|reply| SessionCommand::SendUserMessage {
                content: "fix the build".to_string(),
                reply,
            })
            .await
            .unwrap()
            .unwrap();
        let _ = outbound.recv().await;

        ingest(
            &actor,
            1,
            AgentEvent::Message {
                session_id: "s1".to_string(),
                message: Message {
                    id: "a1".to_string(),
                    role: MessageRole::Assistant,
                    content: "API error".to_string(),
                    content_blocks: Vec::new(),
                    parent_tool_use_id: None,
                    timestamp: 2,
                },
            },
        )
        .await;

        let retried = actor
            .request(|reply| SessionCommand::RetryLastMessage { reply })
            .await
            .unwrap()
            .unwrap();
        assert!(retried.id.starts_with("user-"));
        assert_ne!(retried.id, first.id);
        assert_eq!(retried.content, "fix the build");
        assert!(matches!(
            outbound.recv().await,
            Some(OutboundEvent::UserMessage { content, .. }) if content == "fix the build"
        ));
    }

    #[tokio::test]
    async fn close_notifies_subscribers_and_stops() {
        let actor = spawn();
        let (_, mut rx) = actor
            .request(|reply| SessionCommand::Subscribe { reply })
            .await
            .unwrap();

        actor.send(SessionCommand::Close).await;
        assert!(matches!(
            rx.recv().await,
            Ok(ServerMessage::SessionClosed { session_id }) if session_id == "s1"
        ));

        let after = actor
            .request(|reply| SessionCommand::GetState { reply })
            .await;
        assert!(matches!(after, Err(SessionError::Closed(_))));
    }
}
