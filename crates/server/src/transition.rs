//! Pure state transition function
//!
//! All business logic for session state changes lives here as a pure,
//! synchronous function: `transition(state, input, now) -> (state, effects)`.
//! No IO, no async, no locking. The actor executes the effects.

use std::collections::VecDeque;

use companion_protocol::{
    new_id, AgentEvent, ConnectionStatus, ContentBlock, ContextWarning, Message, MessageRole,
    PermissionRequest, RunStatus, ServerMessage, StateChanges,
};

use crate::permissions::PermissionQueue;
use crate::session_naming::name_from_first_prompt;
use crate::transcript::TranscriptStore;

/// Locally sent prompts awaiting a possible echo from the agent host.
const MAX_PENDING_ECHOES: usize = 8;

// ---------------------------------------------------------------------------
// TransitionState: pure data owned by one session
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TransitionState {
    pub id: String,
    pub connection: ConnectionStatus,
    pub live: bool,
    pub run_status: RunStatus,
    pub name: Option<String>,
    pub cwd: Option<String>,
    pub model: Option<String>,
    pub context_used_percent: f64,
    pub transcript: TranscriptStore,
    pub permissions: PermissionQueue,
    pub pending_echoes: VecDeque<String>,
    pub last_activity_at: Option<u64>,
}

impl TransitionState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            connection: ConnectionStatus::Disconnected,
            live: false,
            run_status: RunStatus::Idle,
            name: None,
            cwd: None,
            model: None,
            context_used_percent: 0.0,
            transcript: TranscriptStore::new(),
            permissions: PermissionQueue::default(),
            pending_echoes: VecDeque::new(),
            last_activity_at: None,
        }
    }

    pub fn context_warning(&self) -> ContextWarning {
        ContextWarning::from_percent(self.context_used_percent)
    }
}

// ---------------------------------------------------------------------------
// Input: agent events plus local connection lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Input {
    // -- Agent stream --
    MessageStart {
        message_id: String,
        parent_tool_use_id: Option<String>,
    },
    TextDelta {
        text: String,
        output_tokens: u64,
    },
    ContentBlock(ContentBlock),
    MessageEnd {
        message_id: Option<String>,
    },
    Message(Message),
    StatusChange(RunStatus),
    PermissionRequest(PermissionRequest),
    PermissionResolved {
        request_id: String,
    },
    LivenessChange(bool),
    SessionInfo {
        cwd: Option<String>,
        model: Option<String>,
        context_used_percent: Option<f64>,
    },

    // -- Local --
    /// A prompt the operator sent from here
    LocalUserMessage(Message),
    /// Resolved by the operator; removes the entry without waiting for the echo
    PermissionDecided {
        request_id: String,
    },

    // -- Connection lifecycle --
    Connecting,
    Attached,
    ConnectionLost {
        reconnecting: bool,
    },
    Disconnected,
    ConnectFailed {
        error: String,
    },
}

impl From<AgentEvent> for Input {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::MessageStart {
                message_id,
                parent_tool_use_id,
                ..
            } => Input::MessageStart {
                message_id: message_id.unwrap_or_else(new_id),
                parent_tool_use_id,
            },
            AgentEvent::TextDelta {
                text,
                output_tokens,
                ..
            } => Input::TextDelta {
                text,
                output_tokens,
            },
            AgentEvent::ContentBlock { block, .. } => Input::ContentBlock(block),
            AgentEvent::MessageEnd { message_id, .. } => Input::MessageEnd { message_id },
            AgentEvent::Message { message, .. } => Input::Message(message),
            AgentEvent::StatusChange { status, .. } => Input::StatusChange(status),
            AgentEvent::PermissionRequest { request, .. } => Input::PermissionRequest(request),
            AgentEvent::PermissionResolved { request_id, .. } => {
                Input::PermissionResolved { request_id }
            }
            AgentEvent::LivenessChange { live, .. } => Input::LivenessChange(live),
            AgentEvent::SessionInfo {
                cwd,
                model,
                context_used_percent,
                ..
            } => Input::SessionInfo {
                cwd,
                model,
                context_used_percent,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Effects: describe IO to be executed by the caller
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Effect {
    Emit(Box<ServerMessage>),
    Diagnostic(Diagnostic),
}

/// Non-fatal protocol anomalies, logged by the actor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A new stream opened before the previous one ended; the previous one was finalized.
    StreamSuperseded { message_id: String },
    /// A stream event arrived with no open stream and was dropped.
    StreamGap { event: &'static str },
    /// A message id that is already in the transcript; ignored.
    DuplicateMessage { message_id: String },
    /// The agent host echoed a prompt sent from here; not appended twice.
    EchoSuppressed { message_id: String },
    /// A resolution for a request that is not pending.
    UnknownPermission { request_id: String },
}

impl Diagnostic {
    /// Whether the event was lost (as opposed to deliberately ignored).
    pub fn is_drop(&self) -> bool {
        matches!(self, Diagnostic::StreamGap { .. })
    }
}

// ---------------------------------------------------------------------------
// transition(): the pure core
// ---------------------------------------------------------------------------

/// Pure, synchronous state transition.
///
/// Given the current state and an input, returns the new state and the
/// broadcasts/diagnostics to execute.
pub fn transition(
    mut state: TransitionState,
    input: Input,
    now: u64,
) -> (TransitionState, Vec<Effect>) {
    let sid = state.id.clone();
    let mut effects: Vec<Effect> = Vec::new();
    let mut changes = StateChanges::default();

    match input {
        // -- Streaming --------------------------------------------------------
        Input::MessageStart {
            message_id,
            parent_tool_use_id,
        } => {
            if let Some(previous) = state.transcript.streaming().map(|s| s.message_id.clone()) {
                effects.push(Effect::Diagnostic(Diagnostic::StreamSuperseded {
                    message_id: previous,
                }));
                finalize_stream(&mut state, &mut effects);
            }

            state
                .transcript
                .begin(message_id.clone(), parent_tool_use_id.clone(), now);
            effects.push(emit(ServerMessage::StreamStarted {
                session_id: sid.clone(),
                message_id,
                parent_tool_use_id,
            }));

            set_run_status(&mut state, RunStatus::Running, &mut changes);
            touch(&mut state, now, &mut changes);
        }

        Input::TextDelta {
            text,
            output_tokens,
        } => {
            if state.transcript.append_delta(&text, output_tokens) {
                if let Some(stream) = state.transcript.streaming() {
                    effects.push(emit(ServerMessage::StreamDelta {
                        session_id: sid.clone(),
                        message_id: stream.message_id.clone(),
                        text,
                        output_tokens: stream.output_tokens,
                    }));
                }
            } else {
                effects.push(Effect::Diagnostic(Diagnostic::StreamGap {
                    event: "text_delta",
                }));
            }
        }

        Input::ContentBlock(block) => {
            if state.transcript.push_block(block.clone()) {
                if let Some(stream) = state.transcript.streaming() {
                    effects.push(emit(ServerMessage::StreamBlock {
                        session_id: sid.clone(),
                        message_id: stream.message_id.clone(),
                        block,
                    }));
                }
            } else {
                effects.push(Effect::Diagnostic(Diagnostic::StreamGap {
                    event: "content_block",
                }));
            }
        }

        Input::MessageEnd { message_id } => {
            let open = state.transcript.streaming().map(|s| s.message_id.clone());
            let already_final = message_id
                .as_deref()
                .is_some_and(|id| state.transcript.contains(id));

            match open {
                // Redelivered end for a message we already have.
                Some(open_id) if already_final && message_id.as_deref() != Some(open_id.as_str()) => {}
                Some(_) => {
                    finalize_stream(&mut state, &mut effects);
                    touch(&mut state, now, &mut changes);
                }
                None if already_final => {}
                None => effects.push(Effect::Diagnostic(Diagnostic::StreamGap {
                    event: "message_end",
                })),
            }
        }

        // -- Complete messages ------------------------------------------------
        Input::Message(message) => {
            let echo_index = (message.role == MessageRole::User)
                .then(|| {
                    state
                        .pending_echoes
                        .iter()
                        .position(|content| *content == message.content)
                })
                .flatten();

            if let Some(index) = echo_index {
                state.pending_echoes.remove(index);
                effects.push(Effect::Diagnostic(Diagnostic::EchoSuppressed {
                    message_id: message.id,
                }));
            } else {
                append_message(&mut state, message, &mut effects, &mut changes);
                touch(&mut state, now, &mut changes);
            }
        }

        Input::LocalUserMessage(message) => {
            let content = message.content.clone();
            if append_message(&mut state, message, &mut effects, &mut changes) {
                state.pending_echoes.push_back(content);
                while state.pending_echoes.len() > MAX_PENDING_ECHOES {
                    state.pending_echoes.pop_front();
                }
            }
            touch(&mut state, now, &mut changes);
        }

        // -- Status -----------------------------------------------------------
        Input::StatusChange(status) => {
            set_run_status(&mut state, status, &mut changes);
            touch(&mut state, now, &mut changes);
        }

        Input::LivenessChange(live) => {
            set_live(&mut state, live, &mut changes);
        }

        Input::SessionInfo {
            cwd,
            model,
            context_used_percent,
        } => {
            if let Some(cwd) = cwd {
                if state.cwd.as_deref() != Some(cwd.as_str()) {
                    state.cwd = Some(cwd.clone());
                    changes.cwd = Some(Some(cwd));
                }
            }
            if let Some(model) = model {
                if state.model.as_deref() != Some(model.as_str()) {
                    state.model = Some(model.clone());
                    changes.model = Some(Some(model));
                }
            }
            if let Some(percent) = context_used_percent {
                let percent = percent.clamp(0.0, 100.0);
                if percent != state.context_used_percent {
                    let before = state.context_warning();
                    state.context_used_percent = percent;
                    changes.context_used_percent = Some(percent);
                    let after = state.context_warning();
                    if after != before {
                        changes.context_warning = Some(after);
                    }
                }
            }
        }

        // -- Permissions ------------------------------------------------------
        Input::PermissionRequest(request) => {
            state.permissions.add(request.clone());
            effects.push(emit(ServerMessage::PermissionRequested {
                session_id: sid.clone(),
                request,
            }));
            touch(&mut state, now, &mut changes);
        }

        Input::PermissionResolved { request_id } | Input::PermissionDecided { request_id } => {
            if state.permissions.remove(&request_id).is_some() {
                effects.push(emit(ServerMessage::PermissionRemoved {
                    session_id: sid.clone(),
                    request_id,
                }));
                touch(&mut state, now, &mut changes);
            } else {
                effects.push(Effect::Diagnostic(Diagnostic::UnknownPermission {
                    request_id,
                }));
            }
        }

        // -- Connection lifecycle ---------------------------------------------
        Input::Connecting => {
            set_connection(&mut state, ConnectionStatus::Connecting, &mut changes);
        }

        Input::Attached => {
            set_connection(&mut state, ConnectionStatus::Connected, &mut changes);
            set_live(&mut state, true, &mut changes);
        }

        Input::ConnectionLost { reconnecting } => {
            let next = if reconnecting {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Disconnected
            };
            tear_down(&mut state, next, &mut effects, &mut changes);
        }

        Input::Disconnected => {
            tear_down(
                &mut state,
                ConnectionStatus::Disconnected,
                &mut effects,
                &mut changes,
            );
        }

        Input::ConnectFailed { error } => {
            tear_down(
                &mut state,
                ConnectionStatus::Disconnected,
                &mut effects,
                &mut changes,
            );
            effects.push(emit(ServerMessage::session_error(
                sid.clone(),
                "transport_failed",
                error,
            )));
        }
    }

    if !changes.is_empty() {
        effects.push(emit(ServerMessage::SessionDelta {
            session_id: sid,
            changes,
        }));
    }

    (state, effects)
}

fn emit(msg: ServerMessage) -> Effect {
    Effect::Emit(Box::new(msg))
}

fn touch(state: &mut TransitionState, now: u64, changes: &mut StateChanges) {
    state.last_activity_at = Some(now);
    changes.last_activity_at = Some(now);
}

fn set_run_status(state: &mut TransitionState, status: RunStatus, changes: &mut StateChanges) {
    if state.run_status != status {
        state.run_status = status;
        changes.run_status = Some(status);
    }
}

fn set_live(state: &mut TransitionState, live: bool, changes: &mut StateChanges) {
    if state.live != live {
        state.live = live;
        changes.live = Some(live);
    }
}

fn set_connection(
    state: &mut TransitionState,
    connection: ConnectionStatus,
    changes: &mut StateChanges,
) {
    if state.connection != connection {
        state.connection = connection;
        changes.connection = Some(connection);
    }
}

/// Append and broadcast; names the session from its first real prompt.
fn append_message(
    state: &mut TransitionState,
    message: Message,
    effects: &mut Vec<Effect>,
    changes: &mut StateChanges,
) -> bool {
    if !state.transcript.append(message.clone()) {
        effects.push(Effect::Diagnostic(Diagnostic::DuplicateMessage {
            message_id: message.id,
        }));
        return false;
    }

    if state.name.is_none() && message.role == MessageRole::User {
        if let Some(name) = name_from_first_prompt(&message.content) {
            state.name = Some(name.clone());
            changes.name = Some(Some(name));
        }
    }

    effects.push(emit(ServerMessage::MessageAppended {
        session_id: state.id.clone(),
        message,
    }));
    true
}

fn finalize_stream(state: &mut TransitionState, effects: &mut Vec<Effect>) {
    let message_id = state.transcript.streaming().map(|s| s.message_id.clone());
    match state.transcript.finalize() {
        Some(message) => {
            effects.push(emit(ServerMessage::MessageAppended {
                session_id: state.id.clone(),
                message,
            }));
        }
        None => {
            if let Some(message_id) = message_id {
                effects.push(Effect::Diagnostic(Diagnostic::DuplicateMessage { message_id }));
            }
        }
    }
    effects.push(emit(ServerMessage::StreamCleared {
        session_id: state.id.clone(),
    }));
}

/// Drop everything tied to the live connection.
fn tear_down(
    state: &mut TransitionState,
    next: ConnectionStatus,
    effects: &mut Vec<Effect>,
    changes: &mut StateChanges,
) {
    if state.permissions.clear() > 0 {
        effects.push(emit(ServerMessage::PermissionsCleared {
            session_id: state.id.clone(),
        }));
    }
    if state.transcript.discard_stream() {
        effects.push(emit(ServerMessage::StreamCleared {
            session_id: state.id.clone(),
        }));
    }
    state.pending_echoes.clear();
    set_run_status(state, RunStatus::Idle, changes);
    set_live(state, false, changes);
    set_connection(state, next, changes);
}
