//! Session management
//!
//! `SessionHandle` is the state owned by one session actor: the pure
//! `TransitionState` plus the I/O edges (subscribers, snapshot, outbound
//! channel to the agent host, connection epoch).

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use companion_protocol::{
    ConnectionStatus, Message, OutboundEvent, PermissionRequest, ServerMessage, SessionState,
    SessionSummary, StreamingState,
};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::transition::{transition, Diagnostic, Effect, Input, TransitionState};

const BROADCAST_CAPACITY: usize = 512;

/// Lock-free read view of a session, replaced wholesale after each mutation
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub summary: SessionSummary,
    pub messages: Arc<Vec<Message>>,
    pub streaming: Option<StreamingState>,
    pub permissions: Vec<PermissionRequest>,
    pub dropped_events: u64,
}

impl SessionSnapshot {
    pub fn to_state(&self) -> SessionState {
        SessionState {
            summary: self.summary.clone(),
            messages: self.messages.as_ref().clone(),
            streaming: self.streaming.clone(),
            permissions: self.permissions.clone(),
        }
    }
}

/// Handle to a running session
pub struct SessionHandle {
    state: TransitionState,
    revision: u64,
    created_at: u64,
    /// Connection generation accepted by this session; 0 when none.
    connection_epoch: u64,
    outbound: Option<mpsc::Sender<OutboundEvent>>,
    dropped_events: u64,
    broadcast_tx: broadcast::Sender<ServerMessage>,
    list_tx: Option<broadcast::Sender<ServerMessage>>,
    snapshot: Arc<ArcSwap<SessionSnapshot>>,
}

impl SessionHandle {
    /// Create a new session handle
    pub fn new(id: String) -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let state = TransitionState::new(id);
        let created_at = now_millis();
        let snapshot = Arc::new(ArcSwap::from_pointee(build_snapshot(
            &state, 0, created_at, 0,
        )));
        Self {
            state,
            revision: 0,
            created_at,
            connection_epoch: 0,
            outbound: None,
            dropped_events: 0,
            broadcast_tx,
            list_tx: None,
            snapshot,
        }
    }

    /// Forward summary-level changes to session list subscribers.
    pub fn with_list_channel(mut self, list_tx: broadcast::Sender<ServerMessage>) -> Self {
        self.list_tx = Some(list_tx);
        self
    }

    pub fn with_details(mut self, cwd: Option<String>, model: Option<String>) -> Self {
        self.state.cwd = cwd;
        self.state.model = model;
        self.refresh_snapshot();
        self
    }

    pub fn id(&self) -> &str {
        &self.state.id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn connection(&self) -> ConnectionStatus {
        self.state.connection
    }

    pub fn full_state(&self) -> SessionState {
        self.snapshot.load().to_state()
    }

    pub fn state(&self) -> &TransitionState {
        &self.state
    }

    /// Move the state out for a transition, leaving an empty placeholder.
    fn extract_state(&mut self) -> TransitionState {
        let placeholder = TransitionState::new(self.state.id.clone());
        std::mem::replace(&mut self.state, placeholder)
    }

    pub fn snapshot_arc(&self) -> Arc<ArcSwap<SessionSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    pub fn refresh_snapshot(&self) {
        self.snapshot.store(Arc::new(build_snapshot(
            &self.state,
            self.revision,
            self.created_at,
            self.dropped_events,
        )));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.broadcast_tx.subscribe()
    }

    /// Broadcast a message to all subscribers; never blocks.
    pub fn broadcast(&self, msg: ServerMessage) {
        if let (Some(list_tx), ServerMessage::SessionDelta { .. }) = (&self.list_tx, &msg) {
            let _ = list_tx.send(msg.clone());
        }
        let _ = self.broadcast_tx.send(msg);
    }

    /// Run one input through the transition and execute its effects.
    /// Returns the messages appended to the transcript.
    pub fn apply(&mut self, input: Input) -> Vec<Message> {
        let state = self.extract_state();
        let (next, effects) = transition(state, input, now_millis());
        self.state = next;

        let mut appended = Vec::new();
        let mut mutated = false;
        for effect in effects {
            match effect {
                Effect::Emit(msg) => {
                    if let ServerMessage::MessageAppended { message, .. } = msg.as_ref() {
                        appended.push(message.clone());
                    }
                    if !mutated {
                        self.revision += 1;
                        mutated = true;
                    }
                    self.broadcast(*msg);
                }
                Effect::Diagnostic(diagnostic) => self.report(diagnostic),
            }
        }

        self.refresh_snapshot();
        appended
    }

    fn report(&mut self, diagnostic: Diagnostic) {
        let session_id = self.id().to_string();
        if diagnostic.is_drop() {
            self.dropped_events += 1;
            warn!(
                component = "session",
                event = "session.event_dropped",
                session_id = %session_id,
                diagnostic = ?diagnostic,
                dropped_events = self.dropped_events,
                "Dropped out-of-sequence agent event"
            );
        } else {
            debug!(
                component = "session",
                event = "session.event_ignored",
                session_id = %session_id,
                diagnostic = ?diagnostic,
                "Ignored agent event"
            );
        }
    }

    /// Count an event that never reached the transition (stale or malformed).
    pub fn record_dropped(&mut self) {
        self.dropped_events += 1;
        self.refresh_snapshot();
    }

    pub fn dropped_events(&self) -> u64 {
        self.dropped_events
    }

    // -- Connection bookkeeping --

    pub fn connection_epoch(&self) -> u64 {
        self.connection_epoch
    }

    pub fn accepts(&self, epoch: u64) -> bool {
        epoch != 0 && epoch == self.connection_epoch
    }

    pub fn set_connection_epoch(&mut self, epoch: u64) {
        self.connection_epoch = epoch;
    }

    pub fn outbound(&self) -> Option<&mpsc::Sender<OutboundEvent>> {
        self.outbound.as_ref().filter(|tx| !tx.is_closed())
    }

    pub fn set_outbound(&mut self, outbound: Option<mpsc::Sender<OutboundEvent>>) {
        self.outbound = outbound;
    }
}

fn build_summary(state: &TransitionState, revision: u64, created_at: u64) -> SessionSummary {
    SessionSummary {
        id: state.id.clone(),
        name: state.name.clone(),
        connection: state.connection,
        live: state.live,
        run_status: state.run_status,
        cwd: state.cwd.clone(),
        model: state.model.clone(),
        context_used_percent: state.context_used_percent,
        context_warning: state.context_warning(),
        pending_permissions: state.permissions.len(),
        message_count: state.transcript.len(),
        revision,
        created_at,
        last_activity_at: state.last_activity_at,
    }
}

fn build_snapshot(
    state: &TransitionState,
    revision: u64,
    created_at: u64,
    dropped_events: u64,
) -> SessionSnapshot {
    SessionSnapshot {
        summary: build_summary(state, revision, created_at),
        messages: state.transcript.shared(),
        streaming: state.transcript.streaming().cloned(),
        permissions: state.permissions.list().to_vec(),
        dropped_events,
    }
}

/// Current time in unix milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
