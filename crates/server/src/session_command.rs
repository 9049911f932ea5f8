//! Commands sent to a session actor from the registry, supervisor and websocket callers.

use companion_protocol::{
    AgentEvent, Message, OutboundEvent, PermissionDecision, ServerMessage, SessionState,
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::SessionError;
use crate::transition::Input;

/// Outcome of a locally applied input.
#[derive(Debug, Clone, Default)]
pub struct Applied {
    /// Messages that landed in the transcript.
    pub appended: Vec<Message>,
    /// Revision after the input was applied.
    pub revision: u64,
}

pub type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    // -- Queries --
    GetState {
        reply: oneshot::Sender<SessionState>,
    },

    /// Snapshot plus a receiver registered at the same point in the event order.
    Subscribe {
        reply: oneshot::Sender<(SessionState, broadcast::Receiver<ServerMessage>)>,
    },

    // -- Direct mutation --
    /// Run an input through the transition regardless of connection state.
    Apply {
        input: Input,
        reply: Option<oneshot::Sender<Applied>>,
    },

    // -- Connection lifecycle (issued by the supervisor) --
    /// An agent event read off connection `epoch`.
    Ingest {
        epoch: u64,
        event: AgentEvent,
    },
    /// A frame on connection `epoch` could not be decoded.
    FrameDropped {
        epoch: u64,
        error: String,
    },
    SetConnecting {
        epoch: u64,
    },
    Attached {
        epoch: u64,
        outbound: mpsc::Sender<OutboundEvent>,
    },
    ConnectionLost {
        epoch: u64,
        reason: String,
        reconnecting: bool,
    },
    ConnectFailed {
        epoch: u64,
        error: String,
    },
    /// Connect for `epoch` was abandoned by a disconnect or shutdown.
    ConnectCancelled {
        epoch: u64,
    },
    SetLive {
        epoch: u64,
        live: bool,
    },
    /// Operator-initiated teardown; valid from any state.
    Disconnect,

    // -- Operator actions --
    SendUserMessage {
        content: String,
        reply: Reply<Message>,
    },
    ResolvePermission {
        request_id: String,
        decision: PermissionDecision,
        reply: Reply<()>,
    },
    Relaunch {
        reply: Reply<()>,
    },
    RetryLastMessage {
        reply: Reply<Message>,
    },

    /// Broadcast `SessionClosed` and stop the actor.
    Close,
}
