//! Companion Connector
//!
//! Transport to the agent host. A `Transport` opens one event stream per
//! session and hands back a sender for outbound events; a `LivenessProbe`
//! answers whether the remote agent process is still responding.

pub mod probe;
pub mod ws;

use async_trait::async_trait;
use companion_protocol::{AgentEvent, OutboundEvent};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use probe::{HttpLivenessProbe, LivenessProbe};
pub use ws::WsTransport;

/// Errors that can occur talking to the agent host
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("Failed to connect: {0}")]
    ConnectError(String),

    #[error("Invalid agent URL: {0}")]
    InvalidUrl(String),

    #[error("Transport I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Unexpected status {0}")]
    StatusError(u16),

    #[error("Channel closed")]
    ChannelClosed,
}

impl ConnectorError {
    /// Whether another attempt may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        match self {
            ConnectorError::ConnectError(_)
            | ConnectorError::IoError(_)
            | ConnectorError::HttpError(_)
            | ConnectorError::ChannelClosed => true,
            ConnectorError::StatusError(code) => *code >= 500 || *code == 429,
            ConnectorError::InvalidUrl(_) | ConnectorError::JsonError(_) => false,
        }
    }
}

/// Events emitted by an open connection
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// Decoded agent event
    Agent(AgentEvent),

    /// Frame that could not be decoded; the stream continues
    Malformed { error: String },

    /// The transport went away
    Closed { reason: String },
}

/// Aborts the connection's I/O tasks when dropped.
#[derive(Debug, Default)]
pub struct ConnectionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl ConnectionGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// One open per-session connection to the agent host
#[derive(Debug)]
pub struct Connection {
    pub events: mpsc::Receiver<ConnectorEvent>,
    pub outbound: mpsc::Sender<OutboundEvent>,
    pub guard: ConnectionGuard,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the event stream for one session.
    async fn open(&self, session_id: &str) -> Result<Connection, ConnectorError>;
}

/// `{base_url}/{prefix...}/{session_id}` with the session id encoded as a
/// single path segment.
pub fn session_endpoint(
    base_url: &str,
    prefix: &[&str],
    session_id: &str,
) -> Result<Url, ConnectorError> {
    let invalid = || ConnectorError::InvalidUrl(base_url.to_string());
    let mut url = Url::parse(base_url).map_err(|_| invalid())?;
    url.path_segments_mut()
        .map_err(|_| invalid())?
        .pop_if_empty()
        .extend(prefix)
        .push(session_id);
    Ok(url)
}

/// Decode a single text frame from the agent host.
pub fn decode_frame(frame: &str) -> Result<AgentEvent, ConnectorError> {
    Ok(serde_json::from_str(frame.trim())?)
}

/// Decode a frame, turning failures into a `Malformed` event.
pub fn decode_event(frame: &str) -> ConnectorEvent {
    match decode_frame(frame) {
        Ok(event) => ConnectorEvent::Agent(event),
        Err(e) => ConnectorEvent::Malformed {
            error: e.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_valid_frame() {
        let event = decode_frame(r#" {"type":"liveness_change","session_id":"s1","live":false} "#)
            .expect("decode");
        assert_eq!(
            event,
            AgentEvent::LivenessChange {
                session_id: "s1".to_string(),
                live: false,
            }
        );
    }

    #[test]
    fn malformed_frames_become_diagnostics() {
        match decode_event("not json") {
            ConnectorEvent::Malformed { error } => assert!(!error.is_empty()),
            other => panic!("expected malformed, got {:?}", other),
        }
        match decode_event(r#"{"type":"text_delta"}"#) {
            ConnectorEvent::Malformed { .. } => {}
            other => panic!("expected malformed, got {:?}", other),
        }
    }

    #[test]
    fn session_endpoint_keeps_id_in_one_segment() {
        let url = session_endpoint(
            "http://127.0.0.1:3456/",
            &["api", "sessions"],
            "team/alpha?x=1#frag",
        )
        .expect("url");
        assert_eq!(
            url.as_str(),
            "http://127.0.0.1:3456/api/sessions/team%2Falpha%3Fx=1%23frag"
        );
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);

        let nested = session_endpoint("http://host/agent", &["api", "sessions"], "s1").expect("url");
        assert_eq!(nested.as_str(), "http://host/agent/api/sessions/s1");
    }

    #[test]
    fn session_endpoint_rejects_unparseable_base() {
        assert!(matches!(
            session_endpoint("not a url", &["api"], "s1"),
            Err(ConnectorError::InvalidUrl(_))
        ));
    }

    #[test]
    fn retryable_classification() {
        assert!(ConnectorError::ConnectError("refused".into()).is_retryable());
        assert!(ConnectorError::StatusError(503).is_retryable());
        assert!(!ConnectorError::StatusError(404).is_retryable());
        assert!(!ConnectorError::InvalidUrl("ftp://x".into()).is_retryable());
    }
}
