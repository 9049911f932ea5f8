//! WebSocket transport to the agent host
//!
//! One socket per session at `{agent_url}/ws/sessions/{id}`. Text frames
//! are agent events; outbound events are written back as JSON text frames.

use async_trait::async_trait;
use companion_protocol::OutboundEvent;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    decode_event, session_endpoint, Connection, ConnectionGuard, ConnectorError, ConnectorEvent,
    Transport,
};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Socket URL for a session, mapping http(s) to ws(s).
    pub fn session_url(&self, session_id: &str) -> Result<Url, ConnectorError> {
        let mut url = session_endpoint(&self.base_url, &["ws", "sessions"], session_id)?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            "ws" | "wss" => return Ok(url),
            _ => return Err(ConnectorError::InvalidUrl(self.base_url.clone())),
        };
        url.set_scheme(scheme)
            .map_err(|_| ConnectorError::InvalidUrl(self.base_url.clone()))?;
        Ok(url)
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, session_id: &str) -> Result<Connection, ConnectorError> {
        let url = self.session_url(session_id)?;

        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ConnectorError::ConnectError(e.to_string()))?;

        info!(
            component = "ws_transport",
            event = "transport.connected",
            session_id = %session_id,
            url = %url,
            "Connected to agent host"
        );

        let (mut write, mut read) = stream.split();
        let (event_tx, event_rx) = mpsc::channel::<ConnectorEvent>(EVENT_CHANNEL_CAPACITY);
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<OutboundEvent>(OUTBOUND_CHANNEL_CAPACITY);

        let writer_session = session_id.to_string();
        let writer = tokio::spawn(async move {
            while let Some(event) = outbound_rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(
                            component = "ws_transport",
                            event = "transport.serialize_failed",
                            session_id = %writer_session,
                            error = %e,
                            "Failed to serialize outbound event"
                        );
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::text(json)).await {
                    warn!(
                        component = "ws_transport",
                        event = "transport.write_failed",
                        session_id = %writer_session,
                        error = %e,
                        "Failed to write outbound event"
                    );
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!(
                component = "ws_transport",
                event = "transport.writer_closed",
                session_id = %writer_session,
                "Outbound writer ended"
            );
        });

        let reader_session = session_id.to_string();
        let reader = tokio::spawn(async move {
            let reason = loop {
                let event = match read.next().await {
                    Some(Ok(Message::Text(text))) => decode_event(text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "closed_by_host".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break format!("read_error: {e}"),
                    None => break "eof".to_string(),
                };

                if let ConnectorEvent::Malformed { error } = &event {
                    warn!(
                        component = "ws_transport",
                        event = "transport.frame_malformed",
                        session_id = %reader_session,
                        error = %error,
                        "Dropping malformed frame"
                    );
                }

                if event_tx.send(event).await.is_err() {
                    debug!(
                        component = "ws_transport",
                        event = "transport.reader_detached",
                        session_id = %reader_session,
                        "Event receiver dropped, stopping reader"
                    );
                    return;
                }
            };

            info!(
                component = "ws_transport",
                event = "transport.closed",
                session_id = %reader_session,
                reason = %reason,
                "Agent host connection closed"
            );
            let _ = event_tx.send(ConnectorEvent::Closed { reason }).await;
        });

        Ok(Connection {
            events: event_rx,
            outbound: outbound_tx,
            guard: ConnectionGuard::new(vec![reader, writer]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_url_maps_scheme() {
        let transport = WsTransport::new("http://127.0.0.1:3456/");
        assert_eq!(
            transport.session_url("s1").expect("url").as_str(),
            "ws://127.0.0.1:3456/ws/sessions/s1"
        );

        let secure = WsTransport::new("https://agent.local");
        assert_eq!(
            secure.session_url("abc").expect("url").as_str(),
            "wss://agent.local/ws/sessions/abc"
        );
    }

    #[test]
    fn session_url_encodes_opaque_ids() {
        let transport = WsTransport::new("http://127.0.0.1:3456");
        assert_eq!(
            transport.session_url("team/alpha?x=1#frag").expect("url").as_str(),
            "ws://127.0.0.1:3456/ws/sessions/team%2Falpha%3Fx=1%23frag"
        );
    }

    #[test]
    fn session_url_rejects_unknown_scheme() {
        let transport = WsTransport::new("ftp://host");
        assert!(matches!(
            transport.session_url("s1"),
            Err(ConnectorError::InvalidUrl(_))
        ));
    }
}
