//! WebSocket handling

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use companion_protocol::{new_id, ClientMessage, ServerMessage};

use crate::error::{SessionError, SupervisorError};
use crate::feed::reconstruct;
use crate::session_actor::SessionActorHandle;
use crate::session_command::SessionCommand;
use crate::state::AppState;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const OUTBOUND_CAPACITY: usize = 100;

/// Messages that can be sent through the WebSocket
#[allow(clippy::large_enum_variant)]
enum OutboundMessage {
    /// JSON-serialized ServerMessage
    Json(ServerMessage),
    /// Raw pong response
    Pong(Bytes),
}

/// Per-connection subscription bookkeeping
struct ClientContext {
    conn_id: u64,
    tx: mpsc::Sender<OutboundMessage>,
    list_forwarder: Option<JoinHandle<()>>,
    session_forwarders: HashMap<String, JoinHandle<()>>,
}

impl ClientContext {
    fn new(conn_id: u64, tx: mpsc::Sender<OutboundMessage>) -> Self {
        Self {
            conn_id,
            tx,
            list_forwarder: None,
            session_forwarders: HashMap::new(),
        }
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.tx.send(OutboundMessage::Json(msg)).await;
    }

    async fn send_session_error(&self, session_id: &str, err: &SessionError) {
        self.send(ServerMessage::session_error(
            session_id,
            err.code(),
            err.to_string(),
        ))
        .await;
    }

    fn unsubscribe(&mut self, session_id: &str) {
        if let Some(task) = self.session_forwarders.remove(session_id) {
            task.abort();
        }
    }
}

impl Drop for ClientContext {
    fn drop(&mut self) {
        if let Some(task) = self.list_forwarder.take() {
            task.abort();
        }
        for (_, task) in self.session_forwarders.drain() {
            task.abort();
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    let mut ctx = ClientContext::new(conn_id, outbound_tx.clone());

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                ctx.send(ServerMessage::error("parse_error", e.to_string()))
                    .await;
                continue;
            }
        };

        handle_client_message(client_msg, &mut ctx, &state).await;
    }

    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    drop(ctx);
    send_task.abort();
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Spawn a task that drains a broadcast receiver into the client's outbound
/// channel. Exits when the client goes away or the sender closes.
///
/// A lagging subscriber gets a `lagged` error so it can re-subscribe for a
/// fresh snapshot.
fn spawn_broadcast_forwarder(
    mut rx: broadcast::Receiver<ServerMessage>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    session_id: Option<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if outbound_tx.send(OutboundMessage::Json(msg)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        component = "websocket",
                        event = "ws.broadcast.lagged",
                        session_id = ?session_id,
                        skipped = n,
                        "Broadcast subscriber lagged, skipped {n} messages"
                    );
                    let _ = outbound_tx
                        .send(OutboundMessage::Json(ServerMessage::Error {
                            code: "lagged".to_string(),
                            message: format!("Subscriber lagged, skipped {n} messages"),
                            session_id: session_id.clone(),
                        }))
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn normalize_non_empty(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Start connecting in the background; the connect may sit in backoff for a
/// while and must not hold up this client's other requests. Transport
/// failures reach subscribers through the session itself.
fn spawn_connect(state: &AppState, ctx: &ClientContext, session_id: String) {
    let supervisor = state.supervisor.clone();
    let tx = ctx.tx.clone();
    tokio::spawn(async move {
        match supervisor.connect(&session_id).await {
            Ok(())
            | Err(SupervisorError::Cancelled)
            | Err(SupervisorError::Exhausted { .. })
            | Err(SupervisorError::Fatal(_)) => {}
            Err(err) => {
                let _ = tx
                    .send(OutboundMessage::Json(ServerMessage::session_error(
                        session_id,
                        err.code(),
                        err.to_string(),
                    )))
                    .await;
            }
        }
    });
}

fn lookup(state: &AppState, session_id: &str) -> Result<SessionActorHandle, SessionError> {
    state
        .registry
        .get_session(session_id)
        .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
}

async fn handle_client_message(msg: ClientMessage, ctx: &mut ClientContext, state: &AppState) {
    debug!(
        component = "websocket",
        event = "ws.message.received",
        connection_id = ctx.conn_id,
        message = ?msg,
        "Received client message"
    );

    match msg {
        ClientMessage::SubscribeList => {
            let rx = state.registry.subscribe_list();
            if let Some(previous) = ctx.list_forwarder.take() {
                previous.abort();
            }
            let sessions = state.registry.summaries();
            ctx.send(ServerMessage::SessionsList { sessions }).await;
            ctx.list_forwarder = Some(spawn_broadcast_forwarder(rx, ctx.tx.clone(), None));
        }

        ClientMessage::SubscribeSession { session_id } => {
            let result = match lookup(state, &session_id) {
                Ok(actor) => {
                    actor
                        .request(|reply| SessionCommand::Subscribe { reply })
                        .await
                }
                Err(err) => Err(err),
            };
            match result {
                Ok((session, rx)) => {
                    ctx.unsubscribe(&session_id);
                    ctx.send(ServerMessage::SessionSnapshot { session }).await;
                    let forwarder =
                        spawn_broadcast_forwarder(rx, ctx.tx.clone(), Some(session_id.clone()));
                    ctx.session_forwarders.insert(session_id, forwarder);
                }
                Err(err) => ctx.send_session_error(&session_id, &err).await,
            }
        }

        ClientMessage::UnsubscribeSession { session_id } => {
            ctx.unsubscribe(&session_id);
        }

        ClientMessage::CreateSession {
            session_id,
            cwd,
            model,
            connect,
        } => {
            let session_id = normalize_non_empty(session_id).unwrap_or_else(new_id);
            match state.registry.create_session(
                session_id.clone(),
                normalize_non_empty(cwd),
                normalize_non_empty(model),
            ) {
                Ok(actor) => {
                    // List subscribers already get this through the list channel.
                    if ctx.list_forwarder.is_none() {
                        ctx.send(ServerMessage::SessionCreated {
                            session: actor.snapshot().summary.clone(),
                        })
                        .await;
                    }
                    if connect {
                        spawn_connect(state, ctx, session_id);
                    }
                }
                Err(err) => ctx.send_session_error(&session_id, &err).await,
            }
        }

        ClientMessage::CloseSession { session_id } => {
            ctx.unsubscribe(&session_id);
            if let Err(err) = state.supervisor.close(&session_id).await {
                ctx.send(ServerMessage::session_error(
                    session_id,
                    err.code(),
                    err.to_string(),
                ))
                .await;
            }
        }

        ClientMessage::ConnectSession { session_id } => {
            if let Err(err) = lookup(state, &session_id) {
                ctx.send_session_error(&session_id, &err).await;
                return;
            }
            spawn_connect(state, ctx, session_id);
        }

        ClientMessage::DisconnectSession { session_id } => {
            if let Err(err) = state.supervisor.disconnect(&session_id).await {
                ctx.send(ServerMessage::session_error(
                    session_id,
                    err.code(),
                    err.to_string(),
                ))
                .await;
            }
        }

        ClientMessage::SendMessage {
            session_id,
            content,
        } => {
            let result = match lookup(state, &session_id) {
                Ok(actor) => actor
                    .request(|reply| SessionCommand::SendUserMessage { content, reply })
                    .await
                    .and_then(|sent| sent.map(|_| ())),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                ctx.send_session_error(&session_id, &err).await;
            }
        }

        ClientMessage::ResolvePermission {
            session_id,
            request_id,
            decision,
        } => {
            let result = match lookup(state, &session_id) {
                Ok(actor) => actor
                    .request(|reply| SessionCommand::ResolvePermission {
                        request_id,
                        decision,
                        reply,
                    })
                    .await
                    .and_then(|resolved| resolved),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                ctx.send_session_error(&session_id, &err).await;
            }
        }

        ClientMessage::RelaunchSession { session_id } => {
            let result = match lookup(state, &session_id) {
                Ok(actor) => actor
                    .request(|reply| SessionCommand::Relaunch { reply })
                    .await
                    .and_then(|relaunched| relaunched),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                ctx.send_session_error(&session_id, &err).await;
            }
        }

        ClientMessage::RetryLastMessage { session_id } => {
            let result = match lookup(state, &session_id) {
                Ok(actor) => actor
                    .request(|reply| SessionCommand::RetryLastMessage { reply })
                    .await
                    .and_then(|sent| sent.map(|_| ())),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                ctx.send_session_error(&session_id, &err).await;
            }
        }

        ClientMessage::GetFeed { session_id } => match lookup(state, &session_id) {
            Ok(actor) => {
                let snapshot = actor.snapshot();
                ctx.send(ServerMessage::Feed {
                    session_id,
                    revision: snapshot.summary.revision,
                    entries: reconstruct(&snapshot.messages),
                })
                .await;
            }
            Err(err) => ctx.send_session_error(&session_id, &err).await,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use companion_connector::{
        Connection, ConnectionGuard, ConnectorError, ConnectorEvent, LivenessProbe, Transport,
    };
    use companion_protocol::{ConnectionStatus, FeedEntry};

    use crate::config::SupervisorConfig;
    use crate::state::SessionRegistry;
    use crate::supervisor::ConnectionSupervisor;

    struct RefusingTransport;

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn open(&self, _session_id: &str) -> Result<Connection, ConnectorError> {
            Err(ConnectorError::InvalidUrl("test://".to_string()))
        }
    }

    /// Opens links that stay up until the test ends.
    #[derive(Default)]
    struct OpenTransport {
        links: std::sync::Mutex<Vec<mpsc::Sender<ConnectorEvent>>>,
    }

    #[async_trait]
    impl Transport for OpenTransport {
        async fn open(&self, _session_id: &str) -> Result<Connection, ConnectorError> {
            let (events_tx, events) = mpsc::channel(1);
            let (outbound, _outbound_rx) = mpsc::channel(1);
            self.links.lock().unwrap().push(events_tx);
            Ok(Connection {
                events,
                outbound,
                guard: ConnectionGuard::new(Vec::new()),
            })
        }
    }

    struct AlwaysAlive;

    #[async_trait]
    impl LivenessProbe for AlwaysAlive {
        async fn is_alive(&self, _session_id: &str) -> Result<bool, ConnectorError> {
            Ok(true)
        }
    }

    fn new_test_state(transport: Arc<dyn Transport>) -> AppState {
        let supervisor = ConnectionSupervisor::new(
            SessionRegistry::shared(),
            transport,
            Arc::new(AlwaysAlive),
            SupervisorConfig::default(),
        );
        AppState::new(supervisor)
    }

    fn new_client() -> (ClientContext, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (ClientContext::new(1, tx), rx)
    }

    async fn recv_server_message(rx: &mut mpsc::Receiver<OutboundMessage>) -> ServerMessage {
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for server message");
        match next.expect("expected outbound server message") {
            OutboundMessage::Json(message) => message,
            OutboundMessage::Pong(_) => panic!("expected JSON server message, got pong"),
        }
    }

    fn create(session_id: &str, connect: bool) -> ClientMessage {
        ClientMessage::CreateSession {
            session_id: Some(session_id.to_string()),
            cwd: Some("/repo".to_string()),
            model: None,
            connect,
        }
    }

    #[tokio::test]
    async fn create_then_subscribe_returns_snapshot() {
        let state = new_test_state(Arc::new(RefusingTransport));
        let (mut ctx, mut rx) = new_client();

        handle_client_message(create("s1", false), &mut ctx, &state).await;
        match recv_server_message(&mut rx).await {
            ServerMessage::SessionCreated { session } => assert_eq!(session.id, "s1"),
            other => panic!("expected session_created, got {:?}", other),
        }

        handle_client_message(
            ClientMessage::SubscribeSession {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        match recv_server_message(&mut rx).await {
            ServerMessage::SessionSnapshot { session } => {
                assert_eq!(session.summary.id, "s1");
                assert_eq!(session.summary.cwd.as_deref(), Some("/repo"));
                assert_eq!(session.summary.connection, ConnectionStatus::Disconnected);
            }
            other => panic!("expected session_snapshot, got {:?}", other),
        }
        assert!(ctx.session_forwarders.contains_key("s1"));
    }

    #[tokio::test]
    async fn list_subscription_sends_current_sessions() {
        let state = new_test_state(Arc::new(RefusingTransport));
        let (mut ctx, mut rx) = new_client();
        state
            .registry
            .create_session("s1".to_string(), None, None)
            .unwrap();

        handle_client_message(ClientMessage::SubscribeList, &mut ctx, &state).await;
        match recv_server_message(&mut rx).await {
            ServerMessage::SessionsList { sessions } => {
                assert_eq!(sessions.len(), 1);
                assert_eq!(sessions[0].id, "s1");
            }
            other => panic!("expected sessions_list, got {:?}", other),
        }

        handle_client_message(create("s2", false), &mut ctx, &state).await;
        match recv_server_message(&mut rx).await {
            ServerMessage::SessionCreated { session } => assert_eq!(session.id, "s2"),
            other => panic!("expected session_created, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn actions_on_unknown_sessions_report_not_found() {
        let state = new_test_state(Arc::new(RefusingTransport));
        let (mut ctx, mut rx) = new_client();

        handle_client_message(
            ClientMessage::SendMessage {
                session_id: "ghost".to_string(),
                content: "hello".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        match recv_server_message(&mut rx).await {
            ServerMessage::Error {
                code, session_id, ..
            } => {
                assert_eq!(code, "not_found");
                assert_eq!(session_id.as_deref(), Some("ghost"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sending_while_disconnected_is_rejected() {
        let state = new_test_state(Arc::new(RefusingTransport));
        let (mut ctx, mut rx) = new_client();
        handle_client_message(create("s1", false), &mut ctx, &state).await;
        let _ = recv_server_message(&mut rx).await;

        handle_client_message(
            ClientMessage::SendMessage {
                session_id: "s1".to_string(),
                content: "hello".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        match recv_server_message(&mut rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "not_connected"),
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn failed_connect_reaches_session_subscribers() {
        let state = new_test_state(Arc::new(RefusingTransport));
        let (mut ctx, mut rx) = new_client();
        handle_client_message(create("s1", false), &mut ctx, &state).await;
        let _ = recv_server_message(&mut rx).await;
        handle_client_message(
            ClientMessage::SubscribeSession {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        let _ = recv_server_message(&mut rx).await;

        handle_client_message(
            ClientMessage::ConnectSession {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;

        loop {
            match recv_server_message(&mut rx).await {
                ServerMessage::Error { code, .. } => {
                    assert_eq!(code, "transport_failed");
                    break;
                }
                ServerMessage::SessionDelta { .. } => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn feed_reflects_transcript() {
        let state = new_test_state(Arc::new(OpenTransport::default()));
        let (mut ctx, mut rx) = new_client();
        handle_client_message(create("s1", false), &mut ctx, &state).await;
        let _ = recv_server_message(&mut rx).await;

        state
            .registry
            .begin_stream("s1", "m1".to_string(), None)
            .await
            .unwrap();
        state
            .registry
            .append_stream_delta("s1", "Hello".to_string(), 1)
            .await
            .unwrap();
        state.registry.finalize_stream("s1").await.unwrap();

        handle_client_message(
            ClientMessage::GetFeed {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        match recv_server_message(&mut rx).await {
            ServerMessage::Feed {
                entries, revision, ..
            } => {
                assert!(revision > 0);
                assert!(matches!(
                    entries.as_slice(),
                    [FeedEntry::Message { message }] if message.content == "Hello"
                ));
            }
            other => panic!("expected feed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn close_removes_session() {
        let state = new_test_state(Arc::new(OpenTransport::default()));
        let (mut ctx, mut rx) = new_client();
        handle_client_message(create("s1", false), &mut ctx, &state).await;
        let _ = recv_server_message(&mut rx).await;
        state.supervisor.connect("s1").await.unwrap();

        handle_client_message(
            ClientMessage::CloseSession {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        assert!(state.registry.get_session("s1").is_none());
        assert!(!state.supervisor.is_linked("s1"));

        handle_client_message(
            ClientMessage::CloseSession {
                session_id: "s1".to_string(),
            },
            &mut ctx,
            &state,
        )
        .await;
        match recv_server_message(&mut rx).await {
            ServerMessage::Error { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("expected error, got {:?}", other),
        }
    }
}
