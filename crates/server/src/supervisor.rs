//! Connection supervisor
//!
//! Owns the transport lifecycle of every session: connect with bounded
//! backoff, pump agent events into the session actor, probe liveness,
//! reconnect after unexpected loss, and cancel all of it on disconnect.
//!
//! Each link (one successful open until its loss) gets a fresh epoch. The
//! actor only accepts events stamped with its current epoch, so anything a
//! torn-down link still delivers is dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use companion_connector::{Connection, ConnectorEvent, LivenessProbe, Transport};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;
use crate::retry::{retry, RetryError};
use crate::session_actor::SessionActorHandle;
use crate::session_command::SessionCommand;
use crate::state::SessionRegistry;

struct Link {
    epoch: u64,
    token: CancellationToken,
}

pub struct ConnectionSupervisor {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    probe: Arc<dyn LivenessProbe>,
    config: SupervisorConfig,
    links: DashMap<String, Link>,
    next_epoch: AtomicU64,
    root: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn Transport>,
        probe: Arc<dyn LivenessProbe>,
        config: SupervisorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            transport,
            probe,
            config,
            links: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            root: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether a connect is in flight or a link is up for `session_id`.
    pub fn is_linked(&self, session_id: &str) -> bool {
        self.links.contains_key(session_id)
    }

    fn allocate_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Connect a session. Returns once the link is up or the bounded retry
    /// gave up. Connecting a session that is already connecting or connected
    /// is a no-op.
    pub async fn connect(self: &Arc<Self>, session_id: &str) -> Result<(), SupervisorError> {
        if self.root.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let actor = self
            .registry
            .get_session(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.to_string()))?;

        let (epoch, token) = match self.links.entry(session_id.to_string()) {
            Entry::Occupied(_) => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.connect_noop",
                    session_id = %session_id,
                    "Session already connecting or connected"
                );
                return Ok(());
            }
            Entry::Vacant(slot) => {
                let epoch = self.allocate_epoch();
                let token = self.root.child_token();
                slot.insert(Link {
                    epoch,
                    token: token.clone(),
                });
                (epoch, token)
            }
        };

        info!(
            component = "supervisor",
            event = "supervisor.connect",
            session_id = %session_id,
            epoch,
            "Connecting session"
        );

        let connection = self.open_link(&actor, epoch, &token).await?;
        tokio::spawn(Arc::clone(self).supervise(actor, epoch, token, connection));
        Ok(())
    }

    /// Tear the session's link down. Valid from any state; always ends
    /// disconnected.
    pub async fn disconnect(&self, session_id: &str) -> Result<(), SupervisorError> {
        let actor = self
            .registry
            .get_session(session_id)
            .ok_or_else(|| SupervisorError::NotFound(session_id.to_string()))?;

        if let Some((_, link)) = self.links.remove(session_id) {
            link.token.cancel();
            info!(
                component = "supervisor",
                event = "supervisor.disconnect",
                session_id = %session_id,
                epoch = link.epoch,
                "Disconnected session"
            );
        }
        actor.send(SessionCommand::Disconnect).await;
        Ok(())
    }

    /// Disconnect and remove the session from the registry.
    pub async fn close(&self, session_id: &str) -> Result<(), SupervisorError> {
        self.disconnect(session_id).await?;
        self.registry.remove_session(session_id).await;
        // A connect racing the close may have registered a link meanwhile.
        if let Some((_, link)) = self.links.remove(session_id) {
            link.token.cancel();
        }
        Ok(())
    }

    /// Cancel every link. Later connects fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        self.root.cancel();
        let ids: Vec<String> = self.links.iter().map(|link| link.key().clone()).collect();
        for id in ids {
            if let Some((_, link)) = self.links.remove(&id) {
                link.token.cancel();
            }
            if let Some(actor) = self.registry.get_session(&id) {
                actor.send(SessionCommand::Disconnect).await;
            }
        }
        info!(
            component = "supervisor",
            event = "supervisor.shutdown",
            "Connection supervisor stopped"
        );
    }

    /// Forget the link if it still belongs to `epoch`.
    fn release(&self, session_id: &str, epoch: u64) {
        self.links.remove_if(session_id, |_, link| link.epoch == epoch);
    }

    /// Open the transport for `epoch` with bounded backoff and attach it to
    /// the actor.
    async fn open_link(
        &self,
        actor: &SessionActorHandle,
        epoch: u64,
        token: &CancellationToken,
    ) -> Result<Connection, SupervisorError> {
        actor.send(SessionCommand::SetConnecting { epoch }).await;

        let transport = Arc::clone(&self.transport);
        let session_id = actor.id.clone();
        let result = retry(&self.config.retry, token, || {
            let transport = Arc::clone(&transport);
            let session_id = session_id.clone();
            async move { transport.open(&session_id).await }
        })
        .await;

        let error = match result {
            Ok(connection) => {
                if token.is_cancelled() || actor.is_closed() {
                    self.release(&actor.id, epoch);
                    actor.send(SessionCommand::ConnectCancelled { epoch }).await;
                    return Err(SupervisorError::Cancelled);
                }
                actor
                    .send(SessionCommand::Attached {
                        epoch,
                        outbound: connection.outbound.clone(),
                    })
                    .await;
                info!(
                    component = "supervisor",
                    event = "supervisor.connected",
                    session_id = %actor.id,
                    epoch,
                    "Transport attached"
                );
                return Ok(connection);
            }
            Err(RetryError::Cancelled) => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.connect_cancelled",
                    session_id = %actor.id,
                    epoch,
                    "Connect cancelled"
                );
                self.release(&actor.id, epoch);
                actor.send(SessionCommand::ConnectCancelled { epoch }).await;
                return Err(SupervisorError::Cancelled);
            }
            Err(RetryError::Exhausted { attempts, error }) => {
                SupervisorError::Exhausted {
                    attempts,
                    source: error,
                }
            }
            Err(RetryError::Fatal(error)) => SupervisorError::Fatal(error),
        };

        warn!(
            component = "supervisor",
            event = "supervisor.connect_failed",
            session_id = %actor.id,
            epoch,
            error = %error,
            "Giving up on connect"
        );
        self.release(&actor.id, epoch);
        actor
            .send(SessionCommand::ConnectFailed {
                epoch,
                error: error.to_string(),
            })
            .await;
        Err(error)
    }

    /// Drive one session's links until disconnect, shutdown, or a loss that
    /// is not followed by a successful reconnect.
    async fn supervise(
        self: Arc<Self>,
        actor: SessionActorHandle,
        mut epoch: u64,
        token: CancellationToken,
        mut connection: Connection,
    ) {
        loop {
            let Some(reason) = self.pump(&actor, epoch, &token, connection).await else {
                return;
            };

            let reconnecting = self.config.auto_reconnect && !token.is_cancelled();
            warn!(
                component = "supervisor",
                event = "supervisor.connection_lost",
                session_id = %actor.id,
                epoch,
                reason = %reason,
                reconnecting,
                "Transport lost"
            );
            actor
                .send(SessionCommand::ConnectionLost {
                    epoch,
                    reason,
                    reconnecting,
                })
                .await;

            if !reconnecting {
                self.release(&actor.id, epoch);
                return;
            }

            let next = self.allocate_epoch();
            match self.links.get_mut(&actor.id) {
                Some(mut link) if link.epoch == epoch => link.epoch = next,
                _ => {
                    actor.send(SessionCommand::ConnectCancelled { epoch }).await;
                    return;
                }
            }
            epoch = next;

            connection = match self.open_link(&actor, epoch, &token).await {
                Ok(connection) => connection,
                Err(_) => return,
            };
        }
    }

    /// Forward events from one link until it ends. `None` when the link was
    /// cancelled rather than lost.
    async fn pump(
        &self,
        actor: &SessionActorHandle,
        epoch: u64,
        token: &CancellationToken,
        connection: Connection,
    ) -> Option<String> {
        let Connection {
            mut events,
            outbound,
            guard,
        } = connection;

        let probe_token = token.child_token();
        tokio::spawn(probe_loop(
            Arc::clone(&self.probe),
            actor.clone(),
            epoch,
            self.config.probe_interval,
            probe_token.clone(),
        ));

        let reason = loop {
            let event = tokio::select! {
                _ = token.cancelled() => break None,
                event = events.recv() => event,
            };
            match event {
                Some(ConnectorEvent::Agent(event)) => {
                    if event.session_id() != actor.id {
                        actor
                            .send(SessionCommand::FrameDropped {
                                epoch,
                                error: format!(
                                    "{} event addressed to session {}",
                                    event.kind(),
                                    event.session_id()
                                ),
                            })
                            .await;
                        continue;
                    }
                    actor.send(SessionCommand::Ingest { epoch, event }).await;
                }
                Some(ConnectorEvent::Malformed { error }) => {
                    actor.send(SessionCommand::FrameDropped { epoch, error }).await;
                }
                Some(ConnectorEvent::Closed { reason }) => break Some(reason),
                None => break Some("transport closed".to_string()),
            }
        };

        probe_token.cancel();
        drop(outbound);
        drop(guard);
        reason
    }
}

/// Poll the liveness probe while the link is up, reporting changes only.
async fn probe_loop(
    probe: Arc<dyn LivenessProbe>,
    actor: SessionActorHandle,
    epoch: u64,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last: Option<bool> = None;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = probe.is_alive(&actor.id) => result,
        };
        let live = match result {
            Ok(live) => live,
            Err(err) => {
                debug!(
                    component = "supervisor",
                    event = "supervisor.probe_failed",
                    session_id = %actor.id,
                    error = %err,
                    "Liveness probe failed"
                );
                false
            }
        };

        if last != Some(live) {
            last = Some(live);
            actor.send(SessionCommand::SetLive { epoch, live }).await;
        }
    }
}
