//! Async driver that owns a [`SyncClient`] and feeds it time and I/O.
//!
//! One task runs [`SyncDriver::run`]; everything else talks to it through a
//! cloneable [`SyncHandle`]. The loop multiplexes transport events, the
//! reconnect timer, the heartbeat and periodic sync intervals, and handle
//! commands, so the client itself never sees concurrent calls.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

use crate::client::{SyncClient, SyncState};
use crate::connection::{ChannelEvent, Transport};
use crate::error::SyncError;
use crate::event::ChangeKind;
use crate::platform::Clock;
use crate::resolver::ConflictPolicy;
use crate::store::KeyValueStore;

/// Command sent from a [`SyncHandle`] to the driver.
#[derive(Debug)]
pub enum SyncCommand {
    Sync {
        entity: String,
        kind: ChangeKind,
        data: Value,
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    RequestSync {
        entity: Option<String>,
        reply: oneshot::Sender<Result<String, SyncError>>,
    },
    Connect,
    Disconnect,
    SetNetworkAvailable(bool),
    SetConflictPolicy(ConflictPolicy),
    SetAuthToken(Option<String>),
    ClearPending,
    State(oneshot::Sender<SyncState>),
    Shutdown,
}

/// Cloneable handle to a running [`SyncDriver`].
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<SyncCommand>,
}

impl SyncHandle {
    fn submit(&self, command: SyncCommand) -> Result<(), SyncError> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }

    /// Records a local change. Returns the event id.
    pub async fn sync(
        &self,
        entity: impl Into<String>,
        kind: ChangeKind,
        data: Value,
    ) -> Result<String, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.submit(SyncCommand::Sync {
            entity: entity.into(),
            kind,
            data,
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    pub async fn request_sync(&self, entity: Option<&str>) -> Result<String, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.submit(SyncCommand::RequestSync {
            entity: entity.map(str::to_string),
            reply,
        })?;
        rx.await.map_err(|_| SyncError::Stopped)?
    }

    pub fn connect(&self) -> Result<(), SyncError> {
        self.submit(SyncCommand::Connect)
    }

    pub fn disconnect(&self) -> Result<(), SyncError> {
        self.submit(SyncCommand::Disconnect)
    }

    pub fn set_network_available(&self, available: bool) -> Result<(), SyncError> {
        self.submit(SyncCommand::SetNetworkAvailable(available))
    }

    pub fn set_conflict_policy(&self, policy: ConflictPolicy) -> Result<(), SyncError> {
        self.submit(SyncCommand::SetConflictPolicy(policy))
    }

    pub fn set_auth_token(&self, token: Option<String>) -> Result<(), SyncError> {
        self.submit(SyncCommand::SetAuthToken(token))
    }

    pub fn clear_pending(&self) -> Result<(), SyncError> {
        self.submit(SyncCommand::ClearPending)
    }

    /// Snapshot of the client's state.
    pub async fn state(&self) -> Result<SyncState, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.submit(SyncCommand::State(reply))?;
        rx.await.map_err(|_| SyncError::Stopped)
    }

    /// Stops the driver; the client is destroyed on the way out.
    pub fn shutdown(&self) -> Result<(), SyncError> {
        self.submit(SyncCommand::Shutdown)
    }
}

/// Event loop around a [`SyncClient`].
pub struct SyncDriver<T: Transport, S: KeyValueStore, C: Clock> {
    client: SyncClient<T, S, C>,
    transport_events: mpsc::UnboundedReceiver<ChannelEvent>,
    commands: mpsc::UnboundedReceiver<SyncCommand>,
}

impl<T, S, C> SyncDriver<T, S, C>
where
    T: Transport,
    S: KeyValueStore + Clone,
    C: Clock + Clone,
{
    /// `transport_events` is the stream reported by the client's transport.
    pub fn new(
        client: SyncClient<T, S, C>,
        transport_events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                transport_events,
                commands: rx,
            },
            SyncHandle { commands: tx },
        )
    }

    /// Access to the client before the loop starts, e.g. to register
    /// listeners.
    pub fn client_mut(&mut self) -> &mut SyncClient<T, S, C> {
        &mut self.client
    }

    /// Initializes the client and runs until shutdown, until every handle
    /// is dropped, or until the transport stops reporting.
    pub async fn run(mut self) {
        self.client.init();

        let heartbeat_period = self.client.config().heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let sync_period = self.client.config().sync_interval;
        let mut periodic_sync = interval_at(Instant::now() + sync_period, sync_period);
        periodic_sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut reconnect_at: Option<Instant> = None;

        loop {
            if let Some(delay) = self.client.take_scheduled_reconnect() {
                reconnect_at = Some(Instant::now() + delay);
            }
            if !self.client.reconnect_pending() {
                reconnect_at = None;
            }
            let deadline = reconnect_at;
            let reconnect = async move {
                match deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                event = self.transport_events.recv() => match event {
                    Some(event) => self.client.handle_channel_event(event),
                    None => {
                        tracing::warn!("Transport stopped reporting, shutting down sync");
                        break;
                    }
                },
                _ = reconnect => {
                    reconnect_at = None;
                    self.client.fire_reconnect();
                }
                _ = heartbeat.tick() => {
                    self.client.heartbeat();
                }
                _ = periodic_sync.tick() => {
                    if self.client.is_connected() {
                        if let Err(e) = self.client.request_sync(None) {
                            tracing::debug!("Periodic sync skipped: {}", e);
                        }
                    }
                }
                command = self.commands.recv() => match command {
                    Some(SyncCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
            }
        }

        self.client.destroy();
        tracing::debug!("Sync driver stopped");
    }

    fn handle_command(&mut self, command: SyncCommand) {
        match command {
            SyncCommand::Sync {
                entity,
                kind,
                data,
                reply,
            } => {
                let _ = reply.send(self.client.sync(&entity, kind, data));
            }
            SyncCommand::RequestSync { entity, reply } => {
                let _ = reply.send(self.client.request_sync(entity.as_deref()));
            }
            SyncCommand::Connect => self.client.connect(),
            SyncCommand::Disconnect => self.client.disconnect(),
            SyncCommand::SetNetworkAvailable(available) => {
                self.client.set_network_available(available)
            }
            SyncCommand::SetConflictPolicy(policy) => self.client.set_conflict_policy(policy),
            SyncCommand::SetAuthToken(token) => self.client.set_auth_token(token),
            SyncCommand::ClearPending => self.client.clear_pending(),
            SyncCommand::State(reply) => {
                let _ = reply.send(self.client.sync_state());
            }
            SyncCommand::Shutdown => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconnectConfig, SyncConfig};
    use crate::connection::{ConnectionState, MockTransport, TransportEvent};
    use crate::platform::SystemClock;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn driver(
        config: SyncConfig,
    ) -> (
        SyncDriver<MockTransport, MemoryStore, SystemClock>,
        SyncHandle,
        MockTransport,
        mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let transport = MockTransport::new();
        let client = SyncClient::new(config, transport.clone(), MemoryStore::new(), SystemClock);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (driver, handle) = SyncDriver::new(client, events_rx);
        (driver, handle, transport, events_tx)
    }

    #[tokio::test]
    async fn test_driver_flushes_on_open() {
        let (driver, handle, transport, events) = driver(SyncConfig::default());
        let task = tokio::spawn(driver.run());

        let id = handle
            .sync("offering", ChangeKind::Update, json!({"id": "x"}))
            .await
            .unwrap();
        assert_eq!(transport.open_count(), 1);

        events.send(ChannelEvent::new(1, TransportEvent::Opened)).unwrap();
        let state = handle.state().await.unwrap();
        assert!(state.is_channel_open);
        assert_eq!(state.pending_changes.len(), 1);

        let sent = transport.sent_events();
        assert_eq!(sent[0].kind, ChangeKind::SyncRequest);
        assert_eq!(sent[1].id, id);

        handle.shutdown().unwrap();
        task.await.unwrap();
        assert!(handle.state().await.is_err());
    }

    #[tokio::test]
    async fn test_driver_fires_reconnect_timer() {
        let config = SyncConfig::default().with_reconnect(
            ReconnectConfig::new(3).with_base_delay(Duration::from_millis(10)),
        );
        let (driver, handle, transport, events) = driver(config);
        let task = tokio::spawn(driver.run());

        events
            .send(ChannelEvent::new(1, TransportEvent::Error("refused".to_string())))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(
            handle.state().await.unwrap().connection_state,
            ConnectionState::Connecting
        );

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_driver_drops_superseded_open() {
        let (driver, handle, transport, events) = driver(SyncConfig::default());
        let task = tokio::spawn(driver.run());

        handle.set_network_available(false).unwrap();
        handle.set_network_available(true).unwrap();
        assert_eq!(
            handle.state().await.unwrap().connection_state,
            ConnectionState::Connecting
        );
        assert_eq!(transport.open_count(), 2);

        events.send(ChannelEvent::new(1, TransportEvent::Opened)).unwrap();
        assert!(!handle.state().await.unwrap().is_channel_open);

        events.send(ChannelEvent::new(2, TransportEvent::Opened)).unwrap();
        assert!(handle.state().await.unwrap().is_channel_open);

        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_sync_requires_connection() {
        let (driver, handle, _transport, _events) = driver(SyncConfig::default());
        let task = tokio::spawn(driver.run());
        assert!(matches!(
            handle.request_sync(None).await,
            Err(SyncError::NotConnected)
        ));
        drop(handle);
        task.await.unwrap();
    }
}
