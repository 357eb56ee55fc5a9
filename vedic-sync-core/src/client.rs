//! The sync client: connection, outbound queue and conflict resolver wired
//! together behind one service object.
//!
//! `SyncClient` performs no I/O of its own and never blocks. Whoever owns it
//! (the async [`SyncDriver`](crate::runtime::SyncDriver), or a test) feeds it
//! transport events, timer expiries and network transitions. Listeners run
//! synchronously inside those calls, in the order the underlying events
//! happened.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::SyncConfig;
use crate::connection::{
    ChannelEvent, ConnectionManager, ConnectionNotice, ConnectionState, Transport, TransportEvent,
};
use crate::error::{SyncError, TransportError};
use crate::event::{generate_event_id, ChangeEvent, ChangeKind};
use crate::events::{
    ConflictResolved, ConnectionStatusChanged, DataChanged, EventHub, ListenerId, NetworkChanged,
    SyncCompleted,
};
use crate::platform::{Clock, NetworkStatus};
use crate::queue::{OutboundQueue, PENDING_CHANGES_KEY};
use crate::resolver::{ConflictPolicy, ConflictResolver, Resolution};
use crate::store::{KeyValueStore, StorageError};

/// Storage key suffix for [`PersistedSyncState`].
pub const SYNC_STATE_KEY: &str = "sync_state";
/// Storage key suffix for the client id.
pub const CLIENT_ID_KEY: &str = "client_id";
/// Entity used for handshake and full sync requests.
pub const METADATA_ENTITY: &str = "metadata";

/// Snapshot of the client's sync posture.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_network_available: bool,
    pub is_channel_open: bool,
    pub connection_state: ConnectionState,
    /// Timestamp of the last processed `sync_response`.
    pub last_synced_at: Option<i64>,
    pub pending_changes: Vec<ChangeEvent>,
    pub conflict_policy: ConflictPolicy,
}

/// What survives a restart besides the pending queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedSyncState {
    #[serde(rename = "lastSync", default)]
    pub last_sync: Option<i64>,
    #[serde(rename = "conflictPolicy", default)]
    pub conflict_policy: ConflictPolicy,
}

impl PersistedSyncState {
    /// Reads the state saved under `key`, if any.
    pub fn load<S: KeyValueStore>(store: &S, key: &str) -> Result<Option<Self>, StorageError> {
        let Some(raw) = store.get(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                key: key.to_string(),
                source,
            })
    }

    pub fn save<S: KeyValueStore>(&self, store: &S, key: &str) -> Result<(), StorageError> {
        let json = serde_json::to_string(self).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        store.set(key, &json)
    }
}

/// Offline-aware sync client.
pub struct SyncClient<T: Transport, S: KeyValueStore, C: Clock> {
    config: SyncConfig,
    connection: ConnectionManager<T, C>,
    queue: OutboundQueue<S>,
    store: S,
    clock: C,
    resolver: ConflictResolver,
    hub: EventHub,
    client_id: Option<String>,
    last_synced_at: Option<i64>,
    initialized: bool,
}

impl<T, S, C> SyncClient<T, S, C>
where
    T: Transport,
    S: KeyValueStore + Clone,
    C: Clock + Clone,
{
    pub fn new(config: SyncConfig, transport: T, store: S, clock: C) -> Self {
        let connection = ConnectionManager::new(
            transport,
            clock.clone(),
            config.channel_url(),
            config.reconnect.clone(),
        )
        .with_heartbeat_timeout(config.heartbeat_timeout);
        let queue = OutboundQueue::new(store.clone(), config.storage_key(PENDING_CHANGES_KEY));
        let resolver = ConflictResolver::new(config.conflict_policy);

        Self {
            config,
            connection,
            queue,
            store,
            clock,
            resolver,
            hub: EventHub::default(),
            client_id: None,
            last_synced_at: None,
            initialized: false,
        }
    }

    /// Seeds the initial online/offline state.
    pub fn with_network_status(mut self, status: &impl NetworkStatus) -> Self {
        self.connection.set_network_available(status.is_online());
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        self.connection.transport()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Restores persisted state and connects (or waits for the network).
    ///
    /// Calling it again is a no-op.
    pub fn init(&mut self) {
        if self.initialized {
            return;
        }

        match self.queue.hydrate() {
            Ok(0) => {}
            Ok(count) => tracing::info!("Recovered {} pending change(s)", count),
            Err(e) => self.report(e.into()),
        }

        let state_key = self.config.storage_key(SYNC_STATE_KEY);
        match PersistedSyncState::load(&self.store, &state_key) {
            Ok(Some(state)) => self.last_synced_at = state.last_sync,
            Ok(None) => {}
            Err(e) => self.report(e.into()),
        }

        self.client_id = Some(self.load_client_id());
        self.initialized = true;
        self.connection.connect();
        self.pump();
    }

    /// Closes the connection and drops every listener.
    pub fn destroy(&mut self) {
        self.connection.disconnect();
        self.pump();
        self.hub.clear();
        self.initialized = false;
    }

    pub fn connect(&mut self) {
        self.connection.connect();
        self.pump();
    }

    pub fn disconnect(&mut self) {
        self.connection.disconnect();
        self.pump();
    }

    /// Feeds an event reported by the transport for the current session.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        self.connection.handle_event(event);
        self.pump();
    }

    /// Feeds a session-tagged transport event. Events of superseded
    /// sessions are dropped.
    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        self.connection.handle_channel_event(event);
        self.pump();
    }

    /// Replaces the auth token. An open channel is reopened with it.
    pub fn set_auth_token(&mut self, token: Option<String>) {
        self.config.auth_token = token;
        self.connection.set_url(self.config.channel_url());
        self.pump();
    }

    /// Feeds an online/offline transition. Repeated values are ignored.
    pub fn set_network_available(&mut self, available: bool) {
        if self.connection.is_network_available() == available {
            return;
        }
        let timestamp = self.clock.now_millis();
        let notice = if available {
            tracing::info!("Network online");
            NetworkChanged::Online { timestamp }
        } else {
            tracing::info!("Network offline");
            NetworkChanged::Offline { timestamp }
        };
        self.hub.network.emit(&notice);
        self.connection.set_network_available(available);
        self.pump();
    }

    /// Sends a heartbeat if connected.
    pub fn heartbeat(&mut self) -> bool {
        let sent = self.connection.send_heartbeat();
        self.pump();
        sent
    }

    /// Runs the reconnect whose delay has elapsed.
    pub fn fire_reconnect(&mut self) {
        self.connection.fire_reconnect();
        self.pump();
    }

    /// Returns a newly scheduled reconnect delay, once.
    pub fn take_scheduled_reconnect(&mut self) -> Option<Duration> {
        self.connection.take_scheduled_reconnect()
    }

    pub fn reconnect_pending(&self) -> bool {
        self.connection.reconnect_pending()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Records a local change and sends it if connected.
    ///
    /// Returns the new event's id. Only `create`, `update` and `delete`
    /// are accepted.
    pub fn sync(&mut self, entity: &str, kind: ChangeKind, data: Value) -> Result<String, SyncError> {
        if !kind.is_data_change() {
            return Err(SyncError::MalformedEvent(format!(
                "'{}' is not a data change",
                kind
            )));
        }
        if entity.trim().is_empty() {
            return Err(SyncError::MalformedEvent("entity is empty".to_string()));
        }
        let event = ChangeEvent::new(kind, entity, data, self.clock.now_millis())
            .with_user(self.config.user_id.clone());
        let id = event.id.clone();
        self.enqueue(event);
        Ok(id)
    }

    /// Appends an event to the outbound queue and sends it if connected.
    ///
    /// The event stays queued until acknowledged.
    pub fn enqueue(&mut self, event: ChangeEvent) {
        if let Err(e) = self.queue.enqueue(event.clone()) {
            self.report(e.into());
        }
        if self.connection.is_connected() {
            self.connection.send(&event);
        }
        self.pump();
    }

    /// Sends every pending entry in insertion order.
    ///
    /// Stops at the first entry that cannot be handed to the transport.
    /// Returns the number sent.
    pub fn flush(&mut self) -> usize {
        let sent = self.flush_pending();
        self.pump();
        sent
    }

    /// Asks the server for changes since the last sync.
    ///
    /// With an entity only that entity is requested, otherwise the
    /// configured default list. Never queued.
    pub fn request_sync(&mut self, entity: Option<&str>) -> Result<String, SyncError> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        let entities: Vec<String> = match entity {
            Some(entity) => vec![entity.to_string()],
            None => self.config.sync_entities.clone(),
        };
        let event = ChangeEvent::new(
            ChangeKind::SyncRequest,
            entity.unwrap_or(METADATA_ENTITY),
            json!({
                "lastSync": self.last_synced_at,
                "entities": entities,
            }),
            self.clock.now_millis(),
        );
        let id = event.id.clone();
        let outcome = self.connection.send(&event);
        self.pump();
        if outcome.is_sent() {
            Ok(id)
        } else {
            Err(SyncError::NotConnected)
        }
    }

    pub fn conflict_policy(&self) -> ConflictPolicy {
        self.resolver.policy()
    }

    pub fn set_conflict_policy(&mut self, policy: ConflictPolicy) {
        self.resolver.set_policy(policy);
        self.save_sync_state();
    }

    /// Empties the outbound queue.
    pub fn clear_pending(&mut self) {
        if let Err(e) = self.queue.clear() {
            self.report(e.into());
        }
    }

    /// Replaces the outbound queue wholesale.
    pub fn replace_pending(&mut self, events: Vec<ChangeEvent>) {
        if let Err(e) = self.queue.replace_all(events) {
            self.report(e.into());
        }
    }

    pub fn pending_changes(&self) -> Vec<ChangeEvent> {
        self.queue.snapshot()
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn last_synced_at(&self) -> Option<i64> {
        self.last_synced_at
    }

    /// Persistent client id, available after `init`.
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn sync_state(&self) -> SyncState {
        SyncState {
            is_network_available: self.connection.is_network_available(),
            is_channel_open: self.connection.is_connected(),
            connection_state: self.connection.state(),
            last_synced_at: self.last_synced_at,
            pending_changes: self.queue.snapshot(),
            conflict_policy: self.resolver.policy(),
        }
    }

    pub fn on_connection_status(
        &mut self,
        listener: impl FnMut(&ConnectionStatusChanged) + Send + 'static,
    ) -> ListenerId {
        self.hub.connection.subscribe(listener)
    }

    pub fn on_network(&mut self, listener: impl FnMut(&NetworkChanged) + Send + 'static) -> ListenerId {
        self.hub.network.subscribe(listener)
    }

    pub fn on_sync_completed(
        &mut self,
        listener: impl FnMut(&SyncCompleted) + Send + 'static,
    ) -> ListenerId {
        self.hub.sync.subscribe(listener)
    }

    pub fn on_conflict_resolved(
        &mut self,
        listener: impl FnMut(&ConflictResolved) + Send + 'static,
    ) -> ListenerId {
        self.hub.conflict.subscribe(listener)
    }

    pub fn on_data_changed(&mut self, listener: impl FnMut(&DataChanged) + Send + 'static) -> ListenerId {
        self.hub.data.subscribe(listener)
    }

    pub fn on_error(&mut self, listener: impl FnMut(&SyncError) + Send + 'static) -> ListenerId {
        self.hub.error.subscribe(listener)
    }

    /// Removes a listener registered with any `on_*` method.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Drains connection notices until none are left. Handling one notice
    /// can queue more (a failed send during flush, for instance).
    fn pump(&mut self) {
        while let Some(notice) = self.connection.next_notice() {
            match notice {
                ConnectionNotice::StateChanged { state, error } => {
                    let status = ConnectionStatusChanged {
                        status: state,
                        is_connected: state == ConnectionState::Connected,
                        timestamp: self.clock.now_millis(),
                        error: error.clone(),
                    };
                    self.hub.connection.emit(&status);
                    if let Some(message) = error {
                        self.report(TransportError::new(message).into());
                    }
                }
                ConnectionNotice::Opened => {
                    self.send_handshake();
                    let sent = self.flush_pending();
                    if sent > 0 {
                        tracing::info!("Flushed {} pending change(s)", sent);
                    }
                }
                ConnectionNotice::Message(text) => self.handle_message(&text),
                ConnectionNotice::GaveUp { attempts } => {
                    self.report(SyncError::MaxRetriesExceeded { attempts });
                }
            }
        }
    }

    fn flush_pending(&mut self) -> usize {
        let mut sent = 0;
        for event in self.queue.snapshot() {
            if !self.connection.send(&event).is_sent() {
                break;
            }
            sent += 1;
        }
        sent
    }

    fn send_handshake(&mut self) {
        let event = ChangeEvent::new(
            ChangeKind::SyncRequest,
            METADATA_ENTITY,
            json!({
                "clientId": self.client_id,
                "lastSync": self.last_synced_at,
            }),
            self.clock.now_millis(),
        );
        self.connection.send(&event);
    }

    fn handle_message(&mut self, text: &str) {
        let event = match ChangeEvent::decode(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping undecodable message: {}", e);
                self.report(e);
                return;
            }
        };
        tracing::debug!("Received {} {} on '{}'", event.kind, event.id, event.entity);

        match event.kind {
            ChangeKind::SyncResponse => self.handle_sync_response(event),
            ChangeKind::SyncRequest => {
                tracing::debug!("Ignoring sync_request {} from server", event.id);
            }
            ChangeKind::Create | ChangeKind::Update | ChangeKind::Delete => {
                self.handle_remote_change(event)
            }
        }
    }

    fn handle_sync_response(&mut self, event: ChangeEvent) {
        self.last_synced_at = Some(event.occurred_at);

        let acknowledged: Vec<String> = event
            .payload
            .get("acknowledged")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| id.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if !acknowledged.is_empty() {
            match self.queue.remove_all(&acknowledged) {
                Ok(removed) => tracing::debug!("{} pending change(s) acknowledged", removed),
                Err(e) => self.report(e.into()),
            }
        }

        self.save_sync_state();
        self.hub.sync.emit(&SyncCompleted {
            last_sync: event.occurred_at,
            server_data: event.payload,
        });
    }

    fn handle_remote_change(&mut self, remote: ChangeEvent) {
        // The server echoing one of our own events acknowledges it.
        if self.queue.contains(&remote.id) {
            tracing::debug!("Change {} acknowledged by echo", remote.id);
            if let Err(e) = self.queue.remove(&remote.id) {
                self.report(e.into());
            }
            return;
        }

        let key = match remote.logical_key() {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("Dropping malformed {} event {}: {}", remote.kind, remote.id, e);
                self.report(e);
                return;
            }
        };

        let Some(local) = self.queue.latest_for(&key).cloned() else {
            self.apply(&remote);
            return;
        };

        let outcome = match self.resolver.resolve(&local, &remote, self.clock.now_millis()) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.report(e);
                return;
            }
        };
        tracing::info!(
            "Conflict on {} resolved with {}",
            key,
            self.resolver.policy()
        );

        let persisted = match outcome.resolution {
            Resolution::ApplyRemote => self.queue.remove_matching(&key).map(|_| ()),
            Resolution::Merged => self
                .queue
                .replace_payload(
                    &local.id,
                    outcome.resolved.payload.clone(),
                    outcome.resolved.merged_at,
                )
                .map(|_| ()),
            Resolution::KeepLocal => {
                let pending: Vec<ChangeEvent> = self
                    .queue
                    .iter()
                    .filter(|e| e.matches_key(&key))
                    .cloned()
                    .collect();
                for event in &pending {
                    if !self.connection.send(event).is_sent() {
                        break;
                    }
                }
                Ok(())
            }
        };
        if let Err(e) = persisted {
            self.report(e.into());
        }

        if outcome.applies() {
            self.apply(&outcome.resolved);
        }
        self.hub.conflict.emit(&ConflictResolved {
            local_event: local,
            server_event: remote,
            resolved_event: outcome.resolved,
        });
    }

    fn apply(&mut self, event: &ChangeEvent) {
        self.hub.data.emit(&DataChanged::from_event(event));
    }

    fn load_client_id(&mut self) -> String {
        let key = self.config.storage_key(CLIENT_ID_KEY);
        match self.store.get(&key) {
            Ok(Some(raw)) => {
                if let Ok(id) = serde_json::from_str::<String>(&raw) {
                    return id;
                }
                tracing::warn!("Stored client id is unreadable, generating a new one");
            }
            Ok(None) => {}
            Err(e) => self.report(e.into()),
        }

        let id = generate_event_id();
        let stored = serde_json::to_string(&id).map_err(|source| StorageError::Encode {
            key: key.clone(),
            source,
        });
        if let Err(e) = stored.and_then(|json| self.store.set(&key, &json)) {
            self.report(e.into());
        }
        id
    }

    fn save_sync_state(&mut self) {
        let state = PersistedSyncState {
            last_sync: self.last_synced_at,
            conflict_policy: self.resolver.policy(),
        };
        let key = self.config.storage_key(SYNC_STATE_KEY);
        if let Err(e) = state.save(&self.store, &key) {
            self.report(e.into());
        }
    }

    fn report(&mut self, error: SyncError) {
        match &error {
            SyncError::Persistence(e) => {
                tracing::warn!("Persistence failed, pending changes may not survive a restart: {}", e)
            }
            SyncError::MaxRetriesExceeded { .. } => tracing::error!("{}", error),
            _ => tracing::warn!("{}", error),
        }
        self.hub.error.emit(&error);
    }
}
