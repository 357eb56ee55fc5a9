//! Connection manager: one logical real-time channel with reconnect.
//!
//! The manager is driven entirely by calls: it never sleeps or spawns.
//! Transport completions arrive through [`ConnectionManager::handle_event`],
//! a scheduled reconnect is announced through
//! [`ConnectionManager::take_scheduled_reconnect`] and the owner calls
//! [`ConnectionManager::fire_reconnect`] once the delay has elapsed.
//! Everything observable is queued as a [`ConnectionNotice`] and drained by
//! the owner in order.
//!
//! Every `open` starts a new session. Transports tag what they report with
//! the session it belongs to, so completions of a superseded handshake or
//! frames from a replaced socket never touch the current channel.
//!
//! ```text
//! disconnected -> connecting -> connected -> reconnecting -> connecting ...
//!                      |             |
//!                      +--> error <--+--> reconnecting | disconnected (gave up)
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::config::ReconnectConfig;
use crate::error::TransportError;
use crate::event::ChangeEvent;
use crate::platform::Clock;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Event reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The channel requested by `open` is established.
    Opened,
    /// A text message arrived.
    Message(String),
    /// The peer answered a heartbeat.
    HeartbeatAck,
    /// The channel closed. `clean` is true for a normal (1000) close.
    Closed { clean: bool, reason: String },
    /// The channel failed; no `Closed` follows.
    Error(String),
}

/// A [`TransportEvent`] tagged with the session of the `open` it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub session: u64,
    pub event: TransportEvent,
}

impl ChannelEvent {
    pub fn new(session: u64, event: TransportEvent) -> Self {
        Self { session, event }
    }
}

/// Network channel used by the manager.
///
/// `open` only starts the handshake for `session`; its outcome is reported
/// later as `TransportEvent::Opened` or `TransportEvent::Error` tagged with
/// that session. Opening replaces any previous channel.
pub trait Transport {
    fn open(&mut self, url: &str, session: u64) -> Result<(), TransportError>;
    /// Hands a text message to the channel.
    fn send_text(&mut self, text: String) -> Result<(), TransportError>;
    fn send_heartbeat(&mut self) -> Result<(), TransportError>;
    /// Closes the channel deliberately. No event is reported for it.
    fn close(&mut self);
}

/// Something the owner of the manager must react to, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotice {
    StateChanged {
        state: ConnectionState,
        error: Option<String>,
    },
    /// The channel just opened.
    Opened,
    /// A message arrived while connected.
    Message(String),
    /// Reconnect attempts are exhausted.
    GaveUp { attempts: u32 },
}

/// Result of [`ConnectionManager::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport.
    Sent,
    NotConnected,
    /// The transport refused the write; the connection has been failed.
    Failed(TransportError),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent)
    }
}

/// Owns the single logical connection.
pub struct ConnectionManager<T: Transport, C: Clock> {
    transport: T,
    clock: C,
    url: String,
    reconnect: ReconnectConfig,
    heartbeat_timeout: Option<Duration>,
    state: ConnectionState,
    attempt: u32,
    network_available: bool,
    /// Set by `connect`, cleared by `disconnect`.
    wants_connection: bool,
    gave_up: bool,
    reconnect_pending: bool,
    scheduled: Option<Duration>,
    /// Session of the most recent `open`.
    session: u64,
    last_inbound_at: i64,
    notices: VecDeque<ConnectionNotice>,
}

impl<T: Transport, C: Clock> ConnectionManager<T, C> {
    pub fn new(transport: T, clock: C, url: String, reconnect: ReconnectConfig) -> Self {
        Self {
            transport,
            clock,
            url,
            reconnect,
            heartbeat_timeout: None,
            state: ConnectionState::Disconnected,
            attempt: 0,
            network_available: true,
            wants_connection: false,
            gave_up: false,
            reconnect_pending: false,
            scheduled: None,
            session: 0,
            last_inbound_at: 0,
            notices: VecDeque::new(),
        }
    }

    /// Fails the connection when a heartbeat is due and nothing has been
    /// received for longer than `timeout`.
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_network_available(&self) -> bool {
        self.network_available
    }

    pub fn has_given_up(&self) -> bool {
        self.gave_up
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Changes the channel URL. An open channel is reopened on the new URL.
    pub fn set_url(&mut self, url: String) {
        if url == self.url {
            return;
        }
        self.url = url;
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::info!("Channel URL changed, reopening");
            self.transport.close();
            self.set_state(ConnectionState::Disconnected, None);
            self.open_channel();
        }
    }

    /// Session of the most recent open request; 0 before the first one.
    pub fn session(&self) -> u64 {
        self.session
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// True while a reconnect timer is outstanding.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Returns a newly scheduled reconnect delay, once.
    pub fn take_scheduled_reconnect(&mut self) -> Option<Duration> {
        self.scheduled.take()
    }

    pub fn next_notice(&mut self) -> Option<ConnectionNotice> {
        self.notices.pop_front()
    }

    /// Opens the channel. No-op while connected or connecting.
    ///
    /// Returns true if an open was requested from the transport. After the
    /// manager has given up, calling this resets the attempt counter.
    pub fn connect(&mut self) -> bool {
        self.wants_connection = true;
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            return false;
        }
        if self.gave_up {
            self.gave_up = false;
            self.attempt = 0;
        }
        if !self.network_available {
            tracing::debug!("Network unavailable, connect deferred until online");
            return false;
        }
        self.cancel_reconnect();
        self.open_channel()
    }

    /// Closes the channel deliberately and resets retry state.
    pub fn disconnect(&mut self) {
        self.wants_connection = false;
        self.cancel_reconnect();
        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            self.transport.close();
        }
        self.attempt = 0;
        self.gave_up = false;
        self.set_state(ConnectionState::Disconnected, None);
    }

    /// Transmits an event if connected.
    pub fn send(&mut self, event: &ChangeEvent) -> SendOutcome {
        if !self.is_connected() {
            return SendOutcome::NotConnected;
        }
        let text = match event.encode() {
            Ok(text) => text,
            Err(e) => return SendOutcome::Failed(TransportError::new(e.to_string())),
        };
        match self.transport.send_text(text) {
            Ok(()) => {
                tracing::debug!("Sent {} {} on '{}'", event.kind, event.id, event.entity);
                SendOutcome::Sent
            }
            Err(e) => {
                self.fail(e.clone());
                SendOutcome::Failed(e)
            }
        }
    }

    /// Sends a heartbeat if connected. Returns true if one was sent.
    pub fn send_heartbeat(&mut self) -> bool {
        if !self.is_connected() {
            return false;
        }
        if let Some(timeout) = self.heartbeat_timeout {
            let silent_for = self.clock.now_millis() - self.last_inbound_at;
            if silent_for > timeout.as_millis() as i64 {
                self.fail(TransportError::new(format!(
                    "no traffic for {} ms",
                    silent_for
                )));
                return false;
            }
        }
        match self.transport.send_heartbeat() {
            Ok(()) => true,
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    /// Applies a tagged transport event, dropping it if it belongs to a
    /// superseded session.
    pub fn handle_channel_event(&mut self, channel_event: ChannelEvent) {
        let ChannelEvent { session, event } = channel_event;
        if session != self.session {
            tracing::debug!(
                "Ignoring {:?} from superseded session {} (current {})",
                event,
                session,
                self.session
            );
            return;
        }
        self.handle_event(event);
    }

    /// Applies a transport event for the current session.
    pub fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    // Opened after a disconnect or going offline; not wanted.
                    tracing::debug!("Ignoring open in state {}", self.state);
                    self.transport.close();
                    return;
                }
                tracing::info!("Connected to {}", self.url);
                self.attempt = 0;
                self.last_inbound_at = self.clock.now_millis();
                self.set_state(ConnectionState::Connected, None);
                self.notices.push_back(ConnectionNotice::Opened);
            }
            TransportEvent::Message(text) => {
                if self.is_connected() {
                    self.last_inbound_at = self.clock.now_millis();
                    self.notices.push_back(ConnectionNotice::Message(text));
                }
            }
            TransportEvent::HeartbeatAck => {
                self.last_inbound_at = self.clock.now_millis();
            }
            TransportEvent::Closed { clean, reason } => {
                if !matches!(
                    self.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    return;
                }
                if clean {
                    tracing::info!("Connection closed by server: {}", reason);
                    self.set_state(ConnectionState::Disconnected, None);
                } else {
                    tracing::warn!("Connection lost: {}", reason);
                    self.schedule_reconnect();
                }
            }
            TransportEvent::Error(message) => {
                if matches!(
                    self.state,
                    ConnectionState::Connected | ConnectionState::Connecting
                ) {
                    self.fail(TransportError::new(message));
                }
            }
        }
    }

    /// Runs a reconnect whose delay has elapsed.
    pub fn fire_reconnect(&mut self) {
        if !self.reconnect_pending {
            return;
        }
        self.reconnect_pending = false;
        if self.network_available {
            self.open_channel();
        }
    }

    /// Mirrors the platform's online/offline signal.
    ///
    /// Going offline suspends reconnects and closes the channel. Coming
    /// back online opens the channel once if a connection is wanted.
    /// Returns true if an open was requested.
    pub fn set_network_available(&mut self, available: bool) -> bool {
        if self.network_available == available {
            return false;
        }
        self.network_available = available;

        if !available {
            self.cancel_reconnect();
            if matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                self.transport.close();
            }
            self.set_state(ConnectionState::Disconnected, None);
            return false;
        }

        if self.wants_connection
            && !matches!(
                self.state,
                ConnectionState::Connected | ConnectionState::Connecting
            )
        {
            self.gave_up = false;
            return self.open_channel();
        }
        false
    }

    fn open_channel(&mut self) -> bool {
        self.session += 1;
        self.set_state(ConnectionState::Connecting, None);
        match self.transport.open(&self.url, self.session) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Failed to open {}: {}", self.url, e);
                self.fail(e);
                true
            }
        }
    }

    /// error -> reconnecting | disconnected
    fn fail(&mut self, error: TransportError) {
        if self.state == ConnectionState::Connected {
            self.transport.close();
        }
        self.set_state(ConnectionState::Error, Some(error.0));
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if !self.network_available {
            self.set_state(ConnectionState::Disconnected, None);
            return;
        }
        if self.attempt >= self.reconnect.max_attempts {
            tracing::error!(
                "Max reconnection attempts reached ({})",
                self.reconnect.max_attempts
            );
            self.gave_up = true;
            self.set_state(ConnectionState::Disconnected, None);
            self.notices.push_back(ConnectionNotice::GaveUp {
                attempts: self.attempt,
            });
            return;
        }

        self.attempt += 1;
        let delay = self.reconnect.delay_for_attempt(self.attempt);
        tracing::info!(
            "Reconnecting {}/{} in {} ms",
            self.attempt,
            self.reconnect.max_attempts,
            delay.as_millis()
        );
        self.reconnect_pending = true;
        self.scheduled = Some(delay);
        self.set_state(ConnectionState::Reconnecting, None);
    }

    fn cancel_reconnect(&mut self) {
        self.reconnect_pending = false;
        self.scheduled = None;
    }

    fn set_state(&mut self, state: ConnectionState, error: Option<String>) {
        if self.state == state && state != ConnectionState::Error {
            return;
        }
        self.state = state;
        self.notices
            .push_back(ConnectionNotice::StateChanged { state, error });
    }
}

/// What a [`MockTransport`] has been asked to do.
#[derive(Debug, Default)]
pub struct MockTransportLog {
    pub opened: Vec<String>,
    pub sent: Vec<String>,
    pub heartbeats: usize,
    pub closes: usize,
    pub fail_open: bool,
    pub fail_send: bool,
}

/// A transport for tests. Clones share the same log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    log: Arc<Mutex<MockTransportLog>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the shared log.
    pub fn log(&self) -> std::sync::MutexGuard<'_, MockTransportLog> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sent messages decoded as events; messages that do not decode are skipped.
    pub fn sent_events(&self) -> Vec<ChangeEvent> {
        self.log()
            .sent
            .iter()
            .filter_map(|text| ChangeEvent::decode(text).ok())
            .collect()
    }

    pub fn open_count(&self) -> usize {
        self.log().opened.len()
    }
}

impl Transport for MockTransport {
    fn open(&mut self, url: &str, _session: u64) -> Result<(), TransportError> {
        let mut log = self.log();
        log.opened.push(url.to_string());
        if log.fail_open {
            return Err(TransportError::new("mock open failure"));
        }
        Ok(())
    }

    fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        let mut log = self.log();
        if log.fail_send {
            return Err(TransportError::new("mock send failure"));
        }
        log.sent.push(text);
        Ok(())
    }

    fn send_heartbeat(&mut self) -> Result<(), TransportError> {
        self.log().heartbeats += 1;
        Ok(())
    }

    fn close(&mut self) {
        self.log().closes += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ChangeKind;
    use crate::platform::ManualClock;
    use serde_json::json;

    fn manager() -> (ConnectionManager<MockTransport, ManualClock>, MockTransport) {
        let transport = MockTransport::new();
        let probe = transport.clone();
        let manager = ConnectionManager::new(
            transport,
            ManualClock::new(0),
            "wss://test/general".to_string(),
            ReconnectConfig::new(5),
        );
        (manager, probe)
    }

    fn drain(manager: &mut ConnectionManager<MockTransport, ManualClock>) -> Vec<ConnectionNotice> {
        std::iter::from_fn(|| manager.next_notice()).collect()
    }

    fn states(notices: &[ConnectionNotice]) -> Vec<ConnectionState> {
        notices
            .iter()
            .filter_map(|n| match n {
                ConnectionNotice::StateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_is_idempotent() {
        let (mut manager, probe) = manager();
        assert!(manager.connect());
        assert!(!manager.connect());
        assert_eq!(probe.open_count(), 1);

        manager.handle_event(TransportEvent::Opened);
        assert!(!manager.connect());
        assert_eq!(probe.open_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_open_reports_transitions() {
        let (mut manager, _probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        let notices = drain(&mut manager);
        assert_eq!(
            states(&notices),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(notices.last(), Some(&ConnectionNotice::Opened));
    }

    #[test]
    fn test_backoff_sequence_for_consecutive_failures() {
        let transport = MockTransport::new();
        let mut manager = ConnectionManager::new(
            transport,
            ManualClock::new(0),
            "wss://test/general".to_string(),
            ReconnectConfig::new(8)
                .with_base_delay(Duration::from_millis(1000))
                .with_max_delay(Duration::from_millis(30_000)),
        );

        manager.connect();
        let mut delays = Vec::new();
        for _ in 0..8 {
            manager.handle_event(TransportEvent::Error("refused".to_string()));
            delays.push(manager.take_scheduled_reconnect().unwrap().as_millis());
            manager.fire_reconnect();
        }
        assert_eq!(
            delays,
            vec![1000, 2000, 4000, 8000, 16_000, 30_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_error_passes_through_error_state() {
        let (mut manager, _probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        drain(&mut manager);

        manager.handle_event(TransportEvent::Error("reset".to_string()));
        let notices = drain(&mut manager);
        assert_eq!(
            notices[0],
            ConnectionNotice::StateChanged {
                state: ConnectionState::Error,
                error: Some("reset".to_string())
            }
        );
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert!(manager.reconnect_pending());
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let (mut manager, probe) = manager();
        manager.connect();
        for _ in 0..5 {
            manager.handle_event(TransportEvent::Error("refused".to_string()));
            manager.fire_reconnect();
        }
        drain(&mut manager);
        assert_eq!(probe.open_count(), 6);

        manager.handle_event(TransportEvent::Error("refused".to_string()));
        let notices = drain(&mut manager);
        assert!(notices.contains(&ConnectionNotice::GaveUp { attempts: 5 }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(manager.has_given_up());
        assert!(!manager.reconnect_pending());

        // Manual connect resets the counter.
        assert!(manager.connect());
        assert_eq!(manager.attempt(), 0);
        assert_eq!(probe.open_count(), 7);
    }

    #[test]
    fn test_open_failure_schedules_reconnect() {
        let (mut manager, probe) = manager();
        probe.log().fail_open = true;
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(
            manager.take_scheduled_reconnect(),
            Some(Duration::from_millis(1000))
        );
    }

    #[test]
    fn test_offline_suspends_reconnect() {
        let (mut manager, probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);

        manager.set_network_available(false);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // Errors while offline never schedule anything.
        manager.handle_event(TransportEvent::Error("late".to_string()));
        manager.fire_reconnect();
        assert!(!manager.reconnect_pending());
        assert_eq!(manager.take_scheduled_reconnect(), None);
        assert_eq!(probe.open_count(), 1);

        assert!(manager.set_network_available(true));
        assert!(!manager.set_network_available(true));
        assert_eq!(probe.open_count(), 2);
        assert_eq!(manager.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_offline_cancels_pending_timer() {
        let (mut manager, probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Error("refused".to_string()));
        assert!(manager.reconnect_pending());

        manager.set_network_available(false);
        assert!(!manager.reconnect_pending());
        manager.fire_reconnect();
        assert_eq!(probe.open_count(), 1);

        manager.set_network_available(true);
        assert_eq!(probe.open_count(), 2);
    }

    #[test]
    fn test_connect_while_offline_waits_for_online() {
        let (mut manager, probe) = manager();
        manager.set_network_available(false);
        assert!(!manager.connect());
        assert_eq!(probe.open_count(), 0);
        assert!(manager.set_network_available(true));
        assert_eq!(probe.open_count(), 1);
    }

    #[test]
    fn test_disconnect_cancels_reconnect_and_resets() {
        let (mut manager, probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Error("refused".to_string()));
        assert_eq!(manager.attempt(), 1);

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(manager.attempt(), 0);
        assert!(!manager.reconnect_pending());
        manager.fire_reconnect();
        assert_eq!(probe.open_count(), 1);

        // Coming online does not reconnect a deliberately closed channel.
        manager.set_network_available(false);
        manager.set_network_available(true);
        assert_eq!(probe.open_count(), 1);
    }

    #[test]
    fn test_clean_close_does_not_reconnect() {
        let (mut manager, _probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        manager.handle_event(TransportEvent::Closed {
            clean: true,
            reason: "bye".to_string(),
        });
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.reconnect_pending());
    }

    #[test]
    fn test_unexpected_close_reconnects() {
        let (mut manager, _probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        manager.handle_event(TransportEvent::Closed {
            clean: false,
            reason: "abnormal".to_string(),
        });
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        assert_eq!(manager.attempt(), 1);
    }

    #[test]
    fn test_send_requires_connection() {
        let (mut manager, probe) = manager();
        let event = ChangeEvent::new(ChangeKind::Update, "offering", json!({"id": "x"}), 0);
        assert_eq!(manager.send(&event), SendOutcome::NotConnected);

        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        assert!(manager.send(&event).is_sent());
        assert_eq!(probe.sent_events(), vec![event]);
    }

    #[test]
    fn test_send_failure_fails_connection() {
        let (mut manager, probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        probe.log().fail_send = true;

        let event = ChangeEvent::new(ChangeKind::Create, "offering", json!({"id": "x"}), 0);
        assert!(matches!(manager.send(&event), SendOutcome::Failed(_)));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }

    #[test]
    fn test_opened_after_disconnect_is_closed() {
        let (mut manager, probe) = manager();
        manager.connect();
        manager.disconnect();
        let closes = probe.log().closes;
        manager.handle_event(TransportEvent::Opened);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert_eq!(probe.log().closes, closes + 1);
    }

    #[test]
    fn test_superseded_handshake_is_ignored() {
        let (mut manager, probe) = manager();
        manager.connect();
        let first = manager.session();

        // Network flaps while the first handshake is still running.
        manager.set_network_available(false);
        manager.set_network_available(true);
        let second = manager.session();
        assert_ne!(first, second);
        assert_eq!(probe.open_count(), 2);
        let closes = probe.log().closes;

        manager.handle_channel_event(ChannelEvent::new(first, TransportEvent::Opened));
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(probe.log().closes, closes);

        manager.handle_channel_event(ChannelEvent::new(second, TransportEvent::Opened));
        assert_eq!(manager.state(), ConnectionState::Connected);

        // The replaced socket going away does not affect the new one.
        manager.handle_channel_event(ChannelEvent::new(
            first,
            TransportEvent::Closed {
                clean: false,
                reason: "replaced".to_string(),
            },
        ));
        manager.handle_channel_event(ChannelEvent::new(
            first,
            TransportEvent::Message("{}".to_string()),
        ));
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(!manager.reconnect_pending());
        assert!(!drain(&mut manager)
            .iter()
            .any(|n| matches!(n, ConnectionNotice::Message(_))));
        assert_eq!(probe.log().closes, closes);
    }

    #[test]
    fn test_error_from_current_session_reconnects() {
        let (mut manager, _probe) = manager();
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        let session = manager.session();

        manager.handle_channel_event(ChannelEvent::new(
            session,
            TransportEvent::Error("channel is not open".to_string()),
        ));
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
        manager.fire_reconnect();
        assert_eq!(manager.session(), session + 1);
    }

    #[test]
    fn test_set_url_reopens_open_channel() {
        let (mut manager, probe) = manager();
        manager.set_url("wss://test/general".to_string());
        assert_eq!(probe.open_count(), 0);

        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        manager.set_url("wss://test/general?auth=new".to_string());
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert_eq!(
            probe.log().opened.last().map(String::as_str),
            Some("wss://test/general?auth=new")
        );
        assert_eq!(probe.log().closes, 1);
    }

    #[test]
    fn test_heartbeat_only_when_connected() {
        let (mut manager, probe) = manager();
        assert!(!manager.send_heartbeat());
        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        assert!(manager.send_heartbeat());
        assert_eq!(probe.log().heartbeats, 1);
    }

    #[test]
    fn test_heartbeat_timeout_forces_reconnect() {
        let transport = MockTransport::new();
        let clock = ManualClock::new(0);
        let mut manager = ConnectionManager::new(
            transport,
            clock.clone(),
            "wss://test/general".to_string(),
            ReconnectConfig::default(),
        )
        .with_heartbeat_timeout(Some(Duration::from_secs(60)));

        manager.connect();
        manager.handle_event(TransportEvent::Opened);
        clock.advance(Duration::from_secs(30));
        assert!(manager.send_heartbeat());
        manager.handle_event(TransportEvent::HeartbeatAck);

        clock.advance(Duration::from_secs(61));
        assert!(!manager.send_heartbeat());
        assert_eq!(manager.state(), ConnectionState::Reconnecting);
    }
}
