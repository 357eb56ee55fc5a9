//! Typed notifications emitted by the sync client.
//!
//! Each category has its own listener registry. Registering returns a
//! [`ListenerId`] that unsubscribes the listener again.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::connection::ConnectionState;
use crate::error::SyncError;
use crate::event::{ChangeEvent, ChangeKind};

/// Handle returned by a listener registration. Ids are unique process-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

type Listener<E> = Box<dyn FnMut(&E) + Send>;

/// Registry of listeners for one notification type.
pub struct Observers<E> {
    listeners: Vec<(ListenerId, Listener<E>)>,
}

impl<E> Observers<E> {
    pub fn new() -> Self {
        Self {
            listeners: Vec::new(),
        }
    }

    /// Adds a listener; listeners run in registration order.
    pub fn subscribe(&mut self, listener: impl FnMut(&E) + Send + 'static) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Removes a listener. Returns false if it was not registered here.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Calls every listener. A listener that panics is logged and skipped;
    /// the others still run.
    pub fn emit(&mut self, event: &E) {
        for (id, listener) in &mut self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!("Listener {:?} panicked", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub fn clear(&mut self) {
        self.listeners.clear();
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// Emitted on every connection state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatusChanged {
    pub status: ConnectionState,
    pub is_connected: bool,
    pub timestamp: i64,
    /// Set when `status` is `Error`.
    pub error: Option<String>,
}

/// Emitted when the browser-equivalent online/offline signal changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkChanged {
    Online { timestamp: i64 },
    Offline { timestamp: i64 },
}

/// Emitted after a `sync_response` has been processed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncCompleted {
    pub last_sync: i64,
    pub server_data: Value,
}

/// Emitted after a remote change collided with a pending local change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictResolved {
    pub local_event: ChangeEvent,
    pub server_event: ChangeEvent,
    pub resolved_event: ChangeEvent,
}

/// Emitted when a change is applied to local state.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChanged {
    pub kind: ChangeKind,
    pub entity: String,
    pub data: Value,
    pub timestamp: i64,
}

impl DataChanged {
    pub fn from_event(event: &ChangeEvent) -> Self {
        Self {
            kind: event.kind,
            entity: event.entity.clone(),
            data: event.payload.clone(),
            timestamp: event.occurred_at,
        }
    }
}

/// All listener registries owned by a client.
#[derive(Debug, Default)]
pub struct EventHub {
    pub connection: Observers<ConnectionStatusChanged>,
    pub network: Observers<NetworkChanged>,
    pub sync: Observers<SyncCompleted>,
    pub conflict: Observers<ConflictResolved>,
    pub data: Observers<DataChanged>,
    pub error: Observers<SyncError>,
}

impl EventHub {
    /// Removes the listener from whichever registry holds it.
    pub fn unsubscribe(&mut self, id: ListenerId) -> bool {
        self.connection.unsubscribe(id)
            || self.network.unsubscribe(id)
            || self.sync.unsubscribe(id)
            || self.conflict.unsubscribe(id)
            || self.data.unsubscribe(id)
            || self.error.unsubscribe(id)
    }

    pub fn clear(&mut self) {
        self.connection.clear();
        self.network.clear();
        self.sync.clear();
        self.conflict.clear();
        self.data.clear();
        self.error.clear();
    }
}
