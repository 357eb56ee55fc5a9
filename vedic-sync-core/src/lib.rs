//! Vedic Sync Core Library
//!
//! Offline-aware real-time sync client: a reconnecting connection manager,
//! a persisted outbound queue and a conflict resolver, wired together by
//! [`SyncClient`] and driven by [`SyncDriver`].

pub mod cache;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod events;
pub mod platform;
pub mod queue;
pub mod reachability;
pub mod resolver;
pub mod runtime;
pub mod store;
pub mod ws;

pub use cache::{CacheMetrics, ContentCache, DEFAULT_TTL};
pub use client::{PersistedSyncState, SyncClient, SyncState};
pub use config::{Channel, ReconnectConfig, SyncConfig, DEFAULT_ENDPOINT, DEFAULT_NAMESPACE};
pub use connection::{
    ChannelEvent, ConnectionManager, ConnectionState, MockTransport, SendOutcome, Transport,
    TransportEvent,
};
pub use error::{SyncError, TransportError};
pub use event::{ChangeEvent, ChangeKind, LogicalKey, SCHEMA_VERSION};
pub use events::{
    ConflictResolved, ConnectionStatusChanged, DataChanged, ListenerId, NetworkChanged,
    SyncCompleted,
};
pub use platform::{Clock, ManualClock, NetworkStatus, StaticNetworkStatus, SystemClock};
pub use queue::OutboundQueue;
pub use reachability::{check_server, NetworkMonitor};
pub use resolver::{merge_payload, ConflictPolicy, ConflictResolver, Resolution};
pub use runtime::{SyncDriver, SyncHandle};
pub use store::{FileStore, KeyValueStore, MemoryStore, StorageError};
pub use ws::WsTransport;

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
