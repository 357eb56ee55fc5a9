//! Sync CLI commands: run the live channel and report status.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Args, Subcommand};

use vedic_sync_core::client::SYNC_STATE_KEY;
use vedic_sync_core::queue::PENDING_CHANGES_KEY;
use vedic_sync_core::{
    check_server, ContentCache, NetworkMonitor, OutboundQueue, PersistedSyncState, StorageError,
    SyncClient, SyncDriver, SyncError, SyncHandle, SystemClock, WsTransport,
};

use crate::config::Config;

/// How often the server is probed for reachability while syncing.
const PROBE_INTERVAL: Duration = Duration::from_secs(30);
/// How often `--once` checks whether the queue has drained.
const SETTLE_POLL: Duration = Duration::from_millis(200);

/// Sync with remote server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    command: Option<SyncSubcommand>,

    /// Exit once the queue is flushed and acknowledged instead of staying connected
    #[arg(long)]
    once: bool,

    /// Seconds to wait for `--once` before giving up
    #[arg(long, default_value_t = 30)]
    timeout: u64,
}

#[derive(Debug, Subcommand)]
enum SyncSubcommand {
    /// Show sync configuration, local state and server status
    Status,
}

impl SyncCommand {
    pub async fn run(&self, config: &Config) -> Result<(), SyncCommandError> {
        match &self.command {
            None => self.sync(config).await,
            Some(SyncSubcommand::Status) => self.status(config).await,
        }
    }

    async fn sync(&self, config: &Config) -> Result<(), SyncCommandError> {
        let sync_config = config.sync_config();
        println!("Connecting to {} ...", sync_config.endpoint);

        let (transport, transport_events) = WsTransport::new();
        let mut client = SyncClient::new(sync_config, transport, config.store(), SystemClock);
        let cache = Arc::new(Mutex::new(ContentCache::new(SystemClock)));
        register_listeners(&mut client, cache.clone());

        let (driver, handle) = SyncDriver::new(client, transport_events);
        let task = tokio::spawn(driver.run());
        let monitor = NetworkMonitor::new(config.server_url.value.clone(), PROBE_INTERVAL)
            .spawn(handle.clone());

        let outcome = if self.once {
            let limit = Duration::from_secs(self.timeout);
            match tokio::time::timeout(limit, wait_until_settled(&handle)).await {
                Ok(result) => result,
                Err(_) => Err(SyncCommandError::Timeout(self.timeout)),
            }
        } else {
            println!("Listening for changes. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c().await.map_err(SyncCommandError::Signal)
        };

        monitor.abort();
        // The driver may already be gone; shutting down twice is harmless.
        let _ = handle.shutdown();
        if let Err(e) = task.await {
            tracing::warn!("Sync driver ended abnormally: {}", e);
        }

        if let Ok(cache) = cache.lock() {
            let cached: usize = cache.stats().values().sum();
            if cached > 0 {
                println!("{} record(s) received from the server", cached);
            }
        }

        outcome?;
        println!("Sync complete.");
        Ok(())
    }

    async fn status(&self, config: &Config) -> Result<(), SyncCommandError> {
        let sync_config = config.sync_config();
        let store = config.store();

        println!("Sync Configuration");
        println!("==================");
        println!();
        println!("Server:    {}", sync_config.endpoint);
        println!("Channel:   {}", sync_config.channel.purpose());
        println!("Policy:    {}", sync_config.conflict_policy);
        println!("Data dir:  {}", store.data_dir().display());
        println!();

        let mut queue = OutboundQueue::new(store.clone(), sync_config.storage_key(PENDING_CHANGES_KEY));
        let pending = queue.hydrate()?;
        println!("Pending changes: {}", pending);

        let saved = PersistedSyncState::load(&store, &sync_config.storage_key(SYNC_STATE_KEY))?;
        match saved.and_then(|s| s.last_sync) {
            Some(at) => println!("Last sync:       {}", format_millis(at)),
            None => println!("Last sync:       never"),
        }
        println!();

        print!("Server status: ");
        if check_server(&sync_config.endpoint).await {
            println!("✓ reachable");
        } else {
            println!("✗ unreachable");
        }

        Ok(())
    }
}

fn register_listeners(
    client: &mut SyncClient<WsTransport, vedic_sync_core::FileStore, SystemClock>,
    cache: Arc<Mutex<ContentCache<SystemClock>>>,
) {
    client.on_connection_status(|change| match &change.error {
        Some(error) => tracing::warn!(status = %change.status, "Connection {}", error),
        None => tracing::info!(status = %change.status, "Connection status changed"),
    });
    client.on_network(|change| tracing::info!("Network: {:?}", change));
    client.on_sync_completed(|done| tracing::info!(last_sync = done.last_sync, "Sync completed"));
    client.on_conflict_resolved(|conflict| {
        tracing::info!(
            entity = %conflict.resolved_event.entity,
            "Conflict resolved for event {}",
            conflict.local_event.id
        )
    });
    client.on_data_changed(move |change| {
        println!("  {} {} {}", change.kind, change.entity, change.data);
        if let Ok(mut cache) = cache.lock() {
            cache.apply(change);
        }
    });
    client.on_error(|error| tracing::warn!(category = error.category(), "{}", error));
}

/// Resolves once the channel is open and nothing is left to acknowledge.
async fn wait_until_settled(handle: &SyncHandle) -> Result<(), SyncCommandError> {
    loop {
        let state = handle.state().await?;
        if state.is_channel_open && state.pending_changes.is_empty() {
            return Ok(());
        }
        tokio::time::sleep(SETTLE_POLL).await;
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    SyncError(SyncError),
    Storage(StorageError),
    Signal(std::io::Error),
    Timeout(u64),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::SyncError(e) => write!(f, "{}", e),
            SyncCommandError::Storage(e) => write!(f, "Storage error: {}", e),
            SyncCommandError::Signal(e) => write!(f, "Failed to listen for Ctrl-C: {}", e),
            SyncCommandError::Timeout(secs) => {
                write!(f, "Pending changes were not acknowledged within {}s", secs)
            }
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::SyncError(e) => Some(e),
            SyncCommandError::Storage(e) => Some(e),
            SyncCommandError::Signal(e) => Some(e),
            SyncCommandError::Timeout(_) => None,
        }
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::SyncError(e)
    }
}

impl From<StorageError> for SyncCommandError {
    fn from(e: StorageError) -> Self {
        SyncCommandError::Storage(e)
    }
}
