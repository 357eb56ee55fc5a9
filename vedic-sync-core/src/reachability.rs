//! Server reachability probe, used as the network signal outside a browser.

use std::time::Duration;

use tokio::task::JoinHandle;

use crate::runtime::SyncHandle;

/// Timeout for a single reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Converts a WebSocket URL to the HTTP URL of the same host.
pub fn http_url(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("https://{}", url)
    }
}

/// Checks whether the sync server answers HTTP at all.
///
/// Any response, whatever its status, counts as reachable.
pub async fn check_server(url: &str) -> bool {
    let client = match reqwest::Client::builder().timeout(PROBE_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            tracing::warn!("Failed to build HTTP client: {}", e);
            return false;
        }
    };
    match client.get(http_url(url)).send().await {
        Ok(_) => true,
        Err(e) => {
            tracing::debug!("Server unreachable: {}", e);
            false
        }
    }
}

/// Periodically probes the server and reports transitions to a driver.
#[derive(Debug, Clone)]
pub struct NetworkMonitor {
    url: String,
    interval: Duration,
}

impl NetworkMonitor {
    pub fn new(url: impl Into<String>, interval: Duration) -> Self {
        Self {
            url: url.into(),
            interval,
        }
    }

    /// Spawns the probe loop. It ends when the driver stops.
    pub fn spawn(self, handle: SyncHandle) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            let mut last: Option<bool> = None;
            loop {
                ticker.tick().await;
                let online = check_server(&self.url).await;
                if last == Some(online) {
                    continue;
                }
                last = Some(online);
                if handle.set_network_available(online).is_err() {
                    break;
                }
            }
        })
    }
}
