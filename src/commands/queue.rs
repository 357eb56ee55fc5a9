use chrono::{TimeZone, Utc};
use clap::{Args, Subcommand};
use serde_json::Value;

use vedic_sync_core::queue::PENDING_CHANGES_KEY;
use vedic_sync_core::{ChangeEvent, ChangeKind, FileStore, OutboundQueue, StorageError};

use super::config_cmd::OutputFormat;
use crate::config::Config;

#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// Record a local change; it is sent on the next `vsync sync`
    Add {
        /// Entity the change applies to (e.g. offering, teacher)
        entity: String,

        /// Change kind: create, update or delete
        kind: String,

        /// JSON payload, usually including an "id" field
        data: String,
    },

    /// List pending changes
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Drop every pending change
    Clear,
}

#[derive(Debug)]
pub enum QueueError {
    Storage(StorageError),
    InvalidKind(String),
    InvalidPayload(serde_json::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Storage(e) => write!(f, "Storage error: {}", e),
            QueueError::InvalidKind(kind) => {
                write!(f, "Invalid change kind '{}' (expected create, update or delete)", kind)
            }
            QueueError::InvalidPayload(e) => write!(f, "Invalid JSON payload: {}", e),
            QueueError::Json(e) => write!(f, "JSON error: {}", e),
        }
    }
}

impl std::error::Error for QueueError {}

impl From<StorageError> for QueueError {
    fn from(e: StorageError) -> Self {
        QueueError::Storage(e)
    }
}

impl QueueCommand {
    pub fn run(&self, config: &Config) -> Result<(), QueueError> {
        let key = config.sync_config().storage_key(PENDING_CHANGES_KEY);
        let mut queue = OutboundQueue::new(config.store(), key);
        queue.hydrate()?;

        match &self.command {
            QueueSubcommand::Add { entity, kind, data } => {
                let event = build_event(entity, kind, data, config)?;
                let id = event.id.clone();
                queue.enqueue(event)?;
                println!("Queued {} {} ({})", kind, entity, id);
                println!("{} change(s) pending", queue.len());
            }
            QueueSubcommand::List { format } => list(&queue, format)?,
            QueueSubcommand::Clear => {
                let count = queue.len();
                queue.clear()?;
                println!("Cleared {} pending change(s)", count);
            }
        }
        Ok(())
    }
}

fn build_event(
    entity: &str,
    kind: &str,
    data: &str,
    config: &Config,
) -> Result<ChangeEvent, QueueError> {
    let kind: ChangeKind = kind
        .parse()
        .map_err(|_| QueueError::InvalidKind(kind.to_string()))?;
    if !kind.is_data_change() {
        return Err(QueueError::InvalidKind(kind.to_string()));
    }
    let payload: Value = serde_json::from_str(data).map_err(QueueError::InvalidPayload)?;
    Ok(
        ChangeEvent::new(kind, entity, payload, Utc::now().timestamp_millis())
            .with_user(config.user_id.value.clone()),
    )
}

fn list(queue: &OutboundQueue<FileStore>, format: &OutputFormat) -> Result<(), QueueError> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&queue.snapshot()).map_err(QueueError::Json)?;
            println!("{}", json);
        }
        OutputFormat::Text => {
            if queue.is_empty() {
                println!("No pending changes.");
                return Ok(());
            }
            println!("{:<38} {:<8} {:<16} {:<20} RECORD", "ID", "KIND", "ENTITY", "RECORDED");
            for event in queue.iter() {
                let recorded = Utc
                    .timestamp_millis_opt(event.occurred_at)
                    .single()
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| event.occurred_at.to_string());
                println!(
                    "{:<38} {:<8} {:<16} {:<20} {}",
                    event.id,
                    event.kind,
                    event.entity,
                    recorded,
                    event.record_id().unwrap_or_else(|| "-".to_string())
                );
            }
            println!("\n{} change(s) pending", queue.len());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> Config {
        let config_path = dir.join("config.yaml");
        std::fs::write(&config_path, "data_dir: data\nuser_id: tester\n").unwrap();
        Config::load(Some(config_path)).unwrap()
    }

    #[test]
    fn test_add_then_clear() {
        let temp_dir = tempdir().unwrap();
        let config = config_in(temp_dir.path());

        let add = QueueCommand {
            command: QueueSubcommand::Add {
                entity: "offering".to_string(),
                kind: "update".to_string(),
                data: r#"{"id":"weekend","price":"$27"}"#.to_string(),
            },
        };
        add.run(&config).unwrap();
        add.run(&config).unwrap();

        let mut queue = OutboundQueue::new(config.store(), "vedic_pending_changes");
        assert_eq!(queue.hydrate().unwrap(), 2);
        let first = queue.iter().next().unwrap();
        assert_eq!(first.entity, "offering");
        assert_eq!(first.origin_user_id.as_deref(), Some("tester"));

        QueueCommand {
            command: QueueSubcommand::Clear,
        }
        .run(&config)
        .unwrap();
        let mut queue = OutboundQueue::new(config.store(), "vedic_pending_changes");
        assert_eq!(queue.hydrate().unwrap(), 0);
    }

    #[test]
    fn test_rejects_control_kind() {
        let temp_dir = tempdir().unwrap();
        let config = config_in(temp_dir.path());

        let err = build_event("metadata", "sync_request", "{}", &config).unwrap_err();
        assert!(matches!(err, QueueError::InvalidKind(_)));
        let err = build_event("offering", "upsert", "{}", &config).unwrap_err();
        assert!(matches!(err, QueueError::InvalidKind(_)));
    }

    #[test]
    fn test_rejects_bad_json() {
        let temp_dir = tempdir().unwrap();
        let config = config_in(temp_dir.path());

        let err = build_event("offering", "create", "{not json", &config).unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(_)));
    }
}
