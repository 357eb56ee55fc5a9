mod config_cmd;
mod queue;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use queue::QueueCommand;
pub use sync_cmd::SyncCommand;
