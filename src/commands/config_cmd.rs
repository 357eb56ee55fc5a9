use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                let config = config.redacted();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("data_dir: {}", config.data_dir.value.display());
                        println!("  source: {}", config.data_dir.source);
                        println!();

                        println!("server_url: {}", config.server_url.value);
                        println!("  source: {}", config.server_url.source);
                        println!();

                        println!("channel: {}", config.channel.value);
                        println!("  source: {}", config.channel.source);
                        println!();

                        println!(
                            "auth_token: {}",
                            config.auth_token.value.as_deref().unwrap_or("(none)")
                        );
                        println!("  source: {}", config.auth_token.source);
                        println!();

                        println!(
                            "user_id: {}",
                            config.user_id.value.as_deref().unwrap_or("(none)")
                        );
                        println!("  source: {}", config.user_id.source);
                        println!();

                        println!("namespace: {}", config.namespace.value);
                        println!("  source: {}", config.namespace.source);
                        println!();

                        println!("conflict_policy: {}", config.conflict_policy.value);
                        println!("  source: {}", config.conflict_policy.source);

                        if let Some(secs) = config.heartbeat_timeout_secs {
                            println!();
                            println!("heartbeat_timeout_secs: {}", secs);
                        }
                    }
                }
                Ok(())
            }
        }
    }
}
