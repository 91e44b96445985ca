//! SecureChat
//!
//! Command-line front end for end-to-end encrypted chat channels.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use securechat_peer::config::{default_config_path, Config};
use securechat_peer::demo::{run_demo, DEMO_PEERS};
use securechat_protocol::{key_fingerprint, EphemeralKeyPair};

/// SecureChat - end-to-end encrypted two-party chat.
#[derive(Parser, Debug)]
#[command(name = "securechat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a local session between two peers over an in-process relay
    Demo {
        /// Message to exchange; repeat for more, sent in alternating directions
        #[arg(short, long = "message", value_name = "TEXT")]
        messages: Vec<String>,
    },

    /// Generate an ephemeral key pair and print its public key
    Keygen,

    /// Manage the configuration file
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    // Load configuration
    let mut config = Config::load(&config_path)?;

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.identity.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if cli.config.is_some() {
        tracing::info!("Using config file: {:?}", config_path);
    }

    // Handle commands
    match cli.command {
        Commands::Demo { messages } => {
            config.validate()?;
            let messages = if messages.is_empty() {
                vec!["hello".to_string()]
            } else {
                messages
            };

            let report = run_demo(&config, &messages).await?;

            println!("Channel established");
            for (name, fingerprint) in DEMO_PEERS.iter().zip(&report.fingerprints) {
                println!("  {:<6} {}", name, fingerprint);
            }
            println!();
            for message in &report.delivered {
                println!("[{}] {}", message.sender, message.plaintext);
            }
            println!();
            println!(
                "{} left; {} is now {}",
                DEMO_PEERS[1], DEMO_PEERS[0], report.final_state
            );
        }
        Commands::Keygen => {
            let pair = EphemeralKeyPair::generate()?;
            println!("Public key:  {}", pair.public_key_text());
            println!("Fingerprint: {}", key_fingerprint(&pair.public_key_bytes()));
        }
        Commands::Config(ConfigCommands::Show) => {
            config.validate()?;
            print!("{}", config.to_toml()?);
        }
        Commands::Config(ConfigCommands::Path) => {
            println!("{}", config_path.display());
        }
        Commands::Config(ConfigCommands::Init { force }) => {
            if config_path.exists() && !force {
                anyhow::bail!(
                    "Config file already exists at {} (use --force to overwrite)",
                    config_path.display()
                );
            }
            Config::default().save(&config_path)?;
            println!("Wrote {}", config_path.display());
        }
    }

    Ok(())
}
