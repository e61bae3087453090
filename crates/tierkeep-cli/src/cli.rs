use clap::{Parser, Subcommand};
use tierkeep_core::SecurityTier;

/// CLI surface definition: a thin shell over the keystore façade.
#[derive(Parser, Debug)]
#[command(
    name = "tierkeep",
    about = "Tiered, crash-safe local secret store",
    version,
    propagate_version = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a value, replacing any existing one.
    Put {
        service: String,
        key: String,
        value: String,
        /// Protection tier; falls back to `default_tier` from the config.
        #[arg(long)]
        tier: Option<SecurityTier>,
    },
    /// Print a stored value.
    Get {
        service: String,
        key: String,
        /// Skip the in-process cache.
        #[arg(long)]
        no_cache: bool,
        /// Show the stored form and tier instead of the plaintext.
        #[arg(long)]
        raw: bool,
    },
    /// List every key stored under a service.
    List { service: String },
    /// Delete a value. Succeeds if it is already gone.
    Delete { service: String, key: String },
    /// Delete every record of a service.
    Purge { service: String },
    /// Run a store/get/delete round trip at every tier.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
