use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "pockestrator",
    about = "Manage a fleet of PocketBase instances on this host",
    version
)]
pub struct Cli {
    /// Path to the settings file
    #[arg(short, long, default_value = "pockestrator.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the health monitor until interrupted
    Serve,

    /// Check host prerequisites (systemd, caddy, writable directories)
    Doctor,

    /// Create and deploy a new service
    Create {
        /// Project name (directory, unit prefix, default subdomain)
        name: String,

        /// Instance port; auto-assigned when omitted
        #[arg(short, long)]
        port: Option<u16>,

        /// PocketBase version; latest upstream release when omitted
        #[arg(long)]
        version: Option<String>,

        /// Domain; falls back to the configured default
        #[arg(short, long)]
        domain: Option<String>,

        /// Wait for the deployment to finish instead of returning at once
        #[arg(long)]
        wait: bool,
    },

    /// List all managed services
    List,

    /// Delete a service and its artifacts
    Delete { name: String },

    /// Start a service
    Start { name: String },

    /// Stop a service
    Stop { name: String },

    /// Restart a service
    Restart { name: String },

    /// Show supervisor status for a service
    Status { name: String },

    /// Show reconciliation state for a service
    Drift { name: String },

    /// Tail the service journal
    Logs {
        name: String,

        /// Number of lines to fetch
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}
