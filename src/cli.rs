use clap::{Parser, Subcommand};

/// llmux — auth, policy, and accounting core for an LLM API gateway
#[derive(Parser)]
#[command(name = "llmux", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the gateway control-plane server
    Serve {
        /// Port to bind
        #[arg(short, long, default_value = "8443")]
        port: u16,
    },

    /// Manage virtual API keys
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Mint a new API key; prints the credential exactly once
    Generate {
        #[arg(long)]
        name: String,
        #[arg(long)]
        alias: Option<String>,
        /// llm-api, management, read-only, or default
        #[arg(long, default_value = "default")]
        key_type: String,
        #[arg(long)]
        team_id: Option<String>,
        #[arg(long)]
        user_id: Option<String>,
        /// Comma-separated allowed model patterns; empty = unrestricted
        #[arg(long, value_delimiter = ',')]
        allowed_models: Option<Vec<String>>,
        #[arg(long)]
        max_budget: Option<f64>,
        /// "", 1d, 7d, or 30d
        #[arg(long, default_value = "")]
        budget_duration: String,
        /// Expiry in the duration grammar (e.g. "30d"); omit for never
        #[arg(long)]
        expires_in: Option<String>,
    },
    /// List keys
    List {
        #[arg(long)]
        team_id: Option<String>,
        #[arg(long)]
        include_inactive: bool,
    },
    /// Soft-delete a key
    Revoke {
        #[arg(long)]
        key_id: String,
    },
}
