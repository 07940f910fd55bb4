use clap::{Parser, Subcommand};

/// hookrelay: per-channel Slack webhook relay
#[derive(Parser)]
#[command(name = "hookrelay", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the relay server
    Serve {
        /// Port to bind. Defaults to HOOKRELAY_PORT.
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one reconciliation pass and exit
    Reconcile,

    /// Inspect and revoke stored tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// List tokens registered under a channel name
    List {
        #[arg(long)]
        channel_name: String,
    },
    /// Revoke a token, e.g. one left behind by a renamed channel
    Revoke {
        #[arg(long)]
        channel_name: String,
        #[arg(long)]
        token: String,
    },
}
