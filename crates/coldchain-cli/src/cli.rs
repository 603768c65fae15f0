use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "coldchain",
    version,
    about = "Chained FULL/incremental archives synced to a space-bounded cold vault",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $COLDCHAIN_CONFIG           (environment variable)
  3. ./coldchain.yaml            (project)
  4. $XDG_CONFIG_HOME/coldchain/config.yaml (or ~/.config/coldchain/config.yaml)
  5. /etc/coldchain/config.yaml  (system)

Without a command, coldchain runs `backup` followed by `sync`."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides COLDCHAIN_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Produce the next archive of the current chain
    Backup,

    /// Resume vault jobs, reconcile, prune and upload finished chains
    Sync {
        /// Forget exhausted retry records and try those operations again
        #[arg(long)]
        retry_exhausted: bool,
    },

    /// Show sequencer, vault budget and job state
    Status,

    /// List cataloged archives
    List {
        /// Only show archives of this chain
        #[arg(long)]
        chain: Option<String>,
    },

    /// Generate a minimal configuration file
    Config {
        /// Destination path (skips interactive prompt)
        dest: Option<String>,
    },

    /// Remove a stale state-directory lock
    BreakLock,
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Sync { .. } => "sync",
            Self::Status => "status",
            Self::List { .. } => "list",
            Self::Config { .. } => "config",
            Self::BreakLock => "break-lock",
        }
    }
}
