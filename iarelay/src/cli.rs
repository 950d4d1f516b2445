use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Download Internet Archive items, verify them and move them to an rclone remote",
    long_about = None
)]
pub struct Cli {
    /// Directory holding the resume ledgers (overrides IARELAY_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,
    /// Directory for rclone output captures (overrides IARELAY_DEBUG_DIR)
    #[arg(long, global = true)]
    pub debug_dir: Option<PathBuf>,
    /// Also write logs to a timestamped file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Transfer every original file of one item
    Item {
        /// Archive item identifier
        identifier: String,
        /// Local staging directory (handed to rclone as is)
        local_path: PathBuf,
        /// rclone destination root; the item lands in <remote>/<identifier>
        remote_path: String,
        #[command(flatten)]
        transfer: TransferArgs,
    },
    /// Transfer every item named in a list file, one per line
    Batch {
        list_path: PathBuf,
        local_path: PathBuf,
        remote_path: String,
        #[command(flatten)]
        transfer: TransferArgs,
        /// Move on to the next identifier when an item aborts. Each item then
        /// works in its own `<local_path>/<identifier>` directory
        #[arg(long)]
        keep_going: bool,
    },
    /// List files below a remote path
    Ls {
        remote_path: String,
        #[arg(long, default_value_t = 1)]
        max_depth: u32,
        #[arg(long)]
        rc_logfile: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Default, Args)]
pub struct TransferArgs {
    /// rclone --bwlimit value
    #[arg(long)]
    pub rc_bwlimit: Option<String>,
    /// Let rclone log verbosely to this file
    #[arg(long)]
    pub rc_logfile: Option<PathBuf>,
    /// Only download files matching this glob (alternatives separated by `|`)
    #[arg(long)]
    pub file_glob: Option<String>,
    /// Relay after every N completed files
    #[arg(long)]
    pub upload_every: Option<u32>,
    /// Only simulate rclone actions
    #[arg(long)]
    pub rc_dry_run: bool,
    /// Only list archive files, download nothing
    #[arg(long)]
    pub ia_dry_run: bool,
    /// Fetch files again even when the ledger has them
    #[arg(long)]
    pub no_resume: bool,
    /// Download attempts per file (overrides IARELAY_MAX_ATTEMPTS)
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_attempts: Option<u32>,
}
