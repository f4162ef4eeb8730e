use clap::Parser;
use std::path::PathBuf;

/// Command-line options for mailweave.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// TOML file with `[mail]` and `[poller]` tables; overrides env values.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// SQLite file holding threads and messages.
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Connect to both mail servers, disconnect, and report the result.
    #[arg(long)]
    pub check: bool,

    /// Run a single poll cycle instead of the background loop.
    #[arg(long)]
    pub once: bool,

    /// Print the latest N activity lines from the store and exit.
    #[arg(long, value_name = "N")]
    pub logs: Option<usize>,

    /// Send one message to this address and exit.
    #[arg(long)]
    pub send_to: Option<String>,

    #[arg(long, requires = "send_to")]
    pub subject: Option<String>,

    #[arg(long, requires = "send_to")]
    pub body: Option<String>,

    #[arg(long, requires = "send_to")]
    pub in_reply_to: Option<String>,

    /// Space-separated Message-IDs for the References header.
    #[arg(long, requires = "send_to")]
    pub references: Option<String>,
}
