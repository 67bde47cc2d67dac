use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "mexsync")]
#[command(about = "Signed message exchange and queue mirroring for market-operator endpoints", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, env = "MEXSYNC_CONFIG", default_value = "mexsync.toml", global = true)]
    pub config: PathBuf,

    /// Verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Fetch one message
    Get(GetArgs),

    /// List queued messages
    List(ListArgs),

    /// Submit a document or attachment
    Put(PutArgs),

    /// Run a data query
    Query(QueryArgs),

    /// Run one sync tick for every task, or for the named task
    Sync {
        task: Option<String>,
    },

    /// Run the scheduler until interrupted
    Run,

    /// Remove stale message locks
    Unlock {
        /// Only locks older than this many seconds
        #[arg(long, default_value_t = 3600)]
        older_than_secs: u64,
    },
}

#[derive(Args, Debug)]
#[command(group = clap::ArgGroup::new("selector").required(true).args(["code", "message_id", "next"]))]
pub struct GetArgs {
    /// Message code
    #[arg(long)]
    pub code: Option<u64>,

    /// Message identification
    #[arg(long)]
    pub message_id: Option<String>,

    /// Version, with --message-id
    #[arg(long, requires = "message_id")]
    pub version: Option<String>,

    /// Next message in queue
    #[arg(long)]
    pub next: bool,

    /// Write the content here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Only codes greater than this
    #[arg(long, conflicts_with_all = ["start", "end"])]
    pub after: Option<u64>,

    /// Window start (RFC 3339)
    #[arg(long, requires = "end")]
    pub start: Option<DateTime<Utc>>,

    /// Window end (RFC 3339)
    #[arg(long, requires = "start")]
    pub end: Option<DateTime<Utc>>,

    /// Which clock the window refers to
    #[arg(long, value_enum, default_value_t = IntervalArg::Application)]
    pub interval_type: IntervalArg,

    #[arg(long)]
    pub message_id: Option<String>,

    #[arg(long)]
    pub msg_type: Option<String>,

    #[arg(long)]
    pub owner: Option<String>,

    /// Print entries as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum IntervalArg {
    Application,
    Server,
}

#[derive(Args, Debug)]
pub struct PutArgs {
    pub file: PathBuf,

    /// Send as a compressed attachment instead of inline XML
    #[arg(long)]
    pub binary: bool,

    /// Format hint for attachments
    #[arg(long, requires = "binary")]
    pub format: Option<String>,
}

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[arg(long)]
    pub data_type: String,

    /// Parameter as key=value (repeatable)
    #[arg(short = 'p', long = "param", value_parser = parse_key_value)]
    pub params: Vec<(String, String)>,

    #[arg(long)]
    pub start: Option<DateTime<Utc>>,

    #[arg(long)]
    pub end: Option<DateTime<Utc>>,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got {s:?}")),
    }
}
