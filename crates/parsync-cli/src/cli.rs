use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "parsync",
    about = "parsync, offline-first partition replication",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the engine configuration file.
    #[arg(long, global = true, default_value = "parsync.toml")]
    pub config: String,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Show pending changes and lease state for a partition
    Status(StatusArgs),
    /// Push pending changes to the shared store
    Push(PushArgs),
    /// Refresh the local store from the shared copy
    Refresh(RefreshArgs),
    /// Publish the local store to the shared volume
    Publish(PublishArgs),
    /// Delete old synchronized change-log entries
    CompactLog(CompactLogArgs),
}

#[derive(Args)]
pub struct StatusArgs {
    pub partition: String,
}

#[derive(Args)]
pub struct PushArgs {
    pub partition: String,
}

#[derive(Args)]
pub struct RefreshArgs {
    pub partition: String,
}

#[derive(Args)]
pub struct PublishArgs {
    pub partition: String,
}

#[derive(Args)]
pub struct CompactLogArgs {
    pub partition: String,
    /// Only delete entries older than this many days.
    #[arg(long)]
    pub older_than_days: Option<u32>,
}
