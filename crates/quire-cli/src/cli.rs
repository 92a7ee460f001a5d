use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "quire",
    about = "Quire: a versioned, content-addressed filesystem drive",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Drive directory.
    #[arg(short, long, global = true, default_value = ".quire")]
    pub dir: PathBuf,

    /// Drive configuration file. Defaults to `quire.toml` in the drive
    /// directory, if present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

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
    /// Create a drive, or open an existing one
    Init(InitArgs),
    /// Print the drive key
    Key(KeyArgs),
    /// Write a file into the drive
    Put(PutArgs),
    /// Print file content
    Cat(CatArgs),
    /// Show file or directory metadata
    Stat(PathArgs),
    /// List a directory
    Ls(LsArgs),
    /// Remove a file
    Rm(PathArgs),
    /// Show the change log
    Log(LogArgs),
    /// Show downloaded block counts
    Stats(PathArgs),
    /// Replicate the drive with a peer over TCP
    Sync(SyncArgs),
}

#[derive(Args)]
pub struct InitArgs {
    /// Open the drive with this key as a read-only replica.
    #[arg(long)]
    pub key: Option<String>,
    /// Keep content sparse.
    #[arg(long)]
    pub sparse: bool,
    /// Block size in bytes for new content.
    #[arg(long)]
    pub block_size: Option<usize>,
}

#[derive(Args)]
pub struct KeyArgs {
    /// Print the discovery key instead.
    #[arg(long)]
    pub discovery: bool,
}

#[derive(Args)]
pub struct PutArgs {
    pub path: String,
    /// Source file, or `-` for stdin.
    pub source: String,
    /// Permission bits, octal.
    #[arg(long)]
    pub mode: Option<String>,
}

#[derive(Args)]
pub struct CatArgs {
    pub path: String,
    #[arg(long, default_value = "0")]
    pub start: u64,
    #[arg(long)]
    pub length: Option<u64>,
    /// Read the file as of this version.
    #[arg(long)]
    pub version: Option<u64>,
}

#[derive(Args)]
pub struct PathArgs {
    #[arg(default_value = "/")]
    pub path: String,
    #[arg(long)]
    pub version: Option<u64>,
}

#[derive(Args)]
pub struct LsArgs {
    #[arg(default_value = "/")]
    pub path: String,
    #[arg(long)]
    pub version: Option<u64>,
    /// Show size and mode of each entry.
    #[arg(short, long)]
    pub long: bool,
}

#[derive(Args)]
pub struct LogArgs {
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
    /// Oldest first.
    #[arg(long)]
    pub reverse: bool,
}

#[derive(Args)]
pub struct SyncArgs {
    /// Serve the drive to peers on this address.
    #[arg(long, conflicts_with = "connect", required_unless_present = "connect")]
    pub listen: Option<String>,
    /// Replicate with the peer serving at this address.
    #[arg(long)]
    pub connect: Option<String>,
    /// Stop after the first peer disconnects.
    #[arg(long, requires = "listen")]
    pub once: bool,
    /// Disconnect once the drive reaches this version.
    #[arg(long, requires = "connect")]
    pub version: Option<u64>,
}
