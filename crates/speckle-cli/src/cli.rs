use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "speckle", about = "Send and receive content-addressed object graphs", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Store a JSON document as an object graph
    Send(SendArgs),
    /// Rebuild an object graph by id
    Receive(ReceiveArgs),
    /// Show a fragment from the local cache
    Inspect(InspectArgs),
    /// Run the reference object server
    Serve(ServeArgs),
}

/// Where objects come from or go to. Flags override the config file.
#[derive(Args, Clone, Debug, Default)]
pub struct EndpointArgs {
    /// Object server base url
    #[arg(long)]
    pub server: Option<String>,
    #[arg(long, env = "SPECKLE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// Stream (project) id on the server
    #[arg(long)]
    pub stream: Option<String>,
    /// SQLite cache file
    #[arg(long)]
    pub cache: Option<PathBuf>,
    /// Do not use the local cache
    #[arg(long)]
    pub no_cache: bool,
}

#[derive(Args)]
pub struct SendArgs {
    /// JSON document to send
    #[arg(short, long)]
    pub input: PathBuf,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Report detached children that carry an applicationId
    #[arg(long)]
    pub track: bool,
}

#[derive(Args)]
pub struct ReceiveArgs {
    pub id: String,
    #[command(flatten)]
    pub endpoint: EndpointArgs,
    /// Substitute null for objects that cannot be found
    #[arg(long)]
    pub tolerant: bool,
    /// Download blob files into this directory
    #[arg(long)]
    pub blob_dir: Option<PathBuf>,
    /// Print the root fragment
    #[arg(long)]
    pub print: bool,
}

#[derive(Args)]
pub struct InspectArgs {
    pub id: String,
    #[arg(long)]
    pub cache: Option<PathBuf>,
    /// List every id in the closure
    #[arg(long)]
    pub children: bool,
}

#[derive(Args)]
pub struct ServeArgs {
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Require this bearer token
    #[arg(long, env = "SPECKLE_SERVER_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}
