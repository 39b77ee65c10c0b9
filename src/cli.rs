use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "creditsync")]
#[command(about = "Optimistic credit and job state sync daemon", long_about = None)]
pub struct Cli {
    /// Configuration file (defaults to config/creditsync.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the sync engine with its local control API
    Serve(ServeArgs),
    /// Print persisted snapshots for an identity
    Inspect(InspectArgs),
    /// Delete every persisted snapshot of an identity
    Purge(PurgeArgs),
    /// Print the resolved configuration as TOML
    Config,
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the control API to (overrides server.bind_addr)
    #[arg(long)]
    pub address: Option<SocketAddr>,

    /// Start signed in as this identity; anonymous when omitted
    #[arg(long)]
    pub identity: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct InspectArgs {
    /// Identity whose namespace to read; the anonymous namespace when omitted
    #[arg(long)]
    pub identity: Option<String>,

    /// Only this store (`credits` or `jobs`)
    #[arg(long)]
    pub store: Option<String>,
}

#[derive(clap::Args, Debug)]
pub struct PurgeArgs {
    #[arg(long)]
    pub identity: String,
}
