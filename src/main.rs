mod cli;
mod server;

use clap::Parser;
use cli::{Cli, Commands};
use creditsync::config::Config;
use creditsync::observability::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Commands::Serve(args) => server::serve(config, args).await?,
        Commands::Inspect(args) => server::inspect(&config, args)?,
        Commands::Purge(args) => server::purge(&config, args).await?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}
