//! Gantry CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod handlers;

use commands::Commands;

#[derive(Parser)]
#[command(name = "gantry")]
#[command(author, version, about = "Gantry pipeline scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Graph { path } => handlers::graph(&path)?,
        Commands::Schema => handlers::schema()?,
        Commands::Tick {
            config,
            modifications,
            settings,
            ticks,
        } => handlers::tick(&config, &modifications, settings.as_deref(), ticks).await?,
        Commands::Serve {
            config,
            modifications,
            settings,
        } => handlers::serve(&config, &modifications, settings.as_deref()).await?,
    }

    Ok(())
}
