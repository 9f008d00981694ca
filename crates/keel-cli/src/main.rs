//! Keel CLI - inspect model files, hardware and the model store

mod cli;
mod commands;
mod output;

use clap::Parser;
use cli::{Cli, Commands, ConfigCommands, ModelCommands};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over the verbosity flag
    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command(cli))
}

async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let output = cli.output.unwrap_or_default();
    tracing::debug!(command = cli.command.name(), output = ?output, "running command");

    match cli.command {
        Commands::Detect { paths } => commands::detect::run(&paths, output)?,

        Commands::Estimate { size, quant } => {
            commands::estimate::run(size.as_deref(), quant.as_deref(), output)?
        }

        Commands::Hardware => commands::hardware::run(output)?,

        Commands::Models { action } => {
            let config = commands::load_config(cli.config.as_deref(), cli.models_dir)?;
            match action {
                ModelCommands::List => commands::models::list(config, output).await?,
                ModelCommands::Download {
                    id,
                    source,
                    sha256,
                    filename,
                } => {
                    commands::models::download(config, &id, &source, sha256, filename, output)
                        .await?
                }
                ModelCommands::Size { id } => commands::models::size(config, &id, output).await?,
                ModelCommands::Delete { id } => {
                    commands::models::delete(config, &id, output).await?
                }
            }
        }

        Commands::Config { action } => match action {
            ConfigCommands::Show => {
                let config = commands::load_config(cli.config.as_deref(), cli.models_dir)?;
                commands::config_cmd::show(&config, output)?;
            }
            ConfigCommands::Validate { path } => commands::config_cmd::validate(&path)?,
        },
    }

    Ok(())
}
