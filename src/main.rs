//! kiln - two-stage container image builds for Rust services
//!
//! CLI entry point that dispatches to subcommands.

use clap::{CommandFactory, Parser};
use console::style;
use kiln::cli::{Cli, Commands};
use kiln::config::ConfigManager;
use kiln::error::{KilnError, KilnResult};
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

/// 0 = warn (progress output only), 1 = info, 2+ = debug.
/// RUST_LOG wins when no -v flag is given.
fn init_logging(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("kiln=warn")),
        1 => EnvFilter::new("kiln=info"),
        _ => EnvFilter::new("kiln=debug"),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> KilnResult<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "kiln", &mut std::io::stdout());
            return Ok(());
        }
        Commands::Init(args) => {
            init_logging(cli.verbose, false);
            return kiln::cli::commands::init(args).await;
        }
        _ => {}
    }

    let config_manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };

    let local_config_path = if cli.no_local {
        None
    } else {
        let cwd = std::env::current_dir()
            .map_err(|e| KilnError::io("getting current directory", e))?;
        ConfigManager::find_local_config(&cwd)
    };

    let config = config_manager
        .load_merged(local_config_path.as_deref())
        .await?;

    init_logging(cli.verbose, config.general.log_format == "json");
    match local_config_path {
        Some(ref path) => debug!("Using project config {}", path.display()),
        None => debug!("No project config"),
    }

    let state_dir = cli.state_dir.clone().unwrap_or_else(ConfigManager::state_dir);
    ConfigManager::ensure_state_dirs(&state_dir).await?;

    match cli.command {
        Commands::Build(args) => kiln::cli::commands::build(args, &config, &state_dir).await,
        Commands::Cache(args) => kiln::cli::commands::cache(args, &config, &state_dir).await,
        Commands::Config(args) => {
            kiln::cli::commands::config(args, &config, config_manager.path()).await
        }
        Commands::Status => kiln::cli::commands::status(&config, &state_dir).await,
        Commands::Init(_) | Commands::Completions { .. } => Ok(()),
    }
}
