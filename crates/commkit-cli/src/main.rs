//! Commkit CLI - entry point

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use commkit_cli::{
    app::CommkitApp,
    cli::{Cli, Commands},
    config::AppConfig,
    error::Result,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    setup_logging(cli.verbose);

    // Load configuration
    let config = load_configuration(&cli)?;

    let app = CommkitApp::new(config)?;
    if let Err(e) = execute(&app, cli.command).await {
        error!("Scenario failed: {}", e);
        std::process::exit(1);
    }

    info!("Commkit CLI exited successfully");
    Ok(())
}

async fn execute(app: &CommkitApp, command: Commands) -> Result<()> {
    match command {
        Commands::Ping { count, timeout_ms } => {
            let summary = app
                .run_ping(count, timeout_ms.map(Duration::from_millis))
                .await?;
            println!("{}", summary);
            if summary.failed > 0 {
                std::process::exit(2);
            }
        }
        Commands::Stream {
            count,
            policy,
            work_ms,
        } => {
            let summary = app
                .run_stream(count, policy.map(Into::into), Duration::from_millis(work_ms))
                .await?;
            println!("{}", summary);
        }
        Commands::Config => {
            print!("{}", app.config().to_toml_string()?);
        }
    }
    Ok(())
}

/// Setup logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Load configuration from file or use defaults
fn load_configuration(cli: &Cli) -> Result<AppConfig> {
    if let Some(config_path) = &cli.config {
        info!("Loading configuration from: {}", config_path);
        AppConfig::load_from_file(config_path)
    } else {
        Ok(AppConfig::default())
    }
}
