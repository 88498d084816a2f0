use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use tdmgate::config::GatewayConfig;
use tdmgate::{GatewayBuilder, Result};

#[derive(Parser)]
#[command(name = "tdmgate")]
#[command(about = "TDM (PRI/ISUP) to SIP signaling gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "tdmgate=debug"
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run,
    /// Check the configuration file and exit
    ValidateConfig,
    /// Print a default configuration
    GenerateConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log_level)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let load = || -> Result<GatewayConfig> {
        match &cli.config {
            Some(path) => GatewayConfig::load_from_file(path),
            None => Ok(GatewayConfig::default()),
        }
    };

    match cli.command.unwrap_or(Commands::Run) {
        Commands::GenerateConfig => {
            println!("{}", GatewayConfig::default().to_toml()?);
            Ok(())
        }
        Commands::ValidateConfig => {
            load()?;
            println!("configuration ok");
            Ok(())
        }
        Commands::Run => run(load()?).await,
    }
}

async fn run(config: GatewayConfig) -> Result<()> {
    let cancel_token = CancellationToken::new();
    let mut gateway = GatewayBuilder::new()
        .config(config)
        .cancel_token(cancel_token.clone())
        .build()
        .await?;

    let mut events = gateway.take_events().expect("gateway events");
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!("gateway event: {:?}", event);
        }
    });

    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            cancel_token.cancel();
        }
    });

    gateway.serve().await
}
