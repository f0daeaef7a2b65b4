use std::path::PathBuf;

use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bootlease::{Config, DhcpServer, Result};

#[derive(Parser)]
#[command(name = "bootlease")]
#[command(author, version, about = "DHCP lease server for network boot", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve DHCP on port 67 (default)
    Run,
    /// Print the effective configuration after environment overrides
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let config = Config::load_or_create(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            if !config.enabled {
                info!("DHCP server disabled, exiting");
                return Ok(());
            }

            info!("Starting DHCP server with config: {:?}", cli.config);
            let server = DhcpServer::new(config).await?;

            tokio::select! {
                result = server.run() => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal, stopping server...");
                    let now = Utc::now();
                    for (address, lease) in server.manager().leases().await {
                        if !lease.is_expired_at(now) {
                            info!(
                                client = %lease.client_id,
                                %address,
                                remaining = lease.remaining_seconds_at(now),
                                "Dropping lease"
                            );
                        }
                    }
                    Ok(())
                }
            }
        }
        Commands::ShowConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
