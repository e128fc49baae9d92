// src/main.rs
// CLI entry: `vantage serve` runs the HTTP server (plus an optional
// embedded initiator), `vantage initiator` runs the scheduler loop alone.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vantage::api::build_router;
use vantage::config::Config;
use vantage::{db, initiator, state::AppState};

#[derive(Parser)]
#[command(name = "vantage", about = "Personalized retrieval-augmented reasoning platform")]
struct Cli {
    /// Optional .env file, loaded when POSTGRES_DSN is not already set.
    #[arg(long, env = "ENV_FILE")]
    env_file: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve {
        /// Also run the initiator loop inside this process.
        #[arg(long)]
        with_initiator: bool,
    },
    /// Run the background initiator (scheduler) loop.
    Initiator {
        /// Vantage id to drive.
        #[arg(long, env = "VANTAGE_ID", default_value = "default")]
        vantage_id: String,
        /// Run a single tick and exit.
        #[arg(long)]
        once: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.env_file.as_deref());
    if config.postgres_dsn.is_empty() {
        bail!("POSTGRES_DSN is not set (environment or --env-file)");
    }

    let pool = db::connect(&config.postgres_dsn).await?;
    db::bootstrap(&pool).await?;

    match cli.command {
        Command::Serve { with_initiator } => {
            let bind = config.bind_address();
            let vantage_id = config.vantage_id.clone();
            let app_state = AppState::new(config, pool.clone()).await?;

            if with_initiator {
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(e) = initiator::run_loop(pool, vantage_id).await {
                        tracing::error!("initiator loop exited: {:#}", e);
                    }
                });
            }

            let router = build_router(app_state);
            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("failed to bind {bind}"))?;
            info!(addr = %bind, "server listening");
            axum::serve(listener, router).await?;
        }

        Command::Initiator { vantage_id, once } => {
            if once {
                let worker = initiator::worker_id();
                initiator::tick(&pool, &vantage_id, &worker).await?;
                info!("initiator --once complete");
            } else {
                initiator::run_loop(pool, vantage_id).await?;
            }
        }
    }

    Ok(())
}
