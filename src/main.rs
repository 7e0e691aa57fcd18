use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use waav_session::{init, routes, state::AppState};

/// WaaV Session - Realtime voice session orchestrator
#[derive(Parser, Debug)]
#[command(name = "waav-session")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the configuration and print it with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize crypto provider for TLS connections
    // This must be done before any TLS connections are attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    // Parse CLI arguments
    let cli = Cli::parse();

    if let Some(Commands::CheckConfig) = cli.command {
        let rendered = init::check_config(cli.config.as_ref())?;
        println!("{rendered}");
        println!("Configuration OK");
        return Ok(());
    }

    if let Some(config_path) = &cli.config {
        println!("Loading configuration from {}", config_path.display());
    }
    let config = init::load_config(cli.config.as_ref())?;

    let address = config.address();
    let socket_addr: SocketAddr = address
        .parse()
        .map_err(|e| anyhow!("Invalid server address '{}': {}", address, e))?;

    let app_state = AppState::new(config)?;
    info!(
        tools = app_state.config.tools.len(),
        turn_detection = app_state.config.turn_detection.name(),
        persistence = app_state.transcripts.is_some(),
        "Server state ready"
    );

    let app = routes::create_app(app_state);

    println!("Server listening on http://{}", socket_addr);
    let listener = TcpListener::bind(&socket_addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
