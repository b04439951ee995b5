use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sitepanel::{AppState, Config, routes};

#[derive(Parser, Debug)]
#[command(name = "sitepanel")]
#[command(about = "Per-site file manager and live log streaming for the hosting panel")]
#[command(version)]
struct Cli {
    /// Port to listen on
    #[arg(short, long, env = "SITEPANEL_PORT", default_value = "41830")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, env = "SITEPANEL_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Config file path (optional)
    #[arg(short, long, env = "SITEPANEL_CONFIG")]
    config: Option<PathBuf>,

    /// Site registry JSON file (overrides the config file)
    #[arg(short, long, env = "SITEPANEL_SITES_FILE")]
    sites_file: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, env = "SITEPANEL_VERBOSE")]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, env = "SITEPANEL_JSON_LOGS")]
    json_logs: bool,
}

impl Cli {
    fn init_logging(&self) {
        let level = if self.verbose { "debug" } else { "info" };
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("sitepanel={level},tower_http={level}")));

        if self.json_logs {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .ok();
        }
    }

    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => Config::default(),
        };

        if let Some(sites_file) = &self.sites_file {
            config.sites_file = sites_file.clone();
        }
        Ok(config)
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    let config = cli.load_config()?;
    if !config.sites_file.exists() {
        warn!(
            "Site registry {} does not exist yet; no sites will be served",
            config.sites_file.display()
        );
    }
    info!("Using site registry: {}", config.sites_file.display());

    let app = routes::app(AppState::new(config));

    let addr: SocketAddr = format!("{}:{}", cli.bind, cli.port)
        .parse()
        .context("parsing bind address")?;
    info!("Starting sitepanel on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running server")?;

    Ok(())
}
