//! mathgraded - math homework tool endpoint
//!
//! Serves the grading tool catalog over a WebSocket JSON-RPC endpoint.

use anyhow::{Context, Result};
use clap::Parser;
use mathgrade_shared::{CapabilitySelector, GraderConfig};
use mathgraded::backend::{ChatCompletionsBackend, ModelBackend, ScriptedBackend};
use mathgraded::{serve, EndpointState, ToolRegistry};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "mathgraded")]
#[command(about = "Math homework grading tool endpoint", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (overrides $MATHGRADE_CONFIG and the user config)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen host
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Serve canned replies from a JSON or TOML script instead of the model API
    #[arg(long)]
    scripted: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_level(true)
        .init();

    let args = Args::parse();
    let mut config = GraderConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.endpoint.host = host;
    }
    if let Some(port) = args.port {
        config.endpoint.port = port;
    }

    info!("mathgraded v{} starting", env!("CARGO_PKG_VERSION"));

    let backend: Arc<dyn ModelBackend> = match &args.scripted {
        Some(path) => Arc::new(
            ScriptedBackend::from_file(path)
                .with_context(|| format!("Failed to load script {}", path.display()))?,
        ),
        None => Arc::new(ChatCompletionsBackend::new(&config.backend)?),
    };
    info!("Model backend: {}", backend.name());

    let registry = ToolRegistry::standard(
        backend,
        CapabilitySelector::new(config.models.clone()),
        config.backend.max_tokens,
    );
    let state = Arc::new(EndpointState::new(registry));

    let bind = format!("{}:{}", config.endpoint.host, config.endpoint.port);
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;

    tokio::select! {
        result = serve(listener, state) => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down gracefully"),
    }
    Ok(())
}
