//! mathgradectl - client for the mathgrade tool endpoint

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use mathgrade_shared::GraderConfig;
use std::env;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "warn");
    }
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .without_time()
        .init();

    let cli = Cli::parse();
    let mut config = GraderConfig::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.endpoint.host = host;
    }
    if let Some(port) = cli.port {
        config.endpoint.port = port;
    }

    match cli.command {
        Commands::Grade {
            image,
            grade_level,
            student,
            homework_id,
            json,
        } => commands::grade(&config, &image, grade_level, student, homework_id, json).await,
        Commands::Tools => commands::tools(&config).await,
        Commands::Ping => commands::ping(&config).await,
        Commands::Call { tool, args } => commands::call(&config, &tool, &args).await,
    }
}
