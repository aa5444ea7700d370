use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use bothost::apps::App;
use bothost::config::PlatformConfig;
use bothost::logger::{LogConfig, init_tracing};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Log level or filter (e.g. error, warn, info, debug, bothost=trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Directory for the rolling text and JSON event logs
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// OTLP/HTTP collector base (e.g. http://localhost:4318)
    #[arg(long)]
    pub otel_endpoint: Option<String>,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("logs"),
            otel_endpoint: None,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let telemetry = init_tracing(&LogConfig::new(args.log_level, args.log_dir, args.otel_endpoint))
        .context("could not set up logging")?;

    info!("bothost starting up…");
    let config = PlatformConfig::load(&context.config_manager)
        .await
        .context("invalid configuration")?;

    let mut app = App::bootstrap(config, telemetry)
        .await
        .context("failed to bootstrap the platform")?;
    let (addr, report) = match app.start().await {
        Ok(started) => started,
        Err(err) => {
            error!("failed to start: {err:#}");
            app.shutdown().await;
            return Err(err);
        }
    };

    println!(
        "bothost listening on {addr}: {}/{} bots restored, {} running. Press Ctrl-C to exit",
        report.restored,
        report.attempted,
        app.lifecycle().running_count()
    );

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    info!("bothost shutting down");
    app.shutdown().await;
    println!("Goodbye!");
    Ok(())
}
