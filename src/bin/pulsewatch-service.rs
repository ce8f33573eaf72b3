use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, filter::LevelFilter};

use pulsewatch::ServiceBuilder;
use pulsewatch::domain::PulsewatchConfig;

/// Observability and adaptive-control service.
#[derive(Debug, Parser)]
#[command(name = "pulsewatch-service", version)]
struct Cli {
    /// Config file; falls back to $HOME/.pulsewatch/config.yaml, then ./pulsewatch.yaml.
    #[arg(long, global = true, env = "PULSEWATCH_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start every control loop and run until interrupted.
    Run,
    /// Load and validate the configuration, then print a summary.
    Validate,
    /// Run one collection and health pass and print the status as JSON.
    Health,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .compact()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    let result = runtime.block_on(async move {
        match cli.command.unwrap_or(Command::Run) {
            Command::Run => run(cli.config).await,
            Command::Validate => validate(cli.config),
            Command::Health => health(cli.config).await,
        }
    });
    runtime.shutdown_background();
    result
}

async fn run(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(explicit)?;
    let services = ServiceBuilder::new(config).build()?;
    if let Err(err) = services.warm_up().await {
        tracing::warn!(error = %format!("{err:#}"), "continuing with a cold pool");
    }

    let orchestrator = &services.orchestrator;
    orchestrator.start().await?;
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("interrupt received");
            orchestrator.stop().await?;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to listen for interrupt");
            orchestrator.emergency_stop();
        }
    }
    services.pool.close();
    Ok(())
}

fn validate(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(explicit)?;
    config.validate()?;
    println!("configuration ok");
    println!("  metric backend:   {:?}", config.metrics.backend);
    println!("  alert rules:      {}", config.alerts.rules.len());
    println!("  channels:         {}", config.notifications.channels.len());
    println!(
        "  pool:             {}..{} connections",
        config.pool.min_size, config.pool.max_size
    );
    println!(
        "  balancer:         {} instances, {}",
        config.balancer.instances.len(),
        config.balancer.strategy
    );
    println!(
        "  autoscaler:       {}",
        if config.autoscaler.enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

async fn health(explicit: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(explicit)?;
    let services = ServiceBuilder::new(config).build()?;
    services.balancer.health_check_cycle().await;
    services.orchestrator.collect_now().await?;
    let status = services.orchestrator.get_health();
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// An explicit path must exist; the default locations fall back to defaults.
fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<PulsewatchConfig> {
    if let Some(path) = explicit {
        return PulsewatchConfig::load_from_path(&path);
    }
    let path = default_config_path();
    if path.exists() {
        return PulsewatchConfig::load_from_path(&path);
    }
    tracing::warn!(path = %path.display(), "no config file found; using defaults");
    Ok(PulsewatchConfig::default())
}

fn default_config_path() -> PathBuf {
    if let Ok(home) = env::var("HOME") {
        let path = Path::new(&home).join(".pulsewatch").join("config.yaml");
        if path.exists() {
            return path;
        }
    }
    PathBuf::from("pulsewatch.yaml")
}
