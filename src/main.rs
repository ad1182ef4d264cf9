use anyhow::{Context, Result};
use auto_claude::claude::resolve_model_id;
use auto_claude::config::{Config, LoggingConfig, load_config};
use auto_claude::coordinator::ParallelCoordinator;
use auto_claude::orchestrator::Orchestrator;
use auto_claude::tasks::NoopTaskProvider;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "auto-claude")]
#[command(version, about = "Autonomous development orchestrator")]
struct Cli {
    /// Path to the YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,
}

/// Console plus non-blocking file logging per the `logging` config section.
/// The returned guard must stay alive for the process lifetime.
fn init_logging(config: &LoggingConfig) -> Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = Path::new(&config.file);
    let log_dir = log_path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(dir) = log_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "auto_claude.log".to_string());
    let appender = tracing_appender::rolling::never(
        log_dir.unwrap_or_else(|| Path::new(".")),
        file_name,
    );
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Ok(guard)
}

async fn run(cli: Cli) -> Result<()> {
    if !cli.config.exists() {
        anyhow::bail!("Config file not found: {}", cli.config.display());
    }
    let mut config: Config = load_config(Some(&cli.config))?;
    let _log_guard = init_logging(&config.logging)?;

    info!("auto-claude starting (config: {})", cli.config.display());

    // Pin the canonical model ID once so every later call uses it.
    if config.claude.resolved_model.trim().is_empty()
        && let Some(resolved) = resolve_model_id(
            &config.claude.model,
            &config.claude.command,
            Duration::from_secs(30),
        )
        .await
    {
        config.claude.resolved_model = resolved;
    }

    if config.parallel.enabled {
        ParallelCoordinator::new(config, Box::new(NoopTaskProvider))
            .run(cli.once)
            .await
    } else {
        Orchestrator::new(config, Box::new(NoopTaskProvider))
            .run(cli.once)
            .await
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        error!("Fatal: {:#}", e);
        eprintln!("auto-claude: {:#}", e);
        std::process::exit(1);
    }
}
