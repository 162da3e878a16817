use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use autopush::{
    ConfigLoader, CredentialResolver, DirectorySecretStore, LoadedConfig, Scheduler, SettingsSpec,
    SyncEngine, TokenCache,
};
use clap::{Parser, Subcommand, ValueEnum};
use log::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Default pass interval when no automation declares one.
const DEFAULT_INTERVAL_SECS: u64 = 300;

#[derive(Parser)]
#[command(name = "autopush", version, about = "Commit and push image updates to Git")]
struct Cli {
    /// Directory holding the resource YAML files.
    #[arg(long, short, env = "AUTOPUSH_CONFIG", default_value = ".")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Resolve every automation and print the redacted plans as JSON.
    Plan,
    /// Run automation cycles.
    Run {
        /// Run a single pass and exit.
        #[arg(long, conflicts_with = "interval")]
        once: bool,

        /// Seconds between passes; the smallest automation interval when unset.
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn init_logging(format: LogFormat) -> Result<(), Box<dyn std::error::Error>> {
    tracing_log::LogTracer::init()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

/// Secrets live next to the configuration unless the settings say otherwise.
fn secrets_directory(config_dir: &Path, settings: &SettingsSpec) -> PathBuf {
    match &settings.secrets_directory {
        Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
        Some(dir) => config_dir.join(dir),
        None => config_dir.join("secrets"),
    }
}

fn build_engine(config_dir: &Path, settings: SettingsSpec) -> autopush::Result<SyncEngine> {
    let secrets = DirectorySecretStore::new(secrets_directory(config_dir, &settings));
    let mut credentials = CredentialResolver::new(Arc::new(secrets));
    if settings.token_cache.enabled {
        credentials =
            credentials.with_token_cache(TokenCache::new(settings.token_cache.max_entries));
    }
    SyncEngine::new(Arc::new(credentials), settings)
}

fn pass_interval(config: &LoadedConfig) -> Duration {
    let secs = config
        .automations
        .iter()
        .map(|a| a.resource.spec.interval)
        .filter(|i| *i > 0)
        .min()
        .unwrap_or(DEFAULT_INTERVAL_SECS);
    Duration::from_secs(secs)
}

async fn plan(engine: &SyncEngine, config: &LoadedConfig) -> bool {
    let mut views = Vec::new();
    let mut ok = true;

    for automation in &config.automations {
        let automation = &automation.resource;
        match engine.plan(automation, config).await {
            Ok(plan) => match serde_json::to_value(plan.describe()) {
                Ok(view) => views.push(view),
                Err(e) => {
                    error!("Failed to serialize plan for {}: {}", automation.key(), e);
                    ok = false;
                }
            },
            Err(e) => {
                error!("Failed to resolve plan for {}: {}", automation.key(), e);
                views.push(serde_json::json!({
                    "target": automation.key().to_string(),
                    "error": e.to_string(),
                    "category": format!("{:?}", e.category()),
                }));
                ok = false;
            }
        }
    }

    match serde_json::to_string_pretty(&views) {
        Ok(output) => println!("{}", output),
        Err(e) => {
            error!("Failed to render plans: {}", e);
            ok = false;
        }
    }
    ok
}

async fn run_once(scheduler: &Scheduler, config: &LoadedConfig) -> bool {
    let reports = scheduler.run_once(config).await;
    for report in &reports {
        match &report.result {
            Ok(outcome) => match &outcome.push {
                Some(result) => info!("{}: {}", report.target, result.summary()),
                None => info!("{}: no changes at {}", report.target, outcome.observed_commit),
            },
            Err(e) => error!(
                "{}: failed after {} attempt(s): {}",
                report.target, report.attempts, e
            ),
        }
    }

    let summary = autopush::scheduler::summarize(config, &reports);
    info!(
        "Pass complete: {} pushed, {} unchanged, {} failed, {} suspended",
        summary.pushed, summary.unchanged, summary.failed, summary.suspended
    );
    summary.failed == 0
}

async fn run_loop(scheduler: &Scheduler, loader: ConfigLoader, interval: Duration) {
    info!("Running passes every {}s", interval.as_secs());

    let run = scheduler.run(interval, move || loader.load());
    tokio::pin!(run);

    tokio::select! {
        _ = &mut run => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown requested, finishing the current pass");
            scheduler.stop();
            run.await;
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.log_format) {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting autopush v{}", env!("CARGO_PKG_VERSION"));

    let loader = ConfigLoader::new(&cli.config);
    let config = match loader.load() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {:?}: {}", cli.config, e);
            return ExitCode::FAILURE;
        }
    };

    let engine = match build_engine(&cli.config, config.settings()) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Failed to create engine: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let ok = match cli.command {
        Command::Plan => plan(&engine, &config).await,
        Command::Run { once, interval } => {
            let scheduler = Scheduler::new(Arc::new(engine));
            if once {
                run_once(&scheduler, &config).await
            } else {
                let interval = interval
                    .filter(|i| *i > 0)
                    .map(Duration::from_secs)
                    .unwrap_or_else(|| pass_interval(&config));
                run_loop(&scheduler, loader, interval).await;
                true
            }
        }
    };

    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
