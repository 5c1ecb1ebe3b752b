pub mod camera;
pub mod config;
pub mod control;
pub mod error;
pub mod metrics;
pub mod settings;
pub mod store;
pub mod tracking;
pub mod utils;

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info};

use camera::{BuiltinCameras, CameraProvider};
use config::RunConfig;
use control::RunController;
use settings::{AgentSettings, SettingsStore};
use tracking::TrackerRegistry;

#[derive(Debug, Parser)]
#[command(name = "ethotrack", version, about = "Camera acquisition, tracking and persistence agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run until the source ends, the run fails or Ctrl-C. A run interrupted
    /// by a crash is resumed first.
    Run {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        settings: Option<PathBuf>,
    },
    /// Validate a run configuration without touching any camera.
    Check {
        #[arg(long)]
        config: PathBuf,
    },
    /// Print a summary of an existing result store.
    Inspect {
        #[arg(long)]
        store: PathBuf,
    },
}

pub fn run() {
    // Initialize logging (reads RUST_LOG env var)
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run { config, settings } => run_agent(config, settings),
        Command::Check { config } => check_config(&config),
        Command::Inspect { store } => inspect_store(&store),
    };

    if let Err(err) = result {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn load_settings(path: Option<PathBuf>) -> Result<AgentSettings> {
    let settings = match path {
        Some(path) => SettingsStore::new(path)?.settings(),
        None => AgentSettings::default(),
    };
    Ok(settings.with_env_overrides())
}

fn load_config(path: &Path) -> Result<RunConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read run configuration {}", path.display()))?;
    Ok(RunConfig::from_json(&raw)?)
}

fn run_agent(config: Option<PathBuf>, settings: Option<PathBuf>) -> Result<()> {
    let settings = load_settings(settings)?;
    let config = config.as_deref().map(load_config).transpose()?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build the async runtime")?;

    runtime.block_on(supervise_run(settings, config))
}

async fn supervise_run(settings: AgentSettings, config: Option<RunConfig>) -> Result<()> {
    info!("ethotrack {} starting on {}", env!("CARGO_PKG_VERSION"), settings.machine_name);
    let controller = RunController::new(settings);

    let resumed = controller.resume_pending().await?;
    match (resumed, config) {
        (Some(status), _) => {
            info!(
                "resumed interrupted run as {}",
                status.session.run_id.as_deref().unwrap_or("-")
            );
        }
        (None, Some(config)) => {
            controller.start(config).await?;
        }
        (None, None) => bail!("no interrupted run to resume and no --config given"),
    }

    let mut rx = controller.subscribe();
    loop {
        if rx.borrow_and_update().status.is_terminal() {
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; stopping run");
                break;
            }
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let status = controller.stop().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    if let Some(diagnostic) = status.session.last_error {
        bail!("run ended with {}: {}", diagnostic.kind.as_str(), diagnostic.message);
    }
    Ok(())
}

fn check_config(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    config.validate()?;
    let tracker = TrackerRegistry::with_builtins().build(&config.tracker)?;
    let strategies = BuiltinCameras.strategies(&config.camera)?;

    let backends: Vec<&str> = strategies.iter().map(|factory| factory.name()).collect();
    println!(
        "ok: {} regions, tracker '{}' ({} columns), backends [{}], store {} ({})",
        config.regions.len(),
        tracker.name(),
        tracker.columns().len(),
        backends.join(", "),
        config.result_store.path.display(),
        config.result_store.mode.as_str()
    );
    Ok(())
}

fn inspect_store(path: &Path) -> Result<()> {
    let summary = store::summarize_store(path)?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
