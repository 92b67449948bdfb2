mod backend;
mod cli;
mod console;
mod error_fmt;
mod workflow;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use eyre::{Result, WrapErr};
use senscal_config::{Config, Logging};
use senscal_core::NextState;
use senscal_hardware::JsonFileStore;
use senscal_traits::WorkflowStore;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::backend::Backend;
use crate::cli::{Cli, Commands, DriveOpts, JSON_MODE};
use crate::console::Console;
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};
use crate::workflow::{Workflow, parse_skips, print_status, seed_wipe_flag};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Console logs on stderr; optional JSON-lines log file from `[logging]`.
/// The returned guard must live until exit or buffered file logs are lost.
fn init_tracing(cli: &Cli, logging: Option<&Logging>) -> Result<Option<WorkerGuard>> {
    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| filter(&cli.log_level));
    let console: BoxedLayer = if cli.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter)
            .boxed()
    };

    let mut layers: Vec<BoxedLayer> = vec![console];
    let mut guard = None;
    if let Some((logging, file)) = logging.and_then(|l| l.file.as_deref().map(|f| (l, f))) {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .wrap_err_with(|| format!("create log directory {}", dir.display()))?;
        let name = path
            .file_name()
            .ok_or_else(|| eyre::eyre!("logging.file `{file}` has no file name"))?;
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, g) = tracing_appender::non_blocking(appender);
        guard = Some(g);
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter(logging.level.as_deref().unwrap_or("info")))
                .boxed(),
        );
    }

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry().with(layers).try_init();
    Ok(guard)
}

fn load_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("read config {}", path.display()))?;
    let cfg = senscal_config::load_toml(&text)
        .wrap_err_with(|| format!("parse config {}", path.display()))?;
    cfg.validate().wrap_err("invalid configuration")?;
    Ok(cfg)
}

fn open_store(cfg: &Config) -> Result<Arc<dyn WorkflowStore>> {
    let path = &cfg.store.workflow_path;
    let store = JsonFileStore::open(path)
        .wrap_err_with(|| format!("open workflow store {}", path.display()))?;
    Ok(Arc::new(store))
}

fn drive(
    cfg: &Config,
    console: Console,
    opts: DriveOpts,
    skip: &[String],
    resume: bool,
) -> Result<()> {
    let skip = parse_skips(skip)?;
    let store = open_store(cfg)?;
    seed_wipe_flag(store.as_ref(), cfg.workflow.wipe_device)?;
    let backend = Backend::from_config(cfg)?;
    tracing::info!(sensors = backend.sensors.len(), "sensor back-end ready");

    let mut workflow = Workflow::new(cfg, &backend, store, console, opts, skip)?;
    let start = if resume {
        workflow.resume()?
    } else {
        NextState::CheckCalibration
    };
    let summary = workflow.drive(start)?;
    tracing::info!(next = %summary.next, rounds = summary.rounds, "calibration workflow finished");
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli.config);
    let _guard = init_tracing(&cli, cfg.as_ref().ok().map(|c| &c.logging))?;
    let cfg = cfg?;
    let console = Console::new(cli.json);
    tracing::debug!(config = %cli.config.display(), "configuration loaded");

    match cli.cmd {
        Commands::Status => print_status(open_store(&cfg)?.as_ref(), &console),
        Commands::Probe => {
            let backend = Backend::from_config(&cfg)?;
            console.sensors(&backend.sensors);
            Ok(())
        }
        Commands::Calibrate { drive: opts, skip } => drive(&cfg, console, opts, &skip, false),
        Commands::Resume { drive: opts } => drive(&cfg, console, opts, &[], true),
    }
}

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    if let Err(e) = color_eyre::install() {
        eprintln!("error hook not installed: {e}");
    }

    if let Err(err) = run(cli) {
        if JSON_MODE.get().copied().unwrap_or(false) {
            println!("{}", format_error_json(&err));
        } else {
            eprintln!("{}", humanize(&err));
        }
        std::process::exit(exit_code_for_error(&err));
    }
}
