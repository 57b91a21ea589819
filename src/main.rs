mod capture_dir;
mod command;
mod config;
mod disk;
mod logging;
mod signals;
mod supervisor;

use capture_dir::{CaptureDir, CaptureDirError};
use clap::Parser;
use config::{CaptureConfig, ConfigError};
use disk::{DiskError, FsProbe};
use logging::JobLogger;
use signals::SignalHandler;
use std::path::PathBuf;
use std::process::ExitCode;
use supervisor::{CaptureJob, DurationPolicy, Supervisor, SupervisorError};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

/// Run a wireless capture utility for a fixed time or until disk space runs
/// low, keeping every run's output in its own timestamped folder.
#[derive(Parser, Debug)]
#[command(name = "capture-supervisor", version, about)]
pub struct Cli {
    /// Config file path (.json, or .toml)
    #[arg(short, long, default_value = "utility_config.json")]
    config: PathBuf,

    /// Directory the timestamped capture folder is created in
    #[arg(short, long, default_value = ".")]
    output_root: PathBuf,

    /// Capture utility to run
    #[arg(long, default_value = command::DEFAULT_CAPTURE_BINARY)]
    capture_binary: String,

    /// Monitor-mode interface (overrides config)
    #[arg(short, long)]
    interface: Option<String>,

    /// Capture duration in seconds, or "infinite" (overrides config)
    #[arg(short, long)]
    duration: Option<DurationPolicy>,

    /// Resolve config and print the capture command, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (disk polls, stop protocol details)
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::DEBUG
        } else if self.quiet {
            LevelFilter::WARN
        } else {
            LevelFilter::INFO
        }
    }
}

/// Fatal conditions, each mapped to its own exit code.
#[derive(Debug)]
enum AppError {
    Config(ConfigError),
    CaptureDir(CaptureDirError),
    LogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    Disk(DiskError),
    Signals(std::io::Error),
    Supervisor(SupervisorError),
}

impl AppError {
    fn exit_code(&self) -> u8 {
        match self {
            AppError::Config(_) | AppError::CaptureDir(_) | AppError::LogFile { .. } => 2,
            AppError::Disk(_) => 3,
            AppError::Signals(_) | AppError::Supervisor(SupervisorError::Launch { .. }) => 4,
            AppError::Supervisor(SupervisorError::ForcedKill { .. }) => 5,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Config(e) => e.fmt(f),
            AppError::CaptureDir(e) => e.fmt(f),
            AppError::LogFile { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
            AppError::Disk(e) => e.fmt(f),
            AppError::Signals(e) => write!(f, "failed to install signal handlers: {e}"),
            AppError::Supervisor(e) => e.fmt(f),
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::Config(e)
    }
}

impl From<CaptureDirError> for AppError {
    fn from(e: CaptureDirError) -> Self {
        AppError::CaptureDir(e)
    }
}

impl From<DiskError> for AppError {
    fn from(e: DiskError) -> Self {
        AppError::Disk(e)
    }
}

impl From<SupervisorError> for AppError {
    fn from(e: SupervisorError) -> Self {
        AppError::Supervisor(e)
    }
}

/// Load the config file and layer the CLI overrides on top.
fn resolve_config(cli: &Cli) -> Result<CaptureConfig, AppError> {
    let mut config = config::load_config(&cli.config)?;
    config.apply_overrides(cli.interface.clone(), cli.duration);
    config
        .validate()
        .map_err(|message| ConfigError::Invalid {
            path: cli.config.clone(),
            message,
        })?;
    Ok(config)
}

fn print_dry_run(cli: &Cli, config: &CaptureConfig) {
    let folder = cli.output_root.join(capture_dir::folder_name(
        capture_dir::FOLDER_PREFIX,
        chrono::Local::now().naive_local(),
    ));
    let cmd = command::build_command(
        &cli.capture_binary,
        config,
        &folder.join(&config.output_prefix),
    );

    println!("capture-supervisor v{}", env!("CARGO_PKG_VERSION"));
    println!("Config file:     {}", cli.config.display());
    println!("Interface:       {}", config.interface);
    println!("Duration:        {}", config.duration);
    println!("Min free space:  {} MB", config.min_free_space_mb);
    println!("Space check:     every {}s", config.space_check_interval);
    println!("Capture folder:  {}", folder.display());
    println!("Command:         {}", cmd.join(" "));
    println!("Dry run: config validated, not running.");
}

/// Everything after the capture folder exists; logs go to the job's logger.
async fn capture(
    cli: &Cli,
    config: &CaptureConfig,
    dir: &CaptureDir,
    logger: &JobLogger,
) -> Result<(), AppError> {
    info!(log = %logger.path().display(), "capture session starting");

    disk::preflight(&FsProbe, dir.root(), config.min_free_space_mb)?;

    let command = command::build_command(
        &cli.capture_binary,
        config,
        &dir.output_base(&config.output_prefix),
    );
    let job = CaptureJob {
        command,
        working_folder: dir.root().to_path_buf(),
        duration: config.duration,
        disk: config.disk_policy(),
        stderr_log: Some(dir.stderr_file()),
    };

    let signals = SignalHandler::install(CancellationToken::new()).map_err(AppError::Signals)?;
    let supervisor = Supervisor::new(logger.clone(), signals.token().clone());
    let outcome = supervisor.run(job).await?;

    match dir.artifacts() {
        Ok(artifacts) => {
            for artifact in artifacts {
                info!(file = %artifact.name, bytes = artifact.bytes, "capture artifact");
            }
        }
        Err(e) => tracing::warn!(error = %e, "failed to list capture folder"),
    }

    info!(
        folder = %dir.root().display(),
        reason = %outcome.reason,
        stop_path = ?outcome.stop_path,
        exit_code = ?outcome.exit_code,
        pid = outcome.pid,
        elapsed_secs = outcome.elapsed.as_secs(),
        "capture complete"
    );
    Ok(())
}

async fn run(cli: &Cli) -> Result<(), AppError> {
    let config = resolve_config(cli).inspect_err(|e| error!("{e}"))?;

    if cli.dry_run {
        print_dry_run(cli, &config);
        return Ok(());
    }

    let dir = CaptureDir::create(&cli.output_root).inspect_err(|e| error!("{e}"))?;
    let log_file = dir.log_file();
    let logger = JobLogger::create(&log_file, cli.log_level())
        .map_err(|source| AppError::LogFile {
            path: log_file,
            source,
        })
        .inspect_err(|e| error!("{e}"))?;

    let dispatch = logger.dispatch().clone();
    async { capture(cli, &config, &dir, &logger).await.inspect_err(|e| error!("{e}")) }
        .with_subscriber(dispatch)
        .await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let console = logging::console_dispatch(cli.log_level());
    let _guard = tracing::dispatcher::set_default(&console);
    tracing::debug!(?cli, "parsed CLI arguments");

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => ExitCode::from(e.exit_code()),
    }
}
