/// Tracing setup: a console-only dispatcher for start-up, and a job-scoped
/// dispatcher that also writes the run log inside the capture folder.
///
/// Neither is installed as the global default. Callers scope them with
/// `tracing::dispatcher::set_default` or `WithSubscriber::with_subscriber`.
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` wins over the level picked on the command line.
fn env_filter(level: LevelFilter) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy()
}

/// Console output is the bare message plus structured fields.
fn console_layer<S>() -> impl tracing_subscriber::Layer<S>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fmt::layer()
        .without_time()
        .with_level(false)
        .with_target(false)
}

/// Dispatcher used before the capture folder (and its log file) exists.
pub fn console_dispatch(level: LevelFilter) -> Dispatch {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(level))
        .with(console_layer());
    Dispatch::new(subscriber)
}

/// Logger for a single capture job: console plus `capture.log`.
#[derive(Clone)]
pub struct JobLogger {
    dispatch: Dispatch,
    path: PathBuf,
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger").field("path", &self.path).finish()
    }
}

impl JobLogger {
    /// Open (append) the run log at `log_file` and build the job's dispatcher.
    pub fn create(log_file: &Path, level: LevelFilter) -> std::io::Result<Self> {
        let file = File::options().create(true).append(true).open(log_file)?;
        let file_layer = fmt::layer()
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .with_target(false);

        let subscriber = tracing_subscriber::registry()
            .with(env_filter(level))
            .with(console_layer())
            .with(file_layer);

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            path: log_file.to_path_buf(),
        })
    }

    /// Logger that discards everything.
    #[cfg(test)]
    pub fn none() -> Self {
        Self {
            dispatch: Dispatch::none(),
            path: PathBuf::new(),
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
