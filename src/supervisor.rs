/// Capture process lifecycle: launch the capture utility, wait for a stop
/// condition (fixed duration, low disk space, interrupt, or the process
/// exiting by itself), then bring it down with SIGTERM and, if needed, SIGKILL.
use crate::disk::{DiskProbe, FsProbe};
use crate::logging::JobLogger;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{debug, info, warn};

/// How long the process gets to exit after SIGTERM before it is killed.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

const INFINITE: &str = "infinite";

/// How long a capture runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawDuration")]
pub enum DurationPolicy {
    /// Stop after this many seconds (always > 0).
    Fixed(u32),
    /// Run until disk space runs low or the run is interrupted.
    Indefinite,
}

/// Config-file shape of `duration`: a number, or a string holding a number or `"infinite"`.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

impl TryFrom<RawDuration> for DurationPolicy {
    type Error = String;

    fn try_from(raw: RawDuration) -> Result<Self, Self::Error> {
        match raw {
            RawDuration::Secs(secs) => fixed_secs(secs),
            RawDuration::Text(text) => text.parse(),
        }
    }
}

fn fixed_secs(secs: u64) -> Result<DurationPolicy, String> {
    match u32::try_from(secs) {
        Ok(0) => Err("duration must be a positive number of seconds".to_string()),
        Ok(secs) => Ok(DurationPolicy::Fixed(secs)),
        Err(_) => Err(format!("duration {secs} is too large")),
    }
}

impl FromStr for DurationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == INFINITE {
            return Ok(DurationPolicy::Indefinite);
        }
        let secs: u64 = s
            .trim()
            .parse()
            .map_err(|_| format!("duration {s:?} is neither a number of seconds nor {INFINITE:?}"))?;
        fixed_secs(secs)
    }
}

impl std::fmt::Display for DurationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DurationPolicy::Fixed(secs) => write!(f, "{secs}s"),
            DurationPolicy::Indefinite => f.write_str(INFINITE),
        }
    }
}

/// Disk budget enforced while running indefinitely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskPolicy {
    pub min_free_mb: u64,
    pub poll_interval_secs: u32,
}

/// Everything needed to run one capture.
#[derive(Debug, Clone)]
pub struct CaptureJob {
    /// Executable followed by its arguments.
    pub command: Vec<String>,
    /// Working directory of the process; also where free space is measured.
    pub working_folder: PathBuf,
    pub duration: DurationPolicy,
    pub disk: DiskPolicy,
    /// Where the process's stderr goes. Discarded when `None`.
    pub stderr_log: Option<PathBuf>,
}

/// Why a capture ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    DurationElapsed,
    LowDiskSpace,
    ExternalInterrupt,
    ProcessExitedOnItsOwn,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            StopReason::DurationElapsed => "duration_elapsed",
            StopReason::LowDiskSpace => "low_disk_space",
            StopReason::ExternalInterrupt => "external_interrupt",
            StopReason::ProcessExitedOnItsOwn => "process_exited_on_its_own",
        })
    }
}

/// Which branch of the stop protocol ended the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopPath {
    Graceful,
    Forced,
}

/// Result of a supervised capture.
#[derive(Debug)]
pub struct RunOutcome {
    pub reason: StopReason,
    /// `None` when the process had already exited and no signal was sent.
    pub stop_path: Option<StopPath>,
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    pub pid: u32,
    pub elapsed: Duration,
}

#[derive(Debug)]
pub enum SupervisorError {
    /// The capture process could not be started.
    Launch {
        command: String,
        source: std::io::Error,
    },
    /// SIGKILL could not be delivered, or the killed process could not be reaped.
    ForcedKill { pid: u32, source: std::io::Error },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Launch { command, source } => {
                write!(f, "failed to launch capture process `{}`: {}", command, source)
            }
            SupervisorError::ForcedKill { pid, source } => {
                write!(f, "failed to kill capture process {}: {}", pid, source)
            }
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::Launch { source, .. } => Some(source),
            SupervisorError::ForcedKill { source, .. } => Some(source),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandleState {
    Running,
    Terminating,
    Stopped,
}

/// The running capture process. Owned by exactly one supervisor run.
struct ProcessHandle {
    child: Child,
    pid: u32,
    state: HandleState,
    exit_code: Option<i32>,
}

impl ProcessHandle {
    fn spawn(job: &CaptureJob) -> Result<Self, SupervisorError> {
        let launch_err = |source: std::io::Error| SupervisorError::Launch {
            command: job.command.join(" "),
            source,
        };

        let (program, args) = job.command.split_first().ok_or_else(|| {
            launch_err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command",
            ))
        })?;

        let stderr = match &job.stderr_log {
            Some(path) => Stdio::from(std::fs::File::create(path).map_err(launch_err)?),
            None => Stdio::null(),
        };

        let child = Command::new(program)
            .args(args)
            .current_dir(&job.working_folder)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(stderr)
            .process_group(0) // New process group so signals reach the whole tree
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_err)?;

        // `None` only after the child is reaped, so never before the first wait.
        let pid = child.id().ok_or_else(|| {
            launch_err(std::io::Error::other("capture process has no pid after spawn"))
        })?;
        Ok(Self {
            child,
            pid,
            state: HandleState::Running,
            exit_code: None,
        })
    }

    fn pgid(&self) -> Pid {
        Pid::from_raw(self.pid as i32)
    }

    fn mark_stopped(&mut self, status: ExitStatus) {
        self.state = HandleState::Stopped;
        self.exit_code = status.code();
    }

    /// Non-blocking liveness probe.
    fn has_exited(&mut self) -> bool {
        if self.state == HandleState::Stopped {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.mark_stopped(status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "liveness probe failed");
                false
            }
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait for exit.
    ///
    /// Returns `None` if the process had already exited. Safe to call repeatedly.
    async fn stop(&mut self, grace: Duration) -> Result<Option<StopPath>, SupervisorError> {
        if self.has_exited() {
            debug!(pid = self.pid, "capture process already exited, nothing to stop");
            return Ok(None);
        }

        self.state = HandleState::Terminating;
        info!(pid = self.pid, "sending SIGTERM to capture process");

        let exited_gracefully = match killpg(self.pgid(), Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {
                match tokio::time::timeout(grace, self.child.wait()).await {
                    Ok(Ok(status)) => {
                        self.mark_stopped(status);
                        true
                    }
                    Ok(Err(e)) => {
                        warn!(pid = self.pid, error = %e, "waiting after SIGTERM failed");
                        false
                    }
                    Err(_) => {
                        warn!(
                            pid = self.pid,
                            grace_ms = grace.as_millis() as u64,
                            "capture process still running after grace period"
                        );
                        false
                    }
                }
            }
            Err(e) => {
                warn!(pid = self.pid, error = %e, "SIGTERM failed");
                false
            }
        };

        if exited_gracefully {
            info!(pid = self.pid, exit_code = ?self.exit_code, "capture process stopped gracefully");
            return Ok(Some(StopPath::Graceful));
        }

        warn!(pid = self.pid, "forcing kill on capture process");
        match killpg(self.pgid(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                warn!(pid = self.pid, error = %e, "SIGKILL to process group failed, killing child directly");
                self.child
                    .start_kill()
                    .map_err(|source| SupervisorError::ForcedKill {
                        pid: self.pid,
                        source,
                    })?;
            }
        }

        let status = self
            .child
            .wait()
            .await
            .map_err(|source| SupervisorError::ForcedKill {
                pid: self.pid,
                source,
            })?;
        self.mark_stopped(status);
        info!(pid = self.pid, "capture process killed");
        Ok(Some(StopPath::Forced))
    }
}

/// Runs capture jobs to completion.
///
/// Each run launches exactly one process and does not return `Ok` until that
/// process is gone. Logging goes through the injected `JobLogger`.
pub struct Supervisor {
    logger: JobLogger,
    cancel: CancellationToken,
    probe: Arc<dyn DiskProbe + Send + Sync>,
    grace_period: Duration,
}

impl Supervisor {
    /// `cancel` aborts the current wait and moves straight to the stop protocol.
    pub fn new(logger: JobLogger, cancel: CancellationToken) -> Self {
        Self {
            logger,
            cancel,
            probe: Arc::new(FsProbe),
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    #[cfg(test)]
    pub fn with_probe(mut self, probe: Arc<dyn DiskProbe + Send + Sync>) -> Self {
        self.probe = probe;
        self
    }

    #[cfg(test)]
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Launch `job`, wait for a stop condition, and stop the process.
    pub async fn run(&self, job: CaptureJob) -> Result<RunOutcome, SupervisorError> {
        let dispatch = self.logger.dispatch().clone();
        self.supervise(job).with_subscriber(dispatch).await
    }

    async fn supervise(&self, job: CaptureJob) -> Result<RunOutcome, SupervisorError> {
        info!(
            command = %job.command.join(" "),
            folder = %job.working_folder.display(),
            duration = %job.duration,
            "starting capture process"
        );

        let start = Instant::now();
        let mut handle = ProcessHandle::spawn(&job)?;
        info!(pid = handle.pid, "capture process started");

        let reason = match job.duration {
            DurationPolicy::Fixed(secs) => self.wait_fixed(secs, &mut handle).await,
            DurationPolicy::Indefinite => self.wait_indefinite(&job, &mut handle).await,
        };
        info!(pid = handle.pid, reason = %reason, "stop condition reached");

        let stop_path = handle.stop(self.grace_period).await?;
        let elapsed = start.elapsed();

        info!(
            reason = %reason,
            stop_path = ?stop_path,
            exit_code = ?handle.exit_code,
            elapsed_secs = elapsed.as_secs(),
            "capture process stopped"
        );

        Ok(RunOutcome {
            reason,
            stop_path,
            exit_code: handle.exit_code,
            pid: handle.pid,
            elapsed,
        })
    }

    /// Sleep for the full duration, then check whether the process is still there.
    async fn wait_fixed(&self, secs: u32, handle: &mut ProcessHandle) -> StopReason {
        info!(duration_secs = secs, "capturing for a fixed duration");
        tokio::select! {
            _ = self.cancel.cancelled() => return StopReason::ExternalInterrupt,
            _ = tokio::time::sleep(Duration::from_secs(secs.into())) => {}
        }

        if handle.has_exited() {
            warn!(pid = handle.pid, exit_code = ?handle.exit_code, "capture process exited before the duration elapsed");
            StopReason::ProcessExitedOnItsOwn
        } else {
            StopReason::DurationElapsed
        }
    }

    /// Poll free space until it drops below the minimum. No wall-clock bound.
    async fn wait_indefinite(&self, job: &CaptureJob, handle: &mut ProcessHandle) -> StopReason {
        let DiskPolicy {
            min_free_mb,
            poll_interval_secs,
        } = job.disk;
        info!(
            poll_interval_secs,
            min_free_mb, "running indefinitely, checking disk space periodically"
        );

        let interval = Duration::from_secs(poll_interval_secs.into());
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StopReason::ExternalInterrupt,
                _ = tokio::time::sleep(interval) => {}
            }

            if handle.has_exited() {
                warn!(pid = handle.pid, exit_code = ?handle.exit_code, "capture process exited on its own");
                return StopReason::ProcessExitedOnItsOwn;
            }

            match self.probe.free_mb(&job.working_folder) {
                Ok(free_mb) if free_mb < min_free_mb => {
                    warn!(free_mb, min_free_mb, "insufficient disk space, stopping capture");
                    return StopReason::LowDiskSpace;
                }
                Ok(free_mb) => debug!(free_mb, min_free_mb, "disk space check passed"),
                Err(e) => warn!(error = %e, "disk space check failed, retrying at next poll"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::tests::ScriptedProbe;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn job(dir: &Path, command: &[&str], duration: DurationPolicy) -> CaptureJob {
        CaptureJob {
            command: command.iter().map(|s| s.to_string()).collect(),
            working_folder: dir.to_path_buf(),
            duration,
            disk: DiskPolicy {
                min_free_mb: 100,
                poll_interval_secs: 1,
            },
            stderr_log: None,
        }
    }

    fn supervisor(cancel: CancellationToken, readings: &[u64]) -> Supervisor {
        Supervisor::new(JobLogger::none(), cancel).with_probe(Arc::new(ScriptedProbe::new(readings)))
    }

    /// Supervisor whose events land in `<dir>/capture.log`.
    fn logged_supervisor(dir: &Path) -> (Supervisor, PathBuf) {
        let log = dir.join("capture.log");
        let logger =
            JobLogger::create(&log, tracing_subscriber::filter::LevelFilter::INFO).unwrap();
        let sup = Supervisor::new(logger, CancellationToken::new())
            .with_probe(Arc::new(ScriptedProbe::new(&[1000])));
        (sup, log)
    }

    fn is_alive(pid: u32) -> bool {
        nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    /// Errors on the first query, then reports `free_mb`.
    struct FlakyProbe {
        calls: AtomicU32,
        free_mb: u64,
    }

    impl DiskProbe for FlakyProbe {
        fn free_mb(&self, _path: &Path) -> std::io::Result<u64> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(std::io::Error::other("transient statvfs failure"))
            } else {
                Ok(self.free_mb)
            }
        }
    }

    #[test]
    fn test_duration_policy_from_str() {
        assert_eq!("infinite".parse::<DurationPolicy>(), Ok(DurationPolicy::Indefinite));
        assert_eq!("15".parse::<DurationPolicy>(), Ok(DurationPolicy::Fixed(15)));
        assert!("0".parse::<DurationPolicy>().is_err());
        assert!("soon".parse::<DurationPolicy>().is_err());
        assert!("-5".parse::<DurationPolicy>().is_err());
        assert!("99999999999".parse::<DurationPolicy>().is_err());
    }

    #[test]
    fn test_duration_policy_display() {
        assert_eq!(DurationPolicy::Fixed(30).to_string(), "30s");
        assert_eq!(DurationPolicy::Indefinite.to_string(), "infinite");
    }

    #[test]
    fn test_stop_reason_display() {
        assert_eq!(StopReason::LowDiskSpace.to_string(), "low_disk_space");
        assert_eq!(
            StopReason::ProcessExitedOnItsOwn.to_string(),
            "process_exited_on_its_own"
        );
    }

    #[tokio::test]
    async fn test_fixed_child_exits_before_duration() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let outcome = sup
            .run(job(dir.path(), &["sh", "-c", "exit 3"], DurationPolicy::Fixed(1)))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::ProcessExitedOnItsOwn);
        assert_eq!(outcome.stop_path, None);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[tokio::test]
    async fn test_fixed_duration_elapsed_stops_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Fixed(1)))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::DurationElapsed);
        assert_eq!(outcome.stop_path, Some(StopPath::Graceful));
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.pid > 0);
        assert!(!is_alive(outcome.pid));
        assert!(outcome.elapsed >= Duration::from_millis(900));
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_forced_kill_when_sigterm_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000])
            .with_grace_period(Duration::from_millis(300));

        let outcome = sup
            .run(job(
                dir.path(),
                &["sh", "-c", "trap '' TERM; sleep 30"],
                DurationPolicy::Fixed(1),
            ))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::DurationElapsed);
        assert_eq!(outcome.stop_path, Some(StopPath::Forced));
        assert!(!is_alive(outcome.pid));
        assert!(outcome.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_graceful_stop_is_logged() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, log) = logged_supervisor(dir.path());

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Fixed(1)))
            .await
            .unwrap();
        assert_eq!(outcome.stop_path, Some(StopPath::Graceful));

        let contents = std::fs::read_to_string(&log).unwrap();
        assert!(contents.contains("capture process started"));
        assert!(contents.contains("reason=duration_elapsed"));
        assert!(contents.contains("sending SIGTERM"));
        assert!(contents.contains("stopped gracefully"));
        assert!(!contents.contains("forcing kill"));
        assert!(!contents.contains("WARN"));
    }

    #[tokio::test]
    async fn test_forced_kill_is_logged_as_warning() {
        let dir = tempfile::tempdir().unwrap();
        let (sup, log) = logged_supervisor(dir.path());
        let sup = sup.with_grace_period(Duration::from_millis(300));

        let outcome = sup
            .run(job(
                dir.path(),
                &["sh", "-c", "trap '' TERM; sleep 30"],
                DurationPolicy::Fixed(1),
            ))
            .await
            .unwrap();
        assert_eq!(outcome.stop_path, Some(StopPath::Forced));

        let contents = std::fs::read_to_string(&log).unwrap();
        let timeout_line = contents
            .lines()
            .find(|line| line.contains("still running after grace period"))
            .expect("grace period timeout logged");
        assert!(timeout_line.contains("WARN"));
        assert!(contents.contains("forcing kill"));
        assert!(contents.contains("capture process killed"));
        assert!(!contents.contains("stopped gracefully"));
    }

    #[tokio::test]
    async fn test_interrupt_during_fixed_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sup = supervisor(cancel.clone(), &[1000]);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Fixed(60)))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::ExternalInterrupt);
        assert_eq!(outcome.stop_path, Some(StopPath::Graceful));
        assert!(!is_alive(outcome.pid));
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_during_indefinite_wait() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let sup = supervisor(cancel.clone(), &[1000]);

        let mut capture = job(dir.path(), &["sleep", "30"], DurationPolicy::Indefinite);
        capture.disk.poll_interval_secs = 60;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        });

        let outcome = sup.run(capture).await.unwrap();
        assert_eq!(outcome.reason, StopReason::ExternalInterrupt);
        assert!(!is_alive(outcome.pid));
        assert!(outcome.elapsed < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_interrupt_before_run_still_stops_child() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let sup = supervisor(cancel, &[1000]);

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Fixed(60)))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::ExternalInterrupt);
        assert!(outcome.stop_path.is_some());
        assert!(!is_alive(outcome.pid));
    }

    #[tokio::test]
    async fn test_low_disk_space_stops_on_sixth_poll() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(ScriptedProbe::new(&[500, 500, 500, 500, 500, 50]));
        let sup = Supervisor::new(JobLogger::none(), CancellationToken::new())
            .with_probe(probe.clone());

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Indefinite))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::LowDiskSpace);
        assert_eq!(outcome.stop_path, Some(StopPath::Graceful));
        assert_eq!(probe.calls(), 6);
        assert!(outcome.elapsed >= Duration::from_secs(6));
        assert!(outcome.elapsed < Duration::from_secs(15));
        assert!(!is_alive(outcome.pid));
    }

    #[tokio::test]
    async fn test_free_space_at_threshold_keeps_running() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(ScriptedProbe::new(&[100, 99]));
        let sup = Supervisor::new(JobLogger::none(), CancellationToken::new())
            .with_probe(probe.clone());

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Indefinite))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::LowDiskSpace);
        assert_eq!(probe.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_disk_query_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(FlakyProbe {
            calls: AtomicU32::new(0),
            free_mb: 10,
        });
        let sup = Supervisor::new(JobLogger::none(), CancellationToken::new())
            .with_probe(probe.clone());

        let outcome = sup
            .run(job(dir.path(), &["sleep", "30"], DurationPolicy::Indefinite))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::LowDiskSpace);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_indefinite_child_exits_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let probe = Arc::new(ScriptedProbe::new(&[1000]));
        let sup = Supervisor::new(JobLogger::none(), CancellationToken::new())
            .with_probe(probe.clone());

        let outcome = sup
            .run(job(dir.path(), &["sh", "-c", "exit 0"], DurationPolicy::Indefinite))
            .await
            .unwrap();

        assert_eq!(outcome.reason, StopReason::ProcessExitedOnItsOwn);
        assert_eq!(outcome.stop_path, None);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let err = sup
            .run(job(dir.path(), &["nonexistent-binary-xyz", "mon0"], DurationPolicy::Fixed(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, SupervisorError::Launch { .. }));
        assert!(err.to_string().contains("nonexistent-binary-xyz mon0"));
    }

    #[tokio::test]
    async fn test_launch_failure_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let err = sup
            .run(job(dir.path(), &[], DurationPolicy::Fixed(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_launch_failure_missing_working_folder() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let err = sup
            .run(job(&dir.path().join("gone"), &["sleep", "1"], DurationPolicy::Fixed(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_runs_in_working_folder_and_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let folder = std::fs::canonicalize(dir.path()).unwrap();
        let stderr_log = folder.join("capture.stderr");
        let sup = supervisor(CancellationToken::new(), &[1000]);

        let mut capture = job(
            &folder,
            &["sh", "-c", "pwd > where.txt; echo oops >&2"],
            DurationPolicy::Fixed(1),
        );
        capture.stderr_log = Some(stderr_log.clone());

        let outcome = sup.run(capture).await.unwrap();
        assert_eq!(outcome.reason, StopReason::ProcessExitedOnItsOwn);

        let cwd = std::fs::read_to_string(folder.join("where.txt")).unwrap();
        assert_eq!(Path::new(cwd.trim()), folder);
        let stderr = std::fs::read_to_string(&stderr_log).unwrap();
        assert_eq!(stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let capture = job(dir.path(), &["sleep", "30"], DurationPolicy::Fixed(1));
        let mut handle = ProcessHandle::spawn(&capture).unwrap();
        assert!(handle.pid > 0);
        assert!(!handle.has_exited());

        let first = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(first, Some(StopPath::Graceful));
        assert_eq!(handle.state, HandleState::Stopped);

        let second = handle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(second, None);
        assert!(!is_alive(handle.pid));
    }

    /// Zombies count as gone: reaping a reparented grandchild is not our job.
    #[cfg(target_os = "linux")]
    fn is_running(pid: u32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_stop_kills_whole_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let folder = std::fs::canonicalize(dir.path()).unwrap();
        let capture = job(
            &folder,
            &["sh", "-c", "sleep 30 & echo $! > grandchild.pid; wait"],
            DurationPolicy::Fixed(1),
        );
        let mut handle = ProcessHandle::spawn(&capture).unwrap();

        let pid_file = folder.join("grandchild.pid");
        let mut grandchild = None;
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(&pid_file) {
                if let Ok(pid) = text.trim().parse::<u32>() {
                    grandchild = Some(pid);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let grandchild = grandchild.expect("grandchild pid written");

        handle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(!is_alive(handle.pid));

        let mut gone = false;
        for _ in 0..50 {
            if !is_running(grandchild) {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(gone, "grandchild {grandchild} survived the stop protocol");
    }
}
