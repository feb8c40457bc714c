use crate::jobs::registry::Job;
use crate::jobs::store::{
    is_valid_job_name, JobRunState, MarkerKind, MarkerStore, RunningMarker, StoreError,
};
use crate::metrics::Metrics;
use std::collections::HashSet;
use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 8 * 1024;
const DRAIN_GRACE: Duration = Duration::from_secs(2);
const KILL_GRACE: Duration = Duration::from_secs(2);
// The shell execs its positional arguments, so every token reaches the
// program verbatim. No tokens means a no-op that exits 0.
const EXEC_ARGV: &str = r#"exec "$@""#;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("задача '{name}' уже выполняется")]
    AlreadyRunning { name: String },
    #[error("неизвестная задача '{0}'")]
    UnknownJob(String),
    #[error("достигнут лимит одновременно выполняемых задач ({limit})")]
    AtCapacity { limit: usize },
    #[error("не удалось запустить задачу '{name}': {source}")]
    Spawn { name: String, source: io::Error },
    #[error(transparent)]
    Storage(#[from] StoreError),
}

impl JobError {
    pub fn is_already_running(&self) -> bool {
        matches!(self, JobError::AlreadyRunning { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            JobError::AlreadyRunning { .. } => "already_running",
            JobError::UnknownJob(_) => "unknown_job",
            JobError::AtCapacity { .. } => "at_capacity",
            JobError::Spawn { .. } => "spawn_failed",
            JobError::Storage(StoreError::InvalidName(_)) => "invalid_name",
            JobError::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    TimedOut,
    Cancelled,
}

impl Termination {
    pub fn as_str(self) -> &'static str {
        match self {
            Termination::Exited => "exited",
            Termination::TimedOut => "timed_out",
            Termination::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub name: String,
    pub exit_code: Option<i32>,
    pub termination: Termination,
}

pub struct Executor {
    store: MarkerStore,
    shell: String,
    max_concurrent: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Receiver<bool>,
    metrics: Option<Arc<Metrics>>,
}

impl Executor {
    pub fn new(
        store: MarkerStore,
        shell: impl Into<String>,
        max_concurrent: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            store,
            shell: shell.into(),
            max_concurrent,
            permits: Arc::new(Semaphore::new(max_concurrent)),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            shutdown,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &MarkerStore {
        &self.store
    }

    pub fn rejected(&self, err: JobError) -> JobError {
        if let Some(metrics) = &self.metrics {
            metrics.job_rejected(err.reason());
        }
        err
    }

    pub async fn run(&self, name: &str, job: &Job) -> Result<RunOutcome, JobError> {
        self.start(name, job).await?.wait().await
    }

    /// Reconciles the markers of `name` and spawns the process. The returned
    /// run must be driven with [`ActiveRun::wait`] for the output to be sealed.
    pub async fn start(&self, name: &str, job: &Job) -> Result<ActiveRun, JobError> {
        self.try_start(name, job)
            .await
            .map_err(|err| self.rejected(err))
    }

    async fn try_start(&self, name: &str, job: &Job) -> Result<ActiveRun, JobError> {
        if !is_valid_job_name(name) {
            return Err(StoreError::InvalidName(name.to_string()).into());
        }
        let claim = self.claim(name)?;
        let permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| JobError::AtCapacity {
                limit: self.max_concurrent,
            })?;

        match self.store.state(name).await? {
            JobRunState::Running => {
                debug!(job = %name, "running marker present, refusing to start");
                return Err(JobError::AlreadyRunning {
                    name: name.to_string(),
                });
            }
            JobRunState::Stale => {
                warn!(job = %name, "both markers present, discarding stale run");
                self.store.remove(name, MarkerKind::Running).await?;
                self.store.remove(name, MarkerKind::Done).await?;
            }
            JobRunState::Finished => {
                debug!(job = %name, "discarding previous output");
                self.store.remove(name, MarkerKind::Done).await?;
            }
            JobRunState::Absent => {}
        }

        let marker = self
            .store
            .create_running(name)
            .await
            .map_err(|err| match err {
                StoreError::AlreadyExists { .. } => JobError::AlreadyRunning {
                    name: name.to_string(),
                },
                other => JobError::Storage(other),
            })?;

        let command_line = job.command_line();
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(EXEC_ARGV)
            .arg(&self.shell)
            .args(&job.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                self.discard_marker(name, marker).await;
                return Err(JobError::Spawn {
                    name: name.to_string(),
                    source,
                });
            }
        };

        let Some(stdout) = child.stdout.take() else {
            terminate(&mut child).await;
            self.discard_marker(name, marker).await;
            return Err(JobError::Spawn {
                name: name.to_string(),
                source: io::Error::new(io::ErrorKind::BrokenPipe, "stdout pipe unavailable"),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            spawn_stderr_logger(name.to_string(), stderr);
        }

        let copier = tokio::spawn(copy_output(stdout, marker));

        info!(
            job = %name,
            pid = ?child.id(),
            command = %command_line,
            timeout = ?job.timeout,
            "job started"
        );
        if let Some(metrics) = &self.metrics {
            metrics.job_started(name);
        }

        Ok(ActiveRun {
            name: name.to_string(),
            child,
            copier,
            store: self.store.clone(),
            deadline: job.timeout.map(|t| Instant::now() + t),
            timeout: job.timeout,
            shutdown: self.shutdown.clone(),
            metrics: self.metrics.clone(),
            _claim: claim,
            _permit: permit,
        })
    }

    fn claim(&self, name: &str) -> Result<Claim, JobError> {
        let mut names = self
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !names.insert(name.to_string()) {
            return Err(JobError::AlreadyRunning {
                name: name.to_string(),
            });
        }
        Ok(Claim {
            names: Arc::clone(&self.in_flight),
            name: name.to_string(),
        })
    }

    async fn discard_marker(&self, name: &str, marker: RunningMarker) {
        drop(marker);
        if let Err(err) = self.store.remove(name, MarkerKind::Running).await {
            warn!(job = %name, error = %err, "cannot remove running marker after failed start");
        }
    }

    pub async fn wait_idle(&self, grace: Duration) -> bool {
        let all = u32::try_from(self.max_concurrent).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(grace, self.permits.acquire_many(all)).await,
            Ok(Ok(_))
        )
    }
}

#[derive(Debug)]
struct Claim {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut names = self
            .names
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        names.remove(&self.name);
    }
}

pub struct ActiveRun {
    name: String,
    child: Child,
    copier: JoinHandle<Result<RunningMarker, StoreError>>,
    store: MarkerStore,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    shutdown: watch::Receiver<bool>,
    metrics: Option<Arc<Metrics>>,
    _claim: Claim,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for ActiveRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveRun")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

enum Stop {
    Exited(io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ActiveRun {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(mut self) -> Result<RunOutcome, JobError> {
        let mut shutdown = self.shutdown.clone();
        let stop = tokio::select! {
            status = self.child.wait() => Stop::Exited(status),
            _ = deadline_elapsed(self.deadline) => Stop::TimedOut,
            _ = cancelled(&mut shutdown) => Stop::Cancelled,
        };

        let (exit_code, termination) = match stop {
            Stop::Exited(Ok(status)) => (status.code(), Termination::Exited),
            Stop::Exited(Err(err)) => {
                warn!(job = %self.name, error = %err, "waiting for job process failed");
                (None, Termination::Exited)
            }
            Stop::TimedOut => {
                warn!(job = %self.name, timeout = ?self.timeout, "job deadline exceeded, stopping");
                terminate(&mut self.child).await;
                (None, Termination::TimedOut)
            }
            Stop::Cancelled => {
                info!(job = %self.name, "shutdown requested, stopping job");
                terminate(&mut self.child).await;
                (None, Termination::Cancelled)
            }
        };

        self.drain_output().await;

        if let Some(note) = self.stop_note(termination) {
            if let Err(err) = self.store.append_output(&self.name, note.as_bytes()).await {
                warn!(job = %self.name, error = %err, "cannot append stop note");
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.job_finished(&self.name, termination.as_str());
        }

        self.store.seal(&self.name).await?;
        info!(
            job = %self.name,
            exit_code = ?exit_code,
            termination = termination.as_str(),
            "job finished"
        );

        Ok(RunOutcome {
            name: self.name.clone(),
            exit_code,
            termination,
        })
    }

    async fn drain_output(&mut self) {
        match tokio::time::timeout(DRAIN_GRACE, &mut self.copier).await {
            Ok(Ok(Ok(marker))) => {
                if let Err(err) = marker.close().await {
                    warn!(job = %self.name, error = %err, "cannot sync job output");
                }
            }
            Ok(Ok(Err(err))) => {
                warn!(job = %self.name, error = %err, "job output copy failed");
            }
            Ok(Err(err)) => {
                warn!(job = %self.name, error = %err, "job output task failed");
            }
            Err(_) => {
                // A descendant still holds the pipe open.
                self.copier.abort();
                warn!(job = %self.name, "job output still open after exit, detaching");
            }
        }
    }

    fn stop_note(&self, termination: Termination) -> Option<String> {
        match termination {
            Termination::Exited => None,
            Termination::TimedOut => Some(format!(
                "\n[остановлено: превышено время выполнения {}]\n",
                self.timeout
                    .map(|t| humantime::format_duration(t).to_string())
                    .unwrap_or_default()
            )),
            Termination::Cancelled => {
                Some("\n[остановлено: агент завершает работу]\n".to_string())
            }
        }
    }
}

async fn copy_output(
    mut stdout: ChildStdout,
    mut marker: RunningMarker,
) -> Result<RunningMarker, StoreError> {
    let mut buf = vec![0_u8; READ_CHUNK];
    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                warn!(marker = %marker.path().display(), error = %err, "job stdout read failed");
                break;
            }
        };
        marker.append(&buf[..n]).await?;
    }
    Ok(marker)
}

fn spawn_stderr_logger(name: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(job = %name, "stderr: {}", line);
        }
    });
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            // Sender gone without signalling: nothing can cancel us any more.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn terminate(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    let pgid = Pid::from_raw(pid as i32);
    let _ = killpg(pgid, Signal::SIGTERM);

    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = killpg(pgid, Signal::SIGKILL);
        let _ = child.wait().await;
    }
}

#[cfg(not(unix))]
async fn terminate(child: &mut Child) {
    let _ = child.kill().await;
}
