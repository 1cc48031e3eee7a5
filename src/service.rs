// OpenReLife Desktop - Backend Service Management
// Handles spawning, output capture, exit diagnostics and shutdown of the backend process group

use crate::config::ServiceConfig;
use crate::error::SupervisorError;
use crate::logsink::{self, LogSink, LogWriter};
use crate::notice::{CrashReport, Notifier};
use crate::ports;
use chrono::{DateTime, Local};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Lines shown in the crash diagnostic
const TAIL_LINES: usize = 10;
/// How long the exit watcher waits for the output readers to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Substrings (lowercase) that mark a backend line as a warning in the operator log
const ERROR_MARKERS: [&str; 5] = ["error", "exception", "traceback", "critical", "failed"];

/// Lifecycle state of the supervised process
#[derive(Clone, Debug, serde::Serialize, PartialEq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(Option<i32>),
    Failed(String),
}

/// Snapshot of the live backend process
#[derive(Clone, Debug, serde::Serialize)]
pub struct SupervisedProcess {
    pub pid: u32,
    pub process_group_id: u32,
    pub started_at: DateTime<Local>,
    pub state: ProcessState,
    pub generation: u64,
}

/// How the last process ended
#[derive(Clone, Debug, serde::Serialize)]
pub struct ExitRecord {
    pub generation: u64,
    /// `None` when ended by a signal
    pub code: Option<i32>,
    pub requested: bool,
    pub at: DateTime<Local>,
}

#[derive(Clone, Copy, Debug)]
pub struct StopPolicy {
    /// Time allowed after the polite signal before the group is force-killed
    pub grace: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }
}

/// Bookkeeping for the live process; only the supervisor touches it
struct Running {
    info: SupervisedProcess,
    sink: LogSink,
    stop_requested: Arc<AtomicBool>,
    /// Asks the exit watcher to kill the direct child when group signalling fails
    kill_tx: Option<oneshot::Sender<()>>,
    exited_rx: oneshot::Receiver<()>,
}

/// Owns the backend process group for one shell lifetime
pub struct BackendSupervisor {
    current: Mutex<Option<Running>>,
    last_exit: Mutex<Option<ExitRecord>>,
    lifecycle: Mutex<CancellationToken>,
    start_lock: Mutex<()>,
    generation: AtomicU64,
    notifier: Arc<dyn Notifier>,
    stop_policy: StopPolicy,
}

impl BackendSupervisor {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self::with_stop_policy(notifier, StopPolicy::default())
    }

    pub fn with_stop_policy(notifier: Arc<dyn Notifier>, stop_policy: StopPolicy) -> Self {
        Self {
            current: Mutex::new(None),
            last_exit: Mutex::new(None),
            lifecycle: Mutex::new(CancellationToken::new()),
            start_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            notifier,
            stop_policy,
        }
    }

    /// Snapshot of the live process, if any
    pub async fn current(&self) -> Option<SupervisedProcess> {
        self.current.lock().await.as_ref().map(|r| r.info.clone())
    }

    pub async fn is_running(&self) -> bool {
        self.current.lock().await.is_some()
    }

    pub async fn last_exit(&self) -> Option<ExitRecord> {
        self.last_exit.lock().await.clone()
    }

    /// State for the shell: the live process, else how the last one ended
    pub async fn state(&self) -> Option<ProcessState> {
        if let Some(process) = self.current().await {
            return Some(process.state);
        }
        self.last_exit().await.map(|r| ProcessState::Exited(r.code))
    }

    /// Token that fires when the current lifecycle ends (stop or restart)
    pub async fn lifecycle_token(&self) -> CancellationToken {
        self.lifecycle.lock().await.child_token()
    }

    /// Mark the process as running (called after the readiness probe succeeds).
    /// Returns false if `generation` is no longer the live process.
    pub async fn mark_running(&self, generation: u64) -> bool {
        self.set_state(generation, ProcessState::Running).await
    }

    pub async fn mark_failed(&self, generation: u64, error: String) -> bool {
        self.set_state(generation, ProcessState::Failed(error)).await
    }

    async fn set_state(&self, generation: u64, state: ProcessState) -> bool {
        let mut guard = self.current.lock().await;
        match guard.as_mut() {
            Some(running) if running.info.generation == generation => {
                running.info.state = state;
                true
            }
            _ => false,
        }
    }

    /// Start the backend. A live process is stopped first, then the port is reaped.
    pub async fn start(self: &Arc<Self>, config: &ServiceConfig) -> Result<SupervisedProcess, SupervisorError> {
        let _start = self.start_lock.lock().await;

        self.stop().await;
        *self.lifecycle.lock().await = CancellationToken::new();

        log::info!("[Supervisor] Starting backend on port {}...", config.port);
        log::info!(
            "[Supervisor] Launcher: {} {}",
            config.launcher.program,
            config.launcher.args.join(" ")
        );
        log::info!("[Supervisor] Working dir: {:?}", config.working_directory);
        log::info!("[Supervisor] Log file: {:?}", config.log_path);

        let result = self.launch(config).await;
        if let Err(e) = &result {
            log::error!("[Supervisor] {}", e);
            self.notifier.spawn_failed(e.to_string());
        }
        result
    }

    /// Reap the port, open the log and spawn. Any error aborts the start.
    async fn launch(self: &Arc<Self>, config: &ServiceConfig) -> Result<SupervisedProcess, SupervisorError> {
        match ports::free_port(config.port).await {
            ports::ReapOutcome::Reaped(pids) => {
                log::info!("[Supervisor] Reaped stale listeners on port {}: {:?}", config.port, pids)
            }
            outcome => log::debug!("[Supervisor] Port {} reap: {:?}", config.port, outcome),
        }

        let sink = LogSink::open(
            &config.log_path,
            &format!("Backend session on port {}", config.port),
        )
        .await?;

        // Hold the slot until the process is registered so an instant exit cannot race us
        let mut slot = self.current.lock().await;

        let mut child = match spawn_backend(config) {
            Ok(child) => child,
            Err(e) => {
                sink.writer().note(e.to_string()).await;
                sink.close().await;
                return Err(e);
            }
        };

        let Some(pid) = child.id() else {
            sink.close().await;
            return Err(SupervisorError::MissingPid);
        };

        let writer = sink.writer();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(pipe_output(stdout, "stdout", writer.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(pipe_output(stderr, "stderr", writer.clone()));
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let info = SupervisedProcess {
            pid,
            process_group_id: pid,
            started_at: Local::now(),
            state: ProcessState::Starting,
            generation,
        };

        let stop_requested = Arc::new(AtomicBool::new(false));
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = oneshot::channel();

        tokio::spawn(watch_exit(
            self.clone(),
            ExitWatch {
                child,
                generation,
                writer,
                readers,
                stop_requested: stop_requested.clone(),
                kill_rx,
                exited_tx,
                log_path: config.log_path.clone(),
            },
        ));

        log::info!("[Supervisor] Backend started with PID: {}", pid);
        *slot = Some(Running {
            info: info.clone(),
            sink,
            stop_requested,
            kill_tx: Some(kill_tx),
            exited_rx,
        });

        Ok(info)
    }

    /// Stop the backend process group. Returns false if nothing was running.
    /// Returns only after the direct child has been reaped.
    pub async fn stop(&self) -> bool {
        self.lifecycle.lock().await.cancel();

        let Some(running) = self.current.lock().await.take() else {
            return false;
        };
        let Running {
            info,
            sink,
            stop_requested,
            mut kill_tx,
            mut exited_rx,
        } = running;

        stop_requested.store(true, Ordering::SeqCst);
        log::info!(
            "[Supervisor] Stopping backend (PID: {}, group: {})...",
            info.pid,
            info.process_group_id
        );

        if let Err(e) = signal_group(info.process_group_id, false).await {
            log::warn!("[Supervisor] Group signal failed ({}), killing PID {} directly", e, info.pid);
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
        }

        if tokio::time::timeout(self.stop_policy.grace, &mut exited_rx).await.is_err() {
            log::warn!(
                "[Supervisor] Backend did not exit within {:?}, forcing",
                self.stop_policy.grace
            );
            if let Err(e) = signal_group(info.process_group_id, true).await {
                log::warn!("[Supervisor] Forced group kill failed: {}", e);
            }
            if let Some(tx) = kill_tx.take() {
                let _ = tx.send(());
            }
            let _ = exited_rx.await;
        }

        sink.close().await;
        log::info!("[Supervisor] Backend stopped.");
        true
    }
}

/// Everything the exit watcher owns for one process lifetime
struct ExitWatch {
    child: Child,
    generation: u64,
    writer: LogWriter,
    readers: Vec<JoinHandle<()>>,
    stop_requested: Arc<AtomicBool>,
    kill_rx: oneshot::Receiver<()>,
    exited_tx: oneshot::Sender<()>,
    log_path: PathBuf,
}

/// Termination callback: runs exactly once per spawned process
async fn watch_exit(supervisor: Arc<BackendSupervisor>, watch: ExitWatch) {
    let ExitWatch {
        mut child,
        generation,
        writer,
        readers,
        stop_requested,
        mut kill_rx,
        exited_tx,
        log_path,
    } = watch;

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = &mut kill_rx => None,
    };
    let status = match exited {
        Some(status) => status,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            log::warn!("[Supervisor] Failed to read backend exit status: {}", e);
            None
        }
    };

    for reader in readers {
        let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
    }

    let requested = stop_requested.load(Ordering::SeqCst);
    let code_text = code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string());
    writer
        .note(format!("Backend exited with code {}", code_text))
        .await;

    if requested {
        log::info!("[Supervisor] Backend exited after stop request (code {})", code_text);
    } else if code == Some(0) {
        log::info!("[Supervisor] Backend exited cleanly");
    } else {
        log::error!("[Supervisor] Backend exited unexpectedly (code {})", code_text);
    }

    *supervisor.last_exit.lock().await = Some(ExitRecord {
        generation,
        code,
        requested,
        at: Local::now(),
    });

    // A stop or a newer start may already own the slot
    let orphaned = {
        let mut slot = supervisor.current.lock().await;
        match slot.as_ref() {
            Some(running) if running.info.generation == generation => slot.take(),
            _ => None,
        }
    };
    if let Some(running) = orphaned {
        running.sink.close().await;
    }

    if !requested && code != Some(0) {
        let tail = logsink::read_tail(&log_path, TAIL_LINES).await.unwrap_or_else(|e| {
            log::warn!("[Supervisor] Could not read backend log tail: {}", e);
            Vec::new()
        });
        supervisor.notifier.backend_crashed(CrashReport {
            exit_code: code,
            tail,
            log_path,
        });
    }

    let _ = exited_tx.send(());
}

/// Spawn the launcher as the leader of a new process group
fn spawn_backend(config: &ServiceConfig) -> Result<Child, SupervisorError> {
    let launcher = &config.launcher;

    if !config.working_directory.is_dir() {
        return Err(SupervisorError::Spawn {
            program: launcher.program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory {} does not exist", config.working_directory.display()),
            ),
        });
    }

    let mut std_cmd = std::process::Command::new(&launcher.program);
    std_cmd
        .args(&launcher.args)
        .current_dir(&config.working_directory)
        .envs(&config.environment)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        std_cmd.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        std_cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let mut cmd = Command::from(std_cmd);
    cmd.spawn().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            SupervisorError::LauncherNotFound {
                program: launcher.program.clone(),
                hint: launcher.install_hint.clone(),
            }
        } else {
            SupervisorError::Spawn {
                program: launcher.program.clone(),
                source,
            }
        }
    })
}

/// Copy one output stream into the log verbatim, mirroring error lines to the operator log
fn pipe_output<R>(stream: R, name: &'static str, writer: LogWriter) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if is_error_line(text) {
                        log::warn!("[Backend:{}] {}", name, text);
                    } else {
                        log::debug!("[Backend:{}] {}", name, text);
                    }
                    writer.output(line.clone());
                }
                Err(e) => {
                    log::debug!("[Supervisor] Backend {} closed: {}", name, e);
                    break;
                }
            }
        }
    })
}

fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_MARKERS.iter().any(|marker| lower.contains(marker))
}

/// Terminate the whole group: SIGTERM (or SIGKILL when forced) on POSIX
#[cfg(unix)]
async fn signal_group(pgid: u32, force: bool) -> anyhow::Result<()> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    killpg(Pid::from_raw(i32::try_from(pgid)?), signal)?;
    Ok(())
}

/// Tree-kill on Windows; there is no polite variant for console-less children
#[cfg(windows)]
async fn signal_group(pid: u32, _force: bool) -> anyhow::Result<()> {
    let status = Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    if !status.success() {
        anyhow::bail!("taskkill exited with {}", status);
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
async fn signal_group(_pgid: u32, _force: bool) -> anyhow::Result<()> {
    anyhow::bail!("process groups are not supported on this platform")
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Launcher;
    use crate::readiness::{probe_client, wait_until_ready, Readiness, RetryPolicy};
    use crate::test_support::{refused_addr, RecordingNotifier};
    use std::collections::BTreeMap;
    use std::path::Path;

    fn script_config(dir: &Path, script: &str) -> ServiceConfig {
        ServiceConfig {
            host: "127.0.0.1".to_string(),
            port: refused_addr().port(),
            working_directory: dir.to_path_buf(),
            environment: BTreeMap::new(),
            launcher: Launcher {
                program: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), script.to_string()],
                install_hint: "install sh".to_string(),
            },
            log_path: dir.join("logs").join("backend.log"),
        }
    }

    fn supervisor(notifier: &Arc<RecordingNotifier>) -> Arc<BackendSupervisor> {
        Arc::new(BackendSupervisor::with_stop_policy(
            notifier.clone(),
            StopPolicy {
                grace: Duration::from_secs(2),
            },
        ))
    }

    async fn wait_for_exit(supervisor: &BackendSupervisor) -> ExitRecord {
        for _ in 0..100 {
            if let Some(record) = supervisor.last_exit().await {
                if !supervisor.is_running().await {
                    return record;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("backend did not exit");
    }

    async fn wait_for_crash(notifier: &RecordingNotifier) {
        for _ in 0..100 {
            if notifier.crash_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("no crash diagnostic");
    }

    /// Gone, or a zombie awaiting its new parent
    fn is_dead(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit(')')
                .next()
                .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        }
    }

    #[test]
    fn test_error_line_classification() {
        assert!(is_error_line("Traceback (most recent call last):"));
        assert!(is_error_line("sqlite3.OperationalError: database is locked"));
        assert!(is_error_line("CRITICAL worker died"));
        assert!(!is_error_line("Serving on http://127.0.0.1:8082"));
    }

    #[tokio::test]
    async fn test_abnormal_exit_raises_one_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(
            dir.path(),
            "echo booting; echo 'Traceback: database is locked' >&2; exit 3",
        );

        let process = supervisor.start(&config).await.unwrap();
        assert_eq!(process.state, ProcessState::Starting);
        assert_eq!(process.process_group_id, process.pid);

        wait_for_crash(&notifier).await;
        let record = wait_for_exit(&supervisor).await;
        assert_eq!(record.code, Some(3));
        assert!(!record.requested);
        assert_eq!(supervisor.state().await, Some(ProcessState::Exited(Some(3))));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(notifier.crash_count(), 1);

        let report = notifier.crashes.lock().unwrap()[0].clone();
        assert_eq!(report.exit_code, Some(3));
        assert_eq!(report.log_path, config.log_path);
        assert!(report
            .tail
            .iter()
            .any(|line| line.contains("Traceback: database is locked")));

        // A later stop has nothing left to do
        assert!(!supervisor.stop().await);
    }

    #[tokio::test]
    async fn test_requested_stop_raises_no_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(dir.path(), "echo up; exec sleep 30");

        supervisor.start(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.stop().await);

        assert!(!supervisor.is_running().await);
        let record = supervisor.last_exit().await.expect("exit recorded");
        assert!(record.requested);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(notifier.crash_count(), 0);

        let log = std::fs::read_to_string(&config.log_path).unwrap();
        assert!(log.contains("Backend exited with code"));
    }

    #[tokio::test]
    async fn test_stop_without_process_is_noop() {
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);

        assert!(!supervisor.stop().await);
        assert!(!supervisor.stop().await);
        assert!(supervisor.current().await.is_none());
        assert!(supervisor.last_exit().await.is_none());
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_then_start_terminates_whole_group_first() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let pid_file = dir.path().join("grandchild.pid");
        let config = script_config(
            dir.path(),
            &format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
        );

        let first = supervisor.start(&config).await.unwrap();
        for _ in 0..50 {
            if pid_file.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let grandchild: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        assert!(supervisor.stop().await);
        assert!(is_dead(first.pid as i32));
        let mut grandchild_dead = false;
        for _ in 0..40 {
            if is_dead(grandchild) {
                grandchild_dead = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(grandchild_dead, "group member {} survived stop", grandchild);

        let second = supervisor.start(&config).await.unwrap();
        assert_ne!(second.pid, first.pid);
        assert_eq!(second.generation, first.generation + 1);
        assert_eq!(supervisor.current().await.map(|p| p.pid), Some(second.pid));

        assert!(supervisor.stop().await);
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_start_while_running_replaces_process() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(dir.path(), "exec sleep 30");

        let first = supervisor.start(&config).await.unwrap();
        let second = supervisor.start(&config).await.unwrap();

        assert!(is_dead(first.pid as i32));
        assert_eq!(supervisor.current().await.map(|p| p.generation), Some(second.generation));
        assert!(supervisor.last_exit().await.is_some_and(|r| r.requested));

        supervisor.stop().await;
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_launcher_reports_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let mut config = script_config(dir.path(), "exit 0");
        config.launcher.program = dir.path().join("no-such-launcher").display().to_string();

        let err = supervisor.start(&config).await.unwrap_err();
        assert!(matches!(err, SupervisorError::LauncherNotFound { .. }));
        assert!(err.to_string().contains("install sh"));
        assert_eq!(notifier.spawn_failures.lock().unwrap().len(), 1);
        assert!(!supervisor.is_running().await);
    }

    #[tokio::test]
    async fn test_unwritable_log_reports_start_failure() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(dir.path(), "exec sleep 30");
        // A regular file where the log directory should be
        std::fs::write(dir.path().join("logs"), "not a directory").unwrap();

        let err = supervisor.start(&config).await.unwrap_err();
        assert!(matches!(err, SupervisorError::LogSink(_)));

        let failures = notifier.spawn_failures.lock().unwrap().clone();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("Failed to open backend log"));
        assert!(!supervisor.is_running().await);
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_backend_ready_on_fourth_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let interval = Duration::from_millis(300);
        let marker = dir.path().join("listening");
        // Bind between the third and fourth attempt
        let config = script_config(
            dir.path(),
            &format!("sleep 1.05; touch {}; exec sleep 30", marker.display()),
        );
        let port = config.port;

        let started = std::time::Instant::now();
        let process = supervisor.start(&config).await.unwrap();

        // Stand-in for the backend's HTTP server, bound once the script signals
        tokio::spawn(async move {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let router = axum::Router::new().route("/", axum::routing::get(|| async { "ok" }));
            axum::serve(listener, router).await.unwrap();
        });

        let token = supervisor.lifecycle_token().await;
        let readiness = wait_until_ready(
            &probe_client().unwrap(),
            &config.base_url(),
            RetryPolicy::unbounded().with_interval(interval),
            &token,
        )
        .await;
        let elapsed = started.elapsed();

        assert_eq!(readiness, Readiness::Ready { attempts: 4 });
        assert!(elapsed >= interval * 4, "ready too early: {:?}", elapsed);
        assert!(elapsed < interval * 5, "ready too late: {:?}", elapsed);
        assert!(supervisor.mark_running(process.generation).await);
        assert_eq!(supervisor.state().await, Some(ProcessState::Running));

        assert!(supervisor.stop().await);
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_clean_exit_is_logged_without_diagnostic() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(dir.path(), "echo hello from backend; echo partial line >&2; exit 0");

        supervisor.start(&config).await.unwrap();
        let record = wait_for_exit(&supervisor).await;
        assert_eq!(record.code, Some(0));

        let log = std::fs::read_to_string(&config.log_path).unwrap();
        assert!(log.contains("===== Backend session on port"));
        assert!(log.contains("hello from backend\n"));
        assert!(log.contains("partial line\n"));
        assert!(log.contains("Backend exited with code 0"));
        assert_eq!(notifier.crash_count(), 0);
    }

    #[tokio::test]
    async fn test_lifecycle_and_generation_guards() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let supervisor = supervisor(&notifier);
        let config = script_config(dir.path(), "exec sleep 30");

        let process = supervisor.start(&config).await.unwrap();
        let token = supervisor.lifecycle_token().await;
        assert!(!token.is_cancelled());

        assert!(!supervisor.mark_running(process.generation + 1).await);
        assert!(supervisor.mark_running(process.generation).await);
        assert_eq!(supervisor.current().await.map(|p| p.state), Some(ProcessState::Running));

        supervisor.stop().await;
        assert!(token.is_cancelled());
        assert!(!supervisor.mark_running(process.generation).await);
    }
}
