//! Backend Process Supervisor
//!
//! Owns the single companion worker process: resolves what to run, negotiates
//! its port, spawns it with piped output, and resets shared state when it
//! exits. `Idle -> Starting -> Running -> Idle`.
//!
//! Every failure degrades to "backend unavailable" plus a log line; nothing
//! here is allowed to take the host down.

use crate::config::{BackendConfig, DeploymentMode};
use crate::error::{Result, ShellError};
use crate::port;
use serde::Serialize;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const ENV_PORT: &str = "CUMO_BACKEND_PORT";
pub const ENV_DATA_DIR: &str = "CUMO_DATA_DIR";
pub const ENV_CREDENTIALS: &str = "CUMO_GOOGLE_CREDENTIALS";
pub const ENV_TOKEN: &str = "CUMO_GOOGLE_TOKEN";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Snapshot of a live worker. The process itself is owned by its monitor task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHandle {
    pub pid: Option<u32>,
    pub port: u16,
    #[serde(skip)]
    generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub running: bool,
    pub starting: bool,
    pub port: Option<u16>,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ChildExit {
    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown status"),
        }
    }
}

/// Events delivered to the supervisor from its worker's monitor task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    ChildExited { generation: u64, exit: ChildExit },
}

/// What to execute for the worker and where.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl LaunchPlan {
    pub fn resolve(config: &BackendConfig) -> Result<Self> {
        if !config.backend_dir.exists() {
            return Err(ShellError::BackendDirMissing(config.backend_dir.clone()));
        }

        match config.mode {
            DeploymentMode::Packaged => {
                let binary = config.binary_path();
                if !binary.exists() {
                    return Err(ShellError::BinaryMissing(binary));
                }
                Ok(Self {
                    program: binary,
                    args: Vec::new(),
                    cwd: config.backend_dir.clone(),
                })
            }
            DeploymentMode::Development => Ok(Self {
                program: resolve_interpreter(config),
                args: vec!["-u".to_string(), config.entry_script.clone()],
                cwd: config.backend_dir.clone(),
            }),
        }
    }

    fn command(&self, env: &[(&'static str, OsString)]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.cwd)
            .envs(env.iter().map(|(key, value)| (*key, value)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        cmd
    }
}

fn resolve_interpreter(config: &BackendConfig) -> PathBuf {
    if let Some(explicit) = &config.interpreter_override {
        return PathBuf::from(explicit);
    }

    let venv = venv_interpreter(&config.backend_dir);
    if venv.exists() {
        return venv;
    }

    PathBuf::from(if cfg!(windows) { "python" } else { "python3" })
}

fn venv_interpreter(backend_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        backend_dir.join("venv").join("Scripts").join("python.exe")
    } else {
        backend_dir.join("venv").join("bin").join("python")
    }
}

/// Extra variables layered over the inherited host environment.
pub fn build_env(port: u16, config: &BackendConfig) -> Vec<(&'static str, OsString)> {
    vec![
        (ENV_PORT, OsString::from(port.to_string())),
        (ENV_DATA_DIR, config.data_dir.clone().into_os_string()),
        (ENV_CREDENTIALS, config.credentials_path().into_os_string()),
        (ENV_TOKEN, config.token_path().into_os_string()),
    ]
}

#[derive(Debug)]
struct RunningWorker {
    handle: WorkerHandle,
    kill: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<()>,
}

#[derive(Debug)]
enum Phase {
    Idle,
    Starting { generation: u64 },
    Running(RunningWorker),
}

#[derive(Debug)]
struct SupervisorState {
    phase: Phase,
    next_generation: u64,
}

enum StartTicket {
    Live(WorkerHandle),
    Fresh(u64),
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

pub struct BackendSupervisor {
    config: BackendConfig,
    state: Mutex<SupervisorState>,
}

impl BackendSupervisor {
    pub fn new(config: BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(SupervisorState {
                phase: Phase::Idle,
                next_generation: 1,
            }),
        })
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, SupervisorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the worker, or return the live one. `None` means the backend is
    /// unavailable; the reason has already been logged.
    pub async fn start(self: &Arc<Self>) -> Option<WorkerHandle> {
        let generation = match self.begin_start() {
            Ok(StartTicket::Live(handle)) => return Some(handle),
            Ok(StartTicket::Fresh(generation)) => generation,
            Err(e) => {
                tracing::warn!("[backend] Not starting: {}", e);
                return None;
            }
        };

        match self.launch(generation).await {
            Ok(handle) => {
                tracing::info!(
                    "[backend] Worker running (pid {:?}, port {})",
                    handle.pid,
                    handle.port
                );
                Some(handle)
            }
            Err(e) => {
                self.abort_start(generation);
                match e {
                    ShellError::BackendDirMissing(_) | ShellError::BinaryMissing(_) => {
                        tracing::warn!("[backend] {}, skipping spawn", e);
                    }
                    ShellError::StartCancelled => tracing::info!("[backend] {}", e),
                    _ => tracing::error!("[backend] Failed to start: {}", e),
                }
                None
            }
        }
    }

    fn begin_start(&self) -> Result<StartTicket> {
        let mut state = self.lock_state();
        if let Phase::Running(worker) = &state.phase {
            return Ok(StartTicket::Live(worker.handle.clone()));
        }
        if matches!(state.phase, Phase::Starting { .. }) {
            return Err(ShellError::StartInProgress);
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state.phase = Phase::Starting { generation };
        Ok(StartTicket::Fresh(generation))
    }

    fn abort_start(&self, generation: u64) {
        let mut state = self.lock_state();
        if matches!(state.phase, Phase::Starting { generation: g } if g == generation) {
            state.phase = Phase::Idle;
        }
    }

    async fn launch(self: &Arc<Self>, generation: u64) -> Result<WorkerHandle> {
        let plan = LaunchPlan::resolve(&self.config)?;
        let port = port::resolve_port(
            self.config.port_override.as_deref(),
            &self.config.port_candidates,
        )
        .await;

        tracing::info!(
            "[backend] Launching {} {:?} in {} on port {}",
            plan.program.display(),
            plan.args,
            plan.cwd.display(),
            port
        );

        let env = build_env(port, &self.config);
        let mut child = plan
            .command(&env)
            .spawn()
            .map_err(|source| ShellError::Spawn {
                program: plan.program.display().to_string(),
                source,
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, OutputStream::Stderr));
        }

        self.commit(generation, child, port)
    }

    /// Publish the spawned worker. State only changes here, so a port is never
    /// reported for a process that was not actually spawned.
    fn commit(self: &Arc<Self>, generation: u64, mut child: Child, port: u16) -> Result<WorkerHandle> {
        let mut state = self.lock_state();
        if !matches!(state.phase, Phase::Starting { generation: g } if g == generation) {
            drop(state);
            if let Err(e) = child.start_kill() {
                tracing::warn!("[backend] Failed to kill cancelled worker: {}", e);
            }
            return Err(ShellError::StartCancelled);
        }

        let handle = WorkerHandle {
            pid: child.id(),
            port,
            generation,
        };
        let (kill_tx, kill_rx) = oneshot::channel();
        // the monitor blocks on this lock until the worker is published
        let monitor = tokio::spawn(monitor_child(Arc::downgrade(self), generation, child, kill_rx));

        state.phase = Phase::Running(RunningWorker {
            handle: handle.clone(),
            kill: Some(kill_tx),
            monitor,
        });
        Ok(handle)
    }

    pub fn handle_event(&self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::ChildExited { generation, exit } => {
                let mut state = self.lock_state();
                let live = matches!(
                    &state.phase,
                    Phase::Running(worker) if worker.handle.generation == generation
                );
                if live {
                    state.phase = Phase::Idle;
                    tracing::info!("[backend] Worker state cleared after exit ({})", exit);
                } else {
                    tracing::debug!(
                        "[backend] Ignoring exit of stale worker generation {}",
                        generation
                    );
                }
            }
        }
    }

    /// Request termination and forget the worker immediately. The exit event
    /// that follows finds nothing to clear.
    pub fn stop(&self) {
        let _ = self.take_worker();
    }

    /// `stop`, then wait (bounded by the configured grace) for the process to go.
    pub async fn shutdown(&self) {
        let Some(worker) = self.take_worker() else {
            return;
        };

        let grace = self.config.shutdown_grace;
        match tokio::time::timeout(grace, worker.monitor).await {
            Ok(_) => tracing::info!("[backend] Worker stopped"),
            Err(_) => tracing::warn!("[backend] Worker did not exit within {:?}", grace),
        }
    }

    fn take_worker(&self) -> Option<RunningWorker> {
        let mut state = self.lock_state();
        match std::mem::replace(&mut state.phase, Phase::Idle) {
            Phase::Running(mut worker) => {
                tracing::info!("[backend] Stopping worker (pid {:?})", worker.handle.pid);
                if let Some(kill) = worker.kill.take() {
                    let _ = kill.send(());
                }
                Some(worker)
            }
            Phase::Starting { generation } => {
                tracing::info!("[backend] Stop requested while starting, cancelling start {}", generation);
                None
            }
            Phase::Idle => None,
        }
    }

    pub fn current(&self) -> Option<WorkerHandle> {
        match &self.lock_state().phase {
            Phase::Running(worker) => Some(worker.handle.clone()),
            _ => None,
        }
    }

    pub fn active_port(&self) -> Option<u16> {
        self.current().map(|handle| handle.port)
    }

    pub fn is_running(&self) -> bool {
        self.current().is_some()
    }

    pub fn status(&self) -> BackendStatus {
        let state = self.lock_state();
        match &state.phase {
            Phase::Running(worker) => BackendStatus {
                running: true,
                starting: false,
                port: Some(worker.handle.port),
                pid: worker.handle.pid,
            },
            Phase::Starting { .. } => BackendStatus {
                running: false,
                starting: true,
                port: None,
                pid: None,
            },
            Phase::Idle => BackendStatus {
                running: false,
                starting: false,
                port: None,
                pid: None,
            },
        }
    }
}

async fn monitor_child(
    supervisor: Weak<BackendSupervisor>,
    generation: u64,
    mut child: Child,
    kill: oneshot::Receiver<()>,
) {
    // a dropped sender (supervisor gone) also ends the worker
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill => {
            if let Err(e) = child.start_kill() {
                tracing::warn!("[backend] Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => ChildExit::from_status(status),
        Err(e) => {
            tracing::warn!("[backend] Failed to wait on worker: {}", e);
            ChildExit {
                code: None,
                signal: None,
            }
        }
    };
    tracing::info!("[backend] Exited with {}", exit);

    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.handle_event(SupervisorEvent::ChildExited { generation, exit });
    }
}

/// Longest slice of worker output held before it is logged, newline or not.
const MAX_LINE_BYTES: usize = 8 * 1024;

/// Reads up to and including the next newline, stopping early at
/// `MAX_LINE_BYTES`.
async fn read_line_capped<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    reader.take(MAX_LINE_BYTES as u64).read_until(b'\n', buf).await
}

async fn forward_output<R: AsyncRead + Unpin>(reader: R, stream: OutputStream) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match read_line_capped(&mut reader, &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                match stream {
                    OutputStream::Stdout => tracing::info!("[backend] {}", line),
                    OutputStream::Stderr => tracing::warn!("[backend] {}", line),
                }
            }
            Err(e) => {
                tracing::debug!("[backend] {:?} closed: {}", stream, e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn dev_config(dir: &Path) -> BackendConfig {
        BackendConfig {
            mode: DeploymentMode::Development,
            backend_dir: dir.join("backend"),
            data_dir: dir.join("data"),
            port_override: Some("5123".to_string()),
            port_candidates: vec![5001, 5000, 5002, 5050],
            interpreter_override: Some("sh".to_string()),
            entry_script: "app.py".to_string(),
            shutdown_grace: Duration::from_secs(3),
        }
    }

    #[tokio::test]
    async fn test_unterminated_output_is_read_in_bounded_slices() {
        let mut output = vec![b'x'; MAX_LINE_BYTES * 3 + 10];
        output.extend_from_slice(b"\nready\n");
        let mut reader = BufReader::new(output.as_slice());

        let mut sizes = Vec::new();
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let n = read_line_capped(&mut reader, &mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(buf.len() <= MAX_LINE_BYTES);
            sizes.push(n);
        }

        assert_eq!(sizes, vec![MAX_LINE_BYTES, MAX_LINE_BYTES, MAX_LINE_BYTES, 11, 6]);
    }

    /// Lays out `<tmp>/backend/app.py`; run with `sh -u app.py` the script is
    /// plain shell.
    fn worker_dir(script: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("backend")).unwrap();
        std::fs::write(dir.path().join("backend").join("app.py"), script).unwrap();
        dir
    }

    async fn wait_until_idle(supervisor: &BackendSupervisor) {
        for _ in 0..250 {
            if !supervisor.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("worker never exited");
    }

    #[test]
    fn test_development_plan_prefers_override_then_venv() {
        let dir = worker_dir("");
        let mut config = dev_config(dir.path());

        let plan = LaunchPlan::resolve(&config).unwrap();
        assert_eq!(plan.program, PathBuf::from("sh"));
        assert_eq!(plan.args, vec!["-u".to_string(), "app.py".to_string()]);
        assert_eq!(plan.cwd, dir.path().join("backend"));

        config.interpreter_override = None;
        let venv = venv_interpreter(&config.backend_dir);
        std::fs::create_dir_all(venv.parent().unwrap()).unwrap();
        std::fs::write(&venv, "").unwrap();
        assert_eq!(LaunchPlan::resolve(&config).unwrap().program, venv);

        std::fs::remove_file(&venv).unwrap();
        let fallback = if cfg!(windows) { "python" } else { "python3" };
        assert_eq!(LaunchPlan::resolve(&config).unwrap().program, PathBuf::from(fallback));
    }

    #[test]
    fn test_packaged_plan_requires_binary() {
        let dir = worker_dir("");
        let mut config = dev_config(dir.path());
        config.mode = DeploymentMode::Packaged;

        assert!(matches!(
            LaunchPlan::resolve(&config),
            Err(ShellError::BinaryMissing(_))
        ));

        std::fs::write(config.binary_path(), "").unwrap();
        let plan = LaunchPlan::resolve(&config).unwrap();
        assert_eq!(plan.program, config.binary_path());
        assert!(plan.args.is_empty());
    }

    #[test]
    fn test_missing_backend_dir() {
        let dir = TempDir::new().unwrap();
        let config = dev_config(dir.path());
        assert!(matches!(
            LaunchPlan::resolve(&config),
            Err(ShellError::BackendDirMissing(_))
        ));
    }

    #[test]
    fn test_build_env_keys() {
        let dir = TempDir::new().unwrap();
        let config = dev_config(dir.path());
        let env = build_env(5002, &config);

        let get = |key: &str| env.iter().find(|(k, _)| *k == key).map(|(_, v)| PathBuf::from(v));
        assert_eq!(get(ENV_PORT), Some(PathBuf::from("5002")));
        assert_eq!(get(ENV_DATA_DIR), Some(dir.path().join("data")));
        assert_eq!(get(ENV_CREDENTIALS), Some(dir.path().join("backend").join("credentials.json")));
        assert_eq!(get(ENV_TOKEN), Some(dir.path().join("data").join("token.json")));
    }

    #[test]
    fn test_child_exit_display() {
        assert_eq!(ChildExit { code: Some(1), signal: None }.to_string(), "code 1");
        assert_eq!(ChildExit { code: None, signal: Some(9) }.to_string(), "signal 9");
        assert_eq!(ChildExit { code: None, signal: None }.to_string(), "unknown status");
    }

    #[tokio::test]
    async fn test_start_without_backend_dir_is_soft_failure() {
        let dir = TempDir::new().unwrap();
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        assert!(supervisor.start().await.is_none());
        assert!(!supervisor.status().starting);
        assert_eq!(supervisor.active_port(), None);
    }

    #[tokio::test]
    async fn test_start_rejected_while_starting() {
        let dir = worker_dir("sleep 30\n");
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        assert!(matches!(supervisor.begin_start(), Ok(StartTicket::Fresh(1))));
        assert!(supervisor.status().starting);
        assert!(supervisor.start().await.is_none());
        assert!(supervisor.status().starting);
    }

    #[tokio::test]
    async fn test_stale_exit_event_is_ignored() {
        let supervisor = BackendSupervisor::new(dev_config(Path::new("/nonexistent")));
        supervisor.handle_event(SupervisorEvent::ChildExited {
            generation: 42,
            exit: ChildExit { code: Some(0), signal: None },
        });
        assert_eq!(supervisor.status().port, None);
        assert!(!supervisor.status().running);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_clears_port() {
        let dir = worker_dir("sleep 30\n");
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        let first = supervisor.start().await.expect("worker should spawn");
        let second = supervisor.start().await.expect("live worker returned");
        assert_eq!(first, second);
        assert_eq!(supervisor.active_port(), Some(5123));
        assert!(first.pid.is_some());

        supervisor.stop();
        assert_eq!(supervisor.active_port(), None);
        supervisor.stop();

        let third = supervisor.start().await.expect("restart after stop");
        assert_ne!(third.pid, first.pid);
        supervisor.shutdown().await;
        assert!(!supervisor.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_child_exit_resets_state() {
        let dir = worker_dir("echo booting\necho oops >&2\nexit 1\n");
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        supervisor.start().await.expect("worker should spawn");
        wait_until_idle(&supervisor).await;
        assert_eq!(supervisor.active_port(), None);

        assert!(supervisor.start().await.is_some());
        wait_until_idle(&supervisor).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_receives_environment() {
        let script = "printf '%s\\n%s\\n%s\\n%s\\n' \"$CUMO_BACKEND_PORT\" \"$CUMO_DATA_DIR\" \
                      \"$CUMO_GOOGLE_CREDENTIALS\" \"$CUMO_GOOGLE_TOKEN\" > env.txt\n";
        let dir = worker_dir(script);
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        supervisor.start().await.expect("worker should spawn");
        wait_until_idle(&supervisor).await;

        let written = std::fs::read_to_string(dir.path().join("backend").join("env.txt")).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(lines[0], "5123");
        assert_eq!(PathBuf::from(lines[1]), dir.path().join("data"));
        assert_eq!(PathBuf::from(lines[2]), dir.path().join("backend").join("credentials.json"));
        assert_eq!(PathBuf::from(lines[3]), dir.path().join("data").join("token.json"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_leaves_idle() {
        let dir = worker_dir("");
        let mut config = dev_config(dir.path());
        config.interpreter_override = Some("/nonexistent/interpreter".to_string());
        let supervisor = BackendSupervisor::new(config);

        assert!(supervisor.start().await.is_none());
        let status = supervisor.status();
        assert!(!status.running && !status.starting);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_during_start_cancels_spawn() {
        let dir = worker_dir("sleep 30\n");
        let supervisor = BackendSupervisor::new(dev_config(dir.path()));

        let Ok(StartTicket::Fresh(generation)) = supervisor.begin_start() else {
            panic!("expected a fresh start");
        };
        supervisor.stop();
        assert!(matches!(
            supervisor.launch(generation).await,
            Err(ShellError::StartCancelled)
        ));
        assert!(!supervisor.is_running());
        assert!(supervisor.start().await.is_some());
        supervisor.shutdown().await;
    }
}
