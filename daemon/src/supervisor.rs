/// Lifecycle of the managed application process.
///
/// A `Supervisor` owns at most one child process at a time. Launch and stop
/// serialize on a single async mutex that holds the [`ManagedProcess`], so a
/// second launch issued while the first is still checking for updates waits
/// and then finds the process already running. The liveness poll never
/// waits on that mutex: if a launch or stop is in flight the poll is skipped.
///
/// The child's stdout and stderr are drained by one reader task that filters
/// each line and forwards it as [`LauncherEvent::Output`].
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::companion::{Companion, CompanionLaunch};
use crate::config::ConfigError;
use crate::event::LauncherEvent;
use crate::output::filter_line;
use crate::updater::Updater;

/// How long `stop` waits after the graceful signal before killing the child.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No managed process.
    Idle,
    /// Launch in progress: update check, companion, spawn.
    Starting,
    /// The managed process is alive.
    Running,
    /// Stop requested; waiting for the process and its reader to finish.
    Stopping,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SupervisorState::Idle => "idle",
            SupervisorState::Starting => "starting",
            SupervisorState::Running => "running",
            SupervisorState::Stopping => "stopping",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Spawned { pid: Option<u32> },
    /// A live process already existed; nothing was spawned.
    AlreadyRunning,
    /// Spawning failed. The reason was sent as an output line.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type Observer = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct ObserverSet {
    next_id: u64,
    entries: Vec<(ObserverId, Observer)>,
}

/// The live child plus everything that has to be torn down with it.
struct ManagedProcess {
    child: Child,
    pid: Option<u32>,
    reader: JoinHandle<()>,
    /// Setting this to `true` tells the reader to stop forwarding output.
    stop_tx: watch::Sender<bool>,
}

impl ManagedProcess {
    fn spawn(executable: &Path, events: mpsc::Sender<LauncherEvent>) -> io::Result<Self> {
        let mut child = Command::new(executable)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let (stop_tx, stop_rx) = watch::channel(false);
        let reader = tokio::spawn(capture_output(
            child.stdout.take(),
            child.stderr.take(),
            events,
            stop_rx,
        ));

        Ok(Self {
            child,
            pid,
            reader,
            stop_tx,
        })
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Signals the reader, asks the child to exit, waits for both.
    async fn shutdown(mut self, grace: Duration) -> Option<ExitStatus> {
        let _ = self.stop_tx.send(true);

        if let Err(e) = request_termination(&mut self.child) {
            debug!("Termination request failed (process may have exited): {e}");
        }

        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!("Failed to wait for MAC to exit: {e}");
                None
            }
            Err(_) => {
                warn!("MAC did not exit within {}s, killing it", grace.as_secs());
                if let Err(e) = self.child.kill().await {
                    error!("Failed to kill MAC: {e}");
                }
                self.child.wait().await.ok()
            }
        };

        if let Err(e) = self.reader.await {
            warn!("Output reader task ended abnormally: {e}");
        }
        status
    }
}

#[cfg(unix)]
fn request_termination(child: &mut Child) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return Ok(());
    };
    let pid = i32::try_from(pid).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    kill(Pid::from_raw(pid), Signal::SIGINT).map_err(io::Error::from)
}

#[cfg(not(unix))]
fn request_termination(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

struct Inner {
    executable: PathBuf,
    updater: Arc<Updater>,
    companion: Companion,
    grace: Duration,
    process: Mutex<Option<ManagedProcess>>,
    state: watch::Sender<SupervisorState>,
    observers: StdMutex<ObserverSet>,
}

/// Cloneable handle; all clones supervise the same process.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(executable: impl Into<PathBuf>, updater: Arc<Updater>, companion: Companion) -> Self {
        Self::with_grace_period(executable, updater, companion, STOP_GRACE_PERIOD)
    }

    pub fn with_grace_period(
        executable: impl Into<PathBuf>,
        updater: Arc<Updater>,
        companion: Companion,
        grace: Duration,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            inner: Arc::new(Inner {
                executable: executable.into(),
                updater,
                companion,
                grace,
                process: Mutex::new(None),
                state,
                observers: StdMutex::new(ObserverSet::default()),
            }),
        }
    }

    /// Checks for updates if due, optionally starts the companion, then
    /// spawns the managed application.
    ///
    /// Progress and the child's output go to `events`. Spawn failures are
    /// reported there too and leave the supervisor idle; only config errors
    /// are returned.
    pub async fn launch(
        &self,
        with_companion: bool,
        events: mpsc::Sender<LauncherEvent>,
    ) -> Result<LaunchOutcome, ConfigError> {
        let mut slot = self.inner.process.lock().await;

        if slot.as_mut().is_some_and(ManagedProcess::is_alive) {
            emit(&events, "MAC is already running.").await;
            return Ok(LaunchOutcome::AlreadyRunning);
        }
        // A process that exited before the poll noticed is reaped here.
        *slot = None;

        self.set_state(SupervisorState::Starting);
        let result = self.start(with_companion, &events).await;

        let outcome = match result {
            Ok(Some(process)) => {
                let pid = process.pid;
                *slot = Some(process);
                self.set_state(SupervisorState::Running);
                info!("MAC started (pid {})", pid.map_or_else(|| "?".to_string(), |p| p.to_string()));
                Ok(LaunchOutcome::Spawned { pid })
            }
            Ok(None) => {
                self.set_state(SupervisorState::Idle);
                Ok(LaunchOutcome::Failed)
            }
            Err(e) => {
                self.set_state(SupervisorState::Idle);
                Err(e)
            }
        };
        drop(slot);
        self.notify();
        outcome
    }

    async fn start(
        &self,
        with_companion: bool,
        events: &mpsc::Sender<LauncherEvent>,
    ) -> Result<Option<ManagedProcess>, ConfigError> {
        let updater = &self.inner.updater;
        if updater.due()? {
            emit(events, "Checking for updates...").await;
            let message = updater.check_for_updates().await?;
            emit(events, message).await;
        }

        if with_companion {
            self.start_companion(events).await;
        }

        emit(events, "Launching MAC...").await;
        match ManagedProcess::spawn(&self.inner.executable, events.clone()) {
            Ok(process) => Ok(Some(process)),
            Err(e) => {
                error!("Failed to spawn {}: {e}", self.inner.executable.display());
                emit(events, format!("Failed to launch MAC: {e}")).await;
                Ok(None)
            }
        }
    }

    async fn start_companion(&self, events: &mpsc::Sender<LauncherEvent>) {
        let companion = self.inner.companion.clone();
        let name = companion.display_name.clone();
        emit(events, format!("Launching {name}...")).await;

        // Scanning the process table is blocking work.
        match tokio::task::spawn_blocking(move || companion.launch()).await {
            Ok(Ok(CompanionLaunch::Started)) => debug!("{name} launch handed to the OS"),
            Ok(Ok(CompanionLaunch::AlreadyRunning)) => {
                emit(events, format!("{name} is already running.")).await;
            }
            Ok(Err(e)) => {
                warn!("Companion launch failed: {e:#}");
                emit(events, format!("Failed to launch {name}: {e:#}")).await;
            }
            Err(e) => warn!("Companion launch task failed: {e}"),
        }
    }

    /// Stops the managed process and waits for it and its reader to finish.
    /// Observers are notified even if nothing was running.
    pub async fn stop(&self) {
        let mut slot = self.inner.process.lock().await;
        if let Some(process) = slot.take() {
            self.set_state(SupervisorState::Stopping);
            let pid = process.pid;
            let status = process.shutdown(self.inner.grace).await;
            info!(
                "MAC stopped (pid {}, {})",
                pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                status.map_or_else(|| "unknown status".to_string(), |s| s.to_string())
            );
        }
        self.set_state(SupervisorState::Idle);
        drop(slot);
        self.notify();
    }

    /// Non-blocking liveness poll. Detects a process that exited without
    /// `stop`, clears it and notifies observers. Skipped while a launch or
    /// stop holds the lifecycle lock.
    pub fn check_status(&self) -> Option<ExitStatus> {
        let Ok(mut slot) = self.inner.process.try_lock() else {
            return None;
        };
        let process = slot.as_mut()?;
        let status = match process.child.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                warn!("Failed to poll MAC: {e}");
                return None;
            }
        };

        // Dropping the process detaches the reader; it finishes on EOF.
        let exited = slot.take();
        self.set_state(SupervisorState::Idle);
        drop(slot);
        drop(exited);

        warn!("MAC exited on its own ({status})");
        self.notify();
        Some(status)
    }

    pub fn is_running(&self) -> bool {
        match self.inner.process.try_lock() {
            Ok(mut slot) => slot.as_mut().is_some_and(ManagedProcess::is_alive),
            Err(_) => self.state() == SupervisorState::Running,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner
            .process
            .try_lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|p| p.pid))
    }

    pub fn state(&self) -> SupervisorState {
        *self.inner.state.borrow()
    }

    /// Stream of state changes.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.inner.state.subscribe()
    }

    pub fn add_observer<F>(&self, observer: F) -> ObserverId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut set = self.observers();
        let id = ObserverId(set.next_id);
        set.next_id += 1;
        set.entries.push((id, Arc::new(observer)));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut set = self.observers();
        let before = set.entries.len();
        set.entries.retain(|(entry, _)| *entry != id);
        set.entries.len() != before
    }

    /// Holds the lifecycle lock while nothing is running, so no launch or
    /// stop can start until the guard is dropped. `None` if a process is
    /// alive.
    pub async fn lock_idle(&self) -> Option<IdleGuard<'_>> {
        let mut slot = self.inner.process.lock().await;
        if slot.as_mut().is_some_and(ManagedProcess::is_alive) {
            return None;
        }
        Some(IdleGuard { _slot: slot })
    }

    fn observers(&self) -> std::sync::MutexGuard<'_, ObserverSet> {
        self.inner
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            debug!("Supervisor {previous:?} -> {state:?}");
        }
    }

    /// Calls every observer in registration order, outside the list lock.
    fn notify(&self) {
        let observers: Vec<Observer> = self
            .observers()
            .entries
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in observers {
            observer();
        }
    }
}

/// Proof that the supervisor is idle and will stay so while held.
pub struct IdleGuard<'a> {
    _slot: MutexGuard<'a, Option<ManagedProcess>>,
}

async fn emit(events: &mpsc::Sender<LauncherEvent>, line: impl Into<String>) {
    let _ = events.send(LauncherEvent::Output(line.into())).await;
}

/// Forwards filtered lines from both pipes until a stop is requested, both
/// pipes reach EOF, or nobody is listening.
async fn capture_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    events: mpsc::Sender<LauncherEvent>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut stdout = stdout.map(RawLines::new);
    let mut stderr = stderr.map(RawLines::new);

    while stdout.is_some() || stderr.is_some() {
        let (stream, read) = tokio::select! {
            _ = stop_requested(&mut stop_rx) => break,
            read = next_line(&mut stdout) => ("stdout", read),
            read = next_line(&mut stderr) => ("stderr", read),
        };

        match read {
            Ok(Some(line)) => {
                let Some(line) = filter_line(&line) else {
                    continue;
                };
                // A full channel must not hold up a stop.
                tokio::select! {
                    _ = stop_requested(&mut stop_rx) => break,
                    sent = events.send(LauncherEvent::Output(line)) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(None) => close(stream, &mut stdout, &mut stderr),
            Err(e) => {
                warn!("Failed to read MAC {stream}: {e}");
                close(stream, &mut stdout, &mut stderr);
            }
        }
    }
    debug!("Output reader finished");
}

fn close<A, B>(stream: &str, stdout: &mut Option<A>, stderr: &mut Option<B>) {
    if stream == "stdout" {
        *stdout = None;
    } else {
        *stderr = None;
    }
}

/// Line reader that tolerates bytes which are not UTF-8. Partial reads stay
/// in `buf` if the read future is dropped, so it is safe inside `select!`.
struct RawLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> RawLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.buf).await?;
        if read == 0 && self.buf.is_empty() {
            return Ok(None);
        }
        let line = decode_line(&self.buf);
        self.buf.clear();
        Ok(Some(line))
    }
}

/// Strips the line terminator and replaces invalid UTF-8 with U+FFFD.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

async fn next_line<R>(lines: &mut Option<RawLines<R>>) -> io::Result<Option<String>>
where
    R: AsyncRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => std::future::pending().await,
    }
}

/// Resolves once a stop is requested. If the sender is dropped without one
/// (the process exited on its own) it never resolves, so the reader keeps
/// draining until EOF.
async fn stop_requested(stop_rx: &mut watch::Receiver<bool>) {
    if stop_rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
