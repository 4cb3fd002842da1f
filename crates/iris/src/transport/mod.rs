// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Child process lifecycle and stdio framing.
//!
//! One transport owns one agent child (local fork or remote via ssh), the
//! newline-delimited JSON framing over its stdio, and the pointer to the
//! at-most-one in-flight cache entry. Local and remote children share the
//! state machine and framing; they differ only in how the command is
//! wrapped (see [`command`]) and in `pid()` nullability.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::CacheEntry;
use crate::config::Team;
use crate::error::IrisError;
use crate::events::{EventBus, IrisEvent};
use crate::protocol::{self, StreamMessage};

pub mod command;

pub use command::CommandSpec;

/// How long a terminating child gets before the kill escalates.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Transport lifecycle states.
///
/// ```text
/// STOPPED ──spawn()──▶ SPAWNING ──init+result──▶ READY ──executeTell──▶ BUSY
///                         │                        ▲                     │
///                         └─timeout/err─▶ ERROR    └───────result────────┘
/// READY / BUSY ──terminate()──▶ TERMINATING ──child exit──▶ STOPPED
/// any state ──child exit──▶ STOPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportStatus {
    Stopped,
    Spawning,
    Ready,
    Busy,
    Terminating,
    Error,
}

impl TransportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Spawning => "spawning",
            Self::Ready => "ready",
            Self::Busy => "busy",
            Self::Terminating => "terminating",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime counters surfaced on the dashboard.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransportMetrics {
    pub uptime_secs: u64,
    pub messages_processed: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response_at: Option<u64>,
}

/// State shared with the stdout reader task.
#[derive(Debug)]
struct Shared {
    key: String,
    from_team: String,
    to_team: String,
    session_id: String,
    current: parking_lot::Mutex<Option<Arc<CacheEntry>>>,
    init_seen: AtomicBool,
    messages_processed: AtomicU64,
    /// Epoch millis of the last `result`; 0 = never.
    last_response_at: AtomicU64,
    status_tx: watch::Sender<TransportStatus>,
    events: EventBus,
}

impl Shared {
    fn status(&self) -> TransportStatus {
        *self.status_tx.borrow()
    }

    /// Publish a transition on the watch channel and the event bus.
    /// Same-value writes are dropped so observers see transitions only.
    fn set_status(&self, status: TransportStatus) {
        if *self.status_tx.borrow() == status {
            return;
        }
        self.status_tx.send_replace(status);
        self.events.emit(IrisEvent::ProcessStatus {
            key: self.key.clone(),
            from_team: self.from_team.clone(),
            to_team: self.to_team.clone(),
            status: status.as_str().to_owned(),
        });
    }

    /// Route one inbound stdout line: parse, append to the current entry,
    /// inspect for the init/result sentinels.
    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        let Some(msg) = StreamMessage::parse(line) else {
            warn!(key = %self.key, line, "dropping unparseable stdout token");
            return;
        };
        let is_init = msg.is_init();
        let is_result = msg.is_result();

        let current = self.current.lock().clone();
        if let Some(ref entry) = current {
            self.events.emit(IrisEvent::CacheStream {
                session_id: self.session_id.clone(),
                entry_id: entry.id(),
                message: msg.raw.clone(),
            });
            if entry.append(msg).is_err() {
                // Terminal entry; internal bug; swallowed to preserve
                // liveness.
                debug!(key = %self.key, entry = entry.id(), "append after terminal dropped");
            }
        }

        if is_init {
            self.init_seen.store(true, Ordering::SeqCst);
        }
        if is_result {
            self.last_response_at.store(protocol::epoch_ms(), Ordering::SeqCst);
            self.messages_processed.fetch_add(1, Ordering::SeqCst);
            let finished = self.current.lock().take();
            // Flip back to READY before the entry's terminal transition:
            // a waiter released by `complete()` must observe a transport
            // that can already accept the next tell.
            match self.status() {
                TransportStatus::Busy => self.set_status(TransportStatus::Ready),
                TransportStatus::Spawning if self.init_seen.load(Ordering::SeqCst) => {
                    self.set_status(TransportStatus::Ready);
                }
                _ => {}
            }
            if let Some(entry) = finished {
                entry.complete();
            }
        }
    }

    /// Spontaneous child exit (stdout EOF or read error).
    fn on_exit(&self) {
        if let Some(entry) = self.current.lock().take() {
            entry.terminate();
        }
        if self.status() != TransportStatus::Stopped {
            self.set_status(TransportStatus::Stopped);
        }
    }
}

/// Per-spawn mutable state.
#[derive(Default, Debug)]
struct RunState {
    pid: Option<u32>,
    spawn_time: Option<Instant>,
    launch_command: Option<String>,
    mcp_config: Option<PathBuf>,
    reader_cancel: Option<CancellationToken>,
}

/// Adapter owning one agent child's stdio and lifecycle.
#[derive(Debug)]
pub struct Transport {
    key: String,
    team_name: String,
    team: Team,
    session_id: String,
    shared: Arc<Shared>,
    child: AsyncMutex<Option<tokio::process::Child>>,
    stdin: AsyncMutex<Option<ChildStdin>>,
    state: parking_lot::Mutex<RunState>,
}

impl Transport {
    pub fn new(
        key: impl Into<String>,
        team_name: impl Into<String>,
        team: Team,
        session_id: impl Into<String>,
        events: EventBus,
    ) -> Self {
        let key = key.into();
        let session_id = session_id.into();
        let (from_team, to_team) = key.split_once("->").unwrap_or(("", key.as_str()));
        let (from_team, to_team) = (from_team.to_owned(), to_team.to_owned());
        let (status_tx, _) = watch::channel(TransportStatus::Stopped);
        Self {
            shared: Arc::new(Shared {
                key: key.clone(),
                from_team,
                to_team,
                session_id: session_id.clone(),
                current: parking_lot::Mutex::new(None),
                init_seen: AtomicBool::new(false),
                messages_processed: AtomicU64::new(0),
                last_response_at: AtomicU64::new(0),
                status_tx,
                events,
            }),
            key,
            team_name: team_name.into(),
            team,
            session_id,
            child: AsyncMutex::new(None),
            stdin: AsyncMutex::new(None),
            state: parking_lot::Mutex::new(RunState::default()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn team_name(&self) -> &str {
        &self.team_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_remote(&self) -> bool {
        self.team.is_remote()
    }

    pub fn status(&self) -> TransportStatus {
        self.shared.status()
    }

    /// Subscribe to status transitions; the receiver observes the current
    /// value immediately.
    pub fn subscribe_status(&self) -> watch::Receiver<TransportStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Initialised with no entry in flight.
    pub fn ready(&self) -> bool {
        self.status() == TransportStatus::Ready
    }

    /// Initialised with an entry in flight.
    pub fn busy(&self) -> bool {
        self.status() == TransportStatus::Busy
    }

    /// Child pid; always `None` for remote transports.
    pub fn pid(&self) -> Option<u32> {
        if self.is_remote() {
            return None;
        }
        self.state.lock().pid
    }

    pub fn metrics(&self) -> TransportMetrics {
        let uptime_secs = self
            .state
            .lock()
            .spawn_time
            .map(|t| t.elapsed().as_secs())
            .unwrap_or_default();
        let last = self.shared.last_response_at.load(Ordering::SeqCst);
        TransportMetrics {
            uptime_secs,
            messages_processed: self.shared.messages_processed.load(Ordering::SeqCst),
            last_response_at: (last > 0).then_some(last),
        }
    }

    /// Epoch millis of the last `result`, for LRU victim selection.
    pub fn last_response_at(&self) -> Option<u64> {
        let last = self.shared.last_response_at.load(Ordering::SeqCst);
        (last > 0).then_some(last)
    }

    pub fn spawn_time(&self) -> Option<Instant> {
        self.state.lock().spawn_time
    }

    /// Exact command line of the last spawn, shell-quoted.
    pub fn launch_command(&self) -> Option<String> {
        self.state.lock().launch_command.clone()
    }

    /// Register the transient MCP config file to delete at terminate.
    pub fn set_mcp_config(&self, path: PathBuf) {
        self.state.lock().mcp_config = Some(path);
    }

    /// Start the child and drive it through warm-up.
    ///
    /// Writes the SPAWN entry's tell string to stdin as soon as the pipe
    /// exists, then waits until a `system/init` message has been seen AND
    /// the spawn entry completes via `result`. Either condition missed
    /// within `timeout` fails the spawn and parks the transport in ERROR.
    pub async fn spawn(
        &self,
        spawn_entry: Arc<CacheEntry>,
        spec: CommandSpec,
        timeout: Duration,
    ) -> Result<(), IrisError> {
        let status = self.status();
        if status != TransportStatus::Stopped {
            return Err(IrisError::Spawn(format!("cannot spawn from {status}")));
        }
        self.shared.set_status(TransportStatus::Spawning);
        self.shared.init_seen.store(false, Ordering::SeqCst);

        let mut child = match spec.to_tokio().spawn() {
            Ok(child) => child,
            Err(e) => {
                self.shared.set_status(TransportStatus::Error);
                return Err(IrisError::Spawn(e.to_string()));
            }
        };
        let pid = child.id();
        let (stdout, stderr, mut stdin) =
            match (child.stdout.take(), child.stderr.take(), child.stdin.take()) {
                (Some(out), err, Some(input)) => (out, err, input),
                _ => {
                    self.shared.set_status(TransportStatus::Error);
                    return Err(IrisError::Spawn("child stdio was not piped".into()));
                }
            };

        let reader_cancel = CancellationToken::new();
        {
            let mut st = self.state.lock();
            st.pid = pid;
            st.spawn_time = Some(Instant::now());
            st.launch_command = Some(spec.shell_line());
            st.reader_cancel = Some(reader_cancel.clone());
        }
        *self.child.lock().await = Some(child);
        // Route warm-up output into the spawn entry before the first byte
        // can arrive.
        *self.shared.current.lock() = Some(spawn_entry.clone());

        tokio::spawn(read_stdout(self.shared.clone(), stdout, reader_cancel));
        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(self.key.clone(), stderr));
        }

        let frame = protocol::user_frame(spawn_entry.tell_string());
        if let Err(e) = write_frame(&mut stdin, frame.as_bytes()).await {
            self.shared.set_status(TransportStatus::Error);
            self.shared.current.lock().take();
            spawn_entry.error(format!("stdin write failed: {e}"));
            return Err(IrisError::Spawn(e.to_string()));
        }
        *self.stdin.lock().await = Some(stdin);

        match tokio::time::timeout(timeout, spawn_entry.wait_terminal()).await {
            Err(_) => {
                self.shared.current.lock().take();
                spawn_entry.error("spawn timed out");
                self.shared.set_status(TransportStatus::Error);
                Err(IrisError::SpawnTimeout(timeout))
            }
            Ok(crate::cache::EntryStatus::Completed) => {
                if self.shared.init_seen.load(Ordering::SeqCst) {
                    Ok(())
                } else {
                    self.shared.set_status(TransportStatus::Error);
                    Err(IrisError::Spawn("result arrived before system/init".into()))
                }
            }
            Ok(other) => {
                self.shared.set_status(TransportStatus::Error);
                let detail = spawn_entry
                    .error_detail()
                    .unwrap_or_else(|| format!("spawn entry ended {other}"));
                Err(IrisError::Spawn(detail))
            }
        }
    }

    /// Bind `entry` as the in-flight request and put its frame on the
    /// wire. Requires READY with no current entry; the caller awaits the
    /// entry's status signal, not this method.
    pub async fn execute_tell(&self, entry: Arc<CacheEntry>) -> Result<(), IrisError> {
        match self.status() {
            TransportStatus::Ready => {}
            TransportStatus::Busy => return Err(IrisError::Busy),
            _ => return Err(IrisError::NotReady),
        }
        {
            let mut current = self.shared.current.lock();
            if current.is_some() {
                return Err(IrisError::Busy);
            }
            *current = Some(entry.clone());
        }
        self.shared.set_status(TransportStatus::Busy);

        let frame = protocol::user_frame(entry.tell_string());
        let mut stdin_guard = self.stdin.lock().await;
        let result = match stdin_guard.as_mut() {
            Some(stdin) => write_frame(stdin, frame.as_bytes()).await,
            None => Err(std::io::Error::other("stdin closed")),
        };
        drop(stdin_guard);

        if let Err(e) = result {
            warn!(key = %self.key, error = %e, "stdin write failed; treating as exit");
            self.shared.current.lock().take();
            entry.terminate();
            self.shared.set_status(TransportStatus::Stopped);
            return Err(IrisError::ProcessExited);
        }
        Ok(())
    }

    /// Best-effort cancel: write the ESC byte to stdin. Status is
    /// unchanged.
    pub async fn cancel(&self) {
        let mut guard = self.stdin.lock().await;
        if let Some(stdin) = guard.as_mut() {
            let _ = stdin.write_all(&[protocol::CANCEL_BYTE]).await;
            let _ = stdin.flush().await;
        }
    }

    /// Graceful shutdown: signal the child, force-kill after the grace
    /// window, mark a still-active entry TERMINATED, and release
    /// transient state. Idempotent.
    pub async fn terminate(&self) {
        self.terminate_with(false).await;
    }

    /// `force = true` skips the graceful signal and goes straight to the
    /// kill.
    pub async fn terminate_with(&self, force: bool) {
        if self.status() != TransportStatus::Stopped {
            self.shared.set_status(TransportStatus::Terminating);
        }

        let reader_cancel = self.state.lock().reader_cancel.take();
        if let Some(token) = reader_cancel {
            token.cancel();
        }

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            if force {
                let _ = child.start_kill();
                let _ = child.wait().await;
            } else {
                if let Some(pid) = child.id() {
                    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                }
                if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_err() {
                    warn!(key = %self.key, "grace elapsed, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        *self.stdin.lock().await = None;

        if let Some(entry) = self.shared.current.lock().take() {
            entry.terminate();
        }

        let mcp_config = self.state.lock().mcp_config.take();
        if let Some(path) = mcp_config {
            command::remove_mcp_config(&self.team, &path).await;
        }

        {
            let mut st = self.state.lock();
            st.pid = None;
            st.spawn_time = None;
        }
        self.shared.init_seen.store(false, Ordering::SeqCst);
        self.shared.set_status(TransportStatus::Stopped);
    }
}

async fn write_frame(stdin: &mut ChildStdin, bytes: &[u8]) -> std::io::Result<()> {
    stdin.write_all(bytes).await?;
    stdin.flush().await
}

/// Stdout reader: accumulate newline-delimited tokens, parse each, route
/// into the current entry, and watch for the init/result sentinels. EOF
/// or a read error counts as a spontaneous child exit.
async fn read_stdout(shared: Arc<Shared>, stdout: ChildStdout, cancel: CancellationToken) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => match line {
                Ok(Some(line)) => shared.handle_line(&line),
                Ok(None) => break,
                Err(e) => {
                    debug!(key = %shared.key, error = %e, "stdout read error");
                    break;
                }
            }
        }
    }
    shared.on_exit();
}

/// Drain stderr into the log so child diagnostics are not lost.
async fn log_stderr(key: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(key = %key, "agent: {line}");
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
