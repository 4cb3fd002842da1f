// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry points wiring sessions, pool, transports, and caches together.
//!
//! Every public operation returns a serialisable result object with a
//! `success` flag; typed errors are folded into it rather than bubbled.
//! Per team pair, a dedicated mutex serialises the `execute_tell` path;
//! it is held from before `get_or_create` until the in-flight entry
//! reaches a terminal status (moving into a background waiter when the
//! caller stops waiting), which is what keeps requests FIFO per pair and
//! makes `Busy`/`NotReady` unreachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex as AsyncMutex, OwnedMutexGuard, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheStats, EntryKind, EntryStatus};
use crate::config::TeamsConfig;
use crate::error::IrisError;
use crate::events::{EventBus, IrisEvent};
use crate::pool::{pool_key, PoolProcessStatus, ProcessPool};
use crate::session::SessionManager;
use crate::store::{ProcessState, TeamSession};
use crate::transport::{command, Transport, TransportStatus};

/// Upper bound on concurrent spawns in parallel `wake_all`.
const PARALLEL_WAKE_PERMITS: usize = 2;

/// Result of a `tell`.
#[derive(Debug, Serialize)]
pub struct TellResult {
    pub success: bool,
    /// True when the tell was dispatched without waiting; the entry
    /// drains in the background.
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<u64>,
}

impl TellResult {
    fn completed(session_id: String, entry_id: u64, response: String) -> Self {
        Self {
            success: true,
            is_async: false,
            response: Some(response),
            error: None,
            error_code: None,
            session_id: Some(session_id),
            entry_id: Some(entry_id),
        }
    }

    fn dispatched(session_id: String, entry_id: u64) -> Self {
        Self {
            success: true,
            is_async: true,
            response: None,
            error: None,
            error_code: None,
            session_id: Some(session_id),
            entry_id: Some(entry_id),
        }
    }

    fn failed(err: &IrisError, session_id: Option<String>, entry_id: Option<u64>) -> Self {
        Self {
            success: false,
            is_async: false,
            response: None,
            error: Some(err.to_string()),
            error_code: Some(err.code().as_str()),
            session_id,
            entry_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WakeStatus {
    Awake,
    Waking,
    Error,
}

#[derive(Debug, Serialize)]
pub struct WakeResult {
    pub team: String,
    pub status: WakeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WakeAllResult {
    pub success: bool,
    pub results: Vec<WakeResult>,
}

#[derive(Debug, Serialize)]
pub struct SleepResult {
    pub success: bool,
    pub team: String,
    /// Whether a live process was actually torn down.
    pub was_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct IsAwakeResult {
    pub team: String,
    pub awake: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TransportStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportEntry {
    pub id: u64,
    pub kind: EntryKind,
    pub status: EntryStatus,
    pub tell: String,
    pub created_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    pub messages: usize,
}

#[derive(Debug, Serialize)]
pub struct ReportResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<TeamSession>,
    pub entries: Vec<ReportEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CacheStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TeamInfo {
    pub name: String,
    pub path: String,
    pub remote: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<TransportStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ForkResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Orchestrator {
    config: Arc<TeamsConfig>,
    sessions: Arc<SessionManager>,
    pool: Arc<ProcessPool>,
    events: EventBus,
    /// Per-pool-key serialisation mutexes. Never reclaimed; bounded by
    /// the number of configured pairs.
    locks: parking_lot::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Callers currently parked on a key's mutex, for queue-length
    /// reporting.
    waiting: parking_lot::Mutex<HashMap<String, Arc<AtomicUsize>>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<TeamsConfig>,
        sessions: Arc<SessionManager>,
        pool: Arc<ProcessPool>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        spawn_state_listener(sessions.clone(), events.clone(), shutdown);
        Arc::new(Self {
            config,
            sessions,
            pool,
            events,
            locks: parking_lot::Mutex::new(HashMap::new()),
            waiting: parking_lot::Mutex::new(HashMap::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn key_lock(&self, key: &str) -> Arc<AsyncMutex<()>> {
        self.locks.lock().entry(key.to_owned()).or_default().clone()
    }

    fn waiting_counter(&self, key: &str) -> Arc<AtomicUsize> {
        self.waiting.lock().entry(key.to_owned()).or_default().clone()
    }

    /// Route one message to a team's agent.
    ///
    /// With `wait`, blocks until the reply completes (or `timeout`
    /// elapses; the entry keeps draining and the bookkeeping runs from a
    /// background waiter). Without `wait`, returns as soon as the frame
    /// is on the wire.
    pub async fn tell(
        &self,
        from_team: &str,
        to_team: &str,
        message: &str,
        wait: bool,
        timeout: Duration,
    ) -> TellResult {
        match self.tell_inner(from_team, to_team, message, wait, timeout).await {
            Ok(result) => result,
            Err((err, session_id, entry_id)) => {
                warn!(from_team, to_team, error = %err, "tell failed");
                TellResult::failed(&err, session_id, entry_id)
            }
        }
    }

    async fn tell_inner(
        &self,
        from_team: &str,
        to_team: &str,
        message: &str,
        wait: bool,
        timeout: Duration,
    ) -> Result<TellResult, (IrisError, Option<String>, Option<u64>)> {
        if self.config.team(to_team).is_none() {
            return Err((IrisError::TeamNotFound(to_team.to_owned()), None, None));
        }
        if message.trim().is_empty() {
            return Err((IrisError::Validation("message must not be empty".into()), None, None));
        }

        let session = self
            .sessions
            .get_or_create(from_team, to_team)
            .await
            .map_err(|e| (e, None, None))?;
        let sid = session.session_id;
        let key = pool_key(from_team, to_team);

        // Serialise per pair: the guard is held until the entry reaches a
        // terminal status, so the next tell for this pair cannot race
        // `execute_tell`.
        let counter = self.waiting_counter(&key);
        counter.fetch_add(1, Ordering::SeqCst);
        let guard = self.key_lock(&key).lock_owned().await;
        counter.fetch_sub(1, Ordering::SeqCst);

        let cache =
            self.sessions.cache(&sid).await.map_err(|e| (e, Some(sid.clone()), None))?;

        let (transport, spawned) =
            match self.pool.get_or_create(to_team, &sid, from_team, &cache).await {
                Ok(pair) => pair,
                Err(e) => {
                    let _ = self.sessions.update_process_state(&sid, ProcessState::Stopped).await;
                    return Err((e, Some(sid), None));
                }
            };
        if spawned {
            self.record_spawn_debug(&sid, to_team, &transport).await;
        }

        let entry = cache.start_entry(EntryKind::Tell, message);
        self.sessions
            .update_process_state(&sid, ProcessState::Processing)
            .await
            .map_err(|e| (e, Some(sid.clone()), Some(entry.id())))?;

        if let Err(e) = transport.execute_tell(entry.clone()).await {
            let _ = self.sessions.update_process_state(&sid, ProcessState::Stopped).await;
            return Err((e, Some(sid), Some(entry.id())));
        }

        if !wait {
            self.finish_in_background(guard, entry.clone(), sid.clone());
            return Ok(TellResult::dispatched(sid, entry.id()));
        }

        match tokio::time::timeout(timeout, entry.wait_terminal()).await {
            Ok(EntryStatus::Completed) => {
                self.sessions
                    .record_completion(&sid)
                    .await
                    .map_err(|e| (e, Some(sid.clone()), Some(entry.id())))?;
                drop(guard);
                Ok(TellResult::completed(sid, entry.id(), entry.assistant_text()))
            }
            Ok(_terminal) => {
                let _ = self.sessions.update_process_state(&sid, ProcessState::Stopped).await;
                drop(guard);
                Err((IrisError::ProcessExited, Some(sid), Some(entry.id())))
            }
            Err(_elapsed) => {
                // Abandon the wait only. The guard moves into the
                // background waiter so the pair stays serialised until
                // this entry is done.
                let entry_id = entry.id();
                self.finish_in_background(guard, entry, sid.clone());
                Err((IrisError::Timeout(timeout), Some(sid), Some(entry_id)))
            }
        }
    }

    /// Hold the pair's guard until the entry finishes, then run the same
    /// completion bookkeeping a foreground waiter would have run.
    fn finish_in_background(
        &self,
        guard: OwnedMutexGuard<()>,
        entry: Arc<CacheEntry>,
        session_id: String,
    ) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let status = entry.wait_terminal().await;
            match status {
                EntryStatus::Completed => {
                    if let Err(e) = sessions.record_completion(&session_id).await {
                        warn!(session_id, error = %e, "background completion bookkeeping failed");
                    }
                }
                EntryStatus::Errored | EntryStatus::Terminated => {
                    let _ =
                        sessions.update_process_state(&session_id, ProcessState::Stopped).await;
                }
                EntryStatus::Active => {}
            }
            drop(guard);
        });
    }

    async fn record_spawn_debug(&self, sid: &str, to_team: &str, transport: &Transport) {
        let Some(launch_command) = transport.launch_command() else { return };
        let snapshot = self
            .config
            .team(to_team)
            .and_then(|team| serde_json::to_string(team).ok())
            .unwrap_or_default();
        if let Err(e) = self.sessions.record_spawn_debug(sid, &launch_command, &snapshot).await {
            warn!(session_id = sid, error = %e, "failed to record spawn debug info");
        }
    }

    /// Best-effort spawn without sending a user message.
    pub async fn wake(&self, team: &str, from_team: &str) -> WakeResult {
        if self.config.team(team).is_none() {
            return WakeResult {
                team: team.to_owned(),
                status: WakeStatus::Error,
                session_id: None,
                pid: None,
                error: Some(IrisError::TeamNotFound(team.to_owned()).to_string()),
            };
        }
        let session = match self.sessions.get_or_create(from_team, team).await {
            Ok(session) => session,
            Err(e) => {
                return WakeResult {
                    team: team.to_owned(),
                    status: WakeStatus::Error,
                    session_id: None,
                    pid: None,
                    error: Some(e.to_string()),
                };
            }
        };
        let sid = session.session_id;
        let _guard = self.key_lock(&pool_key(from_team, team)).lock_owned().await;
        let cache = match self.sessions.cache(&sid).await {
            Ok(cache) => cache,
            Err(e) => {
                return WakeResult {
                    team: team.to_owned(),
                    status: WakeStatus::Error,
                    session_id: Some(sid),
                    pid: None,
                    error: Some(e.to_string()),
                };
            }
        };
        match self.pool.get_or_create(team, &sid, from_team, &cache).await {
            Ok((transport, spawned)) => {
                if spawned {
                    self.record_spawn_debug(&sid, team, &transport).await;
                }
                let status = match transport.status() {
                    TransportStatus::Spawning => WakeStatus::Waking,
                    _ => WakeStatus::Awake,
                };
                WakeResult {
                    team: team.to_owned(),
                    status,
                    session_id: Some(sid),
                    pid: transport.pid(),
                    error: None,
                }
            }
            Err(e) => {
                let _ = self.sessions.update_process_state(&sid, ProcessState::Stopped).await;
                WakeResult {
                    team: team.to_owned(),
                    status: WakeStatus::Error,
                    session_id: Some(sid),
                    pid: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Terminate the pair's process. Idempotent; `force` skips the
    /// graceful signal.
    pub async fn sleep(&self, team: &str, from_team: &str, force: bool) -> SleepResult {
        if self.config.team(team).is_none() {
            return SleepResult {
                success: false,
                team: team.to_owned(),
                was_running: false,
                error: Some(IrisError::TeamNotFound(team.to_owned()).to_string()),
            };
        }
        let key = pool_key(from_team, team);
        let was_running = self.pool.terminate_process(&key, force).await;
        if let Ok(Some(session)) = self.sessions.get(from_team, team).await {
            let _ = self
                .sessions
                .update_process_state(&session.session_id, ProcessState::Stopped)
                .await;
        }
        SleepResult { success: true, team: team.to_owned(), was_running, error: None }
    }

    /// Wake every configured team. Sequential by default; parallel mode
    /// runs under a small semaphore and is resource-unstable; callers
    /// should prefer sequential.
    pub async fn wake_all(&self, from_team: &str, parallel: bool) -> WakeAllResult {
        let names = self.config.team_names();
        let results = if parallel {
            let semaphore = Arc::new(Semaphore::new(PARALLEL_WAKE_PERMITS));
            let wakes = names.iter().map(|name| {
                let semaphore = semaphore.clone();
                async move {
                    // A closed semaphore is impossible here; treat an
                    // acquire failure as a skipped wake.
                    let Ok(_permit) = semaphore.acquire().await else {
                        return WakeResult {
                            team: name.clone(),
                            status: WakeStatus::Error,
                            session_id: None,
                            pid: None,
                            error: Some("wake semaphore closed".into()),
                        };
                    };
                    self.wake(name, from_team).await
                }
            });
            futures_util::future::join_all(wakes).await
        } else {
            let mut results = Vec::with_capacity(names.len());
            for name in &names {
                results.push(self.wake(name, from_team).await);
            }
            results
        };
        let success = results.iter().all(|r| r.status != WakeStatus::Error);
        WakeAllResult { success, results }
    }

    pub async fn is_awake(&self, team: &str, from_team: &str) -> IsAwakeResult {
        let key = pool_key(from_team, team);
        match self.pool.get_by_key(&key).await {
            Some(transport) => {
                let status = transport.status();
                IsAwakeResult {
                    team: team.to_owned(),
                    awake: matches!(status, TransportStatus::Ready | TransportStatus::Busy),
                    status: Some(status),
                    pid: transport.pid(),
                    session_id: Some(transport.session_id().to_owned()),
                }
            }
            None => IsAwakeResult {
                team: team.to_owned(),
                awake: false,
                status: None,
                pid: None,
                session_id: None,
            },
        }
    }

    /// Snapshot of the pair's session row and cache entries.
    pub async fn report(&self, from_team: &str, to_team: &str) -> ReportResult {
        let session = match self.sessions.get(from_team, to_team).await {
            Ok(session) => session,
            Err(e) => {
                return ReportResult {
                    success: false,
                    session: None,
                    entries: Vec::new(),
                    stats: None,
                    error: Some(e.to_string()),
                };
            }
        };
        let Some(session) = session else {
            return ReportResult {
                success: true,
                session: None,
                entries: Vec::new(),
                stats: None,
                error: None,
            };
        };
        let (entries, stats) = match self.sessions.cache_if_live(&session.session_id) {
            Some(cache) => {
                let entries = cache
                    .entries()
                    .iter()
                    .map(|entry| ReportEntry {
                        id: entry.id(),
                        kind: entry.kind(),
                        status: entry.status(),
                        tell: entry.tell_string().to_owned(),
                        created_at: entry.created_at(),
                        completed_at: entry.completed_at(),
                        messages: entry.message_count(),
                    })
                    .collect();
                (entries, Some(cache.stats()))
            }
            None => (Vec::new(), None),
        };
        ReportResult { success: true, session: Some(session), entries, stats, error: None }
    }

    /// Configured teams with their live process state, if any.
    pub async fn teams(&self) -> Vec<TeamInfo> {
        let mut infos = Vec::with_capacity(self.config.teams.len());
        for (name, team) in &self.config.teams {
            let process = self.pool.get_process(name).await;
            infos.push(TeamInfo {
                name: name.clone(),
                path: team.path.display().to_string(),
                remote: team.is_remote(),
                process: process.as_ref().map(|t| t.status()),
                session_id: process.map(|t| t.session_id().to_owned()),
            });
        }
        infos
    }

    /// The identity this workspace reports to callers asking "who am I
    /// talking to".
    pub fn team_name(&self) -> Option<String> {
        self.config.settings.team_name.clone()
    }

    /// Spawn a detached interactive child branched off the pair's
    /// conversation. Not pooled; the caller owns the terminal.
    pub async fn fork(&self, team: &str, from_team: &str) -> ForkResult {
        let Some(team_config) = self.config.team(team).cloned() else {
            return ForkResult {
                success: false,
                pid: None,
                session_id: None,
                error: Some(IrisError::TeamNotFound(team.to_owned()).to_string()),
            };
        };
        let session = match self.sessions.get_or_create(from_team, team).await {
            Ok(session) => session,
            Err(e) => {
                return ForkResult {
                    success: false,
                    pid: None,
                    session_id: None,
                    error: Some(e.to_string()),
                };
            }
        };
        let sid = session.session_id;
        let mcp_path = match command::write_mcp_config(
            &team_config,
            &sid,
            &self.config.settings,
        )
        .await
        {
            Ok(path) => path,
            Err(e) => {
                return ForkResult {
                    success: false,
                    pid: None,
                    session_id: Some(sid),
                    error: Some(e.to_string()),
                };
            }
        };
        let spec = command::fork_command(&team_config, &sid, &mcp_path, true);
        // Detached: no piped stdio and no kill-on-drop; the forked child
        // outlives this call.
        let mut cmd = tokio::process::Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());
        if let Some(ref cwd) = spec.cwd {
            cmd.current_dir(cwd);
        }
        match cmd.spawn() {
            Ok(child) => ForkResult {
                success: true,
                pid: child.id(),
                session_id: Some(sid),
                error: None,
            },
            Err(e) => ForkResult {
                success: false,
                pid: None,
                session_id: Some(sid),
                error: Some(e.to_string()),
            },
        }
    }

    /// Best-effort cancel byte to the pair's live child.
    pub async fn cancel(&self, from_team: &str, to_team: &str) -> bool {
        let key = pool_key(from_team, to_team);
        match self.pool.get_by_key(&key).await {
            Some(transport) => {
                transport.cancel().await;
                true
            }
            None => false,
        }
    }

    /// Pool snapshot with per-key queue lengths overlaid.
    pub async fn pool_status(&self) -> Vec<PoolProcessStatus> {
        let mut statuses = self.pool.status().await;
        let waiting = self.waiting.lock();
        for status in &mut statuses {
            if let Some(counter) = waiting.get(&status.key) {
                status.queue_length = counter.load(Ordering::SeqCst);
            }
        }
        statuses
    }

    /// Graceful drain: terminate every pooled process, then mark all
    /// persisted sessions stopped.
    pub async fn shutdown(&self) {
        self.pool.terminate_all().await;
        if let Err(e) = self.sessions.reset_runtime_state().await {
            warn!(error = %e, "failed to reset session state at shutdown");
        }
    }
}

/// Map pool-reported transport transitions onto the persisted
/// `process_state` intent field.
fn spawn_state_listener(
    sessions: Arc<SessionManager>,
    events: EventBus,
    shutdown: CancellationToken,
) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(IrisEvent::ProcessStatus { from_team, to_team, status, .. }) => {
                        let state = match status.as_str() {
                            "spawning" => ProcessState::Spawning,
                            "ready" => ProcessState::Idle,
                            "busy" => ProcessState::Processing,
                            "stopped" | "error" => ProcessState::Stopped,
                            _ => continue,
                        };
                        let row = match sessions.get(&from_team, &to_team).await {
                            Ok(Some(row)) => row,
                            _ => continue,
                        };
                        if let Err(e) =
                            sessions.update_process_state(&row.session_id, state).await
                        {
                            debug!(error = %e, "state listener update failed");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "state listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
