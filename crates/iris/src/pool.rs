// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Keyed collection of transports with bounded capacity.
//!
//! The pool is keyed by `"<from>-><to>"`, not by session id, so a new
//! session for the same pair reuses the slot transparently. Capacity is
//! enforced with LRU eviction of READY transports; the pool never queues.
//! At-most-one-in-flight is the transport's job, and caller ordering is
//! the orchestrator's per-key mutex; the pool does neither.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EntryKind, MessageCache};
use crate::config::TeamsConfig;
use crate::error::IrisError;
use crate::events::{EventBus, IrisEvent};
use crate::protocol::epoch_ms;
use crate::transport::{command, Transport, TransportStatus};

/// Pool index for a team pair.
pub fn pool_key(from_team: &str, to_team: &str) -> String {
    format!("{from_team}->{to_team}")
}

struct PoolSlot {
    transport: Arc<Transport>,
    from_team: String,
    to_team: String,
}

/// Dashboard snapshot of one pooled process.
#[derive(Debug, Clone, Serialize)]
pub struct PoolProcessStatus {
    pub key: String,
    pub from_team: String,
    pub to_team: String,
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub status: TransportStatus,
    pub messages_processed: u64,
    pub uptime_secs: u64,
    /// Callers currently waiting on the pair's serialisation mutex;
    /// filled in by the orchestrator.
    pub queue_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_response_at: Option<u64>,
}

pub struct ProcessPool {
    inner: RwLock<HashMap<String, PoolSlot>>,
    config: Arc<TeamsConfig>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl ProcessPool {
    /// Build the pool and start its periodic health sweep.
    pub fn new(config: Arc<TeamsConfig>, events: EventBus, shutdown: CancellationToken) -> Arc<Self> {
        let pool = Arc::new(Self {
            inner: RwLock::new(HashMap::new()),
            config,
            events,
            shutdown,
        });
        tokio::spawn(health_loop(Arc::downgrade(&pool)));
        pool
    }

    /// Idempotent get-or-spawn for the pair's transport.
    ///
    /// Returns the transport and whether this call spawned it. A spawn
    /// writes the session's MCP config file, builds the agent command
    /// from the team config, creates the implicit SPAWN entry (ping) in
    /// the session cache, and blocks until warm-up completes.
    pub async fn get_or_create(
        &self,
        to_team: &str,
        session_id: &str,
        from_team: &str,
        cache: &Arc<MessageCache>,
    ) -> Result<(Arc<Transport>, bool), IrisError> {
        let key = pool_key(from_team, to_team);

        {
            let map = self.inner.read().await;
            if let Some(slot) = map.get(&key) {
                if slot.transport.status().is_live() {
                    return Ok((slot.transport.clone(), false));
                }
            }
        }

        let mut map = self.inner.write().await;
        if let Some(slot) = map.get(&key) {
            if slot.transport.status().is_live() {
                return Ok((slot.transport.clone(), false));
            }
            // Stale slot from a spontaneous exit; drop it and respawn.
            debug!(key, "dropping stale pool slot");
            map.remove(&key);
        }

        let team = self
            .config
            .team(to_team)
            .cloned()
            .ok_or_else(|| IrisError::TeamNotFound(to_team.to_owned()))?;

        if map.len() >= self.config.settings.max_processes {
            self.evict_lru(&mut map).await?;
        }

        let transport = Arc::new(Transport::new(
            key.clone(),
            to_team,
            team.clone(),
            session_id,
            self.events.clone(),
        ));

        let mcp_path = command::write_mcp_config(&team, session_id, &self.config.settings).await?;
        transport.set_mcp_config(mcp_path.clone());
        let spec = command::headless_command(&team, session_id, &mcp_path);
        let spawn_entry = cache.start_entry(EntryKind::Spawn, "ping");

        let timeout = self.config.settings.session_init_timeout();
        match transport.spawn(spawn_entry, spec, timeout).await {
            Ok(()) => {
                info!(key, session_id, pid = ?transport.pid(), "spawned agent process");
                self.events.emit(IrisEvent::ProcessSpawned {
                    key: key.clone(),
                    pid: transport.pid(),
                });
                map.insert(
                    key,
                    PoolSlot {
                        transport: transport.clone(),
                        from_team: from_team.to_owned(),
                        to_team: to_team.to_owned(),
                    },
                );
                Ok((transport, true))
            }
            Err(e) => {
                warn!(key, error = %e, "spawn failed");
                self.events.emit(IrisEvent::ProcessError {
                    team: to_team.to_owned(),
                    error: e.to_string(),
                });
                // Reset to STOPPED and reap the child; the pool keeps no
                // record of the failed transport.
                transport.terminate().await;
                Err(e)
            }
        }
    }

    /// Evict the least-recently-used READY transport, or fail with
    /// `PoolFull` when nothing qualifies.
    async fn evict_lru(&self, map: &mut HashMap<String, PoolSlot>) -> Result<(), IrisError> {
        let now = Instant::now();
        let victim = map
            .iter()
            .filter(|(_, slot)| slot.transport.ready())
            .min_by_key(|(_, slot)| {
                (
                    slot.transport.last_response_at().unwrap_or(0),
                    slot.transport.spawn_time().unwrap_or(now),
                )
            })
            .map(|(key, _)| key.clone());

        let Some(victim_key) = victim else {
            return Err(IrisError::PoolFull);
        };
        if let Some(slot) = map.remove(&victim_key) {
            info!(key = victim_key, "evicting least-recently-used process");
            slot.transport.terminate().await;
            self.events.emit(IrisEvent::ProcessTerminated { team: slot.to_team });
        }
        Ok(())
    }

    /// First live transport targeting the team, if any.
    pub async fn get_process(&self, to_team: &str) -> Option<Arc<Transport>> {
        let map = self.inner.read().await;
        map.values().find(|slot| slot.to_team == to_team).map(|slot| slot.transport.clone())
    }

    pub async fn get_by_key(&self, key: &str) -> Option<Arc<Transport>> {
        self.inner.read().await.get(key).map(|slot| slot.transport.clone())
    }

    pub async fn get_by_session_id(&self, session_id: &str) -> Option<Arc<Transport>> {
        let map = self.inner.read().await;
        map.values()
            .find(|slot| slot.transport.session_id() == session_id)
            .map(|slot| slot.transport.clone())
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Terminate and remove one slot. Idempotent; returns whether a
    /// transport was present.
    pub async fn terminate_process(&self, key: &str, force: bool) -> bool {
        let slot = self.inner.write().await.remove(key);
        match slot {
            Some(slot) => {
                slot.transport.terminate_with(force).await;
                self.events.emit(IrisEvent::ProcessTerminated { team: slot.to_team });
                true
            }
            None => false,
        }
    }

    /// Drain the whole pool, terminating every transport concurrently.
    pub async fn terminate_all(&self) {
        let slots: Vec<PoolSlot> = {
            let mut map = self.inner.write().await;
            map.drain().map(|(_, slot)| slot).collect()
        };
        if slots.is_empty() {
            return;
        }
        info!(count = slots.len(), "terminating all pooled processes");
        futures_util::future::join_all(
            slots.iter().map(|slot| slot.transport.terminate()),
        )
        .await;
        for slot in slots {
            self.events.emit(IrisEvent::ProcessTerminated { team: slot.to_team });
        }
    }

    /// Dashboard snapshot. `queue_length` is zero here; the orchestrator
    /// overlays its per-key waiter counts.
    pub async fn status(&self) -> Vec<PoolProcessStatus> {
        let map = self.inner.read().await;
        let mut statuses: Vec<PoolProcessStatus> = map
            .values()
            .map(|slot| {
                let metrics = slot.transport.metrics();
                PoolProcessStatus {
                    key: slot.transport.key().to_owned(),
                    from_team: slot.from_team.clone(),
                    to_team: slot.to_team.clone(),
                    session_id: slot.transport.session_id().to_owned(),
                    pid: slot.transport.pid(),
                    status: slot.transport.status(),
                    messages_processed: metrics.messages_processed,
                    uptime_secs: metrics.uptime_secs,
                    queue_length: 0,
                    last_response_at: metrics.last_response_at,
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    /// One health sweep: reconcile spontaneously-exited transports out of
    /// the map and reap READY transports past their team's idle timeout.
    pub async fn health_check(&self) {
        let mut stale = Vec::new();
        let mut idle = Vec::new();
        {
            let map = self.inner.read().await;
            let now = epoch_ms();
            for (key, slot) in map.iter() {
                match slot.transport.status() {
                    TransportStatus::Stopped | TransportStatus::Error => {
                        stale.push(key.clone());
                    }
                    TransportStatus::Ready => {
                        let Some(timeout) =
                            self.config.team(&slot.to_team).and_then(|t| t.idle_timeout())
                        else {
                            continue;
                        };
                        if let Some(last) = slot.transport.last_response_at() {
                            if now.saturating_sub(last) > timeout.as_millis() as u64 {
                                idle.push(key.clone());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        for key in stale {
            debug!(key, "health sweep dropping exited process");
            self.terminate_process(&key, false).await;
        }
        for key in idle {
            info!(key, "health sweep reaping idle process");
            self.terminate_process(&key, false).await;
        }
    }
}

impl TransportStatus {
    /// Live = occupying a pool slot usefully (anything but STOPPED/ERROR).
    fn is_live(&self) -> bool {
        !matches!(self, Self::Stopped | Self::Error)
    }
}

async fn health_loop(pool: Weak<ProcessPool>) {
    let interval = match pool.upgrade() {
        Some(pool) => pool.config.settings.health_check_interval(),
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(pool) = pool.upgrade() else { return };
        if pool.shutdown.is_cancelled() {
            return;
        }
        pool.health_check().await;
    }
}

#[cfg(test)]
#[path = "pool_tests.rs"]
mod tests;
