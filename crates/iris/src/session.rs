// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Business rules atop the session store: get-or-create, boot reset,
//! completion bookkeeping, and ownership of the runtime cache registry.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::{CacheRegistry, MessageCache};
use crate::error::IrisError;
use crate::protocol::epoch_ms;
use crate::store::{ProcessState, SessionFilter, SessionStatus, SessionStore, TeamSession};

pub struct SessionManager {
    store: SessionStore,
    caches: CacheRegistry,
}

impl SessionManager {
    pub fn new(store: SessionStore) -> Self {
        Self { store, caches: CacheRegistry::new() }
    }

    /// Force every persisted row back to `stopped` and clear runtime
    /// cache ids. Runs once at boot before the pool accepts work, and
    /// again after the pool drains at shutdown.
    pub async fn reset_runtime_state(&self) -> Result<(), IrisError> {
        let reset = self.store.reset_all_process_states().await?;
        if reset > 0 {
            info!(reset, "reset stale process states");
        }
        Ok(())
    }

    /// Return the session for the pair, minting a fresh row (and session
    /// id) if none exists. Archived rows are tombstones: the next contact
    /// replaces them with a fresh row.
    pub async fn get_or_create(
        &self,
        from_team: &str,
        to_team: &str,
    ) -> Result<TeamSession, IrisError> {
        if let Some(row) = self.store.get_by_pair(from_team, to_team).await? {
            if row.status == SessionStatus::Active {
                self.store.update_last_used(&row.session_id).await?;
                return Ok(row);
            }
            debug!(session_id = %row.session_id, "replacing archived session");
            self.caches.remove(&row.session_id);
            self.store.delete(&row.session_id).await?;
        }
        let session_id = uuid::Uuid::new_v4().to_string();
        let row = self.store.create(from_team, to_team, &session_id, None, None).await?;
        info!(from_team, to_team, session_id = %row.session_id, "created session");
        Ok(row)
    }

    pub async fn get(
        &self,
        from_team: &str,
        to_team: &str,
    ) -> Result<Option<TeamSession>, IrisError> {
        self.store.get_by_pair(from_team, to_team).await
    }

    pub async fn get_by_id(&self, session_id: &str) -> Result<Option<TeamSession>, IrisError> {
        self.store.get_by_session_id(session_id).await
    }

    pub async fn list(&self, filter: SessionFilter) -> Result<Vec<TeamSession>, IrisError> {
        self.store.list(filter).await
    }

    /// Called by the orchestrator when the pool reports transitions,
    /// never by the transport directly.
    pub async fn update_process_state(
        &self,
        session_id: &str,
        state: ProcessState,
    ) -> Result<(), IrisError> {
        self.store.update_process_state(session_id, state).await
    }

    /// Post-completion bookkeeping for one finished tell.
    pub async fn record_completion(&self, session_id: &str) -> Result<(), IrisError> {
        self.store.increment_message_count(session_id, 1).await?;
        self.store.update_last_response(session_id, epoch_ms() as i64).await?;
        self.store.update_process_state(session_id, ProcessState::Idle).await
    }

    /// Record the debug snapshot taken at spawn: exact command line and
    /// the team config in force.
    pub async fn record_spawn_debug(
        &self,
        session_id: &str,
        launch_command: &str,
        team_config_snapshot: &str,
    ) -> Result<(), IrisError> {
        self.store.update_debug_info(session_id, launch_command, team_config_snapshot).await
    }

    /// Return the session's live cache, creating it on first use (and
    /// persisting the runtime view's identity).
    pub async fn cache(&self, session_id: &str) -> Result<Arc<MessageCache>, IrisError> {
        let (cache, created) = self.caches.get_or_create(session_id);
        if created {
            self.store
                .set_current_cache_session_id(session_id, Some(cache.instance_id()))
                .await?;
        }
        Ok(cache)
    }

    /// Live cache lookup without creation.
    pub fn cache_if_live(&self, session_id: &str) -> Option<Arc<MessageCache>> {
        self.caches.get(session_id)
    }

    pub async fn archive(&self, session_id: &str) -> Result<(), IrisError> {
        self.caches.remove(session_id);
        self.store.set_current_cache_session_id(session_id, None).await?;
        self.store.update_status(session_id, SessionStatus::Archived).await
    }

    /// Delete the row; the next tell for the pair mints a fresh id.
    pub async fn delete(&self, session_id: &str) -> Result<bool, IrisError> {
        self.caches.remove(session_id);
        self.store.delete(session_id).await
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
