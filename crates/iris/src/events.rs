// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published to the external surfaces (tool-call RPC bridge and
/// dashboard). The bus is lossy by design: slow consumers miss events
/// rather than applying backpressure to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IrisEvent {
    /// A transport's lifecycle status changed.
    ProcessStatus { key: String, from_team: String, to_team: String, status: String },
    /// A transport finished spawning.
    ProcessSpawned {
        key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    ProcessTerminated { team: String },
    ProcessError { team: String, error: String },
    /// Permission subsystem contract (emitted by the external approval
    /// flow, routed through this bus).
    PermissionRequest { session_id: String, request_id: String, tool: String },
    PermissionResolved { request_id: String, approved: bool },
    PermissionTimeout { request_id: String },
    /// Live copy of a message routed into a session's cache entry.
    CacheStream { session_id: String, entry_id: u64, message: serde_json::Value },
}

/// Publish-only fan-out channel to the external surfaces.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<IrisEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IrisEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Send errors (no receivers) are ignored.
    pub fn emit(&self, event: IrisEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
