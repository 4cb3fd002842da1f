// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::IrisError;
use crate::protocol::{self, StreamMessage};

/// What produced a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Implicit warm-up entry created by `spawn()` with a fixed ping payload.
    Spawn,
    /// A user-initiated request through the orchestrator.
    Tell,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spawn => "spawn",
            Self::Tell => "tell",
        }
    }
}

/// Entry lifecycle. Transitions go `Active` → one terminal value, exactly
/// once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Active,
    Completed,
    Errored,
    Terminated,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    status: EntryStatus,
    messages: Vec<StreamMessage>,
    completed_at: Option<u64>,
    error: Option<String>,
}

/// Ordered buffer of one request's streamed reply.
///
/// Shared between the transport that writes to it and any waiter reading
/// its status signal. The status channel is a `watch` pair, so a
/// subscriber always observes the current value immediately; the
/// orchestrator may subscribe after the transport has already finished the
/// entry.
pub struct CacheEntry {
    id: u64,
    kind: EntryKind,
    tell_string: String,
    created_at: u64,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<EntryStatus>,
}

impl CacheEntry {
    pub fn new(id: u64, kind: EntryKind, tell_string: impl Into<String>) -> Self {
        let (status_tx, _status_rx) = watch::channel(EntryStatus::Active);
        Self {
            id,
            kind,
            tell_string: tell_string.into(),
            created_at: protocol::epoch_ms(),
            inner: Mutex::new(Inner {
                status: EntryStatus::Active,
                messages: Vec::new(),
                completed_at: None,
                error: None,
            }),
            status_tx,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn tell_string(&self) -> &str {
        &self.tell_string
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn completed_at(&self) -> Option<u64> {
        self.inner.lock().completed_at
    }

    pub fn error_detail(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Append a parsed message. Fails with [`IrisError::State`] after the
    /// terminal transition; the message list is append-only.
    pub fn append(&self, message: StreamMessage) -> Result<(), IrisError> {
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return Err(IrisError::State);
        }
        inner.messages.push(message);
        Ok(())
    }

    /// Transition to `Completed`. No-op (returns `false`) if already
    /// terminal.
    pub fn complete(&self) -> bool {
        self.finish(EntryStatus::Completed, None)
    }

    /// Transition to `Errored` with a reason.
    pub fn error(&self, reason: impl Into<String>) -> bool {
        self.finish(EntryStatus::Errored, Some(reason.into()))
    }

    /// Transition to `Terminated` (process died or was killed mid-entry).
    pub fn terminate(&self) -> bool {
        self.finish(EntryStatus::Terminated, None)
    }

    fn finish(&self, status: EntryStatus, error: Option<String>) -> bool {
        let mut inner = self.inner.lock();
        if inner.status.is_terminal() {
            return false;
        }
        inner.status = status;
        inner.completed_at = Some(protocol::epoch_ms());
        inner.error = error;
        // Publish while still holding the lock so the terminal transition
        // is the last observable event for the entry.
        self.status_tx.send_replace(status);
        true
    }

    pub fn status(&self) -> EntryStatus {
        self.inner.lock().status
    }

    /// Subscribe to status transitions; the receiver sees the current
    /// value immediately.
    pub fn subscribe(&self) -> watch::Receiver<EntryStatus> {
        self.status_tx.subscribe()
    }

    /// Wait until the entry reaches a terminal status and return it.
    pub async fn wait_terminal(&self) -> EntryStatus {
        let mut rx = self.subscribe();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Snapshot of the appended messages in arrival order.
    pub fn messages(&self) -> Vec<StreamMessage> {
        self.inner.lock().messages.clone()
    }

    pub fn message_count(&self) -> usize {
        self.inner.lock().messages.len()
    }

    /// Concatenation of the text blocks of all assistant messages in the
    /// entry: the `response` handed back to a waiting tell caller.
    pub fn assistant_text(&self) -> String {
        let inner = self.inner.lock();
        let texts: Vec<String> = inner
            .messages
            .iter()
            .filter_map(|m| protocol::extract_assistant_text(&m.raw))
            .collect();
        texts.join("\n")
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
#[path = "entry_tests.rs"]
mod tests;
