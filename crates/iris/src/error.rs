// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Typed failures raised at the orchestrator, pool, transport, and cache
/// seams.
#[derive(Debug, thiserror::Error)]
pub enum IrisError {
    #[error("unknown team: {0}")]
    TeamNotFound(String),

    /// Pool is at capacity and no READY victim could be evicted.
    #[error("process pool is full and no idle process is evictable")]
    PoolFull,

    /// `execute_tell` was called on a transport that has not finished
    /// warm-up. The per-key mutex is supposed to make this unreachable.
    #[error("transport is not ready")]
    NotReady,

    /// `execute_tell` was called while another entry is in flight. The
    /// per-key mutex is supposed to make this unreachable.
    #[error("transport already has a request in flight")]
    Busy,

    #[error("agent process failed to spawn: {0}")]
    Spawn(String),

    #[error("agent process did not initialise within {0:?}")]
    SpawnTimeout(Duration),

    /// The caller's wait elapsed. The entry keeps draining in the
    /// background; this only abandons the wait.
    #[error("timed out after {0:?} waiting for a response")]
    Timeout(Duration),

    #[error("agent process exited unexpectedly")]
    ProcessExited,

    #[error("invalid request: {0}")]
    Validation(String),

    /// Append was attempted on a cache entry that already reached a
    /// terminal status. Logged and swallowed at call sites.
    #[error("cache entry is already terminal")]
    State,

    #[error("session store: {0}")]
    Store(#[from] sqlx::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl IrisError {
    /// Map to the stable wire code shared with the RPC and dashboard
    /// bridges.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::TeamNotFound(_) => ErrorCode::TeamNotFound,
            Self::PoolFull => ErrorCode::PoolFull,
            Self::NotReady => ErrorCode::NotReady,
            Self::Busy => ErrorCode::Busy,
            Self::Spawn(_) => ErrorCode::SpawnError,
            Self::SpawnTimeout(_) => ErrorCode::SpawnTimeout,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::ProcessExited => ErrorCode::ProcessExited,
            Self::Validation(_) => ErrorCode::Validation,
            Self::State => ErrorCode::State,
            Self::Store(_) | Self::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Unified error codes shared across the tool-call RPC and dashboard
/// surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    TeamNotFound,
    PoolFull,
    NotReady,
    Busy,
    SpawnError,
    SpawnTimeout,
    Timeout,
    ProcessExited,
    Validation,
    State,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TeamNotFound => 404,
            Self::PoolFull => 503,
            Self::NotReady => 503,
            Self::Busy => 409,
            Self::SpawnError => 502,
            Self::SpawnTimeout => 504,
            Self::Timeout => 504,
            Self::ProcessExited => 502,
            Self::Validation => 400,
            Self::State => 500,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TeamNotFound => "TEAM_NOT_FOUND",
            Self::PoolFull => "POOL_FULL",
            Self::NotReady => "NOT_READY",
            Self::Busy => "BUSY",
            Self::SpawnError => "SPAWN_ERROR",
            Self::SpawnTimeout => "SPAWN_TIMEOUT",
            Self::Timeout => "TIMEOUT",
            Self::ProcessExited => "PROCESS_EXITED",
            Self::Validation => "VALIDATION_ERROR",
            Self::State => "STATE_ERROR",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
