// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use super::{ErrorCode, IrisError};

#[test]
fn codes_are_stable() {
    assert_eq!(IrisError::PoolFull.code().as_str(), "POOL_FULL");
    assert_eq!(IrisError::TeamNotFound("x".into()).code().as_str(), "TEAM_NOT_FOUND");
    assert_eq!(IrisError::Busy.code().as_str(), "BUSY");
    assert_eq!(IrisError::State.code().as_str(), "STATE_ERROR");
}

#[test]
fn caller_errors_map_to_4xx() {
    assert_eq!(ErrorCode::TeamNotFound.http_status(), 404);
    assert_eq!(ErrorCode::Validation.http_status(), 400);
    assert_eq!(ErrorCode::Busy.http_status(), 409);
}

#[test]
fn transport_errors_map_to_5xx() {
    assert_eq!(ErrorCode::SpawnError.http_status(), 502);
    assert_eq!(ErrorCode::SpawnTimeout.http_status(), 504);
    assert_eq!(ErrorCode::PoolFull.http_status(), 503);
}

#[test]
fn timeout_carries_duration() {
    let err = IrisError::Timeout(Duration::from_secs(30));
    assert!(err.to_string().contains("30s"), "unexpected message: {err}");
    assert_eq!(err.code(), ErrorCode::Timeout);
}
