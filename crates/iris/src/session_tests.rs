// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tempfile::TempDir;

use super::SessionManager;
use crate::store::{ProcessState, SessionStore};

async fn manager() -> (TempDir, SessionManager) {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::open(&dir.path().join("sessions.db")).await.unwrap();
    (dir, SessionManager::new(store))
}

#[tokio::test]
async fn get_or_create_is_stable_for_a_pair() {
    let (_dir, sessions) = manager().await;
    let first = sessions.get_or_create("cli", "alpha").await.unwrap();
    let second = sessions.get_or_create("cli", "alpha").await.unwrap();
    assert_eq!(first.session_id, second.session_id);

    let other = sessions.get_or_create("cli", "beta").await.unwrap();
    assert_ne!(first.session_id, other.session_id);
}

#[tokio::test]
async fn archived_session_is_replaced_on_next_contact() {
    let (_dir, sessions) = manager().await;
    let first = sessions.get_or_create("cli", "alpha").await.unwrap();
    sessions.archive(&first.session_id).await.unwrap();

    let replacement = sessions.get_or_create("cli", "alpha").await.unwrap();
    assert_ne!(first.session_id, replacement.session_id);
    assert!(sessions.get_by_id(&first.session_id).await.unwrap().is_none());
}

#[tokio::test]
async fn delete_mints_fresh_id_on_next_tell() {
    let (_dir, sessions) = manager().await;
    let first = sessions.get_or_create("cli", "alpha").await.unwrap();
    assert!(sessions.delete(&first.session_id).await.unwrap());
    let second = sessions.get_or_create("cli", "alpha").await.unwrap();
    assert_ne!(first.session_id, second.session_id);
}

#[tokio::test]
async fn record_completion_updates_counters() {
    let (_dir, sessions) = manager().await;
    let row = sessions.get_or_create("cli", "alpha").await.unwrap();
    sessions.record_completion(&row.session_id).await.unwrap();
    sessions.record_completion(&row.session_id).await.unwrap();

    let row = sessions.get_by_id(&row.session_id).await.unwrap().unwrap();
    assert_eq!(row.message_count, 2);
    assert!(row.last_response_at.is_some());
    assert_eq!(row.process_state, ProcessState::Idle);
}

#[tokio::test]
async fn boot_resets_process_states() {
    let (_dir, sessions) = manager().await;
    let row = sessions.get_or_create("cli", "alpha").await.unwrap();
    sessions.update_process_state(&row.session_id, ProcessState::Processing).await.unwrap();

    sessions.reset_runtime_state().await.unwrap();
    let row = sessions.get_by_id(&row.session_id).await.unwrap().unwrap();
    assert_eq!(row.process_state, ProcessState::Stopped);
}

#[tokio::test]
async fn cache_identity_is_persisted_once_live() {
    let (_dir, sessions) = manager().await;
    let row = sessions.get_or_create("cli", "alpha").await.unwrap();
    assert!(sessions.cache_if_live(&row.session_id).is_none());

    let cache = sessions.cache(&row.session_id).await.unwrap();
    let persisted = sessions.get_by_id(&row.session_id).await.unwrap().unwrap();
    assert_eq!(persisted.current_cache_session_id.as_deref(), Some(cache.instance_id()));

    // Same cache instance on the next lookup.
    let again = sessions.cache(&row.session_id).await.unwrap();
    assert_eq!(cache.instance_id(), again.instance_id());
}
