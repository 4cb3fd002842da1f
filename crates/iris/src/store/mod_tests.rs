// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use tempfile::TempDir;

use super::{ProcessState, SessionFilter, SessionStatus, SessionStore};

async fn open_store() -> (TempDir, SessionStore) {
    let dir = TempDir::new().unwrap();
    let store = SessionStore::open(&dir.path().join("sessions.db")).await.unwrap();
    (dir, store)
}

#[tokio::test]
async fn create_and_get_by_pair() {
    let (_dir, store) = open_store().await;
    let row = store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    assert_eq!(row.from_team, "cli");
    assert_eq!(row.to_team, "alpha");
    assert_eq!(row.session_id, "sid-1");
    assert_eq!(row.message_count, 0);
    assert_eq!(row.status, SessionStatus::Active);
    assert_eq!(row.process_state, ProcessState::Stopped);

    let found = store.get_by_pair("cli", "alpha").await.unwrap().unwrap();
    assert_eq!(found.session_id, "sid-1");
    assert!(store.get_by_pair("cli", "beta").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_pair_is_an_error() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    assert!(store.create("cli", "alpha", "sid-2", None, None).await.is_err());
}

#[tokio::test]
async fn duplicate_session_id_is_an_error() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    assert!(store.create("cli", "beta", "sid-1", None, None).await.is_err());
}

#[tokio::test]
async fn counters_and_fields_update() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();

    store.increment_message_count("sid-1", 1).await.unwrap();
    store.increment_message_count("sid-1", 1).await.unwrap();
    store.update_last_response("sid-1", 1234).await.unwrap();
    store.update_process_state("sid-1", ProcessState::Idle).await.unwrap();
    store.set_current_cache_session_id("sid-1", Some("cache-1")).await.unwrap();
    store.update_debug_info("sid-1", "claude --resume sid-1", "{}").await.unwrap();

    let row = store.get_by_session_id("sid-1").await.unwrap().unwrap();
    assert_eq!(row.message_count, 2);
    assert_eq!(row.last_response_at, Some(1234));
    assert_eq!(row.process_state, ProcessState::Idle);
    assert_eq!(row.current_cache_session_id.as_deref(), Some("cache-1"));
    assert_eq!(row.launch_command.as_deref(), Some("claude --resume sid-1"));
}

#[tokio::test]
async fn reset_all_process_states_forces_stopped() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    store.create("cli", "beta", "sid-2", None, None).await.unwrap();
    store.update_process_state("sid-1", ProcessState::Processing).await.unwrap();
    store.set_current_cache_session_id("sid-1", Some("cache-1")).await.unwrap();
    store.update_process_state("sid-2", ProcessState::Idle).await.unwrap();

    let affected = store.reset_all_process_states().await.unwrap();
    assert_eq!(affected, 2);

    for sid in ["sid-1", "sid-2"] {
        let row = store.get_by_session_id(sid).await.unwrap().unwrap();
        assert_eq!(row.process_state, ProcessState::Stopped);
        assert_eq!(row.current_cache_session_id, None);
    }
}

#[tokio::test]
async fn list_filters_by_status_and_state() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    store.create("cli", "beta", "sid-2", None, None).await.unwrap();
    store.update_status("sid-2", SessionStatus::Archived).await.unwrap();
    store.update_process_state("sid-1", ProcessState::Idle).await.unwrap();

    let all = store.list(SessionFilter::default()).await.unwrap();
    assert_eq!(all.len(), 2);

    let active = store
        .list(SessionFilter { status: Some(SessionStatus::Active), process_state: None })
        .await
        .unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].session_id, "sid-1");

    let idle = store
        .list(SessionFilter { status: None, process_state: Some(ProcessState::Idle) })
        .await
        .unwrap();
    assert_eq!(idle.len(), 1);
}

#[tokio::test]
async fn delete_removes_row() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    assert!(store.delete("sid-1").await.unwrap());
    assert!(!store.delete("sid-1").await.unwrap());
    assert!(store.get_by_pair("cli", "alpha").await.unwrap().is_none());
}

#[tokio::test]
async fn uncommitted_batches_roll_back() {
    let (_dir, store) = open_store().await;
    store.create("cli", "alpha", "sid-1", None, None).await.unwrap();

    {
        let mut tx = store.begin().await.unwrap();
        sqlx::query("UPDATE team_sessions SET message_count = 99 WHERE session_id = ?")
            .bind("sid-1")
            .execute(&mut *tx)
            .await
            .unwrap();
        // Dropped without commit.
    }
    let row = store.get_by_session_id("sid-1").await.unwrap().unwrap();
    assert_eq!(row.message_count, 0);

    let mut tx = store.begin().await.unwrap();
    sqlx::query("UPDATE team_sessions SET message_count = 99 WHERE session_id = ?")
        .bind("sid-1")
        .execute(&mut *tx)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    let row = store.get_by_session_id("sid-1").await.unwrap().unwrap();
    assert_eq!(row.message_count, 99);
}

#[tokio::test]
async fn survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sessions.db");
    {
        let store = SessionStore::open(&path).await.unwrap();
        store.create("cli", "alpha", "sid-1", None, None).await.unwrap();
    }
    let store = SessionStore::open(&path).await.unwrap();
    let row = store.get_by_pair("cli", "alpha").await.unwrap().unwrap();
    assert_eq!(row.session_id, "sid-1");
}
