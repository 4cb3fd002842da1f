// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end scenarios driving the full supervisor stack against stub
//! agents.

use std::time::Duration;

use iris::cache::{EntryKind, EntryStatus};
use iris::store::ProcessState;
use iris_specs::{Harness, ECHO_STUB, HANG_STUB, TWO_PART_STUB};

const WAIT: Duration = Duration::from_secs(30);

fn settings() -> serde_json::Value {
    serde_json::json!({
        "sessionInitTimeoutSecs": 10,
        "healthCheckIntervalSecs": 3600,
    })
}

// -- Scenario 1: cold tell ----------------------------------------------------

#[tokio::test]
async fn cold_tell_creates_session_and_returns_reply() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", TWO_PART_STUB)], settings()).await?;

    let result = harness.orchestrator.tell("cli", "alpha", "hi", true, WAIT).await;
    anyhow::ensure!(result.success, "tell failed: {:?}", result.error);
    // The response is the concatenation of the assistant text blocks.
    assert_eq!(result.response.as_deref(), Some("part one\npart two"));

    let session_id = result.session_id.ok_or_else(|| anyhow::anyhow!("no session id"))?;
    let row = harness
        .orchestrator
        .sessions()
        .get_by_id(&session_id)
        .await?
        .ok_or_else(|| anyhow::anyhow!("session row missing"))?;
    assert_eq!(row.message_count, 1);
    assert_eq!(row.from_team, "cli");
    assert_eq!(row.to_team, "alpha");

    let awake = harness.orchestrator.is_awake("alpha", "cli").await;
    anyhow::ensure!(awake.awake);
    anyhow::ensure!(awake.pid.is_some(), "pid should be observable");

    harness.stop().await;
    Ok(())
}

// -- Scenario 2: back-to-back ordering ----------------------------------------

#[tokio::test]
async fn concurrent_tells_for_one_pair_share_a_single_child() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", ECHO_STUB)], settings()).await?;
    let orch = harness.orchestrator.clone();

    let first = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.tell("cli", "alpha", "A", true, WAIT).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.tell("cli", "alpha", "B", true, WAIT).await })
    };

    let a = first.await?;
    let b = second.await?;
    anyhow::ensure!(a.success && b.success);
    assert_eq!(a.response.as_deref(), Some("echo:A"));
    assert_eq!(b.response.as_deref(), Some("echo:B"));

    let report = orch.report("cli", "alpha").await;
    let stats = report.stats.ok_or_else(|| anyhow::anyhow!("no cache stats"))?;
    assert_eq!(stats.spawn, 1, "exactly one SPAWN entry");
    assert_eq!(stats.tell, 2);
    let tells: Vec<&str> = report
        .entries
        .iter()
        .filter(|e| e.kind == EntryKind::Tell)
        .map(|e| e.tell.as_str())
        .collect();
    assert_eq!(tells, ["A", "B"], "tell order must match submit order");

    let row = orch
        .sessions()
        .get("cli", "alpha")
        .await?
        .ok_or_else(|| anyhow::anyhow!("session row missing"))?;
    assert_eq!(row.message_count, 2);

    harness.stop().await;
    Ok(())
}

// -- Scenario 3: sleep then reuse ---------------------------------------------

#[tokio::test]
async fn sleep_preserves_session_identity_across_respawn() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", ECHO_STUB)], settings()).await?;
    let orch = harness.orchestrator.clone();

    let first = orch.tell("cli", "alpha", "one", true, WAIT).await;
    anyhow::ensure!(first.success);
    let sid = first.session_id.ok_or_else(|| anyhow::anyhow!("no session id"))?;
    let first_pid = harness.orchestrator.is_awake("alpha", "cli").await.pid;

    let slept = orch.sleep("alpha", "cli", false).await;
    anyhow::ensure!(slept.success && slept.was_running);
    anyhow::ensure!(harness.pool.is_empty().await, "pool should be empty after sleep");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let row = orch
            .sessions()
            .get_by_id(&sid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session row missing"))?;
        if row.process_state == ProcessState::Stopped {
            break;
        }
        anyhow::ensure!(tokio::time::Instant::now() < deadline, "never settled on stopped");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let second = orch.tell("cli", "alpha", "two", true, WAIT).await;
    anyhow::ensure!(second.success);
    assert_eq!(second.session_id.as_deref(), Some(sid.as_str()), "session id must survive");
    let second_pid = harness.orchestrator.is_awake("alpha", "cli").await.pid;
    anyhow::ensure!(first_pid.is_some() && second_pid.is_some());
    assert_ne!(first_pid, second_pid, "respawn must produce a new pid");

    harness.stop().await;
    Ok(())
}

// -- Scenario 4: LRU eviction -------------------------------------------------

#[tokio::test]
async fn pool_capacity_evicts_lru_and_respawn_reuses_session() -> anyhow::Result<()> {
    let settings = serde_json::json!({
        "maxProcesses": 2,
        "sessionInitTimeoutSecs": 10,
        "healthCheckIntervalSecs": 3600,
    });
    let harness = Harness::start(
        &[("a", ECHO_STUB), ("b", ECHO_STUB), ("c", ECHO_STUB)],
        settings,
    )
    .await?;
    let orch = harness.orchestrator.clone();

    let a = orch.tell("cli", "a", "hello a", true, WAIT).await;
    let a_sid = a.session_id.ok_or_else(|| anyhow::anyhow!("no session id"))?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    anyhow::ensure!(orch.tell("cli", "b", "hello b", true, WAIT).await.success);
    tokio::time::sleep(Duration::from_millis(20)).await;
    anyhow::ensure!(orch.tell("cli", "c", "hello c", true, WAIT).await.success);

    // a was least recently used and READY, so it is the victim.
    assert_eq!(harness.pool.len().await, 2);
    anyhow::ensure!(!orch.is_awake("a", "cli").await.awake, "a should have been evicted");
    anyhow::ensure!(orch.is_awake("b", "cli").await.awake);
    anyhow::ensure!(orch.is_awake("c", "cli").await.awake);

    // Re-telling the evicted team respawns with the same session id.
    let again = orch.tell("cli", "a", "back again", true, WAIT).await;
    anyhow::ensure!(again.success);
    assert_eq!(again.session_id.as_deref(), Some(a_sid.as_str()));
    assert_eq!(harness.pool.len().await, 2);

    harness.stop().await;
    Ok(())
}

// -- Scenario 5: async tell survives caller return ----------------------------

#[tokio::test]
async fn async_tell_completes_after_caller_returns() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", ECHO_STUB)], settings()).await?;
    let orch = harness.orchestrator.clone();

    let result = orch.tell("cli", "alpha", "fire and forget", false, WAIT).await;
    anyhow::ensure!(result.success && result.is_async);
    let sid = result.session_id.ok_or_else(|| anyhow::anyhow!("no session id"))?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let row = orch
            .sessions()
            .get_by_id(&sid)
            .await?
            .ok_or_else(|| anyhow::anyhow!("session row missing"))?;
        if row.message_count == 1 {
            break;
        }
        anyhow::ensure!(
            tokio::time::Instant::now() < deadline,
            "message_count never incremented",
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let report = orch.report("cli", "alpha").await;
    let tell = report
        .entries
        .iter()
        .find(|e| e.kind == EntryKind::Tell)
        .ok_or_else(|| anyhow::anyhow!("tell entry missing"))?;
    assert_eq!(tell.status, EntryStatus::Completed);

    harness.stop().await;
    Ok(())
}

// -- Scenario 6: spawn timeout ------------------------------------------------

#[tokio::test]
async fn non_initialising_agent_fails_within_init_timeout() -> anyhow::Result<()> {
    let settings = serde_json::json!({
        "sessionInitTimeoutSecs": 1,
        "healthCheckIntervalSecs": 3600,
    });
    let harness = Harness::start(&[("stuck", HANG_STUB)], settings).await?;

    let started = tokio::time::Instant::now();
    let result = harness.orchestrator.tell("cli", "stuck", "hi", true, WAIT).await;
    anyhow::ensure!(!result.success);
    assert_eq!(result.error_code, Some("SPAWN_TIMEOUT"));
    anyhow::ensure!(started.elapsed() < Duration::from_secs(5), "timeout was not enforced");
    anyhow::ensure!(harness.pool.is_empty().await, "failed spawn must not stay pooled");

    harness.stop().await;
    Ok(())
}

// -- Idempotence laws ---------------------------------------------------------

#[tokio::test]
async fn wake_and_sleep_are_idempotent() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", ECHO_STUB)], settings()).await?;
    let orch = harness.orchestrator.clone();

    let once = orch.wake("alpha", "cli").await;
    let twice = orch.wake("alpha", "cli").await;
    assert_eq!(once.pid, twice.pid, "wake;wake must equal wake");
    assert_eq!(harness.pool.len().await, 1);

    orch.sleep("alpha", "cli", false).await;
    let again = orch.sleep("alpha", "cli", false).await;
    anyhow::ensure!(again.success, "sleep;sleep must equal sleep");
    anyhow::ensure!(harness.pool.is_empty().await);

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn mcp_config_file_lifecycle_follows_the_process() -> anyhow::Result<()> {
    let harness = Harness::start(&[("alpha", ECHO_STUB)], settings()).await?;
    let orch = harness.orchestrator.clone();

    let result = orch.tell("cli", "alpha", "hi", true, WAIT).await;
    let sid = result.session_id.ok_or_else(|| anyhow::anyhow!("no session id"))?;

    let dir = harness.team_dir("alpha").ok_or_else(|| anyhow::anyhow!("no team dir"))?;
    let mcp = dir.join(format!(".claude/iris/mcp/iris-mcp-{sid}.json"));
    anyhow::ensure!(mcp.exists(), "mcp config should exist while the process runs");

    orch.sleep("alpha", "cli", false).await;
    anyhow::ensure!(!mcp.exists(), "mcp config should be removed at terminate");

    harness.stop().await;
    Ok(())
}
