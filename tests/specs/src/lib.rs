// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end harness: boots the full supervisor stack (teams file on
//! disk, SQLite store, pool, orchestrator) against stub agent scripts
//! that speak the stream-JSON dialect.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use iris::config::TeamsConfig;
use iris::events::EventBus;
use iris::orchestrator::Orchestrator;
use iris::pool::ProcessPool;
use iris::session::SessionManager;
use iris::store::SessionStore;

/// Stub agent that answers every frame with an assistant message echoing
/// the frame's text, then a result.
pub const ECHO_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"stub"}'
while IFS= read -r line; do
  text=$(printf '%s' "$line" | sed 's/.*"text":"\([^"]*\)".*/\1/')
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"echo:%s"}]}}\n' "$text"
  printf '{"type":"result","subtype":"success"}\n'
done
"#;

/// Stub agent that splits its reply across two assistant messages before
/// the result.
pub const TWO_PART_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"stub"}'
while IFS= read -r line; do
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"part one"}]}}\n'
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"part two"}]}}\n'
  printf '{"type":"result","subtype":"success"}\n'
done
"#;

/// Stub that never produces the dialect (spawn timeouts).
pub const HANG_STUB: &str = "#!/bin/sh\nsleep 60\n";

/// One running supervisor over a scratch workspace per team.
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub pool: Arc<ProcessPool>,
    pub shutdown: CancellationToken,
    team_dirs: Vec<(String, TempDir)>,
    _db_dir: TempDir,
}

impl Harness {
    /// Boot a supervisor over `teams` (name → stub script body), going
    /// through the teams file on disk exactly as the daemon does.
    pub async fn start(
        teams: &[(&str, &str)],
        settings: serde_json::Value,
    ) -> anyhow::Result<Self> {
        let mut team_dirs = Vec::new();
        let mut teams_json = serde_json::Map::new();
        for (name, stub) in teams {
            let dir = TempDir::new()?;
            let agent = write_stub(dir.path(), stub)?;
            teams_json.insert(
                (*name).to_owned(),
                serde_json::json!({
                    "path": dir.path(),
                    "claudePath": agent,
                }),
            );
            team_dirs.push(((*name).to_owned(), dir));
        }

        let db_dir = TempDir::new()?;
        let config_path = db_dir.path().join("iris.json");
        let document = serde_json::json!({ "settings": settings, "teams": teams_json });
        std::fs::write(&config_path, serde_json::to_string_pretty(&document)?)?;

        let config = Arc::new(TeamsConfig::load(&config_path)?);
        let store = SessionStore::open(&db_dir.path().join("sessions.db")).await?;
        let sessions = Arc::new(SessionManager::new(store));
        sessions.reset_runtime_state().await?;

        let events = EventBus::new();
        let shutdown = CancellationToken::new();
        let pool = ProcessPool::new(config.clone(), events.clone(), shutdown.clone());
        let orchestrator =
            Orchestrator::new(config, sessions, pool.clone(), events, shutdown.clone());

        Ok(Self { orchestrator, pool, shutdown, team_dirs, _db_dir: db_dir })
    }

    /// Workspace directory of a configured team.
    pub fn team_dir(&self, name: &str) -> Option<&Path> {
        self.team_dirs
            .iter()
            .find(|(team, _)| team == name)
            .map(|(_, dir)| dir.path())
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.orchestrator.shutdown().await;
    }
}

fn write_stub(dir: &Path, body: &str) -> anyhow::Result<String> {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("agent.sh");
    std::fs::write(&path, body)?;
    let mut perms = std::fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms)?;
    Ok(path.display().to_string())
}
