// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for unit tests: stub agent scripts speaking the
//! stream-JSON dialect, and team/config builders around them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::{PermissionMode, Settings, Team, TeamsConfig};

/// Stub agent that answers every inbound frame with one assistant message
/// echoing the frame's text, then a result.
pub const ECHO_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"stub"}'
while IFS= read -r line; do
  text=$(printf '%s' "$line" | sed 's/.*"text":"\([^"]*\)".*/\1/')
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"echo:%s"}]}}\n' "$text"
  printf '{"type":"result","subtype":"success"}\n'
done
"#;

/// Stub that never produces the dialect.
pub const HANG_STUB: &str = "#!/bin/sh\nsleep 60\n";

/// Stub that answers the warm-up ping, then exits.
pub const ONESHOT_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"stub"}'
IFS= read -r line
printf '{"type":"assistant","message":{"content":[{"type":"text","text":"pong"}]}}\n'
printf '{"type":"result","subtype":"success"}\n'
"#;

/// Stub that answers the ping promptly but sleeps a beat before every
/// later reply, keeping the transport BUSY.
pub const SLOW_STUB: &str = r#"#!/bin/sh
echo '{"type":"system","subtype":"init","session_id":"stub"}'
first=1
while IFS= read -r line; do
  if [ "$first" = "0" ]; then sleep 1; fi
  first=0
  printf '{"type":"assistant","message":{"content":[{"type":"text","text":"ok"}]}}\n'
  printf '{"type":"result","subtype":"success"}\n'
done
"#;

/// Write an executable stub script into `dir`.
pub fn write_stub(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("agent.sh");
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A local team whose "agent" is the given stub script, workspaced in
/// `dir`.
pub fn stub_team(dir: &Path, body: &str) -> Team {
    let program = write_stub(dir, body);
    Team {
        path: dir.to_path_buf(),
        remote: None,
        claude_path: Some(program.display().to_string()),
        permissions: PermissionMode::Yes,
        disallowed_tools: Vec::new(),
        allow_http: false,
        reverse_mcp_port: None,
        idle_timeout_secs: None,
    }
}

/// Assemble a [`TeamsConfig`] from prepared teams.
pub fn teams_config(teams: Vec<(&str, Team)>, settings: Settings) -> TeamsConfig {
    let teams: BTreeMap<String, Team> =
        teams.into_iter().map(|(name, team)| (name.to_owned(), team)).collect();
    TeamsConfig { settings, teams }
}
