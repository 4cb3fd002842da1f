// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Agent CLI command construction.
//!
//! Builds the argv for headless (stream-JSON) and interactive (fork)
//! children from the team config, and manages the per-session MCP config
//! file the agent reads its callback URL from. Remote teams get the same
//! command wrapped through `ssh` so the remote side produces the same
//! stdio dialect.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::warn;

use crate::config::{RemoteHost, Settings, Team};
use crate::error::IrisError;

/// Environment flag that makes the agent mint its own session id
/// (`--resume` is omitted).
pub const TEST_MODE_ENV: &str = "IRIS_TEST_MODE";

/// Environment override for the MCP callback port.
pub const HTTP_PORT_ENV: &str = "IRIS_HTTP_PORT";

/// A fully-resolved child command: executable, argv, and working
/// directory. `cwd` is `None` for remote children (the `cd` happens on
/// the far side).
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Shell-quoted single line, recorded as the session's
    /// `launch_command` debug snapshot.
    pub fn shell_line(&self) -> String {
        let mut parts = vec![shell_quote(&self.program)];
        parts.extend(self.args.iter().map(|a| shell_quote(a)));
        parts.join(" ")
    }

    /// Build the `tokio` command with stdio fully piped.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd
    }
}

/// Quote one token for `sh`.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| c.is_ascii_alphanumeric() || "-_./=:@,".contains(c))
    {
        return s.to_owned();
    }
    format!("'{}'", s.replace('\'', r#"'\''"#))
}

fn test_mode() -> bool {
    std::env::var(TEST_MODE_ENV).is_ok_and(|v| !v.is_empty() && v != "0")
}

/// Shared argv head: `--resume` plus the debug flag.
fn base_args(session_id: &str, args: &mut Vec<String>) {
    if !test_mode() {
        args.push("--resume".into());
        args.push(session_id.into());
    }
    args.push("--debug".into());
}

fn policy_args(team: &Team, session_id: &str, mcp_config: &Path, args: &mut Vec<String>) {
    if !team.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".into());
        args.push(team.disallowed_tools.join(","));
    }
    if team.permissions.prompts() {
        args.push("--permission-prompt-tool".into());
        args.push(format!("mcp__iris-{session_id}__permissions__approve"));
    }
    args.push("--mcp-config".into());
    args.push(mcp_config.display().to_string());
}

/// Headless stream-JSON command for the request/response pipeline.
pub fn headless_command(team: &Team, session_id: &str, mcp_config: &Path) -> CommandSpec {
    let mut args = Vec::new();
    base_args(session_id, &mut args);
    args.extend(
        ["--print", "--verbose", "--input-format", "stream-json", "--output-format", "stream-json"]
            .map(String::from),
    );
    policy_args(team, session_id, mcp_config, &mut args);
    finish(team, args)
}

/// Interactive fork variant: no stream/print flags, optionally branching
/// the conversation with `--fork-session`.
pub fn fork_command(
    team: &Team,
    session_id: &str,
    mcp_config: &Path,
    fork_session: bool,
) -> CommandSpec {
    let mut args = Vec::new();
    base_args(session_id, &mut args);
    policy_args(team, session_id, mcp_config, &mut args);
    if fork_session {
        args.push("--fork-session".into());
    }
    finish(team, args)
}

fn finish(team: &Team, args: Vec<String>) -> CommandSpec {
    let spec = CommandSpec {
        program: team.executable().to_owned(),
        args,
        cwd: Some(team.path.clone()),
    };
    match team.remote {
        Some(ref remote) => wrap_remote(remote, spec),
        None => spec,
    }
}

/// Wrap a local command spec so it executes on the team's remote host
/// with the same stdio framing. The `cd` into the workspace happens in
/// the remote shell.
fn wrap_remote(remote: &RemoteHost, spec: CommandSpec) -> CommandSpec {
    let mut args = vec!["-T".to_owned()];
    if let Some(port) = remote.port {
        args.push("-p".into());
        args.push(port.to_string());
    }
    if let Some(ref identity) = remote.identity_file {
        args.push("-i".into());
        args.push(identity.display().to_string());
    }
    args.push(remote.destination());

    let mut remote_line = String::new();
    if let Some(ref cwd) = spec.cwd {
        remote_line.push_str(&format!("cd {} && ", shell_quote(&cwd.display().to_string())));
    }
    remote_line.push_str("exec ");
    remote_line.push_str(&spec.shell_line());
    args.push(remote_line);

    CommandSpec { program: "ssh".into(), args, cwd: None }
}

/// Where the per-session MCP config lives inside the team workspace.
pub fn mcp_config_path(team: &Team, session_id: &str) -> PathBuf {
    team.path.join(".claude").join("iris").join("mcp").join(format!("iris-mcp-{session_id}.json"))
}

/// Render the MCP config document handed to the agent.
///
/// Port resolution order: `IRIS_HTTP_PORT` env override, then the team's
/// `reverseMcpPort`, then the configured default. Remote teams default to
/// HTTPS; `allowHttp` downgrades them.
pub fn mcp_config_json(team: &Team, session_id: &str, settings: &Settings) -> serde_json::Value {
    let port = std::env::var(HTTP_PORT_ENV)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .or(team.reverse_mcp_port)
        .unwrap_or(settings.http_port);
    let scheme = if team.is_remote() && !team.allow_http { "https" } else { "http" };
    let mut servers = serde_json::Map::new();
    servers.insert(
        format!("iris-{session_id}"),
        serde_json::json!({
            "type": "http",
            "url": format!("{scheme}://localhost:{port}/mcp/{session_id}"),
        }),
    );
    serde_json::json!({ "mcpServers": servers })
}

/// Write the MCP config file for a session and return its path. Remote
/// teams get the analogous file written through the SSH channel.
pub async fn write_mcp_config(
    team: &Team,
    session_id: &str,
    settings: &Settings,
) -> Result<PathBuf, IrisError> {
    let path = mcp_config_path(team, session_id);
    let body = serde_json::to_string_pretty(&mcp_config_json(team, session_id, settings))
        .map_err(|e| IrisError::Spawn(format!("rendering mcp config: {e}")))?;

    match team.remote {
        None => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, body).await?;
        }
        Some(ref remote) => {
            remote_write(remote, &path, &body).await?;
        }
    }
    Ok(path)
}

/// Best-effort removal of the session's MCP config file. Failures are
/// logged, never propagated.
pub async fn remove_mcp_config(team: &Team, path: &Path) {
    let result = match team.remote {
        None => tokio::fs::remove_file(path).await.map_err(|e| e.to_string()),
        Some(ref remote) => remote_remove(remote, path).await,
    };
    if let Err(error) = result {
        warn!(path = %path.display(), error, "failed to remove mcp config");
    }
}

fn ssh_base(remote: &RemoteHost) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("ssh");
    cmd.arg("-T");
    if let Some(port) = remote.port {
        cmd.arg("-p").arg(port.to_string());
    }
    if let Some(ref identity) = remote.identity_file {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(remote.destination());
    cmd
}

async fn remote_write(remote: &RemoteHost, path: &Path, body: &str) -> Result<(), IrisError> {
    use tokio::io::AsyncWriteExt;

    let dir = path.parent().map(|p| p.display().to_string()).unwrap_or_else(|| ".".into());
    let mut cmd = ssh_base(remote);
    cmd.arg(format!(
        "mkdir -p {} && cat > {}",
        shell_quote(&dir),
        shell_quote(&path.display().to_string()),
    ));
    cmd.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::null());

    let mut child = cmd.spawn()?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(body.as_bytes()).await?;
        stdin.shutdown().await?;
    }
    let status = child.wait().await?;
    if !status.success() {
        return Err(IrisError::Spawn(format!(
            "writing remote mcp config to {} failed ({status})",
            path.display(),
        )));
    }
    Ok(())
}

async fn remote_remove(remote: &RemoteHost, path: &Path) -> Result<(), String> {
    let mut cmd = ssh_base(remote);
    cmd.arg(format!("rm -f {}", shell_quote(&path.display().to_string())));
    cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
    match cmd.status().await {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(format!("ssh rm exited with {status}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(test)]
#[path = "command_tests.rs"]
mod tests;
