// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Supervisor and router for long-lived interactive agent processes.
#[derive(Debug, Parser)]
#[command(name = "iris", version, about)]
pub struct Config {
    /// Path to the teams configuration file (JSON).
    #[arg(long, env = "IRIS_CONFIG", default_value = "iris.json")]
    pub config: PathBuf,

    /// Path to the session database (defaults to the state directory).
    #[arg(long, env = "IRIS_DB")]
    pub db: Option<PathBuf>,

    /// Port override advertised to spawned agents in their MCP config.
    #[arg(long, env = "IRIS_HTTP_PORT")]
    pub http_port: Option<u16>,

    /// Log format (json or text).
    #[arg(long, env = "IRIS_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "IRIS_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Wake every configured team at boot.
    #[arg(long, env = "IRIS_WAKE_ON_BOOT")]
    pub wake_on_boot: bool,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        Ok(())
    }

    /// Resolve the session database path: explicit flag, else
    /// `<state dir>/sessions.db`.
    pub fn db_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(ref db) = self.db {
            return Ok(db.clone());
        }
        Ok(state_dir()?.join("sessions.db"))
    }
}

/// Return (and create) the iris state directory:
/// `$XDG_STATE_HOME/iris/` (defaulting to `~/.local/state/iris/`).
pub fn state_dir() -> anyhow::Result<PathBuf> {
    let state_home = std::env::var("XDG_STATE_HOME").unwrap_or_else(|_| {
        let home = std::env::var("HOME").unwrap_or_default();
        format!("{home}/.local/state")
    });
    let dir = PathBuf::from(state_home).join("iris");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Pool-wide tunables from the teams file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Upper bound on concurrently live agent processes.
    pub max_processes: usize,
    /// Seconds a spawn may take to reach init + first result.
    pub session_init_timeout_secs: u64,
    /// Seconds between pool health sweeps.
    pub health_check_interval_secs: u64,
    /// Port spawned agents call back on, absent env/team overrides.
    pub http_port: u16,
    /// Name this workspace reports for `team_name` lookups.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team_name: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_processes: 5,
            session_init_timeout_secs: 60,
            health_check_interval_secs: 30,
            http_port: 1615,
            team_name: None,
        }
    }
}

impl Settings {
    pub fn session_init_timeout(&self) -> Duration {
        Duration::from_secs(self.session_init_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Tool-grant policy for a team's agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    Ask,
    #[default]
    Yes,
    No,
}

impl PermissionMode {
    /// Whether the spawned agent gets a permission-prompt tool wired in.
    pub fn prompts(&self) -> bool {
        !matches!(self, Self::No)
    }
}

/// Remote execution target for a team whose workspace lives on another
/// host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteHost {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
}

impl RemoteHost {
    /// `user@host` or bare host, as handed to ssh.
    pub fn destination(&self) -> String {
        match self.user {
            Some(ref user) => format!("{user}@{}", self.host),
            None => self.host.clone(),
        }
    }
}

/// One configured team: a named workspace an agent is spawned into.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    /// Workspace path (cwd of the spawned agent).
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteHost>,
    /// Custom agent executable; defaults to `claude` on PATH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claude_path: Option<String>,
    #[serde(default)]
    pub permissions: PermissionMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disallowed_tools: Vec<String>,
    /// Serve the MCP callback over plain HTTP even for remote teams.
    #[serde(default)]
    pub allow_http: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_mcp_port: Option<u16>,
    /// Terminate the team's READY process after this much silence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,
}

impl Team {
    pub fn executable(&self) -> &str {
        self.claude_path.as_deref().unwrap_or("claude")
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// The loaded teams file: pool settings plus the team table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamsConfig {
    #[serde(default)]
    pub settings: Settings,
    pub teams: BTreeMap<String, Team>,
}

impl TeamsConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {e}", path.display()))?;
        let config: Self = serde_json::from_str(&data)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.teams.is_empty() {
            anyhow::bail!("no teams configured");
        }
        if self.settings.max_processes == 0 {
            anyhow::bail!("maxProcesses must be at least 1");
        }
        for (name, team) in &self.teams {
            if name.is_empty() {
                anyhow::bail!("team names cannot be empty");
            }
            if name.contains("->") {
                anyhow::bail!("team name {name:?} may not contain \"->\"");
            }
            if team.path.as_os_str().is_empty() {
                anyhow::bail!("team {name}: path is required");
            }
        }
        Ok(())
    }

    pub fn team(&self, name: &str) -> Option<&Team> {
        self.teams.get(name)
    }

    /// Configured team names in stable order.
    pub fn team_names(&self) -> Vec<String> {
        self.teams.keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
