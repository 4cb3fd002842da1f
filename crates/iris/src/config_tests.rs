// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::{PermissionMode, TeamsConfig};

fn parse(json: &str) -> TeamsConfig {
    serde_json::from_str(json).unwrap()
}

#[test]
fn minimal_team_gets_defaults() {
    let config = parse(r#"{"teams": {"alpha": {"path": "/work/alpha"}}}"#);
    config.validate().unwrap();

    assert_eq!(config.settings.max_processes, 5);
    assert_eq!(config.settings.session_init_timeout_secs, 60);
    assert_eq!(config.settings.http_port, 1615);

    let team = config.team("alpha").unwrap();
    assert_eq!(team.executable(), "claude");
    assert_eq!(team.permissions, PermissionMode::Yes);
    assert!(!team.is_remote());
    assert!(team.idle_timeout().is_none());
}

#[test]
fn full_team_round_trips() {
    let config = parse(
        r#"{
            "settings": {"maxProcesses": 2, "sessionInitTimeoutSecs": 10},
            "teams": {
                "beta": {
                    "path": "/work/beta",
                    "claudePath": "/opt/claude",
                    "permissions": "no",
                    "disallowedTools": ["Bash", "Write"],
                    "allowHttp": true,
                    "reverseMcpPort": 9000,
                    "idleTimeoutSecs": 120,
                    "remote": {"host": "build.example.com", "user": "ops", "port": 2222}
                }
            }
        }"#,
    );
    config.validate().unwrap();

    assert_eq!(config.settings.max_processes, 2);
    let team = config.team("beta").unwrap();
    assert_eq!(team.executable(), "/opt/claude");
    assert_eq!(team.permissions, PermissionMode::No);
    assert!(!team.permissions.prompts());
    assert_eq!(team.disallowed_tools, ["Bash", "Write"]);
    assert_eq!(team.reverse_mcp_port, Some(9000));
    let remote = team.remote.as_ref().unwrap();
    assert_eq!(remote.destination(), "ops@build.example.com");
}

#[test]
fn remote_destination_without_user() {
    let config = parse(
        r#"{"teams": {"r": {"path": "/w", "remote": {"host": "box"}}}}"#,
    );
    assert_eq!(config.team("r").unwrap().remote.as_ref().unwrap().destination(), "box");
}

#[test]
fn rejects_empty_teams() {
    let config = parse(r#"{"teams": {}}"#);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("no teams"), "unexpected error: {err}");
}

#[test]
fn rejects_arrow_in_team_name() {
    let config = parse(r#"{"teams": {"a->b": {"path": "/w"}}}"#);
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("->"), "unexpected error: {err}");
}

#[test]
fn rejects_zero_max_processes() {
    let config = parse(
        r#"{"settings": {"maxProcesses": 0}, "teams": {"a": {"path": "/w"}}}"#,
    );
    assert!(config.validate().is_err());
}

#[test]
fn team_names_are_ordered() {
    let config = parse(
        r#"{"teams": {"zeta": {"path": "/z"}, "alpha": {"path": "/a"}, "mid": {"path": "/m"}}}"#,
    );
    assert_eq!(config.team_names(), ["alpha", "mid", "zeta"]);
}
