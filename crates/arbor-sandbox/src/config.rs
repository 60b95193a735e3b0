// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Network access policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkPolicy {
    /// No network access.
    #[default]
    Blocked,
    /// Unrestricted network access.
    Allowed,
    /// Only hosts in `allowed_hosts` (subdomains match via trailing `.host`).
    Restricted,
}

/// Sandbox configuration.
///
/// Every file path handed to the sandbox must resolve strictly inside
/// `root_dir`.  Command and network policy is advisory; tools opt in by
/// consulting the sandbox before acting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Root of the writable world.  Relative paths resolve against it.
    pub root_dir: PathBuf,
    /// `"*"` means every command; otherwise an entry matches the command's
    /// first whitespace-delimited token or a prefix of the whole trimmed
    /// command (case-insensitive).
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    /// Case-insensitive prefix match; a ban wins over any allow.
    #[serde(default = "default_banned_commands")]
    pub banned_commands: Vec<String>,
    /// Commands that bypass the permission rendezvous (exact match, or a
    /// prefix bounded by a space or `-`).
    #[serde(default = "default_safe_read_only_commands")]
    pub safe_read_only_commands: Vec<String>,
    /// When set, writes require the target's trailing extension to appear
    /// here (case-insensitive, with or without the leading dot).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_write_extensions: Option<Vec<String>>,
    /// Advisory output cap for tools.
    #[serde(default = "default_max_output_length")]
    pub max_output_length: usize,
    /// Advisory command timeout for tools.
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Skip the permission rendezvous entirely.  Bans still apply.
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub network: NetworkPolicy,
    /// Consulted only when `network` is `restricted`.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
}

impl SandboxConfig {
    /// Config with defaults for everything except the root directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            allowed_commands: default_allowed_commands(),
            banned_commands: default_banned_commands(),
            safe_read_only_commands: default_safe_read_only_commands(),
            allowed_write_extensions: None,
            max_output_length: default_max_output_length(),
            command_timeout_ms: default_command_timeout_ms(),
            auto_approve: false,
            network: NetworkPolicy::default(),
            allowed_hosts: Vec::new(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    vec!["*".into()]
}

fn default_banned_commands() -> Vec<String> {
    [
        "rm -rf /",
        "rm -rf ~",
        "sudo",
        "su ",
        "shutdown",
        "reboot",
        "halt",
        "poweroff",
        "mkfs",
        "dd if=",
        ":(){",
        "chmod -r 777 /",
        "chown -r",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_safe_read_only_commands() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "pwd", "echo", "which", "wc", "file", "stat", "grep", "find",
        "env", "date", "whoami", "git status", "git log", "git diff", "git branch", "git show",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_max_output_length() -> usize {
    30_000
}

fn default_command_timeout_ms() -> u64 {
    120_000
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = SandboxConfig::new("/tmp/work");
        assert_eq!(cfg.allowed_commands, vec!["*"]);
        assert_eq!(cfg.max_output_length, 30_000);
        assert_eq!(cfg.command_timeout_ms, 120_000);
        assert!(!cfg.auto_approve);
        assert_eq!(cfg.network, NetworkPolicy::Blocked);
        assert!(cfg.allowed_hosts.is_empty());
        assert!(cfg.allowed_write_extensions.is_none());
    }

    #[test]
    fn deserializes_with_only_root_dir() {
        let cfg: SandboxConfig = serde_json::from_str(r#"{ "root_dir": "/srv/x" }"#).unwrap();
        assert_eq!(cfg.root_dir, PathBuf::from("/srv/x"));
        assert!(cfg.banned_commands.iter().any(|c| c == "sudo"));
        assert!(cfg
            .safe_read_only_commands
            .iter()
            .any(|c| c == "git status"));
    }

    #[test]
    fn network_policy_deserializes_lowercase() {
        let cfg: SandboxConfig =
            serde_json::from_str(r#"{ "root_dir": "/x", "network": "restricted" }"#).unwrap();
        assert_eq!(cfg.network, NetworkPolicy::Restricted);
    }
}
