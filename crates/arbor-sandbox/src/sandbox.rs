// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{NetworkPolicy, SandboxConfig};

/// Every permission request auto-denies after this long.
const PERMISSION_TIMEOUT: Duration = Duration::from_secs(300);

/// Policy failure raised or returned by the sandbox.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path violation: {0}")]
    PathViolation(String),
    #[error("command banned: {0}")]
    CommandBanned(String),
    #[error("command not allowed: {0}")]
    CommandNotAllowed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("network blocked: {0}")]
    NetworkBlocked(String),
}

impl SandboxError {
    /// Snake_case discriminant, stable across message changes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathViolation(_) => "path_violation",
            Self::CommandBanned(_) => "command_banned",
            Self::CommandNotAllowed(_) => "command_not_allowed",
            Self::PermissionDenied(_) => "permission_denied",
            Self::NetworkBlocked(_) => "network_blocked",
        }
    }
}

/// Verdict for one command string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub needs_permission: bool,
}

/// A pending question for the external permission handler.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRequest {
    pub id: String,
    pub tool: String,
    pub action: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Optional path/command context attached to a permission request.
#[derive(Debug, Clone, Default)]
pub struct PermissionScope {
    pub path: Option<String>,
    pub command: Option<String>,
}

/// A resolved permission request, appended to the decisions log.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionRecord {
    #[serde(flatten)]
    pub request: PermissionRequest,
    pub granted: bool,
    pub decided_at: DateTime<Utc>,
    pub persistent: bool,
}

/// Snapshot of the sandbox counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SandboxCounters {
    pub total_requests: u64,
    pub granted: u64,
    pub denied: u64,
    pub path_violations: u64,
    pub command_violations: u64,
}

/// Introspection snapshot: configuration, pending requests, the last 50
/// decisions, and counters.
#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    pub config: SandboxConfig,
    pub pending: Vec<PermissionRequest>,
    pub recent_decisions: Vec<PermissionRecord>,
    pub counters: SandboxCounters,
}

/// Notified when a request needs an interactive decision.  Resolution comes
/// back through [`Sandbox::grant_permission`] / [`Sandbox::deny_permission`].
pub type PermissionHandler = Arc<dyn Fn(PermissionRequest) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct GrantKey {
    tool: String,
    action: String,
    path: Option<String>,
}

struct PendingPermission {
    request: PermissionRequest,
    tx: oneshot::Sender<bool>,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    granted: AtomicU64,
    denied: AtomicU64,
    path_violations: AtomicU64,
    command_violations: AtomicU64,
}

/// Synchronous policy oracle over paths, commands, write extensions, and
/// network destinations, plus the asynchronous permission rendezvous.
///
/// The sandbox is advisory: tools consult it before acting; it never
/// intercepts anything by itself.
pub struct Sandbox {
    config: SandboxConfig,
    handler: Mutex<Option<PermissionHandler>>,
    pending: Mutex<HashMap<String, PendingPermission>>,
    decisions: Mutex<Vec<PermissionRecord>>,
    grants: Mutex<Vec<GrantKey>>,
    counters: Counters,
}

impl Sandbox {
    /// Build a sandbox.  A relative `root_dir` is absolutized against the
    /// process working directory.
    pub fn new(mut config: SandboxConfig) -> Self {
        if !config.root_dir.is_absolute() {
            let cwd = std::env::current_dir().unwrap_or_default();
            config.root_dir = cwd.join(&config.root_dir);
        }
        config.root_dir = normalize_path(&config.root_dir);
        Self {
            config,
            handler: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            decisions: Mutex::new(Vec::new()),
            grants: Mutex::new(Vec::new()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Bind the external permission handler.  Replaces any previous one.
    pub fn set_permission_handler(&self, handler: PermissionHandler) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    /// Resolve `input` to an absolute path inside the root, raising
    /// `path_violation` when the lexically-normalized result escapes it.
    pub fn resolve_path(&self, input: impl AsRef<Path>) -> Result<PathBuf, SandboxError> {
        let input = input.as_ref();
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.config.root_dir.join(input)
        };
        let resolved = normalize_path(&joined);
        if resolved.starts_with(&self.config.root_dir) {
            Ok(resolved)
        } else {
            self.counters.path_violations.fetch_add(1, Ordering::Relaxed);
            Err(SandboxError::PathViolation(format!(
                "{} is outside {}",
                resolved.display(),
                self.config.root_dir.display()
            )))
        }
    }

    pub fn is_path_allowed(&self, input: impl AsRef<Path>) -> bool {
        let input = input.as_ref();
        let joined = if input.is_absolute() {
            input.to_path_buf()
        } else {
            self.config.root_dir.join(input)
        };
        normalize_path(&joined).starts_with(&self.config.root_dir)
    }

    /// Resolve a write target, then gate on the allowed extension list.
    pub fn validate_write(&self, input: impl AsRef<Path>) -> Result<PathBuf, SandboxError> {
        let resolved = self.resolve_path(input)?;
        let Some(allowed) = &self.config.allowed_write_extensions else {
            return Ok(resolved);
        };
        let ext = resolved
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase());
        let permitted = ext.as_deref().is_some_and(|ext| {
            allowed
                .iter()
                .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
        });
        if permitted {
            Ok(resolved)
        } else {
            self.counters.path_violations.fetch_add(1, Ordering::Relaxed);
            Err(SandboxError::PathViolation(format!(
                "write extension not allowed for {}",
                resolved.display()
            )))
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    /// Classify a command string.  A ban wins over the allow list; the allow
    /// list wins over the safe-read-only bypass; everything else is allowed
    /// but needs permission unless `auto_approve` is set.
    pub fn validate_command(&self, command: &str) -> CommandDecision {
        let cmd = command.trim().to_lowercase();

        for banned in &self.config.banned_commands {
            if cmd.starts_with(&banned.to_lowercase()) {
                self.counters
                    .command_violations
                    .fetch_add(1, Ordering::Relaxed);
                return CommandDecision {
                    allowed: false,
                    reason: Some(format!("command matches banned pattern: {banned}")),
                    needs_permission: false,
                };
            }
        }

        let wildcard = self.config.allowed_commands.iter().any(|a| a == "*");
        if !wildcard {
            let first_token = cmd.split_whitespace().next().unwrap_or("");
            let matched = self.config.allowed_commands.iter().any(|a| {
                let a = a.to_lowercase();
                first_token == a || cmd.starts_with(&a)
            });
            if !matched {
                self.counters
                    .command_violations
                    .fetch_add(1, Ordering::Relaxed);
                return CommandDecision {
                    allowed: false,
                    reason: Some("command is not in the allowed list".into()),
                    needs_permission: false,
                };
            }
        }

        if self
            .config
            .safe_read_only_commands
            .iter()
            .any(|s| safe_command_matches(&cmd, &s.to_lowercase()))
        {
            return CommandDecision {
                allowed: true,
                reason: None,
                needs_permission: false,
            };
        }

        CommandDecision {
            allowed: true,
            reason: None,
            needs_permission: !self.config.auto_approve,
        }
    }

    // ── Network ──────────────────────────────────────────────────────────────

    pub fn validate_network(&self, url: &str) -> Result<(), SandboxError> {
        match self.config.network {
            NetworkPolicy::Allowed => Ok(()),
            NetworkPolicy::Blocked => Err(SandboxError::NetworkBlocked(format!(
                "network access is blocked ({url})"
            ))),
            NetworkPolicy::Restricted => {
                let host = host_of(url).to_lowercase();
                let permitted = self.config.allowed_hosts.iter().any(|h| {
                    let h = h.to_lowercase();
                    host == h || host.ends_with(&format!(".{h}"))
                });
                if permitted {
                    Ok(())
                } else {
                    Err(SandboxError::NetworkBlocked(format!(
                        "host {host} is not in the allowed list"
                    )))
                }
            }
        }
    }

    // ── Permission rendezvous ────────────────────────────────────────────────

    /// Ask for permission.  Returns `true` when granted.
    ///
    /// `auto_approve` and a matching persistent grant resolve immediately
    /// without invoking the handler; otherwise the request is parked until
    /// [`grant_permission`](Self::grant_permission) /
    /// [`deny_permission`](Self::deny_permission), or the 5-minute auto-deny.
    pub async fn request_permission(
        &self,
        tool: &str,
        action: &str,
        description: &str,
        scope: PermissionScope,
    ) -> bool {
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if self.config.auto_approve {
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let key = GrantKey {
            tool: tool.to_string(),
            action: action.to_string(),
            path: scope.path.clone(),
        };
        if self.grants.lock().unwrap().contains(&key) {
            debug!(tool, action, "permission satisfied by persistent grant");
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let request = PermissionRequest {
            id: short_request_id(),
            tool: tool.to_string(),
            action: action.to_string(),
            description: description.to_string(),
            path: scope.path,
            command: scope.command,
            created_at: Utc::now(),
        };
        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            id.clone(),
            PendingPermission {
                request: request.clone(),
                tx,
            },
        );

        let handler = self.handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler(request);
        }

        match tokio::time::timeout(PERMISSION_TIMEOUT, rx).await {
            Ok(Ok(granted)) => granted,
            // Resolver dropped without sending; treat as denied.
            Ok(Err(_)) => false,
            Err(_) => {
                warn!(id = %id, tool, action, "permission request timed out; auto-denying");
                self.resolve(&id, false, false);
                false
            }
        }
    }

    /// Resolve a pending request as granted.  `persistent` additionally adds
    /// a `(tool, action, path)` matcher so future identical requests succeed
    /// without the handler.  Resolving twice is a no-op.
    pub fn grant_permission(&self, id: &str, persistent: bool) {
        self.resolve(id, true, persistent);
    }

    /// Resolve a pending request as denied.  Resolving twice is a no-op.
    pub fn deny_permission(&self, id: &str) {
        self.resolve(id, false, false);
    }

    fn resolve(&self, id: &str, granted: bool, persistent: bool) {
        let Some(pending) = self.pending.lock().unwrap().remove(id) else {
            return;
        };
        if granted {
            self.counters.granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.denied.fetch_add(1, Ordering::Relaxed);
        }
        if granted && persistent {
            self.grants.lock().unwrap().push(GrantKey {
                tool: pending.request.tool.clone(),
                action: pending.request.action.clone(),
                path: pending.request.path.clone(),
            });
        }
        self.decisions.lock().unwrap().push(PermissionRecord {
            request: pending.request,
            granted,
            decided_at: Utc::now(),
            persistent: granted && persistent,
        });
        let _ = pending.tx.send(granted);
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn status(&self) -> SandboxStatus {
        let decisions = self.decisions.lock().unwrap();
        let recent_decisions = decisions
            .iter()
            .rev()
            .take(50)
            .rev()
            .cloned()
            .collect();
        SandboxStatus {
            config: self.config.clone(),
            pending: self
                .pending
                .lock()
                .unwrap()
                .values()
                .map(|p| p.request.clone())
                .collect(),
            recent_decisions,
            counters: SandboxCounters {
                total_requests: self.counters.total_requests.load(Ordering::Relaxed),
                granted: self.counters.granted.load(Ordering::Relaxed),
                denied: self.counters.denied.load(Ordering::Relaxed),
                path_violations: self.counters.path_violations.load(Ordering::Relaxed),
                command_violations: self.counters.command_violations.load(Ordering::Relaxed),
            },
        }
    }
}

/// Lexical normalization: resolves `.` and `..` without touching the
/// filesystem, so non-existent targets can still be judged.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Exact match, or a prefix bounded by a space or `-`.
fn safe_command_matches(cmd: &str, safe: &str) -> bool {
    if cmd == safe {
        return true;
    }
    cmd.strip_prefix(safe)
        .and_then(|rest| rest.chars().next())
        .is_some_and(|c| c == ' ' || c == '-')
}

fn host_of(url: &str) -> &str {
    let rest = url.split("://").nth(1).unwrap_or(url);
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or("");
    let host_port = authority.rsplit('@').next().unwrap_or(authority);
    host_port.split(':').next().unwrap_or(host_port)
}

fn short_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("perm_{}", &id[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn sandbox() -> Sandbox {
        Sandbox::new(SandboxConfig::new("/work/project"))
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    #[test]
    fn relative_path_resolves_inside_root() {
        let sb = sandbox();
        let p = sb.resolve_path("src/main.rs").unwrap();
        assert_eq!(p, PathBuf::from("/work/project/src/main.rs"));
        assert!(sb.is_path_allowed("src/main.rs"));
    }

    #[test]
    fn dotdot_escape_is_a_path_violation() {
        let sb = sandbox();
        let err = sb.resolve_path("../outside.txt").unwrap_err();
        assert_eq!(err.kind(), "path_violation");
        assert!(!sb.is_path_allowed("../outside.txt"));
        assert_eq!(sb.status().counters.path_violations, 1);
    }

    #[test]
    fn deep_dotdot_chain_is_rejected() {
        let sb = sandbox();
        assert!(!sb.is_path_allowed("a/b/../../../../etc/passwd"));
        assert!(sb.resolve_path("a/b/../../../../etc/passwd").is_err());
    }

    #[test]
    fn dotdot_that_stays_inside_is_fine() {
        let sb = sandbox();
        let p = sb.resolve_path("src/../docs/x.md").unwrap();
        assert_eq!(p, PathBuf::from("/work/project/docs/x.md"));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let sb = sandbox();
        assert!(sb.resolve_path("/etc/passwd").is_err());
    }

    #[test]
    fn sandbox_over_a_real_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sb = Sandbox::new(SandboxConfig::new(dir.path()));
        let p = sb.resolve_path("notes.txt").unwrap();
        assert!(p.starts_with(dir.path()));
        assert!(sb.resolve_path(dir.path().join("sub/file.rs")).is_ok());
        assert!(sb.resolve_path("/etc/hosts").is_err());
    }

    #[test]
    fn root_prefix_sibling_is_not_a_descendant() {
        let sb = sandbox();
        // Same string prefix, different directory.
        assert!(!sb.is_path_allowed("/work/project2/file"));
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    #[test]
    fn write_extension_gate_is_case_insensitive_and_dot_agnostic() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.allowed_write_extensions = Some(vec![".rs".into(), "MD".into()]);
        let sb = Sandbox::new(cfg);
        assert!(sb.validate_write("src/lib.rs").is_ok());
        assert!(sb.validate_write("README.md").is_ok());
        let err = sb.validate_write("script.sh").unwrap_err();
        assert_eq!(err.kind(), "path_violation");
    }

    #[test]
    fn write_outside_root_raises_before_extension_check() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.allowed_write_extensions = Some(vec!["rs".into()]);
        let sb = Sandbox::new(cfg);
        assert!(sb.validate_write("../evil.rs").is_err());
    }

    // ── Commands ─────────────────────────────────────────────────────────────

    #[test]
    fn banned_command_rejected_even_with_auto_approve() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.auto_approve = true;
        let sb = Sandbox::new(cfg);
        let decision = sb.validate_command("sudo rm -rf /");
        assert!(!decision.allowed);
        assert!(!decision.needs_permission);
        assert!(decision.reason.unwrap().contains("banned"));
        assert_eq!(sb.status().counters.command_violations, 1);
    }

    #[test]
    fn ban_match_is_case_insensitive() {
        let sb = sandbox();
        assert!(!sb.validate_command("SUDO apt install x").allowed);
    }

    #[test]
    fn safe_read_only_command_bypasses_permission() {
        let sb = sandbox();
        let decision = sb.validate_command("git status --short");
        assert!(decision.allowed);
        assert!(!decision.needs_permission);
    }

    #[test]
    fn safe_prefix_must_be_word_bounded() {
        let sb = sandbox();
        // "ls" is safe; "lsof" is not a safe-prefix match.
        assert!(!sb.validate_command("ls").needs_permission);
        assert!(sb.validate_command("lsof -i :80").needs_permission);
    }

    #[test]
    fn default_command_needs_permission() {
        let sb = sandbox();
        let decision = sb.validate_command("cargo build");
        assert!(decision.allowed);
        assert!(decision.needs_permission);
    }

    #[test]
    fn auto_approve_drops_permission_requirement() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.auto_approve = true;
        let sb = Sandbox::new(cfg);
        assert!(!sb.validate_command("cargo build").needs_permission);
    }

    #[test]
    fn restricted_allow_list_rejects_unlisted_command() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.allowed_commands = vec!["git".into(), "cargo check".into()];
        let sb = Sandbox::new(cfg);
        assert!(sb.validate_command("git push").allowed);
        assert!(sb.validate_command("cargo check --all").allowed);
        let decision = sb.validate_command("python3 x.py");
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("allowed list"));
    }

    #[test]
    fn ban_beats_allow_list() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.allowed_commands = vec!["sudo".into()];
        let sb = Sandbox::new(cfg);
        assert!(!sb.validate_command("sudo ls").allowed);
    }

    // ── Network ──────────────────────────────────────────────────────────────

    #[test]
    fn network_blocked_by_default() {
        let sb = sandbox();
        let err = sb.validate_network("https://example.com/x").unwrap_err();
        assert_eq!(err.kind(), "network_blocked");
    }

    #[test]
    fn network_allowed_policy_accepts_anything() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.network = NetworkPolicy::Allowed;
        let sb = Sandbox::new(cfg);
        assert!(sb.validate_network("http://anything.invalid").is_ok());
    }

    #[test]
    fn restricted_matches_host_and_subdomains() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.network = NetworkPolicy::Restricted;
        cfg.allowed_hosts = vec!["example.com".into()];
        let sb = Sandbox::new(cfg);
        assert!(sb.validate_network("https://example.com/a").is_ok());
        assert!(sb.validate_network("https://api.example.com:8443/a").is_ok());
        assert!(sb.validate_network("https://notexample.com/a").is_err());
        assert!(sb.validate_network("https://example.com.evil.io/a").is_err());
    }

    // ── Permission rendezvous ────────────────────────────────────────────────

    #[tokio::test]
    async fn auto_approve_grants_without_handler() {
        let mut cfg = SandboxConfig::new("/work/project");
        cfg.auto_approve = true;
        let sb = Sandbox::new(cfg);
        assert!(
            sb.request_permission("shell", "execute", "run ls", PermissionScope::default())
                .await
        );
        let counters = sb.status().counters;
        assert_eq!(counters.total_requests, 1);
        assert_eq!(counters.granted, 1);
    }

    #[tokio::test]
    async fn grant_resolves_waiting_request() {
        let sb = Arc::new(sandbox());
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let sb = Arc::clone(&sb);
            let seen = Arc::clone(&seen);
            sb.clone().set_permission_handler(Arc::new(move |req| {
                seen.lock().unwrap().push(req.id.clone());
                sb.grant_permission(&req.id, false);
            }));
        }
        let granted = sb
            .request_permission("shell", "execute", "run build", PermissionScope::default())
            .await;
        assert!(granted);
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(sb.status().recent_decisions.len(), 1);
        assert!(sb.status().recent_decisions[0].granted);
    }

    #[tokio::test]
    async fn deny_resolves_waiting_request() {
        let sb = Arc::new(sandbox());
        {
            let sb = Arc::clone(&sb);
            sb.clone()
                .set_permission_handler(Arc::new(move |req| sb.deny_permission(&req.id)));
        }
        let granted = sb
            .request_permission("fs", "write", "write file", PermissionScope::default())
            .await;
        assert!(!granted);
        assert_eq!(sb.status().counters.denied, 1);
    }

    #[tokio::test]
    async fn persistent_grant_skips_handler_on_matching_tuple() {
        let sb = Arc::new(sandbox());
        let handler_calls = Arc::new(AtomicUsize::new(0));
        {
            let sb = Arc::clone(&sb);
            let handler_calls = Arc::clone(&handler_calls);
            sb.clone().set_permission_handler(Arc::new(move |req| {
                handler_calls.fetch_add(1, Ordering::SeqCst);
                sb.grant_permission(&req.id, true);
            }));
        }
        let scope = PermissionScope {
            path: Some("/work/project/a.txt".into()),
            command: None,
        };
        assert!(
            sb.request_permission("fs", "write", "write a", scope.clone())
                .await
        );
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

        // Same (tool, action, path): granted without the handler.
        assert!(
            sb.request_permission("fs", "write", "write a again", scope)
                .await
        );
        assert_eq!(handler_calls.load(Ordering::SeqCst), 1);

        // Different path still goes through the handler.
        let other = PermissionScope {
            path: Some("/work/project/b.txt".into()),
            command: None,
        };
        assert!(sb.request_permission("fs", "write", "write b", other).await);
        assert_eq!(handler_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_auto_denies_after_timeout() {
        let sb = Arc::new(sandbox());
        // No handler bound: the request parks until the timeout fires.
        let granted = sb
            .request_permission("shell", "execute", "slow", PermissionScope::default())
            .await;
        assert!(!granted);
        let status = sb.status();
        assert!(status.pending.is_empty());
        assert_eq!(status.counters.denied, 1);
        assert!(!status.recent_decisions[0].granted);
    }

    #[tokio::test]
    async fn double_resolution_is_a_noop() {
        let sb = Arc::new(sandbox());
        {
            let sb = Arc::clone(&sb);
            sb.clone().set_permission_handler(Arc::new(move |req| {
                sb.grant_permission(&req.id, false);
                sb.deny_permission(&req.id);
                sb.grant_permission(&req.id, false);
            }));
        }
        assert!(
            sb.request_permission("shell", "execute", "x", PermissionScope::default())
                .await
        );
        let counters = sb.status().counters;
        assert_eq!(counters.granted, 1);
        assert_eq!(counters.denied, 0);
        assert_eq!(sb.status().recent_decisions.len(), 1);
    }

    #[test]
    fn status_caps_recent_decisions_at_50() {
        let sb = sandbox();
        {
            let mut decisions = sb.decisions.lock().unwrap();
            for i in 0..60 {
                decisions.push(PermissionRecord {
                    request: PermissionRequest {
                        id: format!("perm_{i}"),
                        tool: "t".into(),
                        action: "a".into(),
                        description: String::new(),
                        path: None,
                        command: None,
                        created_at: Utc::now(),
                    },
                    granted: true,
                    decided_at: Utc::now(),
                    persistent: false,
                });
            }
        }
        let status = sb.status();
        assert_eq!(status.recent_decisions.len(), 50);
        // Most recent are kept.
        assert_eq!(status.recent_decisions.last().unwrap().request.id, "perm_59");
        assert_eq!(status.recent_decisions[0].request.id, "perm_10");
    }
}
