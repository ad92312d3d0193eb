//! Policy Engine (C6) — priority-ordered rule set mapping
//! `PolicyContext -> Decision`, plus the action preview lifecycle.
//!
//! Per the redesign flag in spec §9, rule conditions are not closures
//! captured over module state: each `PolicyRule` carries a
//! `PolicyCondition` trait object that takes a `&PolicyContext` value the
//! caller assembles fresh for every evaluation. Kill-switch/lockdown/budget
//! state is threaded in as plain fields on that context rather than read
//! from a captured singleton, so conditions are pure functions of their
//! input and testable in isolation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Decision, PolicyContext, RiskLevel};

pub type PolicyCondition = Arc<dyn Fn(&PolicyContext) -> bool + Send + Sync>;

pub const CUSTOM_RULE_PRIORITY_CEILING: i64 = 9000;

pub const PRIORITY_KILL_SWITCH: i64 = 10000;
pub const PRIORITY_ABSOLUTE_DENY: i64 = 9000;
pub const PRIORITY_BUDGET: i64 = 8500;
pub const PRIORITY_LOCKDOWN: i64 = 8000;
pub const PRIORITY_CONFIRM: i64 = 5000;
pub const PRIORITY_ALLOW: i64 = 1000;

#[derive(Clone)]
pub struct PolicyRule {
    pub id: String,
    pub name: String,
    pub priority: i64,
    pub condition: PolicyCondition,
    pub decision_kind: crate::types::DecisionKind,
    pub reason: String,
    pub requires_preview: bool,
}

impl std::fmt::Debug for PolicyRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyRule")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("decision_kind", &self.decision_kind)
            .finish()
    }
}

fn rule(
    id: &str,
    name: &str,
    priority: i64,
    condition: impl Fn(&PolicyContext) -> bool + Send + Sync + 'static,
    decision_kind: crate::types::DecisionKind,
    reason: &str,
) -> PolicyRule {
    PolicyRule {
        id: id.to_string(),
        name: name.to_string(),
        priority,
        condition: Arc::new(condition),
        decision_kind,
        reason: reason.to_string(),
        requires_preview: matches!(decision_kind, crate::types::DecisionKind::RequireConfirmation),
    }
}

const DESTRUCTIVE_COMMAND_RE_PATTERNS: &[&str] =
    &[r"(?i)rm\s+-rf\s+/", r"(?i)drop\s+table\b", r"(?i)delete\s+from\s+\w+"];

const BLOCKED_SSRF_HOSTS: &[&str] = &[
    "localhost",
    "0.0.0.0",
    "::1",
    "169.254.169.254",
    "metadata.google.internal",
];

fn is_blocked_hostname(host: &str) -> bool {
    let host = host.to_lowercase();
    BLOCKED_SSRF_HOSTS.contains(&host.as_str()) || host.ends_with(".local")
}

fn is_private_ip(ip: &str) -> bool {
    use std::net::IpAddr;
    let Ok(addr) = ip.parse::<IpAddr>() else {
        return false;
    };
    match addr {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.octets()[0] == 169 && v4.octets()[1] == 254
        }
        IpAddr::V6(v6) => v6.is_loopback() || (v6.segments()[0] & 0xfe00) == 0xfc00 || v6.is_unicast_link_local(),
    }
}

static DESTRUCTIVE_COMMAND_RE: Lazy<Vec<regex::Regex>> = Lazy::new(|| {
    DESTRUCTIVE_COMMAND_RE_PATTERNS
        .iter()
        .map(|p| regex::Regex::new(p).unwrap_or_else(|e| panic!("policy pattern {p:?} failed: {e}")))
        .collect()
});

fn destructive_command_in_params(ctx: &PolicyContext) -> bool {
    let Some(command) = ctx.what.parameters.get("command").and_then(|v| v.as_str()) else {
        return false;
    };
    DESTRUCTIVE_COMMAND_RE.iter().any(|re| re.is_match(command))
}

fn built_in_rules() -> Vec<PolicyRule> {
    use crate::types::DecisionKind::*;

    vec![
        rule(
            "kill-switch",
            "kill switch active",
            PRIORITY_KILL_SWITCH,
            |ctx| ctx.kill_switch_active,
            Deny,
            "kill switch active",
        ),
        rule(
            "deny-print-secret",
            "deny printing of a secret",
            PRIORITY_ABSOLUTE_DENY,
            |ctx| ctx.risk.accesses_secrets && !ctx.risk.sends_data && ctx.what.tool == "print",
            Deny,
            "action would print a secret value",
        ),
        rule(
            "deny-send-secret",
            "deny sending of a secret",
            PRIORITY_ABSOLUTE_DENY,
            |ctx| ctx.risk.accesses_secrets && ctx.risk.sends_data,
            Deny,
            "action would send a secret value externally",
        ),
        rule(
            "deny-ssrf-hostname",
            "deny SSRF to blocked hostname",
            PRIORITY_ABSOLUTE_DENY,
            |ctx| {
                ctx.r#where
                    .domain
                    .as_deref()
                    .map(is_blocked_hostname)
                    .unwrap_or(false)
            },
            Deny,
            "SSRF: request targets a blocked hostname or cloud metadata endpoint",
        ),
        rule(
            "deny-ssrf-private-ip",
            "deny SSRF to private IP range",
            PRIORITY_ABSOLUTE_DENY,
            |ctx| ctx.r#where.ip.as_deref().map(is_private_ip).unwrap_or(false),
            Deny,
            "SSRF: request targets a private or metadata IP range",
        ),
        rule(
            "budget-tool-calls-exceeded",
            "deny when tool-call budget exceeded",
            PRIORITY_BUDGET,
            |ctx| match (ctx.budget.tool_calls_used, ctx.budget.tool_calls_limit) {
                (Some(used), Some(limit)) => used >= limit,
                _ => false,
            },
            Deny,
            "tool-call budget for this run is exhausted",
        ),
        rule(
            "budget-cost-exceeded",
            "deny when cost budget exceeded",
            PRIORITY_BUDGET,
            |ctx| match (ctx.budget.cost_usd, ctx.budget.cost_limit_usd) {
                (Some(used), Some(limit)) => used >= limit,
                _ => false,
            },
            Deny,
            "cost budget for this run is exhausted",
        ),
        rule(
            "lockdown-confirm-external-send",
            "confirm external send under lockdown",
            PRIORITY_LOCKDOWN,
            |ctx| {
                ctx.lockdown
                    .as_ref()
                    .map(|ld| ld.enabled && ctx.risk.sends_data && ld.external_comms_confirm)
                    .unwrap_or(false)
            },
            RequireConfirmation,
            "lockdown mode requires confirmation before sending data externally",
        ),
        rule(
            "lockdown-confirm-destructive",
            "confirm destructive action under lockdown",
            PRIORITY_LOCKDOWN,
            |ctx| {
                ctx.lockdown
                    .as_ref()
                    .map(|ld| ld.enabled && ctx.risk.is_destructive && ld.writes_deletes_confirm)
                    .unwrap_or(false)
            },
            RequireConfirmation,
            "lockdown mode requires confirmation before a destructive action",
        ),
        rule(
            "lockdown-deny-shell-browser",
            "deny shell/browser under lockdown",
            PRIORITY_LOCKDOWN,
            |ctx| {
                let shell_or_browser =
                    matches!(ctx.what.tool.as_str(), "exec" | "bash" | "shell" | "browser");
                ctx.lockdown
                    .as_ref()
                    .map(|ld| ld.enabled && ld.shell_browser_deny && shell_or_browser)
                    .unwrap_or(false)
            },
            Deny,
            "lockdown mode denies shell and browser tools",
        ),
        rule(
            "lockdown-deny-network",
            "deny non-allowlisted network under lockdown",
            PRIORITY_LOCKDOWN,
            |ctx| {
                ctx.lockdown
                    .as_ref()
                    .map(|ld| {
                        ld.enabled
                            && ctx
                                .r#where
                                .domain
                                .as_ref()
                                .map(|d| !ld.outbound_network_allowlist.contains(d))
                                .unwrap_or(false)
                    })
                    .unwrap_or(false)
            },
            Deny,
            "lockdown mode denies network access outside the allowlist",
        ),
        rule(
            "confirm-external-message",
            "confirm external message send",
            PRIORITY_CONFIRM,
            |ctx| matches!(ctx.what.tool.as_str(), "message" | "send" | "email"),
            RequireConfirmation,
            "sending an external message requires confirmation",
        ),
        rule(
            "confirm-write-outside-workspace",
            "confirm file write outside workspace",
            PRIORITY_CONFIRM,
            |ctx| {
                ctx.what.tool == "write"
                    && ctx
                        .r#where
                        .file_path
                        .as_ref()
                        .map(|p| !p.starts_with("./") && !p.starts_with("/workspace"))
                        .unwrap_or(false)
            },
            RequireConfirmation,
            "writing outside the workspace requires confirmation",
        ),
        rule(
            "confirm-destructive",
            "confirm any destructive action",
            PRIORITY_CONFIRM,
            |ctx| ctx.risk.is_destructive || destructive_command_in_params(ctx),
            RequireConfirmation,
            "destructive action requires confirmation",
        ),
        rule(
            "confirm-shell",
            "confirm shell execution",
            PRIORITY_CONFIRM,
            |ctx| ctx.what.tool == "exec" || ctx.what.tool == "shell",
            RequireConfirmation,
            "shell command execution requires confirmation",
        ),
        rule(
            "confirm-browser",
            "confirm browser action",
            PRIORITY_CONFIRM,
            |ctx| ctx.what.tool == "browser",
            RequireConfirmation,
            "browser automation requires confirmation",
        ),
        rule(
            "confirm-config-change",
            "confirm config change",
            PRIORITY_CONFIRM,
            |ctx| ctx.risk.modifies_config,
            RequireConfirmation,
            "configuration change requires confirmation",
        ),
        rule(
            "confirm-upload",
            "confirm upload",
            PRIORITY_CONFIRM,
            |ctx| ctx.what.tool == "upload",
            RequireConfirmation,
            "upload requires confirmation",
        ),
        rule(
            "allow-read-only",
            "allow read-only tools",
            PRIORITY_ALLOW,
            |ctx| matches!(ctx.what.tool.as_str(), "read" | "list" | "search" | "view"),
            Allow,
            "read-only tool",
        ),
        rule(
            "allow-workspace-write",
            "allow workspace write",
            PRIORITY_ALLOW,
            |ctx| {
                ctx.what.tool == "write"
                    && ctx
                        .r#where
                        .file_path
                        .as_ref()
                        .map(|p| p.starts_with("./") || p.starts_with("/workspace"))
                        .unwrap_or(true)
            },
            Allow,
            "write within the workspace",
        ),
        rule(
            "allow-web-fetch-public",
            "allow web fetch to public domains",
            PRIORITY_ALLOW,
            |ctx| {
                ctx.what.tool == "fetch"
                    && !ctx
                        .r#where
                        .domain
                        .as_deref()
                        .map(is_blocked_hostname)
                        .unwrap_or(false)
            },
            Allow,
            "fetch to a public domain",
        ),
        rule(
            "allow-canvas-image",
            "allow canvas/image tools",
            PRIORITY_ALLOW,
            |ctx| matches!(ctx.what.tool.as_str(), "canvas" | "image"),
            Allow,
            "canvas/image tool",
        ),
    ]
}

pub struct PolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
    previews: RwLock<std::collections::HashMap<String, ActionPreview>>,
    preview_default_timeout_ms: i64,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PolicyEngine {
    pub fn new() -> Self {
        let mut rules = built_in_rules();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules: RwLock::new(rules),
            previews: RwLock::new(std::collections::HashMap::new()),
            preview_default_timeout_ms: 5 * 60 * 1000,
        }
    }

    /// Appends a custom rule. Rejected (returns `false`) if its priority
    /// reaches the reserved kill-switch/absolute-deny band — custom rules
    /// must never outrank those bands.
    pub fn add_custom_rule(&self, rule: PolicyRule) -> bool {
        if rule.priority >= CUSTOM_RULE_PRIORITY_CEILING {
            tracing::warn!(rule_id = %rule.id, priority = rule.priority, "rejected custom rule above priority ceiling");
            return false;
        }
        let mut rules = self.rules.write();
        rules.push(rule);
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        true
    }

    pub fn evaluate(&self, ctx: &PolicyContext) -> Decision {
        let rules = self.rules.read();
        for r in rules.iter() {
            let condition = r.condition.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| condition(ctx)));
            match outcome {
                Ok(true) => {
                    return Decision {
                        kind: r.decision_kind.clone(),
                        reason: r.reason.clone(),
                        rule_id: Some(r.id.clone()),
                        requires_preview: r.requires_preview,
                        preview_message: None,
                    };
                }
                Ok(false) => continue,
                Err(_) => {
                    tracing::error!(rule_id = %r.id, "policy rule condition panicked; failing closed");
                    return Decision::deny(
                        format!("rule '{}' failed during evaluation", r.id),
                        r.id.clone(),
                    );
                }
            }
        }
        Decision {
            kind: crate::types::DecisionKind::RequireConfirmation,
            reason: "unknown action".to_string(),
            rule_id: None,
            requires_preview: true,
            preview_message: None,
        }
    }

    pub fn would_deny(&self, ctx: &PolicyContext) -> bool {
        self.evaluate(ctx).is_deny()
    }

    pub fn would_require_confirmation(&self, ctx: &PolicyContext) -> bool {
        self.evaluate(ctx).is_confirm()
    }

    pub fn create_action_preview(&self, req: CreatePreviewRequest) -> ActionPreview {
        let now = crate::types::now();
        let timeout_ms = req.timeout_ms.unwrap_or(self.preview_default_timeout_ms);
        let risk_level = derive_risk_level(&req.ctx);
        let reversible = derive_reversibility(&req.tool, req.action.as_deref());

        let preview = ActionPreview {
            id: Uuid::new_v4().to_string(),
            tool: req.tool,
            action: req.action,
            description: req.description,
            risk_level,
            impacts: req.impacts,
            reversible,
            timeout_ms,
            created_at: now,
            expires_at: now + ChronoDuration::milliseconds(timeout_ms),
            status: PreviewStatus::Pending,
            approved_by: None,
            approved_at: None,
        };
        self.previews.write().insert(preview.id.clone(), preview.clone());
        preview
    }

    pub fn approve_action_preview(&self, id: &str, approved_by: Option<String>) -> bool {
        let mut previews = self.previews.write();
        let Some(preview) = previews.get_mut(id) else {
            return false;
        };
        if preview.status != PreviewStatus::Pending {
            return false;
        }
        if crate::types::now() > preview.expires_at {
            preview.status = PreviewStatus::Expired;
            return false;
        }
        preview.status = PreviewStatus::Approved;
        preview.approved_by = approved_by;
        preview.approved_at = Some(crate::types::now());
        true
    }

    pub fn deny_action_preview(&self, id: &str) -> bool {
        let mut previews = self.previews.write();
        let Some(preview) = previews.get_mut(id) else {
            return false;
        };
        if preview.status != PreviewStatus::Pending {
            return false;
        }
        preview.status = PreviewStatus::Denied;
        true
    }

    pub fn is_preview_approved(&self, id: &str) -> bool {
        let mut previews = self.previews.write();
        let Some(preview) = previews.get_mut(id) else {
            return false;
        };
        if preview.status == PreviewStatus::Pending && crate::types::now() > preview.expires_at {
            preview.status = PreviewStatus::Expired;
        }
        preview.status == PreviewStatus::Approved
    }

    pub fn get_preview(&self, id: &str) -> Option<ActionPreview> {
        self.previews.read().get(id).cloned()
    }

    /// Sweeps previews expired for more than an hour, per the audit
    /// retention window spec'd for expired previews.
    pub fn cleanup_expired_previews(&self) -> usize {
        let now = crate::types::now();
        let mut previews = self.previews.write();
        let before = previews.len();
        previews.retain(|_, p| {
            if p.status == PreviewStatus::Pending && now > p.expires_at {
                p.status = PreviewStatus::Expired;
            }
            !(p.status == PreviewStatus::Expired && now - p.expires_at > ChronoDuration::hours(1))
        });
        before - previews.len()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreatePreviewRequest {
    pub tool: String,
    pub action: Option<String>,
    pub description: String,
    pub ctx: PolicyContext,
    pub impacts: Vec<String>,
    pub timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Pending,
    Approved,
    Denied,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionPreview {
    pub id: String,
    pub tool: String,
    pub action: Option<String>,
    pub description: String,
    pub risk_level: RiskLevel,
    pub impacts: Vec<String>,
    pub reversible: bool,
    pub timeout_ms: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: PreviewStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
}

pub(crate) fn derive_risk_level(ctx: &PolicyContext) -> RiskLevel {
    if ctx.risk.accesses_secrets {
        RiskLevel::Critical
    } else if ctx.risk.is_destructive {
        RiskLevel::High
    } else if ctx.risk.is_external || ctx.risk.sends_data {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

fn derive_reversibility(tool: &str, action: Option<&str>) -> bool {
    let irreversible_tools = ["message", "send", "email", "exec", "shell"];
    let irreversible_actions = ["delete", "remove", "drop", "send"];
    if irreversible_tools.contains(&tool) {
        return false;
    }
    if let Some(action) = action {
        if irreversible_actions.contains(&action) {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Risk, What};

    fn ctx_with_tool(tool: &str) -> PolicyContext {
        PolicyContext {
            what: What {
                tool: tool.to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn kill_switch_denies_everything() {
        let engine = PolicyEngine::new();
        let mut ctx = ctx_with_tool("read");
        ctx.kill_switch_active = true;
        let decision = engine.evaluate(&ctx);
        assert!(decision.is_deny());
        assert!(decision.reason.contains("kill switch"));
    }

    #[test]
    fn read_only_tool_is_allowed() {
        let engine = PolicyEngine::new();
        let ctx = ctx_with_tool("read");
        assert!(engine.evaluate(&ctx).is_allow());
    }

    #[test]
    fn exec_requires_confirmation_by_default() {
        let engine = PolicyEngine::new();
        let ctx = ctx_with_tool("exec");
        assert!(engine.evaluate(&ctx).is_confirm());
    }

    #[test]
    fn ssrf_to_metadata_ip_is_denied() {
        let engine = PolicyEngine::new();
        let mut ctx = ctx_with_tool("exec");
        ctx.r#where.ip = Some("169.254.169.254".to_string());
        let decision = engine.evaluate(&ctx);
        assert!(decision.is_deny());
    }

    #[test]
    fn secret_send_is_absolute_deny() {
        let engine = PolicyEngine::new();
        let mut ctx = ctx_with_tool("message");
        ctx.risk = Risk {
            accesses_secrets: true,
            sends_data: true,
            ..Default::default()
        };
        let decision = engine.evaluate(&ctx);
        assert!(decision.is_deny());
        assert_eq!(decision.rule_id.as_deref(), Some("deny-send-secret"));
    }

    #[test]
    fn budget_exceeded_denies() {
        let engine = PolicyEngine::new();
        let mut ctx = ctx_with_tool("read");
        ctx.budget.tool_calls_used = Some(100);
        ctx.budget.tool_calls_limit = Some(100);
        assert!(engine.evaluate(&ctx).is_deny());
    }

    #[test]
    fn panicking_condition_fails_closed() {
        let engine = PolicyEngine::new();
        let panic_rule = rule(
            "custom-panic",
            "always panics",
            PRIORITY_ALLOW + 1,
            |_| panic!("boom"),
            crate::types::DecisionKind::Allow,
            "n/a",
        );
        assert!(engine.add_custom_rule(panic_rule));
        let ctx = ctx_with_tool("read");
        let decision = engine.evaluate(&ctx);
        assert!(decision.is_deny());
    }

    #[test]
    fn custom_rule_cannot_reach_reserved_priority_band() {
        let engine = PolicyEngine::new();
        let custom = rule(
            "custom-too-high",
            "tries to outrank kill switch",
            PRIORITY_ABSOLUTE_DENY,
            |_| true,
            crate::types::DecisionKind::Allow,
            "n/a",
        );
        assert!(!engine.add_custom_rule(custom));
    }

    #[test]
    fn unknown_action_defaults_to_confirmation() {
        let engine = PolicyEngine::new();
        let ctx = ctx_with_tool("some_never_registered_tool");
        let decision = engine.evaluate(&ctx);
        assert!(decision.is_confirm());
        assert_eq!(decision.reason, "unknown action");
    }

    #[test]
    fn preview_lifecycle_approve_before_expiry() {
        let engine = PolicyEngine::new();
        let preview = engine.create_action_preview(CreatePreviewRequest {
            tool: "exec".to_string(),
            description: "ls -la".to_string(),
            timeout_ms: Some(60_000),
            ..Default::default()
        });
        assert!(engine.approve_action_preview(&preview.id, Some("alice".to_string())));
        assert!(engine.is_preview_approved(&preview.id));
    }

    #[test]
    fn preview_reapproval_after_expiry_fails() {
        let engine = PolicyEngine::new();
        let preview = engine.create_action_preview(CreatePreviewRequest {
            tool: "exec".to_string(),
            description: "ls -la".to_string(),
            timeout_ms: Some(-1),
            ..Default::default()
        });
        assert!(!engine.approve_action_preview(&preview.id, None));
        let fetched = engine.get_preview(&preview.id).unwrap();
        assert_eq!(fetched.status, PreviewStatus::Expired);
    }

    #[test]
    fn risk_level_derivation() {
        let mut ctx = ctx_with_tool("message");
        ctx.risk.accesses_secrets = true;
        assert_eq!(derive_risk_level(&ctx), RiskLevel::Critical);
    }

    #[test]
    fn reversibility_defaults_false_for_exec() {
        assert!(!derive_reversibility("exec", None));
        assert!(derive_reversibility("read", None));
    }
}
