//! Golden tests for the built-in priority bands. These capture the
//! current rule-set behavior so a refactor that changes band ordering or
//! a rule's condition shows up here first.

use asc_core::policy::PolicyEngine;
use asc_core::types::{Decision, DecisionKind, PolicyContext, Risk, What, Where};

fn ctx(tool: &str) -> PolicyContext {
    PolicyContext {
        what: What {
            tool: tool.to_string(),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn assert_kind(decision: &Decision, expected: DecisionKind) {
    assert_eq!(decision.kind, expected, "reason was: {}", decision.reason);
}

#[test]
fn golden_kill_switch_beats_everything_else() {
    let engine = PolicyEngine::new();
    let mut c = ctx("read");
    c.kill_switch_active = true;
    c.risk = Risk {
        accesses_secrets: true,
        sends_data: true,
        ..Default::default()
    };
    assert_kind(&engine.evaluate(&c), DecisionKind::Deny);
}

#[test]
fn golden_absolute_deny_beats_lockdown_and_confirm() {
    let engine = PolicyEngine::new();
    let mut c = ctx("message");
    c.risk.sends_data = true;
    c.risk.accesses_secrets = true;
    c.lockdown = Some(asc_core::types::LockdownSnapshot {
        enabled: true,
        external_comms_confirm: true,
        ..Default::default()
    });
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::Deny);
    assert_eq!(decision.rule_id.as_deref(), Some("deny-send-secret"));
}

#[test]
fn golden_budget_beats_lockdown() {
    let engine = PolicyEngine::new();
    let mut c = ctx("message");
    c.budget.tool_calls_used = Some(5);
    c.budget.tool_calls_limit = Some(5);
    c.lockdown = Some(asc_core::types::LockdownSnapshot {
        enabled: true,
        external_comms_confirm: true,
        ..Default::default()
    });
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::Deny);
    assert_eq!(decision.rule_id.as_deref(), Some("budget-tool-calls-exceeded"));
}

#[test]
fn golden_lockdown_confirms_external_send() {
    let engine = PolicyEngine::new();
    let mut c = ctx("message");
    c.risk.sends_data = true;
    c.lockdown = Some(asc_core::types::LockdownSnapshot {
        enabled: true,
        external_comms_confirm: true,
        ..Default::default()
    });
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::RequireConfirmation);
    assert_eq!(decision.rule_id.as_deref(), Some("lockdown-confirm-external-send"));
}

#[test]
fn golden_lockdown_denies_shell_browser() {
    let engine = PolicyEngine::new();
    let mut c = ctx("shell");
    c.lockdown = Some(asc_core::types::LockdownSnapshot {
        enabled: true,
        shell_browser_deny: true,
        ..Default::default()
    });
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::Deny);
    assert_eq!(decision.rule_id.as_deref(), Some("lockdown-deny-shell-browser"));
}

#[test]
fn golden_confirm_band_catches_message_without_lockdown() {
    let engine = PolicyEngine::new();
    let c = ctx("message");
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::RequireConfirmation);
    assert_eq!(decision.rule_id.as_deref(), Some("confirm-external-message"));
}

#[test]
fn golden_allow_band_for_read_only() {
    let engine = PolicyEngine::new();
    let c = ctx("read");
    let decision = engine.evaluate(&c);
    assert_kind(&decision, DecisionKind::Allow);
    assert_eq!(decision.rule_id.as_deref(), Some("allow-read-only"));
}

#[test]
fn golden_fetch_to_blocked_host_is_not_allowed() {
    let engine = PolicyEngine::new();
    let mut c = ctx("fetch");
    c.r#where = Where {
        domain: Some("localhost".to_string()),
        ..Default::default()
    };
    let decision = engine.evaluate(&c);
    assert!(!decision.is_allow());
    assert_ne!(decision.rule_id.as_deref(), Some("allow-web-fetch-public"));
}

#[test]
fn golden_would_deny_and_would_require_confirmation_predicates() {
    let engine = PolicyEngine::new();
    let mut killed = ctx("read");
    killed.kill_switch_active = true;
    assert!(engine.would_deny(&killed));
    assert!(engine.would_require_confirmation(&ctx("exec")));
}
