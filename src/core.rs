//! Composition root. `SecurityCore` owns every component as an explicit
//! field (spec §9's second design note) rather than exposing them as
//! free-standing module statics, and is the single entry point callers
//! construct.

use serde_json::Value as JsonValue;

use crate::audit::{AuditEvent, AuditTrail, LogAuditRequest, ListRunsFilters, ListRunsResult};
use crate::budget::{
    BudgetGuardrails, BudgetStatus, CostBudget, LlmCallRateLimiter, MessageRateLimiter,
    ToolCallRateLimiter,
};
use crate::config::Config;
use crate::controls::{
    ActivateParams, DeactivateParams, EnableLockdownParams, KillSwitch, Lockdown, SecurityStatus,
};
use crate::guards::{InterceptResult, ToolCallRequest, ToolInterceptor};
use crate::policy::{ActionPreview, CreatePreviewRequest, PolicyEngine};
use crate::redactor::Redactor;
use crate::sanitizer::Sanitizer;
use crate::trust_zone::{
    MemoryProvenance, PrepareForReasoningRequest, QuarantineEntry, ReasoningInput, TrustZoneManager,
};
use crate::types::{ContentSource, Decision, Who};

pub struct SecurityCore {
    pub redactor: Redactor,
    pub sanitizer: Sanitizer,
    pub trust_zones: TrustZoneManager,
    pub kill_switch: KillSwitch,
    pub lockdown: Lockdown,
    pub cost_budget: CostBudget,
    pub budget_guardrails: BudgetGuardrails,
    pub message_rate_limiter: MessageRateLimiter,
    pub tool_call_rate_limiter: ToolCallRateLimiter,
    pub llm_call_rate_limiter: LlmCallRateLimiter,
    pub policy: PolicyEngine,
    pub audit: AuditTrail,
}

impl SecurityCore {
    pub fn new(config: Config) -> Self {
        let lockdown_allowlist = config
            .lockdown_network_allowlist
            .clone()
            .unwrap_or_else(|| crate::controls::Lockdown::default().snapshot().outbound_network_allowlist);

        Self {
            redactor: Redactor::new(),
            sanitizer: Sanitizer::new(),
            trust_zones: TrustZoneManager::new(),
            kill_switch: KillSwitch::new(config.kill_switch_confirm_code.clone(), config.kill_switch_at_boot),
            lockdown: Lockdown::new(config.lockdown_at_boot, lockdown_allowlist),
            cost_budget: CostBudget::new(config.cost_budget.clone()),
            budget_guardrails: BudgetGuardrails::new(config.default_budget.clone()),
            message_rate_limiter: MessageRateLimiter::default(),
            tool_call_rate_limiter: ToolCallRateLimiter::default(),
            llm_call_rate_limiter: LlmCallRateLimiter::default(),
            policy: PolicyEngine::new(),
            audit: AuditTrail::new(),
        }
    }

    // ---- Global Controls (C4) ----

    pub fn activate_kill_switch(&self, params: ActivateParams) {
        self.kill_switch.activate(params);
    }

    pub fn deactivate_kill_switch(&self, params: DeactivateParams) -> bool {
        self.kill_switch.deactivate(params)
    }

    pub fn is_kill_switch_active(&self) -> bool {
        self.kill_switch.is_active()
    }

    pub fn enable_lockdown(&self, params: EnableLockdownParams) {
        self.lockdown.enable(params);
    }

    pub fn disable_lockdown(&self) {
        self.lockdown.disable();
    }

    pub fn security_status(&self) -> SecurityStatus {
        crate::controls::security_status(&self.kill_switch, &self.lockdown)
    }

    // ---- Trust Zones (C3) ----

    pub fn quarantine(
        &self,
        content: &str,
        source: ContentSource,
        metadata: Option<JsonValue>,
    ) -> QuarantineEntry {
        self.trust_zones.quarantine(content, source, metadata)
    }

    pub fn prepare_for_reasoning(&self, req: PrepareForReasoningRequest) -> Option<ReasoningInput> {
        self.trust_zones.prepare_for_reasoning(req)
    }

    pub fn create_memory_provenance(
        &self,
        source_type: ContentSource,
        content_hash: String,
        ttl_ms: Option<i64>,
        metadata: Option<JsonValue>,
    ) -> MemoryProvenance {
        self.trust_zones
            .create_memory_provenance(source_type, content_hash, ttl_ms, metadata)
    }

    pub fn is_memory_trusted_for_planning(&self, id: &str) -> bool {
        self.trust_zones.is_memory_trusted_for_planning(id)
    }

    // ---- Rate & Budget (C5) ----

    pub fn check_budget(
        &self,
        user_id: Option<&str>,
        org_id: Option<&str>,
        estimated_cost_usd: Option<f64>,
    ) -> BudgetStatus {
        self.budget_guardrails.check(user_id, org_id, estimated_cost_usd)
    }

    /// Per-user/per-ip/global token-bucket check for inbound messages.
    /// A refusal is an auditable incident in its own right, independent of
    /// any tool-call decision that follows it.
    pub fn check_message_rate(&self, run_id: &str, who: &Who, ip: Option<&str>) -> Decision {
        if self.message_rate_limiter.check(who.user_id.as_deref(), ip) {
            Decision::allow("message rate limit not exceeded", "rate-limit-message")
        } else {
            let decision = Decision::deny("message rate limit exceeded", "rate-limit-message");
            self.audit.log_audit(LogAuditRequest {
                run_id: run_id.to_string(),
                user_id: who.user_id.clone(),
                org_id: who.org_id.clone(),
                session_key: who.session_key.clone(),
                event: AuditEvent::PolicyDecision {
                    tool: "message".to_string(),
                    decision: "deny".to_string(),
                    reason: decision.reason.clone(),
                    rule_id: decision.rule_id.clone(),
                    risk_level: None,
                },
            });
            decision
        }
    }

    /// Per-minute/per-hour token-bucket check ahead of an outbound LLM call.
    pub fn check_llm_call_rate(&self, run_id: &str, who: &Who) -> Decision {
        if self.llm_call_rate_limiter.check() {
            Decision::allow("llm call rate limit not exceeded", "rate-limit-llm-call")
        } else {
            let decision = Decision::deny("LLM call rate limit exceeded", "rate-limit-llm-call");
            self.audit.log_audit(LogAuditRequest {
                run_id: run_id.to_string(),
                user_id: who.user_id.clone(),
                org_id: who.org_id.clone(),
                session_key: who.session_key.clone(),
                event: AuditEvent::PolicyDecision {
                    tool: "llm_call".to_string(),
                    decision: "deny".to_string(),
                    reason: decision.reason.clone(),
                    rule_id: decision.rule_id.clone(),
                    risk_level: None,
                },
            });
            decision
        }
    }

    // ---- Policy Engine (C6) ----

    /// Runs the exec-wrapper guards (spec §4.6) ahead of the generic
    /// interceptor, then the per-run/global tool-call rate limiter, then
    /// policy evaluation — any refusal along the way propagates directly
    /// as a deny and is independently audited.
    pub fn intercept_tool_call(&self, req: ToolCallRequest) -> InterceptResult {
        let interceptor = ToolInterceptor {
            kill_switch: &self.kill_switch,
            lockdown: &self.lockdown,
            policy: &self.policy,
            cost_budget: &self.cost_budget,
            tool_call_rate_limiter: &self.tool_call_rate_limiter,
            audit: &self.audit,
            redactor: &self.redactor,
        };
        interceptor.intercept_exec(req)
    }

    pub fn approve_action_preview(&self, id: &str, approved_by: Option<String>) -> bool {
        self.policy.approve_action_preview(id, approved_by)
    }

    pub fn deny_action_preview(&self, id: &str) -> bool {
        self.policy.deny_action_preview(id)
    }

    pub fn is_preview_approved(&self, id: &str) -> bool {
        self.policy.is_preview_approved(id)
    }

    pub fn get_preview(&self, id: &str) -> Option<ActionPreview> {
        self.policy.get_preview(id)
    }

    // ---- Audit Trail (C7) ----

    pub fn log_audit(&self, req: LogAuditRequest) -> crate::audit::AuditEntry {
        self.audit.log_audit(req)
    }

    pub fn get_run_audit_trail(&self, run_id: &str) -> Vec<crate::audit::AuditEntry> {
        self.audit.get_run_audit_trail(run_id)
    }

    pub fn list_runs(&self, filters: ListRunsFilters) -> ListRunsResult {
        self.audit.list_runs(filters)
    }

    pub fn export_audit_trail(&self, run_id: &str) -> Option<String> {
        self.audit.export_audit_trail(run_id)
    }

    pub fn mark_run_denied(&self, run_id: &str) {
        self.audit.mark_run_denied(run_id);
    }

    pub fn record_run_start(&self, run_id: &str, user_id: Option<String>, org_id: Option<String>) {
        self.audit.log_audit(LogAuditRequest {
            run_id: run_id.to_string(),
            user_id,
            org_id,
            session_key: None,
            event: AuditEvent::RunStart,
        });
    }
}

impl Default for SecurityCore {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TrustZone;

    #[test]
    fn kill_switch_overrides_everything() {
        let core = SecurityCore::default();
        core.activate_kill_switch(ActivateParams::default());

        let result = core.intercept_tool_call(ToolCallRequest {
            run_id: "run-1".to_string(),
            tool: "exec".to_string(),
            source_zone: TrustZone::Reasoning,
            ..Default::default()
        });

        assert!(result.decision.is_deny());
        assert!(result.decision.reason.contains("kill switch"));
    }

    #[test]
    fn confirmation_flow_end_to_end() {
        let core = SecurityCore::default();
        let result = core.intercept_tool_call(ToolCallRequest {
            run_id: "run-1".to_string(),
            tool: "exec".to_string(),
            source_zone: TrustZone::Reasoning,
            ..Default::default()
        });
        assert!(result.decision.is_confirm());
        let preview_id = result.preview_id.unwrap();
        assert!(core.approve_action_preview(&preview_id, Some("alice".to_string())));
        assert!(core.is_preview_approved(&preview_id));
    }

    #[test]
    fn quarantine_and_prepare_for_reasoning_round_trip() {
        let core = SecurityCore::default();
        let entry = core.quarantine("hello <script>evil()</script>", ContentSource::Web, None);
        let input = core
            .prepare_for_reasoning(PrepareForReasoningRequest {
                quarantine_id: entry.id,
                ..Default::default()
            })
            .unwrap();
        assert!(!input.sanitized_content.contains("<script>"));
    }

    #[test]
    fn message_rate_limiter_denies_after_per_user_cap() {
        let core = SecurityCore::default();
        let who = Who {
            user_id: Some("u1".to_string()),
            ..Default::default()
        };
        for _ in 0..60 {
            core.check_message_rate("run-1", &who, None);
        }
        let decision = core.check_message_rate("run-1", &who, None);
        assert!(decision.is_deny());
        assert_eq!(decision.rule_id.as_deref(), Some("rate-limit-message"));
    }

    #[test]
    fn llm_call_rate_limiter_denies_after_per_minute_cap() {
        let core = SecurityCore::default();
        let who = Who::default();
        for _ in 0..20 {
            core.check_llm_call_rate("run-1", &who);
        }
        let decision = core.check_llm_call_rate("run-1", &who);
        assert!(decision.is_deny());
        assert_eq!(decision.rule_id.as_deref(), Some("rate-limit-llm-call"));
    }
}
