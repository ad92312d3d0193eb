//! Shared data model (spec §3).
//!
//! Types that more than one component needs: trust levels/zones, content
//! provenance, the policy evaluation context, and the engine's decision
//! type. Component-owned types (quarantine entries, budgets, audit
//! entries, policy rules) live in their own modules.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Totally ordered trust level. Derivation order matters: `high > medium >
/// low > untrusted`. `#[derive(PartialOrd, Ord)]` relies on declaration
/// order, so the variants below are listed worst-first on purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Untrusted,
    Low,
    Medium,
    High,
}

/// Where a piece of content originated. Maps to a `TrustLevel` by a fixed,
/// exhaustive table — §3 invariant: no operation may raise a value's
/// trust level once assigned, so this map is consulted exactly once, at
/// quarantine time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    Owner,
    System,
    Paired,
    Unpaired,
    Skill,
    Web,
    Document,
    Email,
    Webhook,
    Api,
}

impl ContentSource {
    pub const fn trust_level(self) -> TrustLevel {
        match self {
            ContentSource::Owner | ContentSource::System => TrustLevel::High,
            ContentSource::Paired | ContentSource::Skill => TrustLevel::Medium,
            ContentSource::Unpaired | ContentSource::Document | ContentSource::Api => {
                TrustLevel::Low
            }
            ContentSource::Web | ContentSource::Email | ContentSource::Webhook => {
                TrustLevel::Untrusted
            }
        }
    }
}

/// Every piece of data is in exactly one zone. Data moves `untrusted ->
/// reasoning` only through the Sanitizer, and `reasoning -> execution`
/// only through the Policy Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustZone {
    Untrusted,
    Reasoning,
    Execution,
}

/// Risk severity used by action previews and audit rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// The "who" facet of a policy context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Who {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub role: Option<String>,
    pub pairing_status: Option<String>,
    pub session_key: Option<String>,
    pub agent_id: Option<String>,
}

/// The "what" facet: the tool call being evaluated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct What {
    pub tool: String,
    pub action: Option<String>,
    #[serde(default)]
    pub parameters: HashMap<String, JsonValue>,
}

/// The "where" facet: network/filesystem destination of the call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Where {
    pub domain: Option<String>,
    pub ip: Option<String>,
    pub file_path: Option<String>,
    pub channel: Option<String>,
    pub url: Option<String>,
}

/// The "risk" facet: flags derived by the tool interceptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Risk {
    pub is_destructive: bool,
    pub is_external: bool,
    pub accesses_secrets: bool,
    pub modifies_config: bool,
    pub sends_data: bool,
}

/// The "budget" facet: a point-in-time snapshot of usage vs. limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetFacet {
    pub tokens_used: Option<u64>,
    pub tokens_limit: Option<u64>,
    pub tool_calls_used: Option<u64>,
    pub tool_calls_limit: Option<u64>,
    pub cost_usd: Option<f64>,
    pub cost_limit_usd: Option<f64>,
}

/// Full input to one policy evaluation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyContext {
    pub who: Who,
    pub what: What,
    pub r#where: Where,
    pub risk: Risk,
    pub budget: BudgetFacet,
    /// Set by the tool interceptor when the kill switch is active; read by
    /// the highest-priority built-in rule band.
    pub kill_switch_active: bool,
    /// Set by the tool interceptor from the current `LockdownConfig`.
    pub lockdown: Option<LockdownSnapshot>,
    /// Source zone the call originated from (§4.3 origin validation).
    pub source_zone: TrustZone,
}

/// Immutable snapshot of lockdown posture, threaded into a `PolicyContext`
/// so rule conditions read it as plain data rather than reaching into a
/// captured singleton (spec §9 redesign flag).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockdownSnapshot {
    pub enabled: bool,
    pub external_comms_confirm: bool,
    pub writes_deletes_confirm: bool,
    pub shell_browser_deny: bool,
    pub outbound_network_allowlist: Vec<String>,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Allow,
    RequireConfirmation,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    pub reason: String,
    pub rule_id: Option<String>,
    pub requires_preview: bool,
    pub preview_message: Option<String>,
}

impl Decision {
    pub fn allow(reason: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Allow,
            reason: reason.into(),
            rule_id: Some(rule_id.into()),
            requires_preview: false,
            preview_message: None,
        }
    }

    pub fn deny(reason: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::Deny,
            reason: reason.into(),
            rule_id: Some(rule_id.into()),
            requires_preview: false,
            preview_message: None,
        }
    }

    pub fn confirm(reason: impl Into<String>, rule_id: impl Into<String>) -> Self {
        Self {
            kind: DecisionKind::RequireConfirmation,
            reason: reason.into(),
            rule_id: Some(rule_id.into()),
            requires_preview: true,
            preview_message: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        self.kind == DecisionKind::Allow
    }

    pub fn is_deny(&self) -> bool {
        self.kind == DecisionKind::Deny
    }

    pub fn is_confirm(&self) -> bool {
        self.kind == DecisionKind::RequireConfirmation
    }
}

/// Now source, injected rather than read from `Utc::now()` directly in a
/// few hot spots so tests can pin time. Defaults to wall-clock time.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}
