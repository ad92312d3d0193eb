//! Guards/adapters — the tool interceptor, exec-wrapper SSRF/exfiltration
//! guards, and the LLM timeout enforcer. This is the component actually
//! visible to callers: everything else in the crate is reached through it.

use std::collections::HashMap;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::audit::{AuditEvent, AuditTrail, LogAuditRequest};
use crate::budget::{CostBudget, ToolCallRateLimiter};
use crate::controls::{KillSwitch, Lockdown};
use crate::policy::{CreatePreviewRequest, PolicyEngine};
use crate::redactor::Redactor;
use crate::types::{BudgetFacet, PolicyContext, Risk, TrustZone, What, Where, Who};

const DESTRUCTIVE_TOOLS: &[&str] = &["delete", "remove", "drop"];
const DESTRUCTIVE_ACTIONS: &[&str] = &["delete", "remove", "drop", "truncate"];
const EXTERNAL_TOOLS: &[&str] = &["message", "send", "email", "fetch", "browser", "upload"];
const SENDS_DATA_TOOLS: &[&str] = &["message", "send", "email", "upload"];
const CONFIG_TOOLS: &[&str] = &["config", "settings"];
const URL_PARAM_KEYS: &[&str] = &["url", "targetUrl", "endpoint"];
const EXEC_LIKE_TOOLS: &[&str] = &["exec", "shell", "bash"];

static DESTRUCTIVE_COMMAND_RE: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)rm\s+-rf\s+/", r"(?i)drop\s+table\b", r"(?i)delete\s+from\s+\w+"]
        .iter()
        .map(|p| Regex::new(p).unwrap_or_else(|e| panic!("guard pattern {p:?} failed: {e}")))
        .collect()
});

static URL_IN_COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:curl|wget|fetch)\b[^|;&\n]*?(https?://[^\s'\x22]+)").unwrap()
});

static EXFIL_COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:cat\s+\.env|env\s*\||printenv\s*\|)[^\n]*\b(curl|wget|nc|netcat|ssh|scp)\b").unwrap()
});

static HOST_FROM_URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^https?://([^/:\s]+)").unwrap());

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardOutcome {
    pub safe: bool,
    pub reason: Option<String>,
}

fn blocked_hostname(host: &str) -> bool {
    let host = host.to_lowercase();
    matches!(
        host.as_str(),
        "localhost" | "0.0.0.0" | "::1" | "169.254.169.254" | "metadata.google.internal"
    ) || host.ends_with(".local")
}

fn private_ip(host: &str) -> bool {
    use std::net::IpAddr;
    host.parse::<IpAddr>()
        .map(|addr| match addr {
            IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unicast_link_local(),
        })
        .unwrap_or(false)
}

/// Parses URLs out of `curl|wget|fetch` invocations and rejects any whose
/// host is blocked, private, or a metadata endpoint.
pub fn validate_command_for_ssrf(command: &str) -> GuardOutcome {
    for cap in URL_IN_COMMAND_RE.captures_iter(command) {
        let url = &cap[1];
        if let Some(host_cap) = HOST_FROM_URL_RE.captures(url) {
            let host = &host_cap[1];
            if blocked_hostname(host) || private_ip(host) {
                return GuardOutcome {
                    safe: false,
                    reason: Some(format!(
                        "SSRF: command targets blocked or metadata host '{host}'"
                    )),
                };
            }
        }
    }
    GuardOutcome {
        safe: true,
        reason: None,
    }
}

/// Rejects commands that pipe environment/secret data or `.env` contents
/// into an external exfiltration command.
pub fn validate_command_for_exfiltration(command: &str) -> GuardOutcome {
    if EXFIL_COMMAND_RE.is_match(command) {
        return GuardOutcome {
            safe: false,
            reason: Some("command pipes environment/secret data to an external sink".to_string()),
        };
    }
    GuardOutcome {
        safe: true,
        reason: None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolCallRequest {
    pub run_id: String,
    pub who: Who,
    pub tool: String,
    pub action: Option<String>,
    pub parameters: HashMap<String, JsonValue>,
    pub source_zone: TrustZone,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterceptResult {
    pub decision: crate::types::Decision,
    pub preview_id: Option<String>,
}

fn extract_domain_ip(parameters: &HashMap<String, JsonValue>) -> (Option<String>, Option<String>) {
    for key in URL_PARAM_KEYS {
        if let Some(value) = parameters.get(*key).and_then(|v| v.as_str()) {
            if let Some(cap) = HOST_FROM_URL_RE.captures(value) {
                let host = cap[1].to_string();
                return if host.parse::<std::net::IpAddr>().is_ok() {
                    (None, Some(host))
                } else {
                    (Some(host), None)
                };
            }
        }
    }
    (None, None)
}

fn derive_risk(tool: &str, action: Option<&str>, parameters: &HashMap<String, JsonValue>, redactor: &Redactor) -> Risk {
    let is_destructive = DESTRUCTIVE_TOOLS.contains(&tool)
        || action.map(|a| DESTRUCTIVE_ACTIONS.contains(&a)).unwrap_or(false)
        || parameters
            .get("command")
            .and_then(|v| v.as_str())
            .map(|cmd| DESTRUCTIVE_COMMAND_RE.iter().any(|re| re.is_match(cmd)))
            .unwrap_or(false);

    let is_external = EXTERNAL_TOOLS.contains(&tool);
    let sends_data = SENDS_DATA_TOOLS.contains(&tool);
    let modifies_config = CONFIG_TOOLS.contains(&tool) || action.map(|a| a == "configure").unwrap_or(false);

    let serialized_params = serde_json::to_string(parameters).unwrap_or_default();
    let accesses_secrets = redactor.contains_secrets(&serialized_params);

    Risk {
        is_destructive,
        is_external,
        accesses_secrets,
        modifies_config,
        sends_data,
    }
}

pub struct ToolInterceptor<'a> {
    pub kill_switch: &'a KillSwitch,
    pub lockdown: &'a Lockdown,
    pub policy: &'a PolicyEngine,
    pub cost_budget: &'a CostBudget,
    pub tool_call_rate_limiter: &'a ToolCallRateLimiter,
    pub audit: &'a AuditTrail,
    pub redactor: &'a Redactor,
}

impl<'a> ToolInterceptor<'a> {
    /// Exec-wrapper composition (spec §4.6): for `exec`-like tools carrying
    /// a `command` string, the SSRF and exfiltration guards run on the raw
    /// command before the call ever reaches the generic interceptor. Only
    /// if both pass does control fall through to `intercept`.
    pub fn intercept_exec(&self, req: ToolCallRequest) -> InterceptResult {
        if EXEC_LIKE_TOOLS.contains(&req.tool.as_str()) {
            if let Some(command) = req.parameters.get("command").and_then(|v| v.as_str()) {
                for outcome in [
                    validate_command_for_ssrf(command),
                    validate_command_for_exfiltration(command),
                ] {
                    if !outcome.safe {
                        let reason = outcome
                            .reason
                            .unwrap_or_else(|| "exec command blocked by guard".to_string());
                        let decision = crate::types::Decision::deny(reason, "exec-guard");
                        self.audit.log_audit(LogAuditRequest {
                            run_id: req.run_id.clone(),
                            user_id: req.who.user_id.clone(),
                            org_id: req.who.org_id.clone(),
                            session_key: req.who.session_key.clone(),
                            event: AuditEvent::PolicyDecision {
                                tool: req.tool.clone(),
                                decision: "deny".to_string(),
                                reason: decision.reason.clone(),
                                rule_id: decision.rule_id.clone(),
                                risk_level: None,
                            },
                        });
                        return InterceptResult {
                            decision,
                            preview_id: None,
                        };
                    }
                }
            }
        }
        self.intercept(req)
    }

    pub fn intercept(&self, req: ToolCallRequest) -> InterceptResult {
        if self.kill_switch.is_active() {
            let decision = crate::types::Decision::deny("kill switch active", "kill-switch");
            self.audit.log_audit(LogAuditRequest {
                run_id: req.run_id.clone(),
                user_id: req.who.user_id.clone(),
                org_id: req.who.org_id.clone(),
                session_key: req.who.session_key.clone(),
                event: AuditEvent::PolicyDecision {
                    tool: req.tool.clone(),
                    decision: "deny".to_string(),
                    reason: decision.reason.clone(),
                    rule_id: decision.rule_id.clone(),
                    risk_level: None,
                },
            });
            return InterceptResult {
                decision,
                preview_id: None,
            };
        }

        let origin = crate::trust_zone::validate_tool_call_origin(req.source_zone, &req.tool);
        if !origin.valid {
            let decision = crate::types::Decision::deny(origin.reason, "origin-validation");
            return InterceptResult {
                decision,
                preview_id: None,
            };
        }

        if !self.tool_call_rate_limiter.check(&req.run_id) {
            let decision =
                crate::types::Decision::deny("tool-call rate limit exceeded for this run", "rate-limit-tool-call");
            self.audit.log_audit(LogAuditRequest {
                run_id: req.run_id.clone(),
                user_id: req.who.user_id.clone(),
                org_id: req.who.org_id.clone(),
                session_key: req.who.session_key.clone(),
                event: AuditEvent::PolicyDecision {
                    tool: req.tool.clone(),
                    decision: "deny".to_string(),
                    reason: decision.reason.clone(),
                    rule_id: decision.rule_id.clone(),
                    risk_level: None,
                },
            });
            return InterceptResult {
                decision,
                preview_id: None,
            };
        }

        let (domain, ip) = extract_domain_ip(&req.parameters);
        let risk = derive_risk(&req.tool, req.action.as_deref(), &req.parameters, self.redactor);

        let ctx = PolicyContext {
            who: req.who.clone(),
            what: What {
                tool: req.tool.clone(),
                action: req.action.clone(),
                parameters: req.parameters.clone(),
            },
            r#where: Where {
                domain,
                ip,
                file_path: req
                    .parameters
                    .get("file_path")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                channel: None,
                url: req.parameters.get("url").and_then(|v| v.as_str()).map(String::from),
            },
            risk,
            budget: BudgetFacet {
                tokens_used: Some(self.cost_budget.tokens_used()),
                tokens_limit: Some(self.cost_budget.config().tokens_per_run_limit),
                tool_calls_used: Some(self.cost_budget.tool_calls_used()),
                tool_calls_limit: Some(self.cost_budget.config().tool_calls_per_run_limit),
                cost_usd: Some(self.cost_budget.cost_usd()),
                cost_limit_usd: Some(self.cost_budget.config().per_run_limit_usd),
            },
            kill_switch_active: false,
            lockdown: {
                // One read of the lockdown config per evaluation — readers
                // must see a consistent snapshot, not four independent
                // lock acquisitions that could interleave with a
                // concurrent enable()/disable() call.
                let snapshot = self.lockdown.snapshot();
                Some(crate::types::LockdownSnapshot {
                    enabled: snapshot.enabled,
                    external_comms_confirm: snapshot.external_comms_confirm,
                    writes_deletes_confirm: snapshot.writes_deletes_confirm,
                    shell_browser_deny: snapshot.shell_browser_deny,
                    outbound_network_allowlist: snapshot.outbound_network_allowlist,
                })
            },
            source_zone: req.source_zone,
        };

        let decision = self.policy.evaluate(&ctx);

        let preview_id = if decision.requires_preview {
            let preview = self.policy.create_action_preview(CreatePreviewRequest {
                tool: req.tool.clone(),
                action: req.action.clone(),
                description: decision.reason.clone(),
                ctx: ctx.clone(),
                impacts: Vec::new(),
                timeout_ms: None,
            });
            Some(preview.id)
        } else {
            None
        };

        self.audit.log_audit(LogAuditRequest {
            run_id: req.run_id.clone(),
            user_id: req.who.user_id.clone(),
            org_id: req.who.org_id.clone(),
            session_key: req.who.session_key.clone(),
            event: AuditEvent::PolicyDecision {
                tool: req.tool.clone(),
                decision: serde_json::to_value(&decision.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                reason: decision.reason.clone(),
                rule_id: decision.rule_id.clone(),
                risk_level: Some(crate::policy::derive_risk_level(&ctx)),
            },
        });

        if decision.is_allow() {
            self.cost_budget.record_tool_call();
            self.audit.log_audit(LogAuditRequest {
                run_id: req.run_id,
                user_id: req.who.user_id,
                org_id: req.who.org_id,
                session_key: req.who.session_key,
                event: AuditEvent::ToolCall {
                    tool: req.tool,
                    output: None,
                },
            });
        }

        InterceptResult { decision, preview_id }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    pub connection_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutError {
    pub reason: &'static str,
    pub status: u16,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Wraps an LLM/provider call with a hard deadline. ASC does not retry —
/// it only guarantees the call aborts after `max(connection, request)`
/// timeout from its start.
pub async fn with_llm_timeout<F, T>(
    config: TimeoutConfig,
    provider: Option<String>,
    model: Option<String>,
    fut: F,
) -> Result<T, TimeoutError>
where
    F: std::future::Future<Output = T>,
{
    let deadline = config.connection_timeout.max(config.request_timeout);
    tokio::time::timeout(deadline, fut).await.map_err(|_| TimeoutError {
        reason: "timeout",
        status: 408,
        provider,
        model,
    })
}
