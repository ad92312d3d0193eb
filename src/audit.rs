//! Audit Trail (C7) — append-only event log with per-run rollups.
//!
//! The audit entry is modelled as a sum type with one variant per
//! `event_type` (spec §9's third design note) sharing a common header;
//! serialization flattens back to the superset-object shape the export
//! format describes.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::redactor::Redactor;
use crate::types::RiskLevel;

const AUDIT_RING_CAP: usize = 10_000;
const RUN_SUMMARY_CAP: usize = 1_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditEvent {
    RunStart,
    InputReceived {
        input: String,
    },
    PolicyDecision {
        tool: String,
        decision: String,
        reason: String,
        rule_id: Option<String>,
        risk_level: Option<RiskLevel>,
    },
    ToolCall {
        tool: String,
        output: Option<String>,
    },
    LlmCall {
        model: Option<String>,
        tokens: Option<u64>,
        cost_usd: Option<f64>,
    },
    OutputGenerated {
        output: String,
    },
    RunComplete,
    Error {
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub session_key: Option<String>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

#[derive(Debug, Clone)]
pub struct LogAuditRequest {
    pub run_id: String,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub session_key: Option<String>,
    pub event: AuditEvent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Denied,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub total_cost_usd: f64,
    pub total_tokens: u64,
    pub tool_calls: u64,
    pub llm_calls: u64,
    pub policy_denials: u64,
    pub max_risk_level_seen: Option<RiskLevel>,
}

impl RunSummary {
    fn new(run_id: String, user_id: Option<String>, org_id: Option<String>) -> Self {
        Self {
            run_id,
            user_id,
            org_id,
            started_at: crate::types::now(),
            completed_at: None,
            status: RunStatus::Running,
            total_cost_usd: 0.0,
            total_tokens: 0,
            tool_calls: 0,
            llm_calls: 0,
            policy_denials: 0,
            max_risk_level_seen: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListRunsFilters {
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub status: Option<RunStatus>,
    pub risk_level: Option<RiskLevel>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListRunsResult {
    pub runs: Vec<RunSummary>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_runs: usize,
    pub total_entries: usize,
    pub runs_by_status: HashMap<String, usize>,
    pub runs_by_risk: HashMap<String, usize>,
}

#[derive(Serialize)]
struct AuditExport<'a> {
    run_id: &'a str,
    summary: &'a RunSummary,
    entries: &'a [AuditEntry],
    exported_at: DateTime<Utc>,
    notice: &'static str,
}

pub struct AuditTrail {
    redactor: Redactor,
    next_id: std::sync::atomic::AtomicU64,
    // Newest-first storage; chronological order is produced on read.
    entries: RwLock<VecDeque<AuditEntry>>,
    summaries: RwLock<HashMap<String, RunSummary>>,
    summary_order: RwLock<VecDeque<String>>,
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditTrail {
    pub fn new() -> Self {
        Self {
            redactor: Redactor::new(),
            next_id: std::sync::atomic::AtomicU64::new(1),
            entries: RwLock::new(VecDeque::new()),
            summaries: RwLock::new(HashMap::new()),
            summary_order: RwLock::new(VecDeque::new()),
        }
    }

    fn redact_event(&self, event: AuditEvent) -> AuditEvent {
        match event {
            AuditEvent::InputReceived { input } => AuditEvent::InputReceived {
                input: self.redactor.redact(&input).redacted,
            },
            AuditEvent::ToolCall { tool, output } => AuditEvent::ToolCall {
                tool,
                output: output.map(|o| self.redactor.redact(&o).redacted),
            },
            AuditEvent::OutputGenerated { output } => AuditEvent::OutputGenerated {
                output: self.redactor.redact(&output).redacted,
            },
            AuditEvent::Error { error } => AuditEvent::Error {
                error: self.redactor.redact(&error).redacted,
            },
            other => other,
        }
    }

    pub fn log_audit(&self, req: LogAuditRequest) -> AuditEntry {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let entry = AuditEntry {
            id,
            run_id: req.run_id.clone(),
            timestamp: crate::types::now(),
            user_id: req.user_id.clone(),
            org_id: req.org_id.clone(),
            session_key: req.session_key,
            event: self.redact_event(req.event),
        };

        {
            let mut entries = self.entries.write();
            entries.push_front(entry.clone());
            if entries.len() > AUDIT_RING_CAP {
                entries.pop_back();
            }
        }

        self.update_run_summary(&entry);
        entry
    }

    fn update_run_summary(&self, entry: &AuditEntry) {
        let mut summaries = self.summaries.write();
        let is_new = !summaries.contains_key(&entry.run_id);
        let summary = summaries.entry(entry.run_id.clone()).or_insert_with(|| {
            RunSummary::new(entry.run_id.clone(), entry.user_id.clone(), entry.org_id.clone())
        });

        match &entry.event {
            AuditEvent::ToolCall { .. } => summary.tool_calls += 1,
            AuditEvent::LlmCall { tokens, cost_usd, .. } => {
                summary.llm_calls += 1;
                summary.total_tokens += tokens.unwrap_or(0);
                summary.total_cost_usd += cost_usd.unwrap_or(0.0);
            }
            AuditEvent::PolicyDecision {
                decision,
                risk_level,
                ..
            } => {
                if decision == "deny" {
                    summary.policy_denials += 1;
                }
                if let Some(risk) = risk_level {
                    summary.max_risk_level_seen = Some(match summary.max_risk_level_seen {
                        Some(current) => current.max(*risk),
                        None => *risk,
                    });
                }
            }
            AuditEvent::RunComplete => {
                summary.status = RunStatus::Completed;
                summary.completed_at = Some(crate::types::now());
            }
            AuditEvent::Error { .. } => {
                summary.status = RunStatus::Failed;
                summary.completed_at = Some(crate::types::now());
            }
            _ => {}
        }

        if is_new {
            drop(summaries);
            let mut order = self.summary_order.write();
            order.push_back(entry.run_id.clone());
            if order.len() > RUN_SUMMARY_CAP {
                if let Some(oldest) = order.pop_front() {
                    self.summaries.write().remove(&oldest);
                }
            }
        }
    }

    /// The caller sets this explicitly when policy blocks a run before any
    /// other terminal event is recorded — not inferable from event_type
    /// alone.
    pub fn mark_run_denied(&self, run_id: &str) {
        if let Some(summary) = self.summaries.write().get_mut(run_id) {
            summary.status = RunStatus::Denied;
            summary.completed_at = Some(crate::types::now());
        }
    }

    pub fn get_run_audit_trail(&self, run_id: &str) -> Vec<AuditEntry> {
        let entries = self.entries.read();
        let mut matching: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect();
        matching.sort_by_key(|e| e.id);
        matching
    }

    pub fn list_runs(&self, filters: ListRunsFilters) -> ListRunsResult {
        let summaries = self.summaries.read();
        let mut runs: Vec<RunSummary> = summaries
            .values()
            .filter(|s| filters.user_id.as_ref().map(|u| s.user_id.as_deref() == Some(u.as_str())).unwrap_or(true))
            .filter(|s| filters.org_id.as_ref().map(|o| s.org_id.as_deref() == Some(o.as_str())).unwrap_or(true))
            .filter(|s| filters.status.map(|st| s.status == st).unwrap_or(true))
            .filter(|s| {
                filters
                    .risk_level
                    .map(|rl| s.max_risk_level_seen == Some(rl))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let total = runs.len();
        let offset = filters.offset.unwrap_or(0);
        let limit = filters.limit.unwrap_or(total);
        let runs = runs.into_iter().skip(offset).take(limit).collect();

        ListRunsResult { runs, total }
    }

    pub fn export_audit_trail(&self, run_id: &str) -> Option<String> {
        let summary = self.summaries.read().get(run_id).cloned()?;
        let entries = self.get_run_audit_trail(run_id);
        let export = AuditExport {
            run_id,
            summary: &summary,
            entries: &entries,
            exported_at: crate::types::now(),
            notice: "All secrets have been automatically redacted",
        };
        serde_json::to_string(&export).ok()
    }

    pub fn audit_stats(&self) -> AuditStats {
        let summaries = self.summaries.read();
        let mut runs_by_status: HashMap<String, usize> = HashMap::new();
        let mut runs_by_risk: HashMap<String, usize> = HashMap::new();

        for summary in summaries.values() {
            let status_key = serde_json::to_value(summary.status)
                .ok()
                .and_then(|v| v.as_str().map(String::from))
                .unwrap_or_default();
            *runs_by_status.entry(status_key).or_insert(0) += 1;

            if let Some(risk) = summary.max_risk_level_seen {
                let risk_key = serde_json::to_value(risk)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default();
                *runs_by_risk.entry(risk_key).or_insert(0) += 1;
            }
        }

        AuditStats {
            total_runs: summaries.len(),
            total_entries: self.entries.read().len(),
            runs_by_status,
            runs_by_risk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_audit_assigns_monotonic_ids() {
        let trail = AuditTrail::new();
        let e1 = trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::RunStart,
        });
        let e2 = trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::RunComplete,
        });
        assert!(e2.id > e1.id);
    }

    #[test]
    fn secrets_are_redacted_before_storage() {
        let trail = AuditTrail::new();
        trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::InputReceived {
                input: "key: sk-1234567890abcdefghijklmnopqrst".to_string(),
            },
        });
        let trail_entries = trail.get_run_audit_trail("run-1");
        let AuditEvent::InputReceived { input } = &trail_entries[0].event else {
            panic!("wrong variant");
        };
        assert!(!input.contains("sk-1234567890"));
    }

    #[test]
    fn get_run_audit_trail_is_chronological() {
        let trail = AuditTrail::new();
        for _ in 0..5 {
            trail.log_audit(LogAuditRequest {
                run_id: "run-1".to_string(),
                user_id: None,
                org_id: None,
                session_key: None,
                event: AuditEvent::RunStart,
            });
        }
        let entries = trail.get_run_audit_trail("run-1");
        let ids: Vec<u64> = entries.iter().map(|e| e.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn run_summary_tracks_tool_calls_and_denials() {
        let trail = AuditTrail::new();
        trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::ToolCall {
                tool: "read".to_string(),
                output: None,
            },
        });
        trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::PolicyDecision {
                tool: "exec".to_string(),
                decision: "deny".to_string(),
                reason: "test".to_string(),
                rule_id: None,
                risk_level: Some(RiskLevel::High),
            },
        });
        let result = trail.list_runs(ListRunsFilters::default());
        let summary = &result.runs[0];
        assert_eq!(summary.tool_calls, 1);
        assert_eq!(summary.policy_denials, 1);
        assert_eq!(summary.max_risk_level_seen, Some(RiskLevel::High));
    }

    #[test]
    fn export_includes_notice_and_is_json() {
        let trail = AuditTrail::new();
        trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::RunStart,
        });
        let exported = trail.export_audit_trail("run-1").unwrap();
        assert!(exported.contains("All secrets have been automatically redacted"));
        let value: JsonValue = serde_json::from_str(&exported).unwrap();
        assert!(value.get("run_id").is_some());
        assert!(value.get("entries").is_some());
    }

    #[test]
    fn audit_stats_counts_runs() {
        let trail = AuditTrail::new();
        trail.log_audit(LogAuditRequest {
            run_id: "run-1".to_string(),
            user_id: None,
            org_id: None,
            session_key: None,
            event: AuditEvent::RunStart,
        });
        let stats = trail.audit_stats();
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.total_entries, 1);
    }
}
