//! Global Controls (C4) — kill switch and lockdown mode.
//!
//! Both are process-wide singletons per spec §9's second design note, but
//! encapsulated here as plain structs owned by `SecurityCore` rather than
//! as module-level statics, so tests can construct independent instances.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIRM_CODE: &str = "CONFIRM_DEACTIVATE";

fn default_allowlist() -> Vec<String> {
    vec![
        "api.openai.com".to_string(),
        "api.anthropic.com".to_string(),
        "generativelanguage.googleapis.com".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KillSwitchState {
    pub enabled: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub reason: Option<String>,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            enabled: false,
            activated_at: None,
            activated_by: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivateParams {
    pub reason: Option<String>,
    pub activated_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeactivateParams {
    pub deactivated_by: Option<String>,
    pub confirm_code: String,
}

pub struct KillSwitch {
    state: RwLock<KillSwitchState>,
    confirm_code: String,
}

impl KillSwitch {
    pub fn new(confirm_code: impl Into<String>, start_active: bool) -> Self {
        let mut state = KillSwitchState::default();
        if start_active {
            state.enabled = true;
            state.activated_at = Some(crate::types::now());
            state.reason = Some("activated at boot via KILL_SWITCH env var".to_string());
        }
        Self {
            state: RwLock::new(state),
            confirm_code: confirm_code.into(),
        }
    }

    pub fn activate(&self, params: ActivateParams) {
        let mut state = self.state.write();
        state.enabled = true;
        state.activated_at = Some(crate::types::now());
        state.activated_by = params.activated_by;
        state.reason = params.reason;
        tracing::warn!(by = ?state.activated_by, reason = ?state.reason, "kill switch activated");
    }

    /// Returns `false` (state unchanged) if `confirm_code` does not match.
    pub fn deactivate(&self, params: DeactivateParams) -> bool {
        if params.confirm_code != self.confirm_code {
            tracing::warn!("kill switch deactivation attempted with wrong confirm code");
            return false;
        }
        let mut state = self.state.write();
        state.enabled = false;
        state.activated_at = None;
        state.activated_by = params.deactivated_by;
        state.reason = None;
        tracing::warn!("kill switch deactivated");
        true
    }

    pub fn is_active(&self) -> bool {
        self.state.read().enabled
    }

    pub fn snapshot(&self) -> KillSwitchState {
        self.state.read().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockdownConfig {
    pub enabled: bool,
    pub external_comms_confirm: bool,
    pub writes_deletes_confirm: bool,
    pub shell_browser_deny: bool,
    pub outbound_network_allowlist: Vec<String>,
}

impl Default for LockdownConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            external_comms_confirm: true,
            writes_deletes_confirm: true,
            shell_browser_deny: false,
            outbound_network_allowlist: default_allowlist(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnableLockdownParams {
    pub external_comms_confirm: Option<bool>,
    pub writes_deletes_confirm: Option<bool>,
    pub shell_browser_deny: Option<bool>,
    pub outbound_network_allowlist: Option<Vec<String>>,
}

pub struct Lockdown {
    config: RwLock<LockdownConfig>,
}

impl Default for Lockdown {
    fn default() -> Self {
        Self::new(false, default_allowlist())
    }
}

impl Lockdown {
    pub fn new(start_enabled: bool, allowlist: Vec<String>) -> Self {
        let mut config = LockdownConfig {
            outbound_network_allowlist: allowlist,
            ..LockdownConfig::default()
        };
        config.enabled = start_enabled;
        Self {
            config: RwLock::new(config),
        }
    }

    pub fn enable(&self, params: EnableLockdownParams) {
        let mut config = self.config.write();
        config.enabled = true;
        if let Some(v) = params.external_comms_confirm {
            config.external_comms_confirm = v;
        }
        if let Some(v) = params.writes_deletes_confirm {
            config.writes_deletes_confirm = v;
        }
        if let Some(v) = params.shell_browser_deny {
            config.shell_browser_deny = v;
        }
        if let Some(v) = params.outbound_network_allowlist {
            config.outbound_network_allowlist = v;
        }
        tracing::warn!("lockdown enabled");
    }

    pub fn disable(&self) {
        self.config.write().enabled = false;
        tracing::warn!("lockdown disabled");
    }

    pub fn is_enabled(&self) -> bool {
        self.config.read().enabled
    }

    pub fn add_to_allowlist(&self, domains: &[String]) {
        let mut config = self.config.write();
        for domain in domains {
            if !config.outbound_network_allowlist.contains(domain) {
                config.outbound_network_allowlist.push(domain.clone());
            }
        }
    }

    pub fn remove_from_allowlist(&self, domains: &[String]) {
        let mut config = self.config.write();
        config
            .outbound_network_allowlist
            .retain(|d| !domains.contains(d));
    }

    pub fn snapshot(&self) -> LockdownConfig {
        self.config.read().clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub kill_switch: KillSwitchState,
    pub lockdown: LockdownConfig,
    pub can_execute_tools: bool,
    pub can_send_external: bool,
    pub can_access_network: bool,
}

pub fn security_status(kill_switch: &KillSwitch, lockdown: &Lockdown) -> SecurityStatus {
    let ks = kill_switch.snapshot();
    let ld = lockdown.snapshot();
    let can_execute_tools = !ks.enabled;
    let can_send_external = !ks.enabled && (!ld.enabled || !ld.external_comms_confirm);
    let can_access_network = !ks.enabled;

    SecurityStatus {
        kill_switch: ks,
        lockdown: ld,
        can_execute_tools,
        can_send_external,
        can_access_network,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_switch_starts_inactive_by_default() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, false);
        assert!(!ks.is_active());
    }

    #[test]
    fn kill_switch_can_start_active_from_env() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, true);
        assert!(ks.is_active());
    }

    #[test]
    fn activate_is_unconditional() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, false);
        ks.activate(ActivateParams {
            reason: Some("manual test".to_string()),
            activated_by: Some("operator".to_string()),
        });
        assert!(ks.is_active());
    }

    #[test]
    fn deactivate_with_wrong_code_fails_and_leaves_state_unchanged() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, false);
        ks.activate(ActivateParams::default());
        let ok = ks.deactivate(DeactivateParams {
            deactivated_by: None,
            confirm_code: "nope".to_string(),
        });
        assert!(!ok);
        assert!(ks.is_active());
    }

    #[test]
    fn deactivate_with_correct_code_succeeds() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, false);
        ks.activate(ActivateParams::default());
        let ok = ks.deactivate(DeactivateParams {
            deactivated_by: Some("operator".to_string()),
            confirm_code: DEFAULT_CONFIRM_CODE.to_string(),
        });
        assert!(ok);
        assert!(!ks.is_active());
    }

    #[test]
    fn lockdown_default_allowlist_is_nonempty() {
        let ld = Lockdown::default();
        assert!(!ld.snapshot().outbound_network_allowlist.is_empty());
    }

    #[test]
    fn lockdown_allowlist_add_and_remove() {
        let ld = Lockdown::default();
        ld.add_to_allowlist(&["example.com".to_string()]);
        assert!(ld
            .snapshot()
            .outbound_network_allowlist
            .contains(&"example.com".to_string()));
        ld.remove_from_allowlist(&["example.com".to_string()]);
        assert!(!ld
            .snapshot()
            .outbound_network_allowlist
            .contains(&"example.com".to_string()));
    }

    #[test]
    fn security_status_derivation() {
        let ks = KillSwitch::new(DEFAULT_CONFIRM_CODE, false);
        let ld = Lockdown::default();
        let status = security_status(&ks, &ld);
        assert!(status.can_execute_tools);
        assert!(status.can_access_network);

        ks.activate(ActivateParams::default());
        let status = security_status(&ks, &ld);
        assert!(!status.can_execute_tools);
        assert!(!status.can_send_external);
        assert!(!status.can_access_network);
    }
}
