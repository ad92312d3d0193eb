//! Process configuration assembled once from environment variables
//! (spec §6). Reads `std::env::var` at construction time only — checks
//! consult the resulting `Config` value, never the environment directly.

use crate::budget::{BudgetConfig, CostBudgetConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlMode {
    Off,
    Selective,
    Full,
}

impl HitlMode {
    fn from_env_str(s: &str) -> Self {
        match s {
            "off" => HitlMode::Off,
            "full" => HitlMode::Full,
            _ => HitlMode::Selective,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kill_switch_at_boot: bool,
    pub kill_switch_confirm_code: String,
    pub lockdown_at_boot: bool,
    pub lockdown_network_allowlist: Option<Vec<String>>,
    pub hitl_mode: HitlMode,
    pub cost_budget: CostBudgetConfig,
    pub default_budget: BudgetConfig,
}

fn read_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => v.eq_ignore_ascii_case("true"),
        Err(_) => default,
    }
}

fn read_bool_inverted_flag(name: &str, default: bool) -> bool {
    // Used for *_DOWNGRADE / *_HARD_STOP vars, which are phrased as
    // "false to disable" — the compiled default is `true`.
    match std::env::var(name) {
        Ok(v) => !v.eq_ignore_ascii_case("false"),
        Err(_) => default,
    }
}

fn read_f64(name: &str, default: f64) -> f64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn read_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        let lockdown_network_allowlist = std::env::var("LOCKDOWN_NETWORK_ALLOWLIST")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect());

        Self {
            kill_switch_at_boot: read_bool("KILL_SWITCH", false),
            kill_switch_confirm_code: std::env::var("KILL_SWITCH_CONFIRM_CODE")
                .unwrap_or_else(|_| crate::controls::DEFAULT_CONFIRM_CODE.to_string()),
            lockdown_at_boot: read_bool("LOCKDOWN_MODE", false),
            lockdown_network_allowlist,
            hitl_mode: std::env::var("HITL_MODE")
                .map(|v| HitlMode::from_env_str(&v))
                .unwrap_or(HitlMode::Selective),
            cost_budget: CostBudgetConfig {
                daily_limit_usd: read_f64("DAILY_COST_LIMIT_USD", 10.0),
                per_run_limit_usd: read_f64("PER_RUN_COST_LIMIT_USD", 1.0),
                tokens_per_run_limit: read_u64("TOKENS_PER_RUN_LIMIT", 100_000),
                tool_calls_per_run_limit: read_u64("TOOL_CALLS_PER_RUN_LIMIT", 100),
                warning_threshold: read_f64("BUDGET_WARNING_THRESHOLD", 0.7),
            },
            default_budget: BudgetConfig {
                per_run_usd: read_f64("PER_RUN_COST_LIMIT_USD", 1.0),
                daily_usd: read_f64("DAILY_COST_LIMIT_USD", 10.0),
                monthly_usd: read_f64("DAILY_COST_LIMIT_USD", 10.0) * 30.0,
                warning_threshold: read_f64("BUDGET_WARNING_THRESHOLD", 0.7),
                auto_downgrade: read_bool_inverted_flag("BUDGET_AUTO_DOWNGRADE", true),
                hard_stop: read_bool_inverted_flag("BUDGET_HARD_STOP", true),
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            kill_switch_at_boot: false,
            kill_switch_confirm_code: crate::controls::DEFAULT_CONFIRM_CODE.to_string(),
            lockdown_at_boot: false,
            lockdown_network_allowlist: None,
            hitl_mode: HitlMode::Selective,
            cost_budget: CostBudgetConfig::default(),
            default_budget: BudgetConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert!(!config.kill_switch_at_boot);
        assert_eq!(config.kill_switch_confirm_code, "CONFIRM_DEACTIVATE");
        assert_eq!(config.hitl_mode, HitlMode::Selective);
        assert_eq!(config.cost_budget.daily_limit_usd, 10.0);
        assert_eq!(config.cost_budget.per_run_limit_usd, 1.0);
    }

    #[test]
    fn hitl_mode_parses_recognised_values() {
        assert_eq!(HitlMode::from_env_str("off"), HitlMode::Off);
        assert_eq!(HitlMode::from_env_str("full"), HitlMode::Full);
        assert_eq!(HitlMode::from_env_str("garbage"), HitlMode::Selective);
    }
}
