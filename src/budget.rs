//! Rate & Budget (C5) — token-bucket rate limiting and cost guardrails.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const MAP_CLEAR_THRESHOLD: usize = 10_000;
const VIOLATIONS_CAP: usize = 1_000;

/// Refills continuously from a monotonic clock; `consume` is atomic per
/// bucket because all mutation happens behind the bucket's own mutex.
pub struct TokenBucket {
    capacity: f64,
    refill_rate_per_sec: f64,
    tokens: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_sec,
            tokens: Mutex::new((capacity, Instant::now())),
        }
    }

    pub fn consume(&self, n: f64) -> bool {
        let mut guard = self.tokens.lock();
        let (tokens, last_refill) = *guard;
        let elapsed = last_refill.elapsed().as_secs_f64();
        let refilled = (tokens + elapsed * self.refill_rate_per_sec).min(self.capacity);
        if refilled >= n {
            *guard = (refilled - n, Instant::now());
            true
        } else {
            *guard = (refilled, Instant::now());
            false
        }
    }

    pub fn tokens_remaining(&self) -> f64 {
        self.tokens.lock().0
    }
}

pub struct MessageRateLimiter {
    per_user: Mutex<HashMap<String, TokenBucket>>,
    per_ip: Mutex<HashMap<String, TokenBucket>>,
    global: TokenBucket,
}

impl Default for MessageRateLimiter {
    fn default() -> Self {
        Self {
            per_user: Mutex::new(HashMap::new()),
            per_ip: Mutex::new(HashMap::new()),
            global: TokenBucket::new(1000.0, 100.0),
        }
    }
}

impl MessageRateLimiter {
    pub fn check(&self, user_id: Option<&str>, ip: Option<&str>) -> bool {
        let user_ok = match user_id {
            Some(uid) => {
                let mut map = self.per_user.lock();
                if map.len() >= MAP_CLEAR_THRESHOLD {
                    map.clear();
                }
                map.entry(uid.to_string())
                    .or_insert_with(|| TokenBucket::new(60.0, 1.0))
                    .consume(1.0)
            }
            None => true,
        };
        let ip_ok = match ip {
            Some(ip) => {
                let mut map = self.per_ip.lock();
                if map.len() >= MAP_CLEAR_THRESHOLD {
                    map.clear();
                }
                map.entry(ip.to_string())
                    .or_insert_with(|| TokenBucket::new(100.0, 2.0))
                    .consume(1.0)
            }
            None => true,
        };
        let global_ok = self.global.consume(1.0);
        user_ok && ip_ok && global_ok
    }
}

pub struct ToolCallRateLimiter {
    per_run: Mutex<HashMap<String, u64>>,
    per_run_cap: u64,
    global_per_minute: TokenBucket,
}

impl Default for ToolCallRateLimiter {
    fn default() -> Self {
        Self {
            per_run: Mutex::new(HashMap::new()),
            per_run_cap: 100,
            global_per_minute: TokenBucket::new(30.0, 1.0),
        }
    }
}

impl ToolCallRateLimiter {
    pub fn check(&self, run_id: &str) -> bool {
        let run_ok = {
            let mut map = self.per_run.lock();
            if map.len() >= MAP_CLEAR_THRESHOLD {
                map.clear();
            }
            let count = map.entry(run_id.to_string()).or_insert(0);
            if *count < self.per_run_cap {
                *count += 1;
                true
            } else {
                false
            }
        };
        let global_ok = self.global_per_minute.consume(1.0);
        run_ok && global_ok
    }
}

pub struct LlmCallRateLimiter {
    per_minute: TokenBucket,
    per_hour: TokenBucket,
}

impl Default for LlmCallRateLimiter {
    fn default() -> Self {
        Self {
            per_minute: TokenBucket::new(20.0, 0.5),
            per_hour: TokenBucket::new(500.0, 2.0),
        }
    }
}

impl LlmCallRateLimiter {
    pub fn check(&self) -> bool {
        // Evaluate both unconditionally: a refusal on one tier must not
        // short-circuit consumption accounting on the other.
        let minute_ok = self.per_minute.consume(1.0);
        let hour_ok = self.per_hour.consume(1.0);
        minute_ok && hour_ok
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostBudgetConfig {
    pub daily_limit_usd: f64,
    pub per_run_limit_usd: f64,
    pub tokens_per_run_limit: u64,
    pub tool_calls_per_run_limit: u64,
    pub warning_threshold: f64,
}

impl Default for CostBudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 10.0,
            per_run_limit_usd: 1.0,
            tokens_per_run_limit: 100_000,
            tool_calls_per_run_limit: 100,
            warning_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CostBudgetUsage {
    run_tokens: u64,
    run_cost_usd: f64,
    run_tool_calls: u64,
    daily_cost_usd: f64,
    last_reset_daily: Option<NaiveDate>,
}

pub struct CostBudget {
    config: CostBudgetConfig,
    usage: Mutex<CostBudgetUsage>,
}

impl CostBudget {
    pub fn new(config: CostBudgetConfig) -> Self {
        Self {
            config,
            usage: Mutex::new(CostBudgetUsage::default()),
        }
    }

    fn roll_day_if_needed(&self, usage: &mut CostBudgetUsage) {
        let today = Utc::now().date_naive();
        if usage.last_reset_daily != Some(today) {
            usage.daily_cost_usd = 0.0;
            usage.last_reset_daily = Some(today);
        }
    }

    pub fn record_token_usage(&self, n: u64, cost_usd: f64) {
        let mut usage = self.usage.lock();
        self.roll_day_if_needed(&mut usage);
        usage.run_tokens += n;
        usage.run_cost_usd += cost_usd;
        usage.daily_cost_usd += cost_usd;
    }

    pub fn record_tool_call(&self) {
        self.usage.lock().run_tool_calls += 1;
    }

    pub fn reset_run_usage(&self) {
        let mut usage = self.usage.lock();
        usage.run_tokens = 0;
        usage.run_cost_usd = 0.0;
        usage.run_tool_calls = 0;
    }

    pub fn tool_calls_exceeded(&self) -> bool {
        self.usage.lock().run_tool_calls >= self.config.tool_calls_per_run_limit
    }

    pub fn cost_exceeded(&self) -> bool {
        self.usage.lock().run_cost_usd >= self.config.per_run_limit_usd
    }

    pub fn tokens_used(&self) -> u64 {
        self.usage.lock().run_tokens
    }

    pub fn cost_usd(&self) -> f64 {
        self.usage.lock().run_cost_usd
    }

    pub fn tool_calls_used(&self) -> u64 {
        self.usage.lock().run_tool_calls
    }

    pub fn config(&self) -> &CostBudgetConfig {
        &self.config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Smart,
    Fast,
    Cheap,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub per_run_usd: f64,
    pub daily_usd: f64,
    pub monthly_usd: f64,
    pub warning_threshold: f64,
    pub auto_downgrade: bool,
    pub hard_stop: bool,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            per_run_usd: 1.0,
            daily_usd: 10.0,
            monthly_usd: 200.0,
            warning_threshold: 0.7,
            auto_downgrade: true,
            hard_stop: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub run_usd: f64,
    pub daily_usd: f64,
    pub monthly_usd: f64,
    pub last_reset_daily: Option<NaiveDate>,
    pub last_reset_monthly: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub within_budget: bool,
    pub current_tier: Tier,
    pub run_percent: f64,
    pub daily_percent: f64,
    pub monthly_percent: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationAction {
    Warn,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetViolation {
    pub id: String,
    pub user_id: Option<String>,
    pub org_id: Option<String>,
    pub period: &'static str,
    pub percent: f64,
    pub action: ViolationAction,
    pub at: DateTime<Utc>,
}

fn scope_key(user_id: Option<&str>, org_id: Option<&str>) -> String {
    format!("{}:{}", user_id.unwrap_or(""), org_id.unwrap_or(""))
}

pub struct BudgetGuardrails {
    default_config: BudgetConfig,
    user_configs: Mutex<HashMap<String, BudgetConfig>>,
    org_configs: Mutex<HashMap<String, BudgetConfig>>,
    usages: Mutex<HashMap<String, BudgetUsage>>,
    violations: Mutex<VecDeque<BudgetViolation>>,
}

impl Default for BudgetGuardrails {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}

impl BudgetGuardrails {
    pub fn new(default_config: BudgetConfig) -> Self {
        Self {
            default_config,
            user_configs: Mutex::new(HashMap::new()),
            org_configs: Mutex::new(HashMap::new()),
            usages: Mutex::new(HashMap::new()),
            violations: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_user_config(&self, user_id: &str, config: BudgetConfig) {
        self.user_configs.lock().insert(user_id.to_string(), config);
    }

    pub fn set_org_config(&self, org_id: &str, config: BudgetConfig) {
        self.org_configs.lock().insert(org_id.to_string(), config);
    }

    fn effective_config(&self, user_id: Option<&str>, org_id: Option<&str>) -> BudgetConfig {
        if let Some(uid) = user_id {
            if let Some(c) = self.user_configs.lock().get(uid) {
                return c.clone();
            }
        }
        if let Some(oid) = org_id {
            if let Some(c) = self.org_configs.lock().get(oid) {
                return c.clone();
            }
        }
        self.default_config.clone()
    }

    /// Records usage against the given scope; called by the host as costs
    /// are incurred, separately from `check`.
    pub fn record_usage(&self, user_id: Option<&str>, org_id: Option<&str>, cost_usd: f64) {
        let key = scope_key(user_id, org_id);
        let mut usages = self.usages.lock();
        let usage = usages.entry(key).or_default();
        let today = Utc::now().date_naive();
        if usage.last_reset_daily != Some(today) {
            usage.daily_usd = 0.0;
            usage.last_reset_daily = Some(today);
        }
        let this_month = today.with_day(1).unwrap_or(today);
        if usage.last_reset_monthly != Some(this_month) {
            usage.monthly_usd = 0.0;
            usage.last_reset_monthly = Some(this_month);
        }
        usage.run_usd += cost_usd;
        usage.daily_usd += cost_usd;
        usage.monthly_usd += cost_usd;
    }

    pub fn reset_run_usage(&self, user_id: Option<&str>, org_id: Option<&str>) {
        let key = scope_key(user_id, org_id);
        if let Some(usage) = self.usages.lock().get_mut(&key) {
            usage.run_usd = 0.0;
        }
    }

    pub fn check(
        &self,
        user_id: Option<&str>,
        org_id: Option<&str>,
        estimated_cost_usd: Option<f64>,
    ) -> BudgetStatus {
        let config = self.effective_config(user_id, org_id);
        let key = scope_key(user_id, org_id);
        let usage = self.usages.lock().get(&key).cloned().unwrap_or_default();
        let estimated = estimated_cost_usd.unwrap_or(0.0);

        let run_percent = pct(usage.run_usd + estimated, config.per_run_usd);
        let daily_percent = pct(usage.daily_usd + estimated, config.daily_usd);
        let monthly_percent = pct(usage.monthly_usd + estimated, config.monthly_usd);

        let periods = [
            ("run", run_percent),
            ("daily", daily_percent),
            ("monthly", monthly_percent),
        ];

        let mut within_budget = true;
        let mut tier = Tier::Smart;
        let mut blocked = false;

        for (period, percent) in periods {
            if percent >= 1.0 {
                within_budget = false;
                if config.hard_stop {
                    blocked = true;
                    self.log_violation(user_id, org_id, period, percent, ViolationAction::Block);
                } else {
                    self.log_violation(user_id, org_id, period, percent, ViolationAction::Warn);
                }
            }
        }

        if blocked {
            tier = Tier::Blocked;
        } else if config.auto_downgrade {
            let max_percent = daily_percent.max(monthly_percent).max(run_percent);
            if max_percent >= config.warning_threshold && max_percent < 1.0 {
                tier = if max_percent >= 0.9 { Tier::Cheap } else { Tier::Fast };
            }
        }

        BudgetStatus {
            within_budget,
            current_tier: tier,
            run_percent,
            daily_percent,
            monthly_percent,
        }
    }

    fn log_violation(
        &self,
        user_id: Option<&str>,
        org_id: Option<&str>,
        period: &'static str,
        percent: f64,
        action: ViolationAction,
    ) {
        let mut violations = self.violations.lock();
        if violations.len() >= VIOLATIONS_CAP {
            violations.pop_back();
        }
        violations.push_front(BudgetViolation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.map(String::from),
            org_id: org_id.map(String::from),
            period,
            percent,
            action,
            at: crate::types::now(),
        });
        tracing::warn!(?action, period, percent, "budget violation");
    }

    pub fn violations(&self) -> Vec<BudgetViolation> {
        self.violations.lock().iter().cloned().collect()
    }
}

fn pct(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        1.0
    } else {
        used / limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_conserves_capacity() {
        let bucket = TokenBucket::new(5.0, 1.0);
        for _ in 0..5 {
            assert!(bucket.consume(1.0));
        }
        assert!(!bucket.consume(1.0));
        assert!(bucket.tokens_remaining() <= 5.0);
    }

    #[test]
    fn message_rate_limiter_enforces_per_user_cap() {
        let limiter = MessageRateLimiter::default();
        let mut allowed = 0;
        for _ in 0..70 {
            if limiter.check(Some("u1"), None) {
                allowed += 1;
            }
        }
        assert!(allowed <= 61);
    }

    #[test]
    fn tool_call_limiter_enforces_per_run_cap() {
        let limiter = ToolCallRateLimiter::default();
        let mut allowed = 0;
        for _ in 0..150 {
            if limiter.check("run-1") {
                allowed += 1;
            }
        }
        assert!(allowed <= 100);
    }

    #[test]
    fn cost_budget_tracks_per_run_usage() {
        let budget = CostBudget::new(CostBudgetConfig {
            per_run_limit_usd: 1.0,
            ..CostBudgetConfig::default()
        });
        budget.record_token_usage(100, 1.5);
        assert!(budget.cost_exceeded());
    }

    #[test]
    fn hard_stop_blocks_when_over_budget() {
        let guardrails = BudgetGuardrails::new(BudgetConfig {
            per_run_usd: 1.0,
            hard_stop: true,
            ..BudgetConfig::default()
        });
        guardrails.record_usage(Some("u1"), None, 1.5);
        let status = guardrails.check(Some("u1"), None, None);
        assert!(!status.within_budget);
        assert_eq!(status.current_tier, Tier::Blocked);
    }

    #[test]
    fn soft_stop_warns_without_blocking() {
        let guardrails = BudgetGuardrails::new(BudgetConfig {
            per_run_usd: 1.0,
            hard_stop: false,
            ..BudgetConfig::default()
        });
        guardrails.record_usage(Some("u1"), None, 1.5);
        let status = guardrails.check(Some("u1"), None, None);
        assert!(!status.within_budget);
        assert_ne!(status.current_tier, Tier::Blocked);
    }

    #[test]
    fn auto_downgrade_steps_tier_down_near_threshold() {
        let guardrails = BudgetGuardrails::new(BudgetConfig {
            daily_usd: 10.0,
            warning_threshold: 0.7,
            auto_downgrade: true,
            ..BudgetConfig::default()
        });
        guardrails.record_usage(Some("u1"), None, 9.5);
        let status = guardrails.check(Some("u1"), None, None);
        assert_eq!(status.current_tier, Tier::Cheap);
    }

    #[test]
    fn user_config_overrides_org_and_default() {
        let guardrails = BudgetGuardrails::default();
        guardrails.set_org_config("org1", BudgetConfig { per_run_usd: 5.0, ..BudgetConfig::default() });
        guardrails.set_user_config("u1", BudgetConfig { per_run_usd: 0.01, hard_stop: true, ..BudgetConfig::default() });
        guardrails.record_usage(Some("u1"), Some("org1"), 0.02);
        let status = guardrails.check(Some("u1"), Some("org1"), None);
        assert_eq!(status.current_tier, Tier::Blocked);
    }
}
