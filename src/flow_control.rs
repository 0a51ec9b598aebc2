//! Flow control
//!
//! Rules are evaluated in priority order (smaller number first). A rule whose
//! matcher fires consults its per-key cell; the cell admits only when every
//! stacked strategy admits. A matching rule that blocks ends evaluation with
//! the rule name and reason; a matching rule that admits falls through to the
//! next rule. After all rules, the global per-IP limiter must admit.
//!
//! Cells are evicted by a background sweeper once idle longer than the
//! ruleset's widest window.

use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::Quota;
use http::HeaderMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::{FlowControlConfig, FlowControlRule, FlowRecordConfig, RateLimit};
use crate::structure::ShardedMap;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// One admission strategy inside a cell.
trait Strategy: Send {
    fn allow(&mut self) -> bool;
    fn last_access(&self) -> Instant;
}

// ── strategies ───────────────────────────────────────────────────

/// Sliding window: retain timestamps inside the window, admit while the
/// cardinality is below the limit.
struct SlidingWindow {
    limit: usize,
    window: Duration,
    records: Vec<Instant>,
    last_access: Instant,
}

impl SlidingWindow {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            records: Vec::new(),
            last_access: Instant::now(),
        }
    }
}

impl Strategy for SlidingWindow {
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.last_access = now;
        self.records
            .retain(|t| now.duration_since(*t) < self.window);
        if self.records.len() < self.limit {
            self.records.push(now);
            return true;
        }
        false
    }

    fn last_access(&self) -> Instant {
        self.last_access
    }
}

/// Fixed window: counter with wall-clock reset.
struct FixedWindow {
    limit: u32,
    window: Duration,
    count: u32,
    reset_at: Instant,
    last_access: Instant,
}

impl FixedWindow {
    fn new(limit: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            limit,
            window,
            count: 0,
            reset_at: now + window,
            last_access: now,
        }
    }
}

impl Strategy for FixedWindow {
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.last_access = now;
        if now > self.reset_at {
            self.count = 0;
            self.reset_at = now + self.window;
        }
        if self.count < self.limit {
            self.count += 1;
            return true;
        }
        false
    }

    fn last_access(&self) -> Instant {
        self.last_access
    }
}

/// Leaky bucket: water drains at `limit/window` per second, a request fits
/// while `water + 1 <= capacity`.
struct LeakyBucket {
    capacity: f64,
    rate: f64,
    water: f64,
    last_leak: Instant,
    last_access: Instant,
}

impl LeakyBucket {
    fn new(limit: u32, window: Duration) -> Self {
        let now = Instant::now();
        Self {
            capacity: f64::from(limit),
            rate: f64::from(limit) / window.as_secs_f64(),
            water: 0.0,
            last_leak: now,
            last_access: now,
        }
    }
}

impl Strategy for LeakyBucket {
    fn allow(&mut self) -> bool {
        let now = Instant::now();
        self.last_access = now;

        let leaked = now.duration_since(self.last_leak).as_secs_f64() * self.rate;
        if leaked > 0.0 {
            self.water = (self.water - leaked).max(0.0);
            self.last_leak = now;
        }

        if self.water + 1.0 <= self.capacity {
            self.water += 1.0;
            return true;
        }
        false
    }

    fn last_access(&self) -> Instant {
        self.last_access
    }
}

/// Token bucket backed by governor: refill rate `limit/window`, burst `limit`.
struct TokenBucket {
    limiter: governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    last_access: Instant,
}

impl TokenBucket {
    fn new(limit: u32, window: Duration) -> Self {
        let limit = NonZeroU32::new(limit.max(1)).unwrap_or(NonZeroU32::MIN);
        let period = window / limit.get();
        let quota = Quota::with_period(period.max(Duration::from_nanos(1)))
            .unwrap_or_else(|| Quota::per_second(limit))
            .allow_burst(limit);
        Self {
            limiter: governor::RateLimiter::direct(quota),
            last_access: Instant::now(),
        }
    }
}

impl Strategy for TokenBucket {
    fn allow(&mut self) -> bool {
        self.last_access = Instant::now();
        self.limiter.check().is_ok()
    }

    fn last_access(&self) -> Instant {
        self.last_access
    }
}

// ── cells ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct ParsedRule {
    requests: u32,
    window: Duration,
    mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Sliding,
    Fixed,
    Leaky,
    Token,
}

impl ParsedRule {
    fn build(&self) -> Box<dyn Strategy> {
        match self.mode {
            Mode::Fixed => Box::new(FixedWindow::new(self.requests, self.window)),
            Mode::Leaky => Box::new(LeakyBucket::new(self.requests, self.window)),
            Mode::Token => Box::new(TokenBucket::new(self.requests, self.window)),
            Mode::Sliding => Box::new(SlidingWindow::new(self.requests, self.window)),
        }
    }
}

/// Parse a window spec: either `window` carries its own suffix ("1s",
/// "10min") or it is a bare number interpreted through `unit`.
fn parse_window(window: &str, unit: &str) -> anyhow::Result<Duration> {
    if let Ok(value) = window.parse::<u64>() {
        return match unit {
            "s" | "" => Ok(Duration::from_secs(value)),
            "min" => Ok(Duration::from_secs(value * 60)),
            other => anyhow::bail!("unsupported time unit {other:?}"),
        };
    }
    if let Some(v) = window.strip_suffix("min") {
        if let Ok(value) = v.parse::<u64>() {
            return Ok(Duration::from_secs(value * 60));
        }
    } else if let Some(v) = window.strip_suffix('s') {
        if let Ok(value) = v.parse::<u64>() {
            return Ok(Duration::from_secs(value));
        }
    }
    anyhow::bail!("invalid duration format {window:?}")
}

fn parse_limits(limits: &[RateLimit]) -> Vec<ParsedRule> {
    limits
        .iter()
        .filter_map(|limit| {
            let window = match parse_window(&limit.window, &limit.unit) {
                Ok(w) if !w.is_zero() => w,
                Ok(_) => {
                    error!(window = %limit.window, "rate limit window must be non-zero");
                    return None;
                }
                Err(e) => {
                    error!(window = %limit.window, unit = %limit.unit, error = %e, "invalid rate limit window");
                    return None;
                }
            };
            let mode = match limit.mode.as_str() {
                "fixed" => Mode::Fixed,
                "leaky" => Mode::Leaky,
                "token" => Mode::Token,
                _ => Mode::Sliding,
            };
            Some(ParsedRule {
                requests: limit.requests,
                window,
                mode,
            })
        })
        .collect()
}

/// Stack of strategies for one matcher key. The mutex gives per-key total
/// order; different keys proceed independently.
struct Cell {
    strategies: Mutex<Vec<Box<dyn Strategy>>>,
}

impl Cell {
    fn allow(&self) -> bool {
        let mut strategies = self.strategies.lock();
        // Every strategy must admit; evaluation order matches registration.
        strategies.iter_mut().all(|s| s.allow())
    }

    fn last_access(&self) -> Instant {
        self.strategies
            .lock()
            .iter()
            .map(|s| s.last_access())
            .max()
            .unwrap_or_else(Instant::now)
    }
}

/// Multi-window limiter: one cell per key, each cell a full strategy stack.
pub struct RateLimiter {
    rules: Vec<ParsedRule>,
    cells: ShardedMap<Arc<Cell>>,
}

impl RateLimiter {
    fn new(limits: &[RateLimit]) -> Self {
        Self {
            rules: parse_limits(limits),
            cells: ShardedMap::new(),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        let cell = self.cells.get_or_insert_with(key, || {
            Arc::new(Cell {
                strategies: Mutex::new(self.rules.iter().map(ParsedRule::build).collect()),
            })
        });
        cell.allow()
    }

    fn max_window(&self) -> Duration {
        self.rules
            .iter()
            .map(|r| r.window)
            .max()
            .unwrap_or_default()
    }

    fn sweep(&self) {
        let max_window = self.max_window();
        let now = Instant::now();
        self.cells
            .retain(|_, cell| now.duration_since(cell.last_access()) <= max_window);
    }

    pub fn tracked_keys(&self) -> usize {
        self.cells.len()
    }
}

// ── controller ───────────────────────────────────────────────────

/// Verdict for one request.
#[derive(Debug, Clone)]
pub struct FlowCheckResult {
    pub allowed: bool,
    pub rule_name: String,
    pub reason: String,
}

impl FlowCheckResult {
    fn allowed() -> Self {
        Self {
            allowed: true,
            rule_name: String::new(),
            reason: String::new(),
        }
    }
}

/// Priority-ordered rule evaluation with a global per-IP fallback.
pub struct FlowController {
    config: FlowControlConfig,
    /// Rules sorted by priority at construction
    rules: Vec<FlowControlRule>,
    rule_limiters: ShardedMap<Arc<RateLimiter>>,
    global_limiter: Option<Arc<RateLimiter>>,
    recorder: Option<FlowRecorder>,
}

impl FlowController {
    pub fn new(config: &FlowControlConfig) -> Self {
        let mut rules: Vec<FlowControlRule> =
            config.rules.iter().filter(|r| r.enabled).cloned().collect();
        rules.sort_by_key(|r| r.priority);

        let rule_limiters = ShardedMap::new();
        for rule in &rules {
            rule_limiters.insert(rule.name.clone(), Arc::new(RateLimiter::new(&rule.limits)));
        }

        let global_limiter = config
            .enabled
            .then(|| Arc::new(RateLimiter::new(std::slice::from_ref(&config.global_limit))));

        let recorder = config
            .recording
            .enabled
            .then(|| FlowRecorder::start(&config.recording));

        Self {
            config: config.clone(),
            rules,
            rule_limiters,
            global_limiter,
            recorder,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Evaluate every matching rule, then the global limiter.
    pub fn check(
        &self,
        host: &str,
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
    ) -> FlowCheckResult {
        if !self.config.enabled {
            return FlowCheckResult::allowed();
        }

        for rule in &self.rules {
            if !self.match_rule(rule, host, headers, remote) {
                continue;
            }
            let Some(limiter) = self.rule_limiters.get(&rule.name) else {
                continue;
            };
            let key = self.rule_key(rule, host, headers, remote);
            if !limiter.allow(&key) {
                let result = FlowCheckResult {
                    allowed: false,
                    rule_name: rule.name.clone(),
                    reason: format!("rule '{}' rate limit exceeded", rule.name),
                };
                self.record(host, &result);
                return result;
            }
        }

        if let Some(global) = &self.global_limiter {
            let key = format!("global:ip:{}", client_ip(headers, remote));
            if !global.allow(&key) {
                let result = FlowCheckResult {
                    allowed: false,
                    rule_name: String::new(),
                    reason: "global rate limit exceeded".to_string(),
                };
                self.record(host, &result);
                return result;
            }
        }

        let result = FlowCheckResult::allowed();
        self.record(host, &result);
        result
    }

    fn match_rule(
        &self,
        rule: &FlowControlRule,
        host: &str,
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
    ) -> bool {
        match rule.match_type.as_str() {
            "host" => host == rule.match_value || host.contains(&rule.match_value),
            "header" => {
                let value = header_str(headers, &rule.header_key);
                !value.is_empty()
                    && (value == rule.match_value || value.contains(&rule.match_value))
            }
            "ip" => client_ip(headers, remote) == rule.match_value,
            _ => false,
        }
    }

    fn rule_key(
        &self,
        rule: &FlowControlRule,
        host: &str,
        headers: &HeaderMap,
        remote: Option<SocketAddr>,
    ) -> String {
        match rule.match_type.as_str() {
            "host" => format!("rule:{}:host:{}", rule.name, host),
            "header" => format!(
                "rule:{}:header:{}:{}",
                rule.name,
                rule.header_key,
                header_str(headers, &rule.header_key)
            ),
            "ip" => format!("rule:{}:ip:{}", rule.name, client_ip(headers, remote)),
            _ => format!("rule:{}:unknown", rule.name),
        }
    }

    fn record(&self, host: &str, result: &FlowCheckResult) {
        if let Some(recorder) = &self.recorder {
            recorder.record(host, result);
        }
    }

    /// Evict idle cells. Runs on the sweeper cadence; exposed for tests.
    pub fn sweep(&self) {
        for limiter in self.rule_limiters.values() {
            limiter.sweep();
        }
        if let Some(global) = &self.global_limiter {
            global.sweep();
        }
    }

    pub fn start_sweeper(self: &Arc<Self>) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                controller.sweep();
            }
        });
    }
}

/// Client IP derivation order: first `X-Forwarded-For` entry, `X-Real-IP`,
/// then the socket address with the port stripped.
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    remote.map(|a| a.ip().to_string()).unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    if name.is_empty() {
        return "";
    }
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

// ── flow recorder ────────────────────────────────────────────────

#[derive(Debug)]
struct FlowEvent {
    host: String,
    allowed: bool,
    rule_name: String,
    reason: String,
}

/// Async sink for allow/block events. The channel send never blocks the
/// request path; events that do not fit are dropped.
pub struct FlowRecorder {
    tx: mpsc::Sender<FlowEvent>,
    record_blocked: bool,
    record_allowed: bool,
}

impl FlowRecorder {
    fn start(config: &FlowRecordConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<FlowEvent>(1024);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.allowed {
                    debug!(host = %event.host, "flow record: allowed");
                } else {
                    warn!(
                        host = %event.host,
                        rule = %event.rule_name,
                        reason = %event.reason,
                        "flow record: blocked"
                    );
                }
            }
        });
        Self {
            tx,
            record_blocked: config.record_blocked,
            record_allowed: config.record_allowed,
        }
    }

    fn record(&self, host: &str, result: &FlowCheckResult) {
        let wanted = if result.allowed {
            self.record_allowed
        } else {
            self.record_blocked
        };
        if !wanted {
            return;
        }
        let _ = self.tx.try_send(FlowEvent {
            host: host.to_string(),
            allowed: result.allowed,
            rule_name: result.rule_name.clone(),
            reason: result.reason.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlowControlConfig, FlowControlRule, RateLimit};

    fn limit(requests: u32, window: &str, mode: &str) -> RateLimit {
        RateLimit {
            requests,
            window: window.to_string(),
            unit: "s".to_string(),
            mode: mode.to_string(),
        }
    }

    fn rule_config(rules: Vec<FlowControlRule>) -> FlowControlConfig {
        FlowControlConfig {
            enabled: true,
            global_limit: limit(10_000, "1s", "sliding"),
            rules,
            recording: Default::default(),
        }
    }

    fn host_rule(name: &str, value: &str, limits: Vec<RateLimit>) -> FlowControlRule {
        FlowControlRule {
            name: name.to_string(),
            enabled: true,
            priority: 0,
            match_type: "host".to_string(),
            match_value: value.to_string(),
            header_key: String::new(),
            limits,
            description: String::new(),
        }
    }

    #[test]
    fn test_parse_window_formats() {
        assert_eq!(parse_window("1s", "").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_window("10min", "").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_window("5", "s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_window("2", "min").unwrap(), Duration::from_secs(120));
        assert!(parse_window("abc", "s").is_err());
        assert!(parse_window("5", "h").is_err());
    }

    #[test]
    fn test_sliding_window_admits_up_to_limit() {
        let mut s = SlidingWindow::new(2, Duration::from_secs(1));
        assert!(s.allow());
        assert!(s.allow());
        assert!(!s.allow());
    }

    #[test]
    fn test_sliding_window_recovers_after_window() {
        let mut s = SlidingWindow::new(2, Duration::from_millis(50));
        assert!(s.allow());
        assert!(s.allow());
        assert!(!s.allow());
        std::thread::sleep(Duration::from_millis(60));
        assert!(s.allow());
    }

    #[test]
    fn test_fixed_window_resets() {
        let mut s = FixedWindow::new(1, Duration::from_millis(40));
        assert!(s.allow());
        assert!(!s.allow());
        std::thread::sleep(Duration::from_millis(50));
        assert!(s.allow());
    }

    #[test]
    fn test_leaky_bucket_capacity() {
        let mut s = LeakyBucket::new(3, Duration::from_secs(10));
        assert!(s.allow());
        assert!(s.allow());
        assert!(s.allow());
        assert!(!s.allow());
    }

    #[test]
    fn test_token_bucket_burst_then_deny() {
        let mut s = TokenBucket::new(2, Duration::from_secs(60));
        assert!(s.allow());
        assert!(s.allow());
        assert!(!s.allow());
    }

    #[test]
    fn test_cell_requires_all_strategies() {
        // Stack a generous sliding window over a tight fixed window: the
        // fixed window must still block the second request.
        let limiter = RateLimiter::new(&[limit(100, "10s", "sliding"), limit(1, "10s", "fixed")]);
        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(&[limit(1, "10s", "sliding")]);
        assert!(limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert!(!limiter.allow("a"));
    }

    #[test]
    fn test_controller_blocks_matching_host() {
        let controller = Arc::new(FlowController::new(&rule_config(vec![host_rule(
            "api-cap",
            "api.example",
            vec![limit(2, "1s", "sliding")],
        )])));

        let headers = HeaderMap::new();
        assert!(controller.check("api.example", &headers, None).allowed);
        assert!(controller.check("api.example", &headers, None).allowed);
        let verdict = controller.check("api.example", &headers, None);
        assert!(!verdict.allowed);
        assert_eq!(verdict.rule_name, "api-cap");

        // Non-matching host is untouched by the rule.
        assert!(controller.check("other.example", &headers, None).allowed);
    }

    #[test]
    fn test_controller_priority_order() {
        // The tighter rule has higher priority and must be consulted first.
        let mut strict = host_rule("strict", "example", vec![limit(1, "1s", "sliding")]);
        strict.priority = 1;
        let mut loose = host_rule("loose", "example", vec![limit(100, "1s", "sliding")]);
        loose.priority = 5;

        let controller = FlowController::new(&rule_config(vec![loose, strict]));
        let headers = HeaderMap::new();
        assert!(controller.check("api.example", &headers, None).allowed);
        let verdict = controller.check("api.example", &headers, None);
        assert!(!verdict.allowed);
        assert_eq!(verdict.rule_name, "strict");
    }

    #[test]
    fn test_header_rule_matching() {
        let mut rule = host_rule("agent", "bot", vec![limit(1, "1s", "sliding")]);
        rule.match_type = "header".to_string();
        rule.header_key = "user-agent".to_string();

        let controller = FlowController::new(&rule_config(vec![rule]));

        let mut headers = HeaderMap::new();
        headers.insert("user-agent", "some-bot/1.0".parse().unwrap());
        assert!(controller.check("x", &headers, None).allowed);
        assert!(!controller.check("x", &headers, None).allowed);

        // A request without the header never matches the rule.
        let clean = HeaderMap::new();
        assert!(controller.check("x", &clean, None).allowed);
    }

    #[test]
    fn test_client_ip_derivation_order() {
        let remote: SocketAddr = "10.0.0.9:1234".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(remote)), "1.2.3.4");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(remote)), "9.9.9.9");

        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, Some(remote)), "10.0.0.9");
    }

    #[test]
    fn test_sweep_evicts_idle_cells() {
        let limiter = RateLimiter::new(&[limit(5, "1s", "sliding")]);
        limiter.allow("idle-key");
        assert_eq!(limiter.tracked_keys(), 1);
        std::thread::sleep(Duration::from_millis(1100));
        limiter.sweep();
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_disabled_controller_admits_everything() {
        let mut config = rule_config(vec![host_rule(
            "cap",
            "api.example",
            vec![limit(0, "1s", "sliding")],
        )]);
        config.enabled = false;
        let controller = FlowController::new(&config);
        let headers = HeaderMap::new();
        for _ in 0..10 {
            assert!(controller.check("api.example", &headers, None).allowed);
        }
    }
}
