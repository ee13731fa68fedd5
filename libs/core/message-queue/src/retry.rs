//! Retry policies and the retry executor.
//!
//! A policy answers two questions: "is attempt N worth making for error E"
//! and "how long should attempt N wait". Strategies are pluggable:
//!
//! - `FixedDelay` - constant delay
//! - `LinearBackoff` - `base * attempt * multiplier`
//! - `ExponentialBackoff` - `base * multiplier * factor^(attempt-1)`
//! - `CustomBackoff` - user-supplied function
//! - `CompositeBackoff` - ordered list, advances when the current one gives up
//! - `CircuitBreakerPolicy` - wraps any base strategy with CLOSED/OPEN/HALF_OPEN
//!
//! ## Circuit breaker states
//!
//! ```text
//! ┌─────────┐  failures >= threshold  ┌────────┐
//! │ CLOSED  │ ──────────────────────> │  OPEN  │
//! └─────────┘                         └────────┘
//!      ^                                   │
//!      │                                   │ timeout elapsed
//!      │                                   v
//!      │      success            ┌─────────────┐
//!      └──────────────────────── │ HALF-OPEN   │
//!                                └─────────────┘
//!                                      │
//!                       failure        │
//!                       ───────────────┘
//! ```

use crate::error::QueueError;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Strategy selector carried by `RetryConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategyKind {
    Fixed,
    Linear,
    Exponential,
    /// Circuit breaker wrapping an exponential base.
    CircuitBreaker,
}

/// Shared knobs for the built-in strategies.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub strategy: RetryStrategyKind,
    /// Total attempt budget; `should_retry` is false once `attempt`
    /// reaches this.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Linear/exponential scale factor.
    pub multiplier: f64,
    /// Exponent base for `ExponentialBackoff`.
    pub backoff_base: f64,
    /// Add ±25 % uniform noise to computed delays.
    pub jitter: bool,
    /// When set, only these error kinds are retried.
    pub retryable_kinds: Option<HashSet<String>>,
    /// Error kinds that are never retried.
    pub non_retryable_kinds: HashSet<String>,
    /// Consecutive failures that trip the circuit breaker.
    pub failure_threshold: u32,
    /// How long an open circuit refuses retries.
    pub circuit_breaker_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategyKind::Exponential,
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 1.0,
            backoff_base: 2.0,
            jitter: false,
            retryable_kinds: None,
            non_retryable_kinds: HashSet::new(),
            failure_threshold: 5,
            circuit_breaker_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    pub fn with_strategy(mut self, strategy: RetryStrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn with_backoff_base(mut self, backoff_base: f64) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_non_retryable(mut self, kinds: &[&str]) -> Self {
        self.non_retryable_kinds = kinds.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_retryable(mut self, kinds: &[&str]) -> Self {
        self.retryable_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_circuit_breaker_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.circuit_breaker_timeout_ms = timeout_ms;
        self
    }

    /// Shared gate used by all strategies: attempt budget plus the
    /// retryable / non-retryable kind sets.
    fn permits(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        if let Some(err) = err {
            let kind = err.kind();
            if self.non_retryable_kinds.contains(kind) {
                return false;
            }
            if let Some(retryable) = &self.retryable_kinds {
                return retryable.contains(kind);
            }
        }
        true
    }

    /// Clamp to `max_delay_ms`, then jitter when enabled.
    fn finalize(&self, raw_ms: u64) -> Duration {
        let capped = raw_ms.min(self.max_delay_ms);
        let final_ms = if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        };
        Duration::from_millis(final_ms)
    }

    /// Build the configured strategy.
    pub fn build(self) -> Arc<dyn RetryPolicy> {
        match self.strategy {
            RetryStrategyKind::Fixed => Arc::new(FixedDelay::new(self)),
            RetryStrategyKind::Linear => Arc::new(LinearBackoff::new(self)),
            RetryStrategyKind::Exponential => Arc::new(ExponentialBackoff::new(self)),
            RetryStrategyKind::CircuitBreaker => {
                let threshold = self.failure_threshold;
                let timeout_ms = self.circuit_breaker_timeout_ms;
                let base = ExponentialBackoff::new(self);
                Arc::new(CircuitBreakerPolicy::new(
                    Arc::new(base),
                    threshold,
                    Duration::from_millis(timeout_ms),
                ))
            }
        }
    }
}

/// A pluggable retry-delay policy.
pub trait RetryPolicy: Send + Sync {
    /// Whether attempt `attempt` (1-based) is worth making for `err`.
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool;

    /// Delay before attempt `attempt`; `None` exactly when `should_retry`
    /// is false.
    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration>;

    /// Reset strategy-internal state.
    fn reset(&self) {}

    /// Feed an operation outcome into stateful strategies.
    fn record_success(&self) {}
    fn record_failure(&self) {}
}

/// Constant delay per attempt.
pub struct FixedDelay {
    config: RetryConfig,
}

impl FixedDelay {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for FixedDelay {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        self.config.permits(attempt, err)
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        if !self.should_retry(attempt, err) {
            return None;
        }
        Some(self.config.finalize(self.config.base_delay_ms))
    }
}

/// Delay grows linearly with the attempt number.
pub struct LinearBackoff {
    config: RetryConfig,
}

impl LinearBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for LinearBackoff {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        self.config.permits(attempt, err)
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        if !self.should_retry(attempt, err) {
            return None;
        }
        let raw = (self.config.base_delay_ms as f64 * attempt as f64 * self.config.multiplier)
            .max(0.0) as u64;
        Some(self.config.finalize(raw))
    }
}

/// Delay doubles (by default) with every attempt.
pub struct ExponentialBackoff {
    config: RetryConfig,
}

impl ExponentialBackoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        self.config.permits(attempt, err)
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        if !self.should_retry(attempt, err) {
            return None;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let raw = (self.config.base_delay_ms as f64
            * self.config.multiplier
            * self.config.backoff_base.powi(exponent as i32))
        .max(0.0)
        .min(u64::MAX as f64) as u64;
        Some(self.config.finalize(raw))
    }
}

/// Delegates the delay computation to a caller-supplied function.
pub struct CustomBackoff {
    config: RetryConfig,
    delay_fn: Box<dyn Fn(u32, Option<&QueueError>) -> Option<u64> + Send + Sync>,
}

impl CustomBackoff {
    pub fn new<F>(config: RetryConfig, delay_fn: F) -> Self
    where
        F: Fn(u32, Option<&QueueError>) -> Option<u64> + Send + Sync + 'static,
    {
        Self {
            config,
            delay_fn: Box::new(delay_fn),
        }
    }
}

impl RetryPolicy for CustomBackoff {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        self.config.permits(attempt, err)
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        if !self.should_retry(attempt, err) {
            return None;
        }
        let raw = (self.delay_fn)(attempt, err)?;
        Some(self.config.finalize(raw))
    }
}

/// Ordered list of policies; moves on to the next when the current one
/// stops retrying.
pub struct CompositeBackoff {
    policies: Vec<Arc<dyn RetryPolicy>>,
    active: AtomicUsize,
}

impl CompositeBackoff {
    pub fn new(policies: Vec<Arc<dyn RetryPolicy>>) -> Self {
        Self {
            policies,
            active: AtomicUsize::new(0),
        }
    }
}

impl RetryPolicy for CompositeBackoff {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        let start = self.active.load(Ordering::SeqCst);
        self.policies[start.min(self.policies.len())..]
            .iter()
            .any(|p| p.should_retry(attempt, err))
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        let mut index = self.active.load(Ordering::SeqCst);
        while index < self.policies.len() {
            if let Some(delay) = self.policies[index].calculate_delay(attempt, err) {
                self.active.store(index, Ordering::SeqCst);
                return Some(delay);
            }
            index += 1;
        }
        None
    }

    fn reset(&self) {
        self.active.store(0, Ordering::SeqCst);
        for policy in &self.policies {
            policy.reset();
        }
    }

    fn record_success(&self) {
        for policy in &self.policies {
            policy.record_success();
        }
    }

    fn record_failure(&self) {
        for policy in &self.policies {
            policy.record_failure();
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are refused until the timeout elapses.
    Open,
    /// Probing recovery with a doubled base delay.
    HalfOpen,
}

struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Wraps a base policy with three-state failure protection.
///
/// State lives inside the policy value; two consumers with their own
/// policies trip independently.
pub struct CircuitBreakerPolicy {
    inner: Arc<dyn RetryPolicy>,
    failure_threshold: u32,
    timeout: Duration,
    breaker: Mutex<BreakerInner>,
}

impl CircuitBreakerPolicy {
    pub fn new(inner: Arc<dyn RetryPolicy>, failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            inner,
            failure_threshold,
            timeout,
            breaker: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.breaker.lock().unwrap().state
    }

    /// Transition OPEN -> HALF_OPEN once the timeout has elapsed.
    /// Returns the state after the transition check.
    fn current_state(&self) -> CircuitState {
        let mut inner = self.breaker.lock().unwrap();
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .map(|at| at.elapsed() >= self.timeout)
                .unwrap_or(true)
        {
            inner.state = CircuitState::HalfOpen;
            info!("circuit breaker half-open, probing recovery");
        }
        inner.state
    }
}

impl RetryPolicy for CircuitBreakerPolicy {
    fn should_retry(&self, attempt: u32, err: Option<&QueueError>) -> bool {
        match self.current_state() {
            CircuitState::Open => false,
            CircuitState::Closed | CircuitState::HalfOpen => self.inner.should_retry(attempt, err),
        }
    }

    fn calculate_delay(&self, attempt: u32, err: Option<&QueueError>) -> Option<Duration> {
        match self.current_state() {
            CircuitState::Open => None,
            CircuitState::Closed => self.inner.calculate_delay(attempt, err),
            // Probe cautiously: double the base strategy's delay.
            CircuitState::HalfOpen => self.inner.calculate_delay(attempt, err).map(|d| d * 2),
        }
    }

    fn reset(&self) {
        let mut inner = self.breaker.lock().unwrap();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        self.inner.reset();
    }

    fn record_success(&self) {
        let mut inner = self.breaker.lock().unwrap();
        match inner.state {
            CircuitState::Closed => inner.consecutive_failures = 0,
            CircuitState::HalfOpen | CircuitState::Open => {
                inner.state = CircuitState::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                info!("circuit breaker closed");
            }
        }
        self.inner.record_success();
    }

    fn record_failure(&self) {
        let mut inner = self.breaker.lock().unwrap();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(
                        failures = inner.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!("circuit breaker reopened from half-open");
            }
            CircuitState::Open => {}
        }
        self.inner.record_failure();
    }
}

/// Binds a policy to a fallible async operation.
pub struct RetryExecutor {
    policy: Arc<dyn RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<dyn RetryPolicy> {
        &self.policy
    }

    /// Run `op` until it succeeds or the policy gives up; the last captured
    /// error is surfaced.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt: u32 = 1;
        loop {
            match op().await {
                Ok(value) => {
                    self.policy.record_success();
                    return Ok(value);
                }
                Err(err) => {
                    self.policy.record_failure();
                    match self.policy.calculate_delay(attempt, Some(&err)) {
                        Some(delay) => {
                            tracing::debug!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %err,
                                "retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                            attempt += 1;
                        }
                        None => return Err(err),
                    }
                }
            }
        }
    }
}

/// Registered strategy names.
static STRATEGY_NAMES: Lazy<HashMap<&'static str, RetryStrategyKind>> = Lazy::new(|| {
    HashMap::from([
        ("fixed", RetryStrategyKind::Fixed),
        ("linear", RetryStrategyKind::Linear),
        ("exponential", RetryStrategyKind::Exponential),
        ("circuit-breaker", RetryStrategyKind::CircuitBreaker),
    ])
});

/// Build a policy from a registered strategy name.
pub fn policy_from_name(name: &str, config: RetryConfig) -> Option<Arc<dyn RetryPolicy>> {
    let kind = STRATEGY_NAMES.get(name)?;
    Some(config.with_strategy(*kind).build())
}

/// Production defaults: exponential, 5 attempts, 1 s base capped at 30 s,
/// jitter on, configuration/validation/authn/authz failures never retried.
pub fn production_policy() -> Arc<dyn RetryPolicy> {
    RetryConfig::default()
        .with_strategy(RetryStrategyKind::Exponential)
        .with_max_attempts(5)
        .with_base_delay_ms(1000)
        .with_max_delay_ms(30_000)
        .with_jitter(true)
        .with_non_retryable(&[
            "validation",
            "configuration",
            "invalid_queue_name",
            "authentication",
            "permission",
            "serialization",
            "deserialization",
        ])
        .build()
}

/// Development defaults: fixed 500 ms, 3 attempts, no jitter.
pub fn development_policy() -> Arc<dyn RetryPolicy> {
    RetryConfig::default()
        .with_strategy(RetryStrategyKind::Fixed)
        .with_max_attempts(3)
        .with_base_delay_ms(500)
        .with_jitter(false)
        .build()
}

/// Apply ±25 % jitter to a delay, floored at 0.
fn apply_jitter(delay_ms: u64) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    let hash = hasher.finish();

    let jitter_range = delay_ms / 4;
    if jitter_range == 0 {
        return delay_ms;
    }

    let random_offset = (hash % (jitter_range * 2 + 1)) as i64 - jitter_range as i64;
    if random_offset < 0 {
        delay_ms.saturating_sub((-random_offset) as u64)
    } else {
        delay_ms.saturating_add(random_offset as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exponential(max_attempts: u32, base_ms: u64, max_ms: u64) -> ExponentialBackoff {
        ExponentialBackoff::new(
            RetryConfig::default()
                .with_max_attempts(max_attempts)
                .with_base_delay_ms(base_ms)
                .with_max_delay_ms(max_ms)
                .with_jitter(false),
        )
    }

    #[test]
    fn test_no_retry_means_no_delay() {
        // should_retry false must imply calculate_delay None, for every strategy
        let policies: Vec<Arc<dyn RetryPolicy>> = vec![
            Arc::new(FixedDelay::new(RetryConfig::default().with_max_attempts(3))),
            Arc::new(LinearBackoff::new(RetryConfig::default().with_max_attempts(3))),
            Arc::new(exponential(3, 1000, 30_000)),
        ];
        for policy in policies {
            assert!(!policy.should_retry(3, None));
            assert!(policy.calculate_delay(3, None).is_none());
            assert!(policy.should_retry(2, None));
            assert!(policy.calculate_delay(2, None).is_some());
        }
    }

    #[test]
    fn test_exponential_delay_formula() {
        // min(B * 2^(a-1), M) with multiplier 1 and no jitter
        let policy = exponential(10, 1000, 30_000);
        assert_eq!(
            policy.calculate_delay(1, None),
            Some(Duration::from_millis(1000))
        );
        assert_eq!(
            policy.calculate_delay(2, None),
            Some(Duration::from_millis(2000))
        );
        assert_eq!(
            policy.calculate_delay(3, None),
            Some(Duration::from_millis(4000))
        );
        // capped at max_delay
        assert_eq!(
            policy.calculate_delay(9, None),
            Some(Duration::from_millis(30_000))
        );
    }

    #[test]
    fn test_linear_delay_formula() {
        let policy = LinearBackoff::new(
            RetryConfig::default()
                .with_max_attempts(10)
                .with_base_delay_ms(100)
                .with_multiplier(2.0)
                .with_jitter(false),
        );
        assert_eq!(
            policy.calculate_delay(3, None),
            Some(Duration::from_millis(600))
        );
    }

    #[test]
    fn test_fixed_delay() {
        let policy = FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay_ms(250)
                .with_jitter(false),
        );
        assert_eq!(
            policy.calculate_delay(1, None),
            Some(Duration::from_millis(250))
        );
        assert_eq!(
            policy.calculate_delay(4, None),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_non_retryable_kind_blocks_retry() {
        let policy = FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_non_retryable(&["validation"]),
        );
        let err = QueueError::Validation("bad payload".into());
        assert!(!policy.should_retry(1, Some(&err)));
        assert!(policy.calculate_delay(1, Some(&err)).is_none());

        let err = QueueError::Timeout("slow".into());
        assert!(policy.should_retry(1, Some(&err)));
    }

    #[test]
    fn test_retryable_set_is_exclusive() {
        let policy = FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_retryable(&["timeout", "connection"]),
        );
        assert!(policy.should_retry(1, Some(&QueueError::Timeout("x".into()))));
        assert!(!policy.should_retry(1, Some(&QueueError::Handler("x".into()))));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ExponentialBackoff::new(
            RetryConfig::default()
                .with_max_attempts(10)
                .with_base_delay_ms(1000)
                .with_max_delay_ms(30_000)
                .with_jitter(true),
        );
        for _ in 0..50 {
            let delay = policy.calculate_delay(1, None).unwrap().as_millis() as u64;
            assert!((750..=1250).contains(&delay), "delay {delay} out of bounds");
        }
    }

    #[test]
    fn test_custom_backoff() {
        let policy = CustomBackoff::new(
            RetryConfig::default().with_max_attempts(5).with_jitter(false),
            |attempt, _| Some(attempt as u64 * 10),
        );
        assert_eq!(
            policy.calculate_delay(3, None),
            Some(Duration::from_millis(30))
        );
        assert!(policy.calculate_delay(5, None).is_none());
    }

    #[test]
    fn test_composite_advances_on_exhaustion() {
        let first: Arc<dyn RetryPolicy> = Arc::new(FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_base_delay_ms(10)
                .with_jitter(false),
        ));
        let second: Arc<dyn RetryPolicy> = Arc::new(FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay_ms(99)
                .with_jitter(false),
        ));
        let composite = CompositeBackoff::new(vec![first, second]);

        // first policy serves attempt 1
        assert_eq!(
            composite.calculate_delay(1, None),
            Some(Duration::from_millis(10))
        );
        // attempt 2 exhausts the first, composite advances to the second
        assert_eq!(
            composite.calculate_delay(2, None),
            Some(Duration::from_millis(99))
        );
        // attempt 5 exhausts the second too
        assert!(composite.calculate_delay(5, None).is_none());

        composite.reset();
        assert_eq!(
            composite.calculate_delay(1, None),
            Some(Duration::from_millis(10))
        );
    }

    #[test]
    fn test_circuit_breaker_opens_after_threshold() {
        let policy = CircuitBreakerPolicy::new(
            Arc::new(exponential(10, 10, 1000)),
            3,
            Duration::from_secs(60),
        );
        assert_eq!(policy.state(), CircuitState::Closed);

        policy.record_failure();
        policy.record_failure();
        assert_eq!(policy.state(), CircuitState::Closed);
        assert!(policy.should_retry(1, None));

        policy.record_failure();
        assert_eq!(policy.state(), CircuitState::Open);
        assert!(!policy.should_retry(1, None));
        assert!(policy.calculate_delay(1, None).is_none());
    }

    #[test]
    fn test_circuit_breaker_half_open_after_timeout() {
        let policy = CircuitBreakerPolicy::new(
            Arc::new(exponential(10, 100, 10_000)),
            1,
            Duration::from_millis(0),
        );
        policy.record_failure();
        // zero timeout: next check transitions straight to half-open
        assert!(policy.should_retry(1, None));
        assert_eq!(policy.state(), CircuitState::HalfOpen);

        // half-open doubles the base delay
        assert_eq!(
            policy.calculate_delay(1, None),
            Some(Duration::from_millis(200))
        );

        // one failure in half-open reopens
        policy.record_failure();
        assert_eq!(policy.state(), CircuitState::Open);
    }

    #[test]
    fn test_circuit_breaker_success_closes() {
        let policy = CircuitBreakerPolicy::new(
            Arc::new(exponential(10, 100, 10_000)),
            1,
            Duration::from_millis(0),
        );
        policy.record_failure();
        policy.should_retry(1, None); // trip into half-open
        assert_eq!(policy.state(), CircuitState::HalfOpen);

        policy.record_success();
        assert_eq!(policy.state(), CircuitState::Closed);
    }

    #[test]
    fn test_success_resets_consecutive_failures() {
        let policy = CircuitBreakerPolicy::new(
            Arc::new(exponential(10, 100, 10_000)),
            3,
            Duration::from_secs(60),
        );
        policy.record_failure();
        policy.record_failure();
        policy.record_success();
        policy.record_failure();
        policy.record_failure();
        // never hit 3 consecutive, stays closed
        assert_eq!(policy.state(), CircuitState::Closed);
    }

    #[test]
    fn test_policy_from_name() {
        assert!(policy_from_name("fixed", RetryConfig::default()).is_some());
        assert!(policy_from_name("linear", RetryConfig::default()).is_some());
        assert!(policy_from_name("exponential", RetryConfig::default()).is_some());
        assert!(policy_from_name("circuit-breaker", RetryConfig::default()).is_some());
        assert!(policy_from_name("quadratic", RetryConfig::default()).is_none());
    }

    #[tokio::test]
    async fn test_executor_retries_until_success() {
        let policy = FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay_ms(1)
                .with_jitter(false),
        );
        let executor = RetryExecutor::new(Arc::new(policy));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let result = executor
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(QueueError::Timeout("transient".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_executor_surfaces_last_error() {
        let policy = FixedDelay::new(
            RetryConfig::default()
                .with_max_attempts(2)
                .with_base_delay_ms(1)
                .with_jitter(false),
        );
        let executor = RetryExecutor::new(Arc::new(policy));
        let calls = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = executor
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(QueueError::Timeout("still down".into()))
                }
            })
            .await;

        assert!(matches!(result, Err(QueueError::Timeout(_))));
        // attempt 1 fails, one retry, attempt 2 fails, policy gives up
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
