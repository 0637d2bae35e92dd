//! Per-endpoint mutable runtime state and its transition rules.
//!
//! Scalar fields are atomics so concurrent dispatches, the background prober
//! and the status view never block each other; the token bucket and the
//! health history each sit behind their own small mutex. Two failure streaks
//! deliberately coexist: `health_failed_streak` drives the breaker,
//! `stats.failure_streak` drives cooldown growth.

use super::bucket::TokenBucket;
use crate::clients::{ClientConfig, UpstreamClient};
use crate::storage::ProviderConfig;
use chrono::{DateTime, SecondsFormat};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Wall-clock unix nanoseconds; 0 means "never".
pub type UnixNanos = i64;

const NANOS_PER_SEC: i64 = 1_000_000_000;
const MAX_COOLDOWN: Duration = Duration::from_secs(300);
const MIN_COOLDOWN_BASE_SECS: i64 = 30;

pub(crate) const HEALTH_HISTORY_CAP: usize = 10;

pub fn now_nanos() -> UnixNanos {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// RFC 3339 UTC, empty for the zero timestamp.
pub fn format_rfc3339(nanos: UnixNanos) -> String {
    if nanos <= 0 {
        return String::new();
    }
    DateTime::from_timestamp(nanos / NANOS_PER_SEC, (nanos % NANOS_PER_SEC) as u32)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

/// One health-probe observation.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub at: UnixNanos,
    pub success: bool,
    pub status_code: u16,
    pub latency_ms: i64,
    pub error: String,
}

/// Dispatch counters. `failure_streak` is distinct from the health streak;
/// it resets on upstream success and feeds the cooldown ladder.
#[derive(Debug, Default)]
pub struct EndpointStats {
    pub total_requests: AtomicU64,
    pub failures: AtomicU64,
    pub last_error_at: AtomicI64,
    pub last_latency_ms: AtomicI64,
    pub failure_streak: AtomicU32,
    pub last_error: Mutex<String>,
}

pub struct EndpointState {
    pub cfg: ProviderConfig,
    pub client: Arc<dyn UpstreamClient>,
    /// Probe transport, bounded by the endpoint's health timeout.
    pub(crate) probe_http: reqwest::Client,

    pub cooldown_until: AtomicI64,
    pub breaker_open: AtomicBool,
    pub health_failed_streak: AtomicU32,
    pub health_success_streak: AtomicU32,
    pub last_ping_at: AtomicI64,

    pub stats: EndpointStats,
    pub bucket: TokenBucket,
    health_history: Mutex<Vec<HealthSample>>,
}

impl std::fmt::Debug for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointState")
            .field("name", &self.cfg.name)
            .field("provider", &self.cfg.provider)
            .finish_non_exhaustive()
    }
}

impl EndpointState {
    pub fn new(cfg: ProviderConfig, client: Arc<dyn UpstreamClient>, now: UnixNanos) -> Self {
        let probe_http = reqwest::Client::builder()
            .timeout(health_timeout(&cfg))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let bucket = TokenBucket::new(cfg.rate_limit_per_min, cfg.rate_limit_burst, now);
        Self {
            cfg,
            client,
            probe_http,
            cooldown_until: AtomicI64::new(0),
            breaker_open: AtomicBool::new(false),
            health_failed_streak: AtomicU32::new(0),
            health_success_streak: AtomicU32::new(0),
            last_ping_at: AtomicI64::new(0),
            stats: EndpointStats::default(),
            bucket,
            health_history: Mutex::new(Vec::new()),
        }
    }

    /// A zero priority reads as the 100 default.
    pub fn effective_priority(&self) -> i32 {
        if self.cfg.priority == 0 {
            100
        } else {
            self.cfg.priority
        }
    }

    /// Non-positive weights read as the 100 default.
    pub fn effective_weight(&self) -> i64 {
        if self.cfg.weight <= 0 {
            100
        } else {
            self.cfg.weight as i64
        }
    }

    pub fn health_timeout_nanos(&self) -> i64 {
        self.cfg.health_timeout_seconds.max(1) * NANOS_PER_SEC
    }

    pub fn is_breaker_open(&self) -> bool {
        self.breaker_open.load(Ordering::Acquire)
    }

    pub fn is_cooling(&self, now: UnixNanos) -> bool {
        let until = self.cooldown_until.load(Ordering::Acquire);
        until > 0 && now < until
    }

    fn set_breaker(&self, open: bool) {
        if self.breaker_open.swap(open, Ordering::AcqRel) != open {
            tracing::info!(
                name = %self.cfg.name,
                provider = %self.cfg.provider,
                open,
                "endpoint breaker transition"
            );
            metrics::gauge!(
                "switchboard_breaker_open",
                "endpoint" => self.cfg.name.clone()
            )
            .set(if open { 1.0 } else { 0.0 });
        }
    }

    /// Upstream call succeeded. Resets the cooldown streak, stamps latency
    /// and ping time, and walks half-open probation toward closing the
    /// breaker.
    pub fn record_dispatch_success(&self, latency_ms: i64, now: UnixNanos) {
        self.stats.total_requests.fetch_add(1, Ordering::AcqRel);
        self.stats.failure_streak.store(0, Ordering::Release);
        self.stats
            .last_latency_ms
            .store(latency_ms.max(0), Ordering::Release);
        self.last_ping_at.store(now, Ordering::Release);

        if self.is_breaker_open() {
            let successes = self.health_success_streak.fetch_add(1, Ordering::AcqRel) + 1;
            if successes >= self.cfg.recovery_successes.max(1) {
                self.set_breaker(false);
                self.health_failed_streak.store(0, Ordering::Release);
                self.health_success_streak.store(0, Ordering::Release);
            }
        } else {
            self.health_failed_streak.store(0, Ordering::Release);
        }
    }

    /// Upstream call failed. Advances both streaks, opens the breaker at the
    /// threshold and computes the next cooldown: base doubling per
    /// consecutive failure, capped at five minutes.
    pub fn record_dispatch_failure(&self, error: &str, now: UnixNanos) -> Duration {
        self.stats.total_requests.fetch_add(1, Ordering::AcqRel);
        self.stats.failures.fetch_add(1, Ordering::AcqRel);
        self.stats.last_error_at.store(now, Ordering::Release);
        *self.stats.last_error.lock().unwrap_or_else(|e| e.into_inner()) = error.to_string();

        self.health_success_streak.store(0, Ordering::Release);
        let failed = self.health_failed_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if failed >= self.cfg.max_error_streak.max(1) {
            self.set_breaker(true);
        }

        let base = self.cfg.cooldown_seconds.max(MIN_COOLDOWN_BASE_SECS);
        let streak = self
            .stats
            .failure_streak
            .fetch_add(1, Ordering::AcqRel)
            .saturating_add(1)
            .max(1);
        let factor = 1i64 << (streak - 1).min(3);
        let cooldown = Duration::from_secs((base * factor) as u64).min(MAX_COOLDOWN);
        self.cooldown_until
            .store(now + cooldown.as_nanos() as i64, Ordering::Release);
        cooldown
    }

    /// Probe succeeded: record the sample and clear streaks and breaker.
    pub fn record_probe_success(&self, sample: HealthSample) {
        self.push_health_sample(sample);
        self.health_failed_streak.store(0, Ordering::Release);
        self.health_success_streak.store(0, Ordering::Release);
        self.set_breaker(false);
    }

    /// Probe exhausted its attempts: record the failure and advance the
    /// breaker streak.
    pub fn record_probe_failure(&self, sample: HealthSample) -> u32 {
        self.health_success_streak.store(0, Ordering::Release);
        let failed = self.health_failed_streak.fetch_add(1, Ordering::AcqRel) + 1;
        if failed >= self.cfg.max_error_streak.max(1) {
            self.set_breaker(true);
        }
        self.push_health_sample(sample);
        failed
    }

    fn push_health_sample(&self, sample: HealthSample) {
        let mut history = self
            .health_history
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        history.push(sample);
        if history.len() > HEALTH_HISTORY_CAP {
            let drop = history.len() - HEALTH_HISTORY_CAP;
            history.drain(..drop);
        }
    }

    /// Copy taken under the history mutex to bound lock hold time.
    pub fn health_history_snapshot(&self) -> Vec<HealthSample> {
        self.health_history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn last_error(&self) -> String {
        self.stats
            .last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn health_timeout(cfg: &ProviderConfig) -> Duration {
    Duration::from_secs(cfg.health_timeout_seconds.max(1) as u64)
}

/// Build the wire-client config for an endpoint record.
pub fn client_config(cfg: &ProviderConfig) -> ClientConfig {
    ClientConfig {
        provider: cfg.provider,
        api_key: cfg.api_key.clone(),
        base_url: cfg.base_url.clone(),
        model: cfg.model.clone(),
        timeout: Duration::from_secs(cfg.timeout_seconds.max(0) as u64),
        anthropic_version: cfg.anthropic_version.clone(),
        gemini_endpoint: cfg.gemini_endpoint.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;

    const SEC: UnixNanos = 1_000_000_000;

    fn endpoint(cfg: ProviderConfig) -> EndpointState {
        EndpointState::new(cfg, Arc::new(MockClient), 0)
    }

    fn sample(success: bool) -> HealthSample {
        HealthSample {
            at: 0,
            success,
            status_code: if success { 200 } else { 0 },
            latency_ms: 1,
            error: if success { String::new() } else { "boom".to_string() },
        }
    }

    #[test]
    fn cooldown_ladder_doubles_up_to_factor_cap() {
        let ep = endpoint(ProviderConfig {
            cooldown_seconds: 30,
            max_error_streak: 100, // keep the breaker out of the way
            ..Default::default()
        });

        // Factor caps at 8, so a 30 s base never reaches the 5 min ceiling.
        let expected = [30, 60, 120, 240, 240, 240];
        for (i, secs) in expected.iter().enumerate() {
            let cd = ep.record_dispatch_failure("err", 0);
            assert_eq!(cd, Duration::from_secs(*secs), "failure {}", i + 1);
        }
        assert_eq!(ep.cooldown_until.load(Ordering::Acquire), 240 * SEC);
    }

    #[test]
    fn cooldown_is_capped_at_five_minutes() {
        let ep = endpoint(ProviderConfig {
            cooldown_seconds: 60,
            max_error_streak: 100,
            ..Default::default()
        });

        let expected = [60, 120, 240, 300];
        for (i, secs) in expected.iter().enumerate() {
            let cd = ep.record_dispatch_failure("err", 0);
            assert_eq!(cd, Duration::from_secs(*secs), "failure {}", i + 1);
        }
    }

    #[test]
    fn cooldown_base_is_floored_at_thirty_seconds() {
        let ep = endpoint(ProviderConfig {
            cooldown_seconds: 0,
            max_error_streak: 100,
            ..Default::default()
        });
        assert_eq!(ep.record_dispatch_failure("err", 0), Duration::from_secs(30));
    }

    #[test]
    fn success_resets_cooldown_streak() {
        let ep = endpoint(ProviderConfig {
            cooldown_seconds: 30,
            max_error_streak: 100,
            ..Default::default()
        });

        ep.record_dispatch_failure("err", 0);
        ep.record_dispatch_failure("err", 0);
        ep.record_dispatch_success(5, 0);
        // The ladder restarts at the base after a success.
        assert_eq!(ep.record_dispatch_failure("err", 0), Duration::from_secs(30));
    }

    #[test]
    fn failure_streak_opens_breaker() {
        let ep = endpoint(ProviderConfig {
            max_error_streak: 3,
            ..Default::default()
        });

        ep.record_dispatch_failure("err", 0);
        ep.record_dispatch_failure("err", 0);
        assert!(!ep.is_breaker_open());
        ep.record_dispatch_failure("err", 0);
        assert!(ep.is_breaker_open());
    }

    #[test]
    fn half_open_recovery_needs_recovery_successes() {
        let ep = endpoint(ProviderConfig {
            max_error_streak: 1,
            recovery_successes: 2,
            ..Default::default()
        });

        ep.record_dispatch_failure("err", 0);
        assert!(ep.is_breaker_open());

        ep.record_dispatch_success(1, 0);
        assert!(ep.is_breaker_open(), "one success is not enough");
        ep.record_dispatch_success(1, 0);
        assert!(!ep.is_breaker_open());
        assert_eq!(ep.health_failed_streak.load(Ordering::Acquire), 0);
        assert_eq!(ep.health_success_streak.load(Ordering::Acquire), 0);
    }

    #[test]
    fn probe_success_clears_breaker_immediately() {
        let ep = endpoint(ProviderConfig {
            max_error_streak: 2,
            ..Default::default()
        });

        ep.record_probe_failure(sample(false));
        ep.record_probe_failure(sample(false));
        assert!(ep.is_breaker_open());

        ep.record_probe_success(sample(true));
        assert!(!ep.is_breaker_open());
        assert_eq!(ep.health_failed_streak.load(Ordering::Acquire), 0);
    }

    #[test]
    fn health_history_is_bounded_to_ten() {
        let ep = endpoint(ProviderConfig {
            max_error_streak: 100,
            ..Default::default()
        });
        for i in 0..15 {
            let mut s = sample(false);
            s.latency_ms = i;
            ep.record_probe_failure(s);
        }
        let history = ep.health_history_snapshot();
        assert_eq!(history.len(), 10);
        // Oldest dropped: the first surviving sample is the sixth pushed.
        assert_eq!(history[0].latency_ms, 5);
    }

    #[test]
    fn rfc3339_formats_and_zero_is_empty() {
        assert_eq!(format_rfc3339(0), "");
        assert_eq!(format_rfc3339(1_700_000_000 * SEC), "2023-11-14T22:13:20Z");
    }
}
