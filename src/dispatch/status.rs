//! Read-only operational view over the current snapshot, one record per
//! endpoint. Serialised as-is by the admin surface.

use super::state::{format_rfc3339, EndpointState, UnixNanos};
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub provider: String,
    pub model: String,
    pub enabled: bool,
    pub priority: i32,
    pub weight: i32,
    pub cooldown_seconds: i64,
    pub in_cooldown: bool,
    pub cooldown_remaining_seconds: i64,
    pub total_requests: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub last_latency_ms: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error_at: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_error: String,
    pub in_breaker_open: bool,
    pub health_failed_streak: u32,
    pub health_success_streak: u32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_ping_at: String,
    pub health_score: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub health_history: Vec<HealthSampleView>,
    pub rate_window_start: i64,
    pub rate_window_count: i64,
    pub rate_limit_per_min: i32,
    pub rate_limit_burst: i32,
    pub rate_tokens_remaining: f64,
    pub rate_bucket_capacity: f64,
    pub rate_refill_per_sec: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSampleView {
    pub at: String,
    pub success: bool,
    #[serde(skip_serializing_if = "is_zero_u16")]
    pub status_code: u16,
    #[serde(skip_serializing_if = "is_zero_i64")]
    pub latency_ms: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero_u16(v: &u16) -> bool {
    *v == 0
}
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Project every endpoint in the snapshot. The health history is copied
/// under its mutex; the bucket snapshot under the bucket mutex.
pub fn collect_status(snapshot: &[Arc<EndpointState>], now: UnixNanos) -> Vec<EndpointStatus> {
    snapshot.iter().map(|ep| endpoint_status(ep, now)).collect()
}

fn endpoint_status(ep: &EndpointState, now: UnixNanos) -> EndpointStatus {
    let cfg = &ep.cfg;

    let total = ep.stats.total_requests.load(Ordering::Acquire);
    let failures = ep.stats.failures.load(Ordering::Acquire);
    let success_rate = if total > 0 {
        (total - failures.min(total)) as f64 / total as f64
    } else {
        0.0
    };

    let cooldown_until = ep.cooldown_until.load(Ordering::Acquire);
    let (in_cooldown, cooldown_remaining_seconds) = if cooldown_until > 0 && now < cooldown_until {
        (true, (cooldown_until - now) / NANOS_PER_SEC)
    } else {
        (false, 0)
    };

    let history = ep.health_history_snapshot();
    let health_score = if history.is_empty() {
        0.0
    } else {
        history.iter().filter(|s| s.success).count() as f64 / history.len() as f64
    };
    let health_history = history
        .into_iter()
        .map(|s| HealthSampleView {
            at: format_rfc3339(s.at),
            success: s.success,
            status_code: s.status_code,
            latency_ms: s.latency_ms,
            error: s.error,
        })
        .collect();

    let (rate_window_start, rate_window_count) = ep.bucket.window();

    EndpointStatus {
        name: cfg.name.clone(),
        provider: cfg.provider.to_string(),
        model: cfg.model.clone(),
        enabled: cfg.enabled,
        priority: cfg.priority,
        weight: cfg.weight,
        cooldown_seconds: cfg.cooldown_seconds,
        in_cooldown,
        cooldown_remaining_seconds,
        total_requests: total,
        failures,
        success_rate,
        last_latency_ms: ep.stats.last_latency_ms.load(Ordering::Acquire),
        last_error_at: format_rfc3339(ep.stats.last_error_at.load(Ordering::Acquire)),
        last_error: ep.last_error(),
        in_breaker_open: ep.is_breaker_open(),
        health_failed_streak: ep.health_failed_streak.load(Ordering::Acquire),
        health_success_streak: ep.health_success_streak.load(Ordering::Acquire),
        last_ping_at: format_rfc3339(ep.last_ping_at.load(Ordering::Acquire)),
        health_score,
        health_history,
        rate_window_start,
        rate_window_count,
        rate_limit_per_min: cfg.rate_limit_per_min,
        rate_limit_burst: cfg.rate_limit_burst,
        rate_tokens_remaining: ep.bucket.tokens_remaining(),
        rate_bucket_capacity: ep.bucket.capacity(),
        rate_refill_per_sec: ep.bucket.refill_per_sec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::dispatch::state::now_nanos;
    use crate::storage::ProviderConfig;

    const SEC: UnixNanos = 1_000_000_000;

    fn endpoint(cfg: ProviderConfig) -> Arc<EndpointState> {
        Arc::new(EndpointState::new(cfg, Arc::new(MockClient), 0))
    }

    #[test]
    fn success_rate_and_cooldown_projection() {
        let ep = endpoint(ProviderConfig {
            name: "e".to_string(),
            cooldown_seconds: 30,
            max_error_streak: 100,
            ..Default::default()
        });
        ep.record_dispatch_success(12, 0);
        ep.record_dispatch_failure("boom", 10 * SEC);

        let status = endpoint_status(&ep, 15 * SEC);
        assert_eq!(status.total_requests, 2);
        assert_eq!(status.failures, 1);
        assert_eq!(status.success_rate, 0.5);
        assert!(status.in_cooldown);
        assert_eq!(status.cooldown_remaining_seconds, 25);
        assert_eq!(status.last_error, "boom");

        // After the deadline the cooldown no longer reports.
        let status = endpoint_status(&ep, 50 * SEC);
        assert!(!status.in_cooldown);
        assert_eq!(status.cooldown_remaining_seconds, 0);
    }

    #[test]
    fn health_score_over_history() {
        let ep = endpoint(ProviderConfig {
            max_error_streak: 100,
            ..Default::default()
        });
        for success in [true, true, false, true] {
            let sample = crate::dispatch::state::HealthSample {
                at: now_nanos(),
                success,
                status_code: if success { 200 } else { 0 },
                latency_ms: 1,
                error: String::new(),
            };
            if success {
                ep.record_probe_success(sample);
            } else {
                ep.record_probe_failure(sample);
            }
        }
        let status = endpoint_status(&ep, now_nanos());
        assert_eq!(status.health_score, 0.75);
        assert_eq!(status.health_history.len(), 4);
    }

    #[test]
    fn bucket_fields_reflect_config() {
        let ep = endpoint(ProviderConfig {
            rate_limit_per_min: 60,
            rate_limit_burst: 10,
            ..Default::default()
        });
        let status = endpoint_status(&ep, 0);
        assert_eq!(status.rate_bucket_capacity, 70.0);
        assert_eq!(status.rate_refill_per_sec, 1.0);
        assert_eq!(status.rate_tokens_remaining, 70.0);
    }
}
