//! Health probing: one bounded retry-with-backoff GET per endpoint, driving
//! breaker transitions and the rolling history.

use super::state::{now_nanos, EndpointState, HealthSample};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::warn;

const INITIAL_BACKOFF: Duration = Duration::from_millis(150);
const BACKOFF_FACTOR: f64 = 1.5;
const MAX_BACKOFF: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Success,
    Failed,
    /// Caller cancelled mid-probe; no endpoint state was changed.
    Cancelled,
}

fn probe_attempts(recovery_successes: u32) -> u32 {
    recovery_successes.clamp(2, 5)
}

/// One probe: GET the ping URL with bounded retries, stopping at the first
/// success. Success clears both health streaks and the breaker; exhaustion
/// records the last error and advances the breaker streak.
pub async fn probe_endpoint(ep: &EndpointState, cancel: &CancellationToken) -> ProbeOutcome {
    let attempts = probe_attempts(ep.cfg.recovery_successes);
    let mut delay = INITIAL_BACKOFF;
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return ProbeOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = delay.mul_f64(BACKOFF_FACTOR).min(MAX_BACKOFF);
        }
        if cancel.is_cancelled() {
            return ProbeOutcome::Cancelled;
        }

        let started = Instant::now();
        match ep.probe_http.get(ep.cfg.health_ping_url.as_str()).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 400 {
                    ep.record_probe_success(HealthSample {
                        at: now_nanos(),
                        success: true,
                        status_code: status,
                        latency_ms: started.elapsed().as_millis() as i64,
                        error: String::new(),
                    });
                    return ProbeOutcome::Success;
                }
                last_error = format!("status={status}");
            }
            Err(err) => last_error = err.to_string(),
        }
    }

    if cancel.is_cancelled() {
        return ProbeOutcome::Cancelled;
    }

    let fail_streak = ep.record_probe_failure(HealthSample {
        at: now_nanos(),
        success: false,
        status_code: 0,
        latency_ms: 0,
        error: last_error.clone(),
    });
    warn!(
        name = %ep.cfg.name,
        provider = %ep.cfg.provider,
        attempts,
        fail_streak,
        error = %last_error,
        "health probe failed"
    );
    ProbeOutcome::Failed
}

/// One prober tick: walk the snapshot sequentially and probe every endpoint
/// that has a ping URL. Failures stay in the health state; they never
/// propagate.
pub async fn run_health_check_once(snapshot: &[Arc<EndpointState>], cancel: &CancellationToken) {
    for ep in snapshot {
        if cancel.is_cancelled() {
            return;
        }
        if ep.cfg.health_ping_url.is_empty() {
            continue;
        }
        ep.last_ping_at.store(now_nanos(), Ordering::Release);
        let _ = probe_endpoint(ep, cancel).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::MockClient;
    use crate::storage::ProviderConfig;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(ping_url: String, max_error_streak: u32, recovery_successes: u32) -> EndpointState {
        EndpointState::new(
            ProviderConfig {
                health_ping_url: ping_url,
                max_error_streak,
                recovery_successes,
                health_timeout_seconds: 1,
                ..Default::default()
            },
            Arc::new(MockClient),
            now_nanos(),
        )
    }

    #[test]
    fn attempts_are_clamped_between_two_and_five() {
        assert_eq!(probe_attempts(0), 2);
        assert_eq!(probe_attempts(1), 2);
        assert_eq!(probe_attempts(3), 3);
        assert_eq!(probe_attempts(9), 5);
    }

    #[tokio::test]
    async fn successful_probe_records_sample_and_clears_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let ep = endpoint(format!("{}/ping", server.uri()), 2, 2);
        ep.breaker_open.store(true, Ordering::Release);

        let outcome = probe_endpoint(&ep, &CancellationToken::new()).await;
        assert_eq!(outcome, ProbeOutcome::Success);
        assert!(!ep.is_breaker_open());

        let history = ep.health_history_snapshot();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].status_code, 200);
    }

    #[tokio::test]
    async fn exhausted_probe_opens_breaker_at_threshold() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ping"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let ep = endpoint(format!("{}/ping", server.uri()), 2, 2);

        assert_eq!(
            probe_endpoint(&ep, &CancellationToken::new()).await,
            ProbeOutcome::Failed
        );
        assert!(!ep.is_breaker_open());
        assert_eq!(
            probe_endpoint(&ep, &CancellationToken::new()).await,
            ProbeOutcome::Failed
        );
        assert!(ep.is_breaker_open());

        let history = ep.health_history_snapshot();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].error, "status=503");
    }

    #[tokio::test]
    async fn cancelled_probe_leaves_state_untouched() {
        let ep = endpoint("http://127.0.0.1:9/ping".to_string(), 1, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(probe_endpoint(&ep, &cancel).await, ProbeOutcome::Cancelled);
        assert_eq!(ep.health_failed_streak.load(Ordering::Acquire), 0);
        assert!(ep.health_history_snapshot().is_empty());
    }

    #[tokio::test]
    async fn tick_skips_endpoints_without_ping_url() {
        let ep = Arc::new(endpoint(String::new(), 2, 2));
        run_health_check_once(&[ep.clone()], &CancellationToken::new()).await;
        assert_eq!(ep.last_ping_at.load(Ordering::Acquire), 0);
        assert!(ep.health_history_snapshot().is_empty());
    }
}
