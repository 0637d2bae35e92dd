//! The dispatcher: one logical chat request in, exactly one successful
//! upstream call out.
//!
//! A dispatch takes the registry snapshot once, selects the best-priority
//! candidate tier, picks a user-stable weighted starting position and walks
//! the candidates circularly exactly once. Each visit passes the breaker,
//! inline-ping and token-bucket gates before the upstream call; failures
//! advance the breaker and cooldown state and the walk continues.

use super::health::{self, ProbeOutcome};
use super::registry::EndpointRegistry;
use super::state::{now_nanos, EndpointState, UnixNanos};
use super::DispatchError;
use crate::clients::{ChatRequest, ChatResponse, ClientError, ProviderKind};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// A successful dispatch: the answer plus the endpoint identity and pricing
/// metadata the chat layer needs for cost accounting.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub response: ChatResponse,
    pub provider: ProviderKind,
    pub model: String,
    pub latency_ms: i64,
    pub input_price_per_1k: f64,
    pub output_price_per_1k: f64,
}

#[derive(Default)]
struct Lifecycle {
    started: bool,
    stopped: bool,
    cancel: Option<CancellationToken>,
    probe_task: Option<JoinHandle<()>>,
}

pub struct ProviderManager {
    registry: Arc<EndpointRegistry>,
    probe_interval: Duration,
    lifecycle: Mutex<Lifecycle>,
}

impl ProviderManager {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Spawn the background probe loop. Idempotent; refused after `stop`.
    pub fn start(&self) -> Result<(), DispatchError> {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
        if lifecycle.stopped {
            return Err(DispatchError::Lifecycle(
                "provider manager already stopped, cannot restart",
            ));
        }
        if lifecycle.started {
            return Ok(());
        }
        lifecycle.started = true;

        let cancel = CancellationToken::new();
        lifecycle.cancel = Some(cancel.clone());

        let registry = Arc::clone(&self.registry);
        let interval = self.probe_interval;
        lifecycle.probe_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let snapshot = match registry.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        debug!(%err, "health tick skipped");
                        continue;
                    }
                };
                health::run_health_check_once(&snapshot, &cancel).await;
            }
        }));
        Ok(())
    }

    /// Cancel the probe loop and wait for it to exit. Further starts are
    /// refused.
    pub async fn stop(&self) {
        let (cancel, task) = {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(|e| e.into_inner());
            if !lifecycle.started || lifecycle.stopped {
                return;
            }
            lifecycle.stopped = true;
            (lifecycle.cancel.take(), lifecycle.probe_task.take())
        };
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("provider manager stopped");
    }

    /// Dispatch one chat request for a user. Visits each candidate at most
    /// once; caller cancellation aborts the walk immediately and is never
    /// charged to an endpoint.
    pub async fn chat_for_user(
        &self,
        user_id: i64,
        request: &ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, DispatchError> {
        if request.system.is_empty() && request.messages.is_empty() {
            return Err(DispatchError::InvalidInput("chat request is empty"));
        }

        let snapshot = self.registry.snapshot().await?;
        if snapshot.is_empty() {
            return Err(DispatchError::NotConfigured);
        }

        let now = now_nanos();
        let mut candidates = primary_candidates(&snapshot, now);
        if candidates.is_empty() {
            candidates = fallback_candidates(&snapshot);
        }
        if candidates.is_empty() {
            return Err(DispatchError::NoAvailableEndpoint);
        }

        let start_pos = weighted_start(&snapshot, &candidates, user_id, now);
        let mut first_error: Option<ClientError> = None;

        for i in 0..candidates.len() {
            if cancel.is_cancelled() {
                return Err(DispatchError::Cancelled);
            }
            let ep = &snapshot[candidates[(start_pos + i) % candidates.len()]];
            let now = now_nanos();

            // Re-check the breaker mid-walk: a concurrent failure may have
            // opened it after selection. Fall through once the half-open
            // window has elapsed so the inline probe below can promote.
            if ep.is_breaker_open()
                && now - ep.last_ping_at.load(Ordering::Acquire) < ep.health_timeout_nanos()
            {
                continue;
            }

            // Inline ping, rate-limited by the health timeout window.
            if !ep.cfg.health_ping_url.is_empty()
                && now - ep.last_ping_at.load(Ordering::Acquire) > ep.health_timeout_nanos()
            {
                ep.last_ping_at.store(now_nanos(), Ordering::Release);
                match health::probe_endpoint(ep, cancel).await {
                    ProbeOutcome::Success => {}
                    ProbeOutcome::Failed => continue,
                    ProbeOutcome::Cancelled => return Err(DispatchError::Cancelled),
                }
            }

            // Token-bucket admission.
            if ep.cfg.rate_limit_per_min > 0 {
                if !ep.bucket.try_take(now_nanos()) {
                    metrics::counter!(
                        "switchboard_ratelimit_denied_total",
                        "endpoint" => ep.cfg.name.clone()
                    )
                    .increment(1);
                    continue;
                }
                ep.bucket.bump_window(now_nanos());
            }

            let started = Instant::now();
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(DispatchError::Cancelled),
                result = ep.client.chat(request) => result,
            };
            let latency_ms = started.elapsed().as_millis() as i64;

            match result {
                Ok(response) => {
                    ep.record_dispatch_success(latency_ms, now_nanos());
                    return Ok(ChatOutcome {
                        response,
                        provider: ep.cfg.provider,
                        model: ep.cfg.model.clone(),
                        latency_ms: latency_ms.max(0),
                        input_price_per_1k: ep.cfg.input_price_per_1k,
                        output_price_per_1k: ep.cfg.output_price_per_1k,
                    });
                }
                Err(err) => {
                    let cooldown = ep.record_dispatch_failure(&err.to_string(), now_nanos());
                    metrics::counter!(
                        "switchboard_endpoint_failures_total",
                        "endpoint" => ep.cfg.name.clone()
                    )
                    .increment(1);
                    warn!(
                        name = %ep.cfg.name,
                        provider = %ep.cfg.provider,
                        cooldown_secs = cooldown.as_secs(),
                        %err,
                        "endpoint failed, cooling down"
                    );
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(DispatchError::AllEndpointsFailed(err)),
            None => Err(DispatchError::NoConcreteError),
        }
    }
}

/// Primary pass: breaker closed and not cooling down; keep the ties at the
/// smallest priority value.
fn primary_candidates(endpoints: &[Arc<EndpointState>], now: UnixNanos) -> Vec<usize> {
    let mut min_priority = i32::MAX;
    let mut candidates = Vec::with_capacity(endpoints.len());

    for (i, ep) in endpoints.iter().enumerate() {
        if ep.is_breaker_open() || ep.is_cooling(now) {
            continue;
        }
        let priority = ep.effective_priority();
        if priority < min_priority {
            min_priority = priority;
            candidates.clear();
            candidates.push(i);
        } else if priority == min_priority {
            candidates.push(i);
        }
    }
    candidates
}

/// Fallback pass: ignore cooldown, still exclude open breakers.
fn fallback_candidates(endpoints: &[Arc<EndpointState>]) -> Vec<usize> {
    let mut min_priority = i32::MAX;
    for ep in endpoints {
        if ep.is_breaker_open() {
            continue;
        }
        min_priority = min_priority.min(ep.effective_priority());
    }

    endpoints
        .iter()
        .enumerate()
        .filter(|(_, ep)| !ep.is_breaker_open() && ep.effective_priority() == min_priority)
        .map(|(i, _)| i)
        .collect()
}

/// 64-bit MurmurHash3 finalizer.
fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// Deterministic weighted starting position within the candidate list. Same
/// user, same candidate set, same weights ⇒ same start; anonymous callers
/// fall back to the clock.
fn weighted_start(
    endpoints: &[Arc<EndpointState>],
    candidates: &[usize],
    user_id: i64,
    now: UnixNanos,
) -> usize {
    if candidates.is_empty() {
        return 0;
    }
    let total_weight: i64 = candidates
        .iter()
        .map(|&idx| endpoints[idx].effective_weight())
        .sum();
    if total_weight <= 0 {
        return 0;
    }

    let seed = if user_id > 0 { user_id } else { now } as u64;
    let mut point = (mix64(seed) % total_weight as u64) as i64;

    for (i, &idx) in candidates.iter().enumerate() {
        let weight = endpoints[idx].effective_weight();
        if point < weight {
            return i;
        }
        point -= weight;
    }
    0
}
