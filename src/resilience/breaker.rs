//! Per-endpoint circuit breaker.
//!
//! One breaker per logical upstream endpoint (`values.get`,
//! `spreadsheets.batch_update`, …). State machine:
//!
//! - **closed** — calls pass; `failure_threshold` consecutive classified
//!   failures trips the breaker open.
//! - **open** — calls fail fast with `CIRCUIT_OPEN` until `next_attempt_at`,
//!   when a single probe is allowed through.
//! - **half_open** — at most one probe in flight; `success_threshold`
//!   consecutive probe successes close the breaker, any failure reopens it.
//!
//! All mutation is serialized per breaker behind a mutex. Acquisition hands
//! out a guard; a guard dropped without an explicit verdict (caller timed out
//! mid-call) releases the probe slot without moving the state machine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{ApiError, ErrorCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Call verdict fed back into the state machine. `Neutral` covers outcomes
/// that prove the endpoint reachable without being a success for retry
/// purposes (4xx validation errors and the like).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
    Neutral,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
    total_requests: AtomicU64,
    rejected_total: AtomicU64,
    fallback_usage: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_at: None,
                next_attempt_at: None,
                probe_in_flight: false,
            }),
            total_requests: AtomicU64::new(0),
            rejected_total: AtomicU64::new(0),
            fallback_usage: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().expect("breaker lock").state
    }

    /// Gate a call. Returns a guard that must be fed the call outcome.
    pub fn try_acquire(&self) -> Result<BreakerGuard<'_>, ApiError> {
        let mut inner = self.inner.lock().expect("breaker lock");
        match inner.state {
            BreakerState::Closed => {}
            BreakerState::Open => {
                let now = Instant::now();
                match inner.next_attempt_at {
                    Some(at) if now >= at => {
                        inner.state = BreakerState::HalfOpen;
                        inner.success_count = 0;
                        inner.probe_in_flight = true;
                        tracing::info!(breaker = %self.name, "circuit half-open, allowing probe");
                    }
                    _ => {
                        drop(inner);
                        self.rejected_total.fetch_add(1, Ordering::Relaxed);
                        return Err(self.open_error());
                    }
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    self.rejected_total.fetch_add(1, Ordering::Relaxed);
                    return Err(self.open_error());
                }
                inner.probe_in_flight = true;
            }
        }
        drop(inner);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        Ok(BreakerGuard {
            breaker: self,
            done: false,
        })
    }

    fn open_error(&self) -> ApiError {
        let retry_in = {
            let inner = self.inner.lock().expect("breaker lock");
            inner
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now()))
                .unwrap_or_default()
        };
        ApiError::new(
            ErrorCode::CircuitOpen,
            format!("circuit breaker {} is open", self.name),
        )
        .with_retry_strategy(format!("retry after {}ms", retry_in.as_millis()))
        .with_details(serde_json::json!({
            "breaker": self.name,
            "retry_after_ms": retry_in.as_millis() as u64,
        }))
    }

    fn finish(&self, outcome: Outcome) {
        let mut inner = self.inner.lock().expect("breaker lock");
        let was_probe = inner.probe_in_flight;
        inner.probe_in_flight = false;

        match (inner.state, outcome) {
            (BreakerState::Closed, Outcome::Success) | (BreakerState::Closed, Outcome::Neutral) => {
                inner.failure_count = 0;
            }
            (BreakerState::Closed, Outcome::Failure) => {
                inner.failure_count += 1;
                inner.last_failure_at = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            (BreakerState::HalfOpen, Outcome::Success) => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.next_attempt_at = None;
                    tracing::info!(breaker = %self.name, "circuit closed");
                }
            }
            (BreakerState::HalfOpen, Outcome::Failure) => {
                inner.state = BreakerState::Open;
                inner.success_count = 0;
                inner.last_failure_at = Some(Instant::now());
                inner.next_attempt_at = Some(Instant::now() + self.config.reset_timeout);
                tracing::warn!(breaker = %self.name, "probe failed, circuit reopened");
            }
            (BreakerState::HalfOpen, Outcome::Neutral) => {
                // Probe slot released (guard dropped mid-call); no transition.
                let _ = was_probe;
            }
            (BreakerState::Open, _) => {
                // A guard finishing after another path already reopened the
                // circuit; nothing to update.
            }
        }
    }

    /// Record that a fallback served this endpoint's caller.
    pub fn note_fallback(&self) {
        self.fallback_usage.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().expect("breaker lock");
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state.as_str(),
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure_secs_ago: inner.last_failure_at.map(|at| at.elapsed().as_secs()),
            next_attempt_in_ms: inner.next_attempt_at.map(|at| {
                at.saturating_duration_since(Instant::now()).as_millis() as u64
            }),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            fallback_usage_count: self.fallback_usage.load(Ordering::Relaxed),
        }
    }
}

/// Scoped call permit. `success`/`failure`/`neutral` consume the guard;
/// dropping it without a verdict frees the probe slot only.
#[derive(Debug)]
pub struct BreakerGuard<'a> {
    breaker: &'a CircuitBreaker,
    done: bool,
}

impl BreakerGuard<'_> {
    pub fn success(mut self) {
        self.done = true;
        self.breaker.finish(Outcome::Success);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.breaker.finish(Outcome::Failure);
    }

    pub fn neutral(mut self) {
        self.done = true;
        self.breaker.finish(Outcome::Neutral);
    }
}

impl Drop for BreakerGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.finish(Outcome::Neutral);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_secs_ago: Option<u64>,
    pub next_attempt_in_ms: Option<u64>,
    pub total_requests: u64,
    pub rejected_total: u64,
    pub fallback_usage_count: u64,
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Process-global breaker registry, one breaker per endpoint name.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(b) = self.breakers.read().expect("registry lock").get(name) {
            return Arc::clone(b);
        }
        let mut map = self.breakers.write().expect("registry lock");
        Arc::clone(
            map.entry(name.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone()))),
        )
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let map = self.breakers.read().expect("registry lock");
        let mut out: Vec<_> = map.values().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(reset: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "values.get",
            BreakerConfig {
                failure_threshold: 5,
                success_threshold: 2,
                reset_timeout: reset,
            },
        ))
    }

    #[test]
    fn opens_after_failure_threshold() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            b.try_acquire().unwrap().failure();
            assert_eq!(b.state(), BreakerState::Closed);
        }
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Open);

        let err = b.try_acquire().unwrap_err();
        assert_eq!(err.code, ErrorCode::CircuitOpen);
    }

    #[test]
    fn success_resets_failure_streak() {
        let b = breaker(Duration::from_secs(30));
        for _ in 0..4 {
            b.try_acquire().unwrap().failure();
        }
        b.try_acquire().unwrap().success();
        for _ in 0..4 {
            b.try_acquire().unwrap().failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn allows_single_probe_after_reset_timeout() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.try_acquire().unwrap().failure();
        }
        // Reset timeout already elapsed — the next acquire is the probe.
        let probe = b.try_acquire().unwrap();
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Concurrent second call is rejected while the probe is out.
        assert!(b.try_acquire().is_err());
        probe.success();
        // success_threshold = 2: one more successful probe closes it.
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.try_acquire().unwrap().success();
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn probe_failure_reopens() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.try_acquire().unwrap().failure();
        }
        b.try_acquire().unwrap().failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn dropped_guard_frees_probe_slot_without_transition() {
        let b = breaker(Duration::from_millis(0));
        for _ in 0..5 {
            b.try_acquire().unwrap().failure();
        }
        drop(b.try_acquire().unwrap()); // probe abandoned (e.g. deadline)
        assert_eq!(b.state(), BreakerState::HalfOpen);
        // Slot is free again for the next probe.
        assert!(b.try_acquire().is_ok());
    }

    #[test]
    fn registry_returns_same_instance() {
        let reg = BreakerRegistry::new(BreakerConfig::default());
        let a = reg.get("values.get");
        let b = reg.get("values.get");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.snapshots().len(), 1);
    }
}
