//! Outbound HTTP with per-call timeouts, retry with backoff, and a circuit breaker.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::config::HttpConfig;
use crate::error::{AppError, AppResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected until the cooldown has passed.
    Open,
    /// Cooldown passed; the next call is a probe.
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Consecutive-failure circuit breaker shared by every call to one upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    failure_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go out now. Moves an expired open circuit to half-open.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.cooldown);
                if expired {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit half-open; letting a probe request through");
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            tracing::info!("Circuit closed after successful probe");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == CircuitState::HalfOpen
            || inner.consecutive_failures >= self.failure_threshold;
        if trip && inner.state != CircuitState::Open {
            tracing::warn!(
                "Circuit opened after {} consecutive failures",
                inner.consecutive_failures
            );
        }
        if trip {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

/// A `reqwest::Client` wrapped with retry and circuit-breaking for one upstream service.
#[derive(Clone)]
pub struct ResilientClient {
    name: &'static str,
    client: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl ResilientClient {
    pub fn new(name: &'static str, config: &HttpConfig) -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .user_agent(concat!("yoga-calendar-sync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AppError::Internal(e.into()))?;

        Ok(Self {
            name,
            client,
            breaker: Arc::new(CircuitBreaker::new(
                config.circuit_failure_threshold,
                Duration::from_secs(config.circuit_cooldown_seconds),
            )),
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        })
    }

    /// Send a request, retrying network errors, 429 and 5xx responses.
    ///
    /// `make_request` is called once per attempt. Other statuses are returned to the
    /// caller untouched. An open circuit fails fast with `ServiceUnavailable`.
    pub async fn send<F>(&self, make_request: F) -> AppResult<Response>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        if !self.breaker.try_acquire() {
            return Err(AppError::ServiceUnavailable(format!(
                "{} is temporarily unavailable (circuit open)",
                self.name
            )));
        }

        let attempts = self.max_retries + 1;
        let mut backoff = self.initial_backoff;

        for attempt in 1..=attempts {
            match make_request(&self.client).send().await {
                Ok(resp) if is_transient(resp.status()) => {
                    let status = resp.status();
                    if attempt == attempts {
                        self.breaker.record_failure();
                        let body = resp.text().await.unwrap_or_default();
                        return Err(AppError::Upstream(format!(
                            "{} returned {} after {} attempts: {}",
                            self.name, status, attempt, body
                        )));
                    }

                    let wait = retry_after(&resp)
                        .map(|d| d.min(self.max_backoff))
                        .unwrap_or_else(|| with_jitter(backoff));
                    tracing::warn!(
                        "Transient {} error (status: {}). Retrying in {:?} (attempt {}/{})",
                        self.name,
                        status,
                        wait,
                        attempt,
                        attempts
                    );
                    tokio::time::sleep(wait).await;
                }
                Ok(resp) => {
                    self.breaker.record_success();
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt == attempts {
                        self.breaker.record_failure();
                        return Err(AppError::Request(e));
                    }
                    let wait = with_jitter(backoff);
                    tracing::warn!(
                        "{} request failed: {}. Retrying in {:?} (attempt {}/{})",
                        self.name,
                        e,
                        wait,
                        attempt,
                        attempts
                    );
                    tokio::time::sleep(wait).await;
                }
            }
            backoff = (backoff * 2).min(self.max_backoff);
        }

        Err(AppError::Upstream(format!(
            "Exceeded {} retry attempts",
            self.name
        )))
    }
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Add up to 50% random jitter.
fn with_jitter(base: Duration) -> Duration {
    let max_jitter = (base.as_millis() / 2) as u64;
    if max_jitter == 0 {
        return base;
    }
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}
