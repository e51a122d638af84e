//! Rate-limited, retrying HTTP fetcher used by the knowledge orchestrator.

use governor::{Quota, RateLimiter};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use rand::Rng;
use serde::Serialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::config::{Config, SsrfConfig};
use crate::url_guard;

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub endpoint_id: String,
    pub ok: bool,
    pub body: String,
    pub duration_ms: u64,
    pub confidence: f64,
    pub error: Option<String>,
}

pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    circuit_breakers: CircuitBreakerRegistry,
    ssrf: SsrfConfig,
    max_content_length: usize,
    max_response_chars: usize,
}

impl HttpFetcher {
    pub fn new(cfg: &Config) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(cfg.rate_limit.requests_per_minute).unwrap_or(NonZeroU32::new(1).unwrap()),
        );
        Self {
            client: reqwest::Client::builder()
                .user_agent(cfg.user_agent.clone())
                .build()
                .expect("reqwest client builds"),
            limiter: Arc::new(RateLimiter::direct(quota)),
            circuit_breakers: CircuitBreakerRegistry::default(),
            ssrf: cfg.ssrf.clone(),
            max_content_length: cfg.max_content_length,
            max_response_chars: cfg.knowledge.max_response_size,
        }
    }

    /// Fetches `endpoint_id`'s `url`, applying SSRF admission, the shared
    /// token bucket, the endpoint's circuit breaker and a bounded retry
    /// policy. Never returns `Err`: every failure is folded into a
    /// degraded `FetchResult`.
    pub async fn fetch(&self, endpoint_id: &str, url: &str, confidence_weight: f64, timeout: Duration) -> FetchResult {
        let start = std::time::Instant::now();

        if let Err(e) = url_guard::check_url(url, &self.ssrf, url_guard::resolve_host) {
            tracing::warn!(endpoint_id, url, error = %e, "ssrf guard blocked outbound fetch");
            return degraded(endpoint_id, start, "ssrf_blocked");
        }

        if self.circuit_breakers.check(endpoint_id).await.is_err() {
            tracing::warn!(endpoint_id, "circuit open, skipping fetch");
            return degraded(endpoint_id, start, "circuit_open");
        }

        self.limiter
            .until_ready_with_jitter(governor::Jitter::up_to(Duration::from_millis(50)))
            .await;

        const MAX_RETRIES: u32 = 2;
        let mut attempt = 0;
        loop {
            match self.try_once(endpoint_id, url, timeout).await {
                Ok(mut result) => {
                    result.confidence = if result.ok { confidence_weight } else { 0.0 };
                    result.duration_ms = start.elapsed().as_millis() as u64;
                    if result.ok {
                        self.circuit_breakers.record_success(endpoint_id).await;
                    } else {
                        self.circuit_breakers.record_failure(endpoint_id).await;
                    }
                    return truncate(result, self.max_response_chars);
                }
                Err(Retriable::No(msg)) => {
                    self.circuit_breakers.record_failure(endpoint_id).await;
                    let mut r = degraded(endpoint_id, start, &msg);
                    r.confidence = 0.0;
                    return r;
                }
                Err(Retriable::Yes(msg)) if attempt < MAX_RETRIES => {
                    attempt += 1;
                    let backoff_ms = (1000u64 * 2u64.pow(attempt - 1)).min(8000);
                    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
                    let delay_ms = (backoff_ms as f64 * (1.0 + jitter)).max(0.0) as u64;
                    tracing::info!(endpoint_id, attempt, delay_ms, error = %msg, "retrying fetch");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(Retriable::Yes(msg)) => {
                    self.circuit_breakers.record_failure(endpoint_id).await;
                    return degraded(endpoint_id, start, &msg);
                }
            }
        }
    }

    async fn try_once(&self, endpoint_id: &str, url: &str, timeout: Duration) -> Result<FetchResult, Retriable> {
        let resp = tokio::time::timeout(
            timeout,
            self.client
                .get(url)
                .header("Accept", "application/json, text/*")
                .send(),
        )
        .await
        .map_err(|_| Retriable::No("timeout".to_string()))?
        .map_err(|e| Retriable::Yes(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(Retriable::Yes(format!("http_{}", status.as_u16())));
        }
        if status.is_client_error() {
            return Err(Retriable::No(format!("http_{}", status.as_u16())));
        }

        let bytes = resp.bytes().await.map_err(|e| Retriable::Yes(e.to_string()))?;
        let truncated = &bytes[..bytes.len().min(self.max_content_length)];
        let body = String::from_utf8_lossy(truncated).to_string();

        Ok(FetchResult {
            endpoint_id: endpoint_id.to_string(),
            ok: true,
            body,
            duration_ms: 0,
            confidence: 0.0,
            error: None,
        })
    }
}

enum Retriable {
    Yes(String),
    No(String),
}

fn degraded(endpoint_id: &str, start: std::time::Instant, reason: &str) -> FetchResult {
    FetchResult {
        endpoint_id: endpoint_id.to_string(),
        ok: false,
        body: String::new(),
        duration_ms: start.elapsed().as_millis() as u64,
        confidence: 0.0,
        error: Some(reason.to_string()),
    }
}

fn truncate(mut result: FetchResult, max_chars: usize) -> FetchResult {
    if result.body.chars().count() > max_chars {
        result.body = result.body.chars().take(max_chars).collect();
    }
    result
}
