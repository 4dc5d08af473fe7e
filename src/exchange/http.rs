use governor::{Quota, RateLimiter};
use rand::Rng;
use reqwest::{Client, Method};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::models::ExchangeId;
use crate::{Result, TradeError};

type VenueRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Backoff for idempotent GETs.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), doubled per attempt and capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = (self.base_delay.as_millis() as u64 / 4).max(1);
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
    }
}

/// Shared REST plumbing for signed venues: rate limiting, timeouts,
/// status classification and GET retries.
#[derive(Clone)]
pub struct RestClient {
    venue: ExchangeId,
    base_url: String,
    client: Client,
    rate_limiter: Arc<VenueRateLimiter>,
    backoff: BackoffPolicy,
}

impl RestClient {
    pub fn new(
        venue: ExchangeId,
        base_url: &str,
        timeout: Duration,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TradeError::Validation(format!("failed to build HTTP client: {e}")))?;

        let rps = NonZeroU32::new(requests_per_second.max(1)).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            venue,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            rate_limiter,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn venue(&self) -> ExchangeId {
        self.venue
    }

    /// Sends one request and returns the raw body.
    ///
    /// GETs are retried on transient failure; everything else is sent once.
    /// `headers` is rebuilt per attempt so signed timestamps stay fresh.
    pub async fn send<H>(
        &self,
        method: Method,
        path: &str,
        query: Option<&str>,
        body: Option<&str>,
        headers: H,
    ) -> Result<String>
    where
        H: Fn() -> Vec<(&'static str, String)>,
    {
        let attempts = if method == Method::GET {
            self.backoff.max_attempts.max(1)
        } else {
            1
        };

        let mut last_err = TradeError::Transient("no attempt made".to_string());
        for attempt in 1..=attempts {
            match self.send_once(&method, path, query, body, headers()).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let delay = self.backoff.delay_for(attempt);
                    tracing::warn!(
                        exchange = %self.venue,
                        path,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient failure, retrying: {}",
                        e
                    );
                    tokio::time::sleep(delay).await;
                    last_err = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        query: Option<&str>,
        body: Option<&str>,
        headers: Vec<(&'static str, String)>,
    ) -> Result<String> {
        self.rate_limiter.until_ready().await;

        let url = match query {
            Some(q) if !q.is_empty() => format!("{}{}?{}", self.base_url, path, q),
            _ => format!("{}{}", self.base_url, path),
        };

        let mut req = self.client.request(method.clone(), &url);
        for (name, value) in headers {
            req = req.header(name, value);
        }
        if let Some(b) = body {
            req = req
                .header("Content-Type", "application/json")
                .body(b.to_string());
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return Ok(text);
        }
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(TradeError::Transient(format!(
                "{} {} returned {}",
                self.venue, path, status
            )));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(TradeError::Authentication(format!(
                "{} {} returned {}: {}",
                self.venue, path, status, text
            )));
        }
        Err(TradeError::ExchangeRejected {
            exchange: self.venue.to_string(),
            code: status.as_u16() as i64,
            message: text,
        })
    }
}
