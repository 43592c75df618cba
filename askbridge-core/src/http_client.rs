use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{HttpCfg, RetryCfg};
use crate::error::{BridgeError, CoreResult};
use crate::model::CompletionChunk;
use crate::stream::{ByteSource, UpstreamResponse};

/// Request context carries the correlation id forwarded upstream.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

/// Exponential backoff with relative jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryCfg::default())
    }
}

impl From<&RetryCfg> for RetryPolicy {
    fn from(cfg: &RetryCfg) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            jitter: cfg.jitter.clamp(0.0, 1.0),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1) as i32);
        let factor = if self.jitter > 0.0 {
            1.0 + rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };
        Duration::from_secs_f64((exp * factor).max(0.0))
    }
}

/// Thin wrapper around reqwest::Client with pooling, retry and deadline handling.
/// Cloning shares the connection pool and the concurrency bound.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
    retry: RetryPolicy,
    slots: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::new(&HttpCfg::default(), RetryPolicy::default())
    }

    pub fn new(cfg: &HttpCfg, retry: RetryPolicy) -> CoreResult<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .tcp_keepalive(Duration::from_secs(60));
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| BridgeError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("askbridge/", env!("CARGO_PKG_VERSION")).to_string(),
            retry,
            slots: Arc::new(Semaphore::new(cfg.max_connections.max(1))),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Free concurrency slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// POST a completion request, retrying transient failures, all within `deadline`.
    ///
    /// With `stream == true` a successful response is handed back unread as a
    /// `ByteSource` that keeps its concurrency slot and deadline; otherwise the
    /// JSON body is read and decoded before returning.
    pub async fn post_completion<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
        deadline: Instant,
        stream: bool,
    ) -> CoreResult<UpstreamResponse> {
        let start = Instant::now();
        let mut attempts = 0u32;
        let outcome = tokio::time::timeout_at(
            deadline,
            self.attempt_loop(url, body, headers, ctx, deadline, stream, &mut attempts),
        )
        .await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(resp)) => {
                info!(attempts, elapsed_ms, status = 200u16, streaming = stream, "upstream call succeeded");
                Ok(resp)
            }
            Ok(Err(err)) => {
                let status = match &err {
                    BridgeError::Upstream { status, .. } => *status,
                    _ => 0,
                };
                warn!(attempts, elapsed_ms, status, kind = err.code(), error = %err, "upstream call failed");
                Err(err)
            }
            Err(_) => {
                warn!(attempts, elapsed_ms, "upstream call exceeded deadline");
                Err(BridgeError::Timeout { elapsed_ms })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn attempt_loop<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
        deadline: Instant,
        stream: bool,
        attempts: &mut u32,
    ) -> CoreResult<UpstreamResponse> {
        loop {
            *attempts += 1;
            let attempt = *attempts;
            let permit = self
                .slots
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| BridgeError::Other(anyhow::anyhow!("connection slots closed: {e}")))?;

            let err = match self.send_once(url, body, headers, ctx, attempt, deadline, stream, permit).await {
                Ok(resp) => return Ok(resp),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.retry.max_attempts {
                return Err(err);
            }

            let mut delay = self.retry.backoff(attempt);
            if let BridgeError::Upstream { retry_after: Some(secs), .. } = &err {
                delay = delay.max(Duration::from_secs(*secs));
            }
            warn!(attempt, delay_ms = delay.as_millis() as u64, kind = err.code(), error = %err, "retrying upstream call");
            tokio::time::sleep(delay).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
        attempt: u32,
        deadline: Instant,
        stream: bool,
        permit: OwnedSemaphorePermit,
    ) -> CoreResult<UpstreamResponse> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("x-attempt", (attempt - 1).to_string())
            .header(
                "Accept",
                if stream { "text/event-stream" } else { "application/json" },
            );
        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req.send().await.map_err(|e| {
            BridgeError::Network(if e.is_connect() {
                format!("connect failed: {e}")
            } else {
                e.to_string()
            })
        })?;

        let status = resp.status();
        debug!(attempt, status = status.as_u16(), "upstream responded");
        if !status.is_success() {
            let ra = parse_retry_after(resp.headers());
            let text = resp.text().await.unwrap_or_default();
            return Err(map_http_error(status, ra, text));
        }

        if stream {
            let bytes = resp
                .bytes_stream()
                .map(|r| r.map_err(|e| BridgeError::Stream(e.to_string())));
            return Ok(UpstreamResponse::Streaming(ByteSource::new(
                Box::pin(bytes),
                deadline,
                Some(permit),
            )));
        }

        let parsed = resp.json::<CompletionChunk>().await.map_err(|e| {
            if e.is_decode() {
                BridgeError::Upstream {
                    status: status.as_u16(),
                    body: format!("json decode error: {e}"),
                    retry_after: None,
                }
            } else {
                BridgeError::Stream(e.to_string())
            }
        })?;
        drop(permit);
        Ok(UpstreamResponse::Buffered(parsed))
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(status: StatusCode, retry_after: Option<u64>, body: String) -> BridgeError {
    BridgeError::Upstream {
        status: status.as_u16(),
        body,
        retry_after: if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            retry_after
        } else {
            None
        },
    }
}
