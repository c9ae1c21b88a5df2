//! Embedding provider interaction with exponential backoff retry logic.
//!
//! # Architecture
//!
//! - [`EmbeddingProvider`]: core trait turning one text into one vector
//! - [`HttpEmbedder`]: client for an OpenAI-compatible `/embeddings` endpoint
//! - [`RetryEmbed`]: decorator that retries transient failures of any provider
//!
//! # Retry Strategy
//!
//! - Only [`EmbedError::Transient`] is retried; permanent failures return at once
//! - Exponential backoff starting at the configured base delay
//! - Maximum delay capped at 30 seconds
//! - Random jitter (0-250ms) added to prevent thundering herd
//!
//! The per-call timeout is applied by the caller around the whole retried
//! call, see [`embed_with_timeout`].

use crate::config::EmbeddingSettings;
use crate::error::EmbedError;
use rand::{Rng, rng};
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration as StdDuration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{error, instrument, warn};

/// Converts article text into a fixed-length vector.
pub trait EmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError>;

    /// Length of every vector this provider returns.
    fn dimension(&self) -> usize;
}

/// Wrapper that adds exponential backoff retry logic to any [`EmbeddingProvider`].
///
/// ```text
/// delay = min(base_delay * 2^(attempt-1), max_delay) + random_jitter(0..250ms)
/// ```
pub struct RetryEmbed<T> {
    inner: T,
    max_retries: usize,
    base_delay: StdDuration,
    max_delay: StdDuration,
}

impl<T> RetryEmbed<T>
where
    T: EmbeddingProvider,
{
    /// # Arguments
    /// * `inner` - Provider to wrap
    /// * `max_retries` - Retries after the first attempt; transient errors only
    /// * `base_delay` - Delay before the first retry, doubled each time
    pub fn new(inner: T, max_retries: usize, base_delay: StdDuration) -> Self {
        Self {
            inner,
            max_retries,
            base_delay,
            max_delay: StdDuration::from_secs(30),
        }
    }

    fn backoff(&self, attempt: usize) -> StdDuration {
        let shift = (attempt.saturating_sub(1)).min(16) as u32;
        let delay = self.base_delay.saturating_mul(1 << shift).min(self.max_delay);
        let jitter_ms: u64 = rng().random_range(0..=250);
        delay + StdDuration::from_millis(jitter_ms)
    }
}

impl<T> fmt::Debug for RetryEmbed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryEmbed")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish()
    }
}

impl<T> EmbeddingProvider for RetryEmbed<T>
where
    T: EmbeddingProvider,
{
    #[instrument(level = "debug", skip_all)]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let total_t0 = Instant::now();
        let mut attempt = 0usize;

        loop {
            match self.inner.embed(text).await {
                Ok(v) => return Ok(v),
                Err(e @ EmbedError::Permanent(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let total_dt = total_t0.elapsed();
                    if attempt > self.max_retries {
                        error!(
                            attempt,
                            max = self.max_retries,
                            elapsed_ms_total = total_dt.as_millis() as u64,
                            error = %e,
                            "embed() exhausted retries"
                        );
                        return Err(e);
                    }
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max = self.max_retries,
                        elapsed_ms_total = total_dt.as_millis() as u64,
                        ?delay,
                        error = %e,
                        "embed() attempt failed; backing off"
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Client for OpenAI-compatible embedding endpoints.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    dimension: usize,
}

impl HttpEmbedder {
    /// Build a client for `settings.endpoint`.
    ///
    /// # Errors
    /// [`EmbedError::Permanent`] when the API key is not a valid header
    /// value or the HTTP client cannot be built.
    pub fn new(settings: &EmbeddingSettings) -> Result<Self, EmbedError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = settings.api_key.as_deref().map(str::trim).filter(|k| !k.is_empty()) {
            let auth = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| EmbedError::Permanent(format!("invalid API key header: {e}")))?;
            headers.insert(AUTHORIZATION, auth);
        }
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| EmbedError::Permanent(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", settings.endpoint.trim_end_matches('/')),
            model: settings.model.clone(),
            dimension: settings.dimension,
        })
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

fn classify_status(status: StatusCode, body: &str) -> EmbedError {
    let msg = format!("embedding request failed ({status}): {body}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        EmbedError::Transient(msg)
    } else {
        EmbedError::Permanent(msg)
    }
}

impl EmbeddingProvider for HttpEmbedder {
    #[instrument(level = "debug", skip_all, fields(endpoint = %self.endpoint))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(EmbedError::Permanent("empty text".into()));
        }
        let request = EmbeddingRequest {
            model: &self.model,
            input: [text],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| EmbedError::Transient(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(classify_status(status, &crate::utils::truncate_for_log(&body, 300)));
        }
        let parsed: EmbeddingResponse = resp
            .json()
            .await
            .map_err(|e| EmbedError::Transient(format!("failed to parse embedding response: {e}")))?;
        parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbedError::Transient("embedding response had no data".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embed `text`, bounded by `limit`, and check the returned vector.
///
/// A timeout, or a vector of the wrong length or with non-finite values, is
/// an error; nothing partial is ever handed back.
pub async fn embed_with_timeout<E: EmbeddingProvider>(
    provider: &E,
    text: &str,
    limit: StdDuration,
) -> Result<Vec<f32>, EmbedError> {
    let vector = timeout(limit, provider.embed(text))
        .await
        .map_err(|_| EmbedError::Timeout(limit))??;
    let expected = provider.dimension();
    if vector.len() != expected {
        return Err(EmbedError::Transient(format!(
            "provider returned dimension {}, expected {expected}",
            vector.len()
        )));
    }
    if !crate::vector::is_usable(&vector) {
        return Err(EmbedError::Transient("provider returned a degenerate vector".into()));
    }
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Flaky {
        failures_left: Cell<usize>,
        calls: Cell<usize>,
        error: fn() -> EmbedError,
    }

    impl EmbeddingProvider for Flaky {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            self.calls.set(self.calls.get() + 1);
            if self.failures_left.get() > 0 {
                self.failures_left.set(self.failures_left.get() - 1);
                return Err((self.error)());
            }
            Ok(vec![1.0, 0.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    fn flaky(failures: usize, error: fn() -> EmbedError) -> Flaky {
        Flaky {
            failures_left: Cell::new(failures),
            calls: Cell::new(0),
            error,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let api = RetryEmbed::new(
            flaky(2, || EmbedError::Transient("503".into())),
            3,
            StdDuration::from_millis(10),
        );
        assert_eq!(api.embed("texto").await.unwrap(), vec![1.0, 0.0]);
        assert_eq!(api.inner.calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_retries() {
        let api = RetryEmbed::new(
            flaky(10, || EmbedError::Transient("503".into())),
            2,
            StdDuration::from_millis(10),
        );
        assert!(api.embed("texto").await.unwrap_err().is_transient());
        assert_eq!(api.inner.calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_is_not_retried() {
        let api = RetryEmbed::new(
            flaky(10, || EmbedError::Permanent("empty".into())),
            5,
            StdDuration::from_millis(10),
        );
        assert!(matches!(api.embed("").await, Err(EmbedError::Permanent(_))));
        assert_eq!(api.inner.calls.get(), 1);
    }

    struct Slow;

    impl EmbeddingProvider for Slow {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            sleep(StdDuration::from_secs(60)).await;
            Ok(vec![1.0])
        }

        fn dimension(&self) -> usize {
            1
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_reported() {
        let err = embed_with_timeout(&Slow, "texto", StdDuration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EmbedError::Timeout(d) if d == StdDuration::from_secs(1)));
    }

    struct WrongSize;

    impl EmbeddingProvider for WrongSize {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Ok(vec![1.0, 2.0, 3.0])
        }

        fn dimension(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn wrong_dimension_is_rejected() {
        assert!(
            embed_with_timeout(&WrongSize, "texto", StdDuration::from_secs(1))
                .await
                .is_err()
        );
    }

    #[test]
    fn status_classification() {
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "").is_transient());
    }

    #[test]
    fn endpoint_is_normalized() {
        let settings = EmbeddingSettings {
            endpoint: "http://localhost:9000/v1/".into(),
            ..EmbeddingSettings::default()
        };
        let client = HttpEmbedder::new(&settings).unwrap();
        assert_eq!(client.endpoint, "http://localhost:9000/v1/embeddings");
        assert_eq!(client.dimension(), 384);
    }

    #[tokio::test]
    async fn empty_text_is_permanent_without_a_request() {
        let client = HttpEmbedder::new(&EmbeddingSettings::default()).unwrap();
        assert!(matches!(client.embed("   ").await, Err(EmbedError::Permanent(_))));
    }
}
