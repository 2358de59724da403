//! HTTP page fetch with retry, backoff and rate-limit handling.
//!
//! ## Retry Strategy
//!
//! | Answer                      | Action                                              |
//! |-----------------------------|-----------------------------------------------------|
//! | transport error             | backoff `initial * 2^(attempt-1)`, new identity     |
//! | 500 / 502 / 503 / 504       | same backoff; `TransientServerError` when exhausted |
//! | 429                         | sleep `Retry-After` (default 5 s, max 5 min)        |
//! | 200 + image extension       | `Success`                                           |
//! | 200 + other extension       | `AuthRedirect` (silently sent to a login page)      |
//! | 404                         | `NotFound`, the end of the sequence                 |
//! | anything else               | `UnexpectedStatus`                                  |
//!
//! A 429 does not use up one of the `max_retries` attempts. It has its own
//! budget (`max_rate_limit_waits`) so a server that never stops throttling
//! cannot hold the walk forever.

use crate::config::DownloadConfig;
use crate::error::Page2PdfError;
use crate::pipeline::identity::{identity_for, IdentityProvider};
use crate::pipeline::request::PageRequest;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, RETRY_AFTER, USER_AGENT};
use reqwest::{redirect, Client, Response, StatusCode, Url};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Extensions a successful final URL must carry to count as an image.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp"];

/// Redirect hops followed before giving up on a page.
const MAX_REDIRECTS: usize = 10;

/// Longest single wait honoured for a 429.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(300);

/// Result of fetching one page. Exactly one per page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success { bytes: Vec<u8>, content_type: String },
    RateLimited { retry_after_secs: u64 },
    TransientServerError { status: u16 },
    NetworkError { kind: String },
    NotFound,
    AuthRedirect { final_url: String },
    UnexpectedStatus { status: u16 },
}

/// Anything that can answer a page request.
///
/// [`Fetcher`] is the HTTP implementation; the walker only depends on this
/// trait so its state machine can be driven by scripted outcomes.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch(&self, request: &PageRequest) -> FetchOutcome;
}

/// Retry knobs, copied out of [`DownloadConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub default_retry_after: Duration,
    pub max_rate_limit_waits: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: config.retry_backoff,
            default_retry_after: config.default_retry_after,
            max_rate_limit_waits: config.max_rate_limit_waits,
        }
    }
}

/// What one HTTP attempt amounted to.
enum Attempt {
    Done(FetchOutcome),
    RateLimited(Duration),
    ServerError(u16),
    Transport(String),
}

/// reqwest-backed page fetcher.
pub struct Fetcher {
    client: Client,
    identity: Arc<dyn IdentityProvider>,
    policy: RetryPolicy,
}

impl Fetcher {
    pub fn new(client: Client, identity: Arc<dyn IdentityProvider>, policy: RetryPolicy) -> Self {
        Self {
            client,
            identity,
            policy,
        }
    }

    /// Build the HTTP client (timeout, redirects, cookies) from the run config.
    pub fn from_config(config: &DownloadConfig) -> Result<Self, Page2PdfError> {
        let mut headers = HeaderMap::new();
        if let Some(ref cookies) = config.cookie_header {
            let value = HeaderValue::from_str(cookies.trim()).map_err(|e| {
                Page2PdfError::InvalidConfig(format!("cookie header is not valid HTTP: {e}"))
            })?;
            headers.insert(COOKIE, value);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .default_headers(headers)
            .build()
            .map_err(|e| Page2PdfError::HttpClient(e.to_string()))?;

        Ok(Self::new(
            client,
            identity_for(config.user_agent.as_deref()),
            RetryPolicy::from_config(config),
        ))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetch one page, retrying up to `max_retries` attempts.
    pub async fn fetch_with(
        &self,
        request: &PageRequest,
        max_retries: u32,
        initial_backoff: Duration,
    ) -> FetchOutcome {
        let page = request.page_number;
        let max_retries = max_retries.max(1);
        let mut attempt: u32 = 1;
        let mut requests: u32 = 0;
        let mut rate_limit_waits: u32 = 0;

        loop {
            requests += 1;
            let user_agent = self.identity.user_agent(requests);

            match self.attempt_once(request, &user_agent).await {
                Attempt::Done(outcome) => return outcome,

                Attempt::RateLimited(wait) => {
                    rate_limit_waits += 1;
                    if rate_limit_waits > self.policy.max_rate_limit_waits {
                        warn!(
                            "Page {}: still rate limited after {} waits, giving up",
                            page, self.policy.max_rate_limit_waits
                        );
                        return FetchOutcome::RateLimited {
                            retry_after_secs: wait.as_secs(),
                        };
                    }
                    warn!(
                        "Page {}: HTTP 429, waiting {:.1}s before retrying ({}/{})",
                        page,
                        wait.as_secs_f64(),
                        rate_limit_waits,
                        self.policy.max_rate_limit_waits
                    );
                    sleep(wait).await;
                }

                Attempt::ServerError(status) => {
                    if attempt >= max_retries {
                        warn!(
                            "Page {}: HTTP {} after {} attempts",
                            page, status, attempt
                        );
                        return FetchOutcome::TransientServerError { status };
                    }
                    let wait = backoff_delay(initial_backoff, attempt);
                    warn!(
                        "Page {}: HTTP {}, retry {}/{} after {}ms",
                        page,
                        status,
                        attempt,
                        max_retries - 1,
                        wait.as_millis()
                    );
                    sleep(wait).await;
                    attempt += 1;
                }

                Attempt::Transport(kind) => {
                    if attempt >= max_retries {
                        warn!(
                            "Page {}: network error after {} attempts: {}",
                            page, attempt, kind
                        );
                        return FetchOutcome::NetworkError { kind };
                    }
                    let wait = backoff_delay(initial_backoff, attempt);
                    warn!(
                        "Page {}: {}, retry {}/{} after {}ms",
                        page,
                        kind,
                        attempt,
                        max_retries - 1,
                        wait.as_millis()
                    );
                    sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt_once(&self, request: &PageRequest, user_agent: &str) -> Attempt {
        let response = match self
            .client
            .get(&request.url)
            .header(USER_AGENT, user_agent)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return Attempt::Transport(describe_transport_error(&e)),
        };

        let status = response.status();
        debug!(
            "Page {}: HTTP {} from {}",
            request.page_number,
            status.as_u16(),
            response.url()
        );

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = rate_limit_wait(response.headers(), self.policy.default_retry_after);
                // Drain so the connection can be reused.
                let _ = response.bytes().await;
                Attempt::RateLimited(wait)
            }
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Attempt::ServerError(status.as_u16()),
            StatusCode::OK => {
                let final_url = response.url().clone();
                if !has_image_extension(&final_url) {
                    return Attempt::Done(FetchOutcome::AuthRedirect {
                        final_url: final_url.to_string(),
                    });
                }
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                match read_body(response).await {
                    Ok(bytes) => Attempt::Done(FetchOutcome::Success {
                        bytes,
                        content_type,
                    }),
                    Err(e) => Attempt::Transport(describe_transport_error(&e)),
                }
            }
            StatusCode::NOT_FOUND => Attempt::Done(FetchOutcome::NotFound),
            other => Attempt::Done(FetchOutcome::UnexpectedStatus {
                status: other.as_u16(),
            }),
        }
    }
}

#[async_trait]
impl PageSource for Fetcher {
    async fn fetch(&self, request: &PageRequest) -> FetchOutcome {
        self.fetch_with(request, self.policy.max_retries, self.policy.initial_backoff)
            .await
    }
}

/// `initial * 2^(attempt-1)`, saturating.
pub fn backoff_delay(initial: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    initial.saturating_mul(factor)
}

/// Delay-seconds form of `Retry-After`. HTTP-date values fall back to the
/// caller's default.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// How long to sleep after a 429: `Retry-After` when it is a delay in
/// seconds, `default` otherwise, never more than [`MAX_RETRY_AFTER`].
pub fn rate_limit_wait(headers: &HeaderMap, default: Duration) -> Duration {
    let wait = parse_retry_after(headers).unwrap_or(default);
    if wait > MAX_RETRY_AFTER {
        warn!(
            "Rate-limit wait of {}s capped at {}s",
            wait.as_secs(),
            MAX_RETRY_AFTER.as_secs()
        );
        return MAX_RETRY_AFTER;
    }
    wait
}

/// True when the URL path ends in one of [`IMAGE_EXTENSIONS`].
pub fn has_image_extension(url: &Url) -> bool {
    Path::new(url.path())
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

async fn read_body(mut response: Response) -> Result<Vec<u8>, reqwest::Error> {
    let mut body = Vec::with_capacity(response.content_length().unwrap_or(0) as usize);
    while let Some(chunk) = response.chunk().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    let kind = if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connect failure"
    } else if e.is_body() || e.is_decode() {
        "body read failure"
    } else if e.is_redirect() {
        "redirect loop"
    } else {
        "request failure"
    };
    format!("{kind}: {e}")
}
