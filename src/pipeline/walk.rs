//! Sequential page walk: `Scanning → {Scanning, Finished, Aborted}`.
//!
//! The walker owns the [`WalkState`] and moves one page number at a time:
//!
//! ```text
//!            cached & valid ──────────────┐ (no request, no pause)
//!            │                            ▼
//! page n ──▶ fetch ─▶ Success ─▶ commit ─▶ n+1 ─▶ pause (delay × [0.5,1.5))
//!                  ├─ NotFound ───────────▶ Finished    (last = n)
//!                  ├─ AuthRedirect ───────▶ Aborted     (last = n)
//!                  └─ anything else ─▶ failures += 1
//!                                         ├─ < ceiling ─▶ skip n, n+1
//!                                         └─ = ceiling ─▶ Aborted (last = n)
//! ```
//!
//! Fetching is strictly one request at a time. Cancellation is checked at
//! the top of each iteration and raced against the fetch and the pause; the
//! page's [`StagedPage`](crate::pipeline::store::StagedPage) guard removes
//! any temp file on the way out.

use crate::config::DownloadConfig;
use crate::error::{Page2PdfError, PageError};
use crate::output::{WalkOutcome, WalkReport};
use crate::pipeline::fetch::{FetchOutcome, PageSource};
use crate::pipeline::request::PageRequest;
use crate::pipeline::store::{verify_image_bytes, PageStore};
use crate::progress::ProgressCallback;
use rand::Rng;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Walk parameters, copied out of [`DownloadConfig`].
#[derive(Debug, Clone)]
pub struct WalkSettings {
    pub base_url: String,
    pub start_page: u32,
    pub expected_pages: Option<u32>,
    pub delay: Duration,
    pub failure_ceiling: u32,
}

impl WalkSettings {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            start_page: config.start_page,
            expected_pages: config.expected_pages,
            delay: config.delay,
            failure_ceiling: config.failure_ceiling,
        }
    }
}

/// Mutable walk state. Updated once per page number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkState {
    pub current_page: u32,
    pub consecutive_failures: u32,
    pub last_success: Option<u32>,
}

/// What happened to one page that was not served from the cache.
enum PageStep {
    Stored(usize),
    Failed(PageError),
    Stop(WalkOutcome),
}

/// Drives page numbers upward against a [`PageSource`] and a [`PageStore`].
pub struct SequenceWalker<'a, S: PageSource + ?Sized> {
    source: &'a S,
    store: &'a PageStore,
    settings: WalkSettings,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl<'a, S: PageSource + ?Sized> SequenceWalker<'a, S> {
    pub fn new(
        source: &'a S,
        store: &'a PageStore,
        settings: WalkSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            store,
            settings,
            cancel,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Walk until the source runs out of pages or the walk aborts.
    ///
    /// Aborts are reported in [`WalkReport::outcome`], not as `Err`; use
    /// [`WalkReport::into_result`] to convert them. `Err` is only returned
    /// when the page directory itself is unusable.
    pub async fn walk(&self) -> Result<WalkReport, Page2PdfError> {
        let start = Instant::now();
        self.store.ensure_dir().await?;

        let ceiling = self.settings.failure_ceiling.max(1);
        info!(
            "Walking pages from {} ({})",
            self.settings.start_page,
            self.settings
                .expected_pages
                .map_or_else(|| "page count unknown".to_string(), |n| format!("expecting {n}"))
        );
        if let Some(ref cb) = self.progress {
            cb.on_walk_start(self.settings.start_page, self.settings.expected_pages);
        }

        let mut state = WalkState {
            current_page: self.settings.start_page.max(1),
            consecutive_failures: 0,
            last_success: None,
        };
        let mut fetched = Vec::new();
        let mut cached = Vec::new();
        let mut skipped: Vec<PageError> = Vec::new();

        let (outcome, last_page_number) = loop {
            let n = state.current_page;

            if self.cancel.is_cancelled() {
                break (WalkOutcome::Interrupted { page: n }, n);
            }

            if self.store.has(n).await {
                debug!("Page {}: cached, skipping request", n);
                state.consecutive_failures = 0;
                state.last_success = Some(n);
                cached.push(n);
                if let Some(ref cb) = self.progress {
                    cb.on_page_cached(n);
                }
                match n.checked_add(1) {
                    Some(next) => state.current_page = next,
                    None => break (WalkOutcome::Finished, n),
                }
                continue;
            }

            match self.fetch_page(n).await {
                PageStep::Stored(len) => {
                    state.consecutive_failures = 0;
                    state.last_success = Some(n);
                    fetched.push(n);
                    if let Some(ref cb) = self.progress {
                        cb.on_page_fetched(n, len);
                    }
                }
                PageStep::Failed(err) => {
                    state.consecutive_failures += 1;
                    if state.consecutive_failures >= ceiling {
                        warn!(
                            "Page {}: {} ({} consecutive failures), aborting",
                            n, err, state.consecutive_failures
                        );
                        break (
                            WalkOutcome::TooManyFailures {
                                page: n,
                                failures: state.consecutive_failures,
                                last_error: err.to_string(),
                            },
                            n,
                        );
                    }
                    warn!(
                        "Skipping page {}: {} ({}/{} consecutive failures)",
                        n, err, state.consecutive_failures, ceiling
                    );
                    if let Some(ref cb) = self.progress {
                        cb.on_page_skipped(n, &err.to_string());
                    }
                    skipped.push(err);
                }
                PageStep::Stop(outcome) => break (outcome, n),
            }

            let Some(next) = n.checked_add(1) else {
                break (WalkOutcome::Finished, n);
            };
            if !self.pause().await {
                break (WalkOutcome::Interrupted { page: next }, next);
            }
            state.current_page = next;
        };

        match &outcome {
            WalkOutcome::Finished => info!(
                "Walk finished at page {}: {} fetched, {} cached, {} skipped",
                last_page_number,
                fetched.len(),
                cached.len(),
                skipped.len()
            ),
            other => warn!("Walk aborted at page {}: {:?}", last_page_number, other),
        }
        if let Some(ref cb) = self.progress {
            cb.on_walk_complete(last_page_number, fetched.len(), skipped.len());
        }

        Ok(WalkReport {
            start_page: self.settings.start_page,
            last_page_number,
            outcome,
            fetched,
            cached,
            skipped,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Fetch page `n` and, on success, commit it to the store.
    async fn fetch_page(&self, n: u32) -> PageStep {
        let staged = match self.store.stage(n) {
            Ok(staged) => staged,
            Err(e) => return PageStep::Failed(e),
        };
        let request = PageRequest::new(&self.settings.base_url, n);
        if let Some(ref cb) = self.progress {
            cb.on_page_start(n);
        }
        debug!("Page {}: GET {}", n, request.url);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Page {}: cancelled mid-fetch, discarding {}", n, staged.temp_path().display());
                return PageStep::Stop(WalkOutcome::Interrupted { page: n });
            }
            outcome = self.source.fetch(&request) => outcome,
        };

        match outcome {
            FetchOutcome::Success {
                bytes,
                content_type,
            } => {
                if let Err(detail) = validate_content(&content_type, &bytes) {
                    return PageStep::Failed(PageError::InvalidContent { page: n, detail });
                }
                let len = bytes.len();
                match staged.commit(bytes).await {
                    Ok(_) => PageStep::Stored(len),
                    Err(e) => PageStep::Failed(e),
                }
            }
            FetchOutcome::NotFound => {
                info!("Page {}: not found, end of sequence", n);
                PageStep::Stop(WalkOutcome::Finished)
            }
            FetchOutcome::AuthRedirect { final_url } => {
                warn!("Page {}: redirected to non-image {}", n, final_url);
                PageStep::Stop(WalkOutcome::AuthRequired { page: n, final_url })
            }
            FetchOutcome::TransientServerError { status } => {
                PageStep::Failed(PageError::ServerError { page: n, status })
            }
            FetchOutcome::UnexpectedStatus { status } => {
                PageStep::Failed(PageError::UnexpectedStatus { page: n, status })
            }
            FetchOutcome::RateLimited { retry_after_secs } => {
                PageStep::Failed(PageError::RateLimited {
                    page: n,
                    retry_after_secs,
                })
            }
            FetchOutcome::NetworkError { kind } => {
                PageStep::Failed(PageError::Network { page: n, kind })
            }
        }
    }

    /// Sleep `delay × U[0.5, 1.5)`. Returns false if cancelled meanwhile.
    async fn pause(&self) -> bool {
        if self.settings.delay.is_zero() {
            return !self.cancel.is_cancelled();
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
        let wait = self.settings.delay.mul_f64(factor);
        debug!("Pausing {}ms before next page", wait.as_millis());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}

/// A successful answer must be a non-empty, structurally sound image.
///
/// A `Content-Type` that is present but not `image/*` is rejected outright.
/// A missing one is tolerated when the bytes themselves check out.
fn validate_content(content_type: &str, bytes: &[u8]) -> Result<(), String> {
    let ct = content_type.trim().to_ascii_lowercase();
    if !ct.is_empty() && !ct.starts_with("image/") {
        return Err(format!("content-type {content_type:?} is not an image"));
    }
    if bytes.is_empty() {
        return Err("empty body".into());
    }
    verify_image_bytes(bytes).map(|_| ())
}
