//! Configuration types for a fetch-and-assemble run.
//!
//! All run behaviour is controlled through [`DownloadConfig`], built via its
//! [`DownloadConfigBuilder`]. The CLI maps every flag onto the builder, and
//! library callers set only the knobs they care about.

use crate::error::Page2PdfError;
use crate::pipeline::request::normalize_base_url;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one run.
///
/// Built via [`DownloadConfig::builder()`].
///
/// # Example
/// ```rust
/// use page2pdf::DownloadConfig;
/// use std::time::Duration;
///
/// let config = DownloadConfig::builder()
///     .base_url("https://example.com/OPS/images/9781292244778")
///     .delay(Duration::from_millis(500))
///     .max_retries(5)
///     .build()
///     .unwrap();
/// assert_eq!(config.start_page, 1);
/// ```
#[derive(Clone)]
pub struct DownloadConfig {
    /// Page URL without the `-NNN.jpg` suffix.
    pub base_url: String,

    /// First page number to request. Default: 1.
    pub start_page: u32,

    /// Page count the user expects. Only used for progress display.
    pub expected_pages: Option<u32>,

    /// Base pause between two fetched pages. Default: 1s.
    ///
    /// Each pause is multiplied by a random factor in `[0.5, 1.5)` so requests
    /// do not arrive at a fixed cadence. Cached pages never pause.
    pub delay: Duration,

    /// Attempts per page for transport errors and 5xx. Default: 3.
    pub max_retries: u32,

    /// Initial retry backoff; doubles each attempt. Default: 2s.
    pub retry_backoff: Duration,

    /// Wait used for a 429 without a usable `Retry-After`. Default: 5s.
    pub default_retry_after: Duration,

    /// 429 answers tolerated for one page before giving up on it. Default: 10.
    pub max_rate_limit_waits: u32,

    /// Back-to-back page failures after which the walk aborts. Default: 10.
    pub failure_ceiling: u32,

    /// Per-request timeout in seconds. Default: 30.
    pub request_timeout_secs: u64,

    /// Fixed user-agent. `None` rotates through a pool of browser strings.
    pub user_agent: Option<String>,

    /// Raw `Cookie` header sent with every request.
    pub cookie_header: Option<String>,

    /// Directory holding the cached page files. Default: `download`.
    pub page_dir: PathBuf,

    /// Output PDF path. Default: `combined.pdf`.
    pub output_path: PathBuf,

    /// Which phases to run. Default: [`RunMode::Full`].
    pub mode: RunMode,

    /// Pages decoded per assembly batch. Default: 50.
    pub batch_size: usize,

    /// Concurrent header decodes inside a batch. Default: 8.
    pub decode_concurrency: usize,

    /// Optional progress events receiver.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            start_page: 1,
            expected_pages: None,
            delay: Duration::from_secs(1),
            max_retries: 3,
            retry_backoff: Duration::from_secs(2),
            default_retry_after: Duration::from_secs(5),
            max_rate_limit_waits: 10,
            failure_ceiling: 10,
            request_timeout_secs: 30,
            user_agent: None,
            cookie_header: None,
            page_dir: PathBuf::from("download"),
            output_path: PathBuf::from("combined.pdf"),
            mode: RunMode::default(),
            batch_size: 50,
            decode_concurrency: 8,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for DownloadConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadConfig")
            .field("base_url", &self.base_url)
            .field("start_page", &self.start_page)
            .field("expected_pages", &self.expected_pages)
            .field("delay", &self.delay)
            .field("max_retries", &self.max_retries)
            .field("retry_backoff", &self.retry_backoff)
            .field("failure_ceiling", &self.failure_ceiling)
            .field("user_agent", &self.user_agent)
            .field("cookie_header", &self.cookie_header.as_ref().map(|_| "<redacted>"))
            .field("page_dir", &self.page_dir)
            .field("output_path", &self.output_path)
            .field("mode", &self.mode)
            .field("batch_size", &self.batch_size)
            .field(
                "progress_callback",
                &self.progress_callback.as_ref().map(|_| "<dyn FetchProgressCallback>"),
            )
            .finish()
    }
}

impl DownloadConfig {
    /// Create a new builder for `DownloadConfig`.
    pub fn builder() -> DownloadConfigBuilder {
        DownloadConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`DownloadConfig`].
#[derive(Debug)]
pub struct DownloadConfigBuilder {
    config: DownloadConfig,
}

impl DownloadConfigBuilder {
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn start_page(mut self, n: u32) -> Self {
        self.config.start_page = n.max(1);
        self
    }

    pub fn expected_pages(mut self, n: Option<u32>) -> Self {
        self.config.expected_pages = n;
        self
    }

    pub fn delay(mut self, d: Duration) -> Self {
        self.config.delay = d;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.max_retries = n;
        self
    }

    pub fn retry_backoff(mut self, d: Duration) -> Self {
        self.config.retry_backoff = d;
        self
    }

    pub fn default_retry_after(mut self, d: Duration) -> Self {
        self.config.default_retry_after = d;
        self
    }

    pub fn max_rate_limit_waits(mut self, n: u32) -> Self {
        self.config.max_rate_limit_waits = n;
        self
    }

    pub fn failure_ceiling(mut self, n: u32) -> Self {
        self.config.failure_ceiling = n;
        self
    }

    pub fn request_timeout_secs(mut self, secs: u64) -> Self {
        self.config.request_timeout_secs = secs;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = Some(ua.into());
        self
    }

    pub fn cookie_header(mut self, cookies: Option<String>) -> Self {
        self.config.cookie_header = cookies.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn page_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.page_dir = dir.into();
        self
    }

    pub fn output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.output_path = path.into();
        self
    }

    pub fn mode(mut self, mode: RunMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.config.batch_size = n;
        self
    }

    pub fn decode_concurrency(mut self, n: usize) -> Self {
        self.config.decode_concurrency = n;
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    ///
    /// The base URL is normalised: a pasted page URL such as
    /// `.../book-001.jpg` becomes `.../book`.
    pub fn build(mut self) -> Result<DownloadConfig, Page2PdfError> {
        self.config.base_url = normalize_base_url(&self.config.base_url)?;

        let c = &self.config;
        if c.max_retries == 0 {
            return Err(Page2PdfError::InvalidConfig(
                "max_retries must be ≥ 1".into(),
            ));
        }
        if c.failure_ceiling == 0 {
            return Err(Page2PdfError::InvalidConfig(
                "failure_ceiling must be ≥ 1".into(),
            ));
        }
        if c.batch_size == 0 || c.decode_concurrency == 0 {
            return Err(Page2PdfError::InvalidConfig(
                "batch_size and decode_concurrency must be ≥ 1".into(),
            ));
        }
        if c.request_timeout_secs == 0 {
            return Err(Page2PdfError::InvalidConfig(
                "request_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Which phases a run executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunMode {
    /// Walk the pages, then assemble the PDF. (default)
    #[default]
    Full,
    /// Walk the pages only; leave them in the page directory.
    FetchOnly,
    /// Skip the network and assemble whatever is cached.
    AssembleOnly,
}

impl RunMode {
    pub fn fetches(self) -> bool {
        matches!(self, RunMode::Full | RunMode::FetchOnly)
    }

    pub fn assembles(self) -> bool {
        matches!(self, RunMode::Full | RunMode::AssembleOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let c = DownloadConfig::default();
        assert_eq!(c.start_page, 1);
        assert_eq!(c.max_retries, 3);
        assert_eq!(c.failure_ceiling, 10);
        assert_eq!(c.batch_size, 50);
        assert_eq!(c.default_retry_after, Duration::from_secs(5));
        assert_eq!(c.output_path, PathBuf::from("combined.pdf"));
        assert_eq!(c.mode, RunMode::Full);
    }

    #[test]
    fn build_normalises_pasted_page_url() {
        let c = DownloadConfig::builder()
            .base_url("https://example.com/OPS/images/book-001.jpg")
            .build()
            .unwrap();
        assert_eq!(c.base_url, "https://example.com/OPS/images/book");
    }

    #[test]
    fn build_rejects_missing_url() {
        let err = DownloadConfig::builder().build().unwrap_err();
        assert!(matches!(err, Page2PdfError::InvalidBaseUrl { .. }));
    }

    #[test]
    fn build_rejects_zero_retries() {
        let err = DownloadConfig::builder()
            .base_url("https://example.com/book")
            .max_retries(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Page2PdfError::InvalidConfig(_)));
    }

    #[test]
    fn start_page_is_clamped_to_one() {
        let c = DownloadConfig::builder()
            .base_url("https://example.com/book")
            .start_page(0)
            .build()
            .unwrap();
        assert_eq!(c.start_page, 1);
    }

    #[test]
    fn blank_cookie_header_is_dropped() {
        let c = DownloadConfig::builder()
            .base_url("https://example.com/book")
            .cookie_header(Some("   ".into()))
            .build()
            .unwrap();
        assert!(c.cookie_header.is_none());
    }

    #[test]
    fn debug_redacts_cookies() {
        let c = DownloadConfig::builder()
            .base_url("https://example.com/book")
            .cookie_header(Some("session=secret".into()))
            .build()
            .unwrap();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret"));
    }

    #[test]
    fn run_mode_phases() {
        assert!(RunMode::Full.fetches() && RunMode::Full.assembles());
        assert!(RunMode::FetchOnly.fetches() && !RunMode::FetchOnly.assembles());
        assert!(!RunMode::AssembleOnly.fetches() && RunMode::AssembleOnly.assembles());
    }
}
