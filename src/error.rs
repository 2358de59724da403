//! Error types for the page2pdf library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`Page2PdfError`] is **fatal**: the run cannot continue (the source wants
//!   credentials, too many pages in a row failed, the user interrupted, the
//!   output could not be written). Returned as `Err(Page2PdfError)` from the
//!   top-level `run*` functions.
//!
//! * [`PageError`] is **non-fatal**: a single page was skipped (server error,
//!   bad content, corrupt cache file) but the walk or the assembly carries
//!   on. Stored in [`crate::output::WalkReport`] and
//!   [`crate::output::AssembledDocument`] so callers can see exactly which
//!   page numbers are missing and why.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Process exit code for a successful run.
pub const EXIT_OK: u8 = 0;
/// Process exit code for any fatal error without a dedicated code.
pub const EXIT_FAILURE: u8 = 1;
/// Process exit code when the source redirected to a login page.
pub const EXIT_AUTH_REQUIRED: u8 = 2;
/// Process exit code when the consecutive-failure ceiling was reached.
pub const EXIT_TOO_MANY_FAILURES: u8 = 3;
/// Process exit code after an interrupt signal (128 + SIGINT).
pub const EXIT_INTERRUPTED: u8 = 130;

/// All fatal errors returned by the page2pdf library.
///
/// Page-level failures use [`PageError`] and are stored in the run reports
/// rather than propagated here.
#[derive(Debug, Error)]
pub enum Page2PdfError {
    // ── Walk termination ──────────────────────────────────────────────────
    /// The server answered page `page` with a non-image resource
    /// (typically a login form).
    #[error(
        "Page {page} redirected to a non-image resource: {final_url}\n\
Authentication is required. Supply cookies with --cookie or --cookie-file."
    )]
    AuthRequired {
        page: u32,
        final_url: String,
        last_page_number: u32,
    },

    /// The consecutive-failure circuit breaker tripped.
    #[error(
        "{failures} consecutive pages failed (last: page {page}: {last_error})\n\
Reduce the request rate with --delay or check your connectivity."
    )]
    TooManyConsecutiveFailures {
        page: u32,
        failures: u32,
        last_error: String,
        last_page_number: u32,
    },

    /// The walk was cancelled by an interrupt signal.
    #[error("Interrupted while processing page {page}; cached pages are kept for the next run")]
    Interrupted { page: u32, last_page_number: u32 },

    // ── Assembly errors ───────────────────────────────────────────────────
    /// No page below the upper bound could be included in the document.
    #[error("No valid pages found in '{dir}' below page {upper_bound}")]
    NoPages { dir: PathBuf, upper_bound: u32 },

    /// Could not create or write the output document.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// lopdf could not serialise the assembled document.
    #[error("Failed to serialise PDF '{path}': {detail}")]
    SerializeFailed { path: PathBuf, detail: String },

    /// Could not create or read the page directory.
    #[error("Page store error at '{path}': {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Input / config errors ─────────────────────────────────────────────
    /// The base URL is not an HTTP/HTTPS URL.
    #[error("Invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A Netscape cookie file could not be read or parsed.
    #[error("Cookie file '{path}': {detail}")]
    CookieFile { path: PathBuf, detail: String },

    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Page2PdfError {
    /// Exit code the CLI should terminate with for this error.
    ///
    /// Authentication and circuit-breaker aborts get their own codes so
    /// wrapper scripts can tell "supply credentials" from "slow down".
    pub fn exit_code(&self) -> u8 {
        match self {
            Page2PdfError::AuthRequired { .. } => EXIT_AUTH_REQUIRED,
            Page2PdfError::TooManyConsecutiveFailures { .. } => EXIT_TOO_MANY_FAILURES,
            Page2PdfError::Interrupted { .. } => EXIT_INTERRUPTED,
            _ => EXIT_FAILURE,
        }
    }

    /// Exclusive upper bound of the pages fetched before the walk stopped,
    /// when the error ended a walk.
    pub fn last_page_number(&self) -> Option<u32> {
        match self {
            Page2PdfError::AuthRequired {
                last_page_number, ..
            }
            | Page2PdfError::TooManyConsecutiveFailures {
                last_page_number, ..
            }
            | Page2PdfError::Interrupted {
                last_page_number, ..
            } => Some(*last_page_number),
            _ => None,
        }
    }
}

/// A non-fatal error for a single page.
///
/// Recorded in the walk/assembly reports; the page number is skipped and
/// processing continues.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PageError {
    /// Transport failure after every retry was used.
    #[error("Page {page}: network error after retries: {kind}")]
    Network { page: u32, kind: String },

    /// The server kept answering 429 beyond the wait budget.
    #[error("Page {page}: still rate limited after waiting (Retry-After {retry_after_secs}s)")]
    RateLimited { page: u32, retry_after_secs: u64 },

    /// 5xx after every retry was used.
    #[error("Page {page}: server error HTTP {status}")]
    ServerError { page: u32, status: u16 },

    /// A status code the walker has no rule for.
    #[error("Page {page}: unexpected HTTP {status}")]
    UnexpectedStatus { page: u32, status: u16 },

    /// HTTP 200, but the body is not an image.
    #[error("Page {page}: invalid content ({detail})")]
    InvalidContent { page: u32, detail: String },

    /// Bytes failed the image integrity check.
    #[error("Page {page}: integrity check failed: {detail}")]
    Integrity { page: u32, detail: String },

    /// No file for this page in the store.
    #[error("Page {page}: not cached at {path:?}")]
    Missing { page: u32, path: PathBuf },

    /// The cached file could not be embedded (not a JPEG, bad header).
    #[error("Page {page}: cannot embed: {detail}")]
    Undecodable { page: u32, detail: String },

    /// Local I/O failed for this page.
    #[error("Page {page}: I/O error: {detail}")]
    Io { page: u32, detail: String },
}

impl PageError {
    /// The page number this error refers to.
    pub fn page(&self) -> u32 {
        match self {
            PageError::Network { page, .. }
            | PageError::RateLimited { page, .. }
            | PageError::ServerError { page, .. }
            | PageError::UnexpectedStatus { page, .. }
            | PageError::InvalidContent { page, .. }
            | PageError::Integrity { page, .. }
            | PageError::Missing { page, .. }
            | PageError::Undecodable { page, .. }
            | PageError::Io { page, .. } => *page,
        }
    }
}
