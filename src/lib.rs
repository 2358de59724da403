//! # page2pdf
//!
//! Download a numbered sequence of page images from a web server and bind
//! them into a single PDF.
//!
//! ## Why this crate?
//!
//! Document viewers often expose each page as its own image
//! (`.../book-001.jpg`, `.../book-002.jpg`, ...) with no index and no total
//! count. This crate walks the sequence until the server answers 404, copes
//! with the usual hostility along the way (rate limits, flaky 5xx, login
//! walls), caches every page on disk so an interrupted run resumes for
//! free, and embeds the original JPEG bytes into the PDF without
//! re-encoding.
//!
//! ## Pipeline Overview
//!
//! ```text
//! base URL
//!  │
//!  ├─ 1. Normalise  strip a pasted "-001.jpg" suffix
//!  ├─ 2. Walk       page 1, 2, 3, ... one request at a time, polite delay
//!  │                 ├─ 429 → honour Retry-After, retry
//!  │                 ├─ 5xx → exponential backoff, retry
//!  │                 ├─ 404 → end of sequence
//!  │                 └─ redirect to HTML → authentication required
//!  ├─ 3. Store      validated page files, atomic writes, resume cache
//!  └─ 4. Assemble   JPEG → /DCTDecode XObject, one PDF page per image
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use page2pdf::{run, DownloadConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DownloadConfig::builder()
//!         .base_url("https://example.com/images/book")
//!         .output_path("book.pdf")
//!         .build()?;
//!     let output = run(&config, CancellationToken::new()).await?;
//!     eprintln!("{} pages, ended at page {}",
//!         output.assembly.map_or(0, |a| a.page_count()),
//!         output.last_page_number);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `page2pdf` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library to avoid pulling in CLI-only deps:
//! ```toml
//! page2pdf = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod auth;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod run;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use auth::resolve_cookie_header;
pub use config::{DownloadConfig, DownloadConfigBuilder, RunMode};
pub use error::{Page2PdfError, PageError};
pub use output::{AssembledDocument, RunOutput, WalkOutcome, WalkReport};
pub use pipeline::fetch::{FetchOutcome, Fetcher, PageSource};
pub use progress::{FetchProgressCallback, NoopProgressCallback, ProgressCallback};
pub use run::{assemble_pages, fetch_pages, run, run_sync, walk_with};
