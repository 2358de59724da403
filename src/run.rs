//! Top-level entry points: walk, assemble, or both.
//!
//! ## Why separate phases?
//!
//! The page directory is a resumable cache. A walk that aborted on an
//! authentication wall or a run of server errors keeps every page it stored,
//! so the caller can fix credentials and walk again (cached pages cost no
//! request), or bind what is there with [`crate::config::RunMode::AssembleOnly`].

use crate::config::DownloadConfig;
use crate::error::Page2PdfError;
use crate::output::{AssembledDocument, RunOutput, WalkReport};
use crate::pipeline::assemble::DocumentAssembler;
use crate::pipeline::fetch::{Fetcher, PageSource};
use crate::pipeline::store::PageStore;
use crate::pipeline::walk::{SequenceWalker, WalkSettings};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Run the phases selected by `config.mode`.
///
/// # Returns
/// `Ok(RunOutput)` when the walk finished (404 at the end of the sequence)
/// and, if requested, the document was written. Individual skipped or
/// excluded pages are listed in the reports, not returned as errors.
///
/// # Errors
/// Returns `Err(Page2PdfError)` for fatal conditions:
/// - the source redirected to a login page ([`Page2PdfError::AuthRequired`])
/// - the consecutive-failure ceiling was reached
/// - `cancel` fired during the walk or before the document was written
///   ([`Page2PdfError::Interrupted`])
/// - no page could be assembled, or the output could not be written
///
/// Walk aborts carry the exclusive upper bound reached
/// ([`Page2PdfError::last_page_number`]).
pub async fn run(
    config: &DownloadConfig,
    cancel: CancellationToken,
) -> Result<RunOutput, Page2PdfError> {
    let total_start = Instant::now();
    info!("Starting {:?} run for {}", config.mode, config.base_url);

    let walk = if config.mode.fetches() {
        Some(fetch_pages(config, cancel.clone()).await?)
    } else {
        None
    };

    let mut last_page_number = walk.as_ref().map_or(0, |w| w.last_page_number);
    let assembly = if config.mode.assembles() {
        if walk.is_none() {
            last_page_number = cached_upper_bound(config).await?;
        }
        Some(assemble_pages(config, last_page_number, cancel).await?)
    } else {
        None
    };

    Ok(RunOutput {
        last_page_number,
        output_path: assembly.as_ref().map(|a| a.output_path.clone()),
        walk,
        assembly,
        total_duration_ms: total_start.elapsed().as_millis() as u64,
    })
}

/// Walk the sequence over HTTP and fail on any abort.
pub async fn fetch_pages(
    config: &DownloadConfig,
    cancel: CancellationToken,
) -> Result<WalkReport, Page2PdfError> {
    let fetcher = Fetcher::from_config(config)?;
    walk_with(&fetcher, config, cancel).await?.into_result()
}

/// Walk against any [`PageSource`] and return the report as-is, aborted or
/// not.
pub async fn walk_with<S: PageSource + ?Sized>(
    source: &S,
    config: &DownloadConfig,
    cancel: CancellationToken,
) -> Result<WalkReport, Page2PdfError> {
    let store = PageStore::for_base_url(&config.page_dir, &config.base_url);
    SequenceWalker::new(source, &store, WalkSettings::from_config(config), cancel)
        .with_progress(config.progress_callback.clone())
        .walk()
        .await
}

/// Assemble cached pages `1..upper_bound` into `config.output_path`.
pub async fn assemble_pages(
    config: &DownloadConfig,
    upper_bound: u32,
    cancel: CancellationToken,
) -> Result<AssembledDocument, Page2PdfError> {
    let store = PageStore::for_base_url(&config.page_dir, &config.base_url);
    DocumentAssembler::new(&store, config.batch_size, config.decode_concurrency)
        .with_progress(config.progress_callback.clone())
        .with_cancel(cancel)
        .assemble(upper_bound, &config.output_path)
        .await
}

/// One past the highest page number present in the page directory.
pub async fn cached_upper_bound(config: &DownloadConfig) -> Result<u32, Page2PdfError> {
    let store = PageStore::for_base_url(&config.page_dir, &config.base_url);
    match store.highest_cached().await? {
        Some(n) => Ok(n.saturating_add(1)),
        None => Err(Page2PdfError::NoPages {
            dir: config.page_dir.clone(),
            upper_bound: 1,
        }),
    }
}

/// Synchronous wrapper around [`run`].
///
/// Creates a temporary tokio runtime internally; the run cannot be
/// cancelled.
pub fn run_sync(config: &DownloadConfig) -> Result<RunOutput, Page2PdfError> {
    tokio::runtime::Runtime::new()
        .map_err(|e| Page2PdfError::Internal(format!("Failed to create tokio runtime: {}", e)))?
        .block_on(run(config, CancellationToken::new()))
}
