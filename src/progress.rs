//! Progress-callback trait for per-page walk and assembly events.
//!
//! Inject an [`Arc<dyn FetchProgressCallback>`] via
//! [`crate::config::DownloadConfigBuilder::progress_callback`] to receive
//! events as the walker moves through page numbers and as the assembler
//! appends pages.
//!
//! # Example
//!
//! ```rust
//! use page2pdf::{DownloadConfig, FetchProgressCallback};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     fetched: AtomicUsize,
//! }
//!
//! impl FetchProgressCallback for CountingCallback {
//!     fn on_page_fetched(&self, page_num: u32, bytes: usize) {
//!         self.fetched.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {page_num}: {bytes} bytes");
//!     }
//! }
//!
//! let config = DownloadConfig::builder()
//!     .base_url("https://example.com/images/book")
//!     .progress_callback(Arc::new(CountingCallback { fetched: AtomicUsize::new(0) }))
//!     .build()
//!     .unwrap();
//! ```

use std::path::Path;
use std::sync::Arc;

/// Called by the pipeline as it processes each page.
///
/// The walk is sequential, so walk events arrive in page order from one
/// task. Assembly events are emitted after each batch has been re-sorted,
/// also in page order. All methods default to no-ops.
pub trait FetchProgressCallback: Send + Sync {
    /// Called once before the first page number is examined.
    fn on_walk_start(&self, start_page: u32, expected_pages: Option<u32>) {
        let _ = (start_page, expected_pages);
    }

    /// Called before the network request for a page.
    fn on_page_start(&self, page_num: u32) {
        let _ = page_num;
    }

    /// The page was already cached and valid; no request was made.
    fn on_page_cached(&self, page_num: u32) {
        let _ = page_num;
    }

    /// The page was downloaded and committed to the store.
    fn on_page_fetched(&self, page_num: u32, bytes: usize) {
        let _ = (page_num, bytes);
    }

    /// The page failed and the walker moved past it.
    fn on_page_skipped(&self, page_num: u32, reason: &str) {
        let _ = (page_num, reason);
    }

    /// Called once when the walk stops, whatever the reason.
    ///
    /// # Arguments
    /// * `last_page_number`: exclusive upper bound of the walked range
    /// * `fetched`: pages downloaded in this run
    /// * `skipped`: page numbers given up on
    fn on_walk_complete(&self, last_page_number: u32, fetched: usize, skipped: usize) {
        let _ = (last_page_number, fetched, skipped);
    }

    /// Called once with the number of candidate pages before decoding.
    fn on_assembly_start(&self, candidate_pages: usize) {
        let _ = candidate_pages;
    }

    /// A page was appended to the output document.
    fn on_page_assembled(&self, page_num: u32) {
        let _ = page_num;
    }

    /// The document was written to `output`.
    fn on_assembly_complete(&self, page_count: usize, output: &Path) {
        let _ = (page_count, output);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl FetchProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::DownloadConfig`].
pub type ProgressCallback = Arc<dyn FetchProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct TrackingCallback {
        cached: AtomicUsize,
        fetched: AtomicUsize,
        skipped: AtomicUsize,
        last: AtomicUsize,
    }

    impl FetchProgressCallback for TrackingCallback {
        fn on_page_cached(&self, _page_num: u32) {
            self.cached.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_fetched(&self, _page_num: u32, _bytes: usize) {
            self.fetched.fetch_add(1, Ordering::SeqCst);
        }

        fn on_page_skipped(&self, _page_num: u32, _reason: &str) {
            self.skipped.fetch_add(1, Ordering::SeqCst);
        }

        fn on_walk_complete(&self, last_page_number: u32, _fetched: usize, _skipped: usize) {
            self.last.store(last_page_number as usize, Ordering::SeqCst);
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_walk_start(1, Some(5));
        cb.on_page_start(1);
        cb.on_page_cached(1);
        cb.on_page_fetched(2, 42);
        cb.on_page_skipped(3, "HTTP 503");
        cb.on_walk_complete(4, 1, 1);
        cb.on_assembly_start(2);
        cb.on_page_assembled(1);
        cb.on_assembly_complete(2, Path::new("out.pdf"));
    }

    #[test]
    fn tracking_callback_receives_events() {
        let tracker = TrackingCallback::default();
        tracker.on_page_cached(1);
        tracker.on_page_fetched(2, 100);
        tracker.on_page_fetched(3, 200);
        tracker.on_page_skipped(4, "HTTP 500");
        tracker.on_walk_complete(5, 2, 1);

        assert_eq!(tracker.cached.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.fetched.load(Ordering::SeqCst), 2);
        assert_eq!(tracker.skipped.load(Ordering::SeqCst), 1);
        assert_eq!(tracker.last.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_walk_start(1, None);
        cb.on_page_fetched(1, 512);
    }
}
