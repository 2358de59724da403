//! Result types handed back to callers.
//!
//! Everything here is `Serialize` so the CLI can print a run as JSON.

use crate::error::{Page2PdfError, PageError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How a walk ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WalkOutcome {
    /// The source answered 404: the sequence is complete.
    Finished,
    /// The source served a non-image resource instead of `page`.
    AuthRequired { page: u32, final_url: String },
    /// The consecutive-failure ceiling was reached at `page`.
    TooManyFailures {
        page: u32,
        failures: u32,
        last_error: String,
    },
    /// Cancelled while at `page`.
    Interrupted { page: u32 },
}

/// Summary of one sequential walk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkReport {
    pub start_page: u32,
    /// Exclusive upper bound: the page number that ended the walk.
    pub last_page_number: u32,
    pub outcome: WalkOutcome,
    /// Pages downloaded in this run, ascending.
    pub fetched: Vec<u32>,
    /// Pages served from the store without a request, ascending.
    pub cached: Vec<u32>,
    /// Pages the walker moved past, with the reason.
    pub skipped: Vec<PageError>,
    pub duration_ms: u64,
}

impl WalkReport {
    pub fn is_finished(&self) -> bool {
        self.outcome == WalkOutcome::Finished
    }

    pub fn skipped_pages(&self) -> Vec<u32> {
        self.skipped.iter().map(PageError::page).collect()
    }

    /// Turn an aborted walk into the matching fatal error.
    pub fn into_result(self) -> Result<WalkReport, Page2PdfError> {
        let last_page_number = self.last_page_number;
        match self.outcome {
            WalkOutcome::Finished => Ok(self),
            WalkOutcome::AuthRequired { page, final_url } => Err(Page2PdfError::AuthRequired {
                page,
                final_url,
                last_page_number,
            }),
            WalkOutcome::TooManyFailures {
                page,
                failures,
                last_error,
            } => Err(Page2PdfError::TooManyConsecutiveFailures {
                page,
                failures,
                last_error,
                last_page_number,
            }),
            WalkOutcome::Interrupted { page } => Err(Page2PdfError::Interrupted {
                page,
                last_page_number,
            }),
        }
    }
}

/// The saved output document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssembledDocument {
    pub output_path: PathBuf,
    /// Page numbers in document order (ascending).
    pub pages: Vec<u32>,
    /// Candidates left out of the document, with the reason.
    pub excluded: Vec<PageError>,
    pub duration_ms: u64,
}

impl AssembledDocument {
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// Everything one [`crate::run`] produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub last_page_number: u32,
    /// Set when an assembly phase ran.
    pub output_path: Option<PathBuf>,
    pub walk: Option<WalkReport>,
    pub assembly: Option<AssembledDocument>,
    pub total_duration_ms: u64,
}
