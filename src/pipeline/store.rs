//! On-disk page cache keyed by page number.
//!
//! Every page lands in the store through a [`StagedPage`]: the bytes go to a
//! hidden temp file next to the final name and are renamed into place only
//! once fully written. Dropping a `StagedPage` without committing it (fetch
//! failed, walk cancelled, task aborted) deletes the temp file, so the final
//! name never holds half a page and no stray `.part` files pile up.
//!
//! A cached file only counts as present if it passes [`verify_image_bytes`];
//! a truncated or empty file is treated as absent and gets re-fetched.

use crate::error::{Page2PdfError, PageError};
use crate::pipeline::request::{name_prefix, page_file_name};
use image::{ImageFormat, ImageReader};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tracing::{debug, warn};

/// A page file known to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPage {
    pub page_number: u32,
    pub path: PathBuf,
    pub validated: bool,
}

/// Directory of `{prefix}_{NNN}.jpg` files.
#[derive(Debug, Clone)]
pub struct PageStore {
    dir: PathBuf,
    prefix: String,
}

impl PageStore {
    /// A store over `dir` using an explicit file-name prefix.
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    /// A store whose prefix is derived from the base URL's last segment.
    pub fn for_base_url(dir: impl Into<PathBuf>, base_url: &str) -> Self {
        Self::new(dir, name_prefix(base_url))
    }

    /// Create the page directory if needed.
    pub async fn ensure_dir(&self) -> Result<(), Page2PdfError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Page2PdfError::Store {
                path: self.dir.clone(),
                source: e,
            })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path_for(&self, page_number: u32) -> PathBuf {
        self.dir.join(page_file_name(&self.prefix, page_number))
    }

    /// True iff the page file exists and passes the integrity check.
    pub async fn has(&self, page_number: u32) -> bool {
        self.check(page_number).await.is_ok()
    }

    /// Validate the cached file for `page_number`.
    pub async fn check(&self, page_number: u32) -> Result<CachedPage, PageError> {
        let bytes = self.get(page_number).await?;
        let path = self.path_for(page_number);
        verify_image_bytes(&bytes).map_err(|detail| PageError::Integrity {
            page: page_number,
            detail,
        })?;
        Ok(CachedPage {
            page_number,
            path,
            validated: true,
        })
    }

    /// Raw bytes of the cached file.
    pub async fn get(&self, page_number: u32) -> Result<Vec<u8>, PageError> {
        let path = self.path_for(page_number);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(PageError::Missing {
                page: page_number,
                path,
            }),
            Err(e) => Err(PageError::Io {
                page: page_number,
                detail: format!("{}: {e}", path.display()),
            }),
        }
    }

    /// Reserve a temp file for `page_number`; see [`StagedPage`].
    pub fn stage(&self, page_number: u32) -> Result<StagedPage, PageError> {
        let io_err = |e: std::io::Error| PageError::Io {
            page: page_number,
            detail: format!("staging in {}: {e}", self.dir.display()),
        };
        let temp = tempfile::Builder::new()
            .prefix(&format!(".{}_{page_number:03}.", self.prefix))
            .suffix(".part")
            .tempfile_in(&self.dir)
            .map_err(io_err)?
            .into_temp_path();
        debug!("Page {}: staged {}", page_number, temp.display());
        Ok(StagedPage {
            page_number,
            final_path: self.path_for(page_number),
            temp,
        })
    }

    /// Atomically write `bytes` as page `page_number`, replacing any old file.
    pub async fn put(&self, page_number: u32, bytes: Vec<u8>) -> Result<CachedPage, PageError> {
        self.stage(page_number)?.commit(bytes).await
    }

    /// Largest page number with a file in the store, valid or not.
    pub async fn highest_cached(&self) -> Result<Option<u32>, Page2PdfError> {
        let store_err = |e: std::io::Error| Page2PdfError::Store {
            path: self.dir.clone(),
            source: e,
        };
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(e)),
        };

        let lead = format!("{}_", self.prefix);
        let mut highest = None;
        while let Some(entry) = entries.next_entry().await.map_err(store_err)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let number = name
                .strip_prefix(&lead)
                .and_then(|rest| rest.strip_suffix(".jpg"))
                .and_then(|digits| digits.parse::<u32>().ok());
            if let Some(n) = number {
                highest = highest.max(Some(n));
            }
        }
        Ok(highest)
    }
}

/// Scoped reservation of a temp file for one page.
///
/// Created before the fetch starts. [`commit`](Self::commit) writes the bytes
/// and renames the temp file over the final name; any other exit path drops
/// the guard and the temp file is deleted.
#[derive(Debug)]
pub struct StagedPage {
    page_number: u32,
    final_path: PathBuf,
    temp: TempPath,
}

impl StagedPage {
    pub fn page_number(&self) -> u32 {
        self.page_number
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Write, flush and rename into place.
    ///
    /// Runs on the blocking pool. If the awaiting future is dropped the
    /// blocking task still finishes: the page either lands complete or the
    /// temp file is removed.
    pub async fn commit(self, bytes: Vec<u8>) -> Result<CachedPage, PageError> {
        let page = self.page_number;
        tokio::task::spawn_blocking(move || self.commit_blocking(&bytes))
            .await
            .map_err(|e| PageError::Io {
                page,
                detail: format!("commit task panicked: {e}"),
            })?
    }

    fn commit_blocking(self, bytes: &[u8]) -> Result<CachedPage, PageError> {
        let page = self.page_number;
        let io_err = |what: &str, e: std::io::Error| PageError::Io {
            page,
            detail: format!("{what} {}: {e}", self.final_path.display()),
        };

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.temp)
            .map_err(|e| io_err("opening temp for", e))?;
        file.write_all(bytes).map_err(|e| io_err("writing", e))?;
        file.sync_all().map_err(|e| io_err("syncing", e))?;
        drop(file);

        let final_path = self.final_path.clone();
        self.temp
            .persist(&final_path)
            .map_err(|e| io_err("renaming into", e.error))?;
        debug!("Page {}: committed {} bytes", page, bytes.len());

        Ok(CachedPage {
            page_number: page,
            path: final_path,
            validated: true,
        })
    }
}

/// Structural check for a page image.
///
/// Rejects empty input, unknown formats, headers without readable
/// dimensions, JPEGs missing their SOI/EOI markers and PNGs missing IEND.
/// Returns the pixel dimensions on success.
pub fn verify_image_bytes(bytes: &[u8]) -> Result<(u32, u32), String> {
    if bytes.is_empty() {
        return Err("zero-length file".into());
    }
    let format = image::guess_format(bytes).map_err(|e| format!("unrecognised format: {e}"))?;

    match format {
        ImageFormat::Jpeg => {
            if !bytes.starts_with(&[0xFF, 0xD8]) {
                return Err("JPEG without SOI marker".into());
            }
            if !trim_trailing_padding(bytes).ends_with(&[0xFF, 0xD9]) {
                return Err("truncated JPEG (no EOI marker)".into());
            }
        }
        ImageFormat::Png => {
            let n = bytes.len();
            if n < 12 || &bytes[n - 8..n - 4] != b"IEND" {
                return Err("truncated PNG (no IEND chunk)".into());
            }
        }
        _ => {}
    }

    let (w, h) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| format!("unreadable {format:?} header: {e}"))?;
    if w == 0 || h == 0 {
        warn!("Image header reports {}x{}", w, h);
        return Err(format!("degenerate dimensions {w}x{h}"));
    }
    Ok((w, h))
}

/// Some servers pad JPEG bodies with NULs or newlines after EOI.
fn trim_trailing_padding(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !matches!(b, 0x00 | b'\r' | b'\n' | b' '))
        .map_or(0, |i| i + 1);
    &bytes[..end]
}
