//! Page naming: derive request URLs and cache file names from the base URL.
//!
//! The URL rule is fixed by the remote source: `base + "-" + NNN + ".jpg"`,
//! with the page number zero-padded to at least three digits. Cache files
//! reuse the same padding so a directory listing sorts in page order.

use crate::error::Page2PdfError;
use once_cell::sync::Lazy;
use regex::Regex;

/// A pasted page URL: `...-001.jpg`, `...-12.JPEG`, or a dangling `-`.
static PAGE_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)-(\d+\.(jpe?g|png|gif|webp))?$").expect("valid regex"));

/// Characters that are unsafe or awkward in file names on common platforms.
static UNSAFE_FILENAME_CHARS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[/\\:*?"<>|%=@!#$^&()\-+`~\s]"#).expect("valid regex")
});

/// Longest prefix kept for cache file names.
const MAX_PREFIX_LEN: usize = 200;

/// One page to fetch. Built per page number, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub page_number: u32,
    pub url: String,
}

impl PageRequest {
    pub fn new(base_url: &str, page_number: u32) -> Self {
        Self {
            page_number,
            url: page_url(base_url, page_number),
        }
    }
}

/// `base + "-" + zeroPad3(n) + ".jpg"`.
pub fn page_url(base_url: &str, page_number: u32) -> String {
    format!("{base_url}-{page_number:03}.jpg")
}

/// Validate a user-supplied base URL and strip any pasted page suffix.
pub fn normalize_base_url(input: &str) -> Result<String, Page2PdfError> {
    let trimmed = input.trim();
    let invalid = |reason: &str| Page2PdfError::InvalidBaseUrl {
        url: input.to_string(),
        reason: reason.to_string(),
    };

    if trimmed.is_empty() {
        return Err(invalid("empty"));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(invalid("must start with http:// or https://"));
    }

    let stripped = PAGE_SUFFIX.replace(trimmed, "").to_string();

    let parsed = reqwest::Url::parse(&stripped).map_err(|e| invalid(&e.to_string()))?;
    if parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(invalid("query strings and fragments are not supported"));
    }
    match parsed.path_segments().and_then(|mut s| s.next_back()) {
        Some(last) if !last.is_empty() => Ok(stripped),
        _ => Err(invalid("no file name segment to append page numbers to")),
    }
}

/// File-name prefix derived from the base URL's last path segment.
pub fn name_prefix(base_url: &str) -> String {
    let last = base_url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim();
    let mut prefix = UNSAFE_FILENAME_CHARS.replace_all(last, "_").to_string();
    if prefix.len() > MAX_PREFIX_LEN {
        let mut cut = MAX_PREFIX_LEN;
        while !prefix.is_char_boundary(cut) {
            cut -= 1;
        }
        prefix.truncate(cut);
    }
    if prefix.is_empty() {
        "page".to_string()
    } else {
        prefix
    }
}

/// Cache file name for one page: `{prefix}_{NNN}.jpg`.
pub fn page_file_name(prefix: &str, page_number: u32) -> String {
    format!("{prefix}_{page_number:03}.jpg")
}
