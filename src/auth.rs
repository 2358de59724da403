//! Cookie credentials for sources that sit behind a login.
//!
//! Two inputs are accepted: a raw `Cookie` header value (as copied from a
//! browser's developer tools) or a Netscape `cookies.txt` export. File
//! entries are filtered against the base URL's host, path and scheme, and
//! expired entries are dropped, before they are joined into one header.

use crate::error::Page2PdfError;
use reqwest::Url;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// One entry of a Netscape cookie file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CookieLine {
    pub domain: String,
    pub include_subdomains: bool,
    pub path: String,
    pub secure: bool,
    /// Unix seconds; `None` for session cookies (expiry `0`).
    pub expires: Option<u64>,
    pub name: String,
    pub value: String,
    pub http_only: bool,
}

impl CookieLine {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires, Some(t) if t <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let domain_ok = host == domain
            || ((self.include_subdomains || self.domain.starts_with('.'))
                && host.ends_with(&format!(".{domain}")));
        let path_ok = url.path().starts_with(&self.path) || self.path.is_empty();
        let scheme_ok = !self.secure || url.scheme() == "https";
        domain_ok && path_ok && scheme_ok
    }
}

/// Parse the tab-separated Netscape format.
///
/// Comment and blank lines are ignored; `#HttpOnly_` prefixed lines are
/// entries. Lines without seven fields are skipped with a warning.
pub fn parse_netscape_cookies(text: &str) -> Vec<CookieLine> {
    let mut cookies = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim_end_matches(['\r', '\n']);
        let (line, http_only) = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => (rest, true),
            None => (line, false),
        };
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            warn!(
                "Cookie file line {}: expected 7 tab-separated fields, found {}",
                idx + 1,
                fields.len()
            );
            continue;
        }
        let expires = match fields[4].trim().parse::<u64>() {
            Ok(0) => None,
            Ok(t) => Some(t),
            Err(_) => {
                warn!("Cookie file line {}: bad expiry {:?}", idx + 1, fields[4]);
                continue;
            }
        };
        cookies.push(CookieLine {
            domain: fields[0].trim().to_string(),
            include_subdomains: fields[1].trim().eq_ignore_ascii_case("TRUE"),
            path: fields[2].trim().to_string(),
            secure: fields[3].trim().eq_ignore_ascii_case("TRUE"),
            expires,
            name: fields[5].to_string(),
            value: fields[6].to_string(),
            http_only,
        });
    }
    cookies
}

/// Join the cookies that apply to `url` into a `Cookie` header value.
pub fn cookie_header_for(cookies: &[CookieLine], url: &Url, now: u64) -> Option<String> {
    let pairs: Vec<String> = cookies
        .iter()
        .filter(|c| !c.is_expired(now) && c.matches(url))
        .map(|c| format!("{}={}", c.name, c.value))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join("; "))
    }
}

/// Read a cookie file and build the header for `base_url`.
pub fn load_cookie_file(path: &Path, base_url: &str) -> Result<Option<String>, Page2PdfError> {
    let cookie_err = |detail: String| Page2PdfError::CookieFile {
        path: path.to_path_buf(),
        detail,
    };
    let text = std::fs::read_to_string(path).map_err(|e| cookie_err(e.to_string()))?;
    let url = Url::parse(base_url).map_err(|e| cookie_err(format!("base URL: {e}")))?;

    let cookies = parse_netscape_cookies(&text);
    if cookies.is_empty() {
        return Err(cookie_err("no cookie entries found".into()));
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let header = cookie_header_for(&cookies, &url, now);
    match &header {
        Some(h) => debug!(
            "Using {} cookies from {} for {}",
            h.matches("; ").count() + 1,
            path.display(),
            url.host_str().unwrap_or_default()
        ),
        None => warn!(
            "No unexpired cookie in {} applies to {}",
            path.display(),
            url.host_str().unwrap_or_default()
        ),
    }
    Ok(header)
}

/// Choose the cookie header for a run: an explicit header wins over a file.
pub fn resolve_cookie_header(
    raw: Option<&str>,
    file: Option<&Path>,
    base_url: &str,
) -> Result<Option<String>, Page2PdfError> {
    if let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) {
        let raw = raw
            .strip_prefix("Cookie:")
            .or_else(|| raw.strip_prefix("cookie:"))
            .unwrap_or(raw)
            .trim();
        return Ok(Some(raw.to_string()));
    }
    match file {
        Some(path) => load_cookie_file(path, base_url),
        None => Ok(None),
    }
}
