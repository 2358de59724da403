//! Integration tests: the real HTTP fetcher against a local mock server,
//! through to a PDF on disk.
//!
//! Every test runs offline on `wiremock`; unmatched paths answer 404,
//! which is exactly the end-of-sequence signal.

use image::{DynamicImage, ImageFormat, RgbImage};
use page2pdf::pipeline::fetch::RetryPolicy;
use page2pdf::pipeline::identity::IdentityProvider;
use page2pdf::pipeline::request::PageRequest;
use page2pdf::{
    run, DownloadConfig, FetchOutcome, Fetcher, Page2PdfError, PageError, PageSource, RunMode,
    WalkOutcome,
};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ── Test helpers ─────────────────────────────────────────────────────────────

/// Route library logs to the test harness; `RUST_LOG=page2pdf=debug` to see them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 10, 10])));
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}

fn page_path(n: u32) -> String {
    format!("/images/book-{n:03}.jpg")
}

/// Serve page `n` as a JPEG `10 + n` pixels wide.
async fn mount_page(server: &MockServer, n: u32) {
    Mock::given(method("GET"))
        .and(path(page_path(n)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(jpeg(10 + n, 16)),
        )
        .mount(server)
        .await;
}

fn config(server: &MockServer, dir: &TempDir, mode: RunMode) -> DownloadConfig {
    init_tracing();
    DownloadConfig::builder()
        .base_url(format!("{}/images/book", server.uri()))
        .delay(Duration::ZERO)
        .retry_backoff(Duration::from_millis(50))
        .user_agent("page2pdf-tests")
        .page_dir(dir.path().join("download"))
        .output_path(dir.path().join("combined.pdf"))
        .mode(mode)
        .build()
        .unwrap()
}

fn pdf_page_widths(path: &Path) -> Vec<i64> {
    let doc = lopdf::Document::load(path).unwrap();
    doc.get_pages()
        .values()
        .map(|id| {
            let page = doc.get_object(*id).unwrap().as_dict().unwrap();
            page.get(b"MediaBox").unwrap().as_array().unwrap()[2]
                .as_i64()
                .unwrap()
        })
        .collect()
}

async fn request_count(server: &MockServer) -> usize {
    server.received_requests().await.map_or(0, |r| r.len())
}

/// Hands out `agent-<attempt>` and remembers every attempt number asked for.
#[derive(Default)]
struct RecordingIdentity {
    attempts: Mutex<Vec<u32>>,
}

impl IdentityProvider for RecordingIdentity {
    fn user_agent(&self, attempt: u32) -> String {
        self.attempts.lock().unwrap().push(attempt);
        format!("agent-{attempt}")
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn five_pages_then_not_found_binds_five_pages() {
    let server = MockServer::start().await;
    for n in 1..=5 {
        mount_page(&server, n).await;
    }
    let dir = TempDir::new().unwrap();
    let cfg = config(&server, &dir, RunMode::Full);

    let out = run(&cfg, CancellationToken::new()).await.unwrap();

    assert_eq!(out.last_page_number, 6);
    let walk = out.walk.unwrap();
    assert_eq!(walk.outcome, WalkOutcome::Finished);
    assert_eq!(walk.fetched, vec![1, 2, 3, 4, 5]);
    let pdf = dir.path().join("combined.pdf");
    assert_eq!(out.output_path.as_deref(), Some(pdf.as_path()));
    assert_eq!(pdf_page_widths(&pdf), vec![11, 12, 13, 14, 15]);
    for n in 1..=5 {
        assert!(dir.path().join(format!("download/book_{n:03}.jpg")).exists());
    }
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let server = MockServer::start().await;
    for n in 1..=5 {
        mount_page(&server, n).await;
    }
    let dir = TempDir::new().unwrap();
    let cfg = config(&server, &dir, RunMode::Full);

    let first = run(&cfg, CancellationToken::new()).await.unwrap();
    let before = request_count(&server).await;
    let second = run(&cfg, CancellationToken::new()).await.unwrap();
    let after = request_count(&server).await;

    // Only the end-of-sequence request for page 6 goes out again.
    assert_eq!(after - before, 1);
    assert_eq!(second.last_page_number, first.last_page_number);
    assert_eq!(second.walk.unwrap().cached, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn login_redirect_aborts_and_forced_assembly_binds_the_rest() {
    let server = MockServer::start().await;
    mount_page(&server, 1).await;
    mount_page(&server, 2).await;
    Mock::given(method("GET"))
        .and(path(page_path(3)))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/login.html"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/login.html"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<form>sign in</form>"),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();

    let err = run(&config(&server, &dir, RunMode::Full), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, Page2PdfError::AuthRequired { page: 3, .. }), "{err}");
    assert_eq!(err.exit_code(), 2);
    assert_eq!(err.last_page_number(), Some(3));
    assert!(!dir.path().join("combined.pdf").exists());

    let out = run(&config(&server, &dir, RunMode::AssembleOnly), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(out.assembly.unwrap().pages, vec![1, 2]);
    assert_eq!(pdf_page_widths(&dir.path().join("combined.pdf")), vec![11, 12]);
}

#[tokio::test]
async fn rate_limit_waits_for_retry_after_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, 1).await;
    let dir = TempDir::new().unwrap();
    let fetcher = Fetcher::from_config(&config(&server, &dir, RunMode::Full)).unwrap();
    let request = PageRequest::new(&format!("{}/images/book", server.uri()), 1);

    let start = Instant::now();
    let outcome = fetcher.fetch(&request).await;

    assert!(start.elapsed() >= Duration::from_secs(2));
    assert!(matches!(outcome, FetchOutcome::Success { .. }), "{outcome:?}");
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn persistent_server_error_uses_exactly_max_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let cfg = config(&server, &dir, RunMode::Full);
    assert_eq!(cfg.max_retries, 3);
    let fetcher = Fetcher::from_config(&cfg).unwrap();
    let request = PageRequest::new(&cfg.base_url, 1);

    let start = Instant::now();
    let outcome = fetcher.fetch(&request).await;

    assert_eq!(outcome, FetchOutcome::TransientServerError { status: 503 });
    // 50ms + 100ms of backoff between the three attempts.
    assert!(start.elapsed() >= Duration::from_millis(150));
    server.verify().await;
}

#[tokio::test]
async fn html_served_under_image_name_is_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>blocked</html>"),
        )
        .mount(&server)
        .await;
    mount_page(&server, 2).await;
    let dir = TempDir::new().unwrap();

    let out = run(&config(&server, &dir, RunMode::Full), CancellationToken::new())
        .await
        .unwrap();

    let walk = out.walk.unwrap();
    assert_eq!(walk.fetched, vec![2]);
    assert!(matches!(walk.skipped[..], [PageError::InvalidContent { page: 1, .. }]));
    assert_eq!(out.assembly.unwrap().pages, vec![2]);
}

#[tokio::test]
async fn identity_and_cookies_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .and(header("user-agent", "page2pdf-tests"))
        .and(header("cookie", "session=abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(jpeg(8, 8)),
        )
        .mount(&server)
        .await;
    let dir = TempDir::new().unwrap();
    let cfg = DownloadConfig::builder()
        .base_url(format!("{}/images/book", server.uri()))
        .delay(Duration::ZERO)
        .user_agent("page2pdf-tests")
        .cookie_header(Some("session=abc".into()))
        .page_dir(dir.path().join("download"))
        .output_path(dir.path().join("combined.pdf"))
        .mode(RunMode::FetchOnly)
        .build()
        .unwrap();

    let out = run(&cfg, CancellationToken::new()).await.unwrap();

    assert_eq!(out.walk.unwrap().fetched, vec![1]);
    assert!(out.assembly.is_none());
    assert!(!dir.path().join("combined.pdf").exists());
}

#[tokio::test]
async fn pasted_page_url_is_normalised() {
    let server = MockServer::start().await;
    mount_page(&server, 1).await;
    mount_page(&server, 2).await;
    let dir = TempDir::new().unwrap();
    let cfg = DownloadConfig::builder()
        .base_url(format!("{}/images/book-001.jpg", server.uri()))
        .delay(Duration::ZERO)
        .page_dir(dir.path().join("download"))
        .output_path(dir.path().join("combined.pdf"))
        .build()
        .unwrap();
    assert_eq!(cfg.base_url, format!("{}/images/book", server.uri()));

    let out = run(&cfg, CancellationToken::new()).await.unwrap();

    assert_eq!(out.last_page_number, 3);
    assert_eq!(out.assembly.unwrap().page_count(), 2);
}

#[tokio::test]
async fn rate_limit_budget_exhausted_skips_the_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .expect(3)
        .mount(&server)
        .await;
    mount_page(&server, 2).await;
    let dir = TempDir::new().unwrap();
    let cfg = DownloadConfig::builder()
        .base_url(format!("{}/images/book", server.uri()))
        .delay(Duration::ZERO)
        .max_rate_limit_waits(2)
        .page_dir(dir.path().join("download"))
        .output_path(dir.path().join("combined.pdf"))
        .mode(RunMode::FetchOnly)
        .build()
        .unwrap();

    let outcome = Fetcher::from_config(&cfg)
        .unwrap()
        .fetch(&PageRequest::new(&cfg.base_url, 1))
        .await;
    assert_eq!(outcome, FetchOutcome::RateLimited { retry_after_secs: 0 });
    server.verify().await;
    server.reset().await;

    // Through the walker the throttled page is a skipped failure, not an abort.
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "0"))
        .mount(&server)
        .await;
    mount_page(&server, 2).await;
    let walk = run(&cfg, CancellationToken::new()).await.unwrap().walk.unwrap();

    assert_eq!(walk.outcome, WalkOutcome::Finished);
    assert_eq!(walk.fetched, vec![2]);
    assert!(matches!(walk.skipped[..], [PageError::RateLimited { page: 1, .. }]));
}

#[tokio::test]
async fn rate_limit_without_retry_after_uses_default_wait() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_page(&server, 1).await;
    let dir = TempDir::new().unwrap();
    let cfg = DownloadConfig::builder()
        .base_url(format!("{}/images/book", server.uri()))
        .default_retry_after(Duration::from_millis(400))
        .page_dir(dir.path().join("download"))
        .build()
        .unwrap();
    let fetcher = Fetcher::from_config(&cfg).unwrap();

    let start = Instant::now();
    let outcome = fetcher.fetch(&PageRequest::new(&cfg.base_url, 1)).await;

    assert!(start.elapsed() >= Duration::from_millis(400));
    assert!(matches!(outcome, FetchOutcome::Success { .. }), "{outcome:?}");
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn each_retry_asks_for_a_fresh_identity() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .and(header("user-agent", "agent-1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(page_path(1)))
        .and(header("user-agent", "agent-2"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "image/jpeg")
                .set_body_bytes(jpeg(8, 8)),
        )
        .expect(1)
        .mount(&server)
        .await;
    let identity = Arc::new(RecordingIdentity::default());
    let fetcher = Fetcher::new(
        reqwest::Client::new(),
        identity.clone(),
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
            default_retry_after: Duration::from_millis(10),
            max_rate_limit_waits: 1,
        },
    );
    let request = PageRequest::new(&format!("{}/images/book", server.uri()), 1);

    let outcome = fetcher.fetch(&request).await;

    assert!(matches!(outcome, FetchOutcome::Success { .. }), "{outcome:?}");
    assert_eq!(*identity.attempts.lock().unwrap(), vec![1, 2]);
    server.verify().await;
}
