//! CLI binary for page2pdf.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `DownloadConfig`, wires Ctrl-C to the cancellation token, and turns the
//! fatal error into the process exit code.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use page2pdf::error::EXIT_FAILURE;
use page2pdf::{
    resolve_cookie_header, run, DownloadConfig, FetchProgressCallback, Page2PdfError,
    ProgressCallback, RunMode, RunOutput,
};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn yellow(s: &str) -> String {
    format!("\x1b[33m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress: a spinner (or a bar when the page count is known)
/// during the walk, then a bar over the candidate pages during assembly.
struct CliProgressCallback {
    bar: ProgressBar,
    skipped: AtomicUsize,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(TICKS),
        );
        bar.set_prefix("Starting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self {
            bar,
            skipped: AtomicUsize::new(0),
        })
    }

    fn counted_style(unit: &str) -> ProgressStyle {
        ProgressStyle::with_template(&format!(
            "{{spinner:.cyan}} {{prefix:.bold}}  \
             [{{bar:42.green/238}}] {{pos:>3}}/{{len}} {unit}  \
             ⏱ {{elapsed_precise}}  {{msg}}"
        ))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS)
    }
}

impl FetchProgressCallback for CliProgressCallback {
    fn on_walk_start(&self, start_page: u32, expected_pages: Option<u32>) {
        if let Some(total) = expected_pages {
            self.bar.set_length(total as u64);
            self.bar.set_position(start_page.saturating_sub(1) as u64);
            self.bar.set_style(Self::counted_style("pages"));
        }
        self.bar.set_prefix("Fetching");
    }

    fn on_page_start(&self, page_num: u32) {
        self.bar.set_message(format!("page {page_num:03}"));
    }

    fn on_page_cached(&self, page_num: u32) {
        self.bar.set_message(format!("page {page_num:03} (cached)"));
        self.bar.inc(1);
    }

    fn on_page_fetched(&self, page_num: u32, bytes: usize) {
        self.bar.println(format!(
            "  {} Page {:03}  {}",
            green("✓"),
            page_num,
            dim(&format!("{:>8} bytes", bytes)),
        ));
        self.bar.inc(1);
    }

    fn on_page_skipped(&self, page_num: u32, reason: &str) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
        let msg = if reason.chars().count() > 80 {
            format!("{}\u{2026}", reason.chars().take(79).collect::<String>())
        } else {
            reason.to_string()
        };
        self.bar
            .println(format!("  {} Page {:03}  {}", red("✗"), page_num, red(&msg)));
        self.bar.inc(1);
    }

    fn on_walk_complete(&self, last_page_number: u32, fetched: usize, skipped: usize) {
        self.bar.println(format!(
            "{} Walk stopped at page {:03}: {} fetched, {} skipped",
            bold("◆"),
            last_page_number,
            fetched,
            skipped
        ));
    }

    fn on_assembly_start(&self, candidate_pages: usize) {
        self.bar.set_length(candidate_pages as u64);
        self.bar.set_position(0);
        self.bar.set_style(Self::counted_style("pages"));
        self.bar.set_prefix("Binding");
        self.bar.set_message("");
        self.bar.reset_eta();
    }

    fn on_page_assembled(&self, _page_num: u32) {
        self.bar.inc(1);
    }

    fn on_assembly_complete(&self, _page_count: usize, _output: &Path) {
        self.bar.finish_and_clear();
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Walk pages 001, 002, ... until 404, then bind them
  page2pdf https://example.com/viewer/images/book

  # A pasted page URL works too; the "-001.jpg" suffix is stripped
  page2pdf https://example.com/viewer/images/book-001.jpg -o book.pdf

  # Behind a login: pass the browser's cookies
  page2pdf --cookie-file cookies.txt https://example.com/viewer/images/book

  # Only download (resume later), or only bind what is already cached
  page2pdf --mode fetch-only https://example.com/viewer/images/book
  page2pdf --mode assemble-only https://example.com/viewer/images/book

  # Be gentler with the server
  page2pdf --delay 3 --failure-ceiling 5 https://example.com/viewer/images/book

EXIT CODES:
  0    success
  1    any other error (bad URL, nothing to assemble, write failure)
  2    authentication required (page redirected to a login page)
  3    too many consecutive page failures
  130  interrupted (Ctrl-C); cached pages are kept

ENVIRONMENT VARIABLES:
  Every flag can be set with PAGE2PDF_<FLAG>, e.g. PAGE2PDF_DELAY=2.
  RUST_LOG overrides the log filter (e.g. RUST_LOG=page2pdf=debug).
"#;

/// Download a numbered image sequence and bind it into one PDF.
#[derive(Parser, Debug)]
#[command(
    name = "page2pdf",
    version,
    about = "Download a numbered image sequence and bind it into one PDF",
    long_about = "Fetch page images named <base>-001.jpg, <base>-002.jpg, ... one at a time \
until the server answers 404, caching each page on disk, then embed the original JPEG data \
into a single PDF without re-encoding.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Base URL of the sequence (without "-NNN.jpg"), or any page URL.
    #[arg(env = "PAGE2PDF_BASE_URL")]
    base_url: String,

    /// Output PDF path.
    #[arg(short, long, env = "PAGE2PDF_OUTPUT", default_value = "combined.pdf")]
    output: PathBuf,

    /// Directory holding downloaded pages (also the resume cache).
    #[arg(short, long, env = "PAGE2PDF_DIR", default_value = "download")]
    dir: PathBuf,

    /// First page number to request.
    #[arg(long, env = "PAGE2PDF_START", default_value_t = 1,
          value_parser = clap::value_parser!(u32).range(1..))]
    start: u32,

    /// Expected number of pages (progress display only).
    #[arg(long, env = "PAGE2PDF_EXPECTED_PAGES")]
    expected_pages: Option<u32>,

    /// Base delay between pages in seconds (jittered ×0.5–1.5).
    #[arg(long, env = "PAGE2PDF_DELAY", default_value = "1", value_parser = parse_secs)]
    delay: Duration,

    /// Attempts per page for 5xx and network errors.
    #[arg(long, env = "PAGE2PDF_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Initial backoff in seconds; doubles per attempt.
    #[arg(long, env = "PAGE2PDF_RETRY_BACKOFF", default_value = "2", value_parser = parse_secs)]
    retry_backoff: Duration,

    /// Wait in seconds on 429 when the server sends no Retry-After.
    #[arg(long, env = "PAGE2PDF_RETRY_AFTER", default_value = "5", value_parser = parse_secs)]
    retry_after: Duration,

    /// 429 answers tolerated for one page before giving up on it.
    #[arg(long, env = "PAGE2PDF_MAX_RATE_LIMIT_WAITS", default_value_t = 10)]
    max_rate_limit_waits: u32,

    /// Consecutive failed pages that abort the walk.
    #[arg(long, env = "PAGE2PDF_FAILURE_CEILING", default_value_t = 10)]
    failure_ceiling: u32,

    /// Per-request timeout in seconds.
    #[arg(long, env = "PAGE2PDF_TIMEOUT", default_value_t = 30)]
    timeout: u64,

    /// Fixed user-agent (default: rotate browser user-agents).
    #[arg(long, env = "PAGE2PDF_USER_AGENT")]
    user_agent: Option<String>,

    /// Raw Cookie header value, e.g. "session=abc; token=xyz".
    #[arg(long, env = "PAGE2PDF_COOKIE", conflicts_with = "cookie_file")]
    cookie: Option<String>,

    /// Netscape cookies.txt export; entries are filtered by host and expiry.
    #[arg(long, env = "PAGE2PDF_COOKIE_FILE")]
    cookie_file: Option<PathBuf>,

    /// Which phases to run.
    #[arg(long, env = "PAGE2PDF_MODE", value_enum, default_value = "full")]
    mode: ModeArg,

    /// Pages decoded per assembly batch.
    #[arg(long, env = "PAGE2PDF_BATCH_SIZE", default_value_t = 50)]
    batch_size: usize,

    /// Concurrent header decodes within a batch.
    #[arg(long, env = "PAGE2PDF_DECODE_CONCURRENCY", default_value_t = 8)]
    decode_concurrency: usize,

    /// Print the run report as JSON on stdout.
    #[arg(long, env = "PAGE2PDF_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, env = "PAGE2PDF_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "PAGE2PDF_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "PAGE2PDF_QUIET")]
    quiet: bool,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ModeArg {
    Full,
    FetchOnly,
    AssembleOnly,
}

impl From<ModeArg> for RunMode {
    fn from(v: ModeArg) -> Self {
        match v {
            ModeArg::Full => RunMode::Full,
            ModeArg::FetchOnly => RunMode::FetchOnly,
            ModeArg::AssembleOnly => RunMode::AssembleOnly,
        }
    }
}

fn parse_secs(s: &str) -> Result<Duration, String> {
    let secs: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("'{s}' is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("'{s}': {e}"))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO-level library logs; verbose wins.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match real_main(&cli, show_progress).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e
                .downcast_ref::<Page2PdfError>()
                .map(Page2PdfError::exit_code)
                .unwrap_or(EXIT_FAILURE);
            eprintln!("{} {:#}", red("error:"), e);
            if let Some(last) = e
                .downcast_ref::<Page2PdfError>()
                .and_then(Page2PdfError::last_page_number)
            {
                eprintln!(
                    "{}",
                    dim(&format!(
                        "   stopped before page {last:03}; rerun to resume, or use --mode assemble-only"
                    ))
                );
            }
            ExitCode::from(code)
        }
    }
}

async fn real_main(cli: &Cli, show_progress: bool) -> Result<()> {
    // ── Cancellation ─────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n{}", yellow("Interrupted; finishing the current step…"));
            on_signal.cancel();
        }
    });

    // ── Build config ─────────────────────────────────────────────────────
    let progress_cb: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn FetchProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, progress_cb)?;

    // ── Run ──────────────────────────────────────────────────────────────
    let output = run(&config, cancel).await.context("Run failed")?;

    if cli.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !cli.quiet {
        print_summary(&output);
    }
    Ok(())
}

/// Map CLI args to `DownloadConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<DownloadConfig> {
    // Normalise first so cookie filtering sees the same host as the walker.
    let base_url = page2pdf::pipeline::request::normalize_base_url(&cli.base_url)
        .context("Invalid base URL")?;
    let cookies = resolve_cookie_header(cli.cookie.as_deref(), cli.cookie_file.as_deref(), &base_url)
        .context("Failed to load cookies")?;

    let mut builder = DownloadConfig::builder()
        .base_url(base_url)
        .start_page(cli.start)
        .expected_pages(cli.expected_pages)
        .delay(cli.delay)
        .max_retries(cli.max_retries)
        .retry_backoff(cli.retry_backoff)
        .default_retry_after(cli.retry_after)
        .max_rate_limit_waits(cli.max_rate_limit_waits)
        .failure_ceiling(cli.failure_ceiling)
        .request_timeout_secs(cli.timeout)
        .cookie_header(cookies)
        .page_dir(&cli.dir)
        .output_path(&cli.output)
        .mode(cli.mode.into())
        .batch_size(cli.batch_size)
        .decode_concurrency(cli.decode_concurrency);

    if let Some(ref ua) = cli.user_agent {
        builder = builder.user_agent(ua.clone());
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

fn print_summary(output: &RunOutput) {
    if let Some(ref walk) = output.walk {
        eprintln!(
            "{}  {} fetched, {} cached, {} skipped  {}ms",
            if walk.skipped.is_empty() {
                green("✔")
            } else {
                yellow("⚠")
            },
            walk.fetched.len(),
            walk.cached.len(),
            walk.skipped.len(),
            walk.duration_ms,
        );
        for err in &walk.skipped {
            eprintln!("   {} {}", red("✗"), err);
        }
    }
    if let Some(ref doc) = output.assembly {
        eprintln!(
            "{}  {} pages  →  {}",
            green("✔"),
            doc.page_count(),
            bold(&doc.output_path.display().to_string()),
        );
        for err in &doc.excluded {
            eprintln!("   {} {}", yellow("–"), err);
        }
    } else {
        eprintln!(
            "   pages cached up to {:03}; run with --mode assemble-only to bind them",
            output.last_page_number.saturating_sub(1)
        );
    }
}
