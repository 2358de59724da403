//! Bind cached pages into one PDF.
//!
//! Each page becomes one PDF page whose MediaBox is the image's native pixel
//! size, with the original JPEG bytes embedded as a `/DCTDecode` image
//! XObject. Nothing is re-encoded.
//!
//! ## Why batches?
//!
//! Reading and header-parsing a page is blocking work, so it runs on the
//! blocking pool with at most `decode_concurrency` pages in flight. Working
//! through `batch_size` pages at a time keeps the number of raw buffers
//! waiting to be appended bounded, and each batch is re-sorted by page
//! number before it is appended so document order never depends on which
//! task finished first.
//!
//! An interrupt is honoured between batches and before the document is
//! written; a cancelled assembly leaves no output file behind.

use crate::error::{Page2PdfError, PageError};
use crate::output::AssembledDocument;
use crate::pipeline::store::{verify_image_bytes, PageStore};
use crate::progress::ProgressCallback;
use futures::stream::{self, StreamExt};
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Document, Object, ObjectId, Stream};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// PDF colour space for a JPEG's component count.
pub fn color_space_for(components: u8) -> &'static str {
    match components {
        1 => "DeviceGray",
        4 => "DeviceCMYK",
        _ => "DeviceRGB",
    }
}

/// Frame header fields of a baseline or progressive JPEG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JpegHeader {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub precision: u8,
}

/// Read the first SOFn segment of a JPEG stream.
///
/// The component count is taken from the file itself rather than from a
/// decoder, which may already have converted CMYK or grayscale data.
pub fn parse_jpeg_header(bytes: &[u8]) -> Result<JpegHeader, String> {
    if !bytes.starts_with(&[0xFF, 0xD8]) {
        return Err("not a JPEG stream".into());
    }
    let mut i = 2;
    while i < bytes.len() {
        if bytes[i] != 0xFF {
            return Err(format!("expected marker at offset {i}"));
        }
        // Fill bytes.
        while i < bytes.len() && bytes[i] == 0xFF {
            i += 1;
        }
        let Some(&marker) = bytes.get(i) else { break };
        i += 1;

        // Markers without a length field.
        if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
            continue;
        }
        if marker == 0xD9 || marker == 0xDA {
            return Err("no frame header before scan data".into());
        }

        let len = match bytes.get(i..i + 2) {
            Some(b) => u16::from_be_bytes([b[0], b[1]]) as usize,
            None => break,
        };
        if len < 2 {
            return Err(format!("invalid segment length {len} at offset {i}"));
        }

        let is_sof = (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_sof {
            let seg = bytes
                .get(i + 2..i + 8)
                .ok_or_else(|| "truncated frame header".to_string())?;
            let header = JpegHeader {
                precision: seg[0],
                height: u16::from_be_bytes([seg[1], seg[2]]) as u32,
                width: u16::from_be_bytes([seg[3], seg[4]]) as u32,
                components: seg[5],
            };
            if header.width == 0 || header.height == 0 {
                return Err(format!("zero dimension {}x{}", header.width, header.height));
            }
            return Ok(header);
        }
        i += len;
    }
    Err("truncated before frame header".into())
}

/// A page ready to append: its bytes and parsed header.
#[derive(Debug)]
struct DecodedPage {
    page_number: u32,
    header: JpegHeader,
    bytes: Vec<u8>,
}

/// DCTDecode in PDF readers only guarantees 8-bit samples.
fn check_embeddable(page: u32, header: &JpegHeader) -> Result<(), PageError> {
    if header.precision != 8 {
        return Err(PageError::Undecodable {
            page,
            detail: format!("{}-bit JPEG samples are not supported", header.precision),
        });
    }
    Ok(())
}

fn decode_page(page: u32, bytes: Vec<u8>) -> Result<DecodedPage, PageError> {
    verify_image_bytes(&bytes).map_err(|detail| PageError::Integrity { page, detail })?;
    let header = parse_jpeg_header(&bytes).map_err(|detail| PageError::Undecodable { page, detail })?;
    check_embeddable(page, &header)?;
    Ok(DecodedPage {
        page_number: page,
        header,
        bytes,
    })
}

// ── PDF construction ──────────────────────────────────────────────────────

struct PdfBuilder {
    doc: Document,
    pages_id: ObjectId,
    kids: Vec<Object>,
}

impl PdfBuilder {
    fn new() -> Self {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    fn add_page(&mut self, page: DecodedPage) -> Result<(), lopdf::Error> {
        let w = i64::from(page.header.width);
        let h = i64::from(page.header.height);

        let image = Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => w,
                "Height" => h,
                "ColorSpace" => color_space_for(page.header.components),
                "BitsPerComponent" => i64::from(page.header.precision),
                "Filter" => "DCTDecode",
            },
            page.bytes,
        )
        .with_compression(false);
        let image_id = self.doc.add_object(image);

        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        Object::Integer(w),
                        Object::Integer(0),
                        Object::Integer(0),
                        Object::Integer(h),
                        Object::Integer(0),
                        Object::Integer(0),
                    ],
                ),
                Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_id = self
            .doc
            .add_object(Stream::new(dictionary! {}, content.encode()?));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![
                Object::Integer(0),
                Object::Integer(0),
                Object::Integer(w),
                Object::Integer(h),
            ],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
            "Contents" => content_id,
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    /// Close the page tree and serialise the document into `out`.
    fn finish<W: Write>(mut self, out: &mut W) -> Result<(), lopdf::Error> {
        let count = self.kids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.save_to(out)?;
        Ok(())
    }
}

// ── Assembler ─────────────────────────────────────────────────────────────

/// Builds the output document from a [`PageStore`].
pub struct DocumentAssembler<'a> {
    store: &'a PageStore,
    batch_size: usize,
    decode_concurrency: usize,
    progress: Option<ProgressCallback>,
    cancel: CancellationToken,
}

impl<'a> DocumentAssembler<'a> {
    pub fn new(store: &'a PageStore, batch_size: usize, decode_concurrency: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
            decode_concurrency: decode_concurrency.max(1),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Option<ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Stop with [`Page2PdfError::Interrupted`] once `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn check_cancelled(&self, next_page: u32, upper_bound: u32) -> Result<(), Page2PdfError> {
        if self.cancel.is_cancelled() {
            warn!("Assembly interrupted before page {}", next_page);
            return Err(Page2PdfError::Interrupted {
                page: next_page,
                last_page_number: upper_bound,
            });
        }
        Ok(())
    }

    /// Assemble pages `1..upper_bound` into `output_path`.
    ///
    /// Missing or unusable pages are logged, recorded in
    /// [`AssembledDocument::excluded`] and left out. Fails with
    /// [`Page2PdfError::NoPages`] when nothing can be included, and with
    /// [`Page2PdfError::Interrupted`] when cancelled before the write.
    pub async fn assemble(
        &self,
        upper_bound: u32,
        output_path: &Path,
    ) -> Result<AssembledDocument, Page2PdfError> {
        let start = Instant::now();
        let candidates: Vec<u32> = (1..upper_bound).collect();
        info!(
            "Assembling up to {} pages from {} into {}",
            candidates.len(),
            self.store.dir().display(),
            output_path.display()
        );
        if let Some(ref cb) = self.progress {
            cb.on_assembly_start(candidates.len());
        }

        let in_flight = self.batch_size.min(self.decode_concurrency);
        let mut builder = PdfBuilder::new();
        let mut pages = Vec::new();
        let mut excluded = Vec::new();

        for batch in candidates.chunks(self.batch_size) {
            self.check_cancelled(batch[0], upper_bound)?;
            let mut decoded: Vec<(u32, Result<DecodedPage, PageError>)> =
                stream::iter(batch.iter().copied().map(|n| async move { (n, self.load(n).await) }))
                    .buffer_unordered(in_flight)
                    .collect()
                    .await;
            decoded.sort_by_key(|(n, _)| *n);

            for (n, result) in decoded {
                match result {
                    Ok(page) => {
                        debug!(
                            "Page {}: {}x{}, {} components",
                            page.page_number, page.header.width, page.header.height, page.header.components
                        );
                        builder
                            .add_page(page)
                            .map_err(|e| Page2PdfError::SerializeFailed {
                                path: output_path.to_path_buf(),
                                detail: format!("page {n}: {e}"),
                            })?;
                        pages.push(n);
                        if let Some(ref cb) = self.progress {
                            cb.on_page_assembled(n);
                        }
                    }
                    Err(e) => {
                        warn!("Excluding page {}: {}", n, e);
                        excluded.push(e);
                    }
                }
            }
        }

        if pages.is_empty() {
            return Err(Page2PdfError::NoPages {
                dir: self.store.dir().to_path_buf(),
                upper_bound,
            });
        }

        self.check_cancelled(upper_bound, upper_bound)?;
        let path = output_path.to_path_buf();
        tokio::task::spawn_blocking(move || write_document(builder, &path))
            .await
            .map_err(|e| Page2PdfError::Internal(format!("PDF writer task panicked: {e}")))??;

        info!(
            "Wrote {} pages to {} ({} excluded)",
            pages.len(),
            output_path.display(),
            excluded.len()
        );
        if let Some(ref cb) = self.progress {
            cb.on_assembly_complete(pages.len(), output_path);
        }

        Ok(AssembledDocument {
            output_path: output_path.to_path_buf(),
            pages,
            excluded,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn load(&self, n: u32) -> Result<DecodedPage, PageError> {
        let bytes = self.store.get(n).await?;
        tokio::task::spawn_blocking(move || decode_page(n, bytes))
            .await
            .map_err(|e| PageError::Io {
                page: n,
                detail: format!("decode task panicked: {e}"),
            })?
    }
}

/// Serialise and write atomically: temp file in the target directory, then
/// rename over `path`.
fn write_document(builder: PdfBuilder, path: &Path) -> Result<(), Page2PdfError> {
    let write_err = |source: std::io::Error| Page2PdfError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent).map_err(write_err)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".page2pdf.")
        .suffix(".pdf.tmp")
        .tempfile_in(&parent)
        .map_err(write_err)?;

    let mut out = BufWriter::new(tmp.as_file_mut());
    builder
        .finish(&mut out)
        .map_err(|e| Page2PdfError::SerializeFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    let file: &mut File = out.into_inner().map_err(|e| write_err(e.into_error()))?;
    file.sync_all().map_err(write_err)?;
    let size = file.metadata().map(|m| m.len()).unwrap_or(0);
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    debug!("Saved {} bytes to {}", size, path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::tests::jpeg_bytes;
    use image::{DynamicImage, GrayImage, ImageFormat};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn gray_jpeg(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::ImageLuma8(GrayImage::from_pixel(w, h, image::Luma([128])));
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Jpeg).unwrap();
        buf.into_inner()
    }

    fn png_bytes(w: u32, h: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgb8(w, h);
        let mut buf = Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png).unwrap();
        buf.into_inner()
    }

    /// Page widths in document order.
    fn page_widths(path: &Path) -> Vec<i64> {
        let doc = Document::load(path).unwrap();
        doc.get_pages()
            .values()
            .map(|id| {
                let page = doc.get_object(*id).unwrap().as_dict().unwrap();
                let mbox = page.get(b"MediaBox").unwrap().as_array().unwrap();
                mbox[2].as_i64().unwrap()
            })
            .collect()
    }

    async fn store_with(dir: &TempDir, pages: &[(u32, Vec<u8>)]) -> PageStore {
        let store = PageStore::new(dir.path().join("pages"), "book");
        store.ensure_dir().await.unwrap();
        for (n, bytes) in pages {
            store.put(*n, bytes.clone()).await.unwrap();
        }
        store
    }

    #[test]
    fn parses_rgb_and_gray_headers() {
        let rgb = parse_jpeg_header(&jpeg_bytes(31, 17)).unwrap();
        assert_eq!((rgb.width, rgb.height, rgb.components), (31, 17, 3));
        let gray = parse_jpeg_header(&gray_jpeg(5, 9)).unwrap();
        assert_eq!((gray.width, gray.height, gray.components), (5, 9, 1));
    }

    #[test]
    fn rejects_non_jpeg_and_truncated() {
        assert!(parse_jpeg_header(&png_bytes(2, 2)).is_err());
        assert!(parse_jpeg_header(&[0xFF, 0xD8, 0xFF]).is_err());
        assert!(parse_jpeg_header(b"").is_err());
    }

    #[test]
    fn color_space_mapping() {
        assert_eq!(color_space_for(1), "DeviceGray");
        assert_eq!(color_space_for(3), "DeviceRGB");
        assert_eq!(color_space_for(4), "DeviceCMYK");
        assert_eq!(color_space_for(2), "DeviceRGB");
    }

    #[tokio::test]
    async fn pages_appear_in_ascending_order() {
        let dir = TempDir::new().unwrap();
        let pages: Vec<_> = (1..=7).map(|n| (n, jpeg_bytes(10 + n, 20))).collect();
        let store = store_with(&dir, &pages).await;
        let out = dir.path().join("out.pdf");

        // Batch of 3 with 3 decoders in flight exercises the re-sort.
        let doc = DocumentAssembler::new(&store, 3, 3)
            .assemble(8, &out)
            .await
            .unwrap();

        assert_eq!(doc.pages, vec![1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(page_widths(&out), vec![11, 12, 13, 14, 15, 16, 17]);
    }

    #[tokio::test]
    async fn missing_and_non_jpeg_pages_are_excluded() {
        let dir = TempDir::new().unwrap();
        let store = store_with(
            &dir,
            &[(1, jpeg_bytes(11, 5)), (2, png_bytes(12, 5)), (4, jpeg_bytes(14, 5))],
        )
        .await;
        let out = dir.path().join("out.pdf");

        let doc = DocumentAssembler::new(&store, 50, 8)
            .assemble(5, &out)
            .await
            .unwrap();

        assert_eq!(doc.pages, vec![1, 4]);
        let reasons: Vec<u32> = doc.excluded.iter().map(PageError::page).collect();
        assert_eq!(reasons, vec![2, 3]);
        assert!(matches!(doc.excluded[0], PageError::Undecodable { page: 2, .. }));
        assert!(matches!(doc.excluded[1], PageError::Missing { page: 3, .. }));
        assert_eq!(page_widths(&out), vec![11, 14]);
    }

    #[tokio::test]
    async fn image_is_embedded_verbatim() {
        let dir = TempDir::new().unwrap();
        let original = gray_jpeg(6, 4);
        let store = store_with(&dir, &[(1, original.clone())]).await;
        let out = dir.path().join("out.pdf");

        DocumentAssembler::new(&store, 50, 8)
            .assemble(2, &out)
            .await
            .unwrap();

        let doc = Document::load(&out).unwrap();
        let image = doc
            .objects
            .values()
            .filter_map(|o| o.as_stream().ok())
            .find(|s| {
                s.dict
                    .get(b"Subtype")
                    .and_then(|v| v.as_name())
                    .map(|n| n == b"Image")
                    .unwrap_or(false)
            })
            .expect("image stream");
        assert_eq!(image.content, original);
        assert_eq!(image.dict.get(b"ColorSpace").unwrap().as_name().unwrap(), b"DeviceGray");
        assert_eq!(image.dict.get(b"Filter").unwrap().as_name().unwrap(), b"DCTDecode");
        assert_eq!(image.dict.get(b"BitsPerComponent").unwrap().as_i64().unwrap(), 8);
    }

    #[test]
    fn twelve_bit_jpeg_is_not_embeddable() {
        let mut bytes = jpeg_bytes(4, 4);
        let sof = bytes
            .windows(2)
            .position(|w| w == [0xFF, 0xC0])
            .expect("baseline frame header");
        bytes[sof + 4] = 12;

        let header = parse_jpeg_header(&bytes).unwrap();
        assert_eq!(header.precision, 12);
        assert!(matches!(
            check_embeddable(7, &header),
            Err(PageError::Undecodable { page: 7, .. })
        ));

        let eight_bit = parse_jpeg_header(&jpeg_bytes(4, 4)).unwrap();
        assert_eq!(eight_bit.precision, 8);
        assert!(check_embeddable(7, &eight_bit).is_ok());
    }

    #[tokio::test]
    async fn assembly_is_deterministic() {
        let dir = TempDir::new().unwrap();
        let pages: Vec<_> = (1..=4).map(|n| (n, jpeg_bytes(20 + n, 8))).collect();
        let store = store_with(&dir, &pages).await;
        let a = dir.path().join("a.pdf");
        let b = dir.path().join("b.pdf");

        let first = DocumentAssembler::new(&store, 2, 2).assemble(5, &a).await.unwrap();
        let second = DocumentAssembler::new(&store, 2, 2).assemble(5, &b).await.unwrap();

        assert_eq!(first.pages, second.pages);
        assert_eq!(page_widths(&a), page_widths(&b));
    }

    #[tokio::test]
    async fn no_pages_is_fatal_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &[]).await;
        let out = dir.path().join("out.pdf");

        let err = DocumentAssembler::new(&store, 50, 8)
            .assemble(4, &out)
            .await
            .unwrap_err();

        assert!(matches!(err, Page2PdfError::NoPages { upper_bound: 4, .. }));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn output_directory_is_created() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &[(1, jpeg_bytes(3, 3))]).await;
        let out = dir.path().join("nested/deeper/book.pdf");

        DocumentAssembler::new(&store, 50, 8)
            .assemble(2, &out)
            .await
            .unwrap();

        assert!(out.exists());
        let leftovers: Vec<_> = std::fs::read_dir(out.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn cancelled_assembly_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store_with(&dir, &[(1, jpeg_bytes(3, 3)), (2, jpeg_bytes(4, 3))]).await;
        let out = dir.path().join("out.pdf");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = DocumentAssembler::new(&store, 50, 8)
            .with_cancel(cancel)
            .assemble(3, &out)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Page2PdfError::Interrupted {
                page: 1,
                last_page_number: 3
            }
        ));
        assert!(!out.exists());
    }

    /// Cancels the token once a given page has been appended.
    struct CancelAfter {
        page: u32,
        cancel: CancellationToken,
    }

    impl crate::progress::FetchProgressCallback for CancelAfter {
        fn on_page_assembled(&self, page_num: u32) {
            if page_num == self.page {
                self.cancel.cancel();
            }
        }
    }

    #[tokio::test]
    async fn interrupt_between_batches_stops_before_next_batch() {
        let dir = TempDir::new().unwrap();
        let pages: Vec<_> = (1..=5).map(|n| (n, jpeg_bytes(10 + n, 6))).collect();
        let store = store_with(&dir, &pages).await;
        let out = dir.path().join("out.pdf");
        let cancel = CancellationToken::new();
        let progress: ProgressCallback = std::sync::Arc::new(CancelAfter {
            page: 2,
            cancel: cancel.clone(),
        });

        let err = DocumentAssembler::new(&store, 2, 2)
            .with_progress(Some(progress))
            .with_cancel(cancel)
            .assemble(6, &out)
            .await
            .unwrap_err();

        assert!(matches!(err, Page2PdfError::Interrupted { page: 3, .. }), "{err}");
        assert!(!out.exists());
        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }
}
