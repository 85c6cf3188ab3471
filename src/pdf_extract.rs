// src/pdf_extract.rs
//
// Invoice PDFs go through two stages: a structural pass with lopdf that
// rejects unreadable and image-only files, then text extraction with
// pdf-extract. Every failure is the uploader's problem, so all of them
// surface as `InvalidPdf`.

use lopdf::{Dictionary, Document};
use sha2::{Digest, Sha256};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

/// Fewer non-whitespace characters than this means there is no usable text
/// layer.
const MIN_TEXT_CHARS: usize = 30;

/// Share of image-only pages from which a file counts as scanned.
const SCANNED_PAGE_RATIO: f64 = 0.8;

const NO_TEXT: &str = "no extractable text found (scanned or image-only PDF)";

/// Text of an uploaded invoice, or the reason there is none. There is no
/// OCR stage, so scanned invoices are rejected.
pub fn invoice_text(pdf_bytes: &[u8]) -> AppResult<String> {
    info!(
        bytes = pdf_bytes.len(),
        sha256 = %fingerprint(pdf_bytes),
        "Extracting text from uploaded PDF"
    );

    let doc = Document::load_mem(pdf_bytes)
        .map_err(|e| AppError::InvalidPdf(format!("failed to parse PDF: {e}")))?;
    let (image_only, pages) = image_only_pages(&doc);
    if pages > 0 && image_only as f64 / pages as f64 >= SCANNED_PAGE_RATIO {
        info!(pages, image_only, "PDF pages carry images but no fonts");
        return Err(AppError::InvalidPdf(NO_TEXT.into()));
    }

    let text = pdf_extract::extract_text_from_mem(pdf_bytes).map_err(|e| {
        warn!(error = %e, "pdf-extract could not read the content streams");
        AppError::InvalidPdf(format!("failed to read PDF text: {e}"))
    })?;
    let meaningful = text.chars().filter(|c| !c.is_whitespace()).count();
    if meaningful < MIN_TEXT_CHARS {
        info!(chars = meaningful, "Extracted text too short");
        return Err(AppError::InvalidPdf(NO_TEXT.into()));
    }
    info!(chars = meaningful, pages, "Text extracted");
    Ok(text)
}

/// Run [`invoice_text`] on the blocking pool. pdf-extract panics on some
/// malformed files; that is reported like any other unreadable PDF.
pub async fn invoice_text_blocking<B>(pdf_bytes: B) -> AppResult<String>
where
    B: AsRef<[u8]> + Send + 'static,
{
    tokio::task::spawn_blocking(move || invoice_text(pdf_bytes.as_ref()))
        .await
        .map_err(worker_failure)?
}

fn worker_failure(err: JoinError) -> AppError {
    if err.is_panic() {
        warn!("PDF parser panicked");
        AppError::InvalidPdf("the PDF could not be parsed".into())
    } else {
        AppError::Extraction(format!("PDF worker failed: {err}"))
    }
}

/// Hex SHA-256 of the upload, used to correlate log lines for one file.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Count pages whose resources hold XObjects but no fonts, i.e. a page
/// that is a picture of a document. Returns `(image_only, total)`.
fn image_only_pages(doc: &Document) -> (usize, usize) {
    let pages = doc.get_pages();
    let image_only = pages
        .values()
        .filter_map(|id| doc.get_dictionary(*id).ok())
        .filter(|page| {
            let resources = resolve_dict(doc, page, b"Resources");
            let has = |key: &[u8]| {
                resources
                    .and_then(|res| resolve_dict(doc, res, key))
                    .is_some_and(|dict| !dict.is_empty())
            };
            has(b"XObject") && !has(b"Font")
        })
        .count();
    debug!(pages = pages.len(), image_only, "Page resource scan");
    (image_only, pages.len())
}

fn resolve_dict<'a>(doc: &'a Document, dict: &'a Dictionary, key: &[u8]) -> Option<&'a Dictionary> {
    let obj = dict.get(key).ok()?;
    let (_, resolved) = doc.dereference(obj).ok()?;
    resolved.as_dict().ok()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{Document, Object, Stream, dictionary};

    fn finish(mut doc: Document, pages_id: lopdf::ObjectId, page_id: lopdf::ObjectId) -> Vec<u8> {
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    /// One-page PDF with each line drawn in Courier.
    pub fn text_pdf(lines: &[&str]) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let mut operations = vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![50.into(), 780.into()]),
            Operation::new("TL", vec![16.into()]),
        ];
        for line in lines {
            operations.push(Operation::new("Tj", vec![Object::string_literal(*line)]));
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new("ET", vec![]));
        let content = Content { operations }.encode().unwrap();
        let content_id = doc.add_object(Stream::new(dictionary! {}, content));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
        });
        finish(doc, pages_id, page_id)
    }

    /// One-page PDF whose only resource is a 1x1 image.
    pub fn image_pdf() -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![0],
        ));
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            b"q 595 0 0 842 0 0 cm /Im1 Do Q".to_vec(),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im1" => image_id },
            },
        });
        finish(doc, pages_id, page_id)
    }
}
