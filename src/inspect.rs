//! Structural checks on exported PDF bytes.

use lopdf::{Document, Object, ObjectId};

use crate::error::{ForgeError, RenderFailure, Result};

/// What a parsed PDF looks like.
#[derive(Debug, Clone, PartialEq)]
pub struct PdfSummary {
    pub pdf_version: String,
    pub page_count: usize,
    /// `[llx, lly, urx, ury]` of the first page, in points.
    pub first_page_media_box: Option<[f32; 4]>,
    pub encrypted: bool,
    pub size_bytes: usize,
}

impl PdfSummary {
    /// First page `(width, height)` in points.
    pub fn page_size(&self) -> Option<(f32, f32)> {
        self.first_page_media_box
            .map(|[llx, lly, urx, ury]| (urx - llx, ury - lly))
    }
}

/// Parse `bytes` and summarise the document.
pub fn inspect(bytes: &[u8]) -> Result<PdfSummary> {
    let malformed = |msg: String| ForgeError::render(RenderFailure::MalformedOutput, msg);

    if !bytes.starts_with(b"%PDF-") {
        return Err(malformed("output does not start with a PDF header".into()));
    }
    let doc = Document::load_mem(bytes).map_err(|e| malformed(format!("unparseable PDF: {e}")))?;
    let pages = doc.get_pages();
    let first_page_media_box = pages
        .values()
        .next()
        .and_then(|&id| media_box(&doc, id));

    Ok(PdfSummary {
        pdf_version: doc.version.clone(),
        page_count: pages.len(),
        first_page_media_box,
        encrypted: doc.is_encrypted(),
        size_bytes: bytes.len(),
    })
}

/// Like [`inspect`], but also rejects documents without pages.
pub fn verify(bytes: &[u8]) -> Result<PdfSummary> {
    let summary = inspect(bytes)?;
    if summary.page_count == 0 {
        return Err(ForgeError::render(
            RenderFailure::MalformedOutput,
            "PDF has no pages",
        ));
    }
    Ok(summary)
}

// MediaBox may sit on the page or be inherited from any ancestor Pages node.
fn media_box(doc: &Document, page: ObjectId) -> Option<[f32; 4]> {
    let mut node = page;
    for _ in 0..32 {
        let dict = doc.get_object(node).ok()?.as_dict().ok()?;
        if let Ok(obj) = dict.get(b"MediaBox") {
            return rect(doc, obj);
        }
        node = dict.get(b"Parent").ok()?.as_reference().ok()?;
    }
    None
}

fn rect(doc: &Document, obj: &Object) -> Option<[f32; 4]> {
    let items = resolve(doc, obj)?.as_array().ok()?;
    if items.len() != 4 {
        return None;
    }
    let mut out = [0f32; 4];
    for (slot, item) in out.iter_mut().zip(items) {
        *slot = number(resolve(doc, item)?)?;
    }
    Some(out)
}

fn resolve<'a>(doc: &'a Document, obj: &'a Object) -> Option<&'a Object> {
    match obj {
        Object::Reference(id) => doc.get_object(*id).ok(),
        other => Some(other),
    }
}

fn number(obj: &Object) -> Option<f32> {
    match obj {
        Object::Integer(i) => Some(*i as f32),
        Object::Real(r) => Some(*r as f32),
        _ => None,
    }
}
