//! Render invoker – loads HTML into a page context, waits for it to settle
//! and exports it as PDF.
//!
//! Each step runs its blocking engine call on the blocking pool and races it
//! against the caller's cancellation token. On cancellation the page is
//! closed, which makes the in-flight engine call fail and frees the tab.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::{PrintParams, Surface, SurfaceError, SurfaceErrorKind};
use crate::error::{ForgeError, RenderFailure, Result};
use crate::inspect;
use crate::options::RenderOptions;
use crate::session::PageContext;

/// Drives one page through load → ready → export.
#[derive(Debug, Clone)]
pub struct RenderInvoker {
    font_timeout: Duration,
}

impl Default for RenderInvoker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl RenderInvoker {
    pub fn new(font_timeout: Duration) -> Self {
        Self { font_timeout }
    }

    pub fn font_timeout(&self) -> Duration {
        self.font_timeout
    }

    /// Replace the page's document with `html` and wait for its load event.
    pub async fn load_content(
        &self,
        page: &PageContext,
        html: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let html = html.to_string();
        run_step(page, cancel, RenderFailure::ContentLoad, move |s| s.set_content(&html)).await
    }

    /// Wait for web fonts, bounded by the font timeout.
    pub async fn await_render_ready(&self, page: &PageContext, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.font_timeout;
        run_step(page, cancel, RenderFailure::ContentLoad, move |s| s.wait_for_fonts(timeout)).await
    }

    /// Export the loaded document. Options are validated before the engine
    /// is touched, and the bytes are checked before they are returned.
    pub async fn render_pdf(
        &self,
        page: &PageContext,
        options: &RenderOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let params = print_params(options)?;
        let bytes = run_step(page, cancel, RenderFailure::Export, move |s| s.print_pdf(&params)).await?;
        let summary = inspect::verify(&bytes)?;
        log::debug!(
            "page {}: exported {} page(s), {} bytes",
            page.id(),
            summary.page_count,
            summary.size_bytes
        );
        Ok(bytes)
    }

    /// All three steps in order.
    pub async fn render(
        &self,
        page: &PageContext,
        html: &str,
        options: &RenderOptions,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        options.validate()?;
        self.load_content(page, html, cancel).await?;
        self.await_render_ready(page, cancel).await?;
        self.render_pdf(page, options, cancel).await
    }
}

/// Translate render options into engine print parameters.
///
/// Header/footer templates and margins are only applied when the
/// header/footer flag is set; otherwise the page prints edge to edge. The
/// templates go through unmodified.
pub fn print_params(options: &RenderOptions) -> Result<PrintParams> {
    options.validate()?;
    let (paper_width, paper_height) = options.format.size_inches();
    let (header_template, footer_template, margins) = if options.header_footer {
        let m = &options.margins;
        (
            Some(options.header_template.clone()),
            Some(options.footer_template.clone()),
            [
                m.top.to_inches(),
                m.right.to_inches(),
                m.bottom.to_inches(),
                m.left.to_inches(),
            ],
        )
    } else {
        (None, None, [0.0; 4])
    };
    Ok(PrintParams {
        paper_width,
        paper_height,
        landscape: options.landscape,
        print_background: options.print_background,
        display_header_footer: options.header_footer,
        header_template,
        footer_template,
        margins,
    })
}

async fn run_step<T, F>(
    page: &PageContext,
    cancel: &CancellationToken,
    failure: RenderFailure,
    step: F,
) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(Arc<dyn Surface>) -> std::result::Result<T, SurfaceError> + Send + 'static,
{
    if cancel.is_cancelled() {
        page.close().await;
        return Err(ForgeError::Cancelled);
    }
    let surface = page.surface()?;
    let task = tokio::task::spawn_blocking(move || step(surface));

    tokio::select! {
        joined = task => match joined {
            Ok(result) => result.map_err(|e| surface_failure(failure, e)),
            Err(e) => Err(ForgeError::render(RenderFailure::Crash, format!("engine call panicked: {e}"))),
        },
        _ = cancel.cancelled() => {
            log::debug!("page {}: cancelled during {failure}", page.id());
            page.close().await;
            Err(ForgeError::Cancelled)
        }
    }
}

fn surface_failure(step: RenderFailure, err: SurfaceError) -> ForgeError {
    let kind = match err.kind {
        SurfaceErrorKind::Timeout => RenderFailure::Timeout,
        SurfaceErrorKind::Disconnected => RenderFailure::Crash,
        SurfaceErrorKind::Closed => RenderFailure::ContextClosed,
        SurfaceErrorKind::Other => step,
    };
    ForgeError::render(kind, err.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{Length, Margins, PaperFormat};

    #[test]
    fn plain_options_print_without_margins() {
        let params = print_params(&RenderOptions::default()).unwrap();
        assert_eq!((params.paper_width, params.paper_height), (8.27, 11.7));
        assert!(params.print_background);
        assert!(!params.display_header_footer);
        assert_eq!(params.header_template, None);
        assert_eq!(params.footer_template, None);
        assert_eq!(params.margins, [0.0; 4]);
    }

    #[test]
    fn header_footer_passes_templates_and_margins() {
        let options = RenderOptions {
            format: PaperFormat::Letter,
            landscape: true,
            header_template: "<b>Invoice Report - <span class=\"title\"></span></b>".into(),
            ..RenderOptions::default()
        }
        .with_header_footer(true);
        let params = print_params(&options).unwrap();
        assert!(params.display_header_footer);
        assert!(params.landscape);
        // Paper stays portrait; the engine applies the orientation.
        assert_eq!((params.paper_width, params.paper_height), (8.5, 11.0));
        assert_eq!(params.header_template.as_deref(), Some(options.header_template.as_str()));
        let [top, right, bottom, left] = params.margins;
        assert!((top - 50.0 / 96.0).abs() < 1e-9);
        assert!((right - 20.0 / 96.0).abs() < 1e-9);
        assert_eq!(top, bottom);
        assert_eq!(right, left);
    }

    #[test]
    fn invalid_margins_rejected_before_engine() {
        let options = RenderOptions {
            margins: Margins::uniform(Length::px(-5.0)),
            ..RenderOptions::default()
        }
        .with_header_footer(true);
        let err = print_params(&options).unwrap_err();
        assert_eq!(err.render_kind(), Some(RenderFailure::InvalidOption));
    }

    #[test]
    fn surface_errors_map_to_failures() {
        let e = surface_failure(RenderFailure::Export, SurfaceError::new(SurfaceErrorKind::Other, "x"));
        assert_eq!(e.render_kind(), Some(RenderFailure::Export));
        let e = surface_failure(RenderFailure::Export, SurfaceError::closed());
        assert_eq!(e.render_kind(), Some(RenderFailure::ContextClosed));
        let e = surface_failure(
            RenderFailure::ContentLoad,
            SurfaceError::new(SurfaceErrorKind::Disconnected, "gone"),
        );
        assert_eq!(e.render_kind(), Some(RenderFailure::Crash));
    }
}
