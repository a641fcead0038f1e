//! Rendering-engine abstraction.
//!
//! The session manager and render invoker talk to the browser only through
//! these traits. [`crate::chrome`] implements them over the DevTools
//! protocol; tests plug in an in-process engine.
//!
//! All trait methods are blocking. Callers run them on the blocking pool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// How to start one engine process.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    /// `None` lets the engine locate a system browser.
    pub executable: Option<PathBuf>,
    pub sandbox: bool,
    pub args: Vec<String>,
    /// Budget for a single protocol call before it counts as timed out.
    pub call_timeout: Duration,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            executable: None,
            sandbox: false,
            args: Vec::new(),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Print settings in engine units (inches).
#[derive(Debug, Clone, PartialEq)]
pub struct PrintParams {
    pub paper_width: f64,
    pub paper_height: f64,
    pub landscape: bool,
    pub print_background: bool,
    pub display_header_footer: bool,
    pub header_template: Option<String>,
    pub footer_template: Option<String>,
    /// `[top, right, bottom, left]`. Always sent, so the engine's own
    /// default margin never applies.
    pub margins: [f64; 4],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceErrorKind {
    Timeout,
    /// The process exited or the connection dropped.
    Disconnected,
    /// The surface was closed before or during the call.
    Closed,
    Other,
}

/// Failure reported by a [`Surface`] call.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SurfaceError {
    pub kind: SurfaceErrorKind,
    pub message: String,
}

impl SurfaceError {
    pub fn new(kind: SurfaceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn closed() -> Self {
        Self::new(SurfaceErrorKind::Closed, "page is closed")
    }
}

/// Starts engine processes.
pub trait Engine: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineProcess>, String>;
}

/// One running engine process.
pub trait EngineProcess: Send + Sync {
    /// Open a fresh page (tab).
    fn open_surface(&self) -> Result<Arc<dyn Surface>, SurfaceError>;

    fn process_id(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    /// Kill the process. Idempotent.
    fn terminate(&self);
}

/// One page inside an engine process.
pub trait Surface: Send + Sync {
    /// Replace the document with `html` and wait for its load event.
    fn set_content(&self, html: &str) -> Result<(), SurfaceError>;

    /// Wait until web fonts have loaded.
    fn wait_for_fonts(&self, timeout: Duration) -> Result<(), SurfaceError>;

    fn print_pdf(&self, params: &PrintParams) -> Result<Vec<u8>, SurfaceError>;

    /// Close the page. Idempotent; pending calls fail afterwards.
    fn close(&self);
}
