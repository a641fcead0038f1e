//! # report-forge – data → template → HTML → PDF
//!
//! This crate turns structured data into paginated PDF reports. The pipeline
//! stages are:
//!
//! 1. **Load** – fetch template source by name ([`templates`])
//! 2. **Expand** – compile and execute a logic-less template against a
//!    payload, with named helpers ([`template`], [`helpers`], [`value`])
//! 3. **Acquire** – get a ready headless Chromium session and open a page
//!    ([`session`], [`fetcher`], [`chrome`])
//! 4. **Render** – load the HTML, wait for fonts, export PDF ([`render`])
//! 5. **Verify** – check the bytes are a PDF with pages ([`inspect`])
//!
//! [`ReportForge`] runs all of them in one call.

pub mod chrome;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetcher;
pub mod helpers;
pub mod inspect;
pub mod options;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod template;
pub mod templates;
pub mod value;

// Re-exports for convenience
pub use config::ForgeConfig;
pub use error::{ForgeError, RenderFailure, Result};
pub use helpers::HelperRegistry;
pub use options::{PaperFormat, RenderOptions};
pub use pipeline::{ForgeParts, ReportForge};
pub use template::TemplateEngine;
pub use value::Value;
