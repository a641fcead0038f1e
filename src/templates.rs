//! Template storage.
//!
//! The pipeline only needs `load(name) → source`; where templates live is up
//! to the [`TemplateSource`] implementation. Two are provided: a directory on
//! disk and an in-memory set that ships the sample invoice and user-report
//! templates.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};

use crate::error::{ForgeError, Result};

/// Name of the bundled invoice template.
pub const INVOICE_TEMPLATE: &str = "invoice-template.html";
/// Name of the bundled user-report template.
pub const USER_REPORT_TEMPLATE: &str = "report-template.html";

/// Something templates can be loaded from by name.
pub trait TemplateSource: Send + Sync {
    /// Return the template source, or [`ForgeError::TemplateNotFound`].
    fn load(&self, name: &str) -> Result<String>;
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

/// Templates read from files under a root directory.
///
/// Names are relative paths; absolute paths and `..` components are treated
/// as not found rather than escaping the root.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let contained = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        contained.then(|| self.root.join(relative))
    }
}

impl TemplateSource for DirectorySource {
    fn load(&self, name: &str) -> Result<String> {
        let path = self.resolve(name).ok_or_else(|| {
            log::warn!("rejecting template name outside root: {name:?}");
            ForgeError::TemplateNotFound(name.to_string())
        })?;
        if !path.is_file() {
            return Err(ForgeError::TemplateNotFound(name.to_string()));
        }
        match std::fs::read_to_string(&path) {
            Ok(source) => {
                log::debug!("loaded template '{name}' from {} ({} bytes)", path.display(), source.len());
                Ok(source)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(ForgeError::TemplateNotFound(name.to_string()))
            }
            Err(e) => Err(ForgeError::Io(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// Embedded
// ---------------------------------------------------------------------------

/// Templates held in memory.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSource {
    templates: HashMap<String, String>,
}

impl EmbeddedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The sample templates compiled into the binary.
    pub fn builtin() -> Self {
        Self::new()
            .with(INVOICE_TEMPLATE, invoice_template())
            .with(USER_REPORT_TEMPLATE, user_report_template())
    }

    pub fn with(mut self, name: impl Into<String>, source: impl Into<String>) -> Self {
        self.templates.insert(name.into(), source.into());
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl TemplateSource for EmbeddedSource {
    fn load(&self, name: &str) -> Result<String> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| ForgeError::TemplateNotFound(name.to_string()))
    }
}

/// Invoice with seller/customer blocks, line items and currency totals.
pub fn invoice_template() -> &'static str {
    include_str!("../templates/invoice-template.html")
}

/// Table of users iterated from a root-level list.
pub fn user_report_template() -> &'static str {
    include_str!("../templates/report-template.html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateEngine;

    #[test]
    fn builtin_templates_compile() {
        let engine = TemplateEngine::default();
        let source = EmbeddedSource::builtin();
        for name in [INVOICE_TEMPLATE, USER_REPORT_TEMPLATE] {
            let text = source.load(name).unwrap();
            engine
                .compile_named(name, &text)
                .unwrap_or_else(|e| panic!("template '{name}' should compile: {e}"));
        }
    }

    #[test]
    fn embedded_missing_is_not_found() {
        let err = EmbeddedSource::new().load("nope.html").unwrap_err();
        assert!(matches!(err, ForgeError::TemplateNotFound(n) if n == "nope.html"));
    }

    #[test]
    fn directory_reads_and_reports_missing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.html"), "<p>{{x}}</p>").unwrap();
        let source = DirectorySource::new(dir.path());

        assert_eq!(source.load("a.html").unwrap(), "<p>{{x}}</p>");
        assert!(matches!(
            source.load("b.html").unwrap_err(),
            ForgeError::TemplateNotFound(_)
        ));
    }

    #[test]
    fn directory_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("inner");
        std::fs::create_dir(&nested).unwrap();
        std::fs::write(dir.path().join("secret.html"), "x").unwrap();
        let source = DirectorySource::new(&nested);

        for name in ["../secret.html", "/etc/passwd", ""] {
            assert!(
                matches!(source.load(name).unwrap_err(), ForgeError::TemplateNotFound(_)),
                "{name:?} should be rejected"
            );
        }
    }
}
