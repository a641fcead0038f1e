//! Error types for report generation.

use std::fmt;

use thiserror::Error;

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, ForgeError>;

/// Which stage of a PDF render failed, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFailure {
    /// The HTML could not be loaded into the page.
    ContentLoad,
    /// A load, readiness or export step did not finish in time.
    Timeout,
    /// The engine process died or the DevTools connection dropped.
    Crash,
    /// The render options were rejected before reaching the engine.
    InvalidOption,
    /// The engine refused or failed the PDF export.
    Export,
    /// The page context had already been closed.
    ContextClosed,
    /// The engine returned bytes that are not a usable PDF.
    MalformedOutput,
}

impl fmt::Display for RenderFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RenderFailure::ContentLoad => "content load",
            RenderFailure::Timeout => "timeout",
            RenderFailure::Crash => "engine crash",
            RenderFailure::InvalidOption => "invalid option",
            RenderFailure::Export => "export",
            RenderFailure::ContextClosed => "page closed",
            RenderFailure::MalformedOutput => "malformed output",
        };
        f.write_str(s)
    }
}

/// Errors that can occur while turning a template and payload into a PDF.
#[derive(Error, Debug)]
pub enum ForgeError {
    /// No template with this name exists in the configured source.
    #[error("template '{0}' not found")]
    TemplateNotFound(String),

    /// The template source could not be parsed.
    #[error("syntax error in template '{template}' at {line}:{column}: {message}")]
    TemplateSyntax {
        template: String,
        line: usize,
        column: usize,
        message: String,
    },

    /// The template calls a helper that is not registered.
    #[error("unknown helper '{name}' in template '{template}'")]
    UnknownHelper { name: String, template: String },

    /// The browser binary could not be fetched or launched.
    #[error("browser unavailable: {0}")]
    BrowserUnavailable(String),

    /// Loading, readiness or export failed inside a page.
    #[error("render failed ({kind}): {message}")]
    Render { kind: RenderFailure, message: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Payload could not be converted into template values.
    #[error("invalid data: {0}")]
    Data(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ForgeError {
    pub fn render(kind: RenderFailure, message: impl Into<String>) -> Self {
        ForgeError::Render {
            kind,
            message: message.into(),
        }
    }

    /// The render failure kind, if this is a render error.
    pub fn render_kind(&self) -> Option<RenderFailure> {
        match self {
            ForgeError::Render { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ForgeError::Cancelled)
    }
}

impl From<serde_json::Error> for ForgeError {
    fn from(err: serde_json::Error) -> Self {
        ForgeError::Data(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_error_message_names_the_stage() {
        let err = ForgeError::render(RenderFailure::Timeout, "fonts never settled");
        assert_eq!(err.to_string(), "render failed (timeout): fonts never settled");
        assert_eq!(err.render_kind(), Some(RenderFailure::Timeout));
    }

    #[test]
    fn syntax_error_carries_position() {
        let err = ForgeError::TemplateSyntax {
            template: "invoice".into(),
            line: 3,
            column: 7,
            message: "unclosed block 'each'".into(),
        };
        assert_eq!(
            err.to_string(),
            "syntax error in template 'invoice' at 3:7: unclosed block 'each'"
        );
    }
}
