//! Render options – paper, margins and header/footer overlays for one PDF
//! export. These are plain data, serialisable so callers can keep them in
//! JSON next to their templates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ForgeError, RenderFailure, Result};

/// Header shown on every page when header/footer overlays are enabled.
///
/// The engine fills `<span class="title">`, `pageNumber`, `totalPages`,
/// `date` and `url` spans itself; the markup is passed through untouched.
pub const DEFAULT_HEADER_TEMPLATE: &str = r#"<div style="font-size: 10px; font-family: Arial; text-align: center; width: 100%; padding: 0 20px;">Invoice Report - <span class="title"></span></div>"#;

/// Footer shown on every page when header/footer overlays are enabled.
pub const DEFAULT_FOOTER_TEMPLATE: &str = r#"<div style="font-size: 10px; font-family: Arial; text-align: center; width: 100%; padding: 0 20px;"><span>Page <span class="pageNumber"></span> of <span class="totalPages"></span></span></div>"#;

/// Named paper sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PaperFormat {
    Letter,
    Legal,
    Tabloid,
    Ledger,
    A0,
    A1,
    A2,
    A3,
    #[default]
    A4,
    A5,
    A6,
}

impl PaperFormat {
    /// Portrait `(width, height)` in inches.
    pub fn size_inches(self) -> (f64, f64) {
        match self {
            PaperFormat::Letter => (8.5, 11.0),
            PaperFormat::Legal => (8.5, 14.0),
            PaperFormat::Tabloid => (11.0, 17.0),
            PaperFormat::Ledger => (17.0, 11.0),
            PaperFormat::A0 => (33.1, 46.8),
            PaperFormat::A1 => (23.4, 33.1),
            PaperFormat::A2 => (16.54, 23.4),
            PaperFormat::A3 => (11.7, 16.54),
            PaperFormat::A4 => (8.27, 11.7),
            PaperFormat::A5 => (5.83, 8.27),
            PaperFormat::A6 => (4.13, 5.83),
        }
    }
}

// ---------------------------------------------------------------------------
// Lengths
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthUnit {
    Px,
    In,
    Cm,
    Mm,
    Pt,
}

impl LengthUnit {
    fn suffix(self) -> &'static str {
        match self {
            LengthUnit::Px => "px",
            LengthUnit::In => "in",
            LengthUnit::Cm => "cm",
            LengthUnit::Mm => "mm",
            LengthUnit::Pt => "pt",
        }
    }
}

/// A CSS-style length such as `50px` or `1.5cm`. A bare number means pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Length {
    pub value: f64,
    pub unit: LengthUnit,
}

impl Length {
    pub const ZERO: Length = Length {
        value: 0.0,
        unit: LengthUnit::Px,
    };

    pub fn px(value: f64) -> Self {
        Self {
            value,
            unit: LengthUnit::Px,
        }
    }

    /// Convert to inches at the CSS reference density of 96 px per inch.
    pub fn to_inches(self) -> f64 {
        match self.unit {
            LengthUnit::Px => self.value / 96.0,
            LengthUnit::In => self.value,
            LengthUnit::Cm => self.value / 2.54,
            LengthUnit::Mm => self.value / 25.4,
            LengthUnit::Pt => self.value / 72.0,
        }
    }
}

impl FromStr for Length {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim().to_ascii_lowercase();
        let split = text
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(text.len());
        let (number, suffix) = text.split_at(split);
        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| ForgeError::Config(format!("invalid length '{s}'")))?;
        let unit = match suffix {
            "" | "px" => LengthUnit::Px,
            "in" => LengthUnit::In,
            "cm" => LengthUnit::Cm,
            "mm" => LengthUnit::Mm,
            "pt" => LengthUnit::Pt,
            other => return Err(ForgeError::Config(format!("unknown length unit '{other}' in '{s}'"))),
        };
        Ok(Length { value, unit })
    }
}

impl TryFrom<String> for Length {
    type Error = ForgeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Length> for String {
    fn from(l: Length) -> Self {
        l.to_string()
    }
}

impl fmt::Display for Length {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

/// Page margins.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Margins {
    pub top: Length,
    pub right: Length,
    pub bottom: Length,
    pub left: Length,
}

impl Margins {
    /// Room for the default header and footer overlays.
    pub fn header_footer() -> Self {
        Self {
            top: Length::px(50.0),
            right: Length::px(20.0),
            bottom: Length::px(50.0),
            left: Length::px(20.0),
        }
    }

    pub fn uniform(length: Length) -> Self {
        Self {
            top: length,
            right: length,
            bottom: length,
            left: length,
        }
    }
}

impl Default for Margins {
    fn default() -> Self {
        Self::header_footer()
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Everything the engine needs to know to export one document.
///
/// Header/footer templates and margins are only applied when
/// `header_footer` is set; otherwise the page prints with no margins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub format: PaperFormat,
    pub landscape: bool,
    pub print_background: bool,
    pub header_footer: bool,
    pub header_template: String,
    pub footer_template: String,
    pub margins: Margins,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            format: PaperFormat::A4,
            landscape: false,
            print_background: true,
            header_footer: false,
            header_template: DEFAULT_HEADER_TEMPLATE.to_string(),
            footer_template: DEFAULT_FOOTER_TEMPLATE.to_string(),
            margins: Margins::header_footer(),
        }
    }
}

impl RenderOptions {
    /// Toggle header/footer overlays (and with them, the margins).
    pub fn with_header_footer(mut self, enabled: bool) -> Self {
        self.header_footer = enabled;
        self
    }

    /// Effective `(width, height)` in inches after orientation.
    pub fn paper_size_inches(&self) -> (f64, f64) {
        let (w, h) = self.format.size_inches();
        if self.landscape {
            (h, w)
        } else {
            (w, h)
        }
    }

    /// Reject margins that are negative, non-finite, or leave no printable area.
    pub fn validate(&self) -> Result<()> {
        if !self.header_footer {
            return Ok(());
        }
        let invalid = |msg: String| ForgeError::render(RenderFailure::InvalidOption, msg);
        let m = &self.margins;
        for (side, len) in [("top", m.top), ("right", m.right), ("bottom", m.bottom), ("left", m.left)] {
            let inches = len.to_inches();
            if !inches.is_finite() || inches < 0.0 {
                return Err(invalid(format!("{side} margin {len} must be a non-negative length")));
            }
        }
        let (width, height) = self.paper_size_inches();
        if m.left.to_inches() + m.right.to_inches() >= width {
            return Err(invalid(format!(
                "horizontal margins ({} + {}) leave no printable width",
                m.left, m.right
            )));
        }
        if m.top.to_inches() + m.bottom.to_inches() >= height {
            return Err(invalid(format!(
                "vertical margins ({} + {}) leave no printable height",
                m.top, m.bottom
            )));
        }
        Ok(())
    }

    /// Serialise to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Deserialise from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ForgeError::Config(format!("render options: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lengths() {
        assert_eq!("50px".parse::<Length>().unwrap(), Length::px(50.0));
        assert_eq!("12".parse::<Length>().unwrap(), Length::px(12.0));
        let cm: Length = " 2.54CM ".parse().unwrap();
        assert_eq!(cm.unit, LengthUnit::Cm);
        assert!((cm.to_inches() - 1.0).abs() < 1e-9);
        assert!(("96px".parse::<Length>().unwrap().to_inches() - 1.0).abs() < 1e-9);
        assert!(("72pt".parse::<Length>().unwrap().to_inches() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_bad_lengths() {
        assert!("".parse::<Length>().is_err());
        assert!("10em".parse::<Length>().is_err());
        assert!("px".parse::<Length>().is_err());
    }

    #[test]
    fn defaults_match_a4_without_overlays() {
        let opts = RenderOptions::default();
        assert_eq!(opts.format, PaperFormat::A4);
        assert!(opts.print_background);
        assert!(!opts.header_footer);
        assert!(opts
            .header_template
            .contains(r#">Invoice Report - <span class="title"></span></div>"#));
        assert!(opts.footer_template.contains("pageNumber"));
        assert!(opts.footer_template.contains("totalPages"));
    }

    #[test]
    fn landscape_swaps_paper() {
        let opts = RenderOptions {
            format: PaperFormat::Letter,
            landscape: true,
            ..RenderOptions::default()
        };
        assert_eq!(opts.paper_size_inches(), (11.0, 8.5));
    }

    #[test]
    fn validate_rejects_oversized_margins() {
        let mut opts = RenderOptions::default().with_header_footer(true);
        assert!(opts.validate().is_ok());

        opts.margins = Margins::uniform("6in".parse().unwrap());
        let err = opts.validate().unwrap_err();
        assert_eq!(err.render_kind(), Some(RenderFailure::InvalidOption));

        opts.margins = Margins::uniform(Length::px(-1.0));
        assert!(opts.validate().is_err());
    }

    #[test]
    fn margins_ignored_without_overlays() {
        let opts = RenderOptions {
            margins: Margins::uniform("20in".parse().unwrap()),
            ..RenderOptions::default()
        };
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn json_round_trip_uses_length_strings() {
        let opts = RenderOptions::default().with_header_footer(true);
        let json = opts.to_json();
        assert!(json.contains("\"50px\""), "{json}");
        assert_eq!(RenderOptions::from_json(&json).unwrap(), opts);

        let partial = RenderOptions::from_json(r#"{"format": "Letter", "header_footer": true}"#).unwrap();
        assert_eq!(partial.format, PaperFormat::Letter);
        assert!(partial.header_footer);
        assert_eq!(partial.margins, Margins::header_footer());
    }
}
