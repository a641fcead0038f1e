//! Named formatting helpers callable from templates.
//!
//! The registry is assembled once through [`HelperRegistryBuilder`] and is
//! immutable afterwards; the template engine holds it behind an `Arc`, so
//! concurrent renders read it without locking.
//!
//! Helpers see arguments as they sit in the template context: payload dates
//! arrive as ISO strings and decimals as their literal text, so the
//! coercions below ([`as_date`], [`as_decimal`], [`as_integer`]) read both
//! the typed and the plain JSON spelling.
//!
//! Helpers never fail. An argument of the wrong type makes the helper emit
//! nothing, so one bad field cannot abort a whole report.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value as Json;

/// Signature shared by every helper: positional arguments in, text out.
pub type HelperFn = dyn Fn(&[Json]) -> String + Send + Sync;

/// Immutable name → helper map.
#[derive(Clone, Default)]
pub struct HelperRegistry {
    helpers: HashMap<String, Arc<HelperFn>>,
}

impl HelperRegistry {
    pub fn builder() -> HelperRegistryBuilder {
        HelperRegistryBuilder::default()
    }

    /// Registry holding `formatDate`, `formatCurrency`, `multiply` and `now`.
    pub fn with_builtins() -> Self {
        Self::builder().builtins().build()
    }

    pub fn get(&self, name: &str) -> Option<&HelperFn> {
        self.helpers.get(name).map(|h| h.as_ref())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.helpers.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.helpers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.helpers.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &Arc<HelperFn>)> {
        self.helpers.iter().map(|(name, helper)| (name.as_str(), helper))
    }
}

impl fmt::Debug for HelperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.helpers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HelperRegistry").field("helpers", &names).finish()
    }
}

/// Collects helpers before the registry is frozen.
#[derive(Default)]
pub struct HelperRegistryBuilder {
    helpers: HashMap<String, Arc<HelperFn>>,
}

impl HelperRegistryBuilder {
    /// Register `helper` under `name`, replacing any earlier entry.
    pub fn register<F>(mut self, name: impl Into<String>, helper: F) -> Self
    where
        F: Fn(&[Json]) -> String + Send + Sync + 'static,
    {
        let name = name.into();
        if self.helpers.insert(name.clone(), Arc::new(helper)).is_some() {
            log::warn!("helper '{name}' registered twice; keeping the later one");
        }
        self
    }

    /// Add the built-in helpers, with `now` reading the local clock.
    pub fn builtins(self) -> Self {
        self.builtins_with_clock(|| chrono::Local::now().date_naive())
    }

    /// Add the built-in helpers, with `now` reading `clock` at render time.
    pub fn builtins_with_clock<C>(self, clock: C) -> Self
    where
        C: Fn() -> NaiveDate + Send + Sync + 'static,
    {
        self.register("formatDate", format_date)
            .register("formatCurrency", format_currency)
            .register("multiply", multiply)
            .register("now", move |_: &[Json]| clock().format("%Y-%m-%d").to_string())
    }

    pub fn build(self) -> HelperRegistry {
        HelperRegistry {
            helpers: self.helpers,
        }
    }
}

// ---------------------------------------------------------------------------
// Argument coercions
// ---------------------------------------------------------------------------

/// The calendar date in an ISO date, datetime or RFC 3339 string.
pub fn as_date(value: &Json) -> Option<NaiveDate> {
    let text = value.as_str()?;
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f").map(|dt| dt.date()))
        .or_else(|_| DateTime::parse_from_rfc3339(text).map(|dt| dt.date_naive()))
        .ok()
}

/// An exact decimal from a JSON number or a decimal string, scale kept.
pub fn as_decimal(value: &Json) -> Option<Decimal> {
    match value {
        Json::Number(n) => {
            let text = n.to_string();
            Decimal::from_str(&text)
                .or_else(|_| Decimal::from_scientific(&text))
                .ok()
        }
        Json::String(s) => Decimal::from_str(s).ok(),
        _ => None,
    }
}

/// A whole JSON number.
pub fn as_integer(value: &Json) -> Option<i64> {
    value.as_i64()
}

// ---------------------------------------------------------------------------
// Built-ins
// ---------------------------------------------------------------------------

/// `formatDate value` → `October 27, 2023`.
pub fn format_date(args: &[Json]) -> String {
    args.first()
        .and_then(as_date)
        .map(|d| d.format("%B %d, %Y").to_string())
        .unwrap_or_default()
}

/// `formatCurrency value` → `$1,177.50`.
pub fn format_currency(args: &[Json]) -> String {
    args.first()
        .and_then(as_decimal)
        .map(en_us_currency)
        .unwrap_or_default()
}

/// `multiply price quantity` → decimal product with the price's scale.
pub fn multiply(args: &[Json]) -> String {
    let price = args.first().and_then(as_decimal);
    let qty = args.get(1).and_then(as_integer);
    match (price, qty) {
        (Some(price), Some(qty)) => price
            .checked_mul(Decimal::from(qty))
            .map(|p| p.to_string())
            .unwrap_or_default(),
        _ => String::new(),
    }
}

fn en_us_currency(amount: Decimal) -> String {
    let mut rounded = amount
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        .abs();
    rounded.rescale(2);
    let negative = amount.is_sign_negative() && !rounded.is_zero();

    let text = rounded.to_string();
    let (whole, frac) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }

    format!("{}${grouped}.{frac}", if negative { "-" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn format_date_full_month() {
        assert_eq!(format_date(&[json!("2023-10-27")]), "October 27, 2023");
        assert_eq!(format_date(&[json!("2024-03-05")]), "March 05, 2024");
    }

    #[test]
    fn format_date_accepts_datetime() {
        assert_eq!(format_date(&[json!("2023-11-26T18:30:00")]), "November 26, 2023");
        assert_eq!(format_date(&[json!("2023-11-26T18:30:00+02:00")]), "November 26, 2023");
    }

    #[test]
    fn format_date_ignores_other_values() {
        assert_eq!(format_date(&[json!("27/10/2023")]), "");
        assert_eq!(format_date(&[json!(20231027)]), "");
        assert_eq!(format_date(&[]), "");
    }

    #[test]
    fn currency_groups_and_pads() {
        assert_eq!(format_currency(&[json!("1177.50")]), "$1,177.50");
        assert_eq!(format_currency(&[json!("150")]), "$150.00");
        assert_eq!(format_currency(&[json!("1234567.891")]), "$1,234,567.89");
        assert_eq!(format_currency(&[json!("0.005")]), "$0.01");
        assert_eq!(format_currency(&[json!(999)]), "$999.00");
        assert_eq!(format_currency(&[json!(75.5)]), "$75.50");
    }

    #[test]
    fn currency_negative_amount() {
        assert_eq!(format_currency(&[json!("-1234.5")]), "-$1,234.50");
        assert_eq!(format_currency(&[json!("-0.001")]), "$0.00");
    }

    #[test]
    fn currency_ignores_non_numbers() {
        assert_eq!(format_currency(&[json!("twelve")]), "");
        assert_eq!(format_currency(&[json!(true)]), "");
        assert_eq!(format_currency(&[Json::Null]), "");
    }

    #[test]
    fn multiply_keeps_price_scale() {
        assert_eq!(multiply(&[json!("150.00"), json!(2)]), "300.00");
        assert_eq!(multiply(&[json!("75.50"), json!(5)]), "377.50");
        assert_eq!(multiply(&[json!(2.5), json!(4)]), "10.0");
    }

    #[test]
    fn multiply_wrong_types_emit_nothing() {
        assert_eq!(multiply(&[json!("x"), json!(2)]), "");
        assert_eq!(multiply(&[json!("1.00"), json!("2")]), "");
        assert_eq!(multiply(&[json!("1.00"), json!(2.5)]), "");
        assert_eq!(multiply(&[json!("1.00")]), "");
    }

    #[test]
    fn now_reads_clock_at_call_time() {
        let registry = HelperRegistry::builder()
            .builtins_with_clock(|| NaiveDate::from_ymd_opt(2026, 1, 2).unwrap())
            .build();
        let now = registry.get("now").unwrap();
        assert_eq!(now(&[]), "2026-01-02");
    }

    #[test]
    fn builtins_are_registered() {
        let registry = HelperRegistry::with_builtins();
        for name in ["formatDate", "formatCurrency", "multiply", "now"] {
            assert!(registry.contains(name), "missing {name}");
        }
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.iter().count(), 4);
    }
}
