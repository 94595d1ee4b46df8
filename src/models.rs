//! Core data types for the bookkeeping pipeline.
//!
//! The data lifecycle is:
//!
//! ```text
//! JSON / image → ReceiptDraft → validate() → NewReceipt → store → Receipt
//!                                                  ↓
//!                                          audit() → AuditFlags
//!                                                  ↓
//!                                  document_for() → embedding → vector index
//! ```
//!
//! - A **[`ReceiptDraft`]** is an unvalidated input record, either posted
//!   directly by a caller or produced by the extractor. It accepts the field
//!   spellings used by older clients (`vendor_name`, `total_amount`, `desc`,
//!   `amount`) as serde aliases.
//! - A **[`NewReceipt`]** has passed field-level validation: amounts rounded
//!   to two fractional digits and held as integer minor units, the vendor
//!   normalized, the timestamp parsed with its explicit offset.
//! - A **[`Receipt`]** is the stored representation with an assigned
//!   identifier and the four derived [`AuditFlags`].

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// The four audit flags. A derived cache of the audit engine's output;
/// written only by the audit engine, never by hand.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFlags {
    pub duplicate: bool,
    pub suspicious: bool,
    pub missing_vat: bool,
    pub math_error: bool,
}

impl AuditFlags {
    pub fn any(&self) -> bool {
        self.duplicate || self.suspicious || self.missing_vat || self.math_error
    }
}

/// A stored receipt with its line items and derived audit flags.
#[derive(Debug, Clone)]
pub struct Receipt {
    /// Monotonic integer identifier assigned on ingest.
    pub id: i64,
    /// Vendor name as supplied (trimmed, whitespace collapsed).
    pub vendor: String,
    /// Lowercased vendor used for duplicate probes and vendor filters.
    pub vendor_norm: String,
    /// Purchase instant, timezone-explicit.
    pub date: DateTime<FixedOffset>,
    /// Calendar day of `date` in its own offset; the duplicate-probe key.
    pub day: NaiveDate,
    /// Total amount in minor units (cents).
    pub total_cents: i64,
    /// Tax amount in minor units (cents).
    pub tax_cents: i64,
    pub currency: String,
    pub category: Option<String>,
    pub payment_method: Option<String>,
    pub receipt_number: Option<String>,
    pub image_ref: Option<String>,
    pub flags: AuditFlags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<LineItem>,
}

/// One row inside a receipt. Owned exclusively by its parent; deleted with it.
#[derive(Debug, Clone)]
pub struct LineItem {
    pub id: i64,
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub total_cents: i64,
    /// VAT percentage 0–100, when the receipt itemizes it.
    pub vat_percent: Option<f64>,
}

impl Receipt {
    pub fn total(&self) -> Decimal {
        Decimal::new(self.total_cents, 2)
    }

    pub fn tax(&self) -> Decimal {
        Decimal::new(self.tax_cents, 2)
    }
}

/// Unvalidated input record. Field aliases cover the JSON spellings produced
/// by the extractor prompt and by older clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiptDraft {
    #[serde(default, alias = "vendor_name")]
    pub vendor: String,
    /// Timestamp string; RFC 3339, bare `YYYY-MM-DD`, or `dd.mm.yyyy`.
    #[serde(alias = "timestamp")]
    pub date: Option<String>,
    #[serde(alias = "total_amount")]
    pub total: Option<Decimal>,
    #[serde(alias = "tax_amount", alias = "vat")]
    pub tax: Option<Decimal>,
    pub currency: Option<String>,
    pub category: Option<String>,
    #[serde(alias = "paymentMethod")]
    pub payment_method: Option<String>,
    #[serde(alias = "receiptNumber")]
    pub receipt_number: Option<String>,
    #[serde(alias = "image_url", alias = "image_path", alias = "imageUrl")]
    pub image_ref: Option<String>,
    #[serde(alias = "line_items", alias = "lineItems", default)]
    pub items: Vec<LineItemDraft>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemDraft {
    #[serde(default, alias = "desc")]
    pub description: String,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(alias = "unitPrice")]
    pub unit_price: Option<Decimal>,
    /// Per-line total. `amount` and `total_price` are accepted for
    /// compatibility with cash-register style records.
    #[serde(alias = "amount", alias = "total_price")]
    pub total: Option<Decimal>,
    #[serde(alias = "vat", alias = "vat_rate", alias = "vatPercent")]
    pub vat_percent: Option<f64>,
}

fn default_quantity() -> i64 {
    1
}

/// A validated record ready for insertion. All amounts are minor units.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub vendor: String,
    pub vendor_norm: String,
    pub date: DateTime<FixedOffset>,
    pub day: NaiveDate,
    pub total_cents: i64,
    pub tax_cents: i64,
    pub currency: String,
    pub category: Option<String>,
    pub payment_method: Option<String>,
    pub receipt_number: Option<String>,
    pub image_ref: Option<String>,
    pub items: Vec<NewLineItem>,
}

#[derive(Debug, Clone)]
pub struct NewLineItem {
    pub description: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub total_cents: i64,
    pub vat_percent: Option<f64>,
}

/// Parse a timestamp the way receipts actually carry them: RFC 3339 first,
/// then a bare ISO date, then the `dd.mm.yyyy` pattern common on European
/// paper receipts. Bare dates are taken as midnight UTC.
pub fn parse_instant(s: &str) -> Option<DateTime<FixedOffset>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(midnight_utc(d));
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Some(midnight_utc(d));
    }
    None
}

fn midnight_utc(d: NaiveDate) -> DateTime<FixedOffset> {
    d.and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
        .fixed_offset()
}

/// Convert a decimal amount to minor units, rounding to two fractional
/// digits (banker's rounding is not wanted here; half-up matches how
/// registers print totals).
pub fn to_cents(d: Decimal) -> i64 {
    use rust_decimal::prelude::ToPrimitive;
    let rounded = d.round_dp_with_strategy(2, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
    (rounded * Decimal::ONE_HUNDRED).to_i64().unwrap_or(0)
}

/// Render minor units as a decimal string, e.g. `2567 → "25.67"`.
pub fn cents_to_string(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Minor units as an `f64` for JSON responses (exact for two-digit amounts).
pub fn cents_to_f64(cents: i64) -> f64 {
    cents as f64 / 100.0
}
