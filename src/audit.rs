//! The audit engine: a pure, deterministic function from a receipt (plus a
//! duplicate probe over the store) to the four audit flags.
//!
//! The engine never mutates state. Callers persist the returned
//! [`AuditFlags`] themselves; the flags stored on a receipt are a cache of
//! this function's output and are recomputed on every write.
//!
//! # Flags
//!
//! | Flag | Condition |
//! |------|-----------|
//! | `missing_vat` | tax is zero, or a non-empty item list carries only 0% VAT lines |
//! | `math_error` | non-empty item list whose sum reconciles with neither the gross total nor the net total (total − tax), within one minor unit |
//! | `suspicious` | an item description matches the watchlist, or the category is one of the flagged categories |
//! | `duplicate` | another receipt with the same normalized vendor, same calendar day, and a total within one minor unit |

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{AuditFlags, NewReceipt, Receipt};

/// Item descriptions containing any of these (case-insensitive substring)
/// mark the receipt as suspicious.
pub const WATCHLIST: &[&str] = &["alcohol", "wine", "beer", "spirits", "tobacco", "cigarette"];

/// Categories that mark a receipt as suspicious on their own.
pub const SUSPICIOUS_CATEGORIES: &[&str] = &["bar", "alcohol", "tobacco"];

/// Tolerance for amount comparisons, in minor units.
const TOLERANCE_CENTS: i64 = 1;

/// Duplicate probe over the relational store. The audit engine only reads.
#[async_trait]
pub trait DuplicateProbe: Send + Sync {
    /// Identifiers of receipts with the same normalized vendor, the same
    /// calendar day, and a total within one minor unit, excluding
    /// `exclude_id` (the receipt being audited, when it is already stored).
    async fn matching_receipt_ids(
        &self,
        vendor_norm: &str,
        day: NaiveDate,
        total_cents: i64,
        exclude_id: Option<i64>,
    ) -> Result<Vec<i64>>;
}

/// The receipt fields the audit engine looks at, detached from storage so
/// both not-yet-stored and stored receipts can be audited.
#[derive(Debug, Clone)]
pub struct AuditSubject {
    /// Set for stored receipts so the duplicate probe excludes self.
    pub exclude_id: Option<i64>,
    pub vendor_norm: String,
    pub day: NaiveDate,
    pub total_cents: i64,
    pub tax_cents: i64,
    pub category: Option<String>,
    pub items: Vec<AuditItem>,
}

#[derive(Debug, Clone)]
pub struct AuditItem {
    pub description: String,
    pub total_cents: i64,
    pub vat_percent: Option<f64>,
}

impl AuditSubject {
    pub fn from_new(rec: &NewReceipt) -> Self {
        Self {
            exclude_id: None,
            vendor_norm: rec.vendor_norm.clone(),
            day: rec.day,
            total_cents: rec.total_cents,
            tax_cents: rec.tax_cents,
            category: rec.category.clone(),
            items: rec
                .items
                .iter()
                .map(|i| AuditItem {
                    description: i.description.clone(),
                    total_cents: i.total_cents,
                    vat_percent: i.vat_percent,
                })
                .collect(),
        }
    }

    pub fn from_stored(rec: &Receipt) -> Self {
        Self {
            exclude_id: Some(rec.id),
            vendor_norm: rec.vendor_norm.clone(),
            day: rec.day,
            total_cents: rec.total_cents,
            tax_cents: rec.tax_cents,
            category: rec.category.clone(),
            items: rec
                .items
                .iter()
                .map(|i| AuditItem {
                    description: i.description.clone(),
                    total_cents: i.total_cents,
                    vat_percent: i.vat_percent,
                })
                .collect(),
        }
    }
}

/// Run all four checks. Returns the flags; mutates nothing.
pub async fn audit(subject: &AuditSubject, probe: &dyn DuplicateProbe) -> Result<AuditFlags> {
    let matches = probe
        .matching_receipt_ids(
            &subject.vendor_norm,
            subject.day,
            subject.total_cents,
            subject.exclude_id,
        )
        .await?;

    Ok(AuditFlags {
        duplicate: !matches.is_empty(),
        suspicious: check_suspicious(subject),
        missing_vat: check_missing_vat(subject),
        math_error: check_math_error(subject),
    })
}

fn check_missing_vat(subject: &AuditSubject) -> bool {
    if subject.tax_cents == 0 {
        return true;
    }
    !subject.items.is_empty()
        && subject
            .items
            .iter()
            .all(|i| matches!(i.vat_percent, Some(p) if p == 0.0))
}

/// Receipts itemize either gross (line sum equals the total) or net (line
/// sum equals total minus tax). Flag only when the sum reconciles with
/// neither, beyond one minor unit.
fn check_math_error(subject: &AuditSubject) -> bool {
    if subject.items.is_empty() {
        return false;
    }
    let line_sum: i64 = subject.items.iter().map(|i| i.total_cents).sum();
    let net = subject.total_cents - subject.tax_cents;
    (line_sum - subject.total_cents).abs() > TOLERANCE_CENTS
        && (line_sum - net).abs() > TOLERANCE_CENTS
}

fn check_suspicious(subject: &AuditSubject) -> bool {
    if let Some(category) = &subject.category {
        let category = category.trim().to_lowercase();
        if SUSPICIOUS_CATEGORIES.contains(&category.as_str()) {
            return true;
        }
    }
    subject
        .items
        .iter()
        .any(|i| matches_watchlist(&i.description))
}

/// Case-insensitive substring match against the watchlist.
pub fn matches_watchlist(description: &str) -> bool {
    let lower = description.to_lowercase();
    WATCHLIST.iter().any(|term| lower.contains(term))
}

/// Trim, collapse internal whitespace, lowercase. `"  REWE  "` and `"rewe"`
/// normalize identically.
pub fn normalize_vendor(vendor: &str) -> String {
    vendor
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
