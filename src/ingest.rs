//! The ingestor: the single write path into the system.
//!
//! Every record — posted directly or produced by the extractor — flows
//! through [`Ingestor::ingest`]:
//!
//! 1. field-level validation (amounts, currency, line-item arithmetic);
//! 2. the audit engine, whose four flags are attached to the record;
//! 3. write-through: insert into the relational store, then upsert the
//!    embedding + metadata into the vector index under the assigned id.
//!
//! The store write is never rolled back when the index upsert fails;
//! instead the identifier goes onto the reconciliation queue and the
//! receipt is temporarily queryable by id but not by semantic search.
//!
//! After any write the duplicate flag is refreshed on all probe matches of
//! the touched receipt, so both sides of a duplicate pair carry the flag
//! and deleting one side clears the other.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::warn;

use crate::audit::{audit, normalize_vendor, AuditSubject, DuplicateProbe};
use crate::embedding::Embedder;
use crate::models::{
    parse_instant, to_cents, AuditFlags, NewLineItem, NewReceipt, ReceiptDraft,
};
use crate::reconcile::ReconcileQueue;
use crate::store::ReceiptStore;
use crate::vector::{document_for, metadata_for, VectorIndex};

#[derive(Debug)]
pub enum IngestError {
    Validation(String),
    NotFound(i64),
    Internal(anyhow::Error),
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Validation(msg) => write!(f, "validation failed: {}", msg),
            IngestError::NotFound(id) => write!(f, "receipt {} not found", id),
            IngestError::Internal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<anyhow::Error> for IngestError {
    fn from(e: anyhow::Error) -> Self {
        IngestError::Internal(e)
    }
}

/// Result of an ingest: the assigned identifier, the audit flags, and
/// whether the vector index is already in step (false means the id is on
/// the reconciliation queue).
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    pub id: i64,
    pub flags: AuditFlags,
    pub indexed: bool,
}

pub struct Ingestor {
    store: ReceiptStore,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    queue: ReconcileQueue,
    default_currency: String,
}

impl Ingestor {
    pub fn new(
        store: ReceiptStore,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        queue: ReconcileQueue,
        default_currency: String,
    ) -> Self {
        Self {
            store,
            index,
            embedder,
            queue,
            default_currency,
        }
    }

    pub async fn ingest(&self, draft: ReceiptDraft) -> Result<IngestOutcome, IngestError> {
        let rec = validate(&draft, &self.default_currency).map_err(IngestError::Validation)?;

        let subject = AuditSubject::from_new(&rec);
        let flags = audit(&subject, &self.store).await?;

        let id = self.store.insert(&rec, flags).await?;

        // The new receipt may have turned existing receipts into duplicates.
        if flags.duplicate {
            self.refresh_duplicate_matches(&rec.vendor_norm, rec.day, rec.total_cents, id)
                .await?;
        }

        let indexed = self.try_index(id).await;
        Ok(IngestOutcome { id, flags, indexed })
    }

    /// Full-replacement update; re-runs audit and re-embeds.
    pub async fn update(&self, id: i64, draft: ReceiptDraft) -> Result<IngestOutcome, IngestError> {
        let old = self
            .store
            .get(id)
            .await?
            .ok_or(IngestError::NotFound(id))?;

        let rec = validate(&draft, &self.default_currency).map_err(IngestError::Validation)?;

        let mut subject = AuditSubject::from_new(&rec);
        subject.exclude_id = Some(id);
        let flags = audit(&subject, &self.store).await?;

        if !self.store.replace(id, &rec, flags).await? {
            return Err(IngestError::NotFound(id));
        }

        // Matches of both the old and the new probe key may have changed.
        self.refresh_duplicate_matches(&old.vendor_norm, old.day, old.total_cents, id)
            .await?;
        self.refresh_duplicate_matches(&rec.vendor_norm, rec.day, rec.total_cents, id)
            .await?;

        let indexed = self.try_index(id).await;
        Ok(IngestOutcome { id, flags, indexed })
    }

    /// Delete a receipt and evict its vector. Former duplicate partners are
    /// re-audited so a now-unique receipt loses the flag.
    pub async fn delete(&self, id: i64) -> Result<(), IngestError> {
        let deleted = self
            .store
            .delete(id)
            .await?
            .ok_or(IngestError::NotFound(id))?;

        if let Err(e) = self.index.remove(id).await {
            warn!(receipt_id = id, error = %e, "vector eviction failed; queued for reconciliation");
            self.queue.push(id);
        }

        self.refresh_duplicate_matches(
            &deleted.vendor_norm,
            deleted.day,
            deleted.total_cents,
            id,
        )
        .await?;

        Ok(())
    }

    /// Recompute the audit flags of every stored receipt from scratch.
    /// Used by tests and after schema migrations. Returns how many receipts
    /// changed.
    pub async fn recompute_all_flags(&self) -> Result<u64> {
        let mut changed = 0u64;
        for id in self.store.all_ids().await? {
            if let Some(receipt) = self.store.get(id).await? {
                let subject = AuditSubject::from_stored(&receipt);
                let flags = audit(&subject, &self.store).await?;
                if flags != receipt.flags {
                    self.store.set_flags(id, flags).await?;
                    self.try_index(id).await;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// Re-audit every receipt matching the probe key (excluding `origin`),
    /// persisting flag changes and keeping their index metadata in step.
    async fn refresh_duplicate_matches(
        &self,
        vendor_norm: &str,
        day: chrono::NaiveDate,
        total_cents: i64,
        origin: i64,
    ) -> Result<()> {
        let matches = self
            .store
            .matching_receipt_ids(vendor_norm, day, total_cents, Some(origin))
            .await?;

        for match_id in matches {
            if let Some(receipt) = self.store.get(match_id).await? {
                let subject = AuditSubject::from_stored(&receipt);
                let flags = audit(&subject, &self.store).await?;
                if flags != receipt.flags {
                    self.store.set_flags(match_id, flags).await?;
                    self.try_index(match_id).await;
                }
            }
        }
        Ok(())
    }

    /// Upsert the vector entry for `id`; on failure, log and queue.
    async fn try_index(&self, id: i64) -> bool {
        match sync_vector(&self.store, self.index.as_ref(), self.embedder.as_ref(), id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(receipt_id = id, error = %e, "vector index upsert failed; queued for reconciliation");
                self.queue.push(id);
                false
            }
        }
    }
}

/// Bring the vector index in step with the store for one identifier:
/// re-embed and upsert when the receipt exists, evict when it does not.
pub async fn sync_vector(
    store: &ReceiptStore,
    index: &dyn VectorIndex,
    embedder: &dyn Embedder,
    id: i64,
) -> Result<()> {
    match store.get(id).await? {
        Some(receipt) => {
            let document = document_for(&receipt);
            let embedding = embedder.embed(&document).await?;
            index
                .add(id, &document, &embedding, &metadata_for(&receipt))
                .await
        }
        None => index.remove(id).await,
    }
}

/// Field-level validation per the data model. Returns a record with all
/// amounts rounded to two fractional digits and held as minor units.
pub fn validate(draft: &ReceiptDraft, default_currency: &str) -> Result<NewReceipt, String> {
    let vendor = draft.vendor.split_whitespace().collect::<Vec<_>>().join(" ");
    if vendor.is_empty() {
        return Err("vendor must not be empty".to_string());
    }

    let date_str = draft
        .date
        .as_deref()
        .ok_or_else(|| "date is required".to_string())?;
    let date =
        parse_instant(date_str).ok_or_else(|| format!("unparseable date: '{}'", date_str))?;

    let total = draft.total.ok_or_else(|| "total is required".to_string())?;
    if total < Decimal::ZERO {
        return Err("total must be non-negative".to_string());
    }
    let tax = draft.tax.unwrap_or(Decimal::ZERO);
    if tax < Decimal::ZERO {
        return Err("tax must be non-negative".to_string());
    }
    let total_cents = to_cents(total);
    let tax_cents = to_cents(tax);
    if total_cents < tax_cents {
        return Err(format!(
            "total ({}) must be >= tax ({})",
            total, tax
        ));
    }

    let currency = draft
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default_currency)
        .to_uppercase();
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("currency must be a three-letter code, got '{}'", currency));
    }

    let mut items = Vec::with_capacity(draft.items.len());
    for (i, item) in draft.items.iter().enumerate() {
        items.push(validate_item(item).map_err(|e| format!("line item {}: {}", i + 1, e))?);
    }

    Ok(NewReceipt {
        vendor_norm: normalize_vendor(&vendor),
        vendor,
        date,
        day: date.date_naive(),
        total_cents,
        tax_cents,
        currency,
        category: clean_optional(&draft.category),
        payment_method: clean_optional(&draft.payment_method),
        receipt_number: clean_optional(&draft.receipt_number),
        image_ref: clean_optional(&draft.image_ref),
        items,
    })
}

fn validate_item(item: &crate::models::LineItemDraft) -> Result<NewLineItem, String> {
    let description = item.description.trim().to_string();
    if description.is_empty() {
        return Err("description must not be empty".to_string());
    }
    if item.quantity < 1 {
        return Err(format!("quantity must be positive, got {}", item.quantity));
    }

    let (unit_price_cents, total_cents) = match (item.unit_price, item.total) {
        (Some(unit), Some(total)) => (to_cents(unit), to_cents(total)),
        (Some(unit), None) => {
            let unit_cents = to_cents(unit);
            (unit_cents, unit_cents * item.quantity)
        }
        (None, Some(total)) => {
            let total_cents = to_cents(total);
            (total_cents / item.quantity, total_cents)
        }
        (None, None) => return Err("either unit_price or total is required".to_string()),
    };

    if unit_price_cents < 0 || total_cents < 0 {
        return Err("amounts must be non-negative".to_string());
    }

    // quantity × unit_price must equal the line total within one minor unit.
    if (item.quantity * unit_price_cents - total_cents).abs() > 1 {
        return Err(format!(
            "quantity × unit_price ({} × {}) does not match total ({})",
            item.quantity,
            crate::models::cents_to_string(unit_price_cents),
            crate::models::cents_to_string(total_cents)
        ));
    }

    if let Some(vat) = item.vat_percent {
        if !(0.0..=100.0).contains(&vat) {
            return Err(format!("vat_percent must be within 0-100, got {}", vat));
        }
    }

    Ok(NewLineItem {
        description,
        quantity: item.quantity,
        unit_price_cents,
        total_cents,
        vat_percent: item.vat_percent,
    })
}

fn clean_optional(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}
