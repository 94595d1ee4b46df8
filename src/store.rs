//! Typed operations over the relational store.
//!
//! All mutations are atomic at the receipt + line-items granularity: one
//! SQLite transaction per receipt. Reads are concurrent (WAL). Orderings
//! are fixed: listings return descending timestamp, ties by descending
//! identifier; aggregations return descending amount, ties by name
//! ascending.
//!
//! Audit flags live in four integer columns but are only ever written from
//! [`crate::audit`] output, via [`ReceiptStore::set_flags`] or the flag
//! arguments of insert/replace.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::audit::DuplicateProbe;
use crate::models::{AuditFlags, LineItem, NewReceipt, Receipt};

#[derive(Clone)]
pub struct ReceiptStore {
    pool: SqlitePool,
}

/// Filters for `list`. Every field is an optional conjunct.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Normalized vendor equality.
    pub vendor_norm: Option<String>,
    /// Case-insensitive category equality.
    pub category: Option<String>,
    pub day_from: Option<NaiveDate>,
    pub day_to: Option<NaiveDate>,
    pub min_cents: Option<i64>,
    pub max_cents: Option<i64>,
    /// Only receipts with at least one audit flag.
    pub flagged_only: bool,
    /// Only receipts carrying the suspicious-category flag.
    pub suspicious_only: bool,
    pub limit: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NameTotal {
    pub name: String,
    pub total_cents: i64,
}

#[derive(Debug, Clone)]
pub struct MonthlyTotal {
    /// `YYYY-MM` bucket.
    pub month: String,
    pub total_cents: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub count: i64,
    pub total_cents: i64,
    pub vat_cents: i64,
    pub average_cents: i64,
}

impl ReceiptStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a receipt and its line items in one transaction. Returns the
    /// assigned identifier.
    pub async fn insert(&self, rec: &NewReceipt, flags: AuditFlags) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO receipts (
                vendor, vendor_norm, date, day, total_cents, tax_cents, currency,
                category, payment_method, receipt_number, image_ref,
                flag_duplicate, flag_suspicious, flag_missing_vat, flag_math_error,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&rec.vendor)
        .bind(&rec.vendor_norm)
        .bind(rec.date.to_rfc3339())
        .bind(rec.day.to_string())
        .bind(rec.total_cents)
        .bind(rec.tax_cents)
        .bind(&rec.currency)
        .bind(&rec.category)
        .bind(&rec.payment_method)
        .bind(&rec.receipt_number)
        .bind(&rec.image_ref)
        .bind(flags.duplicate)
        .bind(flags.suspicious)
        .bind(flags.missing_vat)
        .bind(flags.math_error)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        let id = result.last_insert_rowid();

        for item in &rec.items {
            sqlx::query(
                r#"
                INSERT INTO line_items (receipt_id, description, quantity, unit_price_cents, total_cents, vat_percent)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.total_cents)
            .bind(item.vat_percent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(id)
    }

    /// Full-replacement update. Line items are replaced wholesale. Returns
    /// `false` when the identifier is unknown.
    pub async fn replace(&self, id: i64, rec: &NewReceipt, flags: AuditFlags) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE receipts SET
                vendor = ?, vendor_norm = ?, date = ?, day = ?,
                total_cents = ?, tax_cents = ?, currency = ?,
                category = ?, payment_method = ?, receipt_number = ?, image_ref = ?,
                flag_duplicate = ?, flag_suspicious = ?, flag_missing_vat = ?, flag_math_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&rec.vendor)
        .bind(&rec.vendor_norm)
        .bind(rec.date.to_rfc3339())
        .bind(rec.day.to_string())
        .bind(rec.total_cents)
        .bind(rec.tax_cents)
        .bind(&rec.currency)
        .bind(&rec.category)
        .bind(&rec.payment_method)
        .bind(&rec.receipt_number)
        .bind(&rec.image_ref)
        .bind(flags.duplicate)
        .bind(flags.suspicious)
        .bind(flags.missing_vat)
        .bind(flags.math_error)
        .bind(&now)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("DELETE FROM line_items WHERE receipt_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for item in &rec.items {
            sqlx::query(
                r#"
                INSERT INTO line_items (receipt_id, description, quantity, unit_price_cents, total_cents, vat_percent)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(&item.description)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.total_cents)
            .bind(item.vat_percent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Delete a receipt; line items cascade. Returns the deleted receipt so
    /// the caller can refresh duplicate flags on its former matches.
    pub async fn delete(&self, id: i64) -> Result<Option<Receipt>> {
        let existing = self.get(id).await?;
        if existing.is_none() {
            return Ok(None);
        }

        sqlx::query("DELETE FROM receipts WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(existing)
    }

    pub async fn get(&self, id: i64) -> Result<Option<Receipt>> {
        let row = sqlx::query("SELECT * FROM receipts WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let mut receipt = row_to_receipt(&row)?;
        receipt.items = self.items_for(id).await?;
        Ok(Some(receipt))
    }

    /// List receipts, newest first, ties by descending identifier.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Receipt>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM receipts WHERE 1=1");

        if let Some(vendor) = &filter.vendor_norm {
            qb.push(" AND vendor_norm = ").push_bind(vendor.clone());
        }
        if let Some(category) = &filter.category {
            qb.push(" AND LOWER(category) = ")
                .push_bind(category.to_lowercase());
        }
        if let Some(from) = filter.day_from {
            qb.push(" AND day >= ").push_bind(from.to_string());
        }
        if let Some(to) = filter.day_to {
            qb.push(" AND day <= ").push_bind(to.to_string());
        }
        if let Some(min) = filter.min_cents {
            qb.push(" AND total_cents >= ").push_bind(min);
        }
        if let Some(max) = filter.max_cents {
            qb.push(" AND total_cents <= ").push_bind(max);
        }
        if filter.flagged_only {
            qb.push(" AND (flag_duplicate OR flag_suspicious OR flag_missing_vat OR flag_math_error)");
        }
        if filter.suspicious_only {
            qb.push(" AND flag_suspicious");
        }

        // `date` keeps its original offset; datetime() compares in UTC.
        qb.push(" ORDER BY datetime(date) DESC, id DESC");
        if let Some(limit) = filter.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut receipts = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut receipt = row_to_receipt(row)?;
            receipt.items = self.items_for(receipt.id).await?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }

    async fn items_for(&self, receipt_id: i64) -> Result<Vec<LineItem>> {
        let rows = sqlx::query(
            "SELECT id, description, quantity, unit_price_cents, total_cents, vat_percent
             FROM line_items WHERE receipt_id = ? ORDER BY id",
        )
        .bind(receipt_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| LineItem {
                id: row.get("id"),
                description: row.get("description"),
                quantity: row.get("quantity"),
                unit_price_cents: row.get("unit_price_cents"),
                total_cents: row.get("total_cents"),
                vat_percent: row.get("vat_percent"),
            })
            .collect())
    }

    /// Write audit-engine output for a stored receipt.
    pub async fn set_flags(&self, id: i64, flags: AuditFlags) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE receipts SET
                flag_duplicate = ?, flag_suspicious = ?, flag_missing_vat = ?, flag_math_error = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(flags.duplicate)
        .bind(flags.suspicious)
        .bind(flags.missing_vat)
        .bind(flags.math_error)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn all_ids(&self) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar("SELECT id FROM receipts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    /// Distinct normalized vendor names with one display spelling each.
    pub async fn distinct_vendors(&self) -> Result<Vec<(String, String)>> {
        let rows =
            sqlx::query("SELECT vendor_norm, MAX(vendor) AS vendor FROM receipts GROUP BY vendor_norm")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("vendor_norm"), row.get("vendor")))
            .collect())
    }

    // ============ Aggregations ============

    pub async fn summary(&self) -> Result<Summary> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count,
                    COALESCE(SUM(total_cents), 0) AS total,
                    COALESCE(SUM(tax_cents), 0) AS vat
             FROM receipts",
        )
        .fetch_one(&self.pool)
        .await?;

        let count: i64 = row.get("count");
        let total_cents: i64 = row.get("total");
        let vat_cents: i64 = row.get("vat");

        Ok(Summary {
            count,
            total_cents,
            vat_cents,
            average_cents: if count > 0 { total_cents / count } else { 0 },
        })
    }

    /// Month-bucketed totals, descending amount, ties by month ascending.
    pub async fn monthly_totals(&self) -> Result<Vec<MonthlyTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT strftime('%Y-%m', day) AS month, SUM(total_cents) AS total
            FROM receipts
            GROUP BY strftime('%Y-%m', day)
            ORDER BY total DESC, month ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| MonthlyTotal {
                month: row.get("month"),
                total_cents: row.get("total"),
            })
            .collect())
    }

    /// Per-vendor totals, descending amount, ties by name ascending.
    pub async fn vendor_totals(&self) -> Result<Vec<NameTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT MAX(vendor) AS name, SUM(total_cents) AS total
            FROM receipts
            GROUP BY vendor_norm
            ORDER BY total DESC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| NameTotal {
                name: row.get("name"),
                total_cents: row.get("total"),
            })
            .collect())
    }

    /// Per-category totals, descending amount, ties by name ascending.
    /// Uncategorized receipts are excluded.
    pub async fn category_totals(&self) -> Result<Vec<NameTotal>> {
        let rows = sqlx::query(
            r#"
            SELECT category AS name, SUM(total_cents) AS total
            FROM receipts
            WHERE category IS NOT NULL
            GROUP BY category
            ORDER BY total DESC, name ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| NameTotal {
                name: row.get("name"),
                total_cents: row.get("total"),
            })
            .collect())
    }
}

#[async_trait]
impl DuplicateProbe for ReceiptStore {
    async fn matching_receipt_ids(
        &self,
        vendor_norm: &str,
        day: NaiveDate,
        total_cents: i64,
        exclude_id: Option<i64>,
    ) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM receipts
            WHERE vendor_norm = ? AND day = ? AND ABS(total_cents - ?) <= 1 AND id != ?
            ORDER BY id
            "#,
        )
        .bind(vendor_norm)
        .bind(day.to_string())
        .bind(total_cents)
        .bind(exclude_id.unwrap_or(-1))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn row_to_receipt(row: &SqliteRow) -> Result<Receipt> {
    let date_str: String = row.get("date");
    let day_str: String = row.get("day");
    let created_str: String = row.get("created_at");
    let updated_str: String = row.get("updated_at");

    Ok(Receipt {
        id: row.get("id"),
        vendor: row.get("vendor"),
        vendor_norm: row.get("vendor_norm"),
        date: DateTime::parse_from_rfc3339(&date_str)?,
        day: day_str.parse()?,
        total_cents: row.get("total_cents"),
        tax_cents: row.get("tax_cents"),
        currency: row.get("currency"),
        category: row.get("category"),
        payment_method: row.get("payment_method"),
        receipt_number: row.get("receipt_number"),
        image_ref: row.get("image_ref"),
        flags: AuditFlags {
            duplicate: row.get("flag_duplicate"),
            suspicious: row.get("flag_suspicious"),
            missing_vat: row.get("flag_missing_vat"),
            math_error: row.get("flag_math_error"),
        },
        created_at: DateTime::parse_from_rfc3339(&created_str)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_str)?.with_timezone(&Utc),
        items: Vec::new(),
    })
}
