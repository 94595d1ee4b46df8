//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution. Run via
//! `beleg init` and again on every server start.
//!
//! # Schema
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `receipts` | One row per receipt, including the four audit-flag columns |
//! | `line_items` | Child rows, cascade-deleted with their receipt |
//!
//! Amounts are stored as integer minor units (cents) so the one-minor-unit
//! tolerances used by the audit engine are exact integer comparisons.
//! `date` holds the RFC 3339 timestamp with its original offset; `day` holds
//! the calendar date in that offset and is the duplicate-probe key.
//!
//! # Indexes
//!
//! - `idx_receipts_probe` — duplicate probe by `(vendor_norm, day)`
//! - `idx_receipts_day` — date-range filters and monthly buckets
//! - `idx_receipts_category` — category filters and aggregation
//! - `idx_line_items_receipt_id` — line-item lookup by parent

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all migrations. Safe to call multiple times.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS receipts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vendor TEXT NOT NULL,
            vendor_norm TEXT NOT NULL,
            date TEXT NOT NULL,
            day TEXT NOT NULL,
            total_cents INTEGER NOT NULL,
            tax_cents INTEGER NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'EUR',
            category TEXT,
            payment_method TEXT,
            receipt_number TEXT,
            image_ref TEXT,
            flag_duplicate INTEGER NOT NULL DEFAULT 0,
            flag_suspicious INTEGER NOT NULL DEFAULT 0,
            flag_missing_vat INTEGER NOT NULL DEFAULT 0,
            flag_math_error INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS line_items (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            receipt_id INTEGER NOT NULL,
            description TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price_cents INTEGER NOT NULL DEFAULT 0,
            total_cents INTEGER NOT NULL DEFAULT 0,
            vat_percent REAL,
            FOREIGN KEY (receipt_id) REFERENCES receipts(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_probe ON receipts(vendor_norm, day)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_day ON receipts(day DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_receipts_category ON receipts(category)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_line_items_receipt_id ON line_items(receipt_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
