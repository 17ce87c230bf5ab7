//! # Receipt Repository
//!
//! Fiscal receipts with sequential, per-tenant numbering.
//!
//! ## Numbering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  INSERT INTO receipts (receipt_id, ...)                                 │
//! │  SELECT COALESCE(MAX(receipt_id), 0) + 1, ...                           │
//! │  FROM receipts WHERE tenant_id = ?                                      │
//! │                                                                         │
//! │  One statement: the number is computed and claimed atomically.          │
//! │                                                                         │
//! │  PRIMARY KEY (tenant_id, receipt_id)                                    │
//! │     └── rejects a concurrent writer that saw the same MAX               │
//! │         → DbError::is_numbering_conflict() → caller retries once        │
//! │  UNIQUE (tenant_id, order_id, kind, dedupe_key)                         │
//! │     └── rejects a second receipt for the same fiscal event              │
//! │         → DbError::is_duplicate_receipt() → caller treats as no-op      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Renumbering
//! ```text
//! before:  1 (sale o1)  3 (sale o2)  4 (refund o2 → 3)
//! step 1:  negate every id            -1  -3  -4
//! step 2:  assign 1..N by issued_at    1   2   3
//!          and repoint references      refund → 2
//! after:   1 (sale o1)  2 (sale o2)  3 (refund o2 → 2)
//! ```
//! Negating first frees the whole positive range, so no intermediate state
//! collides with the primary key. All steps share one transaction.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::{DbError, DbResult};
use crate::repository::begin_write;
use fiskal_core::{Receipt, ReceiptKind, ReceiptStatus};

const RECEIPT_COLUMNS: &str = r#"
    tenant_id, receipt_id, order_id, kind, issued_at, status, amount_cents,
    payload, reference_receipt_id, refund_amount_cents, dedupe_key
"#;

#[derive(Debug, sqlx::FromRow)]
struct ReceiptRow {
    tenant_id: String,
    receipt_id: i64,
    order_id: String,
    kind: ReceiptKind,
    issued_at: DateTime<Utc>,
    status: ReceiptStatus,
    amount_cents: i64,
    payload: String,
    reference_receipt_id: Option<i64>,
    refund_amount_cents: Option<i64>,
    dedupe_key: String,
}

impl TryFrom<ReceiptRow> for Receipt {
    type Error = DbError;

    fn try_from(row: ReceiptRow) -> DbResult<Self> {
        let payload = serde_json::from_str(&row.payload)
            .map_err(|e| DbError::invalid_json("receipts.payload", e))?;
        Ok(Receipt {
            tenant_id: row.tenant_id,
            receipt_id: row.receipt_id,
            order_id: row.order_id,
            kind: row.kind,
            issued_at: row.issued_at,
            status: row.status,
            amount_cents: row.amount_cents,
            payload,
            reference_receipt_id: row.reference_receipt_id,
            refund_amount_cents: row.refund_amount_cents,
            dedupe_key: row.dedupe_key,
        })
    }
}

/// A receipt about to be issued; the number is assigned on insert.
#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub tenant_id: String,
    pub order_id: String,
    pub kind: ReceiptKind,
    pub issued_at: DateTime<Utc>,
    pub amount_cents: i64,
    pub payload: serde_json::Value,
    pub reference_receipt_id: Option<i64>,
    pub refund_amount_cents: Option<i64>,
    pub dedupe_key: String,
}

/// Result of [`ReceiptRepository::delete_unreferenced`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
    /// The receipt is a sale that refund receipts still point at.
    Referenced { refunds: usize },
}

/// Repository for receipt database operations.
#[derive(Debug, Clone)]
pub struct ReceiptRepository {
    pool: SqlitePool,
}

impl ReceiptRepository {
    /// Creates a new ReceiptRepository.
    pub fn new(pool: SqlitePool) -> Self {
        ReceiptRepository { pool }
    }

    async fn begin(&self) -> DbResult<Transaction<'static, Sqlite>> {
        begin_write(&self.pool).await
    }

    async fn commit(tx: Transaction<'static, Sqlite>) -> DbResult<()> {
        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))
    }

    /// Gets a receipt by its fiscal number.
    pub async fn get(&self, tenant_id: &str, receipt_id: i64) -> DbResult<Option<Receipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE tenant_id = ?1 AND receipt_id = ?2"
        );
        let row: Option<ReceiptRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(receipt_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Receipt::try_from).transpose()
    }

    /// Looks up the receipt guarded by the idempotency index.
    pub async fn find_by_dedupe(
        &self,
        tenant_id: &str,
        order_id: &str,
        kind: ReceiptKind,
        dedupe_key: &str,
    ) -> DbResult<Option<Receipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE tenant_id = ?1 AND order_id = ?2 AND kind = ?3 AND dedupe_key = ?4"
        );
        let row: Option<ReceiptRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(order_id)
            .bind(kind)
            .bind(dedupe_key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Receipt::try_from).transpose()
    }

    /// The order's sale receipt, if one was issued.
    pub async fn get_sale_for_order(
        &self,
        tenant_id: &str,
        order_id: &str,
    ) -> DbResult<Option<Receipt>> {
        self.find_by_dedupe(tenant_id, order_id, ReceiptKind::Sale, fiskal_core::SALE_DEDUPE_KEY)
            .await
    }

    /// All receipts of an order, in number order.
    pub async fn list_for_order(&self, tenant_id: &str, order_id: &str) -> DbResult<Vec<Receipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE tenant_id = ?1 AND order_id = ?2
             ORDER BY receipt_id ASC"
        );
        let rows: Vec<ReceiptRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    /// All receipts of a tenant, in number order.
    pub async fn list_all(&self, tenant_id: &str) -> DbResult<Vec<Receipt>> {
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts WHERE tenant_id = ?1 ORDER BY receipt_id ASC"
        );
        let rows: Vec<ReceiptRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    /// Receipts issued in one calendar month (UTC), for the audit export.
    pub async fn list_for_month(
        &self,
        tenant_id: &str,
        year: i32,
        month: u32,
    ) -> DbResult<Vec<Receipt>> {
        let (start, end) = month_bounds(year, month)?;
        let sql = format!(
            "SELECT {RECEIPT_COLUMNS} FROM receipts
             WHERE tenant_id = ?1 AND issued_at >= ?2 AND issued_at < ?3
             ORDER BY issued_at ASC, receipt_id ASC"
        );
        let rows: Vec<ReceiptRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Receipt::try_from).collect()
    }

    /// Counts a tenant's receipts.
    pub async fn count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM receipts WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Sum of refund receipts issued against an order.
    pub async fn refunded_total(&self, tenant_id: &str, order_id: &str) -> DbResult<i64> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM receipts
             WHERE tenant_id = ?1 AND order_id = ?2 AND kind = 'refund'",
        )
        .bind(tenant_id)
        .bind(order_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(total)
    }

    /// Inserts a receipt under the next free number.
    ///
    /// ## Errors
    /// `DbError::UniqueViolation`, see [`DbError::is_numbering_conflict`]
    /// and [`DbError::is_duplicate_receipt`].
    pub async fn insert_next(&self, receipt: &NewReceipt) -> DbResult<Receipt> {
        let mut tx = self.begin().await?;
        let issued = insert_next_in(&mut tx, receipt).await?;
        Self::commit(tx).await?;
        Ok(issued)
    }

    /// Inserts a refund receipt and moves the sale receipt's status in the
    /// same transaction.
    pub async fn insert_refund(
        &self,
        refund: &NewReceipt,
        sale_receipt_id: i64,
        sale_status: ReceiptStatus,
    ) -> DbResult<Receipt> {
        let mut tx = self.begin().await?;
        let issued = insert_next_in(&mut tx, refund).await?;

        let updated = sqlx::query(
            "UPDATE receipts SET status = ?1
             WHERE tenant_id = ?2 AND receipt_id = ?3 AND kind = 'sale'",
        )
        .bind(sale_status)
        .bind(&refund.tenant_id)
        .bind(sale_receipt_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(DbError::not_found("Sale receipt", sale_receipt_id.to_string()));
        }

        Self::commit(tx).await?;
        Ok(issued)
    }

    /// Deletes a receipt unless refund receipts still reference it.
    pub async fn delete_unreferenced(
        &self,
        tenant_id: &str,
        receipt_id: i64,
    ) -> DbResult<DeleteOutcome> {
        let mut tx = self.begin().await?;

        let refunds: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM receipts
             WHERE tenant_id = ?1 AND kind = 'refund' AND reference_receipt_id = ?2",
        )
        .bind(tenant_id)
        .bind(receipt_id)
        .fetch_one(&mut *tx)
        .await?;

        if refunds > 0 {
            return Ok(DeleteOutcome::Referenced {
                refunds: refunds as usize,
            });
        }

        let deleted = sqlx::query("DELETE FROM receipts WHERE tenant_id = ?1 AND receipt_id = ?2")
            .bind(tenant_id)
            .bind(receipt_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        Self::commit(tx).await?;

        if deleted == 0 {
            Ok(DeleteOutcome::NotFound)
        } else {
            info!(tenant_id = %tenant_id, receipt_id, "Receipt deleted");
            Ok(DeleteOutcome::Deleted)
        }
    }

    /// Moves a receipt's status. The payload is never touched.
    pub async fn set_status(
        &self,
        tenant_id: &str,
        receipt_id: i64,
        status: ReceiptStatus,
    ) -> DbResult<bool> {
        let updated = sqlx::query(
            "UPDATE receipts SET status = ?1 WHERE tenant_id = ?2 AND receipt_id = ?3",
        )
        .bind(status)
        .bind(tenant_id)
        .bind(receipt_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    /// Compacts a tenant's numbering to `1..N` in issuance order.
    ///
    /// Returns the `old → new` map of every receipt whose number changed.
    pub async fn renumber(&self, tenant_id: &str) -> DbResult<BTreeMap<i64, i64>> {
        let mut tx = self.begin().await?;

        let rows: Vec<(i64, Option<i64>)> = sqlx::query_as(
            "SELECT receipt_id, reference_receipt_id FROM receipts
             WHERE tenant_id = ?1
             ORDER BY issued_at ASC, receipt_id ASC",
        )
        .bind(tenant_id)
        .fetch_all(&mut *tx)
        .await?;

        let assignments: BTreeMap<i64, i64> = rows
            .iter()
            .enumerate()
            .map(|(idx, (old, _))| (*old, idx as i64 + 1))
            .collect();

        if assignments.iter().all(|(old, new)| old == new) {
            debug!(tenant_id = %tenant_id, "Numbering already compact");
            return Ok(BTreeMap::new());
        }

        sqlx::query("UPDATE receipts SET receipt_id = -receipt_id WHERE tenant_id = ?1")
            .bind(tenant_id)
            .execute(&mut *tx)
            .await?;

        for (old, reference) in &rows {
            let new_id = assignments[old];
            let new_reference = match reference {
                Some(sale) => Some(*assignments.get(sale).ok_or_else(|| {
                    DbError::Internal(format!(
                        "receipt {old} references missing sale receipt {sale}"
                    ))
                })?),
                None => None,
            };

            sqlx::query(
                "UPDATE receipts SET receipt_id = ?1, reference_receipt_id = ?2
                 WHERE tenant_id = ?3 AND receipt_id = ?4",
            )
            .bind(new_id)
            .bind(new_reference)
            .bind(tenant_id)
            .bind(-old)
            .execute(&mut *tx)
            .await?;
        }

        Self::commit(tx).await?;

        let changed: BTreeMap<i64, i64> = assignments
            .into_iter()
            .filter(|(old, new)| old != new)
            .collect();
        info!(tenant_id = %tenant_id, changed = changed.len(), "Receipts renumbered");
        Ok(changed)
    }
}

async fn insert_next_in(
    tx: &mut Transaction<'static, Sqlite>,
    receipt: &NewReceipt,
) -> DbResult<Receipt> {
    let payload = serde_json::to_string(&receipt.payload)
        .map_err(|e| DbError::invalid_json("receipts.payload", e))?;

    let receipt_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO receipts (
            tenant_id, receipt_id, order_id, kind, issued_at, status,
            amount_cents, payload, reference_receipt_id, refund_amount_cents, dedupe_key
        )
        SELECT ?1, COALESCE(MAX(receipt_id), 0) + 1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
        FROM receipts
        WHERE tenant_id = ?1
        RETURNING receipt_id
        "#,
    )
    .bind(&receipt.tenant_id)
    .bind(&receipt.order_id)
    .bind(receipt.kind)
    .bind(receipt.issued_at)
    .bind(ReceiptStatus::Issued)
    .bind(receipt.amount_cents)
    .bind(payload)
    .bind(receipt.reference_receipt_id)
    .bind(receipt.refund_amount_cents)
    .bind(&receipt.dedupe_key)
    .fetch_one(&mut **tx)
    .await?;

    debug!(
        tenant_id = %receipt.tenant_id,
        order_id = %receipt.order_id,
        kind = receipt.kind.as_str(),
        receipt_id,
        "Receipt number allocated"
    );

    Ok(Receipt {
        tenant_id: receipt.tenant_id.clone(),
        receipt_id,
        order_id: receipt.order_id.clone(),
        kind: receipt.kind,
        issued_at: receipt.issued_at,
        status: ReceiptStatus::Issued,
        amount_cents: receipt.amount_cents,
        payload: receipt.payload.clone(),
        reference_receipt_id: receipt.reference_receipt_id,
        refund_amount_cents: receipt.refund_amount_cents,
        dedupe_key: receipt.dedupe_key.clone(),
    })
}

/// `[first instant of month, first instant of next month)` in UTC.
fn month_bounds(year: i32, month: u32) -> DbResult<(DateTime<Utc>, DateTime<Utc>)> {
    let invalid = || DbError::QueryFailed(format!("invalid month {year}-{month:02}"));
    let first = NaiveDate::from_ymd_opt(year, month, 1).ok_or_else(invalid)?;
    let next = if first.month() == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .ok_or_else(invalid)?;

    let at_midnight = |d: NaiveDate| {
        d.and_hms_opt(0, 0, 0)
            .map(|n| Utc.from_utc_datetime(&n))
            .ok_or_else(invalid)
    };
    Ok((at_midnight(first)?, at_midnight(next)?))
}

// =============================================================================
// Unit Tests
// =============================================================================
