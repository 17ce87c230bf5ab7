//! # Receipt Issuance Engine
//!
//! Decides and issues sale and refund receipts for stored orders.
//!
//! ## Per-Order State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   NOT_PAID ──paid, eligible──► SALE ISSUED ──refunded/cancelled──►     │
//! │      │                            │                 REFUND ISSUED      │
//! │      │ ineligible                 │ partial refund       │             │
//! │      ▼                            ▼                      ▼             │
//! │   SKIPPED(reason)           PARTIALLY_REFUNDED ──rest──► REFUNDED      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exactly Once
//! 1. Check: look the receipt up by `(order, kind, dedupe key)`.
//! 2. Insert: allocate `MAX + 1` and insert in one statement.
//! 3. The unique idempotency index is the authoritative guard; losing the
//!    race to another writer is reported as `AlreadyExists`.
//! 4. A primary-key collision means a concurrent allocation took the same
//!    number; the insert is retried once with a fresh `MAX`.

use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, info, warn};

use fiskal_core::eligibility::{
    evaluate_refund, evaluate_sale, RefundContext, RefundDecision, SaleDecision, SkipReason,
};
use fiskal_core::validation::validate_refund_amount;
use fiskal_core::{
    CanonicalOrder, CoreError, FiscalSettings, Receipt, ReceiptKind, ReceiptStatus,
    FULL_REFUND_KEY, SALE_DEDUPE_KEY,
};
use fiskal_db::{Database, DbError, DbResult, DeleteOutcome, NewReceipt};

use crate::error::{SyncError, SyncResult};

/// Result of one issuance attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum IssueOutcome {
    Issued(Receipt),
    /// The receipt was already on record; nothing was written.
    AlreadyExists(Receipt),
    Skipped(SkipReason),
}

impl IssueOutcome {
    pub fn is_issued(&self) -> bool {
        matches!(self, IssueOutcome::Issued(_))
    }

    pub fn receipt(&self) -> Option<&Receipt> {
        match self {
            IssueOutcome::Issued(r) | IssueOutcome::AlreadyExists(r) => Some(r),
            IssueOutcome::Skipped(_) => None,
        }
    }
}

/// What reconciling one order did.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub sale: IssueOutcome,
    /// `None` when no refund was due.
    pub refund: Option<IssueOutcome>,
}

/// Issues receipts against the tenant store.
#[derive(Debug, Clone)]
pub struct ReceiptIssuer {
    db: Database,
}

impl ReceiptIssuer {
    pub fn new(db: Database) -> Self {
        ReceiptIssuer { db }
    }

    // =========================================================================
    // Pipeline Entry
    // =========================================================================

    /// Brings an order's receipts in line with its upstream state.
    ///
    /// Issues the sale receipt when due; once a sale receipt exists, issues
    /// whatever refund the order's refund state calls for.
    pub async fn reconcile(
        &self,
        tenant_id: &str,
        order: &CanonicalOrder,
        settings: &FiscalSettings,
    ) -> SyncResult<Reconciliation> {
        let existing = self
            .db
            .receipts()
            .get_sale_for_order(tenant_id, &order.id)
            .await?;

        let Some(sale) = existing else {
            return Ok(Reconciliation {
                sale: self.issue_sale(tenant_id, order, settings).await?,
                refund: None,
            });
        };

        let context = RefundContext {
            sale_receipt_id: sale.receipt_id,
            sale_amount_cents: sale.amount_cents,
            already_refunded_cents: self.db.receipts().refunded_total(tenant_id, &order.id).await?,
        };

        let refund = match evaluate_refund(order, &context) {
            RefundDecision::None => None,
            RefundDecision::Skip(reason) => {
                debug!(tenant_id = %tenant_id, order_id = %order.id, reason = %reason, "Refund receipt skipped");
                Some(IssueOutcome::Skipped(reason))
            }
            RefundDecision::Issue {
                amount_cents,
                dedupe_key,
            } => {
                let amount = amount_cents.unwrap_or(context.remaining_cents());
                Some(
                    self.insert_refund(tenant_id, &sale, &context, amount, amount_cents, dedupe_key)
                        .await?,
                )
            }
        };

        Ok(Reconciliation {
            sale: IssueOutcome::AlreadyExists(sale),
            refund,
        })
    }

    // =========================================================================
    // Sale
    // =========================================================================

    /// Issues the order's sale receipt if it is eligible and not yet issued.
    pub async fn issue_sale(
        &self,
        tenant_id: &str,
        order: &CanonicalOrder,
        settings: &FiscalSettings,
    ) -> SyncResult<IssueOutcome> {
        let (amount_cents, fiscal_store_id) = match evaluate_sale(order, settings) {
            SaleDecision::Issue {
                amount_cents,
                fiscal_store_id,
            } => (amount_cents, fiscal_store_id),
            SaleDecision::Skip(reason) => {
                debug!(tenant_id = %tenant_id, order_id = %order.id, reason = %reason, "Sale receipt skipped");
                return Ok(IssueOutcome::Skipped(reason));
            }
        };

        let receipts = self.db.receipts();
        if let Some(existing) = receipts
            .find_by_dedupe(tenant_id, &order.id, ReceiptKind::Sale, SALE_DEDUPE_KEY)
            .await?
        {
            return Ok(IssueOutcome::AlreadyExists(existing));
        }

        let new = NewReceipt {
            tenant_id: tenant_id.to_string(),
            order_id: order.id.clone(),
            kind: ReceiptKind::Sale,
            issued_at: Utc::now(),
            amount_cents,
            payload: order.receipt_snapshot(&fiscal_store_id),
            reference_receipt_id: None,
            refund_amount_cents: None,
            dedupe_key: SALE_DEDUPE_KEY.to_string(),
        };

        let outcome = self
            .insert_once(tenant_id, &new, || receipts.insert_next(&new))
            .await?;
        if let IssueOutcome::Issued(receipt) = &outcome {
            info!(
                tenant_id = %tenant_id,
                order_id = %order.id,
                receipt_id = receipt.receipt_id,
                amount_cents,
                "Sale receipt issued"
            );
        }
        Ok(outcome)
    }

    // =========================================================================
    // Refund
    // =========================================================================

    /// Issues a refund receipt requested by an operator.
    ///
    /// `amount_cents = None` refunds everything still refundable.
    pub async fn issue_refund(
        &self,
        tenant_id: &str,
        order_id: &str,
        amount_cents: Option<i64>,
    ) -> SyncResult<IssueOutcome> {
        let receipts = self.db.receipts();
        let sale = receipts
            .get_sale_for_order(tenant_id, order_id)
            .await?
            .ok_or_else(|| CoreError::NoSaleReceipt {
                order_id: order_id.to_string(),
            })?;

        let context = RefundContext {
            sale_receipt_id: sale.receipt_id,
            sale_amount_cents: sale.amount_cents,
            already_refunded_cents: receipts.refunded_total(tenant_id, order_id).await?,
        };

        let full_key_taken = receipts
            .find_by_dedupe(tenant_id, order_id, ReceiptKind::Refund, FULL_REFUND_KEY)
            .await?;
        if amount_cents.is_none() {
            if let Some(existing) = full_key_taken {
                return Ok(IssueOutcome::AlreadyExists(existing));
            }
        }

        let amount = validate_refund_amount(
            order_id,
            amount_cents,
            context.sale_amount_cents,
            context.already_refunded_cents,
        )?;

        let (refund_amount, dedupe_key) = match amount_cents {
            None => (
                (context.already_refunded_cents > 0).then_some(amount),
                FULL_REFUND_KEY.to_string(),
            ),
            Some(requested) => (
                Some(requested),
                format!("partial-{}", context.already_refunded_cents + requested),
            ),
        };

        self.insert_refund(tenant_id, &sale, &context, amount, refund_amount, dedupe_key)
            .await
    }

    async fn insert_refund(
        &self,
        tenant_id: &str,
        sale: &Receipt,
        context: &RefundContext,
        amount: i64,
        refund_amount_cents: Option<i64>,
        dedupe_key: String,
    ) -> SyncResult<IssueOutcome> {
        let receipts = self.db.receipts();
        if let Some(existing) = receipts
            .find_by_dedupe(tenant_id, &sale.order_id, ReceiptKind::Refund, &dedupe_key)
            .await?
        {
            return Ok(IssueOutcome::AlreadyExists(existing));
        }

        let sale_status = if context.already_refunded_cents + amount >= context.sale_amount_cents {
            ReceiptStatus::Refunded
        } else {
            ReceiptStatus::PartiallyRefunded
        };

        let mut payload = sale.payload.clone();
        payload["refund"] = json!({
            "sale_receipt_id": sale.receipt_id,
            "amount_cents": amount,
            "full": refund_amount_cents.is_none(),
        });

        let new = NewReceipt {
            tenant_id: tenant_id.to_string(),
            order_id: sale.order_id.clone(),
            kind: ReceiptKind::Refund,
            issued_at: Utc::now(),
            amount_cents: amount,
            payload,
            reference_receipt_id: Some(sale.receipt_id),
            refund_amount_cents,
            dedupe_key,
        };

        let outcome = self
            .insert_once(tenant_id, &new, || {
                receipts.insert_refund(&new, sale.receipt_id, sale_status)
            })
            .await?;
        if let IssueOutcome::Issued(receipt) = &outcome {
            info!(
                tenant_id = %tenant_id,
                order_id = %sale.order_id,
                receipt_id = receipt.receipt_id,
                sale_receipt_id = sale.receipt_id,
                amount_cents = amount,
                "Refund receipt issued"
            );
        }
        Ok(outcome)
    }

    // =========================================================================
    // Insert With Guards
    // =========================================================================

    /// Runs `insert`, mapping an idempotency hit to `AlreadyExists` and
    /// retrying a numbering collision exactly once.
    async fn insert_once<F, Fut>(
        &self,
        tenant_id: &str,
        new: &NewReceipt,
        insert: F,
    ) -> SyncResult<IssueOutcome>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = DbResult<Receipt>>,
    {
        for attempt in 0..2 {
            match insert().await {
                Ok(receipt) => return Ok(IssueOutcome::Issued(receipt)),
                Err(err) if err.is_duplicate_receipt() => {
                    return self.existing(new).await.map(IssueOutcome::AlreadyExists);
                }
                Err(err) if err.is_numbering_conflict() && attempt == 0 => {
                    warn!(tenant_id = %tenant_id, order_id = %new.order_id, "Receipt number collision, retrying");
                }
                Err(err) if err.is_numbering_conflict() => {
                    return Err(SyncError::NumberingConflict {
                        tenant_id: tenant_id.to_string(),
                    });
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::NumberingConflict {
            tenant_id: tenant_id.to_string(),
        })
    }

    async fn existing(&self, new: &NewReceipt) -> SyncResult<Receipt> {
        self.db
            .receipts()
            .find_by_dedupe(&new.tenant_id, &new.order_id, new.kind, &new.dedupe_key)
            .await?
            .ok_or_else(|| {
                SyncError::Database(DbError::not_found(
                    "Receipt",
                    format!("{}/{}/{}", new.order_id, new.kind.as_str(), new.dedupe_key),
                ))
            })
    }

    // =========================================================================
    // Administrative Overrides
    // =========================================================================

    /// Deletes a receipt.
    ///
    /// Sale receipts with refunds are refused. Deleting a refund recomputes
    /// its sale receipt's status from the refunds that remain.
    pub async fn cancel(&self, tenant_id: &str, receipt_id: i64) -> SyncResult<()> {
        let receipts = self.db.receipts();
        let target = receipts
            .get(tenant_id, receipt_id)
            .await?
            .ok_or_else(|| DbError::not_found("Receipt", receipt_id.to_string()))?;

        match receipts.delete_unreferenced(tenant_id, receipt_id).await? {
            DeleteOutcome::Deleted => {}
            DeleteOutcome::NotFound => {
                return Err(DbError::not_found("Receipt", receipt_id.to_string()).into());
            }
            DeleteOutcome::Referenced { refunds } => {
                return Err(CoreError::ReceiptHasRefunds { receipt_id, refunds }.into());
            }
        }

        if let (ReceiptKind::Refund, Some(sale_id)) = (target.kind, target.reference_receipt_id) {
            if let Some(sale) = receipts.get(tenant_id, sale_id).await? {
                let refunded = receipts.refunded_total(tenant_id, &sale.order_id).await?;
                let status = match refunded {
                    0 => ReceiptStatus::Issued,
                    r if r >= sale.amount_cents => ReceiptStatus::Refunded,
                    _ => ReceiptStatus::PartiallyRefunded,
                };
                receipts.set_status(tenant_id, sale_id, status).await?;
            }
        }

        warn!(tenant_id = %tenant_id, receipt_id, kind = target.kind.as_str(), "Receipt cancelled");
        Ok(())
    }

    /// Compacts numbering to `1..N`; returns the `old → new` map.
    pub async fn renumber(&self, tenant_id: &str) -> SyncResult<BTreeMap<i64, i64>> {
        Ok(self.db.receipts().renumber(tenant_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use fiskal_core::normalize::normalize;
    use fiskal_core::types::Provenance;
    use fiskal_db::DbConfig;
    use serde_json::{json, Value};

    async fn issuer() -> (ReceiptIssuer, Database) {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        (ReceiptIssuer::new(db.clone()), db)
    }

    fn settings() -> FiscalSettings {
        FiscalSettings {
            fiscal_store_id: Some("RF0001".into()),
            receipts_start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            cod_receipts_enabled: false,
        }
    }

    fn order(raw: Value) -> CanonicalOrder {
        normalize(&raw, Provenance::Backfill)
    }

    fn paid(id: &str, total: &str) -> CanonicalOrder {
        order(json!({
            "id": id,
            "paymentStatus": "PAID",
            "priceSummary": {"total": {"amount": total}},
            "currency": "BGN",
            "createdDate": "2024-01-05T10:00:00Z",
            "transactionId": "pi_abc123456"
        }))
    }

    #[tokio::test]
    async fn test_sale_issued_once() {
        let (issuer, db) = issuer().await;
        let o = paid("o1", "100.00");

        let first = issuer.issue_sale("t1", &o, &settings()).await.unwrap();
        let receipt = match first {
            IssueOutcome::Issued(r) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(receipt.receipt_id, 1);
        assert_eq!(receipt.amount_cents, 10000);
        assert_eq!(receipt.payload["fiscal_store_id"], "RF0001");

        let second = issuer.issue_sale("t1", &o, &settings()).await.unwrap();
        assert!(matches!(second, IssueOutcome::AlreadyExists(ref r) if r.receipt_id == 1));
        assert_eq!(db.receipts().count("t1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ineligible_orders_skipped() {
        let (issuer, db) = issuer().await;

        let zero = paid("o-zero", "0.00");
        assert_eq!(
            issuer.issue_sale("t1", &zero, &settings()).await.unwrap(),
            IssueOutcome::Skipped(SkipReason::ZeroTotal)
        );

        let early = order(json!({
            "id": "o-early",
            "paymentStatus": "PAID",
            "priceSummary": {"total": {"amount": "10.00"}},
            "createdDate": "2023-12-31T23:00:00Z",
            "transactionId": "pi_abc123456"
        }));
        assert_eq!(
            issuer.issue_sale("t1", &early, &settings()).await.unwrap(),
            IssueOutcome::Skipped(SkipReason::BeforeStartDate)
        );

        let cod = order(json!({
            "id": "o-cod",
            "paymentStatus": "PAID",
            "priceSummary": {"total": {"amount": "10.00"}},
            "createdDate": "2024-02-01T10:00:00Z",
            "paymentMethod": "Cash on delivery"
        }));
        assert_eq!(
            issuer.issue_sale("t1", &cod, &settings()).await.unwrap(),
            IssueOutcome::Skipped(SkipReason::CodReceiptsDisabled)
        );

        assert_eq!(db.receipts().count("t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_snapshot_frozen_after_order_changes() {
        let (issuer, db) = issuer().await;
        let mut o = paid("o1", "100.00");
        issuer.issue_sale("t1", &o, &settings()).await.unwrap();

        o.total_cents = Some(99999);
        o.customer_name = "Changed".into();
        issuer.issue_sale("t1", &o, &settings()).await.unwrap();

        let stored = db.receipts().get("t1", 1).await.unwrap().unwrap();
        assert_eq!(stored.payload["total_cents"], 10000);
        assert_eq!(stored.amount_cents, 10000);
    }

    #[tokio::test]
    async fn test_reconcile_full_refund_references_sale() {
        let (issuer, db) = issuer().await;
        let o = paid("o1", "100.00");
        let first = issuer.reconcile("t1", &o, &settings()).await.unwrap();
        assert!(first.sale.is_issued());
        assert!(first.refund.is_none());

        let mut refunded = o.clone();
        refunded.payment_status = fiskal_core::PaymentStatus::FullyRefunded;
        let second = issuer.reconcile("t1", &refunded, &settings()).await.unwrap();

        let refund = match second.refund {
            Some(IssueOutcome::Issued(r)) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(refund.receipt_id, 2);
        assert_eq!(refund.kind, ReceiptKind::Refund);
        assert_eq!(refund.reference_receipt_id, Some(1));
        assert_eq!(refund.refund_amount_cents, None);
        assert_eq!(refund.amount_cents, 10000);

        let sale = db.receipts().get("t1", 1).await.unwrap().unwrap();
        assert_eq!(sale.status, ReceiptStatus::Refunded);

        // Replaying the refunded state issues nothing new
        let third = issuer.reconcile("t1", &refunded, &settings()).await.unwrap();
        assert!(third.refund.is_none());
        assert_eq!(db.receipts().count("t1").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_partial_then_full_refund() {
        let (issuer, db) = issuer().await;
        let o = paid("o1", "100.00");
        issuer.reconcile("t1", &o, &settings()).await.unwrap();

        let mut partial = o.clone();
        partial.payment_status = fiskal_core::PaymentStatus::PartiallyRefunded;
        partial.refunded_cents = Some(3000);
        partial.last_refund_id = Some("r-1".into());
        let result = issuer.reconcile("t1", &partial, &settings()).await.unwrap();
        let refund = result.refund.and_then(|o| o.receipt().cloned()).unwrap();
        assert_eq!(refund.amount_cents, 3000);
        assert_eq!(refund.dedupe_key, "r-1");
        assert_eq!(
            db.receipts().get("t1", 1).await.unwrap().unwrap().status,
            ReceiptStatus::PartiallyRefunded
        );

        let mut full = partial.clone();
        full.payment_status = fiskal_core::PaymentStatus::FullyRefunded;
        let result = issuer.reconcile("t1", &full, &settings()).await.unwrap();
        let rest = result.refund.and_then(|o| o.receipt().cloned()).unwrap();
        assert_eq!(rest.amount_cents, 7000);
        assert_eq!(rest.refund_amount_cents, Some(7000));
        assert_eq!(db.receipts().refunded_total("t1", "o1").await.unwrap(), 10000);
    }

    #[tokio::test]
    async fn test_manual_refund_validation() {
        let (issuer, _db) = issuer().await;

        let err = issuer.issue_refund("t1", "missing", None).await.unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::NoSaleReceipt { .. })));

        issuer.issue_sale("t1", &paid("o1", "100.00"), &settings()).await.unwrap();

        let err = issuer.issue_refund("t1", "o1", Some(15000)).await.unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::RefundExceedsRemaining { .. })));

        let partial = issuer.issue_refund("t1", "o1", Some(2500)).await.unwrap();
        assert_eq!(partial.receipt().unwrap().dedupe_key, "partial-2500");

        let rest = issuer.issue_refund("t1", "o1", None).await.unwrap();
        assert_eq!(rest.receipt().unwrap().amount_cents, 7500);

        let again = issuer.issue_refund("t1", "o1", None).await.unwrap();
        assert!(matches!(again, IssueOutcome::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_cancel_and_renumber() {
        let (issuer, db) = issuer().await;
        for id in ["o1", "o2", "o3"] {
            issuer.issue_sale("t1", &paid(id, "10.00"), &settings()).await.unwrap();
        }
        issuer.issue_refund("t1", "o3", None).await.unwrap();

        let err = issuer.cancel("t1", 3).await.unwrap_err();
        assert!(matches!(err, SyncError::Core(CoreError::ReceiptHasRefunds { refunds: 1, .. })));

        issuer.cancel("t1", 2).await.unwrap();
        let map = issuer.renumber("t1").await.unwrap();
        assert_eq!(map, BTreeMap::from([(3, 2), (4, 3)]));

        let all = db.receipts().list_all("t1").await.unwrap();
        assert_eq!(all.iter().map(|r| r.receipt_id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(all[2].reference_receipt_id, Some(2));
        assert_eq!(all[1].kind, ReceiptKind::Sale);
    }

    #[tokio::test]
    async fn test_cancel_refund_restores_sale_status() {
        let (issuer, db) = issuer().await;
        issuer.issue_sale("t1", &paid("o1", "10.00"), &settings()).await.unwrap();
        issuer.issue_refund("t1", "o1", None).await.unwrap();
        assert_eq!(db.receipts().get("t1", 1).await.unwrap().unwrap().status, ReceiptStatus::Refunded);

        issuer.cancel("t1", 2).await.unwrap();
        assert_eq!(db.receipts().get("t1", 1).await.unwrap().unwrap().status, ReceiptStatus::Issued);
        assert!(issuer.cancel("t1", 42).await.is_err());
    }

    fn pending(tenant_id: &str, order_id: &str) -> NewReceipt {
        NewReceipt {
            tenant_id: tenant_id.to_string(),
            order_id: order_id.to_string(),
            kind: ReceiptKind::Sale,
            issued_at: Utc::now(),
            amount_cents: 1000,
            payload: json!({"order_id": order_id}),
            reference_receipt_id: None,
            refund_amount_cents: None,
            dedupe_key: SALE_DEDUPE_KEY.to_string(),
        }
    }

    fn number_collision() -> DbError {
        DbError::duplicate("receipts.tenant_id, receipts.receipt_id", "1")
    }

    #[tokio::test]
    async fn test_numbering_collision_retried_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (issuer, db) = issuer().await;
        let receipts = db.receipts();
        let new = pending("t1", "o1");

        let attempts = AtomicUsize::new(0);
        let outcome = issuer
            .insert_once("t1", &new, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let (receipts, new) = (&receipts, &new);
                async move {
                    if attempt == 0 {
                        Err(number_collision())
                    } else {
                        receipts.insert_next(new).await
                    }
                }
            })
            .await
            .unwrap();
        assert!(matches!(outcome, IssueOutcome::Issued(ref r) if r.receipt_id == 1));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let attempts = AtomicUsize::new(0);
        let err = issuer
            .insert_once("t1", &pending("t1", "o2"), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(number_collision()) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NumberingConflict { .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(db.receipts().count("t1").await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_issuance_numbers_without_gaps() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = DbConfig::new(dir.path().join("fiskal.db")).max_connections(8);
        let db = Database::new(config).await.unwrap();
        let issuer = ReceiptIssuer::new(db.clone());

        let order_ids: Vec<String> = (0..12).map(|i| format!("o{i}")).collect();

        // Every order is issued by two tasks at once.
        let mut tasks = Vec::new();
        for id in order_ids.iter().chain(order_ids.iter()) {
            let (issuer, order) = (issuer.clone(), paid(id, "10.00"));
            tasks.push(tokio::spawn(async move {
                issuer.issue_sale("t1", &order, &settings()).await
            }));
        }
        let mut issued = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().is_issued() {
                issued += 1;
            }
        }
        assert_eq!(issued, order_ids.len());

        let mut tasks = Vec::new();
        for id in order_ids.iter().take(6).chain(order_ids.iter().take(6)) {
            let (issuer, id) = (issuer.clone(), id.clone());
            tasks.push(tokio::spawn(async move {
                issuer.issue_refund("t1", &id, None).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let all = db.receipts().list_all("t1").await.unwrap();
        let ids: Vec<i64> = all.iter().map(|r| r.receipt_id).collect();
        assert_eq!(ids, (1..=18).collect::<Vec<i64>>());

        let keys: std::collections::BTreeSet<(&str, &str, &str)> = all
            .iter()
            .map(|r| (r.order_id.as_str(), r.kind.as_str(), r.dedupe_key.as_str()))
            .collect();
        assert_eq!(keys.len(), all.len());

        for refund in all.iter().filter(|r| r.kind == ReceiptKind::Refund) {
            let sale = db
                .receipts()
                .get_sale_for_order("t1", &refund.order_id)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(refund.reference_receipt_id, Some(sale.receipt_id));
        }
    }
}
