//! # Payment Enrichment Resolver
//!
//! Fills the gaps a normalized order leaves: transaction reference, delivery
//! method, shipping address, customer identity, and refund totals.
//!
//! ## Resolution Order
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  0. stored metadata.enrichment   (previous runs; no network)            │
//! │  1. batch payment index          (one call per page; O(1) lookup)       │
//! │  2. order detail                 (delivery / address / customer gaps)   │
//! │  3. order transactions           (transaction ref gap)                  │
//! │  4. payment query by id/number   (transaction ref gap)                  │
//! │  5. payment by id                (ref gap, payment id known)            │
//! │                                                                         │
//! │  Each step is optional: a miss or a failure moves on to the next one.   │
//! │  A provider id (pi_/ch_/pay_) found at any step replaces an internal    │
//! │  payment id as the transaction reference.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Results are written to `metadata.enrichment`; the raw payload is never
//! modified.

use tracing::{debug, warn};

use fiskal_core::normalize::normalize;
use fiskal_core::payment::{
    needs_enrichment, EnrichmentGaps, EnrichmentRecord, OrderPayments, PaymentIndex, PaymentRecord,
};
use fiskal_core::{CanonicalOrder, UNKNOWN_CUSTOMER};

use crate::source::OrderSource;

/// Source labels recorded in `metadata.enrichment.sources`.
pub mod sources {
    pub const BATCH: &str = "batch_payments";
    pub const ORDER_DETAIL: &str = "order_detail";
    pub const ORDER_TRANSACTIONS: &str = "order_transactions";
    pub const PAYMENT_QUERY: &str = "payment_query";
    pub const PAYMENT_BY_ID: &str = "payment_by_id";
}

/// What enrichment achieved for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    /// Nothing was missing and no batch data applied.
    NotNeeded,
    /// At least one step contributed, named by source label.
    Enriched { sources: Vec<String> },
    /// Gaps remained and no step found anything. Not an error.
    Miss,
}

/// Resolves payment and order metadata through [`OrderSource`].
pub struct PaymentResolver<'a> {
    source: &'a dyn OrderSource,
    tenant_id: &'a str,
    batch: Option<&'a PaymentIndex>,
}

impl<'a> PaymentResolver<'a> {
    pub fn new(source: &'a dyn OrderSource, tenant_id: &'a str) -> Self {
        PaymentResolver {
            source,
            tenant_id,
            batch: None,
        }
    }

    /// Uses a page's pre-fetched payment index as step 1.
    pub fn with_batch(mut self, batch: Option<&'a PaymentIndex>) -> Self {
        self.batch = batch;
        self
    }

    /// Enriches `order` in place.
    ///
    /// `stored` is the metadata of the previously stored row, if any.
    pub async fn enrich(
        &self,
        order: &mut CanonicalOrder,
        stored: Option<&serde_json::Value>,
    ) -> EnrichmentOutcome {
        let mut record = stored.map(EnrichmentRecord::from_metadata).unwrap_or_default();
        let needed = needs_enrichment(order);
        let mut contributed = Vec::new();

        if let Some(payments) = self.batch.and_then(|index| index.get(&order.id)) {
            record.absorb_order_payments(payments);
            record.add_source(sources::BATCH);
            contributed.push(sources::BATCH.to_string());
        }
        record.apply_to(order);

        if !needed && contributed.is_empty() {
            return EnrichmentOutcome::NotNeeded;
        }

        if EnrichmentGaps::of(order).needs_order_detail() {
            if let Some(found) = self.order_detail(order).await {
                record.absorb(found);
                record.add_source(sources::ORDER_DETAIL);
                contributed.push(sources::ORDER_DETAIL.to_string());
                record.apply_to(order);
            }
        }

        if order.transaction_ref.is_none() {
            if let Some(payments) = self.order_transactions(&order.id).await {
                record.absorb_order_payments(&payments);
                record.add_source(sources::ORDER_TRANSACTIONS);
                contributed.push(sources::ORDER_TRANSACTIONS.to_string());
                record.apply_to(order);
            }
        }

        if order.transaction_ref.is_none() {
            let records = self.payment_query(order).await;
            if !records.is_empty() {
                record.absorb_order_payments(&OrderPayments {
                    payments: records,
                    refunds: Vec::new(),
                });
                record.add_source(sources::PAYMENT_QUERY);
                contributed.push(sources::PAYMENT_QUERY.to_string());
                record.apply_to(order);
            }
        }

        if order.transaction_ref.is_none() {
            if let Some(payment_id) = order.payment_id.clone().or_else(|| record.payment_id.clone()) {
                if let Some(payment) = self.payment_by_id(&payment_id).await {
                    record.absorb_payment(&payment);
                    record.add_source(sources::PAYMENT_BY_ID);
                    contributed.push(sources::PAYMENT_BY_ID.to_string());
                    record.apply_to(order);
                }
            }
        }

        if contributed.is_empty() {
            debug!(tenant_id = %self.tenant_id, order_id = %order.id, "Enrichment found nothing");
            EnrichmentOutcome::Miss
        } else {
            debug!(tenant_id = %self.tenant_id, order_id = %order.id, sources = ?contributed, "Order enriched");
            EnrichmentOutcome::Enriched {
                sources: contributed,
            }
        }
    }

    async fn order_detail(&self, order: &CanonicalOrder) -> Option<EnrichmentRecord> {
        let detail = match self.source.fetch_order_detail(self.tenant_id, &order.id).await {
            Ok(detail) => detail?,
            Err(err) => {
                self.step_failed(sources::ORDER_DETAIL, &order.id, &err);
                return None;
            }
        };
        let full = normalize(&detail, order.provenance);
        let record = record_from_order(&full);
        (record != EnrichmentRecord::default()).then_some(record)
    }

    async fn order_transactions(&self, order_id: &str) -> Option<OrderPayments> {
        match self.source.fetch_order_transactions(self.tenant_id, order_id).await {
            Ok(payments) => payments.filter(|p| !p.is_empty()),
            Err(err) => {
                self.step_failed(sources::ORDER_TRANSACTIONS, order_id, &err);
                None
            }
        }
    }

    async fn payment_query(&self, order: &CanonicalOrder) -> Vec<PaymentRecord> {
        match self
            .source
            .query_payments(self.tenant_id, &order.id, order.number.as_deref())
            .await
        {
            Ok(records) => records,
            Err(err) => {
                self.step_failed(sources::PAYMENT_QUERY, &order.id, &err);
                Vec::new()
            }
        }
    }

    async fn payment_by_id(&self, payment_id: &str) -> Option<PaymentRecord> {
        match self.source.fetch_payment_by_id(self.tenant_id, payment_id).await {
            Ok(raw) => raw.map(|raw| PaymentRecord::from_value(&raw)),
            Err(err) => {
                warn!(
                    tenant_id = %self.tenant_id,
                    payment_id = %payment_id,
                    step = sources::PAYMENT_BY_ID,
                    error = %err,
                    "Enrichment step failed"
                );
                None
            }
        }
    }

    fn step_failed(&self, step: &str, order_id: &str, err: &crate::error::SyncError) {
        warn!(
            tenant_id = %self.tenant_id,
            order_id = %order_id,
            step = step,
            error = %err,
            "Enrichment step failed"
        );
    }
}

/// The enrichable fields of a fully fetched order.
fn record_from_order(order: &CanonicalOrder) -> EnrichmentRecord {
    EnrichmentRecord {
        transaction_ref: order.transaction_ref.clone(),
        payment_id: order.payment_id.clone(),
        payment_method: order.payment_method.clone(),
        paid_at: order.paid_at,
        delivery_method: order.delivery_method.clone(),
        shipping_address: order.shipping_address.clone(),
        customer_name: (order.customer_name != UNKNOWN_CUSTOMER).then(|| order.customer_name.clone()),
        customer_email: order.customer_email.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSource;
    use fiskal_core::payment::ENRICHMENT_KEY;
    use fiskal_core::types::Provenance;
    use fiskal_core::PaymentStatus;
    use serde_json::json;

    fn sparse_order() -> CanonicalOrder {
        normalize(
            &json!({
                "id": "o1",
                "number": "10042",
                "paymentStatus": "PAID",
                "priceSummary": {"total": {"amount": "100.00"}},
                "currency": "BGN",
                "buyerInfo": {"email": "buyer@example.com"},
                "shippingInfo": {"title": "Courier", "shipmentDetails": {"address": {"city": "Sofia"}}}
            }),
            Provenance::Backfill,
        )
    }

    #[tokio::test]
    async fn test_complete_order_not_enriched() {
        let source = FakeSource::default();
        let mut order = normalize(
            &json!({
                "id": "o1",
                "transactionId": "pi_abc123456",
                "buyerInfo": {"firstName": "Ana", "email": "a@example.com"},
                "shippingInfo": {"title": "Courier", "shipmentDetails": {"address": {"city": "Sofia"}}}
            }),
            Provenance::Backfill,
        );
        assert!(!EnrichmentGaps::of(&order).any(), "{:?}", EnrichmentGaps::of(&order));

        let outcome = PaymentResolver::new(&source, "t1").enrich(&mut order, None).await;
        assert_eq!(outcome, EnrichmentOutcome::NotNeeded);
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_batch_index_provides_reference() {
        let source = FakeSource::default();
        let index = PaymentIndex::from_batch_response(&json!({
            "orderTransactions": [{
                "orderId": "o1",
                "payments": [
                    {"id": "internal-1", "status": "PENDING"},
                    {"id": "internal-2", "status": "APPROVED", "providerTransactionId": "pi_settled999"}
                ]
            }]
        }));
        let mut order = sparse_order();

        let outcome = PaymentResolver::new(&source, "t1")
            .with_batch(Some(&index))
            .enrich(&mut order, None)
            .await;

        assert_eq!(order.transaction_ref.as_deref(), Some("pi_settled999"));
        match outcome {
            EnrichmentOutcome::Enriched { sources } => assert_eq!(sources, vec![sources::BATCH.to_string()]),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(order.metadata[ENRICHMENT_KEY]["sources"][0], sources::BATCH);
    }

    #[tokio::test]
    async fn test_falls_through_to_payment_by_id() {
        let source = FakeSource::default();
        source.fail_transactions("t1");
        source.add_payment_query_result(json!({"id": "pay-int-7", "orderId": "o1", "status": "PENDING"}));
        source.add_payment("pay-int-7", json!({"id": "pay-int-7", "chargeId": "ch_charge777", "status": "APPROVED"}));
        let mut order = sparse_order();

        let outcome = PaymentResolver::new(&source, "t1").enrich(&mut order, None).await;

        assert_eq!(order.transaction_ref.as_deref(), Some("ch_charge777"));
        match outcome {
            EnrichmentOutcome::Enriched { sources } => {
                assert!(sources.contains(&sources::PAYMENT_BY_ID.to_string()));
                assert!(!sources.contains(&sources::ORDER_TRANSACTIONS.to_string()));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stored_metadata_absorbed_without_calls() {
        let source = FakeSource::default();
        let stored = json!({
            ENRICHMENT_KEY: {
                "transaction_ref": "pi_known123456",
                "delivery_method": "Courier",
                "customer_name": "Ana Petrova",
                "sources": ["order_transactions"]
            }
        });
        let mut order = sparse_order();
        order.shipping_address = Some(json!({"city": "Sofia"}));

        PaymentResolver::new(&source, "t1").enrich(&mut order, Some(&stored)).await;

        assert_eq!(order.transaction_ref.as_deref(), Some("pi_known123456"));
        assert_eq!(order.customer_name, "Ana Petrova");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn test_miss_is_not_an_error() {
        let source = FakeSource::default();
        let mut order = sparse_order();
        let outcome = PaymentResolver::new(&source, "t1").enrich(&mut order, None).await;
        assert_eq!(outcome, EnrichmentOutcome::Miss);
        assert!(order.transaction_ref.is_none());
    }

    #[tokio::test]
    async fn test_refunds_upgrade_payment_status() {
        let source = FakeSource::default();
        let index = PaymentIndex::from_batch_response(&json!({
            "orderTransactions": [{
                "orderId": "o1",
                "payments": [{"id": "p", "status": "APPROVED", "providerTransactionId": "pi_abc123456"}],
                "refunds": [{"id": "r1", "transactions": [{"amount": {"amount": "100.00"}}]}]
            }]
        }));
        let mut order = sparse_order();

        PaymentResolver::new(&source, "t1")
            .with_batch(Some(&index))
            .enrich(&mut order, None)
            .await;

        assert_eq!(order.refunded_cents, Some(10000));
        assert_eq!(order.payment_status, PaymentStatus::FullyRefunded);
        assert_eq!(order.last_refund_id.as_deref(), Some("r1"));
    }
}
