//! Webhook ingress: single order-changed events routed through the same
//! pipeline as a sync page, tagged with webhook provenance.

use serde_json::Value;
use tracing::{info, info_span, Instrument};

use fiskal_core::normalize::normalize;
use fiskal_core::types::Provenance;
use fiskal_core::FiscalSettings;

use crate::error::{SyncError, SyncResult};
use crate::orchestrator::{OrderOutcome, SyncOrchestrator};

/// Finds the order inside an event envelope.
///
/// Accepts `{data: {order}}`, `{entity}`, `{order}` or a bare order object.
pub fn unwrap_order_payload(payload: &Value) -> Option<&Value> {
    let candidates = [
        payload.pointer("/data/order"),
        payload.get("entity"),
        payload.get("order"),
        Some(payload),
    ];
    candidates
        .into_iter()
        .flatten()
        .find(|v| v.as_object().is_some_and(|o| !o.is_empty()))
}

impl SyncOrchestrator {
    /// Normalizes, enriches, stores and reconciles one pushed order.
    pub async fn ingest_webhook(
        &self,
        tenant_id: &str,
        settings: &FiscalSettings,
        payload: &Value,
    ) -> SyncResult<OrderOutcome> {
        let raw = unwrap_order_payload(payload)
            .ok_or_else(|| SyncError::InvalidRequest("webhook payload carries no order".to_string()))?;
        let order = normalize(raw, Provenance::Webhook);

        let span = info_span!("webhook", tenant_id = %tenant_id, order_id = %order.id);
        async {
            let outcome = self.process_order(tenant_id, settings, order, None).await?;
            info!(
                sale = ?outcome.reconciliation.sale.receipt().map(|r| r.receipt_id),
                refund = outcome.reconciliation.refund.is_some(),
                "Webhook order ingested"
            );
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuance::IssueOutcome;
    use crate::testing::FakeSource;
    use chrono::NaiveDate;
    use fiskal_core::ReceiptKind;
    use fiskal_db::{Database, DbConfig};
    use serde_json::json;
    use std::sync::Arc;

    fn settings() -> FiscalSettings {
        FiscalSettings {
            fiscal_store_id: Some("RF0001".into()),
            receipts_start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            cod_receipts_enabled: false,
        }
    }

    fn order(status: &str) -> Value {
        json!({
            "id": "o1",
            "paymentStatus": status,
            "total": 100,
            "currency": "BGN",
            "createdDate": "2024-01-01",
            "transactionId": "pi_abc123",
            "buyerInfo": {"firstName": "Ana", "email": "ana@example.com"},
            "shippingInfo": {"title": "Courier", "shipmentDetails": {"address": {"city": "Sofia"}}}
        })
    }

    #[test]
    fn test_envelopes() {
        let bare = order("PAID");
        assert_eq!(unwrap_order_payload(&bare), Some(&bare));
        assert_eq!(
            unwrap_order_payload(&json!({"data": {"order": bare.clone()}})),
            Some(&bare)
        );
        assert_eq!(unwrap_order_payload(&json!({"entity": bare.clone()})), Some(&bare));
        assert_eq!(unwrap_order_payload(&json!({"order": bare.clone()})), Some(&bare));
        assert_eq!(unwrap_order_payload(&json!({})), None);
        assert_eq!(unwrap_order_payload(&json!("o1")), None);
    }

    #[tokio::test]
    async fn test_webhook_sale_and_refund() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let sync = SyncOrchestrator::new(db.clone(), Arc::new(FakeSource::default()));

        let first = sync
            .ingest_webhook("t1", &settings(), &json!({"data": {"order": order("PAID")}}))
            .await
            .unwrap();
        assert!(first.reconciliation.sale.is_issued());

        let stored = db.orders().get("t1", "o1").await.unwrap().unwrap();
        assert_eq!(stored.order.provenance, Provenance::Webhook);

        let second = sync
            .ingest_webhook("t1", &settings(), &json!({"entity": order("FULLY_REFUNDED")}))
            .await
            .unwrap();
        let refund = match second.reconciliation.refund {
            Some(IssueOutcome::Issued(r)) => r,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(refund.receipt_id, 2);
        assert_eq!(refund.kind, ReceiptKind::Refund);
        assert_eq!(refund.reference_receipt_id, Some(1));
    }

    #[tokio::test]
    async fn test_webhook_without_order_is_rejected() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let sync = SyncOrchestrator::new(db, Arc::new(FakeSource::default()));

        let err = sync
            .ingest_webhook("t1", &settings(), &json!({"data": {}}))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidRequest(_)));
    }
}
