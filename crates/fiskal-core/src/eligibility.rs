//! # Receipt Eligibility
//!
//! Decides, from a canonical order and the tenant's fiscal settings, whether
//! a sale receipt or a refund receipt must exist.
//!
//! ## Per-Order State Machine
//! ```text
//!   ┌──────────┐   paid + eligible    ┌────────────────┐
//!   │ NOT_PAID │ ───────────────────► │ sale issued    │
//!   └──────────┘                      └───────┬────────┘
//!        │ any other combination              │ refunded / cancelled
//!        ▼                                    ▼
//!   skip (reason counted)             ┌────────────────┐
//!                                     │ refund issued  │ (one per refund step)
//!                                     └────────────────┘
//! ```
//!
//! ## Sale Checks (in order, first failure wins)
//! 1. payment status is `PAID`
//! 2. lifecycle is not cancelled
//! 3. total is present and > 0
//! 4. fiscal store id configured
//! 5. paid date (or created date) on/after the receipts start date
//! 6. not COD, or COD receipts enabled
//! 7. transaction reference present (waived for COD orders, which have none)

use std::fmt;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::types::{CanonicalOrder, FiscalSettings, LifecycleStatus, PaymentStatus};
use crate::FULL_REFUND_KEY;

// =============================================================================
// Skip Reasons
// =============================================================================

/// Why no receipt was issued. Counted per run for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotPaid,
    Cancelled,
    MissingTotal,
    ZeroTotal,
    MissingFiscalStoreId,
    MissingPaidDate,
    BeforeStartDate,
    CodReceiptsDisabled,
    MissingTransactionRef,
    /// Partially refunded upstream but the refunded amount is unknown.
    UnknownRefundAmount,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotPaid => "not_paid",
            SkipReason::Cancelled => "cancelled",
            SkipReason::MissingTotal => "missing_total",
            SkipReason::ZeroTotal => "zero_total",
            SkipReason::MissingFiscalStoreId => "missing_fiscal_store_id",
            SkipReason::MissingPaidDate => "missing_paid_date",
            SkipReason::BeforeStartDate => "before_start_date",
            SkipReason::CodReceiptsDisabled => "cod_receipts_disabled",
            SkipReason::MissingTransactionRef => "missing_transaction_ref",
            SkipReason::UnknownRefundAmount => "unknown_refund_amount",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Sale
// =============================================================================

/// Outcome of the sale-receipt check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaleDecision {
    Issue {
        amount_cents: i64,
        fiscal_store_id: String,
    },
    Skip(SkipReason),
}

/// Evaluates whether `order` must get a sale receipt.
pub fn evaluate_sale(order: &CanonicalOrder, settings: &FiscalSettings) -> SaleDecision {
    use SaleDecision::Skip;

    if order.payment_status != PaymentStatus::Paid {
        return Skip(SkipReason::NotPaid);
    }
    if order.lifecycle_status == LifecycleStatus::Cancelled {
        return Skip(SkipReason::Cancelled);
    }
    let amount_cents = match order.total_cents {
        None => return Skip(SkipReason::MissingTotal),
        Some(total) if total <= 0 => return Skip(SkipReason::ZeroTotal),
        Some(total) => total,
    };
    let Some(store_id) = settings.store_id() else {
        return Skip(SkipReason::MissingFiscalStoreId);
    };
    if let Some(start) = settings.receipts_start_date {
        match order.effective_paid_at() {
            None => return Skip(SkipReason::MissingPaidDate),
            Some(paid_at) if paid_at.date_naive() < start => {
                return Skip(SkipReason::BeforeStartDate)
            }
            Some(_) => {}
        }
    }
    if order.is_cod && !settings.cod_receipts_enabled {
        return Skip(SkipReason::CodReceiptsDisabled);
    }
    if order.transaction_ref.is_none() && !order.is_cod {
        return Skip(SkipReason::MissingTransactionRef);
    }

    SaleDecision::Issue {
        amount_cents,
        fiscal_store_id: store_id.to_string(),
    }
}

// =============================================================================
// Refund
// =============================================================================

/// What is already on record for the order's sale receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundContext {
    pub sale_receipt_id: i64,
    pub sale_amount_cents: i64,
    /// Sum of refund receipts already issued against the sale.
    pub already_refunded_cents: i64,
}

impl RefundContext {
    pub fn remaining_cents(&self) -> i64 {
        (self.sale_amount_cents - self.already_refunded_cents).max(0)
    }
}

/// Outcome of the refund-receipt check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundDecision {
    /// Nothing to refund (not refunded upstream, or already fully covered).
    None,
    Issue {
        /// `None` means a full refund of the untouched sale amount.
        amount_cents: Option<i64>,
        dedupe_key: String,
    },
    Skip(SkipReason),
}

/// Evaluates whether an order that already has a sale receipt needs a refund.
///
/// ## Amounts
/// - Cancelled or fully refunded: the remaining amount. With no earlier
///   refunds this is a full refund (`amount_cents = None`).
/// - Partially refunded: upstream's cumulative refunded amount minus what
///   refund receipts already cover.
///
/// ## Idempotency Keys
/// Full refunds use `"full"`. Partial refunds use the newest upstream refund
/// id, or `partial-<cumulative cents>` when upstream gave none. Re-evaluating
/// the same upstream state yields the same key, or `None` once covered.
pub fn evaluate_refund(order: &CanonicalOrder, context: &RefundContext) -> RefundDecision {
    let remaining = context.remaining_cents();
    if remaining == 0 {
        return RefundDecision::None;
    }

    let full = || RefundDecision::Issue {
        amount_cents: (context.already_refunded_cents > 0).then_some(remaining),
        dedupe_key: FULL_REFUND_KEY.to_string(),
    };

    if order.lifecycle_status == LifecycleStatus::Cancelled
        || order.payment_status == PaymentStatus::FullyRefunded
    {
        return full();
    }

    if order.payment_status != PaymentStatus::PartiallyRefunded {
        return RefundDecision::None;
    }

    let Some(cumulative) = order.refunded_cents.filter(|c| *c > 0) else {
        return RefundDecision::Skip(SkipReason::UnknownRefundAmount);
    };
    if cumulative >= context.sale_amount_cents {
        return full();
    }

    let delta = cumulative - context.already_refunded_cents;
    if delta <= 0 {
        return RefundDecision::None;
    }

    RefundDecision::Issue {
        amount_cents: Some(delta),
        dedupe_key: order
            .last_refund_id
            .clone()
            .unwrap_or_else(|| format!("partial-{cumulative}")),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use crate::types::Provenance;
    use chrono::NaiveDate;
    use serde_json::json;

    fn settings() -> FiscalSettings {
        FiscalSettings {
            fiscal_store_id: Some("RF0001".to_string()),
            receipts_start_date: NaiveDate::from_ymd_opt(2024, 1, 1),
            cod_receipts_enabled: false,
        }
    }

    fn paid_order() -> CanonicalOrder {
        normalize(
            &json!({
                "id": "o1",
                "paymentStatus": "PAID",
                "total": 100,
                "currency": "BGN",
                "createdDate": "2024-01-01",
                "transactionId": "pi_abc123"
            }),
            Provenance::Backfill,
        )
    }

    #[test]
    fn test_paid_order_is_issued() {
        assert_eq!(
            evaluate_sale(&paid_order(), &settings()),
            SaleDecision::Issue {
                amount_cents: 10000,
                fiscal_store_id: "RF0001".to_string()
            }
        );
    }

    #[test]
    fn test_zero_total_never_issued() {
        let mut order = paid_order();
        order.total_cents = Some(0);
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::ZeroTotal)
        );
    }

    #[test]
    fn test_cod_disabled_never_issued() {
        let mut order = paid_order();
        order.is_cod = true;
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::CodReceiptsDisabled)
        );

        let enabled = FiscalSettings {
            cod_receipts_enabled: true,
            ..settings()
        };
        order.transaction_ref = None;
        assert!(matches!(evaluate_sale(&order, &enabled), SaleDecision::Issue { .. }));
    }

    #[test]
    fn test_before_start_date_never_issued() {
        let mut order = paid_order();
        order.created_at = Some(chrono::Utc::now() - chrono::Duration::days(365 * 10));
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::BeforeStartDate)
        );

        order.created_at = None;
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::MissingPaidDate)
        );
    }

    #[test]
    fn test_check_order() {
        let mut order = paid_order();
        order.payment_status = PaymentStatus::Pending;
        order.total_cents = Some(0);
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::NotPaid)
        );

        let mut order = paid_order();
        order.transaction_ref = None;
        assert_eq!(
            evaluate_sale(&order, &settings()),
            SaleDecision::Skip(SkipReason::MissingTransactionRef)
        );
        assert_eq!(
            evaluate_sale(&order, &FiscalSettings::default()),
            SaleDecision::Skip(SkipReason::MissingFiscalStoreId)
        );
    }

    fn context(already: i64) -> RefundContext {
        RefundContext {
            sale_receipt_id: 1,
            sale_amount_cents: 10000,
            already_refunded_cents: already,
        }
    }

    #[test]
    fn test_full_refund() {
        let mut order = paid_order();
        order.payment_status = PaymentStatus::FullyRefunded;
        assert_eq!(
            evaluate_refund(&order, &context(0)),
            RefundDecision::Issue {
                amount_cents: None,
                dedupe_key: "full".to_string()
            }
        );
        assert_eq!(evaluate_refund(&order, &context(10000)), RefundDecision::None);
    }

    #[test]
    fn test_cancel_after_partial_refunds_remainder() {
        let mut order = paid_order();
        order.lifecycle_status = LifecycleStatus::Cancelled;
        assert_eq!(
            evaluate_refund(&order, &context(3000)),
            RefundDecision::Issue {
                amount_cents: Some(7000),
                dedupe_key: "full".to_string()
            }
        );
    }

    #[test]
    fn test_partial_refund_steps() {
        let mut order = paid_order();
        order.payment_status = PaymentStatus::PartiallyRefunded;
        assert_eq!(
            evaluate_refund(&order, &context(0)),
            RefundDecision::Skip(SkipReason::UnknownRefundAmount)
        );

        order.refunded_cents = Some(3000);
        assert_eq!(
            evaluate_refund(&order, &context(0)),
            RefundDecision::Issue {
                amount_cents: Some(3000),
                dedupe_key: "partial-3000".to_string()
            }
        );
        assert_eq!(evaluate_refund(&order, &context(3000)), RefundDecision::None);

        order.refunded_cents = Some(5000);
        order.last_refund_id = Some("r2".to_string());
        assert_eq!(
            evaluate_refund(&order, &context(3000)),
            RefundDecision::Issue {
                amount_cents: Some(2000),
                dedupe_key: "r2".to_string()
            }
        );
    }

    #[test]
    fn test_paid_order_needs_no_refund() {
        assert_eq!(evaluate_refund(&paid_order(), &context(0)), RefundDecision::None);
    }
}
