//! # Domain Types
//!
//! Core domain types shared by the database and sync layers.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ CanonicalOrder  │   │     Receipt     │   │   SyncState     │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (upstream)  │   │  receipt_id     │   │  next_offset    │       │
//! │  │  payment_status │   │  (fiscal no.)   │   │  window_start   │       │
//! │  │  total_cents    │   │  kind           │   │  status         │       │
//! │  │  raw_payload    │   │  payload (frozen│   │  last_error     │       │
//! │  │  metadata       │   │  snapshot)      │   │                 │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ PaymentStatus   │   │  ReceiptKind    │   │ FiscalSettings  │       │
//! │  │  NotPaid        │   │  Sale           │   │  store id       │       │
//! │  │  Paid  ...      │   │  Refund         │   │  start date     │       │
//! │  └─────────────────┘   └─────────────────┘   │  COD toggle     │       │
//! │                                              └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Identity
//! - Orders are keyed by `(tenant_id, id)` where `id` is the upstream string id.
//! - Receipts are keyed by `(tenant_id, receipt_id)`; `receipt_id` is the
//!   sequential fiscal number.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use crate::money::Money;

// =============================================================================
// Provenance
// =============================================================================

/// Where an order record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Pushed by an order-changed event.
    Webhook,
    /// Pulled by a paged sync run.
    Backfill,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Webhook => "webhook",
            Provenance::Backfill => "backfill",
        }
    }
}

// =============================================================================
// Lifecycle Status
// =============================================================================

/// Whether the order is still live upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleStatus {
    #[default]
    Active,
    Cancelled,
}

// =============================================================================
// Payment Status
// =============================================================================

/// Payment state of an order as reported upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    NotPaid,
    Pending,
    PartiallyPaid,
    Paid,
    PartiallyRefunded,
    FullyRefunded,
    #[default]
    Unknown,
}

impl PaymentStatus {
    /// Tolerant parse of the upstream enum spellings.
    ///
    /// ```text
    /// "PAID", "paid"                         → Paid
    /// "NOT_PAID", "UNPAID", "not-paid"       → NotPaid
    /// "PENDING", "PENDING_MERCHANT"          → Pending
    /// "REFUNDED", "FULLY_REFUNDED"           → FullyRefunded
    /// anything else                          → Unknown
    /// ```
    pub fn parse(raw: &str) -> Self {
        let key = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match key.as_str() {
            "PAID" | "FULLY_PAID" | "COMPLETED" | "APPROVED" => PaymentStatus::Paid,
            "NOT_PAID" | "UNPAID" | "NOT_PAID_YET" => PaymentStatus::NotPaid,
            "PARTIALLY_PAID" => PaymentStatus::PartiallyPaid,
            "PARTIALLY_REFUNDED" => PaymentStatus::PartiallyRefunded,
            "FULLY_REFUNDED" | "REFUNDED" => PaymentStatus::FullyRefunded,
            k if k.starts_with("PENDING") || k == "AWAITING_PAYMENT" => PaymentStatus::Pending,
            _ => PaymentStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::NotPaid => "NOT_PAID",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::PartiallyPaid => "PARTIALLY_PAID",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
            PaymentStatus::FullyRefunded => "FULLY_REFUNDED",
            PaymentStatus::Unknown => "UNKNOWN",
        }
    }

    /// True for the two refund states.
    pub fn is_refunded(&self) -> bool {
        matches!(
            self,
            PaymentStatus::PartiallyRefunded | PaymentStatus::FullyRefunded
        )
    }
}

// =============================================================================
// Canonical Order
// =============================================================================

/// One upstream order, normalized.
///
/// Produced by [`crate::normalize::normalize`]. Every derived field is
/// recomputed from `raw_payload` on each sighting; `metadata` is the only
/// field that accumulates across sightings (enrichment results).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CanonicalOrder {
    /// Upstream order id. Empty when the payload carried none.
    pub id: String,

    /// Human-facing order number (e.g. "10042").
    pub number: Option<String>,

    pub lifecycle_status: LifecycleStatus,
    pub payment_status: PaymentStatus,

    #[ts(as = "Option<String>")]
    pub created_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub updated_at: Option<DateTime<Utc>>,
    #[ts(as = "Option<String>")]
    pub paid_at: Option<DateTime<Utc>>,

    /// ISO currency code, e.g. "BGN".
    pub currency: Option<String>,

    pub subtotal_cents: Option<i64>,
    pub tax_cents: Option<i64>,
    pub shipping_cents: Option<i64>,
    pub discount_cents: Option<i64>,
    pub total_cents: Option<i64>,

    /// Amount already refunded upstream, when reported.
    pub refunded_cents: Option<i64>,

    /// Most recent upstream refund id, when reported.
    pub last_refund_id: Option<String>,

    /// Resolved buyer name, or [`crate::UNKNOWN_CUSTOMER`].
    pub customer_name: String,
    pub customer_email: Option<String>,

    pub delivery_method: Option<String>,
    #[ts(type = "unknown")]
    pub shipping_address: Option<Value>,

    /// Payment gateway reference (Stripe-style ids win over internal ids).
    pub transaction_ref: Option<String>,
    /// Internal upstream payment id.
    pub payment_id: Option<String>,
    pub payment_method: Option<String>,

    /// Cash-on-delivery, inferred heuristically.
    pub is_cod: bool,

    pub provenance: Provenance,

    /// The payload exactly as received.
    #[ts(type = "unknown")]
    pub raw_payload: Value,

    /// Enrichment results; always a JSON object.
    #[ts(type = "Record<string, unknown>")]
    pub metadata: Value,
}

impl CanonicalOrder {
    /// Order total as Money.
    pub fn total(&self) -> Option<Money> {
        self.total_cents.map(Money::from_cents)
    }

    /// Timestamp used for the receipts-start-date check.
    ///
    /// Orders whose paid date was never reported fall back to creation date.
    pub fn effective_paid_at(&self) -> Option<DateTime<Utc>> {
        self.paid_at.or(self.created_at)
    }

    /// True when the customer identity could not be resolved.
    pub fn customer_unknown(&self) -> bool {
        self.customer_name == crate::UNKNOWN_CUSTOMER && self.customer_email.is_none()
    }

    /// Denormalized copy of the order frozen into a receipt at issuance.
    ///
    /// Line items are copied from the raw payload as-is.
    pub fn receipt_snapshot(&self, fiscal_store_id: &str) -> Value {
        let line_items = crate::json_path::first_at(
            &self.raw_payload,
            &[&["lineItems"], &["line_items"], &["items"]],
        )
        .cloned()
        .unwrap_or_else(|| Value::Array(Vec::new()));

        serde_json::json!({
            "fiscal_store_id": fiscal_store_id,
            "order_id": self.id,
            "order_number": self.number,
            "currency": self.currency,
            "subtotal_cents": self.subtotal_cents,
            "tax_cents": self.tax_cents,
            "shipping_cents": self.shipping_cents,
            "discount_cents": self.discount_cents,
            "total_cents": self.total_cents,
            "customer_name": self.customer_name,
            "customer_email": self.customer_email,
            "delivery_method": self.delivery_method,
            "transaction_ref": self.transaction_ref,
            "payment_method": self.payment_method,
            "is_cod": self.is_cod,
            "paid_at": self.paid_at,
            "created_at": self.created_at,
            "line_items": line_items,
        })
    }
}

// =============================================================================
// Stored Order
// =============================================================================

/// A canonical order as persisted for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Order {
    pub tenant_id: String,

    #[serde(flatten)]
    pub order: CanonicalOrder,

    /// Local bookkeeping: when this row was last written.
    #[ts(as = "String")]
    pub synced_at: DateTime<Utc>,
}

// =============================================================================
// Receipts
// =============================================================================

/// Fiscal document type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum ReceiptKind {
    Sale,
    Refund,
}

impl ReceiptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Sale => "sale",
            ReceiptKind::Refund => "refund",
        }
    }
}

/// Status of an issued receipt.
///
/// Only sale receipts move past `Issued`, as refunds are issued against them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    #[default]
    Issued,
    PartiallyRefunded,
    Refunded,
}

/// A fiscal receipt.
///
/// `payload` is a snapshot of the order at issuance and is never rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Receipt {
    pub tenant_id: String,

    /// Sequential fiscal number, gap-free per tenant after renumbering.
    pub receipt_id: i64,

    pub order_id: String,
    pub kind: ReceiptKind,

    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,

    pub status: ReceiptStatus,

    /// Amount this document accounts for (sale total or refunded amount).
    pub amount_cents: i64,

    /// Frozen order snapshot.
    #[ts(type = "Record<string, unknown>")]
    pub payload: Value,

    /// Refunds only: the sale receipt being reversed.
    pub reference_receipt_id: Option<i64>,

    /// Refunds only: requested amount, `None` meaning full refund.
    pub refund_amount_cents: Option<i64>,

    /// Idempotency key within `(order_id, kind)`.
    pub dedupe_key: String,
}

// =============================================================================
// Sync State
// =============================================================================

/// Progress of the per-tenant sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, TS)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "lowercase"))]
#[ts(export)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// An invocation is (or was, if it crashed) in flight.
    Running,
    /// Stopped at the page bound or on a page failure; resumable.
    Partial,
    /// Reached the end of upstream data for the window.
    #[default]
    Done,
    /// Failed outside the page loop (storage, configuration).
    Error,
}

/// Resumption point for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncState {
    pub tenant_id: String,
    pub status: SyncStatus,

    /// Start date of the window the offset belongs to.
    #[ts(as = "Option<String>")]
    pub window_start: Option<DateTime<Utc>>,

    /// Offset of the next page to fetch. This is the load-bearing cursor.
    pub next_offset: i64,

    /// Best-effort upstream cursor, recorded for diagnostics only.
    pub cursor: Option<String>,

    pub last_error: Option<String>,

    #[ts(as = "String")]
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Fiscal Settings
// =============================================================================

/// Company fiscal settings consumed (never mutated) by issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalSettings {
    /// Store identifier registered with the revenue agency.
    #[serde(default)]
    pub fiscal_store_id: Option<String>,

    /// Orders paid before this date never get a receipt.
    #[serde(default)]
    #[ts(as = "Option<String>")]
    pub receipts_start_date: Option<NaiveDate>,

    /// Whether cash-on-delivery orders get receipts.
    #[serde(default)]
    pub cod_receipts_enabled: bool,
}

impl FiscalSettings {
    /// Store id with surrounding whitespace removed, `None` if blank.
    pub fn store_id(&self) -> Option<&str> {
        self.fiscal_store_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
