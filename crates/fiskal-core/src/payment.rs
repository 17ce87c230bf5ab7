//! # Payment Metadata
//!
//! Pure helpers for everything the enrichment resolver learns about payments:
//! transaction references, payment and refund records, the per-page batch
//! index, and the cash-on-delivery heuristic.
//!
//! ## Reference Precedence
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  extract_transaction_ref(payload)                                       │
//! │                                                                         │
//! │  1. Provider id anywhere in the payload (recursive)                     │
//! │       pi_3Nx..., ch_1Ab..., pay_9Zq...   ← legally meaningful           │
//! │  2. Named gateway keys, in order                                        │
//! │       providerTransactionId, gatewayTransactionId, ...                  │
//! │  3. Nothing. The internal upstream `id` is NEVER a transaction ref;     │
//! │     see extract_payment_id for that.                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::json_path::{datetime_at, first_at, lookup, text_at, JsonPath};
use crate::money::Money;
use crate::types::{CanonicalOrder, PaymentStatus};

// =============================================================================
// Transaction References
// =============================================================================

/// Prefixes of payment-gateway ids that win over every other reference.
pub const PROVIDER_PREFIXES: [&str; 3] = ["pi_", "ch_", "pay_"];

/// Minimum alphanumeric characters after a provider prefix.
const PROVIDER_ID_MIN_BODY: usize = 6;

/// Gateway reference keys, most specific first.
pub const TRANSACTION_REF_KEYS: [&str; 6] = [
    "providerTransactionId",
    "gatewayTransactionId",
    "paymentGatewayTransactionId",
    "externalTransactionId",
    "transactionId",
    "chargeId",
];

/// True for strings shaped like `pi_abc123`.
pub fn is_provider_ref(candidate: &str) -> bool {
    PROVIDER_PREFIXES.iter().any(|prefix| {
        candidate.strip_prefix(prefix).is_some_and(|body| {
            body.len() >= PROVIDER_ID_MIN_BODY && body.chars().all(|c| c.is_ascii_alphanumeric())
        })
    })
}

/// Depth-first search for the first provider-shaped string value.
pub fn find_provider_ref(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            is_provider_ref(trimmed).then(|| trimmed.to_string())
        }
        Value::Array(items) => items.iter().find_map(find_provider_ref),
        Value::Object(map) => map.values().find_map(find_provider_ref),
        _ => None,
    }
}

/// Depth-first search for a non-empty scalar under `key`.
fn find_key(value: &Value, key: &str) -> Option<String> {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(key).and_then(crate::json_path::as_text) {
                return Some(found);
            }
            map.values().find_map(|v| find_key(v, key))
        }
        Value::Array(items) => items.iter().find_map(|v| find_key(v, key)),
        _ => None,
    }
}

/// Resolves the gateway transaction reference from any payload.
///
/// ```rust
/// use fiskal_core::payment::extract_transaction_ref;
/// use serde_json::json;
///
/// let payload = json!({"id": "8c2f-internal", "details": {"ref": "pi_abc123"}});
/// assert_eq!(extract_transaction_ref(&payload).as_deref(), Some("pi_abc123"));
/// ```
pub fn extract_transaction_ref(value: &Value) -> Option<String> {
    find_provider_ref(value).or_else(|| {
        TRANSACTION_REF_KEYS
            .iter()
            .find_map(|key| find_key(value, key))
    })
}

const PAYMENT_ID_PATHS: &[JsonPath] = &[
    &["paymentId"],
    &["payment", "id"],
    &["payment", "_id"],
    &["id"],
    &["_id"],
];

/// Internal upstream payment id of a payment-shaped payload.
pub fn extract_payment_id(value: &Value) -> Option<String> {
    text_at(value, PAYMENT_ID_PATHS)
}

// =============================================================================
// Payment & Refund Records
// =============================================================================

/// Payment statuses that count as settled when choosing among records.
pub const SETTLED_PAYMENT_STATUSES: [&str; 3] = ["APPROVED", "COMPLETED", "REFUNDED"];

const AMOUNT_PATHS: &[JsonPath] = &[&["amount"], &["total"], &["value"], &["price"]];
const STATUS_PATHS: &[JsonPath] = &[
    &["status"],
    &["regularPaymentDetails", "status"],
    &["giftcardPaymentDetails", "status"],
    &["paymentStatus"],
    &["refundStatus"],
];
const METHOD_PATHS: &[JsonPath] = &[
    &["paymentMethod"],
    &["regularPaymentDetails", "paymentMethod"],
    &["method"],
    &["paymentMethodType"],
    &["provider"],
    &["regularPaymentDetails", "paymentProvider"],
];
const CREATED_PATHS: &[JsonPath] = &[
    &["createdDate"],
    &["_createdDate"],
    &["createdAt"],
    &["dateCreated"],
];
const ORDER_ID_PATHS: &[JsonPath] = &[&["orderId"], &["order", "id"], &["wixOrderId"]];
const ORDER_NUMBER_PATHS: &[JsonPath] = &[&["orderNumber"], &["order", "number"]];

/// Extracts minor units from a scalar or from one level of `{amount|value}`.
pub fn money_of(value: &Value) -> Option<Money> {
    match value {
        Value::Object(map) => ["amount", "value", "convertedAmount"]
            .iter()
            .filter_map(|key| map.get(*key))
            .find_map(|inner| match inner {
                Value::Object(nested) => ["amount", "value"]
                    .iter()
                    .filter_map(|key| nested.get(*key))
                    .find_map(Money::parse_value),
                other => Money::parse_value(other),
            }),
        other => Money::parse_value(other),
    }
}

/// One payment against an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    /// Internal upstream payment id.
    pub id: Option<String>,
    pub order_id: Option<String>,
    pub order_number: Option<String>,
    /// Upper-cased upstream status, e.g. `APPROVED`.
    pub status: Option<String>,
    pub amount_cents: Option<i64>,
    pub transaction_ref: Option<String>,
    pub method: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Raw record, kept for payment-by-id follow-ups.
    pub raw: Value,
}

impl PaymentRecord {
    pub fn from_value(value: &Value) -> Self {
        PaymentRecord {
            id: extract_payment_id(value),
            order_id: text_at(value, ORDER_ID_PATHS),
            order_number: text_at(value, ORDER_NUMBER_PATHS),
            status: text_at(value, STATUS_PATHS).map(|s| s.to_ascii_uppercase()),
            amount_cents: first_at(value, AMOUNT_PATHS)
                .and_then(money_of)
                .map(|m| m.cents()),
            transaction_ref: extract_transaction_ref(value),
            method: text_at(value, METHOD_PATHS),
            created_at: datetime_at(value, CREATED_PATHS),
            raw: value.clone(),
        }
    }

    /// True when the status is one of [`SETTLED_PAYMENT_STATUSES`].
    pub fn is_settled(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|s| SETTLED_PAYMENT_STATUSES.contains(&s))
    }

    /// Whether this record belongs to the given order id or number.
    pub fn matches_order(&self, order_id: &str, order_number: Option<&str>) -> bool {
        let by_id = self.order_id.as_deref() == Some(order_id);
        let by_number = order_number.is_some() && self.order_number.as_deref() == order_number;
        by_id || by_number
    }
}

/// One refund issued upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Option<String>,
    pub amount_cents: Option<i64>,
    pub status: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl RefundRecord {
    /// Parses a refund. Amount is the sum of its per-payment transactions
    /// when present, otherwise the refund-level amount.
    pub fn from_value(value: &Value) -> Self {
        let from_transactions = lookup(value, &["transactions"])
            .and_then(Value::as_array)
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| first_at(tx, AMOUNT_PATHS).and_then(money_of))
                    .fold(Money::zero(), |acc, m| acc + m)
            })
            .filter(|m| !m.is_zero());

        let amount = from_transactions.or_else(|| {
            first_at(
                value,
                &[&["summary", "refundAmount"], &["amount"], &["refundAmount"], &["total"]],
            )
            .and_then(money_of)
        });

        RefundRecord {
            id: text_at(value, &[&["id"], &["_id"], &["refundId"]]),
            amount_cents: amount.map(|m| m.cents()),
            status: text_at(
                value,
                &[&["status"], &["summary", "status"], &["refundStatus"]],
            )
            .map(|s| s.to_ascii_uppercase()),
            created_at: datetime_at(value, CREATED_PATHS),
        }
    }

    /// Failed refunds do not count towards the refunded amount.
    pub fn counts(&self) -> bool {
        !matches!(
            self.status.as_deref(),
            Some("FAILED") | Some("REJECTED") | Some("CANCELED") | Some("CANCELLED")
        )
    }
}

/// Payments and refunds known for one order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderPayments {
    pub payments: Vec<PaymentRecord>,
    pub refunds: Vec<RefundRecord>,
}

impl OrderPayments {
    /// Parses an order-transactions shaped object:
    /// `{orderId, payments: [...], refunds: [...]}`.
    pub fn from_value(value: &Value) -> Self {
        let order_id = text_at(value, ORDER_ID_PATHS);
        let mut payments = records_at(value, &["payments"], PaymentRecord::from_value);
        for payment in &mut payments {
            if payment.order_id.is_none() {
                payment.order_id = order_id.clone();
            }
        }
        OrderPayments {
            payments,
            refunds: records_at(value, &["refunds"], RefundRecord::from_value),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.payments.is_empty() && self.refunds.is_empty()
    }

    /// See [`select_preferred_payment`].
    pub fn preferred(&self) -> Option<&PaymentRecord> {
        select_preferred_payment(&self.payments)
    }

    /// Sum of counted refunds and the most recent refund id.
    pub fn refund_summary(&self) -> (Option<i64>, Option<String>) {
        summarize_refunds(&self.refunds)
    }
}

fn records_at<T>(value: &Value, path: &[&str], parse: fn(&Value) -> T) -> Vec<T> {
    lookup(value, path)
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse).collect())
        .unwrap_or_default()
}

/// Parses a payment list out of any of the response shapes upstream uses.
///
/// ```text
/// [ {...}, {...} ]                        bare array
/// {"payments": [...]}                     payment query
/// {"orderTransactions": {"payments": []}} per-order transactions
/// {"transactions": [...]} / {"items": []} older shapes
/// {"payment": {...}} / {...with id}       single record
/// ```
pub fn parse_payment_records(value: &Value) -> Vec<PaymentRecord> {
    if let Value::Array(items) = value {
        return items.iter().map(PaymentRecord::from_value).collect();
    }

    const LIST_PATHS: &[JsonPath] = &[
        &["payments"],
        &["orderTransactions", "payments"],
        &["transactions"],
        &["items"],
        &["results"],
    ];
    for path in LIST_PATHS {
        if let Some(Value::Array(items)) = lookup(value, path) {
            return items.iter().map(PaymentRecord::from_value).collect();
        }
    }

    match lookup(value, &["payment"]) {
        Some(single @ Value::Object(_)) => vec![PaymentRecord::from_value(single)],
        _ if value.as_object().is_some_and(|m| m.contains_key("id")) => {
            vec![PaymentRecord::from_value(value)]
        }
        _ => Vec::new(),
    }
}

/// Prefers a settled record (APPROVED, COMPLETED, REFUNDED); falls back to the first.
pub fn select_preferred_payment(records: &[PaymentRecord]) -> Option<&PaymentRecord> {
    records
        .iter()
        .find(|r| r.is_settled())
        .or_else(|| records.first())
}

/// Total of counted refunds (None when there are none) and the newest refund id.
pub fn summarize_refunds(refunds: &[RefundRecord]) -> (Option<i64>, Option<String>) {
    let counted: Vec<&RefundRecord> = refunds.iter().filter(|r| r.counts()).collect();
    if counted.is_empty() {
        return (None, None);
    }
    let total = counted.iter().filter_map(|r| r.amount_cents).sum::<i64>();
    let latest = counted
        .iter()
        .enumerate()
        .max_by_key(|(idx, r)| (r.created_at, *idx))
        .and_then(|(_, r)| r.id.clone());
    (Some(total), latest)
}

// =============================================================================
// Batch Index
// =============================================================================

/// Payments for a whole page of orders, fetched with one bulk call.
#[derive(Debug, Clone, Default)]
pub struct PaymentIndex {
    by_order: HashMap<String, OrderPayments>,
}

impl PaymentIndex {
    /// Builds the index from a batch transactions response:
    /// `{"orderTransactions": [{orderId, payments, refunds}, ...]}`.
    pub fn from_batch_response(value: &Value) -> Self {
        let entries = first_at(
            value,
            &[&["orderTransactions"], &["ordersTransactions"], &["results"]],
        )
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

        let mut index = PaymentIndex::default();
        for entry in &entries {
            if let Some(order_id) = text_at(entry, ORDER_ID_PATHS) {
                index.insert(order_id, OrderPayments::from_value(entry));
            }
        }
        index
    }

    pub fn insert(&mut self, order_id: String, payments: OrderPayments) {
        self.by_order.insert(order_id, payments);
    }

    pub fn get(&self, order_id: &str) -> Option<&OrderPayments> {
        self.by_order.get(order_id).filter(|p| !p.is_empty())
    }

    pub fn len(&self) -> usize {
        self.by_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_order.is_empty()
    }
}

// =============================================================================
// Cash On Delivery
// =============================================================================

const COD_PAYMENT_MARKERS: [&str; 4] = ["cash", "offline", "cod", "наложен"];
const COD_SHIPPING_MARKERS: [&str; 4] = ["econt", "speedy", "наложен", "cash on delivery"];

/// Cash-on-delivery inference.
///
/// ## Heuristic
/// Upstream never states COD explicitly. An order counts as COD when its
/// payment method names cash/offline/COD, or when it ships with a courier
/// that collects on delivery (Econt, Speedy) and no payment record exists.
/// Expect false positives for prepaid courier orders whose payments were not
/// returned, and false negatives for couriers not in the list.
pub fn is_cod(
    payment_method: Option<&str>,
    delivery_method: Option<&str>,
    payment_record_count: usize,
) -> bool {
    let contains_any = |haystack: &str, needles: &[&str]| {
        let lower = haystack.to_lowercase();
        needles.iter().any(|n| contains_word_or_phrase(&lower, n))
    };

    if payment_method.is_some_and(|m| contains_any(m, &COD_PAYMENT_MARKERS)) {
        return true;
    }
    payment_record_count == 0 && delivery_method.is_some_and(|d| contains_any(d, &COD_SHIPPING_MARKERS))
}

/// `cod` must not match inside words like "barcode"; longer markers match anywhere.
fn contains_word_or_phrase(haystack: &str, needle: &str) -> bool {
    if needle.chars().count() > 3 {
        return haystack.contains(needle);
    }
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == needle)
}

// =============================================================================
// Enrichment
// =============================================================================

/// Which fields an order is still missing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentGaps {
    pub transaction_ref: bool,
    pub delivery_method: bool,
    pub shipping_address: bool,
    pub customer: bool,
}

impl EnrichmentGaps {
    pub fn of(order: &CanonicalOrder) -> Self {
        EnrichmentGaps {
            transaction_ref: order.transaction_ref.is_none(),
            delivery_method: order.delivery_method.is_none(),
            shipping_address: order.shipping_address.is_none(),
            customer: order.customer_unknown(),
        }
    }

    pub fn any(&self) -> bool {
        self.transaction_ref || self.delivery_method || self.shipping_address || self.customer
    }

    /// Gaps only the order-detail endpoint can fill.
    pub fn needs_order_detail(&self) -> bool {
        self.delivery_method || self.shipping_address || self.customer
    }
}

/// True when any enrichable field is missing.
pub fn needs_enrichment(order: &CanonicalOrder) -> bool {
    EnrichmentGaps::of(order).any()
}

/// Enrichment results, stored under `metadata.enrichment`.
///
/// Fields only ever fill gaps in the normalized order; a value derived from
/// the raw payload is never replaced by an enriched one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refunded_cents: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_refund_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    /// Resolver steps that contributed, in the order they ran.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
}

/// Key of the enrichment object inside order metadata.
pub const ENRICHMENT_KEY: &str = "enrichment";

impl EnrichmentRecord {
    /// Reads a previous run's record out of stored order metadata.
    pub fn from_metadata(metadata: &Value) -> Self {
        metadata
            .get(ENRICHMENT_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    /// Fills empty fields from `other`, keeping values already held.
    pub fn absorb(&mut self, other: EnrichmentRecord) {
        fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
            if slot.is_none() {
                *slot = value;
            }
        }
        fill(&mut self.transaction_ref, other.transaction_ref);
        fill(&mut self.payment_id, other.payment_id);
        fill(&mut self.payment_status, other.payment_status);
        fill(&mut self.payment_method, other.payment_method);
        fill(&mut self.paid_at, other.paid_at);
        fill(&mut self.payment_count, other.payment_count);
        fill(&mut self.refunded_cents, other.refunded_cents);
        fill(&mut self.last_refund_id, other.last_refund_id);
        fill(&mut self.delivery_method, other.delivery_method);
        fill(&mut self.shipping_address, other.shipping_address);
        fill(&mut self.customer_name, other.customer_name);
        fill(&mut self.customer_email, other.customer_email);
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
    }

    /// Takes what a payment record offers. A provider id found on the
    /// record replaces an earlier non-provider reference.
    pub fn absorb_payment(&mut self, payment: &PaymentRecord) {
        let upgrade = match (&self.transaction_ref, &payment.transaction_ref) {
            (None, Some(_)) => true,
            (Some(current), Some(found)) => !is_provider_ref(current) && is_provider_ref(found),
            _ => false,
        };
        if upgrade {
            self.transaction_ref = payment.transaction_ref.clone();
        }
        if self.payment_id.is_none() {
            self.payment_id = payment.id.clone();
        }
        if self.payment_status.is_none() {
            self.payment_status = payment.status.clone();
        }
        if self.payment_method.is_none() {
            self.payment_method = payment.method.clone();
        }
        if self.paid_at.is_none() && payment.is_settled() {
            self.paid_at = payment.created_at;
        }
    }

    /// Takes the preferred payment plus the refund summary of an order.
    pub fn absorb_order_payments(&mut self, payments: &OrderPayments) {
        if let Some(preferred) = payments.preferred() {
            self.absorb_payment(preferred);
        }
        self.payment_count = Some(self.payment_count.unwrap_or(0).max(payments.payments.len()));
        let (refunded, latest) = payments.refund_summary();
        if refunded.is_some() {
            self.refunded_cents = refunded;
            self.last_refund_id = latest.or(self.last_refund_id.take());
        }
    }

    pub fn add_source(&mut self, source: &str) {
        if !self.sources.iter().any(|s| s == source) {
            self.sources.push(source.to_string());
        }
    }

    /// Fills the order's gaps and writes the record into its metadata.
    ///
    /// Also recomputes the COD flag and upgrades a `PAID` status to a refund
    /// status when refunds were found.
    pub fn apply_to(&self, order: &mut CanonicalOrder) {
        fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if slot.is_none() {
                *slot = value.clone();
            }
        }

        match (&order.transaction_ref, &self.transaction_ref) {
            (Some(current), Some(found)) if !is_provider_ref(current) && is_provider_ref(found) => {
                order.transaction_ref = Some(found.clone());
            }
            _ => fill(&mut order.transaction_ref, &self.transaction_ref),
        }
        fill(&mut order.payment_id, &self.payment_id);
        fill(&mut order.payment_method, &self.payment_method);
        fill(&mut order.paid_at, &self.paid_at);
        fill(&mut order.delivery_method, &self.delivery_method);
        fill(&mut order.shipping_address, &self.shipping_address);
        fill(&mut order.customer_email, &self.customer_email);
        if order.customer_name == crate::UNKNOWN_CUSTOMER {
            if let Some(name) = &self.customer_name {
                order.customer_name = name.clone();
            }
        }

        if order.payment_status == PaymentStatus::Unknown {
            if let Some(status) = &self.payment_status {
                order.payment_status = PaymentStatus::parse(status);
            }
        }

        if let Some(refunded) = self.refunded_cents.filter(|c| *c > 0) {
            if order.refunded_cents.map_or(true, |c| c < refunded) {
                order.refunded_cents = Some(refunded);
            }
            fill(&mut order.last_refund_id, &self.last_refund_id);
            if order.payment_status == PaymentStatus::Paid {
                order.payment_status = match order.total_cents {
                    Some(total) if refunded >= total => PaymentStatus::FullyRefunded,
                    _ => PaymentStatus::PartiallyRefunded,
                };
            }
        }

        let record_count = self.payment_count.unwrap_or(0);
        order.is_cod = is_cod(
            order.payment_method.as_deref(),
            order.delivery_method.as_deref(),
            record_count.max(embedded_payment_count(&order.raw_payload)),
        );

        if !order.metadata.is_object() {
            order.metadata = Value::Object(serde_json::Map::new());
        }
        if let (Value::Object(map), Ok(record)) = (&mut order.metadata, serde_json::to_value(self)) {
            map.insert(ENRICHMENT_KEY.to_string(), record);
        }
    }
}

/// Payment records embedded in an order payload itself.
pub fn embedded_payment_count(raw: &Value) -> usize {
    const PATHS: &[JsonPath] = &[&["payments"], &["transactions"], &["orderTransactions", "payments"]];
    PATHS
        .iter()
        .filter_map(|path| lookup(raw, path).and_then(Value::as_array))
        .map(Vec::len)
        .max()
        .unwrap_or(0)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_provider_ref_wins_over_internal_id() {
        let payload = json!({
            "id": "a1b2c3d4-internal",
            "paymentId": "a1b2c3d4-internal",
            "regularPaymentDetails": {"providerTransactionId": "pi_abc123"}
        });
        assert_eq!(extract_transaction_ref(&payload).as_deref(), Some("pi_abc123"));
        assert_eq!(extract_payment_id(&payload).as_deref(), Some("a1b2c3d4-internal"));
    }

    #[test]
    fn test_provider_ref_found_in_unnamed_nested_field() {
        let payload = json!({
            "transactionId": "wix-tx-9",
            "notes": [{"text": "ignored"}, {"gateway": {"reference": "ch_3XyZ998877"}}]
        });
        assert_eq!(
            extract_transaction_ref(&payload).as_deref(),
            Some("ch_3XyZ998877")
        );
    }

    #[test]
    fn test_named_keys_used_without_provider_id() {
        let payload = json!({"id": "internal-1", "gatewayTransactionId": "GW-77"});
        assert_eq!(extract_transaction_ref(&payload).as_deref(), Some("GW-77"));

        let payload = json!({"id": "internal-1"});
        assert_eq!(extract_transaction_ref(&payload), None);
    }

    #[test]
    fn test_is_provider_ref() {
        assert!(is_provider_ref("pi_abc123"));
        assert!(is_provider_ref("pay_ABCDEF"));
        assert!(!is_provider_ref("pi_abc"));
        assert!(!is_provider_ref("pi_abc-123"));
        assert!(!is_provider_ref("pix_abcdef"));
    }

    #[test]
    fn test_select_preferred_payment() {
        let records = parse_payment_records(&json!({"payments": [
            {"id": "p1", "status": "PENDING"},
            {"id": "p2", "status": "approved"},
            {"id": "p3", "status": "COMPLETED"}
        ]}));
        assert_eq!(records.len(), 3);
        assert_eq!(select_preferred_payment(&records).unwrap().id.as_deref(), Some("p2"));

        let pending = parse_payment_records(&json!([{"id": "p1", "status": "PENDING"}]));
        assert_eq!(select_preferred_payment(&pending).unwrap().id.as_deref(), Some("p1"));
        assert!(select_preferred_payment(&[]).is_none());
    }

    #[test]
    fn test_batch_index_and_refund_summary() {
        let response = json!({"orderTransactions": [
            {
                "orderId": "o1",
                "payments": [{
                    "id": "pay-internal",
                    "amount": {"amount": "100.00"},
                    "regularPaymentDetails": {"status": "APPROVED", "providerTransactionId": "pi_abc123"}
                }],
                "refunds": [
                    {"id": "r1", "transactions": [{"amount": {"amount": "30"}}], "createdDate": "2024-02-01T00:00:00Z"},
                    {"id": "r2", "transactions": [{"amount": {"amount": "20"}}], "createdDate": "2024-02-05T00:00:00Z"},
                    {"id": "r3", "status": "FAILED", "amount": {"amount": "50"}}
                ]
            },
            {"orderId": "o2", "payments": [], "refunds": []}
        ]});
        let index = PaymentIndex::from_batch_response(&response);
        assert_eq!(index.len(), 2);
        assert!(index.get("o2").is_none());

        let o1 = index.get("o1").unwrap();
        let preferred = o1.preferred().unwrap();
        assert_eq!(preferred.transaction_ref.as_deref(), Some("pi_abc123"));
        assert_eq!(preferred.amount_cents, Some(10000));
        assert_eq!(preferred.order_id.as_deref(), Some("o1"));
        assert_eq!(o1.refund_summary(), (Some(5000), Some("r2".to_string())));
    }

    #[test]
    fn test_cod_heuristic() {
        assert!(is_cod(Some("Cash on delivery"), None, 3));
        assert!(is_cod(Some("offline"), None, 0));
        assert!(is_cod(Some("Наложен платеж"), None, 1));
        assert!(is_cod(None, Some("Econt office"), 0));
        assert!(!is_cod(None, Some("Econt office"), 1));
        assert!(!is_cod(Some("Credit card"), Some("DHL"), 0));
        assert!(!is_cod(Some("barcode scanner"), None, 1));
    }

    fn bare_order() -> CanonicalOrder {
        crate::normalize::normalize(
            &json!({"id": "o1", "paymentStatus": "PAID", "total": 100}),
            crate::types::Provenance::Backfill,
        )
    }

    #[test]
    fn test_needs_enrichment() {
        let order = bare_order();
        let gaps = EnrichmentGaps::of(&order);
        assert!(gaps.transaction_ref && gaps.delivery_method && gaps.customer);
        assert!(needs_enrichment(&order));
    }

    #[test]
    fn test_apply_fills_gaps_and_records_metadata() {
        let mut order = bare_order();
        let mut record = EnrichmentRecord::default();
        record.absorb_payment(&PaymentRecord::from_value(&json!({
            "id": "pay-1", "status": "APPROVED", "providerTransactionId": "pi_abc123"
        })));
        record.refunded_cents = Some(10000);
        record.add_source("batch");
        record.apply_to(&mut order);

        assert_eq!(order.transaction_ref.as_deref(), Some("pi_abc123"));
        assert_eq!(order.payment_id.as_deref(), Some("pay-1"));
        assert_eq!(order.payment_status, PaymentStatus::FullyRefunded);
        assert_eq!(order.metadata["enrichment"]["sources"], json!(["batch"]));

        let reread = EnrichmentRecord::from_metadata(&order.metadata);
        assert_eq!(reread, record);
    }

    #[test]
    fn test_absorb_keeps_existing_values() {
        let mut current = EnrichmentRecord {
            transaction_ref: Some("pi_keep12345".to_string()),
            ..Default::default()
        };
        current.absorb(EnrichmentRecord {
            transaction_ref: Some("pi_other12345".to_string()),
            payment_id: Some("p9".to_string()),
            sources: vec!["payment_query".to_string()],
            ..Default::default()
        });
        assert_eq!(current.transaction_ref.as_deref(), Some("pi_keep12345"));
        assert_eq!(current.payment_id.as_deref(), Some("p9"));
        assert_eq!(current.sources, vec!["payment_query".to_string()]);
    }
}
