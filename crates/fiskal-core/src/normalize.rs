//! # Order Normalizer
//!
//! Maps any upstream order payload onto a [`CanonicalOrder`].
//!
//! ## Contract
//! ```text
//! normalize(raw, provenance) → CanonicalOrder
//!
//!   • total: never fails, never panics; missing data becomes None
//!   • deterministic: the same raw payload always yields the same record,
//!     whichever sync window or webhook delivered it
//!   • every field resolves through a literal, ordered candidate list below;
//!     the first candidate that yields a usable value wins
//! ```
//!
//! The candidate lists are the contract with upstream's historical schemas.
//! Reordering them changes which value wins when several shapes coexist.

use serde_json::{Map, Value};

use crate::json_path::{
    as_text, bool_at, datetime_at, first_at, first_non_null, lookup, object_at, text_at,
    unwrap_envelope, JsonPath,
};
use crate::money::Money;
use crate::payment::{embedded_payment_count, extract_transaction_ref, is_cod, OrderPayments};
use crate::types::{CanonicalOrder, LifecycleStatus, PaymentStatus, Provenance};
use crate::UNKNOWN_CUSTOMER;

// =============================================================================
// Candidate Paths
// =============================================================================

const ID_PATHS: &[JsonPath] = &[&["id"], &["_id"], &["orderId"], &["order", "id"]];

const NUMBER_PATHS: &[JsonPath] = &[
    &["number"],
    &["orderNumber"],
    &["displayNumber"],
    &["order", "number"],
];

const STATUS_PATHS: &[JsonPath] = &[&["status"], &["orderStatus"], &["order", "status"]];

const FULFILLMENT_STATUS_PATHS: &[JsonPath] = &[
    &["fulfillmentStatus"],
    &["fulfillmentStatusesAggregate", "statuses", "0"],
];

const ARCHIVED_PATHS: &[JsonPath] = &[&["archived"], &["isArchived"]];

const CANCELLATION_PATHS: &[JsonPath] = &[
    &["cancellation"],
    &["cancellationInfo"],
    &["canceledDate"],
    &["cancelledDate"],
];

const PAYMENT_STATUS_PATHS: &[JsonPath] = &[
    &["paymentStatus"],
    &["payment", "status"],
    &["paymentInfo", "status"],
    &["billingInfo", "paymentStatus"],
    &["order", "paymentStatus"],
];

const CREATED_PATHS: &[JsonPath] = &[
    &["createdDate"],
    &["_createdDate"],
    &["dateCreated"],
    &["createdAt"],
    &["purchasedDate"],
    &["purchaseFlowCreatedDate"],
];

const UPDATED_PATHS: &[JsonPath] = &[
    &["updatedDate"],
    &["_updatedDate"],
    &["lastUpdated"],
    &["updatedAt"],
];

const PAID_PATHS: &[JsonPath] = &[
    &["paidDate"],
    &["paymentDate"],
    &["paidAt"],
    &["billingInfo", "paidDate"],
    &["paymentInfo", "paidDate"],
    &["payment", "paidDate"],
];

const CURRENCY_PATHS: &[JsonPath] = &[
    &["currency"],
    &["currencyCode"],
    &["priceSummary", "total", "currency"],
    &["totals", "currency"],
    &["payNow", "currency"],
];

const TOTAL_PATHS: &[JsonPath] = &[
    &["priceSummary", "total"],
    &["totals", "total"],
    &["payNow", "total"],
    &["payNow"],
    &["balanceSummary", "total"],
    &["total"],
    &["totalPrice"],
    &["amount"],
];

const SUBTOTAL_PATHS: &[JsonPath] = &[
    &["priceSummary", "subtotal"],
    &["totals", "subtotal"],
    &["subtotal"],
    &["subTotal"],
];

const TAX_PATHS: &[JsonPath] = &[
    &["priceSummary", "tax"],
    &["totals", "tax"],
    &["tax"],
    &["taxAmount"],
];

const SHIPPING_PATHS: &[JsonPath] = &[
    &["priceSummary", "shipping"],
    &["totals", "shipping"],
    &["shippingInfo", "cost", "price"],
    &["shippingInfo", "price"],
    &["shipping"],
];

const DISCOUNT_PATHS: &[JsonPath] = &[
    &["priceSummary", "discount"],
    &["totals", "discount"],
    &["discount"],
    &["discountAmount"],
];

const REFUNDED_PATHS: &[JsonPath] = &[
    &["balanceSummary", "refunded"],
    &["priceSummary", "refunded"],
    &["totals", "refunded"],
    &["refundedAmount"],
    &["refunded"],
];

/// Sub-objects that may describe the buyer, most authoritative first.
const PERSON_PATHS: &[JsonPath] = &[
    &["buyerInfo", "contactDetails"],
    &["buyerInfo"],
    &["billingInfo", "contactDetails"],
    &["billingInfo", "address"],
    &["billingInfo"],
    &["recipientInfo", "contactDetails"],
    &["shippingInfo", "logistics", "shippingDestination", "contactDetails"],
    &["shippingInfo", "shipmentDetails", "address"],
    &["contact"],
    &["contactDetails"],
    &["customer"],
];

/// Name key pairs tried on each person object.
const NAME_KEY_PAIRS: [(&str, &str); 3] = [
    ("firstName", "lastName"),
    ("givenName", "familyName"),
    ("first", "last"),
];

const FULL_NAME_KEYS: [&str; 3] = ["fullName", "name", "displayName"];

const EMAIL_PATHS: &[JsonPath] = &[
    &["buyerInfo", "email"],
    &["buyerInfo", "contactDetails", "email"],
    &["billingInfo", "contactDetails", "email"],
    &["billingInfo", "email"],
    &["recipientInfo", "contactDetails", "email"],
    &["contact", "email"],
    &["customer", "email"],
    &["buyerEmail"],
    &["email"],
];

const DELIVERY_PATHS: &[JsonPath] = &[
    &["shippingInfo", "title"],
    &["shippingInfo", "deliveryOption"],
    &["shippingInfo", "logistics", "deliveryOption"],
    &["shippingInfo", "shipmentDetails", "deliveryOption"],
    &["deliveryMethod"],
    &["shippingMethod"],
    &["delivery", "method"],
];

const ADDRESS_PATHS: &[JsonPath] = &[
    &["shippingInfo", "logistics", "shippingDestination", "address"],
    &["shippingInfo", "shipmentDetails", "address"],
    &["shippingInfo", "address"],
    &["recipientInfo", "address"],
    &["shippingAddress"],
    &["deliveryAddress"],
];

const PAYMENT_ID_PATHS: &[JsonPath] = &[
    &["paymentId"],
    &["payment", "id"],
    &["paymentInfo", "id"],
    &["paymentInfo", "paymentId"],
    &["billingInfo", "paymentId"],
];

const PAYMENT_METHOD_PATHS: &[JsonPath] = &[
    &["paymentMethod"],
    &["billingInfo", "paymentMethod"],
    &["paymentInfo", "method"],
    &["paymentInfo", "paymentMethod"],
    &["payment", "method"],
    &["payment", "paymentMethod"],
];

// =============================================================================
// Entry Point
// =============================================================================

/// Normalizes one raw upstream order.
///
/// `metadata` always starts as an empty object; enrichment fills it later.
pub fn normalize(raw: &Value, provenance: Provenance) -> CanonicalOrder {
    let (total_cents, total_currency) = money_field(raw, TOTAL_PATHS);
    let currency = text_at(raw, CURRENCY_PATHS)
        .or(total_currency)
        .map(|c| c.to_ascii_uppercase());

    let payment_method = payment_method(raw);
    let delivery_method = delivery_method(raw);

    let embedded = OrderPayments::from_value(raw);
    let (refunded_from_records, last_refund_id) = embedded.refund_summary();

    CanonicalOrder {
        id: text_at(raw, ID_PATHS).unwrap_or_default(),
        number: text_at(raw, NUMBER_PATHS),
        lifecycle_status: lifecycle_status(raw),
        payment_status: text_at(raw, PAYMENT_STATUS_PATHS)
            .map(|s| PaymentStatus::parse(&s))
            .unwrap_or_default(),
        created_at: datetime_at(raw, CREATED_PATHS),
        updated_at: datetime_at(raw, UPDATED_PATHS),
        paid_at: datetime_at(raw, PAID_PATHS),
        currency,
        subtotal_cents: money_field(raw, SUBTOTAL_PATHS).0,
        tax_cents: money_field(raw, TAX_PATHS).0,
        shipping_cents: money_field(raw, SHIPPING_PATHS).0,
        discount_cents: money_field(raw, DISCOUNT_PATHS).0,
        total_cents,
        refunded_cents: first_non_null([money_field(raw, REFUNDED_PATHS).0, refunded_from_records]),
        last_refund_id,
        customer_name: customer_name(raw),
        customer_email: text_at(raw, EMAIL_PATHS).map(|e| e.to_lowercase()),
        is_cod: is_cod(
            payment_method.as_deref(),
            delivery_method.as_deref(),
            embedded_payment_count(raw),
        ),
        delivery_method,
        shipping_address: object_at(raw, ADDRESS_PATHS).cloned(),
        transaction_ref: extract_transaction_ref(raw),
        payment_id: text_at(raw, PAYMENT_ID_PATHS),
        payment_method,
        provenance,
        raw_payload: raw.clone(),
        metadata: Value::Object(Map::new()),
    }
}

// =============================================================================
// Field Resolvers
// =============================================================================

/// Amount in cents and, when the amount sits in an object, its currency.
///
/// ```text
/// 100                                   → (10000, None)
/// "19.90"                               → (1990, None)
/// {"amount": "19.90", "currency": "BGN"} → (1990, Some("BGN"))
/// {"value": {"amount": 5}}              → (500, None)
/// {"formattedAmount": "лв5.00"}         → (None, None)
/// ```
pub fn money_field(raw: &Value, paths: &[JsonPath]) -> (Option<i64>, Option<String>) {
    first_non_null(
        paths
            .iter()
            .filter_map(|path| lookup(raw, path))
            .map(|value| money_with_currency(value).map(|(m, c)| (Some(m.cents()), c))),
    )
    .unwrap_or((None, None))
}

fn money_with_currency(value: &Value) -> Option<(Money, Option<String>)> {
    match value {
        Value::Object(map) => {
            let currency = ["currency", "currencyCode"]
                .iter()
                .find_map(|key| map.get(*key).and_then(as_text));
            let amount = ["amount", "value", "convertedAmount"]
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|inner| match inner {
                    Value::Object(_) => money_with_currency(inner).map(|(m, _)| m),
                    other => Money::parse_value(other),
                })?;
            Some((amount, currency))
        }
        other => Money::parse_value(other).map(|m| (m, None)),
    }
}

fn lifecycle_status(raw: &Value) -> LifecycleStatus {
    let cancelled_word = |s: &str| {
        let upper = s.to_ascii_uppercase();
        upper.starts_with("CANCEL") || upper == "VOIDED"
    };

    let by_status = text_at(raw, STATUS_PATHS).is_some_and(|s| cancelled_word(&s));
    let by_fulfillment = text_at(raw, FULFILLMENT_STATUS_PATHS).is_some_and(|s| cancelled_word(&s));
    let by_archive = bool_at(raw, ARCHIVED_PATHS).unwrap_or(false);
    let by_marker = CANCELLATION_PATHS.iter().any(|path| {
        lookup(raw, path).is_some_and(|v| match v {
            Value::Object(map) => !map.is_empty(),
            Value::Bool(b) => *b,
            Value::String(s) => !s.trim().is_empty(),
            _ => false,
        })
    });

    if by_status || by_fulfillment || by_archive || by_marker {
        LifecycleStatus::Cancelled
    } else {
        LifecycleStatus::Active
    }
}

/// First person object that yields a name; `"Unknown"` otherwise.
fn customer_name(raw: &Value) -> String {
    first_non_null(
        PERSON_PATHS
            .iter()
            .filter_map(|path| lookup(raw, path))
            .map(person_name),
    )
    .unwrap_or_else(|| UNKNOWN_CUSTOMER.to_string())
}

fn person_name(person: &Value) -> Option<String> {
    let field = |key: &str| person.get(key).and_then(|v| as_text(unwrap_envelope(v)));

    let from_pairs = first_non_null(NAME_KEY_PAIRS.iter().map(|(first, last)| {
        let parts: Vec<String> = [field(first), field(last)].into_iter().flatten().collect();
        (!parts.is_empty()).then(|| parts.join(" "))
    }));

    from_pairs.or_else(|| first_non_null(FULL_NAME_KEYS.iter().map(|key| field(key))))
}

/// Delivery methods arrive as text or as `{title|name|code}` objects.
fn delivery_method(raw: &Value) -> Option<String> {
    first_non_null(DELIVERY_PATHS.iter().map(|path| {
        lookup(raw, path).and_then(|v| match v {
            Value::Object(_) => text_at(v, &[&["title"], &["name"], &["code"]]),
            other => as_text(other),
        })
    }))
}

fn payment_method(raw: &Value) -> Option<String> {
    first_non_null(PAYMENT_METHOD_PATHS.iter().map(|path| {
        lookup(raw, path).and_then(|v| match v {
            Value::Object(_) => text_at(v, &[&["type"], &["name"], &["title"]]),
            other => as_text(other),
        })
    }))
    .or_else(|| {
        first_at(raw, &[&["payments", "0"]])
            .and_then(|p| text_at(p, &[&["paymentMethod"], &["regularPaymentDetails", "paymentMethod"]]))
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn test_empty_object_is_total() {
        let order = normalize(&json!({}), Provenance::Backfill);
        assert_eq!(order.id, "");
        assert_eq!(order.number, None);
        assert_eq!(order.total_cents, None);
        assert_eq!(order.currency, None);
        assert_eq!(order.created_at, None);
        assert_eq!(order.payment_status, PaymentStatus::Unknown);
        assert_eq!(order.lifecycle_status, LifecycleStatus::Active);
        assert_eq!(order.customer_name, UNKNOWN_CUSTOMER);
        assert_eq!(order.transaction_ref, None);
        assert!(!order.is_cod);
        assert_eq!(order.metadata, json!({}));
    }

    #[test]
    fn test_non_object_payloads_do_not_panic() {
        for raw in [json!(null), json!([1, 2]), json!("o1"), json!(42)] {
            let order = normalize(&raw, Provenance::Webhook);
            assert_eq!(order.id, "");
            assert_eq!(order.provenance, Provenance::Webhook);
        }
    }

    #[test]
    fn test_flat_order() {
        let raw = json!({
            "id": "o1",
            "paymentStatus": "PAID",
            "total": 100,
            "currency": "bgn",
            "createdDate": "2024-01-01"
        });
        let order = normalize(&raw, Provenance::Backfill);
        assert_eq!(order.id, "o1");
        assert_eq!(order.payment_status, PaymentStatus::Paid);
        assert_eq!(order.total_cents, Some(10000));
        assert_eq!(order.currency.as_deref(), Some("BGN"));
        assert_eq!(
            order.created_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
        assert_eq!(order.raw_payload, raw);
    }

    #[test]
    fn test_ecom_shape() {
        let raw = json!({
            "id": "8a1e",
            "number": "10042",
            "status": "APPROVED",
            "paymentStatus": "PAID",
            "createdDate": {"value": "2024-03-01T09:30:00Z"},
            "priceSummary": {
                "subtotal": {"amount": "90.00"},
                "shipping": {"amount": "5.00"},
                "tax": {"amount": "15.83"},
                "discount": {"amount": "0"},
                "total": {"amount": "95.00", "currency": "EUR"}
            },
            "buyerInfo": {"email": "Ivan@Example.com"},
            "billingInfo": {"contactDetails": {"firstName": "Ivan", "lastName": "Petrov"}},
            "shippingInfo": {
                "title": "Speedy",
                "logistics": {"shippingDestination": {"address": {"city": "Sofia"}}}
            }
        });
        let order = normalize(&raw, Provenance::Webhook);
        assert_eq!(order.number.as_deref(), Some("10042"));
        assert_eq!(order.lifecycle_status, LifecycleStatus::Active);
        assert_eq!(order.total_cents, Some(9500));
        assert_eq!(order.subtotal_cents, Some(9000));
        assert_eq!(order.shipping_cents, Some(500));
        assert_eq!(order.tax_cents, Some(1583));
        assert_eq!(order.discount_cents, Some(0));
        assert_eq!(order.currency.as_deref(), Some("EUR"));
        assert_eq!(order.customer_name, "Ivan Petrov");
        assert_eq!(order.customer_email.as_deref(), Some("ivan@example.com"));
        assert_eq!(order.delivery_method.as_deref(), Some("Speedy"));
        assert_eq!(order.shipping_address, Some(json!({"city": "Sofia"})));
        assert!(order.is_cod);
        assert_eq!(
            order.created_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_total_candidate_order() {
        let raw = json!({"totals": {"total": "12.50"}, "total": 99});
        assert_eq!(money_field(&raw, TOTAL_PATHS), (Some(1250), None));

        let raw = json!({"priceSummary": {"total": null}, "payNow": {"amount": "7"}});
        assert_eq!(normalize(&raw, Provenance::Backfill).total_cents, Some(700));
    }

    #[test]
    fn test_money_recurses_one_level() {
        let raw = json!({"total": {"value": {"amount": 5}, "currency": "BGN"}});
        assert_eq!(money_field(&raw, TOTAL_PATHS), (Some(500), Some("BGN".to_string())));
    }

    #[test]
    fn test_name_variants() {
        let raw = json!({"recipientInfo": {"contactDetails": {"givenName": "Maria", "familyName": "Ivanova"}}});
        assert_eq!(normalize(&raw, Provenance::Backfill).customer_name, "Maria Ivanova");

        let raw = json!({"buyerInfo": {"firstName": "Georgi"}});
        assert_eq!(normalize(&raw, Provenance::Backfill).customer_name, "Georgi");

        let raw = json!({"customer": {"fullName": "Petar Petrov"}});
        assert_eq!(normalize(&raw, Provenance::Backfill).customer_name, "Petar Petrov");
    }

    #[test]
    fn test_cancellation_markers() {
        for raw in [
            json!({"status": "CANCELED"}),
            json!({"fulfillmentStatus": "CANCELLED"}),
            json!({"archived": true}),
            json!({"cancellation": {"reason": "customer"}}),
        ] {
            assert_eq!(
                normalize(&raw, Provenance::Backfill).lifecycle_status,
                LifecycleStatus::Cancelled,
                "{raw}"
            );
        }
        let raw = json!({"archived": false, "cancellation": {}});
        assert_eq!(
            normalize(&raw, Provenance::Backfill).lifecycle_status,
            LifecycleStatus::Active
        );
    }

    #[test]
    fn test_embedded_refunds_summarized() {
        let raw = json!({
            "id": "o7",
            "paymentStatus": "PARTIALLY_REFUNDED",
            "refunds": [{"id": "r1", "amount": {"amount": "25.00"}}]
        });
        let order = normalize(&raw, Provenance::Backfill);
        assert_eq!(order.refunded_cents, Some(2500));
        assert_eq!(order.last_refund_id.as_deref(), Some("r1"));
    }

    #[test]
    fn test_transaction_ref_and_payment_id() {
        let raw = json!({
            "id": "o1",
            "paymentId": "wix-pay-1",
            "payments": [{"regularPaymentDetails": {"providerTransactionId": "pi_abc123"}}]
        });
        let order = normalize(&raw, Provenance::Backfill);
        assert_eq!(order.transaction_ref.as_deref(), Some("pi_abc123"));
        assert_eq!(order.payment_id.as_deref(), Some("wix-pay-1"));
    }
}
