//! # Order Source
//!
//! The seam between the sync pipeline and the upstream store API.
//!
//! [`crate::client::UpstreamClient`] implements [`OrderSource`] over HTTP;
//! tests implement it in memory so the whole pipeline runs without a network.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use fiskal_core::json_path::{first_at, text_at, JsonPath};
use fiskal_core::payment::{OrderPayments, PaymentIndex, PaymentRecord};

use crate::error::SyncResult;

// =============================================================================
// Paging
// =============================================================================

/// One request for a page of orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// Only orders created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    pub offset: i64,
    pub limit: u32,
    /// Upstream payment status filter, e.g. `"PAID"`.
    pub payment_status: Option<String>,
}

/// One page of raw upstream orders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrdersPage {
    pub orders: Vec<Value>,
    /// Offset of the following page. Always derived locally.
    pub next_offset: i64,
    /// Cursor the API offered; recorded, never used for the next request.
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: Option<i64>,
}

const ORDER_LIST_PATHS: &[JsonPath] = &[&["orders"], &["items"], &["results"]];

const TOTAL_PATHS: &[JsonPath] = &[
    &["totalResults"],
    &["metadata", "total"],
    &["pagingMetadata", "total"],
];

const CURSOR_PATHS: &[JsonPath] = &[
    &["pagingMetadata", "cursors", "next"],
    &["metadata", "cursors", "next"],
    &["nextCursor"],
];

impl OrdersPage {
    /// Reads a query response.
    ///
    /// `has_more` is `offset + returned < total` when the total is known,
    /// otherwise whether the page came back full. An empty page never has
    /// more: a stale total must not pin the offset in place.
    pub fn from_response(body: &Value, request: &PageRequest) -> Self {
        let orders = first_at(body, ORDER_LIST_PATHS)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let total = first_at(body, TOTAL_PATHS).and_then(|v| {
            v.as_i64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
        });

        let returned = orders.len() as i64;
        let next_offset = request.offset + returned;
        let has_more = match total {
            Some(total) => returned > 0 && next_offset < total,
            None => returned > 0 && returned >= i64::from(request.limit),
        };

        OrdersPage {
            orders,
            next_offset,
            next_cursor: text_at(body, CURSOR_PATHS),
            has_more,
            total,
        }
    }
}

/// Request body for the paged order query.
///
/// Sorted by creation date ascending so offsets stay stable while new
/// orders arrive at the tail.
pub fn orders_query_body(request: &PageRequest) -> Value {
    let mut filter = serde_json::Map::new();
    if let Some(since) = request.since {
        filter.insert(
            "dateCreated".into(),
            json!({ "$gte": since.to_rfc3339_opts(SecondsFormat::Millis, true) }),
        );
    }
    if let Some(status) = &request.payment_status {
        filter.insert("paymentStatus".into(), json!(status));
    }

    json!({
        "query": {
            "filter": Value::Object(filter),
            "sort": [{ "fieldName": "dateCreated", "order": "ASC" }],
            "paging": { "limit": request.limit, "offset": request.offset },
        }
    })
}

// =============================================================================
// Source Trait
// =============================================================================

/// Everything the pipeline reads from upstream.
///
/// Enrichment methods return `Ok(None)` / empty values when upstream simply
/// has nothing; `Err` is reserved for transport and non-2xx failures.
#[async_trait]
pub trait OrderSource: Send + Sync {
    /// One page of raw orders.
    async fn fetch_orders_page(&self, tenant_id: &str, request: &PageRequest) -> SyncResult<OrdersPage>;

    /// Full order by id, first non-empty answer across endpoint variants.
    async fn fetch_order_detail(&self, tenant_id: &str, order_id: &str) -> SyncResult<Option<Value>>;

    /// Payments and refunds for a set of orders in one call.
    async fn fetch_payments_batch(&self, tenant_id: &str, order_ids: &[String]) -> SyncResult<PaymentIndex>;

    /// Payments and refunds of one order.
    async fn fetch_order_transactions(
        &self,
        tenant_id: &str,
        order_id: &str,
    ) -> SyncResult<Option<OrderPayments>>;

    /// Payment records filtered by order id or number.
    async fn query_payments(
        &self,
        tenant_id: &str,
        order_id: &str,
        order_number: Option<&str>,
    ) -> SyncResult<Vec<PaymentRecord>>;

    /// One payment by id, raw.
    async fn fetch_payment_by_id(&self, tenant_id: &str, payment_id: &str) -> SyncResult<Option<Value>>;
}
