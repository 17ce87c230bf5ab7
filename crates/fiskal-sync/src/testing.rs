//! In-memory [`OrderSource`] for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use fiskal_core::payment::{OrderPayments, PaymentIndex, PaymentRecord};

use crate::error::{SyncError, SyncResult};
use crate::source::{OrderSource, OrdersPage, PageRequest};

#[derive(Default)]
struct State {
    orders: Vec<Value>,
    details: HashMap<String, Value>,
    batch: Option<Value>,
    transactions: HashMap<String, Value>,
    payment_query: Vec<Value>,
    payments: HashMap<String, Value>,
    failing_transactions: HashSet<String>,
    failing_offsets: HashSet<i64>,
    reported_total: Option<usize>,
    page_requests: Vec<PageRequest>,
    calls: usize,
}

/// Serves canned upstream data and counts enrichment calls.
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<State>,
}

impl FakeSource {
    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Enrichment calls made so far; page fetches are not counted.
    pub fn calls(&self) -> usize {
        self.with(|s| s.calls)
    }

    pub fn page_requests(&self) -> Vec<PageRequest> {
        self.with(|s| s.page_requests.clone())
    }

    pub fn add_order(&self, raw: Value) {
        self.with(|s| s.orders.push(raw));
    }

    /// Replaces an order already served by the list query.
    pub fn replace_order(&self, raw: Value) {
        self.with(|s| {
            let id = raw["id"].clone();
            match s.orders.iter_mut().find(|o| o["id"] == id) {
                Some(slot) => *slot = raw,
                None => s.orders.push(raw),
            }
        });
    }

    pub fn set_detail(&self, order_id: &str, raw: Value) {
        self.with(|s| s.details.insert(order_id.to_string(), raw));
    }

    pub fn set_batch(&self, response: Value) {
        self.with(|s| s.batch = Some(response));
    }

    pub fn set_transactions(&self, order_id: &str, raw: Value) {
        self.with(|s| s.transactions.insert(order_id.to_string(), raw));
    }

    pub fn add_payment_query_result(&self, raw: Value) {
        self.with(|s| s.payment_query.push(raw));
    }

    pub fn add_payment(&self, payment_id: &str, raw: Value) {
        self.with(|s| s.payments.insert(payment_id.to_string(), raw));
    }

    /// Order transaction lookups for `tenant_id` answer 503.
    pub fn fail_transactions(&self, tenant_id: &str) {
        self.with(|s| s.failing_transactions.insert(tenant_id.to_string()));
    }

    /// The page starting at `offset` answers 503.
    pub fn fail_page_at(&self, offset: i64) {
        self.with(|s| s.failing_offsets.insert(offset));
    }

    /// Pages report `total` instead of the real order count.
    pub fn report_total(&self, total: usize) {
        self.with(|s| s.reported_total = Some(total));
    }

    pub fn heal_pages(&self) {
        self.with(|s| s.failing_offsets.clear());
    }

    fn unavailable() -> SyncError {
        SyncError::upstream(503, "service unavailable")
    }
}

#[async_trait]
impl OrderSource for FakeSource {
    async fn fetch_orders_page(&self, _tenant_id: &str, request: &PageRequest) -> SyncResult<OrdersPage> {
        self.with(|s| {
            s.page_requests.push(request.clone());
            if s.failing_offsets.contains(&request.offset) {
                return Err(Self::unavailable());
            }
            let start = (request.offset.max(0) as usize).min(s.orders.len());
            let end = (start + request.limit as usize).min(s.orders.len());
            let body = serde_json::json!({
                "orders": s.orders[start..end].to_vec(),
                "totalResults": s.reported_total.unwrap_or(s.orders.len()),
            });
            Ok(OrdersPage::from_response(&body, request))
        })
    }

    async fn fetch_order_detail(&self, _tenant_id: &str, order_id: &str) -> SyncResult<Option<Value>> {
        self.with(|s| {
            s.calls += 1;
            Ok(s.details.get(order_id).cloned())
        })
    }

    async fn fetch_payments_batch(&self, _tenant_id: &str, order_ids: &[String]) -> SyncResult<PaymentIndex> {
        self.with(|s| {
            let Some(response) = &s.batch else {
                return Ok(PaymentIndex::default());
            };
            let full = PaymentIndex::from_batch_response(response);
            let mut index = PaymentIndex::default();
            for id in order_ids {
                if let Some(payments) = full.get(id) {
                    index.insert(id.clone(), payments.clone());
                }
            }
            Ok(index)
        })
    }

    async fn fetch_order_transactions(
        &self,
        tenant_id: &str,
        order_id: &str,
    ) -> SyncResult<Option<OrderPayments>> {
        self.with(|s| {
            s.calls += 1;
            if s.failing_transactions.contains(tenant_id) {
                return Err(Self::unavailable());
            }
            Ok(s.transactions.get(order_id).map(OrderPayments::from_value))
        })
    }

    async fn query_payments(
        &self,
        _tenant_id: &str,
        order_id: &str,
        order_number: Option<&str>,
    ) -> SyncResult<Vec<PaymentRecord>> {
        self.with(|s| {
            s.calls += 1;
            Ok(s.payment_query
                .iter()
                .map(PaymentRecord::from_value)
                .filter(|p| p.matches_order(order_id, order_number))
                .collect())
        })
    }

    async fn fetch_payment_by_id(&self, _tenant_id: &str, payment_id: &str) -> SyncResult<Option<Value>> {
        self.with(|s| {
            s.calls += 1;
            Ok(s.payments.get(payment_id).cloned())
        })
    }
}
