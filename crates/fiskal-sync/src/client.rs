//! # Upstream Client
//!
//! HTTP implementation of [`OrderSource`] against the store API.
//!
//! ## Request Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  fetch_*(tenant, ..)                                                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  TokenCache::token(tenant) ── cached unless < margin left              │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  endpoints::probe(variants) ── 404/empty → next variant                 │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  send(endpoint) ── non-2xx → SyncError::Upstream{status, body}         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The client never retries a failed call; the orchestrator decides.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use fiskal_core::json_path::{first_at, JsonPath};
use fiskal_core::payment::{parse_payment_records, OrderPayments, PaymentIndex, PaymentRecord};

use crate::auth::TokenCache;
use crate::config::{TenantConfig, UpstreamSettings};
use crate::endpoints::{probe, Endpoint, EndpointSet, HttpMethod};
use crate::error::{truncate_body, SyncError, SyncResult};
use crate::source::{orders_query_body, OrderSource, OrdersPage, PageRequest};

const ORDER_ENVELOPE_PATHS: &[JsonPath] = &[&["order"], &["data", "order"], &["entity"]];
const PAYMENT_ENVELOPE_PATHS: &[JsonPath] = &[&["payment"], &["transaction"], &["data", "payment"]];

/// HTTP client for the upstream store API, shared by all tenants.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
    endpoints: Arc<EndpointSet>,
    tokens: Arc<TokenCache>,
    tenants: Arc<HashMap<String, TenantConfig>>,
}

impl UpstreamClient {
    /// Builds the client and its token cache.
    pub fn new(settings: &UpstreamSettings, tenants: &[TenantConfig]) -> SyncResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()?;

        // Url::join drops the last segment unless the base ends with '/'
        let mut base = settings.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)?;

        let tokens = TokenCache::new(http.clone(), settings.auth_url.clone(), settings.refresh_margin());

        Ok(UpstreamClient {
            http,
            base_url,
            endpoints: Arc::new(settings.endpoints.clone()),
            tokens: Arc::new(tokens),
            tenants: Arc::new(tenants.iter().map(|t| (t.id.clone(), t.clone())).collect()),
        })
    }

    fn tenant(&self, tenant_id: &str) -> SyncResult<&TenantConfig> {
        self.tenants
            .get(tenant_id)
            .ok_or_else(|| SyncError::UnknownTenant(tenant_id.to_string()))
    }

    fn url_for(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn headers(&self, tenant: &TenantConfig) -> SyncResult<HeaderMap> {
        let token = self.tokens.token(tenant).await?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        // The store API takes the bare token, no "Bearer" prefix
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&token)
                .map_err(|_| SyncError::Auth("access token is not a valid header value".into()))?,
        );
        Ok(headers)
    }

    /// Sends one request and returns the parsed JSON body.
    ///
    /// An empty 2xx body yields `Value::Null`.
    async fn send(
        &self,
        tenant_id: &str,
        endpoint: &Endpoint,
        vars: &[(&str, &str)],
        body: Option<&Value>,
    ) -> SyncResult<Value> {
        let tenant = self.tenant(tenant_id)?;
        let url = self.url_for(&endpoint.render(vars))?;
        let headers = self.headers(tenant).await?;

        debug!(tenant_id = %tenant_id, method = endpoint.method.as_str(), url = %url, "Upstream request");

        let request = match endpoint.method {
            HttpMethod::Get => self.http.get(url),
            HttpMethod::Post => self.http.post(url).json(body.unwrap_or(&json!({}))),
        };
        let response = request.headers(headers).send().await?;

        let status = response.status();
        let text = response.text().await?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.tokens.invalidate(tenant_id).await;
        }
        if !status.is_success() {
            if status != reqwest::StatusCode::NOT_FOUND {
                warn!(
                    tenant_id = %tenant_id,
                    endpoint = %endpoint,
                    status = status.as_u16(),
                    body = %truncate_body(&text),
                    "Upstream request failed"
                );
            }
            return Err(SyncError::upstream(status.as_u16(), text));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }
}

/// The object inside a response envelope, or the response itself.
fn unwrap_entity<'a>(body: &'a Value, paths: &[JsonPath]) -> Option<&'a Value> {
    first_at(body, paths)
        .filter(|v| v.is_object())
        .or_else(|| body.as_object().filter(|m| !m.is_empty()).map(|_| body))
}

fn order_from_detail(body: &Value) -> Option<Value> {
    unwrap_entity(body, ORDER_ENVELOPE_PATHS)
        .filter(|order| order.get("id").is_some() || order.get("_id").is_some())
        .cloned()
}

fn payment_from_response(body: &Value) -> Option<Value> {
    unwrap_entity(body, PAYMENT_ENVELOPE_PATHS).cloned()
}

fn payment_query_body(order_id: &str, order_number: Option<&str>) -> Value {
    let mut or = vec![json!({ "orderId": order_id })];
    if let Some(number) = order_number {
        or.push(json!({ "orderNumber": number }));
    }
    json!({
        "query": {
            "filter": { "$or": or },
            "paging": { "limit": 50 },
        }
    })
}

#[async_trait]
impl OrderSource for UpstreamClient {
    async fn fetch_orders_page(&self, tenant_id: &str, request: &PageRequest) -> SyncResult<OrdersPage> {
        let body = self
            .send(tenant_id, &self.endpoints.orders_query, &[], Some(&orders_query_body(request)))
            .await?;
        let page = OrdersPage::from_response(&body, request);

        debug!(
            tenant_id = %tenant_id,
            offset = request.offset,
            returned = page.orders.len(),
            total = ?page.total,
            has_more = page.has_more,
            "Fetched orders page"
        );
        Ok(page)
    }

    async fn fetch_order_detail(&self, tenant_id: &str, order_id: &str) -> SyncResult<Option<Value>> {
        let rpc_body = json!({ "id": order_id });
        probe(&self.endpoints.order_detail, |endpoint| {
            let rpc_body = &rpc_body;
            async move {
                let body = self
                    .send(tenant_id, &endpoint, &[("id", order_id)], Some(rpc_body))
                    .await?;
                Ok(order_from_detail(&body))
            }
        })
        .await
    }

    async fn fetch_payments_batch(&self, tenant_id: &str, order_ids: &[String]) -> SyncResult<PaymentIndex> {
        if order_ids.is_empty() {
            return Ok(PaymentIndex::default());
        }
        let request = json!({ "orderIds": order_ids });
        let found = probe(&self.endpoints.batch_transactions, |endpoint| {
            let request = &request;
            async move {
                let body = self.send(tenant_id, &endpoint, &[], Some(request)).await?;
                let index = PaymentIndex::from_batch_response(&body);
                Ok((!index.is_empty()).then_some(body))
            }
        })
        .await?;

        Ok(found
            .map(|body| PaymentIndex::from_batch_response(&body))
            .unwrap_or_default())
    }

    async fn fetch_order_transactions(
        &self,
        tenant_id: &str,
        order_id: &str,
    ) -> SyncResult<Option<OrderPayments>> {
        let found = probe(&self.endpoints.order_transactions, |endpoint| async move {
            let body = self
                .send(tenant_id, &endpoint, &[("order_id", order_id), ("id", order_id)], None)
                .await?;
            let inner = first_at(&body, &[&["orderTransactions"]]).unwrap_or(&body);
            let payments = OrderPayments::from_value(inner);
            Ok((!payments.is_empty()).then(|| inner.clone()))
        })
        .await?;

        Ok(found.map(|inner| OrderPayments::from_value(&inner)))
    }

    async fn query_payments(
        &self,
        tenant_id: &str,
        order_id: &str,
        order_number: Option<&str>,
    ) -> SyncResult<Vec<PaymentRecord>> {
        let request = payment_query_body(order_id, order_number);
        let found = probe(&self.endpoints.payment_query, |endpoint| {
            let request = &request;
            async move {
                let body = self.send(tenant_id, &endpoint, &[], Some(request)).await?;
                let matching = parse_payment_records(&body)
                    .iter()
                    .any(|p| p.matches_order(order_id, order_number));
                Ok(matching.then_some(body))
            }
        })
        .await?;

        Ok(found
            .map(|body| {
                parse_payment_records(&body)
                    .into_iter()
                    .filter(|p| p.matches_order(order_id, order_number))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_payment_by_id(&self, tenant_id: &str, payment_id: &str) -> SyncResult<Option<Value>> {
        probe(&self.endpoints.payment_by_id, |endpoint| async move {
            let body = self
                .send(tenant_id, &endpoint, &[("id", payment_id)], None)
                .await?;
            Ok(payment_from_response(&body))
        })
        .await
    }
}
