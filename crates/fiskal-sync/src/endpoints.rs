//! # Upstream Endpoint Descriptors
//!
//! Every upstream path the client calls, in one place.
//!
//! The store API has moved several resources between path families over
//! time. Each family is an ordered list of [`Endpoint`]s that the client
//! probes front to back, stopping at the first variant that returns data.
//! Retiring or adding a variant is a one-line change here, or a config
//! override (`"GET /path/{id}"` strings) without a rebuild.
//!
//! ## Probe Rules
//! ```text
//! variant returns data      → stop, use it
//! variant returns empty     → try next
//! variant returns 404       → try next
//! variant returns other err → remember, try next
//! list exhausted            → Ok(None) if any variant answered 2xx,
//!                             else the last remembered error
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use tracing::debug;

use crate::error::{SyncError, SyncResult};

// =============================================================================
// Endpoint
// =============================================================================

/// HTTP verb of an endpoint variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        }
    }
}

/// One endpoint variant: a verb and a path with `{placeholders}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    pub method: HttpMethod,
    pub path_template: String,
}

impl Endpoint {
    pub fn get(path_template: &str) -> Self {
        Endpoint {
            method: HttpMethod::Get,
            path_template: path_template.to_string(),
        }
    }

    pub fn post(path_template: &str) -> Self {
        Endpoint {
            method: HttpMethod::Post,
            path_template: path_template.to_string(),
        }
    }

    /// Parses `"GET /path/{id}"`. A bare path means GET.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let raw = raw.trim();
        let (method, path) = match raw.split_once(char::is_whitespace) {
            Some((verb, path)) => {
                let method = match verb.to_ascii_uppercase().as_str() {
                    "GET" => HttpMethod::Get,
                    "POST" => HttpMethod::Post,
                    other => {
                        return Err(SyncError::InvalidConfig(format!(
                            "Unsupported endpoint method '{other}' in '{raw}'"
                        )))
                    }
                };
                (method, path.trim())
            }
            None => (HttpMethod::Get, raw),
        };

        if !path.starts_with('/') {
            return Err(SyncError::InvalidConfig(format!(
                "Endpoint path must start with '/': '{raw}'"
            )));
        }

        Ok(Endpoint {
            method,
            path_template: path.to_string(),
        })
    }

    /// Fills `{name}` placeholders. Unknown placeholders are left as-is.
    pub fn render(&self, vars: &[(&str, &str)]) -> String {
        vars.iter().fold(self.path_template.clone(), |path, (name, value)| {
            path.replace(&format!("{{{name}}}"), &encode_segment(value))
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method.as_str(), self.path_template)
    }
}

impl TryFrom<String> for Endpoint {
    type Error = SyncError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Endpoint::parse(&raw)
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

/// Percent-encodes a path segment value.
///
/// The form serializer writes spaces as `+`, which a path would keep
/// literally; a literal `+` in the input is already `%2B` at that point.
fn encode_segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

// =============================================================================
// Endpoint Families
// =============================================================================

/// All endpoint families, in probe order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSet {
    /// Paged order query (offset paging).
    #[serde(default = "default_orders_query")]
    pub orders_query: Endpoint,

    /// Single order: REST GET, RPC-style POST, legacy stores path.
    #[serde(default = "default_order_detail")]
    pub order_detail: Vec<Endpoint>,

    /// Payments and refunds of one order.
    #[serde(default = "default_order_transactions")]
    pub order_transactions: Vec<Endpoint>,

    /// Payments and refunds of many orders in one call.
    #[serde(default = "default_batch_transactions")]
    pub batch_transactions: Vec<Endpoint>,

    /// Payment search filtered by order id/number.
    #[serde(default = "default_payment_query")]
    pub payment_query: Vec<Endpoint>,

    /// Payment by id; three historical path families.
    #[serde(default = "default_payment_by_id")]
    pub payment_by_id: Vec<Endpoint>,
}

fn default_orders_query() -> Endpoint {
    Endpoint::post("/stores/v2/orders/query")
}

fn default_order_detail() -> Vec<Endpoint> {
    vec![
        Endpoint::get("/ecom/v1/orders/{id}"),
        Endpoint::post("/ecom/v1/orders/get"),
        Endpoint::get("/stores/v2/orders/{id}"),
    ]
}

fn default_order_transactions() -> Vec<Endpoint> {
    vec![Endpoint::get("/ecom/v1/payments/orders/{order_id}")]
}

fn default_batch_transactions() -> Vec<Endpoint> {
    vec![Endpoint::post("/ecom/v1/payments/orders/query-by-ids")]
}

fn default_payment_query() -> Vec<Endpoint> {
    vec![
        Endpoint::post("/payments/v1/payments/query"),
        Endpoint::post("/cashier/v1/payments/query"),
    ]
}

fn default_payment_by_id() -> Vec<Endpoint> {
    vec![
        Endpoint::get("/payments/v1/payments/{id}"),
        Endpoint::get("/cashier/v1/payments/{id}"),
        Endpoint::get("/ecom/v1/payments/{id}"),
    ]
}

impl Default for EndpointSet {
    fn default() -> Self {
        EndpointSet {
            orders_query: default_orders_query(),
            order_detail: default_order_detail(),
            order_transactions: default_order_transactions(),
            batch_transactions: default_batch_transactions(),
            payment_query: default_payment_query(),
            payment_by_id: default_payment_by_id(),
        }
    }
}

impl EndpointSet {
    /// Every family must keep at least one variant.
    pub fn validate(&self) -> SyncResult<()> {
        let families = [
            ("order_detail", &self.order_detail),
            ("order_transactions", &self.order_transactions),
            ("batch_transactions", &self.batch_transactions),
            ("payment_query", &self.payment_query),
            ("payment_by_id", &self.payment_by_id),
        ];
        for (name, list) in families {
            if list.is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "upstream.endpoints.{name} must list at least one endpoint"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Probing
// =============================================================================

/// Tries `endpoints` in order with `call`, returning the first non-empty result.
///
/// `call` yields `Ok(None)` when a variant answered but had nothing.
pub async fn probe<F, Fut>(endpoints: &[Endpoint], mut call: F) -> SyncResult<Option<serde_json::Value>>
where
    F: FnMut(Endpoint) -> Fut,
    Fut: Future<Output = SyncResult<Option<serde_json::Value>>>,
{
    let mut answered = false;
    let mut last_error = None;

    for endpoint in endpoints {
        let label = endpoint.to_string();
        match call(endpoint.clone()).await {
            Ok(Some(found)) => return Ok(Some(found)),
            Ok(None) => {
                answered = true;
                debug!(endpoint = %label, "Endpoint returned nothing");
            }
            Err(err) if err.is_not_found() => {
                debug!(endpoint = %label, "Endpoint not found, trying next variant");
            }
            Err(err) => {
                debug!(endpoint = %label, error = %err, "Endpoint failed, trying next variant");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) if !answered => Err(err),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_endpoint() {
        let endpoint = Endpoint::parse("post /ecom/v1/orders/get").unwrap();
        assert_eq!(endpoint.method, HttpMethod::Post);
        assert_eq!(endpoint.path_template, "/ecom/v1/orders/get");

        assert_eq!(Endpoint::parse("/a/{id}").unwrap().method, HttpMethod::Get);
        assert!(Endpoint::parse("DELETE /a").is_err());
        assert!(Endpoint::parse("GET a/b").is_err());
    }

    #[test]
    fn test_render_encodes_values() {
        let endpoint = Endpoint::get("/payments/v1/payments/{id}");
        assert_eq!(endpoint.render(&[("id", "abc 1/2")]), "/payments/v1/payments/abc%201%2F2");
        assert_eq!(endpoint.render(&[]), "/payments/v1/payments/{id}");
    }

    #[test]
    fn test_endpoint_set_from_toml() {
        let set: EndpointSet = toml::from_str(
            r#"
            payment_by_id = ["GET /v3/payments/{id}"]
            "#,
        )
        .unwrap();
        assert_eq!(set.payment_by_id, vec![Endpoint::get("/v3/payments/{id}")]);
        assert_eq!(set.order_detail.len(), 3);
        assert_eq!(set.order_detail[1].method, HttpMethod::Post);
        assert!(set.validate().is_ok());
    }

    #[test]
    fn test_empty_family_rejected() {
        let set = EndpointSet {
            payment_query: Vec::new(),
            ..Default::default()
        };
        assert!(set.validate().is_err());
    }

    #[tokio::test]
    async fn test_probe_skips_404_and_empty() {
        let endpoints = default_payment_by_id();
        let calls = AtomicUsize::new(0);

        let found = probe(&endpoints, |endpoint| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                match n {
                    0 => Err(SyncError::upstream(404, "gone")),
                    1 => Ok(None),
                    _ => Ok(Some(json!({"path": endpoint.path_template}))),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(found, Some(json!({"path": "/ecom/v1/payments/{id}"})));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_probe_stops_at_first_hit() {
        let endpoints = default_payment_by_id();
        let calls = AtomicUsize::new(0);

        let found = probe(&endpoints, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(Some(json!({"id": "p1"}))) }
        })
        .await
        .unwrap();

        assert!(found.is_some());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_probe_error_only_when_nothing_answered() {
        let endpoints = default_payment_query();

        let err = probe(&endpoints, |_| async { Err(SyncError::upstream(500, "boom")) })
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(500));

        let calls = AtomicUsize::new(0);
        let none = probe(&endpoints, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(SyncError::upstream(500, "boom"))
                } else {
                    Ok(None)
                }
            }
        })
        .await
        .unwrap();
        assert!(none.is_none());

        let all_missing = probe(&endpoints, |_| async { Err(SyncError::upstream(404, "")) })
            .await
            .unwrap();
        assert!(all_missing.is_none());
    }
}
