//! # Upstream Authentication
//!
//! Per-tenant access tokens for the upstream store API, cached until they
//! are close to expiry.
//!
//! ## Token Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Token Acquisition Flow                             │
//! │                                                                         │
//! │  ┌────────────────┐     ┌─────────────────┐                            │
//! │  │ UpstreamClient │     │  OAuth endpoint │                            │
//! │  └───────┬────────┘     └────────┬────────┘                            │
//! │          │ token(tenant)         │                                      │
//! │          │  cache hit, > margin left → return cached                   │
//! │          │                       │                                      │
//! │          │  1. client_credentials (app id/secret + instance id)        │
//! │          │     or refresh_token  │                                      │
//! │          │──────────────────────►│                                      │
//! │          │  2. access_token, expires_in                                │
//! │          │◄──────────────────────│                                      │
//! │          │  3. store in cache[tenant]                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! One [`TokenCache`] is built per process and shared by reference; tenants
//! never see each other's tokens. Each tenant has its own slot lock, so a
//! slow grant for one tenant never holds up another.

use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::TenantConfig;
use crate::error::{truncate_body, SyncError, SyncResult};

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 300;

/// Upper bound on a token lifetime taken from upstream.
const MAX_EXPIRES_IN_SECS: u64 = 60 * 60 * 24 * 30;

/// A cached access token.
#[derive(Debug, Clone)]
pub struct TokenInfo {
    pub access_token: String,
    pub expires_at: Instant,
    /// Rotated refresh token, when the grant returned one.
    pub refresh_token: Option<String>,
}

impl TokenInfo {
    /// True when fewer than `margin` remain.
    pub fn needs_refresh(&self, margin: Duration) -> bool {
        Instant::now() + margin >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining_secs(&self) -> u64 {
        self.expires_at.saturating_duration_since(Instant::now()).as_secs()
    }
}

/// Which OAuth grant a request uses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    ClientCredentials { instance_id: String },
    RefreshToken { refresh_token: String },
}

impl Grant {
    /// Picks the grant for a tenant.
    ///
    /// A rotated refresh token from an earlier grant wins over the configured
    /// one; the client-credentials grant is used whenever an instance id is
    /// configured and no refresh token is on hand.
    pub fn for_tenant(tenant: &TenantConfig, rotated: Option<&str>) -> SyncResult<Self> {
        if let Some(refresh_token) = rotated {
            return Ok(Grant::RefreshToken {
                refresh_token: refresh_token.to_string(),
            });
        }
        if let Some(instance_id) = &tenant.instance_id {
            return Ok(Grant::ClientCredentials {
                instance_id: instance_id.clone(),
            });
        }
        match &tenant.credentials.refresh_token {
            Some(refresh_token) => Ok(Grant::RefreshToken {
                refresh_token: refresh_token.clone(),
            }),
            None => Err(SyncError::Auth(format!(
                "tenant '{}' has neither instance_id nor refresh_token",
                tenant.id
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Grant::ClientCredentials { .. } => "client_credentials",
            Grant::RefreshToken { .. } => "refresh_token",
        }
    }

    /// JSON body posted to the token endpoint.
    pub fn request_body(&self, tenant: &TenantConfig) -> Value {
        let mut body = json!({
            "grant_type": self.name(),
            "client_id": tenant.credentials.app_id,
            "client_secret": tenant.credentials.app_secret,
        });
        match self {
            Grant::ClientCredentials { instance_id } => {
                body["instance_id"] = json!(instance_id);
            }
            Grant::RefreshToken { refresh_token } => {
                body["refresh_token"] = json!(refresh_token);
            }
        }
        body
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
}

/// Parses a token endpoint response body.
pub fn parse_token_response(body: &str) -> SyncResult<TokenInfo> {
    let response: TokenResponse = serde_json::from_str(body)
        .map_err(|e| SyncError::Auth(format!("unreadable token response: {e}")))?;

    let access_token = response
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| SyncError::Auth("token response has no access_token".into()))?;

    let expires_in = response
        .expires_in
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
        .min(MAX_EXPIRES_IN_SECS);

    Ok(TokenInfo {
        access_token,
        expires_at: Instant::now() + Duration::from_secs(expires_in),
        refresh_token: response.refresh_token,
    })
}

// =============================================================================
// Token Cache
// =============================================================================

type TokenSlot = Arc<Mutex<Option<TokenInfo>>>;

/// Per-tenant token cache.
///
/// The map lock is only held to find a tenant's slot; the slot lock is held
/// across a grant request so concurrent callers for one tenant share it.
pub struct TokenCache {
    http: reqwest::Client,
    auth_url: String,
    margin: Duration,
    slots: RwLock<HashMap<String, TokenSlot>>,
}

impl TokenCache {
    pub fn new(http: reqwest::Client, auth_url: impl Into<String>, margin: Duration) -> Self {
        TokenCache {
            http,
            auth_url: auth_url.into(),
            margin,
            slots: RwLock::new(HashMap::new()),
        }
    }

    async fn slot(&self, tenant_id: &str) -> TokenSlot {
        if let Some(slot) = self.slots.read().await.get(tenant_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .await
            .entry(tenant_id.to_string())
            .or_default()
            .clone()
    }

    /// Returns a valid access token for the tenant, fetching one if needed.
    pub async fn token(&self, tenant: &TenantConfig) -> SyncResult<String> {
        let slot = self.slot(&tenant.id).await;
        let mut cached = slot.lock().await;

        // Another task may have refreshed while we waited for the slot
        let rotated = match cached.as_ref() {
            Some(token) if !token.needs_refresh(self.margin) => {
                debug!(tenant_id = %tenant.id, remaining_secs = token.remaining_secs(), "Using cached token");
                return Ok(token.access_token.clone());
            }
            Some(token) => token.refresh_token.clone(),
            None => None,
        };

        let fresh = match rotated {
            Some(refresh_token) => match self.request(tenant, &Grant::RefreshToken { refresh_token }).await {
                Ok(token) => token,
                Err(err) => {
                    warn!(tenant_id = %tenant.id, error = %err, "Token refresh failed, requesting a new grant");
                    self.request(tenant, &Grant::for_tenant(tenant, None)?).await?
                }
            },
            None => self.request(tenant, &Grant::for_tenant(tenant, None)?).await?,
        };

        info!(
            tenant_id = %tenant.id,
            expires_in_secs = fresh.remaining_secs(),
            "Obtained upstream access token"
        );
        let access_token = fresh.access_token.clone();
        *cached = Some(fresh);
        Ok(access_token)
    }

    /// Drops a tenant's cached token, e.g. after a 401.
    pub async fn invalidate(&self, tenant_id: &str) {
        let Some(slot) = self.slots.read().await.get(tenant_id).cloned() else {
            return;
        };
        if slot.lock().await.take().is_some() {
            debug!(tenant_id = %tenant_id, "Cached token invalidated");
        }
    }

    async fn request(&self, tenant: &TenantConfig, grant: &Grant) -> SyncResult<TokenInfo> {
        debug!(tenant_id = %tenant.id, grant = grant.name(), "Requesting access token");

        let response = self
            .http
            .post(&self.auth_url)
            .json(&grant.request_body(tenant))
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(SyncError::Auth(format!(
                "{} grant returned {}: {}",
                grant.name(),
                status.as_u16(),
                truncate_body(&body)
            )));
        }

        parse_token_response(&body)
    }

    #[cfg(test)]
    async fn seed(&self, tenant_id: &str, token: TokenInfo) {
        *self.slot(tenant_id).await.lock().await = Some(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantCredentials;

    fn tenant(instance_id: Option<&str>, refresh_token: Option<&str>) -> TenantConfig {
        TenantConfig {
            id: "shop-a".into(),
            instance_id: instance_id.map(str::to_string),
            credentials: TenantCredentials {
                app_id: "app".into(),
                app_secret: "secret".into(),
                refresh_token: refresh_token.map(str::to_string),
            },
            fiscal: Default::default(),
        }
    }

    fn token_expiring_in(secs: u64) -> TokenInfo {
        TokenInfo {
            access_token: "cached".into(),
            expires_at: Instant::now() + Duration::from_secs(secs),
            refresh_token: None,
        }
    }

    #[test]
    fn test_token_needs_refresh_inside_margin() {
        let margin = Duration::from_secs(60);
        assert!(token_expiring_in(30).needs_refresh(margin));
        assert!(!token_expiring_in(30).is_expired());
        assert!(!token_expiring_in(3600).needs_refresh(margin));
    }

    #[test]
    fn test_grant_selection() {
        let grant = Grant::for_tenant(&tenant(Some("inst"), None), None).unwrap();
        assert_eq!(grant, Grant::ClientCredentials { instance_id: "inst".into() });

        let grant = Grant::for_tenant(&tenant(None, Some("rt")), None).unwrap();
        assert_eq!(grant.name(), "refresh_token");

        let grant = Grant::for_tenant(&tenant(Some("inst"), None), Some("rotated")).unwrap();
        assert_eq!(grant, Grant::RefreshToken { refresh_token: "rotated".into() });

        assert!(Grant::for_tenant(&tenant(None, None), None).is_err());
    }

    #[test]
    fn test_request_body() {
        let t = tenant(Some("inst"), None);
        let body = Grant::for_tenant(&t, None).unwrap().request_body(&t);
        assert_eq!(body["grant_type"], "client_credentials");
        assert_eq!(body["client_id"], "app");
        assert_eq!(body["instance_id"], "inst");
        assert!(body.get("refresh_token").is_none());
    }

    #[test]
    fn test_parse_token_response() {
        let token = parse_token_response(r#"{"access_token":"abc","expires_in":14400}"#).unwrap();
        assert_eq!(token.access_token, "abc");
        assert!(token.remaining_secs() > 14000);

        assert!(parse_token_response(r#"{"expires_in":10}"#).is_err());

        let huge = parse_token_response(r#"{"access_token":"a","expires_in":18446744073709551615}"#).unwrap();
        assert!(huge.remaining_secs() <= MAX_EXPIRES_IN_SECS);
        assert!(!huge.needs_refresh(Duration::from_secs(60)));
        assert!(parse_token_response("<html>").is_err());
    }

    #[tokio::test]
    async fn test_cached_token_served_without_request() {
        // Unroutable auth URL: any network attempt would fail the test
        let cache = TokenCache::new(reqwest::Client::new(), "http://127.0.0.1:9/token", Duration::from_secs(60));
        cache.seed("shop-a", token_expiring_in(3600)).await;

        let token = cache.token(&tenant(Some("inst"), None)).await.unwrap();
        assert_eq!(token, "cached");

        cache.invalidate("shop-a").await;
        assert!(cache.token(&tenant(Some("inst"), None)).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_grant_does_not_block_other_tenants() {
        // Accepts connections but never answers, so the grant hangs
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let auth_url = format!("http://{}/token", listener.local_addr().unwrap());
        let cache = TokenCache::new(reqwest::Client::new(), auth_url, Duration::from_secs(60));

        let mut other = tenant(Some("inst"), None);
        other.id = "shop-b".into();
        cache.seed("shop-b", token_expiring_in(3600)).await;

        let stalled_tenant = tenant(Some("inst"), None);
        let stalled = cache.token(&stalled_tenant);
        tokio::pin!(stalled);
        tokio::select! {
            _ = &mut stalled => panic!("grant against a silent server completed"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }

        let token = tokio::time::timeout(Duration::from_secs(2), cache.token(&other))
            .await
            .expect("other tenant waited on the stalled grant")
            .unwrap();
        assert_eq!(token, "cached");
        drop(listener);
    }
}
