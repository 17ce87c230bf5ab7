//! # Fiskal Configuration
//!
//! Configuration for the database, the upstream API, sync scheduling and the
//! connected tenants.
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FISKAL_DATABASE_PATH, FISKAL_API_BASE_URL, FISKAL_AUTH_URL,        │
//! │     FISKAL_PAGE_SIZE, FISKAL_MAX_PAGES, FISKAL_SYNC_INTERVAL_SECS      │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     explicit path, else $FISKAL_CONFIG, else                           │
//! │     ~/.config/fiskal/fiskal.toml (Linux)                               │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [database]
//! path = "/var/lib/fiskal/fiskal.db"
//!
//! [upstream]
//! base_url = "https://www.wixapis.com"
//! auth_url = "https://www.wixapis.com/oauth2/token"
//! page_size = 100
//!
//! [sync]
//! max_pages = 10
//! backfill_start = "2023-01-01"
//! incremental_window_days = 3
//! interval_secs = 300
//!
//! [[tenants]]
//! id = "shop-sofia"
//! instance_id = "5f0c..."
//!
//! [tenants.credentials]
//! app_id = "..."
//! app_secret = "..."
//!
//! [tenants.fiscal]
//! fiscal_store_id = "RF0001234"
//! receipts_start_date = "2024-01-01"
//! cod_receipts_enabled = false
//! ```

use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use fiskal_core::validation::validate_fiscal_settings;
use fiskal_core::FiscalSettings;
use fiskal_db::DbConfig;

use crate::endpoints::EndpointSet;
use crate::error::{SyncError, SyncResult};

/// Largest page the upstream order query accepts.
pub const MAX_PAGE_SIZE: u32 = 100;

// =============================================================================
// Database Settings
// =============================================================================

/// Where the SQLite file lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> PathBuf {
    directories::ProjectDirs::from("com", "fiskal", "fiskal")
        .map(|dirs| dirs.data_dir().join("fiskal.db"))
        .unwrap_or_else(|| PathBuf::from("fiskal.db"))
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseSettings {
    pub fn to_db_config(&self) -> DbConfig {
        DbConfig::new(self.path.clone()).max_connections(self.max_connections)
    }
}

// =============================================================================
// Upstream Settings
// =============================================================================

/// Upstream store API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// API root every endpoint path is joined onto.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// OAuth token endpoint.
    #[serde(default = "default_auth_url")]
    pub auth_url: String,

    /// Per-request timeout (seconds).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Orders per page (1..=100).
    #[serde(default = "default_page_size")]
    pub page_size: u32,

    /// Refresh a cached token when fewer than this many seconds remain.
    #[serde(default = "default_refresh_margin")]
    pub token_refresh_margin_secs: u64,

    /// Endpoint variants, in probe order.
    #[serde(default)]
    pub endpoints: EndpointSet,
}

fn default_base_url() -> String {
    "https://www.wixapis.com".to_string()
}

fn default_auth_url() -> String {
    "https://www.wixapis.com/oauth2/token".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_refresh_margin() -> u64 {
    60
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        UpstreamSettings {
            base_url: default_base_url(),
            auth_url: default_auth_url(),
            timeout_secs: default_timeout_secs(),
            page_size: default_page_size(),
            token_refresh_margin_secs: default_refresh_margin(),
            endpoints: EndpointSet::default(),
        }
    }
}

impl UpstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.token_refresh_margin_secs)
    }
}

// =============================================================================
// Sync Settings
// =============================================================================

/// Run sizing and scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Pages fetched per invocation before the run stops as `partial`.
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,

    /// Earliest creation date a backfill asks for.
    #[serde(default = "default_backfill_start")]
    pub backfill_start: NaiveDate,

    /// How far back an incremental run looks.
    #[serde(default = "default_incremental_window")]
    pub incremental_window_days: u32,

    /// Repeat interval for the runner; `None` runs once.
    #[serde(default)]
    pub interval_secs: Option<u64>,
}

fn default_max_pages() -> u32 {
    10
}

fn default_backfill_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default()
}

fn default_incremental_window() -> u32 {
    3
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            max_pages: default_max_pages(),
            backfill_start: default_backfill_start(),
            incremental_window_days: default_incremental_window(),
            interval_secs: None,
        }
    }
}

impl SyncSettings {
    /// Start of the incremental window, truncated to midnight UTC.
    ///
    /// Truncating keeps the window stable across runs of the same day so a
    /// partial run can resume.
    pub fn incremental_start(&self, now: chrono::DateTime<Utc>) -> chrono::DateTime<Utc> {
        let day = (now - ChronoDuration::days(i64::from(self.incremental_window_days))).date_naive();
        Utc.from_utc_datetime(&day.and_hms_opt(0, 0, 0).unwrap_or_default())
    }

    pub fn backfill_start_at(&self) -> chrono::DateTime<Utc> {
        Utc.from_utc_datetime(&self.backfill_start.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

// =============================================================================
// Tenants
// =============================================================================

/// App credentials used to obtain a tenant's access token.
///
/// With `instance_id` set on the tenant the client-credentials grant is used;
/// otherwise `refresh_token` must be present.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct TenantCredentials {
    pub app_id: String,
    #[serde(default)]
    pub app_secret: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for TenantCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantCredentials")
            .field("app_id", &self.app_id)
            .field("app_secret", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// One connected store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub id: String,

    /// Upstream app installation id.
    #[serde(default)]
    pub instance_id: Option<String>,

    pub credentials: TenantCredentials,

    #[serde(default)]
    pub fiscal: FiscalSettings,
}

// =============================================================================
// Main Configuration
// =============================================================================

/// Complete Fiskal configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FiskalConfig {
    #[serde(default)]
    pub database: DatabaseSettings,

    #[serde(default)]
    pub upstream: UpstreamSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl FiskalConfig {
    /// Loads configuration from file, environment, and defaults.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (`fiskal.toml`)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> SyncResult<Self> {
        let path = config_path
            .or_else(|| std::env::var("FISKAL_CONFIG").ok().map(PathBuf::from))
            .or_else(Self::default_config_path);

        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                debug!(?path, "Config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        info!(tenants = config.tenants.len(), "Configuration loaded");
        Ok(config)
    }

    /// Parses one TOML file without overrides or validation.
    pub fn from_file(path: &Path) -> SyncResult<Self> {
        info!(?path, "Loading config from file");
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Saves configuration to file.
    pub fn save(&self, config_path: Option<PathBuf>) -> SyncResult<()> {
        let path = config_path
            .or_else(Self::default_config_path)
            .ok_or_else(|| SyncError::ConfigSaveFailed("No config path available".into()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(&path, toml::to_string_pretty(self)?)?;
        info!(?path, "Config saved");
        Ok(())
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SyncResult<()> {
        for (name, raw) in [
            ("upstream.base_url", &self.upstream.base_url),
            ("upstream.auth_url", &self.upstream.auth_url),
        ] {
            let url = Url::parse(raw).map_err(|e| SyncError::InvalidUrl(format!("{name}: {e}")))?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(SyncError::InvalidUrl(format!(
                    "{name} must use http or https, got: {raw}"
                )));
            }
        }

        if self.upstream.page_size == 0 || self.upstream.page_size > MAX_PAGE_SIZE {
            return Err(SyncError::InvalidConfig(format!(
                "upstream.page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        if self.sync.max_pages == 0 {
            return Err(SyncError::InvalidConfig(
                "sync.max_pages must be greater than 0".into(),
            ));
        }
        if self.sync.interval_secs == Some(0) {
            return Err(SyncError::InvalidConfig(
                "sync.interval_secs must be greater than 0".into(),
            ));
        }
        self.upstream.endpoints.validate()?;

        let mut seen = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.trim().is_empty() {
                return Err(SyncError::InvalidConfig("tenant id must not be empty".into()));
            }
            if !seen.insert(tenant.id.as_str()) {
                return Err(SyncError::InvalidConfig(format!(
                    "duplicate tenant id '{}'",
                    tenant.id
                )));
            }
            if tenant.credentials.app_id.trim().is_empty() {
                return Err(SyncError::InvalidConfig(format!(
                    "tenant '{}' has no credentials.app_id",
                    tenant.id
                )));
            }
            if tenant.instance_id.is_none() && tenant.credentials.refresh_token.is_none() {
                return Err(SyncError::InvalidConfig(format!(
                    "tenant '{}' needs instance_id or credentials.refresh_token",
                    tenant.id
                )));
            }
            validate_fiscal_settings(&tenant.fiscal)?;
        }

        Ok(())
    }

    /// Applies `FISKAL_*` overrides read through `var`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var("FISKAL_DATABASE_PATH") {
            debug!(path = %path, "Overriding database path from environment");
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = var("FISKAL_API_BASE_URL") {
            debug!(url = %url, "Overriding API base URL from environment");
            self.upstream.base_url = url;
        }
        if let Some(url) = var("FISKAL_AUTH_URL") {
            self.upstream.auth_url = url;
        }
        if let Some(raw) = var("FISKAL_PAGE_SIZE") {
            match raw.parse() {
                Ok(size) => self.upstream.page_size = size,
                Err(_) => warn!(value = %raw, "Ignoring invalid FISKAL_PAGE_SIZE"),
            }
        }
        if let Some(raw) = var("FISKAL_MAX_PAGES") {
            match raw.parse() {
                Ok(pages) => self.sync.max_pages = pages,
                Err(_) => warn!(value = %raw, "Ignoring invalid FISKAL_MAX_PAGES"),
            }
        }
        if let Some(raw) = var("FISKAL_SYNC_INTERVAL_SECS") {
            match raw.parse() {
                Ok(secs) => self.sync.interval_secs = Some(secs),
                Err(_) => warn!(value = %raw, "Ignoring invalid FISKAL_SYNC_INTERVAL_SECS"),
            }
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "fiskal", "fiskal")
            .map(|dirs| dirs.config_dir().join("fiskal.toml"))
    }

    pub fn tenant(&self, tenant_id: &str) -> Option<&TenantConfig> {
        self.tenants.iter().find(|t| t.id == tenant_id)
    }
}
