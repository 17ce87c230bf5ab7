//! # fiskal-sync: Sync Engine for Fiskal
//!
//! Pulls orders from the upstream store API, enriches them with payment data,
//! mirrors them into the tenant store and issues fiscal receipts.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Pipeline                                    │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                SyncOrchestrator (orchestrator.rs)                │  │
//! │  │                                                                  │  │
//! │  │  Bounded pages per run, offset resumption via sync_state         │  │
//! │  │  Same per-order pipeline for backfill, incremental and webhooks  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │ OrderSource    │  │ PaymentResolver│  │  ReceiptIssuer         │    │
//! │  │                │  │                │  │                        │    │
//! │  │ UpstreamClient │  │ batch, detail, │  │ eligibility, MAX+1     │    │
//! │  │ reqwest, token │  │ transactions,  │  │ numbering, refunds,    │    │
//! │  │ cache, endpoint│  │ payment query, │  │ cancel, renumber       │    │
//! │  │ probing        │  │ payment by id  │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └────────────────────────┘    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Upstream
//! - [`auth`] - Per-tenant access token cache
//! - [`client`] - HTTP implementation of [`OrderSource`]
//! - [`endpoints`] - Endpoint descriptors and variant probing
//! - [`source`] - The [`OrderSource`] trait and page types
//!
//! ### Pipeline
//! - [`enrichment`] - Payment and order metadata resolution
//! - [`issuance`] - Sale and refund receipts
//! - [`orchestrator`] - Sync runs and per-order processing
//! - [`webhook`] - Pushed order events
//!
//! ### Support
//! - [`config`] - `fiskal.toml` plus environment overrides
//! - [`error`] - Sync error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use fiskal_sync::{FiskalConfig, SyncOptions, SyncOrchestrator, UpstreamClient};
//!
//! let config = FiskalConfig::load(None)?;
//! let db = fiskal_db::Database::new(config.database.to_db_config()).await?;
//! let client = UpstreamClient::new(&config.upstream, &config.tenants)?;
//! let sync = SyncOrchestrator::new(db, Arc::new(client));
//!
//! let options = SyncOptions::incremental(&config.sync, config.upstream.page_size, chrono::Utc::now());
//! for tenant in &config.tenants {
//!     let report = sync.run(&tenant.id, &tenant.fiscal, &options).await?;
//!     println!("{}: {} receipts", tenant.id, report.receipts_issued);
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

// Upstream
pub mod auth;
pub mod client;
pub mod endpoints;
pub mod source;

// Pipeline
pub mod enrichment;
pub mod issuance;
pub mod orchestrator;
pub mod webhook;

// Support
pub mod config;
pub mod error;

#[cfg(test)]
pub(crate) mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use auth::{TokenCache, TokenInfo};
pub use client::UpstreamClient;
pub use config::{FiskalConfig, SyncSettings, TenantConfig, UpstreamSettings};
pub use endpoints::{Endpoint, EndpointSet};
pub use enrichment::{EnrichmentOutcome, PaymentResolver};
pub use error::{SyncError, SyncResult};
pub use issuance::{IssueOutcome, ReceiptIssuer, Reconciliation};
pub use orchestrator::{OrderOutcome, SyncOptions, SyncOrchestrator, SyncRunReport};
pub use source::{OrderSource, OrdersPage, PageRequest};
pub use webhook::unwrap_order_payload;
