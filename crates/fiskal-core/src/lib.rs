//! # fiskal-core: Pure Business Logic for Fiskal
//!
//! This crate holds everything about orders and fiscal receipts that can be
//! decided without touching a database or the network.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiskal Data Flow                                 │
//! │                                                                         │
//! │  Upstream store API (fiskal-sync)                                       │
//! │       │  raw JSON order / payment payloads                              │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │               ★ fiskal-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌────────────┐  │   │
//! │  │   │ normalize │  │  payment  │  │eligibility│  │ validation │  │   │
//! │  │   │ raw →     │  │ refs, COD │  │ sale /    │  │ refunds,   │  │   │
//! │  │   │ canonical │  │ records   │  │ refund    │  │ settings   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └────────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  fiskal-db (orders, receipts, sync state)                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Canonical order, receipt, sync state and fiscal settings
//! - [`money`] - Integer minor-unit money parsed exactly from upstream decimals
//! - [`json_path`] - Ordered-candidate lookups over loosely typed JSON
//! - [`normalize`] - Raw upstream order → [`CanonicalOrder`] (total, never fails)
//! - [`payment`] - Transaction reference extraction, payment records, COD heuristic
//! - [`eligibility`] - Sale/refund receipt decisions
//! - [`validation`] - Input checks for refunds and fiscal settings
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use fiskal_core::normalize::normalize;
//! use fiskal_core::types::Provenance;
//!
//! let order = normalize(&serde_json::json!({}), Provenance::Backfill);
//! assert_eq!(order.id, "");
//! assert!(order.total_cents.is_none());
//! ```

pub mod eligibility;
pub mod error;
pub mod json_path;
pub mod money;
pub mod normalize;
pub mod payment;
pub mod types;
pub mod validation;

pub use error::{CoreError, CoreResult, ValidationError};
pub use money::Money;
pub use types::*;

/// Sentinel used when no customer name can be resolved from a payload.
pub const UNKNOWN_CUSTOMER: &str = "Unknown";

/// Idempotency key of every sale receipt.
pub const SALE_DEDUPE_KEY: &str = "";

/// Idempotency key of a refund that reverses the whole remaining amount.
pub const FULL_REFUND_KEY: &str = "full";
