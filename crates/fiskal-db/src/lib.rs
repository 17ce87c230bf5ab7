//! # fiskal-db: Database Layer for Fiskal
//!
//! Per-tenant SQLite storage for mirrored orders, fiscal receipts and sync
//! progress, using sqlx for async operations.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Fiskal Data Flow                                 │
//! │                                                                         │
//! │  fiskal-sync (orchestrator, issuance, webhook ingress)                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fiskal-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ OrderRepo     │    │ 001_initial  │  │   │
//! │  │   │ SqlitePool    │◄───│ ReceiptRepo   │    │ _schema.sql  │  │   │
//! │  │   │               │    │ SyncStateRepo │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite file (path from fiskal.toml [database])                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`repository`] - Order, receipt and sync state repositories
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiskal_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fiskal.db")).await?;
//! let order = db.orders().get("tenant-1", "order-id").await?;
//! let january = db.receipts().list_for_month("tenant-1", 2024, 1).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::order::OrderRepository;
pub use repository::receipt::{DeleteOutcome, NewReceipt, ReceiptRepository};
pub use repository::sync_state::SyncStateRepository;
