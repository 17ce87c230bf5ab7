//! # Repository Module
//!
//! Database repository implementations for Fiskal.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Sync orchestrator / issuance engine                                    │
//! │       │                                                                 │
//! │       │  db.receipts().insert_next(&new_receipt)                        │
//! │       ▼                                                                 │
//! │  ReceiptRepository                                                      │
//! │  ├── get / find_by_dedupe / list_for_month                              │
//! │  ├── insert_next / insert_refund                                        │
//! │  └── delete_unreferenced / renumber                                     │
//! │       │                                                                 │
//! │       │  SQL Query                                                      │
//! │       ▼                                                                 │
//! │  SQLite Database                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`OrderRepository`](order::OrderRepository) - Mirrored orders, idempotent upsert
//! - [`ReceiptRepository`](receipt::ReceiptRepository) - Numbering, refunds, renumbering
//! - [`SyncStateRepository`](sync_state::SyncStateRepository) - Resumption offsets

pub mod order;
pub mod receipt;
pub mod sync_state;

use sqlx::{Sqlite, SqlitePool, Transaction};

use crate::error::{DbError, DbResult};

/// Opens a transaction holding the write lock from its first statement.
///
/// A deferred `BEGIN` that reads before it writes cannot wait for the lock
/// on upgrade (SQLite returns `SQLITE_BUSY` without consulting
/// `busy_timeout`), so every read-then-write path starts here.
pub(crate) async fn begin_write(pool: &SqlitePool) -> DbResult<Transaction<'static, Sqlite>> {
    pool.begin_with("BEGIN IMMEDIATE")
        .await
        .map_err(|e| DbError::TransactionFailed(e.to_string()))
}
