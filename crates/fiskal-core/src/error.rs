//! # Error Types
//!
//! Domain-specific error types for fiskal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fiskal-core errors (this file)                                        │
//! │  ├── CoreError        - Receipt/refund rule violations                 │
//! │  └── ValidationError  - Input validation failures                      │
//! │                                                                         │
//! │  fiskal-db errors                                                      │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fiskal-sync errors                                                    │
//! │  └── SyncError        - Upstream, config and orchestration failures    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → SyncError → SyncRunReport.errors  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Normalization has no error type at all: the normalizer is total.

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Receipt and refund rule violations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A refund was requested for an order that has no sale receipt.
    #[error("Order {order_id} has no sale receipt to refund")]
    NoSaleReceipt { order_id: String },

    /// The refund would exceed what is still refundable on the sale receipt.
    ///
    /// ## When This Occurs
    /// - A partial refund larger than the original total
    /// - A second full refund after the first one already zeroed the balance
    #[error("Refund of {requested} cents exceeds remaining {remaining} cents for order {order_id}")]
    RefundExceedsRemaining {
        order_id: String,
        requested: i64,
        remaining: i64,
    },

    /// A sale receipt cannot be cancelled while refunds still reference it.
    #[error("Receipt {receipt_id} is referenced by {refunds} refund receipt(s)")]
    ReceiptHasRefunds { receipt_id: i64, refunds: usize },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Input validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Invalid format (e.g., a fiscal store id with spaces).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },
}

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;
