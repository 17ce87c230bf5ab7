//! # Order Repository
//!
//! Mirrored upstream orders, one row per `(tenant_id, id)`.
//!
//! ## Upsert Semantics
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  upsert(tenant, order)            one transaction                       │
//! │                                                                         │
//! │  1. read stored metadata (if the row exists)                            │
//! │  2. merge: stored ⊕ incoming, incoming values win, keys accumulate      │
//! │  3. INSERT .. ON CONFLICT(tenant_id, id) DO UPDATE SET <every column>   │
//! │                                                                         │
//! │  Every derived column is overwritten (upstream is the source of         │
//! │  truth). Metadata is the one column that accumulates, so enrichment     │
//! │  already paid for is not lost when a later sighting omits it.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use crate::repository::begin_write;
use fiskal_core::{CanonicalOrder, LifecycleStatus, Order, PaymentStatus, Provenance};

const ORDER_COLUMNS: &str = r#"
    tenant_id, id, number, lifecycle_status, payment_status,
    created_at, updated_at, paid_at, currency,
    subtotal_cents, tax_cents, shipping_cents, discount_cents, total_cents,
    refunded_cents, last_refund_id, customer_name, customer_email,
    delivery_method, shipping_address, transaction_ref, payment_id,
    payment_method, is_cod, provenance, raw_payload, metadata, synced_at
"#;

/// Row shape of the `orders` table.
#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    tenant_id: String,
    id: String,
    number: Option<String>,
    lifecycle_status: LifecycleStatus,
    payment_status: PaymentStatus,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    paid_at: Option<DateTime<Utc>>,
    currency: Option<String>,
    subtotal_cents: Option<i64>,
    tax_cents: Option<i64>,
    shipping_cents: Option<i64>,
    discount_cents: Option<i64>,
    total_cents: Option<i64>,
    refunded_cents: Option<i64>,
    last_refund_id: Option<String>,
    customer_name: String,
    customer_email: Option<String>,
    delivery_method: Option<String>,
    shipping_address: Option<String>,
    transaction_ref: Option<String>,
    payment_id: Option<String>,
    payment_method: Option<String>,
    is_cod: bool,
    provenance: Provenance,
    raw_payload: String,
    metadata: String,
    synced_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = DbError;

    fn try_from(row: OrderRow) -> DbResult<Self> {
        let shipping_address = row
            .shipping_address
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DbError::invalid_json("orders.shipping_address", e))?;
        let raw_payload = serde_json::from_str(&row.raw_payload)
            .map_err(|e| DbError::invalid_json("orders.raw_payload", e))?;
        let metadata = serde_json::from_str(&row.metadata)
            .map_err(|e| DbError::invalid_json("orders.metadata", e))?;

        Ok(Order {
            tenant_id: row.tenant_id,
            synced_at: row.synced_at,
            order: CanonicalOrder {
                id: row.id,
                number: row.number,
                lifecycle_status: row.lifecycle_status,
                payment_status: row.payment_status,
                created_at: row.created_at,
                updated_at: row.updated_at,
                paid_at: row.paid_at,
                currency: row.currency,
                subtotal_cents: row.subtotal_cents,
                tax_cents: row.tax_cents,
                shipping_cents: row.shipping_cents,
                discount_cents: row.discount_cents,
                total_cents: row.total_cents,
                refunded_cents: row.refunded_cents,
                last_refund_id: row.last_refund_id,
                customer_name: row.customer_name,
                customer_email: row.customer_email,
                delivery_method: row.delivery_method,
                shipping_address,
                transaction_ref: row.transaction_ref,
                payment_id: row.payment_id,
                payment_method: row.payment_method,
                is_cod: row.is_cod,
                provenance: row.provenance,
                raw_payload,
                metadata,
            },
        })
    }
}

/// Merges `incoming` into `stored`. Nested objects merge key by key,
/// incoming non-null values win, everything else is replaced.
pub fn merge_metadata(stored: Value, incoming: &Value) -> Value {
    match (stored, incoming) {
        (Value::Object(mut base), Value::Object(update)) => {
            for (key, value) in update {
                if value.is_null() {
                    continue;
                }
                let merged = match base.remove(key) {
                    Some(existing) => merge_metadata(existing, value),
                    None => value.clone(),
                };
                base.insert(key.clone(), merged);
            }
            Value::Object(base)
        }
        (stored, Value::Null) => stored,
        (_, other) => other.clone(),
    }
}

/// Repository for order database operations.
#[derive(Debug, Clone)]
pub struct OrderRepository {
    pool: SqlitePool,
}

impl OrderRepository {
    /// Creates a new OrderRepository.
    pub fn new(pool: SqlitePool) -> Self {
        OrderRepository { pool }
    }

    /// Gets an order by upstream id.
    pub async fn get(&self, tenant_id: &str, id: &str) -> DbResult<Option<Order>> {
        let sql = format!("SELECT {ORDER_COLUMNS} FROM orders WHERE tenant_id = ?1 AND id = ?2");
        let row: Option<OrderRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Order::try_from).transpose()
    }

    /// Inserts or overwrites an order, merging metadata with what is stored.
    ///
    /// ## Atomicity
    /// The metadata read and the row write share one transaction, so a
    /// failure leaves the previous row untouched.
    pub async fn upsert(&self, tenant_id: &str, order: &CanonicalOrder) -> DbResult<Order> {
        debug!(tenant_id = %tenant_id, order_id = %order.id, "Upserting order");

        if order.id.is_empty() {
            return Err(DbError::QueryFailed("order id must not be empty".to_string()));
        }

        let mut tx = begin_write(&self.pool).await?;

        let stored: Option<String> =
            sqlx::query_scalar("SELECT metadata FROM orders WHERE tenant_id = ?1 AND id = ?2")
                .bind(tenant_id)
                .bind(&order.id)
                .fetch_optional(&mut *tx)
                .await?;

        let stored = match stored {
            Some(text) => serde_json::from_str(&text)
                .map_err(|e| DbError::invalid_json("orders.metadata", e))?,
            None => Value::Object(serde_json::Map::new()),
        };
        let metadata = merge_metadata(stored, &order.metadata);

        let shipping_address = order
            .shipping_address
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DbError::invalid_json("orders.shipping_address", e))?;
        let raw_payload = serde_json::to_string(&order.raw_payload)
            .map_err(|e| DbError::invalid_json("orders.raw_payload", e))?;
        let metadata_text = serde_json::to_string(&metadata)
            .map_err(|e| DbError::invalid_json("orders.metadata", e))?;
        let synced_at = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO orders (
                tenant_id, id, number, lifecycle_status, payment_status,
                created_at, updated_at, paid_at, currency,
                subtotal_cents, tax_cents, shipping_cents, discount_cents, total_cents,
                refunded_cents, last_refund_id, customer_name, customer_email,
                delivery_method, shipping_address, transaction_ref, payment_id,
                payment_method, is_cod, provenance, raw_payload, metadata, synced_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5,
                ?6, ?7, ?8, ?9,
                ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18,
                ?19, ?20, ?21, ?22,
                ?23, ?24, ?25, ?26, ?27, ?28
            )
            ON CONFLICT (tenant_id, id) DO UPDATE SET
                number = excluded.number,
                lifecycle_status = excluded.lifecycle_status,
                payment_status = excluded.payment_status,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                paid_at = excluded.paid_at,
                currency = excluded.currency,
                subtotal_cents = excluded.subtotal_cents,
                tax_cents = excluded.tax_cents,
                shipping_cents = excluded.shipping_cents,
                discount_cents = excluded.discount_cents,
                total_cents = excluded.total_cents,
                refunded_cents = excluded.refunded_cents,
                last_refund_id = excluded.last_refund_id,
                customer_name = excluded.customer_name,
                customer_email = excluded.customer_email,
                delivery_method = excluded.delivery_method,
                shipping_address = excluded.shipping_address,
                transaction_ref = excluded.transaction_ref,
                payment_id = excluded.payment_id,
                payment_method = excluded.payment_method,
                is_cod = excluded.is_cod,
                provenance = excluded.provenance,
                raw_payload = excluded.raw_payload,
                metadata = excluded.metadata,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(tenant_id)
        .bind(&order.id)
        .bind(&order.number)
        .bind(order.lifecycle_status)
        .bind(order.payment_status)
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.paid_at)
        .bind(&order.currency)
        .bind(order.subtotal_cents)
        .bind(order.tax_cents)
        .bind(order.shipping_cents)
        .bind(order.discount_cents)
        .bind(order.total_cents)
        .bind(order.refunded_cents)
        .bind(&order.last_refund_id)
        .bind(&order.customer_name)
        .bind(&order.customer_email)
        .bind(&order.delivery_method)
        .bind(shipping_address)
        .bind(&order.transaction_ref)
        .bind(&order.payment_id)
        .bind(&order.payment_method)
        .bind(order.is_cod)
        .bind(order.provenance)
        .bind(raw_payload)
        .bind(metadata_text)
        .bind(synced_at)
        .execute(&mut *tx)
        .await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let mut stored = order.clone();
        stored.metadata = metadata;
        Ok(Order {
            tenant_id: tenant_id.to_string(),
            order: stored,
            synced_at,
        })
    }

    /// Orders created in `[start, end)`, oldest first.
    pub async fn list_in_range(
        &self,
        tenant_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Order>> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders
             WHERE tenant_id = ?1 AND created_at >= ?2 AND created_at < ?3
             ORDER BY created_at ASC, id ASC"
        );
        let rows: Vec<OrderRow> = sqlx::query_as(&sql)
            .bind(tenant_id)
            .bind(start)
            .bind(end)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(Order::try_from).collect()
    }

    /// Counts a tenant's orders.
    pub async fn count(&self, tenant_id: &str) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE tenant_id = ?1")
            .bind(tenant_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
