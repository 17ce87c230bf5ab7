//! # Sync State Repository
//!
//! One resumption row per tenant. Written after every page so a crashed or
//! capped run resumes from the last persisted offset.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use fiskal_core::{SyncState, SyncStatus};

#[derive(Debug, sqlx::FromRow)]
struct SyncStateRow {
    tenant_id: String,
    status: SyncStatus,
    window_start: Option<DateTime<Utc>>,
    next_offset: i64,
    cursor: Option<String>,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<SyncStateRow> for SyncState {
    fn from(row: SyncStateRow) -> Self {
        SyncState {
            tenant_id: row.tenant_id,
            status: row.status,
            window_start: row.window_start,
            next_offset: row.next_offset,
            cursor: row.cursor,
            last_error: row.last_error,
            updated_at: row.updated_at,
        }
    }
}

/// Repository for per-tenant sync progress.
#[derive(Debug, Clone)]
pub struct SyncStateRepository {
    pool: SqlitePool,
}

impl SyncStateRepository {
    /// Creates a new SyncStateRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SyncStateRepository { pool }
    }

    pub async fn get(&self, tenant_id: &str) -> DbResult<Option<SyncState>> {
        let row: Option<SyncStateRow> = sqlx::query_as(
            r#"
            SELECT tenant_id, status, window_start, next_offset, cursor, last_error, updated_at
            FROM sync_state
            WHERE tenant_id = ?1
            "#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SyncState::from))
    }

    /// Inserts or replaces the tenant's state.
    pub async fn save(&self, state: &SyncState) -> DbResult<()> {
        debug!(
            tenant_id = %state.tenant_id,
            status = ?state.status,
            next_offset = state.next_offset,
            "Saving sync state"
        );

        sqlx::query(
            r#"
            INSERT INTO sync_state (
                tenant_id, status, window_start, next_offset, cursor, last_error, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT (tenant_id) DO UPDATE SET
                status = excluded.status,
                window_start = excluded.window_start,
                next_offset = excluded.next_offset,
                cursor = excluded.cursor,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.tenant_id)
        .bind(state.status)
        .bind(state.window_start)
        .bind(state.next_offset)
        .bind(&state.cursor)
        .bind(&state.last_error)
        .bind(state.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Forgets a tenant's progress so the next run starts at offset 0.
    pub async fn reset(&self, tenant_id: &str) -> DbResult<bool> {
        let deleted = sqlx::query("DELETE FROM sync_state WHERE tenant_id = ?1")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }
}
