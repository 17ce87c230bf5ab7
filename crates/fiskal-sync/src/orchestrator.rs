//! # Sync Orchestrator
//!
//! Drives bounded, resumable sync runs for one tenant.
//!
//! ## Run Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  load sync_state ──► resume offset (same window, not done) or 0         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌──────────── up to max_pages ─────────────────────────────────────┐   │
//! │  │ fetch page ──► batch payments ──► per order:                     │   │
//! │  │                                   normalize → enrich → upsert    │   │
//! │  │                                   → reconcile receipts           │   │
//! │  │ save offset                                                      │   │
//! │  └──────────────────────────────────────────────────────────────────┘   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  done (no more data) | partial (page cap or page failure)               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Backfill and incremental sync are the same run with different
//! [`SyncOptions`]. A failed order is recorded in the report and the page
//! continues; a failed page ends the run as `partial` at the last saved
//! offset.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn, Instrument};
use ts_rs::TS;
use uuid::Uuid;

use fiskal_core::normalize::normalize;
use fiskal_core::payment::PaymentIndex;
use fiskal_core::types::Provenance;
use fiskal_core::{CanonicalOrder, FiscalSettings, SyncState, SyncStatus};
use fiskal_db::Database;

use crate::config::SyncSettings;
use crate::enrichment::{EnrichmentOutcome, PaymentResolver};
use crate::error::{SyncError, SyncResult};
use crate::issuance::{IssueOutcome, ReceiptIssuer, Reconciliation};
use crate::source::{OrderSource, PageRequest};

// =============================================================================
// Options & Report
// =============================================================================

/// Parameters of one run.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncOptions {
    /// Orders created before this instant are not fetched.
    pub start_date: DateTime<Utc>,
    /// Upper bound on pages fetched by one run.
    pub max_pages: u32,
    pub page_size: u32,
    pub payment_status_filter: Option<String>,
    pub provenance: Provenance,
}

impl SyncOptions {
    /// Full history from the configured backfill start.
    pub fn backfill(sync: &SyncSettings, page_size: u32) -> Self {
        SyncOptions {
            start_date: sync.backfill_start_at(),
            max_pages: sync.max_pages,
            page_size,
            payment_status_filter: None,
            provenance: Provenance::Backfill,
        }
    }

    /// The recent window ending at `now`.
    pub fn incremental(sync: &SyncSettings, page_size: u32, now: DateTime<Utc>) -> Self {
        SyncOptions {
            start_date: sync.incremental_start(now),
            ..Self::backfill(sync, page_size)
        }
    }
}

/// Counts reported by one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct SyncRunReport {
    pub run_id: String,
    pub processed: usize,
    pub upserted: usize,
    pub receipts_issued: usize,
    pub refunds_issued: usize,
    pub receipts_skipped: usize,
    /// Skip reason → count.
    pub skip_reasons: BTreeMap<String, usize>,
    pub errors: Vec<String>,
    pub pages_fetched: u32,
    pub next_offset: i64,
    pub status: SyncStatus,
}

impl SyncRunReport {
    fn new(run_id: Uuid, offset: i64) -> Self {
        SyncRunReport {
            run_id: run_id.to_string(),
            processed: 0,
            upserted: 0,
            receipts_issued: 0,
            refunds_issued: 0,
            receipts_skipped: 0,
            skip_reasons: BTreeMap::new(),
            errors: Vec::new(),
            pages_fetched: 0,
            next_offset: offset,
            status: SyncStatus::Running,
        }
    }

    fn record(&mut self, outcome: &OrderOutcome) {
        self.upserted += 1;
        self.count_issue(&outcome.reconciliation.sale, false);
        if let Some(refund) = &outcome.reconciliation.refund {
            self.count_issue(refund, true);
        }
    }

    fn count_issue(&mut self, outcome: &IssueOutcome, refund: bool) {
        match outcome {
            IssueOutcome::Issued(_) if refund => self.refunds_issued += 1,
            IssueOutcome::Issued(_) => self.receipts_issued += 1,
            IssueOutcome::AlreadyExists(_) => {}
            IssueOutcome::Skipped(reason) => {
                self.receipts_skipped += 1;
                *self.skip_reasons.entry(reason.as_str().to_string()).or_default() += 1;
            }
        }
    }
}

/// What the pipeline did with one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderOutcome {
    pub order_id: String,
    pub enrichment: EnrichmentOutcome,
    pub reconciliation: Reconciliation,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs the fetch → normalize → enrich → persist → issue pipeline.
#[derive(Clone)]
pub struct SyncOrchestrator {
    db: Database,
    source: Arc<dyn OrderSource>,
    issuer: ReceiptIssuer,
}

impl SyncOrchestrator {
    pub fn new(db: Database, source: Arc<dyn OrderSource>) -> Self {
        let issuer = ReceiptIssuer::new(db.clone());
        SyncOrchestrator { db, source, issuer }
    }

    pub fn issuer(&self) -> &ReceiptIssuer {
        &self.issuer
    }

    /// Runs one bounded sync for `tenant_id`.
    ///
    /// Page failures end the run as `partial` and are reported, not
    /// returned. `Err` means the tenant store failed; the state is then
    /// marked `error` when possible.
    pub async fn run(
        &self,
        tenant_id: &str,
        settings: &FiscalSettings,
        options: &SyncOptions,
    ) -> SyncResult<SyncRunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", run_id = %run_id, tenant_id = %tenant_id);

        async {
            match self.run_pages(run_id, tenant_id, settings, options).await {
                Ok(report) => Ok(report),
                Err(err) => {
                    error!(error = %err, "Sync run failed");
                    self.record_failure(tenant_id, options, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pages(
        &self,
        run_id: Uuid,
        tenant_id: &str,
        settings: &FiscalSettings,
        options: &SyncOptions,
    ) -> SyncResult<SyncRunReport> {
        let states = self.db.sync_state();
        let window_start = Some(options.start_date);

        let offset = match states.get(tenant_id).await? {
            Some(prev) if prev.status != SyncStatus::Done && prev.window_start == window_start => {
                info!(offset = prev.next_offset, previous = ?prev.status, "Resuming sync");
                prev.next_offset
            }
            _ => 0,
        };

        info!(
            start_date = %options.start_date,
            offset,
            max_pages = options.max_pages,
            "Sync run started"
        );

        let mut state = SyncState {
            tenant_id: tenant_id.to_string(),
            status: SyncStatus::Running,
            window_start,
            next_offset: offset,
            cursor: None,
            last_error: None,
            updated_at: Utc::now(),
        };
        states.save(&state).await?;

        let mut report = SyncRunReport::new(run_id, offset);
        let mut status = SyncStatus::Partial;

        for _ in 0..options.max_pages {
            let request = PageRequest {
                since: Some(options.start_date),
                offset: state.next_offset,
                limit: options.page_size,
                payment_status: options.payment_status_filter.clone(),
            };

            let page = match self.source.fetch_orders_page(tenant_id, &request).await {
                Ok(page) => page,
                Err(err) => {
                    error!(offset = request.offset, error = %err, "Page fetch failed");
                    report
                        .errors
                        .push(format!("page at offset {}: {}", request.offset, err));
                    state.last_error = Some(err.to_string());
                    break;
                }
            };
            report.pages_fetched += 1;

            let orders: Vec<CanonicalOrder> = page
                .orders
                .iter()
                .map(|raw| normalize(raw, options.provenance))
                .collect();
            let batch = self.fetch_batch(tenant_id, &orders).await;

            for order in orders {
                report.processed += 1;
                let order_id = order.id.clone();
                match self.process_order(tenant_id, settings, order, batch.as_ref()).await {
                    Ok(outcome) => report.record(&outcome),
                    Err(err) => {
                        warn!(order_id = %order_id, error = %err, "Order failed");
                        report.errors.push(format!("order {order_id:?}: {err}"));
                    }
                }
            }

            state.next_offset = page.next_offset;
            state.cursor = page.next_cursor;
            state.updated_at = Utc::now();
            states.save(&state).await?;

            debug!(
                next_offset = page.next_offset,
                total = ?page.total,
                has_more = page.has_more,
                "Page processed"
            );

            if !page.has_more {
                status = SyncStatus::Done;
                break;
            }
        }

        state.status = status;
        state.updated_at = Utc::now();
        states.save(&state).await?;

        report.status = status;
        report.next_offset = state.next_offset;

        info!(
            status = ?status,
            processed = report.processed,
            receipts_issued = report.receipts_issued,
            refunds_issued = report.refunds_issued,
            receipts_skipped = report.receipts_skipped,
            errors = report.errors.len(),
            next_offset = report.next_offset,
            "Sync run finished"
        );

        Ok(report)
    }

    /// One bulk payment lookup for a page. Failure means "no batch".
    async fn fetch_batch(&self, tenant_id: &str, orders: &[CanonicalOrder]) -> Option<PaymentIndex> {
        let mut seen = HashSet::new();
        let ids: Vec<String> = orders
            .iter()
            .filter(|o| !o.id.is_empty() && seen.insert(o.id.as_str()))
            .map(|o| o.id.clone())
            .collect();
        if ids.is_empty() {
            return None;
        }

        match self.source.fetch_payments_batch(tenant_id, &ids).await {
            Ok(index) if index.is_empty() => None,
            Ok(index) => Some(index),
            Err(err) => {
                warn!(orders = ids.len(), error = %err, "Batch payment lookup failed");
                None
            }
        }
    }

    /// Enriches, stores and reconciles one normalized order.
    pub(crate) async fn process_order(
        &self,
        tenant_id: &str,
        settings: &FiscalSettings,
        mut order: CanonicalOrder,
        batch: Option<&PaymentIndex>,
    ) -> SyncResult<OrderOutcome> {
        if order.id.is_empty() {
            return Err(SyncError::InvalidRequest("order payload has no id".to_string()));
        }

        let orders = self.db.orders();
        let stored = orders.get(tenant_id, &order.id).await?;

        let enrichment = PaymentResolver::new(self.source.as_ref(), tenant_id)
            .with_batch(batch)
            .enrich(&mut order, stored.as_ref().map(|s| &s.order.metadata))
            .await;

        let saved = orders.upsert(tenant_id, &order).await?;
        let reconciliation = self.issuer.reconcile(tenant_id, &saved.order, settings).await?;

        Ok(OrderOutcome {
            order_id: saved.order.id,
            enrichment,
            reconciliation,
        })
    }

    async fn record_failure(&self, tenant_id: &str, options: &SyncOptions, err: &SyncError) {
        let states = self.db.sync_state();
        let window_start = Some(options.start_date);
        let previous = match states.get(tenant_id).await {
            Ok(prev) => prev.filter(|s| s.window_start == window_start),
            Err(_) => None,
        };

        let state = SyncState {
            tenant_id: tenant_id.to_string(),
            status: SyncStatus::Error,
            window_start,
            next_offset: previous.as_ref().map_or(0, |s| s.next_offset),
            cursor: previous.and_then(|s| s.cursor),
            last_error: Some(err.to_string()),
            updated_at: Utc::now(),
        };
        if let Err(save_err) = states.save(&state).await {
            error!(error = %save_err, "Could not record sync failure");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
