//! # Fiskal Sync Runner
//!
//! Syncs orders and issues receipts for every tenant in `fiskal.toml`.
//!
//! ## Usage
//! ```text
//! sync-runner [--config PATH] [--backfill] [--once]
//!
//!   --config PATH   config file (default: FISKAL_CONFIG, then the user
//!                   config directory)
//!   --backfill      sync from [sync].backfill_start instead of the recent
//!                   incremental window
//!   --once          ignore [sync].interval_secs and exit after one pass
//! ```
//!
//! ## Loop
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  load config ──► open database ──► build client (shared token cache)   │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ┌─► run every tenant (failures logged, other tenants continue)        │
//! │  │        │                                                             │
//! │  └── tick ◄── interval_secs set?  ──no──► exit                         │
//! │           ▲                                                             │
//! │           └── Ctrl+C / SIGTERM ends the loop between passes            │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use fiskal_db::Database;
use fiskal_sync::{FiskalConfig, SyncOptions, SyncOrchestrator, UpstreamClient};

/// Which window a pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Incremental,
    Backfill,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RunnerArgs {
    config: Option<PathBuf>,
    mode: Mode,
    once: bool,
}

impl RunnerArgs {
    fn parse(args: impl IntoIterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = RunnerArgs {
            config: None,
            mode: Mode::Incremental,
            once: false,
        };

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                "--backfill" => parsed.mode = Mode::Backfill,
                "--once" => parsed.once = true,
                other => bail!("unknown argument: {other}"),
            }
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = RunnerArgs::parse(std::env::args().skip(1))?;
    let config = FiskalConfig::load(args.config.clone()).context("loading configuration")?;
    info!(
        tenants = config.tenants.len(),
        database = %config.database.path.display(),
        base_url = %config.upstream.base_url,
        mode = ?args.mode,
        "Configuration loaded"
    );

    let db = Database::new(config.database.to_db_config())
        .await
        .context("opening database")?;
    let client = UpstreamClient::new(&config.upstream, &config.tenants)?;
    let sync = SyncOrchestrator::new(db, Arc::new(client));

    let interval = config
        .sync
        .interval_secs
        .filter(|_| !args.once)
        .map(Duration::from_secs);

    let Some(period) = interval else {
        let failed = run_pass(&sync, &config, args.mode).await;
        if failed > 0 {
            bail!("{failed} tenant(s) failed");
        }
        return Ok(());
    };

    info!(interval_secs = period.as_secs(), "Running on an interval");
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_pass(&sync, &config, args.mode).await;
            }
            _ = &mut shutdown => break,
        }
    }

    info!("Sync runner stopped");
    Ok(())
}

/// Runs one sync per tenant. Returns how many tenants failed.
async fn run_pass(sync: &SyncOrchestrator, config: &FiskalConfig, mode: Mode) -> usize {
    let page_size = config.upstream.page_size;
    let options = match mode {
        Mode::Incremental => SyncOptions::incremental(&config.sync, page_size, Utc::now()),
        Mode::Backfill => SyncOptions::backfill(&config.sync, page_size),
    };

    let mut failed = 0;
    for tenant in &config.tenants {
        match sync.run(&tenant.id, &tenant.fiscal, &options).await {
            Ok(report) => {
                if !report.errors.is_empty() {
                    warn!(tenant_id = %tenant.id, errors = ?report.errors, "Sync finished with errors");
                }
                info!(
                    tenant_id = %tenant.id,
                    status = ?report.status,
                    processed = report.processed,
                    receipts_issued = report.receipts_issued,
                    refunds_issued = report.refunds_issued,
                    receipts_skipped = report.receipts_skipped,
                    "Tenant synced"
                );
            }
            Err(err) => {
                failed += 1;
                error!(tenant_id = %tenant.id, error = %err, "Tenant sync failed");
            }
        }
    }
    failed
}

/// Initializes the tracing subscriber.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=fiskal_sync=trace` - Trace the sync engine only
/// - Default: INFO level
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, finishing...");
}
