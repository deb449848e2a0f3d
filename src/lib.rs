//! Moto POS core.
//!
//! Sales, cash ledger and two-store reconciliation for a motorcycle parts
//! shop. The UI talks to `AppState`; everything below it is plain library
//! code that can run against Supabase, the local SQLite file, or in-memory
//! fakes.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod app;
pub mod cart;
pub mod checkout;
pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod money;
pub mod pricing;
pub mod reconcile;
pub mod store;
pub mod supabase;

pub use app::{AppState, BranchBalance};
pub use cart::{Cart, CartTotals, DiscountMode, ProductSnapshot};
pub use checkout::{
    finalize_sale, Checkout, CheckoutStage, CustomerRef, Delivery, FinalizeOutcome, PaymentMethod,
    PaymentType, SaleDraft,
};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::AppConfig;
pub use error::{PosError, PosResult};
pub use ledger::{
    compute_balance, BalanceSheet, CashTransaction, LedgerSummary, NewCashTransaction,
    PaymentSource, PaymentSourceId, TransactionType,
};
pub use pricing::{ImportLine, ImportReceipt, RetailPrice};
pub use reconcile::{CombinedLedger, DateRange, ReconcileFilter, SourceFilter, StoreSource};

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "pos";

// ---------------------------------------------------------------------------
// Build info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutInfo {
    pub version: &'static str,
    pub build_timestamp: &'static str,
    pub git_sha: &'static str,
    pub platform: &'static str,
}

pub fn about() -> AboutInfo {
    AboutInfo {
        version: env!("CARGO_PKG_VERSION"),
        build_timestamp: env!("BUILD_TIMESTAMP"),
        git_sha: env!("BUILD_GIT_SHA"),
        platform: std::env::consts::OS,
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`. Returns how many files were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")))
                .unwrap_or(false);
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install structured logging: console plus a daily file in `log_dir`.
///
/// The returned guard flushes the file writer on drop; keep it alive for
/// the life of the process.
pub fn init_logging(log_dir: &Path) -> PosResult<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,moto_pos_lib=debug"));

    fs::create_dir_all(log_dir).map_err(|e| {
        PosError::config(format!("Cannot create log dir {}: {e}", log_dir.display()))
    })?;
    let pruned = prune_old_logs(log_dir);

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| PosError::config(format!("Logging already initialised: {e}")))?;

    if pruned > 0 {
        info!(pruned, "Removed old log files");
    }
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Start-up
// ---------------------------------------------------------------------------

/// Everything a running terminal needs. Dropping it flushes the logs.
pub struct Runtime {
    pub state: AppState,
    pub db: Arc<db::DbState>,
    pub config: AppConfig,
    _log_guard: WorkerGuard,
}

/// Open the local database, load the configuration, start logging and
/// connect the backends.
pub fn start() -> PosResult<Runtime> {
    let data_dir = config::data_dir();
    let db = Arc::new(db::init(&data_dir)?);
    let config = config::load(Some(&db))?;
    let log_guard = init_logging(&config.log_dir)?;

    let build = about();
    info!(
        "Starting moto-pos v{} ({}, built {})",
        build.version, build.git_sha, build.build_timestamp
    );

    let state = AppState::from_config(&config)?;
    Ok(Runtime {
        state,
        db,
        config,
        _log_guard: log_guard,
    })
}
