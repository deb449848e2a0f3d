//! Combined ledger across the shop's own database and the external store.
//!
//! The two backends are operated independently and their transaction rows
//! drift apart over time, so each has its own row type and adapter into
//! `CashTransaction`. The combined view is read-only and never persisted.
//!
//! Both fetches run concurrently; a failure on one side is reported next to
//! the rows of the other instead of failing the whole view.

use chrono::{DateTime, Duration, FixedOffset, Months, Offset, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::error::{PosError, PosResult};
use crate::ledger::{
    parse_flexible_date, CashTransaction, LedgerSummary, PaymentSourceId, TransactionType,
};
use crate::money;
use crate::store::{LedgerStore, TransactionQuery};

/// Vietnam local time; "today" boundaries are computed in this offset unless
/// configured otherwise.
pub const DEFAULT_UTC_OFFSET_SECS: i32 = 7 * 3600;

/// Branch label given to external rows that carry no branch.
pub const EXTERNAL_BRANCH: &str = "external";

// ---------------------------------------------------------------------------
// Sources and their row shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreSource {
    Local,
    External,
}

impl StoreSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            Self::Local => "cash_transactions",
            Self::External => "transactions",
        }
    }

    pub fn date_column(self) -> &'static str {
        match self {
            Self::Local => "date",
            Self::External => "created_at",
        }
    }

    pub fn source_column(self) -> &'static str {
        match self {
            Self::Local => "payment_source_id",
            Self::External => "payment_source",
        }
    }

    pub fn parse_row(self, row: Value) -> PosResult<SourceRecord> {
        Ok(match self {
            Self::Local => SourceRecord::Local(serde_json::from_value(row)?),
            Self::External => SourceRecord::External(serde_json::from_value(row)?),
        })
    }
}

/// Row as stored by the shop's own database.
#[derive(Debug, Clone, Deserialize)]
pub struct LocalCashRow {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub amount: Decimal,
    pub branch_id: String,
    pub payment_source_id: String,
    #[serde(alias = "created_at")]
    pub date: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Row as stored by the external store. Ids may be serial integers, amounts
/// may carry a sign, and several columns go by older names.
#[derive(Debug, Clone, Deserialize)]
pub struct ExternalCashRow {
    pub id: Value,
    #[serde(alias = "type")]
    pub transaction_type: String,
    pub amount: Decimal,
    #[serde(default)]
    pub branch_id: Option<String>,
    #[serde(default, alias = "payment_source_id", alias = "payment_method")]
    pub payment_source: Option<String>,
    #[serde(alias = "date")]
    pub created_at: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default, alias = "notes")]
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SourceRecord {
    Local(LocalCashRow),
    External(ExternalCashRow),
}

impl SourceRecord {
    pub fn source(&self) -> StoreSource {
        match self {
            Self::Local(_) => StoreSource::Local,
            Self::External(_) => StoreSource::External,
        }
    }

    pub fn into_canonical(self) -> PosResult<CashTransaction> {
        match self {
            Self::Local(row) => local_to_canonical(row),
            Self::External(row) => external_to_canonical(row),
        }
    }
}

fn local_to_canonical(row: LocalCashRow) -> PosResult<CashTransaction> {
    if row.amount <= Decimal::ZERO {
        return Err(PosError::Serialization(format!(
            "transaction {} has non-positive amount {}",
            row.id, row.amount
        )));
    }
    if !money::in_range(row.amount) {
        return Err(PosError::Serialization(format!(
            "transaction {} amount {} is out of range",
            row.id, row.amount
        )));
    }
    let payment_source_id = PaymentSourceId::parse(&row.payment_source_id).ok_or_else(|| {
        PosError::Serialization(format!(
            "transaction {} has unknown payment source {}",
            row.id, row.payment_source_id
        ))
    })?;
    let date = parse_flexible_date(&row.date).ok_or_else(|| {
        PosError::Serialization(format!("transaction {} has invalid date {}", row.id, row.date))
    })?;
    Ok(CashTransaction {
        id: row.id,
        kind: TransactionType::from(row.kind),
        amount: row.amount,
        branch_id: row.branch_id,
        payment_source_id,
        date,
        category: row.category.unwrap_or_default(),
        notes: row.notes,
    })
}

fn external_to_canonical(row: ExternalCashRow) -> PosResult<CashTransaction> {
    let id = match &row.id {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        other => {
            return Err(PosError::Serialization(format!(
                "external transaction has unsupported id {other}"
            )))
        }
    };
    let amount = row.amount.abs();
    if amount.is_zero() {
        return Err(PosError::Serialization(format!(
            "external transaction {id} has zero amount"
        )));
    }
    if !money::in_range(amount) {
        return Err(PosError::Serialization(format!(
            "external transaction {id} amount {amount} is out of range"
        )));
    }
    let payment_source_id = match row.payment_source.as_deref() {
        None => PaymentSourceId::Cash,
        Some(raw) => PaymentSourceId::parse(raw).ok_or_else(|| {
            PosError::Serialization(format!(
                "external transaction {id} has unknown payment source {raw}"
            ))
        })?,
    };
    let date = parse_flexible_date(&row.created_at).ok_or_else(|| {
        PosError::Serialization(format!(
            "external transaction {id} has invalid date {}",
            row.created_at
        ))
    })?;
    let branch_id = row
        .branch_id
        .map(|b| b.trim().to_string())
        .filter(|b| !b.is_empty())
        .unwrap_or_else(|| EXTERNAL_BRANCH.to_string());

    Ok(CashTransaction {
        id,
        kind: TransactionType::from(row.transaction_type),
        amount,
        branch_id,
        payment_source_id,
        date,
        category: row.category.unwrap_or_default(),
        notes: row.description,
    })
}

/// Parse and normalise a page of raw rows. Rows that do not fit the shape
/// are skipped and counted.
pub fn adapt_rows(source: StoreSource, rows: Vec<Value>) -> (Vec<CashTransaction>, usize) {
    let mut out = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        match source.parse_row(row).and_then(SourceRecord::into_canonical) {
            Ok(tx) => out.push(tx),
            Err(e) => {
                skipped += 1;
                warn!(source = source.as_str(), error = %e, "skipping malformed transaction row");
            }
        }
    }
    (out, skipped)
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    #[default]
    All,
    Local,
    External,
}

impl SourceFilter {
    pub fn admits(self, source: StoreSource) -> bool {
        match self {
            Self::All => true,
            Self::Local => source == StoreSource::Local,
            Self::External => source == StoreSource::External,
        }
    }
}

/// Date window relative to "now".
///
/// `Today` starts at local midnight; `Week` is a rolling seven days and
/// `Month` a rolling calendar month back from the current instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateRange {
    Today,
    Week,
    Month,
    #[default]
    All,
}

impl DateRange {
    pub fn start(self, now: DateTime<Utc>, offset: FixedOffset) -> Option<DateTime<Utc>> {
        let local_now = now.with_timezone(&offset);
        match self {
            Self::Today => local_now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .and_then(|midnight| offset.from_local_datetime(&midnight).single())
                .map(|dt| dt.with_timezone(&Utc)),
            Self::Week => Some(now - Duration::days(7)),
            Self::Month => local_now
                .checked_sub_months(Months::new(1))
                .map(|dt| dt.with_timezone(&Utc)),
            Self::All => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileFilter {
    pub source: SourceFilter,
    pub range: DateRange,
    pub utc_offset: FixedOffset,
}

impl Default for ReconcileFilter {
    fn default() -> Self {
        Self {
            source: SourceFilter::All,
            range: DateRange::All,
            utc_offset: default_offset(),
        }
    }
}

pub fn default_offset() -> FixedOffset {
    FixedOffset::east_opt(DEFAULT_UTC_OFFSET_SECS).unwrap_or_else(|| Utc.fix())
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CombinedTransaction {
    pub source: StoreSource,
    #[serde(flatten)]
    pub transaction: CashTransaction,
}

/// Tag both lists, apply the filter and order newest first.
pub fn merge(
    local: Vec<CashTransaction>,
    external: Vec<CashTransaction>,
    filter: &ReconcileFilter,
    clock: &dyn Clock,
) -> Vec<CombinedTransaction> {
    let since = filter.range.start(clock.now(), filter.utc_offset);

    let tagged = local
        .into_iter()
        .map(|t| (StoreSource::Local, t))
        .chain(external.into_iter().map(|t| (StoreSource::External, t)));

    let mut combined: Vec<CombinedTransaction> = tagged
        .filter(|(source, _)| filter.source.admits(*source))
        .filter(|(_, t)| since.map_or(true, |s| t.date >= s))
        .map(|(source, transaction)| CombinedTransaction {
            source,
            transaction,
        })
        .collect();

    combined.sort_by(|a, b| {
        b.transaction
            .date
            .cmp(&a.transaction.date)
            .then_with(|| a.source.cmp(&b.source))
            .then_with(|| a.transaction.id.cmp(&b.transaction.id))
    });
    combined
}

// ---------------------------------------------------------------------------
// Concurrent load
// ---------------------------------------------------------------------------

/// One side of the combined view that could not be loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceFailure {
    pub source: StoreSource,
    pub message: String,
    pub user_message: String,
    pub permission_denied: bool,
}

impl SourceFailure {
    fn from_error(source: StoreSource, err: &PosError) -> Self {
        let permission_denied = err.is_permission_denied();
        let user_message = match (source, permission_denied) {
            (StoreSource::External, true) => {
                "The external store refused access to its transactions (row-level security). \
                 Showing local transactions only."
                    .to_string()
            }
            (StoreSource::Local, true) => {
                "This shop's database refused access to its transactions (row-level security)."
                    .to_string()
            }
            _ => format!(
                "Could not load {} transactions: {}",
                source.as_str(),
                err.user_message()
            ),
        };
        Self {
            source,
            message: err.to_string(),
            user_message,
            permission_denied,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CombinedLedger {
    pub transactions: Vec<CombinedTransaction>,
    pub failures: Vec<SourceFailure>,
}

impl CombinedLedger {
    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failure(&self, source: StoreSource) -> Option<&SourceFailure> {
        self.failures.iter().find(|f| f.source == source)
    }

    pub fn summary(&self, source: SourceFilter) -> LedgerSummary {
        LedgerSummary::from_transactions(
            self.transactions
                .iter()
                .filter(|c| source.admits(c.source))
                .map(|c| &c.transaction),
        )
    }
}

async fn fetch_side(
    source: StoreSource,
    store: Option<&dyn LedgerStore>,
    wanted: bool,
    query: &TransactionQuery,
) -> PosResult<Vec<CashTransaction>> {
    match store {
        Some(store) if wanted => {
            let rows = store.fetch_transactions(query).await?;
            info!(
                source = source.as_str(),
                store = store.label(),
                count = rows.len(),
                "Fetched transactions"
            );
            Ok(rows)
        }
        _ => Ok(Vec::new()),
    }
}

/// Fetch both ledgers concurrently and merge whatever arrived.
///
/// `external` is `None` when no external store is configured.
pub async fn load_combined(
    local: &dyn LedgerStore,
    external: Option<&dyn LedgerStore>,
    branch_id: Option<&str>,
    filter: &ReconcileFilter,
    clock: &dyn Clock,
) -> CombinedLedger {
    let query = TransactionQuery {
        branch_id: branch_id.map(String::from),
        since: filter.range.start(clock.now(), filter.utc_offset),
        ..TransactionQuery::default()
    };
    // The external store uses its own branch ids, so only the date bound
    // is pushed down there.
    let external_query = TransactionQuery {
        branch_id: None,
        ..query.clone()
    };

    let (local_result, external_result) = tokio::join!(
        fetch_side(
            StoreSource::Local,
            Some(local),
            filter.source.admits(StoreSource::Local),
            &query
        ),
        fetch_side(
            StoreSource::External,
            external,
            filter.source.admits(StoreSource::External),
            &external_query
        ),
    );

    let mut failures = Vec::new();
    let local_rows = local_result.unwrap_or_else(|e| {
        warn!(error = %e, "Local ledger fetch failed");
        failures.push(SourceFailure::from_error(StoreSource::Local, &e));
        Vec::new()
    });
    let external_rows = external_result.unwrap_or_else(|e| {
        warn!(
            error = %e,
            permission_denied = e.is_permission_denied(),
            "External ledger fetch failed"
        );
        failures.push(SourceFailure::from_error(StoreSource::External, &e));
        Vec::new()
    });

    CombinedLedger {
        transactions: merge(local_rows, external_rows, filter, clock),
        failures,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
