//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings helpers
//! and an offline implementation of the ledger and sales stores. Money is
//! stored as TEXT so decimals survive untouched.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::checkout::{DebtRecord, SaleRecord};
use crate::error::{PosError, PosResult};
use crate::ledger::{CashTransaction, PaymentSource, PaymentSourceId};
use crate::money;
use crate::reconcile::{LocalCashRow, SourceRecord};
use crate::store::{LedgerStore, SalesStore, TransactionQuery};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Initialize the database at `{data_dir}/pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. The file holds the offline ledger, so
/// an unreadable file is reported and left on disk untouched.
pub fn init(data_dir: &Path) -> PosResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| PosError::Database(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("pos.db");
    info!("Opening database at {}", db_path.display());

    let conn = open_and_configure(&db_path).map_err(|e| {
        error!(path = %db_path.display(), error = %e, "Database open failed");
        PosError::Database(format!(
            "Cannot open {} ({e}); the file was left in place for recovery",
            db_path.display()
        ))
    })?;

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open a throwaway in-memory database with the full schema.
pub fn open_in_memory() -> PosResult<DbState> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> PosResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| PosError::Database(format!("pragma setup: {e}")))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| PosError::Database(format!("create schema_version: {e}")))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .map_err(|e| PosError::Database(format!("read schema_version: {e}")))?;

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the cash ledger.
fn migrate_v1(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- one row per (source, branch) opening balance
        CREATE TABLE IF NOT EXISTS payment_sources (
            id TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            initial_balance TEXT NOT NULL DEFAULT '0',
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (id, branch_id)
        );

        CREATE TABLE IF NOT EXISTS cash_transactions (
            id TEXT PRIMARY KEY,
            type TEXT NOT NULL,
            amount TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            payment_source_id TEXT NOT NULL,
            date TEXT NOT NULL,
            category TEXT NOT NULL DEFAULT '',
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );
        CREATE INDEX IF NOT EXISTS idx_cash_tx_branch_date
            ON cash_transactions(branch_id, date);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::Database(format!("migration v1: {e}"))
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: sales and customer debts.
fn migrate_v2(conn: &Connection) -> PosResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL UNIQUE,
            branch_id TEXT NOT NULL,
            customer_id TEXT,
            items TEXT NOT NULL DEFAULT '[]',
            subtotal TEXT NOT NULL,
            discount TEXT NOT NULL,
            total TEXT NOT NULL,
            paid_amount TEXT NOT NULL,
            remaining_amount TEXT NOT NULL,
            payment_method TEXT NOT NULL,
            payment_type TEXT NOT NULL,
            delivery TEXT NOT NULL DEFAULT '{\"kind\":\"in_store\"}',
            notes TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sales_branch_created
            ON sales(branch_id, created_at);

        CREATE TABLE IF NOT EXISTS customer_debts (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            sale_id TEXT NOT NULL REFERENCES sales(id),
            branch_id TEXT NOT NULL,
            amount TEXT NOT NULL,
            notes TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_debts_customer
            ON customer_debts(customer_id);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::Database(format!("migration v2: {e}"))
    })?;

    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> PosResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Set the opening balance of one payment source in one branch.
pub fn set_initial_balance(
    conn: &Connection,
    source: PaymentSourceId,
    branch_id: &str,
    amount: Decimal,
) -> PosResult<()> {
    if !money::in_range(amount) {
        return Err(PosError::validation(format!(
            "Opening balance must not exceed {}",
            money::MAX_AMOUNT
        )));
    }
    conn.execute(
        "INSERT INTO payment_sources (id, branch_id, initial_balance, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(id, branch_id) DO UPDATE SET
            initial_balance = excluded.initial_balance,
            updated_at = excluded.updated_at",
        params![source.as_str(), branch_id, amount.to_string()],
    )?;
    Ok(())
}

/// Fixed-width UTC timestamps so stored dates compare correctly as text.
fn stored_date(date: DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn read_decimal(raw: &str, column: &str) -> PosResult<Decimal> {
    money::parse_stored(raw)
        .map_err(|e| PosError::Database(format!("bad decimal in {column}: {raw} ({e})")))
}

// ---------------------------------------------------------------------------
// Store implementations
// ---------------------------------------------------------------------------

impl DbState {
    fn lock(&self) -> PosResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| PosError::Database(format!("connection lock poisoned: {e}")))
    }

    pub fn setting(&self, category: &str, key: &str) -> PosResult<Option<String>> {
        let conn = self.lock()?;
        Ok(get_setting(&conn, category, key))
    }

    pub fn sale_count(&self) -> PosResult<i64> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM sales", [], |row| row.get(0))?)
    }

    /// Outstanding debt amounts recorded for a customer.
    pub fn customer_debt_total(&self, customer_id: &str) -> PosResult<Decimal> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT amount FROM customer_debts WHERE customer_id = ?1")?;
        let amounts = stmt
            .query_map(params![customer_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        amounts
            .iter()
            .try_fold(Decimal::ZERO, |acc, raw| {
                Ok::<_, PosError>(acc + read_decimal(raw, "amount")?)
            })
    }

    pub fn sale_code_exists(&self, code: &str) -> PosResult<bool> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT 1 FROM sales WHERE code = ?1", params![code], |_| Ok(()))
            .optional()?
            .is_some())
    }
}

#[async_trait]
impl LedgerStore for DbState {
    fn label(&self) -> &str {
        "sqlite"
    }

    async fn fetch_transactions(
        &self,
        query: &TransactionQuery,
    ) -> PosResult<Vec<CashTransaction>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, type, amount, branch_id, payment_source_id, date, category, notes
             FROM cash_transactions
             WHERE (?1 IS NULL OR branch_id = ?1)
               AND (?2 IS NULL OR payment_source_id = ?2)
               AND (?3 IS NULL OR date >= ?3)
               AND (?4 IS NULL OR date < ?4)
             ORDER BY date DESC, id",
        )?;
        let rows = stmt
            .query_map(
                params![
                    query.branch_id,
                    query.payment_source_id.map(PaymentSourceId::as_str),
                    query.since.map(stored_date),
                    query.until.map(stored_date),
                ],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, Option<String>>(7)?,
                    ))
                },
            )?
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(rows.len());
        for (id, kind, amount, branch_id, payment_source_id, date, category, notes) in rows {
            let amount = match read_decimal(&amount, "cash_transactions.amount") {
                Ok(a) => a,
                Err(e) => {
                    warn!(transaction_id = %id, error = %e, "Skipping unreadable transaction");
                    continue;
                }
            };
            let row = LocalCashRow {
                id,
                kind,
                amount,
                branch_id,
                payment_source_id,
                date,
                category: Some(category),
                notes,
            };
            match SourceRecord::Local(row).into_canonical() {
                Ok(tx) => out.push(tx),
                Err(e) => warn!(error = %e, "Skipping unreadable transaction"),
            }
        }
        Ok(out)
    }

    async fn fetch_payment_sources(&self) -> PosResult<Vec<PaymentSource>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, branch_id, initial_balance FROM payment_sources ORDER BY id, branch_id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut by_source: HashMap<PaymentSourceId, HashMap<String, Decimal>> = HashMap::new();
        for (id, branch_id, raw) in rows {
            let Some(source) = PaymentSourceId::parse(&id) else {
                warn!(source = %id, "Skipping unknown payment source");
                continue;
            };
            let amount = read_decimal(&raw, "payment_sources.initial_balance")?;
            if !money::in_range(amount) {
                return Err(PosError::Database(format!(
                    "opening balance {amount} for {id}/{branch_id} is out of range"
                )));
            }
            by_source.entry(source).or_default().insert(branch_id, amount);
        }
        let mut sources: Vec<PaymentSource> = by_source
            .into_iter()
            .map(|(id, balance)| PaymentSource { id, balance })
            .collect();
        sources.sort_by_key(|s| s.id.as_str());
        Ok(sources)
    }

    async fn insert_transaction(&self, tx: &CashTransaction) -> PosResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO cash_transactions
                (id, type, amount, branch_id, payment_source_id, date, category, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                tx.id,
                tx.kind.as_str(),
                tx.amount.to_string(),
                tx.branch_id,
                tx.payment_source_id.as_str(),
                stored_date(tx.date),
                tx.category,
                tx.notes,
            ],
        )?;
        info!(
            transaction_id = %tx.id,
            kind = tx.kind.as_str(),
            amount = %tx.amount,
            "Transaction stored locally"
        );
        Ok(())
    }
}

#[async_trait]
impl SalesStore for DbState {
    async fn create_sale(&self, sale: &SaleRecord) -> PosResult<()> {
        let items = serde_json::to_string(&sale.items)?;
        let delivery = serde_json::to_string(&sale.delivery)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sales
                (id, code, branch_id, customer_id, items, subtotal, discount, total,
                 paid_amount, remaining_amount, payment_method, payment_type, delivery,
                 notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                sale.id,
                sale.code,
                sale.branch_id,
                sale.customer_id,
                items,
                sale.subtotal.to_string(),
                sale.discount.to_string(),
                sale.total.to_string(),
                sale.paid_amount.to_string(),
                sale.remaining_amount.to_string(),
                sale.payment_method.as_str(),
                sale.payment_type.as_str(),
                delivery,
                sale.notes,
                stored_date(sale.created_at),
            ],
        )?;
        Ok(())
    }

    async fn create_debt(&self, debt: &DebtRecord) -> PosResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO customer_debts
                (id, customer_id, sale_id, branch_id, amount, notes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                debt.id,
                debt.customer_id,
                debt.sale_id,
                debt.branch_id,
                debt.amount.to_string(),
                debt.notes,
                stored_date(debt.created_at),
            ],
        )?;
        Ok(())
    }
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================
