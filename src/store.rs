//! Backend seams.
//!
//! Both the remote PostgREST projects and the local SQLite store implement
//! these traits, so the ledger, reconciliation and checkout flows never know
//! which one they are talking to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::checkout::{DebtRecord, SaleRecord};
use crate::error::PosResult;
use crate::ledger::{CashTransaction, PaymentSource, PaymentSourceId};

/// Server-side filter for a transaction fetch. `None` means "no bound".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionQuery {
    pub branch_id: Option<String>,
    pub payment_source_id: Option<PaymentSourceId>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TransactionQuery {
    pub fn for_branch(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: Some(branch_id.into()),
            ..Self::default()
        }
    }

    pub fn admits(&self, tx: &CashTransaction) -> bool {
        self.branch_id.as_deref().map_or(true, |b| tx.branch_id == b)
            && self.payment_source_id.map_or(true, |s| tx.payment_source_id == s)
            && self.since.map_or(true, |since| tx.date >= since)
            && self.until.map_or(true, |until| tx.date < until)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Human-readable name used in logs.
    fn label(&self) -> &str;

    async fn fetch_transactions(&self, query: &TransactionQuery) -> PosResult<Vec<CashTransaction>>;

    async fn fetch_payment_sources(&self) -> PosResult<Vec<PaymentSource>>;

    async fn insert_transaction(&self, tx: &CashTransaction) -> PosResult<()>;
}

#[async_trait]
pub trait SalesStore: Send + Sync {
    async fn create_sale(&self, sale: &SaleRecord) -> PosResult<()>;

    async fn create_debt(&self, debt: &DebtRecord) -> PosResult<()>;
}
