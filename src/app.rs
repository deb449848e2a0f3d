//! Application state shared by every screen.
//!
//! Holds the configured backends and the clock, and exposes the operations
//! the UI calls: balances, the combined ledger, manual entries, imports and
//! sale finalisation.

use chrono::FixedOffset;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::checkout::{Checkout, FinalizeOutcome, SaleDraft};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::db::DbState;
use crate::error::{PosError, PosResult};
use crate::ledger::{BalanceSheet, CashTransaction, NewCashTransaction, PaymentSourceId};
use crate::pricing::ImportReceipt;
use crate::reconcile::{
    self, default_offset, CombinedLedger, DateRange, ReconcileFilter, SourceFilter, StoreSource,
};
use crate::store::{LedgerStore, SalesStore, TransactionQuery};
use crate::supabase::SupabaseClient;

/// Balances of one branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BranchBalance {
    pub branch_id: String,
    pub cash: Decimal,
    pub bank: Decimal,
    pub total: Decimal,
    /// Transactions with an unrecognised type that were counted as outflows.
    pub unclassified: usize,
}

pub struct AppState {
    ledger: Arc<dyn LedgerStore>,
    sales: Arc<dyn SalesStore>,
    external: Option<Arc<dyn LedgerStore>>,
    clock: Arc<dyn Clock>,
    default_branch: Option<String>,
    utc_offset: FixedOffset,
}

impl AppState {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        sales: Arc<dyn SalesStore>,
        external: Option<Arc<dyn LedgerStore>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            ledger,
            sales,
            external,
            clock,
            default_branch: None,
            utc_offset: default_offset(),
        }
    }

    /// Online state: the shop's Supabase project for ledger and sales, plus
    /// the external store when configured.
    pub fn from_config(config: &AppConfig) -> PosResult<Self> {
        let local = Arc::new(SupabaseClient::from_credentials(&config.local, StoreSource::Local)?);
        let external = match &config.external {
            Some(creds) => Some(Arc::new(SupabaseClient::from_credentials(
                creds,
                StoreSource::External,
            )?) as Arc<dyn LedgerStore>),
            None => None,
        };
        info!(
            local = local.label(),
            external = external.as_ref().map(|e| e.label()).unwrap_or("none"),
            "Backends ready"
        );
        Ok(Self::new(local.clone(), local, external, Arc::new(SystemClock))
            .with_default_branch(config.default_branch.clone())
            .with_utc_offset(config.utc_offset))
    }

    /// Offline state backed by the local SQLite database only.
    pub fn offline(db: Arc<DbState>) -> Self {
        Self::new(db.clone(), db, None, Arc::new(SystemClock))
    }

    pub fn with_default_branch(mut self, branch: Option<String>) -> Self {
        self.default_branch = branch;
        self
    }

    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    fn branch(&self, branch_id: Option<&str>) -> PosResult<String> {
        branch_id
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(String::from)
            .or_else(|| self.default_branch.clone())
            .ok_or_else(|| PosError::validation("Select a branch first"))
    }

    /// Filter for the combined view using the configured UTC offset.
    pub fn filter(&self, source: SourceFilter, range: DateRange) -> ReconcileFilter {
        ReconcileFilter {
            source,
            range,
            utc_offset: self.utc_offset,
        }
    }

    /// Current cash and bank balances of a branch.
    pub async fn cash_balance(&self, branch_id: Option<&str>) -> PosResult<BranchBalance> {
        let branch_id = self.branch(branch_id)?;
        let query = TransactionQuery::for_branch(branch_id.clone());
        let (sources, transactions) = tokio::try_join!(
            self.ledger.fetch_payment_sources(),
            self.ledger.fetch_transactions(&query),
        )?;
        let sheet = BalanceSheet::build(&sources, &transactions);
        let balance = BranchBalance {
            cash: sheet.get(&branch_id, PaymentSourceId::Cash),
            bank: sheet.get(&branch_id, PaymentSourceId::Bank),
            total: sheet.branch_total(&branch_id),
            unclassified: sheet.unclassified,
            branch_id,
        };
        if balance.cash < Decimal::ZERO {
            warn!(branch = %balance.branch_id, cash = %balance.cash, "Cash balance is negative");
        }
        Ok(balance)
    }

    pub async fn combined_ledger(
        &self,
        branch_id: Option<&str>,
        filter: &ReconcileFilter,
    ) -> CombinedLedger {
        let branch = branch_id
            .map(String::from)
            .or_else(|| self.default_branch.clone());
        reconcile::load_combined(
            self.ledger.as_ref(),
            self.external.as_deref(),
            branch.as_deref(),
            filter,
            self.clock.as_ref(),
        )
        .await
    }

    /// Validate and store a manual income/expense/deposit entry.
    pub async fn record_transaction(
        &self,
        entry: NewCashTransaction,
    ) -> PosResult<CashTransaction> {
        let tx = entry.into_transaction(self.clock.as_ref())?;
        self.ledger.insert_transaction(&tx).await?;
        Ok(tx)
    }

    /// Record the supplier payment for a stock delivery.
    pub async fn record_import(
        &self,
        receipt: &ImportReceipt,
        source: PaymentSourceId,
    ) -> PosResult<CashTransaction> {
        let tx = receipt.payment_transaction(source, self.clock.as_ref())?;
        self.ledger.insert_transaction(&tx).await?;
        info!(
            branch = %receipt.branch_id,
            lines = receipt.lines.len(),
            total = %tx.amount,
            "Import recorded"
        );
        Ok(tx)
    }

    pub fn checkout(&self, branch_id: Option<&str>) -> PosResult<Checkout> {
        Ok(Checkout::new(self.branch(branch_id)?))
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Write a confirmed draft and close `checkout` once the sale exists.
    pub async fn finalize_sale(
        &self,
        checkout: &mut Checkout,
        draft: &SaleDraft,
    ) -> PosResult<FinalizeOutcome> {
        checkout
            .finalize(self.sales.as_ref(), self.ledger.as_ref(), draft)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::{Cart, ProductSnapshot};
    use crate::checkout::{PaymentMethod, PaymentType};
    use crate::clock::FixedClock;
    use crate::ledger::{PaymentSource, TransactionType};
    use crate::pricing::ImportLine;
    use crate::store::testing::MemoryStore;
    use chrono::{TimeZone, Utc};
    use std::collections::HashMap;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn clock() -> Arc<FixedClock> {
        Arc::new(FixedClock(Utc.with_ymd_and_hms(2024, 3, 15, 3, 0, 0).unwrap()))
    }

    fn entry(kind: TransactionType, amount: i64, source: PaymentSourceId) -> NewCashTransaction {
        NewCashTransaction {
            kind,
            amount: d(amount),
            branch_id: "CN1".to_string(),
            payment_source_id: source,
            date: None,
            category: "misc".to_string(),
            notes: None,
        }
    }

    fn state_with(local: Arc<MemoryStore>, external: Option<Arc<MemoryStore>>) -> AppState {
        AppState::new(
            local.clone(),
            local,
            external.map(|e| e as Arc<dyn LedgerStore>),
            clock(),
        )
        .with_default_branch(Some("CN1".to_string()))
    }

    #[tokio::test]
    async fn test_cash_balance_replays_entries() {
        let local = Arc::new(MemoryStore::named("local"));
        *local.sources.lock().unwrap() = vec![PaymentSource {
            id: PaymentSourceId::Cash,
            balance: HashMap::from([("CN1".to_string(), d(1_000_000))]),
        }];
        let state = state_with(local.clone(), None);

        state
            .record_transaction(entry(TransactionType::Income, 500_000, PaymentSourceId::Cash))
            .await
            .unwrap();
        state
            .record_transaction(entry(TransactionType::Expense, 200_000, PaymentSourceId::Cash))
            .await
            .unwrap();
        state
            .record_transaction(entry(TransactionType::Deposit, 100_000, PaymentSourceId::Bank))
            .await
            .unwrap();

        let balance = state.cash_balance(None).await.unwrap();
        assert_eq!(balance.cash, d(1_300_000));
        assert_eq!(balance.bank, d(100_000));
        assert_eq!(balance.total, d(1_400_000));
        assert_eq!(balance.unclassified, 0);
    }

    #[tokio::test]
    async fn test_invalid_entry_is_not_written() {
        let local = Arc::new(MemoryStore::named("local"));
        let state = state_with(local.clone(), None);
        let err = state
            .record_transaction(entry(TransactionType::Income, 0, PaymentSourceId::Cash))
            .await
            .unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
        assert!(local.transactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_branch_is_required_without_default() {
        let local = Arc::new(MemoryStore::named("local"));
        let state = AppState::new(local.clone(), local, None, clock());
        assert!(state.cash_balance(None).await.is_err());
        assert!(state.checkout(Some("  ")).is_err());
        assert!(state.cash_balance(Some("CN1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_combined_ledger_survives_external_failure() {
        let local = Arc::new(MemoryStore::named("local"));
        let external = Arc::new(MemoryStore::named("external"));
        *external.fail_fetch.lock().unwrap() = Some(PosError::Backend {
            status: 403,
            code: Some("42501".to_string()),
            message: "permission denied".to_string(),
        });
        let state = state_with(local, Some(external));
        state
            .record_transaction(entry(TransactionType::Income, 500_000, PaymentSourceId::Cash))
            .await
            .unwrap();

        let filter = state.filter(SourceFilter::All, DateRange::Today);
        let ledger = state.combined_ledger(None, &filter).await;
        assert_eq!(ledger.transactions.len(), 1);
        assert!(ledger.is_degraded());
        let failure = ledger.failure(StoreSource::External).expect("external failure");
        assert!(failure.permission_denied);
    }

    #[tokio::test]
    async fn test_checkout_through_state() {
        let local = Arc::new(MemoryStore::named("local"));
        let state = state_with(local.clone(), None);

        let mut cart = Cart::new();
        cart.add_product(
            &ProductSnapshot {
                id: "chain".to_string(),
                name: "Chain kit".to_string(),
                retail_price: d(380_000),
                stock: None,
            },
            1,
        )
        .unwrap();
        let mut checkout = state.checkout(None).unwrap();
        checkout.select_method(PaymentMethod::Cash);
        checkout.select_payment_type(PaymentType::Full);
        let draft = checkout.confirm(&cart, None, state.clock()).unwrap();

        let outcome = state.finalize_sale(&mut checkout, &draft).await.unwrap();
        assert!(outcome.warnings.is_empty());
        assert_eq!(checkout.stage(), crate::checkout::CheckoutStage::Confirmed);
        assert_eq!(local.sales.lock().unwrap()[0].branch_id, "CN1");

        let balance = state.cash_balance(None).await.unwrap();
        assert_eq!(balance.cash, d(380_000));
    }

    #[tokio::test]
    async fn test_record_import_writes_expense() {
        let local = Arc::new(MemoryStore::named("local"));
        let state = state_with(local.clone(), None);
        let mut line = ImportLine::new("pad", "Brake pad", 4);
        line.set_import_price(d(50_000)).unwrap();
        let receipt = ImportReceipt {
            branch_id: "CN1".to_string(),
            supplier: None,
            lines: vec![line],
        };

        let tx = state
            .record_import(&receipt, PaymentSourceId::Cash)
            .await
            .unwrap();
        assert_eq!(tx.amount, d(200_000));
        let balance = state.cash_balance(None).await.unwrap();
        assert_eq!(balance.cash, d(-200_000));
    }

    #[test]
    fn test_offline_state_uses_sqlite() {
        let db = Arc::new(crate::db::open_in_memory().unwrap());
        let state = AppState::offline(db).with_default_branch(Some("CN1".to_string()));
        assert!(!state.has_external());
        assert!(state.checkout(None).is_ok());
    }
}
