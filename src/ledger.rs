//! Cash ledger for the shop's payment sources.
//!
//! Balances are never stored: each payment source keeps an initial
//! per-branch snapshot and the current balance is recomputed on every read
//! by replaying the signed transactions over it.
//!
//! For a (branch, source) pair:
//!   current = initial + sum(income, deposit) - sum(everything else)

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{PosError, PosResult};
use crate::money;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Direction of a cash movement. Unknown strings are kept verbatim so they
/// can be reported instead of silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TransactionType {
    Income,
    Expense,
    Deposit,
    Other(String),
}

impl TransactionType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Deposit => "deposit",
            Self::Other(raw) => raw.as_str(),
        }
    }

    /// Income and deposits add to the balance.
    pub fn is_credit(&self) -> bool {
        matches!(self, Self::Income | Self::Deposit)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for TransactionType {
    fn from(raw: String) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "income" => Self::Income,
            "expense" => Self::Expense,
            "deposit" => Self::Deposit,
            _ => Self::Other(raw),
        }
    }
}

impl From<TransactionType> for String {
    fn from(kind: TransactionType) -> Self {
        kind.as_str().to_string()
    }
}

/// Cash-equivalent bucket tracked independently per branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentSourceId {
    Cash,
    Bank,
}

impl PaymentSourceId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Bank => "bank",
        }
    }

    /// Lenient parse used by the per-store adapters.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cash" | "tien_mat" => Some(Self::Cash),
            "bank" | "transfer" | "bank_transfer" | "chuyen_khoan" => Some(Self::Bank),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashTransaction {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: TransactionType,
    /// Always a positive magnitude; the sign comes from `kind`.
    pub amount: Decimal,
    pub branch_id: String,
    pub payment_source_id: PaymentSourceId,
    #[serde(with = "flexible_date")]
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CashTransaction {
    pub fn signed_amount(&self) -> Decimal {
        if self.kind.is_credit() {
            self.amount
        } else {
            -self.amount
        }
    }

    fn matches(&self, branch_id: &str, source: PaymentSourceId) -> bool {
        self.branch_id == branch_id && self.payment_source_id == source
    }
}

/// Initial balance snapshot per branch. Never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSource {
    pub id: PaymentSourceId,
    #[serde(default)]
    pub balance: HashMap<String, Decimal>,
}

impl PaymentSource {
    pub fn initial_balance(&self, branch_id: &str) -> Decimal {
        self.balance.get(branch_id).copied().unwrap_or(Decimal::ZERO)
    }

    /// Reject snapshots carrying an opening balance outside `MAX_AMOUNT`.
    pub fn validate(&self) -> PosResult<()> {
        match self.balance.iter().find(|(_, v)| !money::in_range(**v)) {
            Some((branch, value)) => Err(PosError::Serialization(format!(
                "{} opening balance {value} for {branch} is out of range",
                self.id.as_str()
            ))),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Balance computation
// ---------------------------------------------------------------------------

/// Current balance of one payment source in one branch.
pub fn compute_balance(
    transactions: &[CashTransaction],
    branch_id: &str,
    source: PaymentSourceId,
    initial_balance: Decimal,
) -> Decimal {
    let delta: Decimal = transactions
        .iter()
        .filter(|t| t.matches(branch_id, source))
        .map(CashTransaction::signed_amount)
        .sum();
    initial_balance + delta
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BalanceKey {
    pub branch_id: String,
    pub source: PaymentSourceId,
}

/// Current balances for every (branch, source) pair seen in either the
/// payment-source snapshots or the transactions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceSheet {
    balances: BTreeMap<BalanceKey, Decimal>,
    /// Transactions whose type was not recognised; they were counted as
    /// outflows.
    pub unclassified: usize,
}

impl BalanceSheet {
    pub fn build(sources: &[PaymentSource], transactions: &[CashTransaction]) -> Self {
        let mut balances: BTreeMap<BalanceKey, Decimal> = BTreeMap::new();
        for source in sources {
            for (branch_id, initial) in &source.balance {
                *balances
                    .entry(BalanceKey {
                        branch_id: branch_id.clone(),
                        source: source.id,
                    })
                    .or_insert(Decimal::ZERO) += *initial;
            }
        }

        let mut unclassified = 0;
        for tx in transactions {
            if !tx.kind.is_known() {
                unclassified += 1;
                warn!(
                    transaction_id = %tx.id,
                    kind = %tx.kind.as_str(),
                    "Unrecognised transaction type counted as outflow"
                );
            }
            *balances
                .entry(BalanceKey {
                    branch_id: tx.branch_id.clone(),
                    source: tx.payment_source_id,
                })
                .or_insert(Decimal::ZERO) += tx.signed_amount();
        }

        Self {
            balances,
            unclassified,
        }
    }

    pub fn get(&self, branch_id: &str, source: PaymentSourceId) -> Decimal {
        self.balances
            .get(&BalanceKey {
                branch_id: branch_id.to_string(),
                source,
            })
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Cash + bank for a branch.
    pub fn branch_total(&self, branch_id: &str) -> Decimal {
        self.balances
            .iter()
            .filter(|(k, _)| k.branch_id == branch_id)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BalanceKey, &Decimal)> {
        self.balances.iter()
    }
}

/// Income/expense totals over a set of transactions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LedgerSummary {
    pub total_income: Decimal,
    pub total_expense: Decimal,
    pub net: Decimal,
    pub count: usize,
    pub unclassified: usize,
}

impl LedgerSummary {
    pub fn from_transactions<'a>(
        transactions: impl IntoIterator<Item = &'a CashTransaction>,
    ) -> Self {
        let mut summary = Self::default();
        for tx in transactions {
            summary.count += 1;
            if tx.kind.is_credit() {
                summary.total_income += tx.amount;
            } else {
                summary.total_expense += tx.amount;
            }
            if !tx.kind.is_known() {
                summary.unclassified += 1;
            }
        }
        summary.net = summary.total_income - summary.total_expense;
        summary
    }
}

// ---------------------------------------------------------------------------
// Manual entry
// ---------------------------------------------------------------------------

/// A transaction typed in by staff (or produced by the sales flow) before it
/// has an id.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCashTransaction {
    #[serde(rename = "type")]
    pub kind: TransactionType,
    pub amount: Decimal,
    #[serde(alias = "branch_id")]
    pub branch_id: String,
    #[serde(alias = "payment_source_id")]
    pub payment_source_id: PaymentSourceId,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NewCashTransaction {
    /// Validate and stamp the entry. Nothing is written here.
    pub fn into_transaction(self, clock: &dyn Clock) -> PosResult<CashTransaction> {
        if self.amount <= Decimal::ZERO {
            return Err(PosError::validation("Amount must be positive"));
        }
        if !money::in_range(self.amount) {
            return Err(PosError::validation(format!(
                "Amount must not exceed {}",
                money::MAX_AMOUNT
            )));
        }
        if !self.kind.is_known() {
            return Err(PosError::validation(format!(
                "Invalid transaction type: {}. Must be income, expense, or deposit",
                self.kind.as_str()
            )));
        }
        let branch_id = self.branch_id.trim().to_string();
        if branch_id.is_empty() {
            return Err(PosError::validation("Missing branchId"));
        }
        let category = self.category.trim().to_string();
        if category.is_empty() {
            return Err(PosError::validation("Missing category"));
        }
        let notes = self
            .notes
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        Ok(CashTransaction {
            id: Uuid::new_v4().to_string(),
            kind: self.kind,
            amount: self.amount,
            branch_id,
            payment_source_id: self.payment_source_id,
            date: self.date.unwrap_or_else(|| clock.now()),
            category,
            notes,
        })
    }
}

// ---------------------------------------------------------------------------
// Date parsing
// ---------------------------------------------------------------------------

/// Accepts RFC 3339, Postgres `timestamp` without zone, or a bare date.
/// Zone-less values are taken as UTC.
pub fn parse_flexible_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub(crate) mod flexible_date {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(date: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&date.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_flexible_date(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid date: {raw}")))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
