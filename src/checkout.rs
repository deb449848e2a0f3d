//! Checkout: payment selection, confirmation and sale finalisation.
//!
//! Confirmation is pure: it checks the guards and produces a `SaleDraft`
//! (sale, optional customer debt, optional income entry). Finalisation then
//! writes the draft as three independent backend calls:
//!
//!   create sale -> create debt (if any) -> record income (if any)
//!
//! Only a failed sale aborts, and it leaves the checkout open so the same
//! draft can be written again. Later steps are not rolled back; their
//! failures come back as warnings so the operator can fix the records by
//! hand. The checkout reaches `Confirmed` only once the sale exists.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cart::Cart;
use crate::clock::Clock;
use crate::error::{PosError, PosResult};
use crate::ledger::{CashTransaction, NewCashTransaction, PaymentSourceId, TransactionType};
use crate::store::{LedgerStore, SalesStore};

// ---------------------------------------------------------------------------
// Selection types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Transfer,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::Transfer => "transfer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "transfer" | "bank" => Some(Self::Transfer),
            _ => None,
        }
    }

    pub fn payment_source(self) -> PaymentSourceId {
        match self {
            Self::Cash => PaymentSourceId::Cash,
            Self::Transfer => PaymentSourceId::Bank,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentType {
    Full,
    Partial,
    /// Nothing paid now; the whole total becomes debt.
    Note,
}

impl PaymentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Note => "note",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "partial" => Some(Self::Partial),
            "note" => Some(Self::Note),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Delivery {
    #[default]
    InStore,
    Cod {
        address: String,
        phone: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CheckoutStage {
    NoPaymentMethod,
    MethodSelected,
    TypeSelected(PaymentType),
    AmountEntered,
    Confirmed,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleItem {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    pub unit_price: Decimal,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub id: String,
    pub code: String,
    pub branch_id: String,
    pub customer_id: Option<String>,
    pub items: Vec<SaleItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
    pub paid_amount: Decimal,
    pub remaining_amount: Decimal,
    pub payment_method: PaymentMethod,
    pub payment_type: PaymentType,
    pub delivery: Delivery,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebtRecord {
    pub id: String,
    pub customer_id: String,
    pub sale_id: String,
    pub branch_id: String,
    pub amount: Decimal,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaleDraft {
    pub sale: SaleRecord,
    pub debt: Option<DebtRecord>,
    pub income: Option<CashTransaction>,
    pub warnings: Vec<String>,
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Checkout {
    branch_id: String,
    method: Option<PaymentMethod>,
    payment_type: Option<PaymentType>,
    partial_amount: Option<Decimal>,
    delivery: Delivery,
    notes: Option<String>,
    confirmed: bool,
}

impl Checkout {
    pub fn new(branch_id: impl Into<String>) -> Self {
        Self {
            branch_id: branch_id.into(),
            ..Self::default()
        }
    }

    pub fn stage(&self) -> CheckoutStage {
        if self.confirmed {
            return CheckoutStage::Confirmed;
        }
        match (self.method, self.payment_type) {
            (None, _) => CheckoutStage::NoPaymentMethod,
            (Some(_), None) => CheckoutStage::MethodSelected,
            (Some(_), Some(PaymentType::Partial)) if self.partial_amount.is_some() => {
                CheckoutStage::AmountEntered
            }
            (Some(_), Some(t)) => CheckoutStage::TypeSelected(t),
        }
    }

    pub fn select_method(&mut self, method: PaymentMethod) {
        self.method = Some(method);
    }

    pub fn select_payment_type(&mut self, payment_type: PaymentType) {
        if payment_type != PaymentType::Partial {
            self.partial_amount = None;
        }
        self.payment_type = Some(payment_type);
    }

    pub fn enter_partial_amount(&mut self, amount: Decimal) -> PosResult<()> {
        if self.payment_type != Some(PaymentType::Partial) {
            return Err(PosError::validation(
                "Select partial payment before entering an amount",
            ));
        }
        self.partial_amount = Some(amount);
        Ok(())
    }

    pub fn set_delivery(&mut self, delivery: Delivery) {
        self.delivery = delivery;
    }

    pub fn set_notes(&mut self, notes: Option<String>) {
        self.notes = notes.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
    }

    /// Mark the sale as written. Further confirmations are refused.
    pub fn mark_finalized(&mut self) {
        self.confirmed = true;
    }

    /// Write `draft` and close the checkout once the sale record exists.
    pub async fn finalize(
        &mut self,
        sales: &dyn SalesStore,
        ledger: &dyn LedgerStore,
        draft: &SaleDraft,
    ) -> PosResult<FinalizeOutcome> {
        if self.confirmed {
            return Err(PosError::validation("Sale already confirmed"));
        }
        let outcome = finalize_sale(sales, ledger, draft).await?;
        self.mark_finalized();
        Ok(outcome)
    }

    /// Check every guard and build the records to write.
    pub fn confirm(
        &mut self,
        cart: &Cart,
        customer: Option<&CustomerRef>,
        clock: &dyn Clock,
    ) -> PosResult<SaleDraft> {
        if self.confirmed {
            return Err(PosError::validation("Sale already confirmed"));
        }
        if self.branch_id.trim().is_empty() {
            return Err(PosError::validation("Missing branchId"));
        }
        if cart.is_empty() {
            return Err(PosError::validation("Cart is empty"));
        }
        cart.validate_stock()?;
        let method = self
            .method
            .ok_or_else(|| PosError::validation("Select a payment method"))?;
        let payment_type = self
            .payment_type
            .ok_or_else(|| PosError::validation("Select a payment type"))?;

        let totals = cart.totals();
        let paid_amount = match payment_type {
            PaymentType::Full => totals.total,
            PaymentType::Note => Decimal::ZERO,
            PaymentType::Partial => {
                let amount = self
                    .partial_amount
                    .ok_or_else(|| PosError::validation("Enter the amount paid"))?;
                if amount <= Decimal::ZERO {
                    return Err(PosError::validation("Amount paid must be positive"));
                }
                if amount > totals.total {
                    return Err(PosError::validation(format!(
                        "Amount paid ({amount}) exceeds the total ({})",
                        totals.total
                    )));
                }
                amount
            }
        };

        if let Delivery::Cod { address, phone } = &self.delivery {
            if address.trim().is_empty() {
                return Err(PosError::validation("Delivery address is required for COD"));
            }
            if phone.trim().is_empty() {
                return Err(PosError::validation("Phone number is required for COD"));
            }
        }

        let now = clock.now();
        let sale_id = Uuid::new_v4().to_string();
        let remaining_amount = totals.total - paid_amount;
        let code = sale_code(&sale_id, now);

        let sale = SaleRecord {
            id: sale_id.clone(),
            code: code.clone(),
            branch_id: self.branch_id.clone(),
            customer_id: customer.map(|c| c.id.clone()),
            items: cart
                .lines()
                .iter()
                .map(|l| SaleItem {
                    product_id: l.product_id.clone(),
                    name: l.name.clone(),
                    quantity: l.quantity,
                    unit_price: l.unit_price,
                    line_total: l.line_total(),
                })
                .collect(),
            subtotal: totals.subtotal,
            discount: totals.discount,
            total: totals.total,
            paid_amount,
            remaining_amount,
            payment_method: method,
            payment_type,
            delivery: self.delivery.clone(),
            notes: self.notes.clone(),
            created_at: now,
        };

        let mut warnings = Vec::new();
        let debt = match customer {
            Some(c) if remaining_amount > Decimal::ZERO => Some(DebtRecord {
                id: Uuid::new_v4().to_string(),
                customer_id: c.id.clone(),
                sale_id: sale_id.clone(),
                branch_id: self.branch_id.clone(),
                amount: remaining_amount,
                notes: Some(format!("Unpaid remainder of sale {code}")),
                created_at: now,
            }),
            None if remaining_amount > Decimal::ZERO => {
                warnings.push(format!(
                    "Remaining {remaining_amount} of sale {code} has no customer; no debt recorded"
                ));
                None
            }
            _ => None,
        };

        let income = if paid_amount > Decimal::ZERO {
            Some(
                NewCashTransaction {
                    kind: TransactionType::Income,
                    amount: paid_amount,
                    branch_id: self.branch_id.clone(),
                    payment_source_id: method.payment_source(),
                    date: Some(now),
                    category: "sale".to_string(),
                    notes: Some(format!("Sale {code}")),
                }
                .into_transaction(clock)?,
            )
        } else {
            None
        };

        Ok(SaleDraft {
            sale,
            debt,
            income,
            warnings,
        })
    }
}

fn sale_code(sale_id: &str, at: DateTime<Utc>) -> String {
    let suffix: String = sale_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(6)
        .collect::<String>()
        .to_uppercase();
    format!("HD{}-{suffix}", at.format("%y%m%d"))
}

// ---------------------------------------------------------------------------
// Finalisation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FinalizeStep {
    Draft,
    Debt,
    Ledger,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepWarning {
    pub step: FinalizeStep,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalizeOutcome {
    pub sale_id: String,
    pub sale_code: String,
    pub debt_id: Option<String>,
    pub transaction_id: Option<String>,
    pub warnings: Vec<StepWarning>,
}

impl FinalizeOutcome {
    /// True when the sale exists but a follow-up record is missing.
    pub fn is_partially_applied(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w.step, FinalizeStep::Debt | FinalizeStep::Ledger))
    }
}

/// Write a confirmed draft. See the module docs for the failure policy.
pub async fn finalize_sale(
    sales: &dyn SalesStore,
    ledger: &dyn LedgerStore,
    draft: &SaleDraft,
) -> PosResult<FinalizeOutcome> {
    let sale = &draft.sale;
    sales.create_sale(sale).await?;
    info!(
        sale_id = %sale.id,
        code = %sale.code,
        total = %sale.total,
        paid = %sale.paid_amount,
        "Sale created"
    );

    let mut outcome = FinalizeOutcome {
        sale_id: sale.id.clone(),
        sale_code: sale.code.clone(),
        debt_id: None,
        transaction_id: None,
        warnings: draft
            .warnings
            .iter()
            .map(|message| StepWarning {
                step: FinalizeStep::Draft,
                message: message.clone(),
            })
            .collect(),
    };

    if let Some(debt) = &draft.debt {
        match sales.create_debt(debt).await {
            Ok(()) => {
                info!(
                    debt_id = %debt.id,
                    sale_id = %sale.id,
                    amount = %debt.amount,
                    "Debt recorded"
                );
                outcome.debt_id = Some(debt.id.clone());
            }
            Err(e) => {
                warn!(sale_id = %sale.id, error = %e, "Sale saved but debt record failed");
                outcome.warnings.push(StepWarning {
                    step: FinalizeStep::Debt,
                    message: format!(
                        "Sale {} saved but debt of {} was not recorded: {}",
                        sale.code,
                        debt.amount,
                        e.user_message()
                    ),
                });
            }
        }
    }

    if let Some(tx) = &draft.income {
        match ledger.insert_transaction(tx).await {
            Ok(()) => {
                info!(transaction_id = %tx.id, sale_id = %sale.id, "Sale income recorded");
                outcome.transaction_id = Some(tx.id.clone());
            }
            Err(e) => {
                warn!(sale_id = %sale.id, error = %e, "Sale saved but income entry failed");
                outcome.warnings.push(StepWarning {
                    step: FinalizeStep::Ledger,
                    message: format!(
                        "Sale {} saved but {} was not added to the {} ledger: {}",
                        sale.code,
                        tx.amount,
                        tx.payment_source_id.as_str(),
                        e.user_message()
                    ),
                });
            }
        }
    }

    Ok(outcome)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cart::ProductSnapshot;
    use crate::clock::FixedClock;
    use crate::store::testing::MemoryStore;
    use chrono::TimeZone;

    fn d(v: i64) -> Decimal {
        Decimal::from(v)
    }

    fn clock() -> FixedClock {
        FixedClock(Utc.with_ymd_and_hms(2024, 3, 15, 3, 0, 0).unwrap())
    }

    fn cart_300k() -> Cart {
        let mut cart = Cart::new();
        cart.add_product(
            &ProductSnapshot {
                id: "oil".to_string(),
                name: "Engine oil".to_string(),
                retail_price: d(150_000),
                stock: Some(5),
            },
            2,
        )
        .unwrap();
        cart
    }

    fn customer() -> CustomerRef {
        CustomerRef {
            id: "cus-1".to_string(),
            name: "Anh Minh".to_string(),
        }
    }

    fn ready(payment_type: PaymentType) -> Checkout {
        let mut checkout = Checkout::new("CN1");
        checkout.select_method(PaymentMethod::Cash);
        checkout.select_payment_type(payment_type);
        checkout
    }

    #[test]
    fn test_stage_transitions() {
        let mut checkout = Checkout::new("CN1");
        assert_eq!(checkout.stage(), CheckoutStage::NoPaymentMethod);
        checkout.select_method(PaymentMethod::Transfer);
        assert_eq!(checkout.stage(), CheckoutStage::MethodSelected);
        checkout.select_payment_type(PaymentType::Partial);
        assert_eq!(
            checkout.stage(),
            CheckoutStage::TypeSelected(PaymentType::Partial)
        );
        checkout.enter_partial_amount(d(100_000)).unwrap();
        assert_eq!(checkout.stage(), CheckoutStage::AmountEntered);
        checkout.select_payment_type(PaymentType::Full);
        assert_eq!(checkout.stage(), CheckoutStage::TypeSelected(PaymentType::Full));
        assert!(checkout.enter_partial_amount(d(1)).is_err());

        checkout.confirm(&cart_300k(), None, &clock()).unwrap();
        assert_eq!(checkout.stage(), CheckoutStage::TypeSelected(PaymentType::Full));
        checkout.mark_finalized();
        assert_eq!(checkout.stage(), CheckoutStage::Confirmed);
        assert!(checkout.confirm(&cart_300k(), None, &clock()).is_err());
    }

    #[test]
    fn test_confirm_requires_method_and_type() {
        let mut checkout = Checkout::new("CN1");
        let err = checkout.confirm(&cart_300k(), None, &clock()).unwrap_err();
        assert!(err.to_string().contains("payment method"));
        checkout.select_method(PaymentMethod::Cash);
        let err = checkout.confirm(&cart_300k(), None, &clock()).unwrap_err();
        assert!(err.to_string().contains("payment type"));
        assert!(ready(PaymentType::Full).confirm(&Cart::new(), None, &clock()).is_err());
    }

    #[test]
    fn test_partial_amount_guards() {
        let mut over = ready(PaymentType::Partial);
        over.enter_partial_amount(d(300_001)).unwrap();
        let err = over.confirm(&cart_300k(), Some(&customer()), &clock()).unwrap_err();
        assert!(matches!(err, PosError::Validation(_)));
        assert_eq!(over.stage(), CheckoutStage::AmountEntered);

        let mut zero = ready(PaymentType::Partial);
        zero.enter_partial_amount(d(0)).unwrap();
        assert!(zero.confirm(&cart_300k(), None, &clock()).is_err());

        let mut missing = ready(PaymentType::Partial);
        assert!(missing.confirm(&cart_300k(), None, &clock()).is_err());

        let mut exact = ready(PaymentType::Partial);
        exact.enter_partial_amount(d(300_000)).unwrap();
        let draft = exact.confirm(&cart_300k(), Some(&customer()), &clock()).unwrap();
        assert_eq!(draft.sale.remaining_amount, d(0));
        assert!(draft.debt.is_none());
    }

    #[test]
    fn test_cod_requires_address_and_phone() {
        let mut checkout = ready(PaymentType::Full);
        checkout.set_delivery(Delivery::Cod {
            address: "12 Le Loi".to_string(),
            phone: " ".to_string(),
        });
        let err = checkout.confirm(&cart_300k(), None, &clock()).unwrap_err();
        assert!(err.to_string().contains("Phone"));

        checkout.set_delivery(Delivery::Cod {
            address: String::new(),
            phone: "0901234567".to_string(),
        });
        assert!(checkout.confirm(&cart_300k(), None, &clock()).is_err());

        checkout.set_delivery(Delivery::Cod {
            address: "12 Le Loi".to_string(),
            phone: "0901234567".to_string(),
        });
        let draft = checkout.confirm(&cart_300k(), None, &clock()).unwrap();
        assert!(matches!(draft.sale.delivery, Delivery::Cod { .. }));
    }

    #[test]
    fn test_paid_amount_per_payment_type() {
        let full = ready(PaymentType::Full)
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();
        assert_eq!(full.sale.paid_amount, d(300_000));
        assert!(full.debt.is_none());
        let income = full.income.expect("income entry");
        assert_eq!(income.amount, d(300_000));
        assert_eq!(income.payment_source_id, PaymentSourceId::Cash);
        assert_eq!(income.kind, TransactionType::Income);

        let mut partial = ready(PaymentType::Partial);
        partial.select_method(PaymentMethod::Transfer);
        partial.enter_partial_amount(d(100_000)).unwrap();
        let partial = partial
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();
        assert_eq!(partial.sale.paid_amount, d(100_000));
        assert_eq!(partial.sale.remaining_amount, d(200_000));
        assert_eq!(partial.debt.as_ref().map(|d| d.amount), Some(d(200_000)));
        assert_eq!(
            partial.income.as_ref().map(|t| t.payment_source_id),
            Some(PaymentSourceId::Bank)
        );

        let note = ready(PaymentType::Note)
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();
        assert_eq!(note.sale.paid_amount, d(0));
        assert_eq!(note.debt.as_ref().map(|d| d.amount), Some(d(300_000)));
        assert!(note.income.is_none());
    }

    #[test]
    fn test_remainder_without_customer_is_flagged() {
        let draft = ready(PaymentType::Note)
            .confirm(&cart_300k(), None, &clock())
            .unwrap();
        assert!(draft.debt.is_none());
        assert_eq!(draft.warnings.len(), 1);
        assert!(draft.warnings[0].contains("no customer"));
        assert!(draft.sale.code.starts_with("HD240315-"));
    }

    #[test]
    fn test_discounted_cart_totals_flow_into_sale() {
        let mut cart = cart_300k();
        cart.set_discount_percent(d(10));
        let draft = ready(PaymentType::Full).confirm(&cart, None, &clock()).unwrap();
        assert_eq!(draft.sale.subtotal, d(300_000));
        assert_eq!(draft.sale.discount, d(30_000));
        assert_eq!(draft.sale.total, d(270_000));
        assert_eq!(draft.sale.items[0].line_total, d(300_000));
    }

    #[tokio::test]
    async fn test_finalize_writes_all_records() {
        let store = MemoryStore::named("local");
        let mut checkout = ready(PaymentType::Partial);
        checkout.enter_partial_amount(d(50_000)).unwrap();
        let draft = checkout
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();

        let outcome = finalize_sale(&store, &store, &draft).await.unwrap();
        assert!(outcome.warnings.is_empty());
        assert!(!outcome.is_partially_applied());
        assert!(outcome.debt_id.is_some());
        assert!(outcome.transaction_id.is_some());
        assert_eq!(store.sales.lock().unwrap().len(), 1);
        assert_eq!(store.debts.lock().unwrap()[0].amount, d(250_000));
        assert_eq!(store.transactions.lock().unwrap()[0].amount, d(50_000));
    }

    #[tokio::test]
    async fn test_finalize_reports_debt_failure_without_rollback() {
        let store = MemoryStore::named("local");
        *store.fail_debt.lock().unwrap() = Some(PosError::Network("timeout".into()));
        let mut checkout = ready(PaymentType::Partial);
        checkout.enter_partial_amount(d(50_000)).unwrap();
        let draft = checkout
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();

        let outcome = finalize_sale(&store, &store, &draft).await.unwrap();
        assert!(outcome.is_partially_applied());
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].step, FinalizeStep::Debt);
        assert!(outcome.debt_id.is_none());
        // sale and ledger entry stay in place
        assert_eq!(store.sales.lock().unwrap().len(), 1);
        assert_eq!(store.transactions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_finalize_reports_ledger_failure() {
        let store = MemoryStore::named("local");
        *store.fail_insert.lock().unwrap() = Some(PosError::Backend {
            status: 500,
            code: None,
            message: "insert failed".to_string(),
        });
        let draft = ready(PaymentType::Full)
            .confirm(&cart_300k(), None, &clock())
            .unwrap();

        let outcome = finalize_sale(&store, &store, &draft).await.unwrap();
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].step, FinalizeStep::Ledger);
        assert!(outcome.warnings[0].message.contains("cash ledger"));
        assert_eq!(store.sales.lock().unwrap().len(), 1);
        assert!(store.transactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finalize_aborts_when_sale_fails() {
        let store = MemoryStore::named("local");
        *store.fail_sale.lock().unwrap() = Some(PosError::Network("down".into()));
        let draft = ready(PaymentType::Note)
            .confirm(&cart_300k(), Some(&customer()), &clock())
            .unwrap();

        let err = finalize_sale(&store, &store, &draft).await.unwrap_err();
        assert!(matches!(err, PosError::Network(_)));
        assert!(store.debts.lock().unwrap().is_empty());
        assert!(store.transactions.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_sale_can_be_retried() {
        let store = MemoryStore::named("local");
        *store.fail_sale.lock().unwrap() = Some(PosError::Network("down".into()));
        let mut checkout = ready(PaymentType::Full);
        let draft = checkout.confirm(&cart_300k(), None, &clock()).unwrap();

        let err = checkout.finalize(&store, &store, &draft).await.unwrap_err();
        assert!(matches!(err, PosError::Network(_)));
        assert!(store.sales.lock().unwrap().is_empty());
        assert_ne!(checkout.stage(), CheckoutStage::Confirmed);

        *store.fail_sale.lock().unwrap() = None;
        let outcome = checkout.finalize(&store, &store, &draft).await.unwrap();
        assert_eq!(outcome.sale_id, draft.sale.id);
        assert_eq!(checkout.stage(), CheckoutStage::Confirmed);
        assert_eq!(store.sales.lock().unwrap().len(), 1);
        assert_eq!(store.transactions.lock().unwrap().len(), 1);

        let again = checkout.finalize(&store, &store, &draft).await.unwrap_err();
        assert!(matches!(again, PosError::Validation(_)));
        assert!(checkout.confirm(&cart_300k(), None, &clock()).is_err());
        assert_eq!(store.sales.lock().unwrap().len(), 1);
    }
}
