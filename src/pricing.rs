//! Stock receiving (import) lines and retail price proposals.
//!
//! Entering an import price proposes a retail price of 1.5x, but only while
//! the retail price has not been typed in by hand. The line remembers where
//! its retail price came from instead of guessing from the value.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{PosError, PosResult};
use crate::ledger::{CashTransaction, NewCashTransaction, PaymentSourceId, TransactionType};
use crate::money;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "lowercase")]
pub enum RetailPrice {
    #[default]
    Unset,
    /// Proposed from the import price; follows it on every change.
    Derived(Decimal),
    /// Typed in by staff; never overwritten.
    Manual(Decimal),
}

impl RetailPrice {
    pub fn value(self) -> Option<Decimal> {
        match self {
            Self::Unset => None,
            Self::Derived(v) | Self::Manual(v) => Some(v),
        }
    }

    pub fn is_manual(self) -> bool {
        matches!(self, Self::Manual(_))
    }
}

pub fn derive_retail_price(import_price: Decimal) -> Decimal {
    money::round_whole(import_price * money::RETAIL_MARKUP)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportLine {
    pub product_id: String,
    pub name: String,
    pub quantity: u32,
    import_price: Decimal,
    retail: RetailPrice,
}

impl ImportLine {
    pub fn new(product_id: impl Into<String>, name: impl Into<String>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            name: name.into(),
            quantity: quantity.max(1),
            import_price: Decimal::ZERO,
            retail: RetailPrice::Unset,
        }
    }

    pub fn import_price(&self) -> Decimal {
        self.import_price
    }

    pub fn retail(&self) -> RetailPrice {
        self.retail
    }

    pub fn set_import_price(&mut self, price: Decimal) -> PosResult<()> {
        if price < Decimal::ZERO {
            return Err(PosError::validation("Import price cannot be negative"));
        }
        self.import_price = price;
        if !self.retail.is_manual() {
            self.retail = if price.is_zero() {
                RetailPrice::Unset
            } else {
                RetailPrice::Derived(derive_retail_price(price))
            };
            debug!(product_id = %self.product_id, retail = ?self.retail, "Proposed retail price");
        }
        Ok(())
    }

    /// `None` clears a manual price so the proposal takes over again.
    pub fn set_retail_price(&mut self, price: Option<Decimal>) -> PosResult<()> {
        self.retail = match price {
            Some(p) if p < Decimal::ZERO => {
                return Err(PosError::validation("Retail price cannot be negative"))
            }
            Some(p) => RetailPrice::Manual(p),
            None if self.import_price.is_zero() => RetailPrice::Unset,
            None => RetailPrice::Derived(derive_retail_price(self.import_price)),
        };
        Ok(())
    }

    pub fn set_quantity(&mut self, quantity: u32) {
        self.quantity = quantity.max(1);
    }

    pub fn line_total(&self) -> Decimal {
        self.import_price * Decimal::from(self.quantity)
    }
}

/// A delivery from a supplier, paid from one payment source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReceipt {
    pub branch_id: String,
    #[serde(default)]
    pub supplier: Option<String>,
    pub lines: Vec<ImportLine>,
}

impl ImportReceipt {
    pub fn total(&self) -> Decimal {
        self.lines.iter().map(ImportLine::line_total).sum()
    }

    pub fn validate(&self) -> PosResult<()> {
        if self.lines.is_empty() {
            return Err(PosError::validation("Import receipt has no lines"));
        }
        for line in &self.lines {
            if line.import_price <= Decimal::ZERO {
                return Err(PosError::validation(format!(
                    "Missing import price for {}",
                    line.name
                )));
            }
            match line.retail.value() {
                None => {
                    return Err(PosError::validation(format!(
                        "Missing retail price for {}",
                        line.name
                    )))
                }
                Some(retail) if retail < line.import_price => {
                    warn!(
                        product_id = %line.product_id,
                        retail = %retail,
                        import_price = %line.import_price,
                        "Retail price below import price"
                    );
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The expense entry recording payment for this delivery.
    pub fn payment_transaction(
        &self,
        source: PaymentSourceId,
        clock: &dyn Clock,
    ) -> PosResult<CashTransaction> {
        self.validate()?;
        NewCashTransaction {
            kind: TransactionType::Expense,
            amount: self.total(),
            branch_id: self.branch_id.clone(),
            payment_source_id: source,
            date: None,
            category: "import".to_string(),
            notes: self.supplier.as_ref().map(|s| format!("Supplier: {s}")),
        }
        .into_transaction(clock)
    }
}
