//! Sales cart and pricing.
//!
//! Discount is either an absolute amount or a percentage of the subtotal,
//! never both: switching mode zeroes the field of the mode being left.
//! In percent mode the absolute discount is derived from the subtotal and
//! recomputed whenever either changes.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PosError, PosResult};
use crate::money;

/// Product as seen when it was put in the cart. `stock` is `None` for
/// services and other untracked items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductSnapshot {
    pub id: String,
    pub name: String,
    pub retail_price: Decimal,
    #[serde(default)]
    pub stock: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartLine {
    pub product_id: String,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: u32,
    pub stock: Option<u32>,
}

impl CartLine {
    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }

    fn check_stock(&self, quantity: u32) -> PosResult<()> {
        match self.stock {
            Some(stock) if quantity > stock => Err(PosError::validation(format!(
                "Only {stock} of {} in stock",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscountMode {
    #[default]
    Amount,
    Percent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Cart {
    lines: Vec<CartLine>,
    discount_mode: DiscountMode,
    discount_amount: Decimal,
    discount_percent: Decimal,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    // -- lines ---------------------------------------------------------------

    /// Add `quantity` of a product, merging with an existing line.
    pub fn add_product(&mut self, product: &ProductSnapshot, quantity: u32) -> PosResult<()> {
        check_price(product.retail_price)?;
        let quantity = quantity.max(1);
        if let Some(line) = self.lines.iter_mut().find(|l| l.product_id == product.id) {
            let wanted = line.quantity.saturating_add(quantity);
            line.check_stock(wanted)?;
            line.quantity = wanted;
        } else {
            let line = CartLine {
                product_id: product.id.clone(),
                name: product.name.clone(),
                unit_price: product.retail_price,
                quantity,
                stock: product.stock,
            };
            line.check_stock(quantity)?;
            self.lines.push(line);
        }
        debug!(product_id = %product.id, quantity, "Added product to cart");
        self.refresh_discount();
        Ok(())
    }

    /// Set a line's quantity; values below one are raised to one.
    pub fn set_quantity(&mut self, product_id: &str, quantity: u32) -> PosResult<()> {
        let quantity = quantity.max(1);
        let line = self.line_mut(product_id)?;
        line.check_stock(quantity)?;
        line.quantity = quantity;
        self.refresh_discount();
        Ok(())
    }

    pub fn set_unit_price(&mut self, product_id: &str, unit_price: Decimal) -> PosResult<()> {
        check_price(unit_price)?;
        self.line_mut(product_id)?.unit_price = unit_price;
        self.refresh_discount();
        Ok(())
    }

    pub fn remove(&mut self, product_id: &str) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| l.product_id != product_id);
        let removed = self.lines.len() != before;
        if removed {
            self.refresh_discount();
        }
        removed
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    fn line_mut(&mut self, product_id: &str) -> PosResult<&mut CartLine> {
        self.lines
            .iter_mut()
            .find(|l| l.product_id == product_id)
            .ok_or_else(|| PosError::validation(format!("Product not in cart: {product_id}")))
    }

    /// Re-check every line against its stock snapshot.
    pub fn validate_stock(&self) -> PosResult<()> {
        self.lines.iter().try_for_each(|l| l.check_stock(l.quantity))
    }

    // -- discount ------------------------------------------------------------

    pub fn discount_mode(&self) -> DiscountMode {
        self.discount_mode
    }

    pub fn discount_percent(&self) -> Decimal {
        self.discount_percent
    }

    pub fn set_discount_mode(&mut self, mode: DiscountMode) {
        if mode == self.discount_mode {
            return;
        }
        match mode {
            DiscountMode::Amount => self.discount_percent = Decimal::ZERO,
            DiscountMode::Percent => self.discount_amount = Decimal::ZERO,
        }
        self.discount_mode = mode;
        self.refresh_discount();
    }

    /// Enter an absolute discount, clamped to `[0, subtotal]`.
    pub fn set_discount_amount(&mut self, amount: Decimal) {
        self.set_discount_mode(DiscountMode::Amount);
        self.discount_amount = money::clamp(amount, Decimal::ZERO, self.subtotal());
    }

    /// Enter a percentage, clamped to `[0, 100]`.
    pub fn set_discount_percent(&mut self, percent: Decimal) {
        self.set_discount_mode(DiscountMode::Percent);
        self.discount_percent = money::clamp(percent, Decimal::ZERO, Decimal::ONE_HUNDRED);
        self.refresh_discount();
    }

    fn refresh_discount(&mut self) {
        let subtotal = self.subtotal();
        self.discount_amount = match self.discount_mode {
            DiscountMode::Percent => money::percent_of(subtotal, self.discount_percent),
            DiscountMode::Amount => money::clamp(self.discount_amount, Decimal::ZERO, subtotal),
        };
    }

    // -- totals --------------------------------------------------------------

    pub fn subtotal(&self) -> Decimal {
        self.lines.iter().map(CartLine::line_total).sum()
    }

    pub fn discount(&self) -> Decimal {
        self.discount_amount
    }

    pub fn total(&self) -> Decimal {
        (self.subtotal() - self.discount_amount).max(Decimal::ZERO)
    }

    pub fn totals(&self) -> CartTotals {
        CartTotals {
            subtotal: self.subtotal(),
            discount: self.discount(),
            total: self.total(),
        }
    }
}

fn check_price(price: Decimal) -> PosResult<()> {
    if price < Decimal::ZERO {
        return Err(PosError::validation("Price cannot be negative"));
    }
    if !money::in_range(price) {
        return Err(PosError::validation(format!(
            "Price must not exceed {}",
            money::MAX_AMOUNT
        )));
    }
    Ok(())
}
