//! Money helpers.
//!
//! All amounts are `Decimal` in whole currency units (VND has no minor unit).
//! Rounding is half-up to match the register display.

use rust_decimal::prelude::*;
use std::str::FromStr;

/// Rounding strategy for monetary values (0 decimal places, half away from zero).
const ROUNDING: RoundingStrategy = RoundingStrategy::MidpointAwayFromZero;

/// Largest magnitude accepted for one amount, price or opening balance:
/// 10^15 đồng. Every amount is checked against it where it enters the
/// crate, so sums over any number of stored rows stay below `Decimal::MAX`.
pub const MAX_AMOUNT: Decimal = Decimal::from_parts(2_764_472_320, 232_830, 0, false, 0);

/// Markup applied to an import price to propose a retail price.
pub const RETAIL_MARKUP: Decimal = Decimal::from_parts(15, 0, 0, false, 1);

pub fn round_whole(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(0, ROUNDING)
}

/// `round(base * percent / 100)`.
pub fn percent_of(base: Decimal, percent: Decimal) -> Decimal {
    round_whole(base * percent / Decimal::ONE_HUNDRED)
}

/// True when `|value| <= MAX_AMOUNT`.
pub fn in_range(value: Decimal) -> bool {
    value.abs() <= MAX_AMOUNT
}

/// Clamp into `[min, max]`. When `max < min` the result is `min`.
pub fn clamp(value: Decimal, min: Decimal, max: Decimal) -> Decimal {
    value.min(max).max(min)
}

/// Parse a stored decimal column (TEXT) back into a `Decimal`.
pub fn parse_stored(raw: &str) -> Result<Decimal, rust_decimal::Error> {
    Decimal::from_str(raw.trim())
}
