//! # Money Module
//!
//! Provides the `Money` type for handling monetary values safely.
//!
//! ## Why Integer Money?
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  THE FLOATING POINT PROBLEM                                             │
//! │                                                                         │
//! │  Upstream sends "19.90", 19.9, "19,90" or {"amount": "19.90"}.          │
//! │  Parsing any of those through f64 first gives 19.899999999999999.      │
//! │                                                                         │
//! │  OUR SOLUTION: Decimal parse → integer cents                           │
//! │    "19.90" ──rust_decimal──► 19.90 ──×100, round──► 1990 cents          │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fiskal_core::money::Money;
//!
//! let total = Money::parse_str("100.00").unwrap();
//! assert_eq!(total.cents(), 10000);
//! assert_eq!(total.to_string(), "100.00");
//! ```

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

// =============================================================================
// Money Type
// =============================================================================

/// A monetary value in the smallest currency unit (stotinki, cents).
///
/// ## Design Decisions
/// - **i64 (signed)**: refunds and discounts may be negative upstream
/// - **Single field tuple struct**: zero-cost abstraction over i64
/// - Currency travels next to the amount, never inside it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Money(i64);

impl Money {
    /// Creates a Money value from cents (the smallest currency unit).
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// Returns the value in cents.
    #[inline]
    pub const fn cents(&self) -> i64 {
        self.0
    }

    /// Returns zero money value.
    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    /// Checks if the value is zero.
    #[inline]
    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Checks if the value is positive (greater than zero).
    #[inline]
    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Returns the absolute value.
    #[inline]
    pub const fn abs(&self) -> Self {
        Money(self.0.abs())
    }

    /// Converts an exact decimal major-unit amount into cents.
    ///
    /// Rounds half away from zero at two decimal places, which is how
    /// fiscal printers round. Returns `None` when the value does not fit.
    pub fn from_decimal(amount: Decimal) -> Option<Self> {
        let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
        let cents = rounded.checked_mul(Decimal::ONE_HUNDRED)?;
        cents.trunc().to_i64().map(Money)
    }

    /// Parses a major-unit amount from text.
    ///
    /// ## Accepted Shapes
    /// ```text
    /// "100"      → 10000
    /// "19.90"    → 1990
    /// " 19,90 "  → 1990   (comma decimal separator)
    /// "1e2"      → 10000  (scientific notation)
    /// "abc"      → None
    /// ```
    pub fn parse_str(raw: &str) -> Option<Self> {
        let cleaned: String = raw.trim().chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.is_empty() {
            return None;
        }

        // A lone comma is a decimal separator, several are thousand separators
        let cleaned = match cleaned.matches(',').count() {
            0 => cleaned,
            1 if !cleaned.contains('.') => cleaned.replace(',', "."),
            _ => cleaned.replace(',', ""),
        };

        Decimal::from_str(&cleaned)
            .or_else(|_| Decimal::from_scientific(&cleaned))
            .ok()
            .and_then(Money::from_decimal)
    }

    /// Parses a major-unit amount from a JSON scalar (string or number).
    ///
    /// Objects and arrays are not amounts; callers unwrap those first.
    pub fn parse_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Money::parse_str(s),
            // serde_json renders numbers without float noise ("19.9"), so the
            // textual form round-trips exactly through Decimal
            Value::Number(n) => Money::parse_str(&n.to_string()),
            _ => None,
        }
    }
}

// =============================================================================
// Trait Implementations
// =============================================================================

/// Renders as a plain two-decimal major-unit amount, e.g. `"100.00"`.
///
/// ## Note
/// No currency symbol: receipts print the ISO code next to the amount.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl Default for Money {
    fn default() -> Self {
        Money::zero()
    }
}

impl Add for Money {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Money(self.0 + other.0)
    }
}

impl AddAssign for Money {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.0 += other.0;
    }
}

impl Sub for Money {
    type Output = Self;

    #[inline]
    fn sub(self, other: Self) -> Self {
        Money(self.0 - other.0)
    }
}

impl SubAssign for Money {
    #[inline]
    fn sub_assign(&mut self, other: Self) {
        self.0 -= other.0;
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_str_variants() {
        assert_eq!(Money::parse_str("100").unwrap().cents(), 10000);
        assert_eq!(Money::parse_str("19.90").unwrap().cents(), 1990);
        assert_eq!(Money::parse_str(" 19,90 ").unwrap().cents(), 1990);
        assert_eq!(Money::parse_str("1,234.50").unwrap().cents(), 123450);
        assert_eq!(Money::parse_str("-5.5").unwrap().cents(), -550);
        assert!(Money::parse_str("").is_none());
        assert!(Money::parse_str("abc").is_none());
    }

    #[test]
    fn test_rounding_is_half_away_from_zero() {
        assert_eq!(Money::parse_str("0.005").unwrap().cents(), 1);
        assert_eq!(Money::parse_str("0.004").unwrap().cents(), 0);
        assert_eq!(Money::parse_str("-0.005").unwrap().cents(), -1);
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(Money::parse_value(&json!(19.9)).unwrap().cents(), 1990);
        assert_eq!(Money::parse_value(&json!(100)).unwrap().cents(), 10000);
        assert_eq!(Money::parse_value(&json!("0.10")).unwrap().cents(), 10);
        assert!(Money::parse_value(&json!({"amount": "1"})).is_none());
        assert!(Money::parse_value(&json!(null)).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(Money::from_cents(10000).to_string(), "100.00");
        assert_eq!(Money::from_cents(1099).to_string(), "10.99");
        assert_eq!(Money::from_cents(-550).to_string(), "-5.50");
        assert_eq!(Money::from_cents(5).to_string(), "0.05");
    }

    #[test]
    fn test_arithmetic() {
        let a = Money::from_cents(1000);
        let b = Money::from_cents(250);
        assert_eq!((a + b).cents(), 1250);
        assert_eq!((a - b).cents(), 750);

        let mut c = Money::zero();
        c += a;
        c -= b;
        assert_eq!(c.cents(), 750);
        assert!(c.is_positive());
    }
}
