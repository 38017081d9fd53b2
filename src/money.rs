// =============================================================================
// Money — fixed-point rupee arithmetic
// =============================================================================
//
// Every balance, premium, and PnL figure flows through this type. Native
// binary floats drift under repeated add/subtract cycles and break the wallet
// invariants, so the engine stores money as a 2-digit fixed-point decimal and
// only downcasts to f64 at the indicator/display boundary.
//
// Division uses banker's rounding (round-half-to-even) at 2 digits.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// Fixed-point rupee amount with a 2-digit fractional scale.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    /// Whole-rupee constructor.
    pub fn from_rupees(rupees: i64) -> Self {
        Self(Decimal::from(rupees)).normalized()
    }

    /// Rupees + paise, e.g. `Money::from_paise(12345)` == ₹123.45.
    pub fn from_paise(paise: i64) -> Self {
        Self(Decimal::new(paise, 2))
    }

    /// Lossy constructor for values arriving from the feed or indicator
    /// layer. Rounded to 2 digits immediately.
    pub fn from_f64(value: f64) -> Self {
        let d = Decimal::from_f64(value).unwrap_or(Decimal::ZERO);
        Self(d).normalized()
    }

    pub fn from_decimal(d: Decimal) -> Self {
        Self(d).normalized()
    }

    pub fn add(self, other: Money) -> Money {
        Self(self.0 + other.0).normalized()
    }

    pub fn subtract(self, other: Money) -> Money {
        Self(self.0 - other.0).normalized()
    }

    /// Money × Money (used for fraction multipliers stored as Money).
    pub fn multiply(self, other: Money) -> Money {
        Self(self.0 * other.0).normalized()
    }

    /// Money × integer quantity.
    pub fn multiply_qty(self, qty: i64) -> Money {
        Self(self.0 * Decimal::from(qty)).normalized()
    }

    /// Division with banker's rounding. Division by zero yields zero, which
    /// callers treat as "skip" (a zero premium or zero lot size never sizes
    /// an order).
    pub fn divide(self, other: Money) -> Money {
        if other.0.is_zero() {
            return Money::ZERO;
        }
        Self(self.0 / other.0).normalized()
    }

    pub fn min(self, other: Money) -> Money {
        if self.0 <= other.0 { self } else { other }
    }

    pub fn max(self, other: Money) -> Money {
        if self.0 >= other.0 { self } else { other }
    }

    pub fn less_than(self, other: Money) -> bool {
        self.0 < other.0
    }

    pub fn negate(self) -> Money {
        Self(-self.0)
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    /// Downcast for indicator math and percentage calculations only.
    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    /// Display form with rupee sign and thousands separators, e.g.
    /// `₹1,234.50` or `-₹20.00`.
    pub fn format(self) -> String {
        let rounded = self.0.round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven);
        let negative = rounded.is_sign_negative();
        let abs = rounded.abs();
        let s = format!("{abs:.2}");
        let (int_part, frac_part) = s.split_once('.').unwrap_or((s.as_str(), "00"));

        let mut grouped = String::new();
        let digits: Vec<char> = int_part.chars().collect();
        for (i, c) in digits.iter().enumerate() {
            if i > 0 && (digits.len() - i) % 3 == 0 {
                grouped.push(',');
            }
            grouped.push(*c);
        }

        if negative {
            format!("-\u{20B9}{grouped}.{frac_part}")
        } else {
            format!("\u{20B9}{grouped}.{frac_part}")
        }
    }

    fn normalized(self) -> Self {
        Self(
            self.0
                .round_dp_with_strategy(2, RoundingStrategy::MidpointNearestEven),
        )
    }
}

impl std::fmt::Display for Money {
    /// Plain decimal form ("1234.50") — the interchange representation used
    /// in Redis hashes.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl std::str::FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(s.parse::<Decimal>()?).normalized())
    }
}

impl std::ops::Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money {
        Money::add(self, rhs)
    }
}

impl std::ops::Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money {
        Money::subtract(self, rhs)
    }
}

impl std::ops::Neg for Money {
    type Output = Money;
    fn neg(self) -> Money {
        self.negate()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_addition_does_not_drift() {
        // 0.1 + 0.1 ... a thousand times lands exactly on 100.00, which f64
        // cannot do.
        let step = Money::from_paise(10);
        let mut total = Money::ZERO;
        for _ in 0..1000 {
            total = total + step;
        }
        assert_eq!(total, Money::from_rupees(100));
    }

    #[test]
    fn divide_uses_bankers_rounding() {
        // 0.125 rounds to 0.12 (half to even), 0.135 rounds to 0.14.
        let a = Money::from_paise(25).divide(Money::from_rupees(2));
        assert_eq!(a.to_string(), "0.12");
        let b = Money::from_paise(27).divide(Money::from_rupees(2));
        assert_eq!(b.to_string(), "0.14");
    }

    #[test]
    fn divide_by_zero_is_zero() {
        assert_eq!(Money::from_rupees(100).divide(Money::ZERO), Money::ZERO);
    }

    #[test]
    fn multiply_qty_covers_principal_math() {
        let premium = Money::from_f64(102.35);
        assert_eq!(premium.multiply_qty(75).to_string(), "7676.25");
    }

    #[test]
    fn format_groups_thousands() {
        assert_eq!(Money::from_rupees(100_000).format(), "\u{20B9}100,000.00");
        assert_eq!(Money::from_f64(1234.5).format(), "\u{20B9}1,234.50");
        assert_eq!(Money::from_rupees(-20).format(), "-\u{20B9}20.00");
        assert_eq!(Money::from_rupees(7).format(), "\u{20B9}7.00");
    }

    #[test]
    fn interchange_string_round_trips() {
        let m = Money::from_f64(98_540.55);
        let parsed: Money = m.to_string().parse().unwrap();
        assert_eq!(parsed, m);
    }

    #[test]
    fn min_max_compare() {
        let a = Money::from_rupees(5);
        let b = Money::from_rupees(9);
        assert_eq!(a.min(b), a);
        assert_eq!(a.max(b), b);
        assert!(a.less_than(b));
        assert!(!b.less_than(a));
    }

    #[test]
    fn negate_flips_sign() {
        let m = Money::from_rupees(42);
        assert!(m.negate().is_negative());
        assert_eq!(m.negate().negate(), m);
    }
}
