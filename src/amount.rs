use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use std::fmt;

/// Fixed-point decimal with 4 decimal places, stored as a scaled integer.
///
/// Rewards and withdrawals are both expressed in loyalty points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

impl Amount {
    const SCALE: i64 = 10_000;
    const DECIMALS: u32 = 4;

    pub const ZERO: Amount = Amount(0);

    /// Returns `None` for non-finite values and values outside the scaled range.
    pub fn try_from_float(value: f64) -> Option<Self> {
        let scaled = (value * Self::SCALE as f64).round();
        if !scaled.is_finite() || scaled < i64::MIN as f64 || scaled >= i64::MAX as f64 {
            return None;
        }
        Some(Amount(scaled as i64))
    }

    pub fn from_scaled(value: i64) -> Self {
        Amount(value)
    }

    pub fn from_points(points: i64) -> Self {
        Amount(points * Self::SCALE)
    }

    pub fn is_negative(&self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Amount)
    }

    /// Exact conversion for `NUMERIC` columns.
    pub fn to_decimal(self) -> Decimal {
        Decimal::new(self.0, Self::DECIMALS)
    }

    /// Returns `None` when the value does not fit the scaled representation.
    pub fn from_decimal(value: Decimal) -> Option<Self> {
        (value * Decimal::from(Self::SCALE))
            .round()
            .to_i64()
            .map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.abs();
        let whole = abs / Self::SCALE;
        let frac = abs % Self::SCALE;
        write!(f, "{sign}{whole}.{frac:04}")
    }
}

impl std::ops::Add for Amount {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Amount(self.0 + rhs.0)
    }
}

impl std::ops::Sub for Amount {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Amount(self.0 - rhs.0)
    }
}

impl std::ops::AddAssign for Amount {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl std::ops::SubAssign for Amount {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, amount| acc + amount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float(value: f64) -> Amount {
        Amount::try_from_float(value).unwrap()
    }

    #[test]
    fn points_and_scaled_agree() {
        assert_eq!(Amount::from_points(500), Amount::from_scaled(5_000_000));
        assert_eq!(Amount::from_points(0), Amount::ZERO);
    }

    #[test]
    fn accrual_values_convert_from_float() {
        assert_eq!(float(500.0), Amount::from_points(500));
        assert_eq!(float(729.98), Amount::from_scaled(7_299_800));
        assert_eq!(float(29.5), Amount::from_scaled(295_000));
    }

    #[test]
    fn sub_unit_accruals_round_to_nearest() {
        assert_eq!(float(0.00006), Amount::from_scaled(1));
        assert_eq!(float(10.00004), Amount::from_scaled(100_000));
    }

    #[test]
    fn balances_print_with_four_decimals() {
        assert_eq!(Amount::from_points(429).to_string(), "429.0000");
        assert_eq!(float(429.5).to_string(), "429.5000");
        assert_eq!(Amount::ZERO.to_string(), "0.0000");
        assert_eq!(Amount::from_scaled(-2_500).to_string(), "-0.2500");
    }

    #[test]
    fn sign_checks() {
        assert!(Amount::from_scaled(-1).is_negative());
        assert!(!Amount::ZERO.is_negative());
        assert!(!Amount::ZERO.is_positive());
        assert!(Amount::from_scaled(1).is_positive());
    }

    #[test]
    fn credit_and_debit_arithmetic() {
        let mut current = Amount::from_points(500);
        current += float(29.5);
        current -= Amount::from_points(100);
        assert_eq!(current, float(429.5));
        assert_eq!(current - float(429.5), Amount::ZERO);
    }

    #[test]
    fn sum_of_amounts() {
        let total: Amount = [100, 250, 50].into_iter().map(Amount::from_scaled).sum();
        assert_eq!(total, Amount::from_scaled(400));
    }

    #[test]
    fn decimal_conversion_is_exact() {
        let amount = float(729.98);
        let decimal = amount.to_decimal();
        assert_eq!(decimal.to_string(), "729.9800");
        assert_eq!(Amount::from_decimal(decimal), Some(amount));
    }

    #[test]
    fn decimal_with_extra_precision_rounds() {
        let decimal = Decimal::new(123_456, 5); // 1.23456
        assert_eq!(Amount::from_decimal(decimal), Some(Amount::from_scaled(12346)));
    }

    #[test]
    fn out_of_range_floats_are_rejected() {
        assert_eq!(Amount::try_from_float(1e30), None);
        assert_eq!(Amount::try_from_float(-1e30), None);
        assert_eq!(Amount::try_from_float(f64::NAN), None);
        assert_eq!(Amount::try_from_float(f64::INFINITY), None);
        assert_eq!(Amount::try_from_float(922_337_203_685_478.0), None);
        assert!(Amount::try_from_float(900_000_000_000_000.0).is_some());
    }

    #[test]
    fn checked_add_detects_overflow() {
        let max = Amount::from_scaled(i64::MAX);
        assert_eq!(max.checked_add(Amount::from_scaled(1)), None);
        assert_eq!(
            Amount::from_points(1).checked_add(Amount::from_points(2)),
            Some(Amount::from_points(3))
        );
    }
}
