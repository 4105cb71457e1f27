use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::error::LeagueError;

/// Applies a percentage to an amount in cents, rounding toward zero so
/// payouts never exceed the funds they are computed from.
pub(crate) fn percent_of_cents(amount_cents: i64, percent: Decimal) -> Result<i64, LeagueError> {
    (Decimal::from(amount_cents) * percent / Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or_else(|| {
            LeagueError::Validation(format!("{percent}% of {amount_cents} cents overflows"))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_percent_of_cents_rounds_down() {
        assert_eq!(percent_of_cents(10_000, dec!(10)).unwrap(), 1_000);
        assert_eq!(percent_of_cents(999, dec!(12.5)).unwrap(), 124);
        assert_eq!(percent_of_cents(1, dec!(50)).unwrap(), 0);
        assert_eq!(percent_of_cents(5_000, dec!(0)).unwrap(), 0);
        assert_eq!(percent_of_cents(5_000, dec!(100)).unwrap(), 5_000);
    }
}
