//! Money arithmetic over integer cents
//!
//! All money values are BIGINT minor units (cents). The rounding helpers
//! here implement half-up rounding in pure integer math so that
//! `round(x, 2)` semantics over decimal amounts hold exactly.

/// Compute `round(amount * numer / denom)` with half-up rounding, without
/// ever touching floating point. `denom` must be positive.
///
/// Intermediate math is done in i128 so realistic cent amounts cannot
/// overflow.
pub fn round_mul_div(amount: i64, numer: i64, denom: i64) -> i64 {
    debug_assert!(denom > 0, "round_mul_div denominator must be positive");
    if denom <= 0 {
        return 0;
    }
    let product = amount as i128 * numer as i128;
    let denom = denom as i128;
    // Half-up: add half the denominator before dividing (sign-aware).
    let rounded = if product >= 0 {
        (product * 2 + denom) / (denom * 2)
    } else {
        (product * 2 - denom) / (denom * 2)
    };
    rounded as i64
}

/// Percentage of a finite limit consumed, capped at 100.
///
/// A zero or negative limit yields 0 (a zero limit means nothing is
/// granted, not that everything is consumed).
pub fn percentage_of_limit(used: i64, limit: i64) -> u8 {
    if limit <= 0 {
        return 0;
    }
    let pct = round_mul_div(used.max(0), 100, limit);
    pct.clamp(0, 100) as u8
}

/// Apply a flat tax rate expressed in basis points (1% = 100 bp) and
/// return the tax amount in cents.
pub fn apply_tax(amount_cents: i64, tax_rate_bp: i64) -> i64 {
    if tax_rate_bp <= 0 {
        return 0;
    }
    round_mul_div(amount_cents, tax_rate_bp, 10_000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_mul_div_exact() {
        // 450.00 over 30 days, 10 days remaining -> 150.00
        assert_eq!(round_mul_div(45_000, 10, 30), 15_000);
    }

    #[test]
    fn test_round_mul_div_half_up() {
        // 1.00 / 3 = 0.333... -> 0.33; 2.00 / 3 = 0.666... -> 0.67
        assert_eq!(round_mul_div(100, 1, 3), 33);
        assert_eq!(round_mul_div(200, 1, 3), 67);
        // exactly half a cent rounds up
        assert_eq!(round_mul_div(1, 1, 2), 1);
    }

    #[test]
    fn test_round_mul_div_negative() {
        assert_eq!(round_mul_div(-100, 1, 3), -33);
        assert_eq!(round_mul_div(-1, 1, 2), -1);
    }

    #[test]
    fn test_percentage_of_limit() {
        assert_eq!(percentage_of_limit(5, 10), 50);
        assert_eq!(percentage_of_limit(10, 10), 100);
        assert_eq!(percentage_of_limit(25, 10), 100, "capped at 100");
        assert_eq!(percentage_of_limit(1, 3), 33);
        assert_eq!(percentage_of_limit(0, 10), 0);
        assert_eq!(percentage_of_limit(5, 0), 0, "zero limit avoids divide-by-zero");
    }

    #[test]
    fn test_apply_tax() {
        // 18% of 100.00 = 18.00
        assert_eq!(apply_tax(10_000, 1_800), 1_800);
        // 7.5% of 99.99 = 7.50 (7.49925 rounds up)
        assert_eq!(apply_tax(9_999, 750), 750);
        assert_eq!(apply_tax(10_000, 0), 0);
    }
}
