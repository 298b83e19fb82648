//! Fixed-precision money amounts.
//!
//! Every balance in the ledger is an integer count of micro-units (6 decimal
//! places). Floating point never touches a stored balance; percentages are
//! applied as basis points and truncate toward zero.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::iter::Sum;
use std::ops::Neg;
use std::str::FromStr;

/// Number of decimal places carried by an [`Amount`].
pub const AMOUNT_DECIMALS: u32 = 6;

/// 1 unit = 1_000_000 micro-units.
pub const AMOUNT_SCALE: i64 = 1_000_000;

const BPS_SCALE: i128 = 10_000;

/// Signed fixed-point amount with 6 decimal places.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(i64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    /// Whole units, e.g. `Amount::units(100)` is `100.000000`.
    pub const fn units(units: i64) -> Self {
        Amount(units * AMOUNT_SCALE)
    }

    pub const fn from_micros(micros: i64) -> Self {
        Amount(micros)
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn abs(self) -> Self {
        Amount(self.0.abs())
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn checked_mul_int(self, factor: u64) -> Option<Amount> {
        let factor = i64::try_from(factor).ok()?;
        self.0.checked_mul(factor).map(Amount)
    }

    /// Saturating add, used for statistics only, never for balances.
    pub fn saturating_add(self, other: Amount) -> Amount {
        Amount(self.0.saturating_add(other.0))
    }

    /// Multiply by a basis-point factor (10_000 bps = 1.0), truncating.
    pub fn mul_bps(self, bps: u32) -> Amount {
        let product = self.0 as i128 * bps as i128 / BPS_SCALE;
        Amount(product.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
    }

    /// Multiply by a percentage expressed as a float from configuration.
    ///
    /// The percentage is first rounded to whole basis points so that the
    /// money arithmetic itself stays integral.
    pub fn mul_percent(self, percent: f64) -> Amount {
        let bps = (percent * 100.0).round().clamp(0.0, u32::MAX as f64) as u32;
        self.mul_bps(bps)
    }

    pub fn max(self, other: Amount) -> Amount {
        if self >= other {
            self
        } else {
            other
        }
    }

    pub fn min(self, other: Amount) -> Amount {
        if self <= other {
            self
        } else {
            other
        }
    }
}

impl Neg for Amount {
    type Output = Amount;

    fn neg(self) -> Amount {
        Amount(-self.0)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, |acc, a| acc.saturating_add(a))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = (self.0 as i128).abs();
        let scale = AMOUNT_SCALE as i128;
        write!(f, "{}{}.{:06}", sign, abs / scale, abs % scale)
    }
}

/// Error returned when a decimal string cannot be represented exactly.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid amount '{input}': {reason}")]
pub struct ParseAmountError {
    pub input: String,
    pub reason: &'static str,
}

impl FromStr for Amount {
    type Err = ParseAmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParseAmountError {
            input: s.to_string(),
            reason,
        };

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        if digits.is_empty() {
            return Err(err("empty"));
        }

        let (whole, frac) = match digits.split_once('.') {
            Some((w, f)) => (w, f),
            None => (digits, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(err("no digits"));
        }
        if !whole.chars().all(|c| c.is_ascii_digit()) || !frac.chars().all(|c| c.is_ascii_digit()) {
            return Err(err("not a decimal number"));
        }
        if frac.len() > AMOUNT_DECIMALS as usize {
            return Err(err("more than 6 decimal places"));
        }

        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| err("out of range"))?
        };
        let mut frac_value: i64 = 0;
        for (i, c) in frac.chars().enumerate() {
            let digit = c.to_digit(10).unwrap_or(0) as i64;
            frac_value += digit * 10_i64.pow(AMOUNT_DECIMALS - 1 - i as u32);
        }

        let micros = whole_value
            .checked_mul(AMOUNT_SCALE)
            .and_then(|w| w.checked_add(frac_value))
            .ok_or_else(|| err("out of range"))?;

        Ok(Amount(if negative { -micros } else { micros }))
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

struct AmountVisitor;

impl<'de> Visitor<'de> for AmountVisitor {
    type Value = Amount;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a decimal string or a number with at most 6 decimal places")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
        v.parse().map_err(E::custom)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        v.checked_mul(AMOUNT_SCALE)
            .map(Amount)
            .ok_or_else(|| E::custom("amount out of range"))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        i64::try_from(v)
            .ok()
            .and_then(|v| v.checked_mul(AMOUNT_SCALE))
            .map(Amount)
            .ok_or_else(|| E::custom("amount out of range"))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        // Config files write `1000.5`; go through the string form so the
        // 6dp limit applies the same way.
        format!("{:.6}", v).parse().map_err(E::custom)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Amount, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let a: Amount = "12.5".parse().unwrap();
        assert_eq!(a.micros(), 12_500_000);
        assert_eq!(a.to_string(), "12.500000");

        let b: Amount = "-0.000001".parse().unwrap();
        assert_eq!(b.micros(), -1);
        assert_eq!(b.to_string(), "-0.000001");

        assert_eq!(Amount::units(100).to_string(), "100.000000");
    }

    #[test]
    fn test_rejects_excess_precision() {
        assert!("1.1234567".parse::<Amount>().is_err());
        assert!("abc".parse::<Amount>().is_err());
        assert!("".parse::<Amount>().is_err());
        assert!("1.2.3".parse::<Amount>().is_err());
    }

    #[test]
    fn test_bps_math_truncates() {
        let total = Amount::units(1000);
        assert_eq!(total.mul_bps(500), Amount::units(50));
        assert_eq!(total.mul_percent(30.0), Amount::units(300));

        // 0.000003 * 0.5 = 0.0000015 -> 0.000001
        assert_eq!(Amount::from_micros(3).mul_bps(5_000), Amount::from_micros(1));
    }

    #[test]
    fn test_serde_forms() {
        let json = serde_json::to_string(&Amount::units(7)).unwrap();
        assert_eq!(json, "\"7.000000\"");

        let from_str: Amount = serde_json::from_str("\"7.25\"").unwrap();
        let from_int: Amount = serde_json::from_str("7").unwrap();
        let from_float: Amount = serde_json::from_str("7.25").unwrap();
        assert_eq!(from_str, from_float);
        assert_eq!(from_int, Amount::units(7));
    }

    #[test]
    fn test_checked_ops() {
        assert!(Amount::from_micros(i64::MAX).checked_add(Amount::from_micros(1)).is_none());
        assert_eq!(
            Amount::units(5).checked_sub(Amount::units(7)),
            Some(Amount::units(-2))
        );
        assert_eq!(Amount::units(20).checked_mul_int(50), Some(Amount::units(1000)));
    }
}
