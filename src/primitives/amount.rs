use {
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    iter::Sum,
  },
  thiserror::Error,
};

/// Number of decimal digits carried by account values.
pub const AMOUNT_PRECISION: u32 = 3;

const SCALE: i64 = 10i64.pow(AMOUNT_PRECISION);

/// Largest magnitude accepted from the wire. Keeps every amount
/// exactly representable as an IEEE double and leaves headroom for
/// sums of many amounts.
const MAX_MILLIS: i64 = (1i64 << 52) / SCALE * SCALE;

/// A fixed-point account value with three decimal digits.
///
/// Stored as an integer count of thousandths so that arithmetic is
/// exact. JSON carries amounts as plain numbers (`100.0`, `0.001`),
/// and the canonical hash preimage renders them as `%.3f`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Amount(i64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AmountError {
  #[error("amount is not a finite number")]
  NotFinite,

  #[error("amount out of range")]
  OutOfRange,
}

impl Amount {
  pub const ZERO: Amount = Amount(0);

  pub const fn from_millis(millis: i64) -> Self {
    Self(millis)
  }

  pub const fn millis(self) -> i64 {
    self.0
  }

  pub fn is_positive(self) -> bool {
    self.0 > 0
  }

  /// Converts a wire number into a fixed-point amount, rounding to
  /// the third decimal digit.
  pub fn try_from_f64(value: f64) -> Result<Self, AmountError> {
    if !value.is_finite() {
      return Err(AmountError::NotFinite);
    }
    let scaled = (value * SCALE as f64).round();
    if scaled.abs() > MAX_MILLIS as f64 {
      return Err(AmountError::OutOfRange);
    }
    Ok(Self(scaled as i64))
  }

  pub fn to_f64(self) -> f64 {
    self.0 as f64 / SCALE as f64
  }

  pub fn checked_add(self, other: Amount) -> Option<Amount> {
    self.0.checked_add(other.0).map(Amount)
  }

  pub fn checked_sub(self, other: Amount) -> Option<Amount> {
    self.0.checked_sub(other.0).map(Amount)
  }

  pub fn checked_neg(self) -> Option<Amount> {
    self.0.checked_neg().map(Amount)
  }
}

/// Renders the canonical `%.3f` form used in hash preimages,
/// e.g. `100.000`, `-0.500`.
impl Display for Amount {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let sign = if self.0 < 0 { "-" } else { "" };
    let abs = self.0.unsigned_abs();
    write!(f, "{}{}.{:03}", sign, abs / SCALE as u64, abs % SCALE as u64)
  }
}

impl Debug for Amount {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Amount({self})")
  }
}

impl Sum for Amount {
  fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
    iter.fold(Amount::ZERO, |acc, a| {
      acc.checked_add(a).unwrap_or(Amount(i64::MAX))
    })
  }
}

impl Serialize for Amount {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_f64(self.to_f64())
  }
}

impl<'de> Deserialize<'de> for Amount {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct NumberVisitor;

    impl<'de> de::Visitor<'de> for NumberVisitor {
      type Value = Amount;

      fn expecting(&self, f: &mut Formatter) -> std::fmt::Result {
        f.write_str("a number with at most three decimal digits")
      }

      fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
        Amount::try_from_f64(v).map_err(de::Error::custom)
      }

      fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
        self.visit_f64(v as f64)
      }

      fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
        self.visit_f64(v as f64)
      }
    }

    deserializer.deserialize_f64(NumberVisitor)
  }
}

#[cfg(test)]
mod tests {
  use super::{Amount, AmountError};

  #[test]
  fn canonical_formatting() {
    assert_eq!(Amount::from_millis(0).to_string(), "0.000");
    assert_eq!(Amount::from_millis(100_000).to_string(), "100.000");
    assert_eq!(Amount::from_millis(30_500).to_string(), "30.500");
    assert_eq!(Amount::from_millis(-1_500).to_string(), "-1.500");
    assert_eq!(Amount::from_millis(1).to_string(), "0.001");
  }

  #[test]
  fn from_f64_rounds_to_three_digits() {
    assert_eq!(Amount::try_from_f64(100.0).unwrap().millis(), 100_000);
    assert_eq!(Amount::try_from_f64(0.1).unwrap().millis(), 100);
    assert_eq!(Amount::try_from_f64(1.0005).unwrap().millis(), 1_001);
    assert_eq!(Amount::try_from_f64(-2.5).unwrap().millis(), -2_500);
  }

  #[test]
  fn rejects_non_finite() {
    assert_eq!(Amount::try_from_f64(f64::NAN), Err(AmountError::NotFinite));
    assert_eq!(
      Amount::try_from_f64(f64::INFINITY),
      Err(AmountError::NotFinite)
    );
    assert_eq!(Amount::try_from_f64(1e300), Err(AmountError::OutOfRange));
  }

  #[test]
  fn serde_uses_plain_numbers() {
    let a = Amount::from_millis(100_000);
    assert_eq!(serde_json::to_string(&a).unwrap(), "100.0");
    let back: Amount = serde_json::from_str("100.0").unwrap();
    assert_eq!(back, a);
    let from_int: Amount = serde_json::from_str("100").unwrap();
    assert_eq!(from_int, a);
    let small: Amount = serde_json::from_str("0.001").unwrap();
    assert_eq!(small.millis(), 1);
  }

  #[test]
  fn checked_arithmetic() {
    let a = Amount::from_millis(70_000);
    let b = Amount::from_millis(30_000);
    assert_eq!(a.checked_add(b).unwrap().millis(), 100_000);
    assert_eq!(a.checked_sub(b).unwrap().millis(), 40_000);
    assert!(Amount::from_millis(i64::MAX).checked_add(b).is_none());
  }
}
