use {
  multihash::{Sha3_256, StatefulHasher},
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    str::FromStr,
  },
  thiserror::Error,
};

pub const DIGEST_LEN: usize = 32;

/// A 32-byte SHA3-256 content hash.
///
/// Every entity in the chain (account states, mutations, transactions
/// and blocks) is addressed by a digest over its canonical byte
/// representation. On the wire digests travel as lowercase hex strings
/// without a prefix.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; DIGEST_LEN]);

#[derive(Debug, Error)]
pub enum DigestParseError {
  #[error("invalid hex: {0}")]
  Hex(#[from] hex::FromHexError),

  #[error("expected {DIGEST_LEN} bytes, got {0}")]
  Length(usize),
}

impl Digest {
  /// The all-zeroes digest, used as the previous hash of the
  /// genesis block.
  pub const fn zero() -> Self {
    Self([0u8; DIGEST_LEN])
  }

  pub const fn from_bytes(bytes: [u8; DIGEST_LEN]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }
}

/// Hashes a sequence of byte strings into one digest, as if they
/// were concatenated.
pub fn digest(parts: &[&[u8]]) -> Digest {
  let mut hasher = Sha3_256::default();
  for part in parts {
    hasher.update(part);
  }
  Digest(
    hasher
      .finalize()
      .as_ref()
      .try_into()
      .expect("sha3-256 yields 32 bytes"),
  )
}

impl Display for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl Debug for Digest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Digest({})", self.to_hex())
  }
}

impl FromStr for Digest {
  type Err = DigestParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s)?;
    let bytes: [u8; DIGEST_LEN] = bytes
      .try_into()
      .map_err(|b: Vec<u8>| DigestParseError::Length(b.len()))?;
    Ok(Self(bytes))
  }
}

impl AsRef<[u8]> for Digest {
  fn as_ref(&self) -> &[u8] {
    &self.0
  }
}

impl Serialize for Digest {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for Digest {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
  }
}

#[cfg(test)]
mod tests {
  use super::{digest, Digest};

  #[test]
  fn digest_concatenation_is_associative() {
    let d1 = digest(&[b"hello", b"world"]);
    let d2 = digest(&[b"helloworld"]);
    assert_eq!(d1, d2);
    assert_ne!(d1, digest(&[b"hello world"]));
  }

  #[test]
  fn hex_round_trip() {
    let d = digest(&[b"palisade"]);
    let encoded = d.to_hex();
    assert_eq!(encoded.len(), 64);
    assert_eq!(encoded, encoded.to_lowercase());
    assert_eq!(encoded.parse::<Digest>().unwrap(), d);
  }

  #[test]
  fn rejects_malformed_hex() {
    assert!("zz".repeat(32).parse::<Digest>().is_err());
    assert!("ab".repeat(31).parse::<Digest>().is_err());
  }

  #[test]
  fn serde_round_trip() {
    let d = digest(&[b"abc"]);
    let json = serde_json::to_string(&d).unwrap();
    assert_eq!(json, format!("\"{}\"", d.to_hex()));
    let back: Digest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, d);
  }

  #[test]
  fn zero_digest() {
    assert_eq!(Digest::zero().to_hex(), "00".repeat(32));
  }
}
