use {
  super::{Transaction, ValidationError},
  crate::primitives::{digest, time, Digest},
  chrono::{DateTime, Utc},
  ed25519_dalek::PublicKey,
  serde::{Deserialize, Serialize},
};

/// One block of the committed chain.
///
/// Block #1 is the genesis block: empty, with an all-zero previous
/// hash. Every later block links to its predecessor by hash and
/// number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
  pub hash: Digest,
  pub prev_hash: Digest,
  #[serde(with = "crate::primitives::time::serde")]
  pub timestamp: DateTime<Utc>,
  pub number: u64,
  pub transactions: Vec<Transaction>,
}

impl Block {
  /// `H(prev_hash ∥ ",{iso(ts)},{number}," ∥ tx_hash…)`
  pub fn compute_hash(
    prev_hash: &Digest,
    timestamp: &DateTime<Utc>,
    number: u64,
    transaction_hashes: &[Digest],
  ) -> Digest {
    let middle = format!(",{},{number},", time::iso(timestamp));
    let mut parts: Vec<&[u8]> = vec![prev_hash.as_bytes(), middle.as_bytes()];
    for hash in transaction_hashes {
      parts.push(hash.as_bytes());
    }
    digest(&parts)
  }

  pub fn genesis(timestamp: DateTime<Utc>) -> Self {
    let prev_hash = Digest::zero();
    Self {
      hash: Self::compute_hash(&prev_hash, &timestamp, 1, &[]),
      prev_hash,
      timestamp,
      number: 1,
      transactions: Vec::new(),
    }
  }

  /// Builds the successor of `(prev_hash, prev_number)` out of a
  /// batch of endorsed transactions.
  pub fn assemble(
    prev_hash: Digest,
    prev_number: u64,
    timestamp: DateTime<Utc>,
    transactions: Vec<Transaction>,
  ) -> Self {
    let hashes: Vec<Digest> = transactions.iter().map(|t| t.hash).collect();
    let number = prev_number + 1;
    Self {
      hash: Self::compute_hash(&prev_hash, &timestamp, number, &hashes),
      prev_hash,
      timestamp,
      number,
      transactions,
    }
  }

  pub fn transaction_hashes(&self) -> Vec<Digest> {
    self.transactions.iter().map(|t| t.hash).collect()
  }

  /// Validates the whole envelope: every transaction (against the
  /// endorser key `public_key` resolves) and the block hash.
  pub fn validate<F>(&self, mut public_key: F) -> Result<(), ValidationError>
  where
    F: FnMut(&str) -> Option<PublicKey>,
  {
    for transaction in &self.transactions {
      let key = public_key(&transaction.endorser)
        .ok_or(ValidationError::UnknownEndorser)?;
      transaction.validate(&key)?;
    }
    let expected = Self::compute_hash(
      &self.prev_hash,
      &self.timestamp,
      self.number,
      &self.transaction_hashes(),
    );
    if expected != self.hash {
      return Err(ValidationError::WrongHash);
    }
    Ok(())
  }
}
