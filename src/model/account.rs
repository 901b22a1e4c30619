use {
  super::ValidationError,
  crate::primitives::{digest, Amount, Digest},
  serde::{Deserialize, Serialize},
};

/// One immutable version of an account, as carried inside mutations.
///
/// The owning account name is context: it lives on the enclosing
/// [`super::Mutation`] (or on the database row), not in the canonical
/// JSON form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
  pub hash: Digest,
  pub version: u64,
  pub value: Amount,
}

impl AccountState {
  /// `H("{account:?},{version},{value:.3}")` — the account name in its
  /// quoted string form, the value with exactly three decimals.
  pub fn compute_hash(account: &str, version: u64, value: Amount) -> Digest {
    digest(&[format!("{account:?},{version},{value}").as_bytes()])
  }

  pub fn new(account: &str, version: u64, value: Amount) -> Self {
    Self {
      hash: Self::compute_hash(account, version, value),
      version,
      value,
    }
  }

  /// Genesis row: version 0, zero balance.
  pub fn genesis(account: &str) -> Self {
    Self::new(account, 0, Amount::ZERO)
  }

  pub fn validate(&self, account: &str) -> Result<(), ValidationError> {
    if Self::compute_hash(account, self.version, self.value) != self.hash {
      return Err(ValidationError::WrongHash);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use {
    super::AccountState,
    crate::{model::ValidationError, primitives::Amount},
  };

  #[test]
  fn hash_covers_every_field() {
    let base = AccountState::new("alice", 3, Amount::from_millis(70_000));
    assert_ne!(
      base.hash,
      AccountState::new("bob", 3, Amount::from_millis(70_000)).hash
    );
    assert_ne!(
      base.hash,
      AccountState::new("alice", 4, Amount::from_millis(70_000)).hash
    );
    assert_ne!(
      base.hash,
      AccountState::new("alice", 3, Amount::from_millis(70_001)).hash
    );
  }

  #[test]
  fn genesis_state() {
    let state = AccountState::genesis("coinbase");
    assert_eq!(state.version, 0);
    assert_eq!(state.value, Amount::ZERO);
    assert!(state.validate("coinbase").is_ok());
  }

  #[test]
  fn validate_rejects_foreign_account() {
    let state = AccountState::genesis("alice");
    assert_eq!(state.validate("bob"), Err(ValidationError::WrongHash));
  }

  #[test]
  fn canonical_json_shape() {
    let state = AccountState::new("alice", 1, Amount::from_millis(100_000));
    let json = serde_json::to_value(&state).unwrap();
    assert_eq!(json["hash"], state.hash.to_hex());
    assert_eq!(json["version"], 1);
    assert_eq!(json["value"], 100.0);
    let back: AccountState = serde_json::from_value(json).unwrap();
    assert_eq!(back, state);
  }
}
