use {
  super::{AccountState, ValidationError},
  crate::primitives::{digest, Amount, Digest},
  serde::{Deserialize, Serialize},
};

/// A pair of consecutive versions of one account, produced by a
/// transaction. `hash = H(prev.hash ∥ next.hash)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
  pub hash: Digest,
  pub account: String,
  pub prev_account_state: AccountState,
  pub next_account_state: AccountState,
}

impl Mutation {
  pub fn compute_hash(prev: &Digest, next: &Digest) -> Digest {
    digest(&[prev.as_bytes(), next.as_bytes()])
  }

  /// Builds the mutation that moves `account` from `prev` by `delta`,
  /// deriving the successor state. Returns `None` on value overflow.
  pub fn apply(
    account: &str,
    prev: AccountState,
    delta: Amount,
  ) -> Option<Self> {
    let next_value = prev.value.checked_add(delta)?;
    let next = AccountState::new(account, prev.version + 1, next_value);
    Some(Self {
      hash: Self::compute_hash(&prev.hash, &next.hash),
      account: account.to_owned(),
      prev_account_state: prev,
      next_account_state: next,
    })
  }

  /// The signed balance change this mutation applies.
  pub fn delta(&self) -> Amount {
    Amount::from_millis(
      self.next_account_state.value.millis()
        - self.prev_account_state.value.millis(),
    )
  }

  /// Recomputes both account-state hashes and the mutation hash,
  /// and checks that the versions are consecutive.
  pub fn validate(&self) -> Result<(), ValidationError> {
    self.prev_account_state.validate(&self.account)?;
    self.next_account_state.validate(&self.account)?;
    if self.next_account_state.version != self.prev_account_state.version + 1 {
      return Err(ValidationError::BrokenVersionChain);
    }
    let expected = Self::compute_hash(
      &self.prev_account_state.hash,
      &self.next_account_state.hash,
    );
    if expected != self.hash {
      return Err(ValidationError::WrongHash);
    }
    Ok(())
  }
}
