use {
  super::{Mutation, ValidationError},
  crate::primitives::{digest, time, Digest, Keypair, SignatureBytes},
  chrono::{DateTime, Utc},
  ed25519_dalek::PublicKey,
  serde::{Deserialize, Serialize},
};

/// A signed set of account mutations produced by an endorser.
///
/// An endorsed transaction is an unpersisted envelope until the
/// orderer includes it in a committed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
  pub hash: Digest,
  pub endorser: String,
  pub signature: SignatureBytes,
  #[serde(with = "crate::primitives::time::serde")]
  pub timestamp: DateTime<Utc>,
  pub mutations: Vec<Mutation>,
}

impl Transaction {
  /// The byte string the endorser signs:
  /// `"{endorser:?},{iso(ts)}," ∥ mutation_hash…`
  pub fn signing_bytes(
    endorser: &str,
    timestamp: &DateTime<Utc>,
    mutation_hashes: &[Digest],
  ) -> Vec<u8> {
    let mut bytes =
      format!("{endorser:?},{},", time::iso(timestamp)).into_bytes();
    for hash in mutation_hashes {
      bytes.extend_from_slice(hash.as_bytes());
    }
    bytes
  }

  /// `H("{endorser:?},{iso(ts)}," ∥ signature ∥ mutation_hash…)`
  pub fn compute_hash(
    endorser: &str,
    timestamp: &DateTime<Utc>,
    signature: &SignatureBytes,
    mutation_hashes: &[Digest],
  ) -> Digest {
    let prefix = format!("{endorser:?},{},", time::iso(timestamp));
    let mut parts: Vec<&[u8]> = vec![prefix.as_bytes(), signature.as_bytes()];
    for hash in mutation_hashes {
      parts.push(hash.as_bytes());
    }
    digest(&parts)
  }

  /// Signs `mutations` with the endorser's key and assembles the
  /// envelope.
  pub fn endorse(
    keypair: &Keypair,
    endorser: &str,
    timestamp: DateTime<Utc>,
    mutations: Vec<Mutation>,
  ) -> Self {
    let hashes: Vec<Digest> = mutations.iter().map(|m| m.hash).collect();
    let signature =
      keypair.sign_bytes(&Self::signing_bytes(endorser, &timestamp, &hashes));
    Self {
      hash: Self::compute_hash(endorser, &timestamp, &signature, &hashes),
      endorser: endorser.to_owned(),
      signature,
      timestamp,
      mutations,
    }
  }

  pub fn mutation_hashes(&self) -> Vec<Digest> {
    self.mutations.iter().map(|m| m.hash).collect()
  }

  /// Full envelope validation: every mutation, the endorser's
  /// signature, and the transaction hash itself.
  pub fn validate(&self, public_key: &PublicKey) -> Result<(), ValidationError> {
    for mutation in &self.mutations {
      mutation.validate()?;
    }
    let hashes = self.mutation_hashes();
    let message = Self::signing_bytes(&self.endorser, &self.timestamp, &hashes);
    if !self.signature.verify(public_key, &message) {
      return Err(ValidationError::WrongSignature);
    }
    let expected = Self::compute_hash(
      &self.endorser,
      &self.timestamp,
      &self.signature,
      &hashes,
    );
    if expected != self.hash {
      return Err(ValidationError::WrongHash);
    }
    Ok(())
  }
}
