use {
  ed25519_dalek::{PublicKey, SecretKey, Signer},
  rand::RngCore,
  serde::{de, Deserialize, Deserializer, Serialize, Serializer},
  std::{
    fmt::{Debug, Display, Formatter},
    ops::Deref,
    str::FromStr,
  },
  thiserror::Error,
};

pub const SIGNATURE_LEN: usize = 64;

/// An ed25519 signing keypair owned by one node of the network.
///
/// The secret half lives in `private.key` under the node's root
/// directory, the public half is published to the shared key
/// directory as `<id>.pub.key`.
pub struct Keypair(ed25519_dalek::Keypair);

#[derive(Debug, Error)]
pub enum KeypairError {
  #[error("{0}")]
  Ed25519(#[from] ed25519_dalek::ed25519::Error),

  #[error("invalid hex: {0}")]
  Hex(#[from] hex::FromHexError),
}

impl Keypair {
  /// Generates a fresh keypair from the operating system's entropy
  /// source.
  pub fn generate() -> Self {
    let mut seed = [0u8; ed25519_dalek::SECRET_KEY_LENGTH];
    rand::rngs::OsRng.fill_bytes(&mut seed);
    let secret =
      SecretKey::from_bytes(&seed).expect("32 random bytes form a secret key");
    let public = PublicKey::from(&secret);
    Self(ed25519_dalek::Keypair { secret, public })
  }

  pub fn public(&self) -> PublicKey {
    self.0.public
  }

  pub fn secret_bytes(&self) -> [u8; ed25519_dalek::SECRET_KEY_LENGTH] {
    self.0.secret.to_bytes()
  }

  /// Signs a message, returning the raw 64 signature bytes.
  pub fn sign_bytes(&self, message: &[u8]) -> SignatureBytes {
    SignatureBytes(self.0.sign(message).to_bytes())
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    Self(
      ed25519_dalek::Keypair::from_bytes(&self.0.to_bytes())
        .expect("round-tripping a valid keypair"),
    )
  }
}

impl Deref for Keypair {
  type Target = ed25519_dalek::Keypair;

  fn deref(&self) -> &Self::Target {
    &self.0
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("Keypair")
      .field(&hex::encode(self.0.public.as_bytes()))
      .finish()
  }
}

impl Display for Keypair {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "Keypair({})", hex::encode(self.0.public.as_bytes()))
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeypairError;

  fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(value)?;
    let public: PublicKey = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

/// Raw signature bytes as they travel on the wire (lowercase hex).
///
/// Kept as plain bytes rather than a parsed [`ed25519_dalek::Signature`]
/// so that a tampered signature still decodes and fails later at
/// verification, where it maps to the `wrong signature` error.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureBytes([u8; SIGNATURE_LEN]);

impl SignatureBytes {
  pub const fn from_bytes(bytes: [u8; SIGNATURE_LEN]) -> Self {
    Self(bytes)
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn to_hex(&self) -> String {
    hex::encode(self.0)
  }

  /// Verifies this signature over `message` against `public_key`.
  /// Any malformed signature simply fails verification.
  pub fn verify(&self, public_key: &PublicKey, message: &[u8]) -> bool {
    use ed25519_dalek::Verifier;
    match ed25519_dalek::Signature::from_bytes(&self.0) {
      Ok(signature) => public_key.verify(message, &signature).is_ok(),
      Err(_) => false,
    }
  }
}

impl Display for SignatureBytes {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.to_hex())
  }
}

impl Debug for SignatureBytes {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "SignatureBytes({})", self.to_hex())
  }
}

impl FromStr for SignatureBytes {
  type Err = KeypairError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let bytes = hex::decode(s)?;
    let bytes: [u8; SIGNATURE_LEN] = bytes
      .try_into()
      .map_err(|_| hex::FromHexError::InvalidStringLength)?;
    Ok(Self(bytes))
  }
}

impl Serialize for SignatureBytes {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: Serializer,
  {
    serializer.serialize_str(&self.to_hex())
  }
}

impl<'de> Deserialize<'de> for SignatureBytes {
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
  use super::{Keypair, SignatureBytes};

  #[test]
  fn sign_and_verify() {
    let keypair = Keypair::generate();
    let signature = keypair.sign_bytes(b"some message");
    assert!(signature.verify(&keypair.public(), b"some message"));
    assert!(!signature.verify(&keypair.public(), b"another message"));
  }

  #[test]
  fn tampered_signature_fails_verification() {
    let keypair = Keypair::generate();
    let signature = keypair.sign_bytes(b"payload");
    let mut bytes = [0u8; 64];
    bytes.copy_from_slice(signature.as_bytes());
    bytes[0] ^= 0xff;
    let tampered = SignatureBytes::from_bytes(bytes);
    assert!(!tampered.verify(&keypair.public(), b"payload"));
  }

  #[test]
  fn signature_hex_round_trip() {
    let keypair = Keypair::generate();
    let signature = keypair.sign_bytes(b"x");
    let encoded = signature.to_hex();
    assert_eq!(encoded.len(), 128);
    assert_eq!(encoded.parse::<SignatureBytes>().unwrap(), signature);
  }

  #[test]
  fn keypair_round_trips_through_secret_bytes() {
    let keypair = Keypair::generate();
    let restored = Keypair::try_from(&keypair.secret_bytes()[..]).unwrap();
    assert_eq!(restored.public(), keypair.public());
  }
}
