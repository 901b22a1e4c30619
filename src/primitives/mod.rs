mod amount;
mod hash;
mod keys;
pub mod time;

pub use {
  amount::{Amount, AmountError, AMOUNT_PRECISION},
  hash::{digest, Digest, DigestParseError, DIGEST_LEN},
  keys::{Keypair, KeypairError, SignatureBytes, SIGNATURE_LEN},
};
