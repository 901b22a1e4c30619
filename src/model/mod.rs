//! Canonical chain entities and their content-hash rules.
//!
//! These are plain value types: a [`Block`] carries its transactions,
//! a [`Transaction`] its mutations, a [`Mutation`] the two account
//! states it connects. The persistent store flattens them into rows;
//! on the wire they travel as the canonical JSON described in the
//! protocol (hex digests, ISO-8601 timestamps, plain-number amounts).

mod account;
mod block;
mod mutation;
mod transaction;

pub use {
  account::AccountState,
  block::Block,
  mutation::Mutation,
  transaction::Transaction,
};

use thiserror::Error;

/// The distinguished account credited as the counterpart of minting.
pub const COINBASE: &str = "coinbase";

/// Failures raised while re-validating an inbound entity.
///
/// The renderings double as the RPC error messages callers see.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("wrong hash")]
  WrongHash,

  #[error("wrong signature")]
  WrongSignature,

  #[error("unknown endorser")]
  UnknownEndorser,

  #[error("broken version chain")]
  BrokenVersionChain,
}
