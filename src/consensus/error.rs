use {
  crate::primitives::Pubkey,
  thiserror::Error,
};

/// Errors raised while processing votes and driving rounds.
///
/// Per-message failures are logged by the caller and the offending
/// message is dropped. Invariant violations that would compromise
/// safety are not represented here, they panic instead.
#[derive(Debug, Error)]
pub enum VotingError {
  #[error("invalid signature from voter {0}")]
  SignatureInvalid(Pubkey),

  #[error("vote from a voter outside of the current voter set: {0}")]
  UnknownVoter(Pubkey),

  #[error("block tree query failed: {0}")]
  ChainQueryFailed(&'static str),

  #[error("block is not a descendant of the queried ancestor")]
  NotDescendant,

  #[error("previously known block has been pruned from the block tree")]
  BlockPruned,

  #[error("block tree rejected finalization at height {0}")]
  FinalizeRejected(u64),

  #[error("failed decoding message: {0}")]
  DecodeFailed(#[from] parity_scale_codec::Error),

  #[error(transparent)]
  Justification(#[from] JustificationError),
}

/// Reasons a justification fails verification.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JustificationError {
  #[error("justification names an unexpected target block")]
  InvalidTarget,

  #[error("justification carries a precommit with an invalid signature")]
  InvalidSignature,

  #[error("justification carries a precommit from an unknown voter")]
  UnknownVoter,

  #[error("headers do not connect every precommit to the target")]
  InvalidAncestry,

  #[error("total precommit weight is below the finalization threshold")]
  BelowThreshold,
}
