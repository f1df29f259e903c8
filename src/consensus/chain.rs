use {
  super::{
    error::VotingError,
    justification::Justification,
    vote::{BlockHash, BlockInfo},
  },
  crate::primitives::Pubkey,
  multihash::{Hasher, Sha3_256},
  parity_scale_codec::{Decode, Encode},
  serde::{Deserialize, Serialize},
};

/// A voter set handover scheduled through a consensus digest.
///
/// The change activates once the block carrying it is finalized
/// and `delay` further blocks are finalized on top of it.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct ScheduledChange {
  pub voters: Vec<(Pubkey, u64)>,
  pub delay: u64,
}

/// The subset of a block header the finality core cares about:
/// the parent link for ancestry walks, the height, and the
/// consensus digest carrying scheduled voter set changes.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct BlockHeader {
  pub parent_hash: BlockHash,
  pub number: u64,
  pub state_root: BlockHash,
  pub digest: Option<ScheduledChange>,
}

impl BlockHeader {
  pub fn hash(&self) -> BlockHash {
    let mut sha3 = Sha3_256::default();
    sha3.update(&self.encode());
    BlockHash(sha3.finalize().try_into().unwrap())
  }

  pub fn info(&self) -> BlockInfo {
    BlockInfo::new(self.hash(), self.number)
  }
}

/// Read-mostly view over the node's block tree, plus the single
/// write the finality core performs: marking a block final.
///
/// The core only ever finalizes monotonically increasing block
/// numbers; implementations are expected to reject anything that
/// would contradict an earlier finalization.
pub trait BlockTree {
  /// The most recently finalized block. Never reverts.
  fn last_finalized(&self) -> BlockInfo;

  /// Header lookup by block hash.
  fn header(&self, hash: &BlockHash) -> Option<BlockHeader>;

  /// Hashes on the path from `block` back towards `base`,
  /// ordered child to parent, starting at `block`'s parent and
  /// ending just above `base` (both endpoints excluded).
  ///
  /// Fails with [`VotingError::NotDescendant`] when `block` is
  /// not a descendant of `base`.
  fn ancestry(
    &self,
    base: BlockHash,
    block: BlockHash,
  ) -> Result<Vec<BlockHash>, VotingError>;

  /// The head of the heaviest leaf whose chain contains `block`,
  /// or `None` if `block` is unknown or has been pruned.
  fn best_chain_containing(&self, block: BlockHash) -> Option<BlockInfo>;

  /// Whether `descendant` sits on the chain of `ancestor`
  /// (a block counts as its own descendant).
  fn is_equal_or_descendant_of(
    &self,
    ancestor: BlockHash,
    descendant: BlockHash,
  ) -> bool;

  /// Marks a block as finalized, recording the justification
  /// that proves it. The block tree serializes these writes.
  fn finalize(
    &mut self,
    block: BlockHash,
    justification: Justification,
  ) -> Result<(), VotingError>;
}
