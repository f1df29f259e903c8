use {
  super::{
    chain::{BlockHeader, BlockTree},
    error::{JustificationError, VotingError},
    vote::{BlockHash, BlockInfo, SignedPrecommit},
    voters::VoterSet,
  },
  parity_scale_codec::{Decode, Encode},
  serde::{Deserialize, Serialize},
  std::collections::{HashMap, HashSet},
};

/// A finalized target and the precommits that carried it over
/// the threshold.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct Commit {
  pub target: BlockInfo,
  pub precommits: Vec<SignedPrecommit>,
}

/// The transferable proof that a block was finalized in a round:
/// a commit plus the headers connecting every precommit target
/// down to the committed block.
///
/// A justification is self-contained up to the voter set: anyone
/// who knows the voter set of `set_id` can re-verify it without
/// access to the block tree.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct Justification {
  pub round_number: u64,
  pub commit: Commit,
  pub votes_ancestries: Vec<BlockHeader>,
}

impl Justification {
  /// Assembles a justification for `target` out of precommits on
  /// its descendants, pulling the connecting headers from the
  /// block tree.
  pub fn new<C: BlockTree>(
    round_number: u64,
    target: BlockInfo,
    precommits: Vec<SignedPrecommit>,
    chain: &C,
  ) -> Result<Self, VotingError> {
    let mut votes_ancestries = vec![];
    let mut seen = HashSet::new();

    for precommit in &precommits {
      let mut cursor = precommit.vote.target_hash;
      while cursor != target.hash {
        if !seen.insert(cursor) {
          break; // path already collected through a sibling vote
        }
        let header = chain.header(&cursor).ok_or(
          VotingError::ChainQueryFailed("header missing for ancestry cover"),
        )?;
        if header.number <= target.number {
          return Err(VotingError::NotDescendant);
        }
        cursor = header.parent_hash;
        votes_ancestries.push(header);
      }
    }

    Ok(Self {
      round_number,
      commit: Commit { target, precommits },
      votes_ancestries,
    })
  }

  /// Re-verifies the justification against the voter set of the
  /// given epoch: every signature must check out, the carried
  /// headers must connect every precommit to the target with
  /// nothing left over, and the distinct-voter weight must reach
  /// the threshold.
  pub fn verify(
    &self,
    set_id: u64,
    voters: &VoterSet,
    expected_target: Option<BlockInfo>,
  ) -> Result<(), JustificationError> {
    if let Some(expected) = expected_target {
      if self.commit.target != expected {
        return Err(JustificationError::InvalidTarget);
      }
    }

    let headers: HashMap<BlockHash, &BlockHeader> = self
      .votes_ancestries
      .iter()
      .map(|header| (header.hash(), header))
      .collect();

    let mut used = HashSet::new();
    let mut counted = HashSet::new();
    let mut weight = 0u64;

    for precommit in &self.commit.precommits {
      precommit
        .verify(self.round_number, set_id)
        .map_err(|_| JustificationError::InvalidSignature)?;
      let index = voters
        .index(&precommit.id)
        .ok_or(JustificationError::UnknownVoter)?;

      let mut cursor = precommit.vote.target_hash;
      let mut steps = 0usize;
      while cursor != self.commit.target.hash {
        if steps > self.votes_ancestries.len() {
          return Err(JustificationError::InvalidAncestry);
        }
        match headers.get(&cursor) {
          Some(header) => {
            used.insert(cursor);
            cursor = header.parent_hash;
          }
          None => return Err(JustificationError::InvalidAncestry),
        }
        steps += 1;
      }

      if counted.insert(index) {
        weight += voters.weight_by_index(index).unwrap_or_default();
      }
    }

    // headers that justify nothing hide ancestry mismatches
    if used.len() != self.votes_ancestries.len() {
      return Err(JustificationError::InvalidAncestry);
    }

    if weight < voters.threshold() {
      return Err(JustificationError::BelowThreshold);
    }

    Ok(())
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    self.encode()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VotingError> {
    Ok(Self::decode(&mut &bytes[..])?)
  }
}

/// A commit message broadcast to disseminate a round's
/// justification. Also the carrier of primary hints: the primary
/// of round `r` re-broadcasts round `r - 1`'s estimate this way.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct Fin {
  pub round_number: u64,
  pub target: BlockInfo,
  pub justification: Justification,
}

impl Fin {
  pub fn verify(
    &self,
    set_id: u64,
    voters: &VoterSet,
  ) -> Result<(), JustificationError> {
    if self.round_number != self.justification.round_number {
      return Err(JustificationError::InvalidTarget);
    }
    self.justification.verify(set_id, voters, Some(self.target))
  }

  pub fn to_bytes(&self) -> Vec<u8> {
    self.encode()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VotingError> {
    Ok(Self::decode(&mut &bytes[..])?)
  }
}
