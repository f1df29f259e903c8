use {
  super::{
    chain::BlockTree,
    error::VotingError,
    vote::{
      BlockInfo,
      Precommit,
      Prevote,
      Signed,
      SignedPrecommit,
      SignedPrevote,
      Stage,
    },
    voters::VoterSet,
  },
  itertools::Itertools,
};

/// Outcome of recording a vote for a voter's slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PushResult {
  /// First vote of this kind from the voter.
  Success,
  /// The voter already cast exactly this vote.
  Duplicate,
  /// A second, conflicting vote: the voter equivocated.
  Equivocated,
}

#[derive(Clone, Debug)]
enum Slot<T> {
  Single(Signed<T>),
  Equivocated(Box<Signed<T>>, Box<Signed<T>>),
}

impl<T: Stage + PartialEq> Slot<T> {
  fn votes(&self) -> impl Iterator<Item = &Signed<T>> {
    let (first, second) = match self {
      Slot::Single(vote) => (vote, None),
      Slot::Equivocated(first, second) => (&**first, Some(&**second)),
    };
    std::iter::once(first).chain(second)
  }
}

/// Records the votes of every voter in one round, one slot per
/// voter and vote kind.
///
/// The tracker is the deduplication and equivocation-detection
/// gate in front of the vote graph: weights here count each
/// distinct voter exactly once, no matter how many conflicting
/// votes it signed.
pub struct VoteTracker {
  round_number: u64,
  set_id: u64,
  prevotes: Vec<Option<Slot<Prevote>>>,
  precommits: Vec<Option<Slot<Precommit>>>,
  prevote_weight: u64,
  precommit_weight: u64,
}

impl VoteTracker {
  pub fn new(round_number: u64, set_id: u64, voters: usize) -> Self {
    Self {
      round_number,
      set_id,
      prevotes: vec![None; voters],
      precommits: vec![None; voters],
      prevote_weight: 0,
      precommit_weight: 0,
    }
  }

  /// Validates and records a prevote. Returns the voter's index
  /// alongside the slot outcome.
  pub fn push_prevote(
    &mut self,
    vote: SignedPrevote,
    voters: &VoterSet,
  ) -> Result<(usize, PushResult), VotingError> {
    Self::push(
      &mut self.prevotes,
      &mut self.prevote_weight,
      vote,
      voters,
      self.round_number,
      self.set_id,
    )
  }

  /// Validates and records a precommit. Returns the voter's
  /// index alongside the slot outcome.
  pub fn push_precommit(
    &mut self,
    vote: SignedPrecommit,
    voters: &VoterSet,
  ) -> Result<(usize, PushResult), VotingError> {
    Self::push(
      &mut self.precommits,
      &mut self.precommit_weight,
      vote,
      voters,
      self.round_number,
      self.set_id,
    )
  }

  fn push<T: Stage + PartialEq>(
    slots: &mut [Option<Slot<T>>],
    weight_sum: &mut u64,
    vote: Signed<T>,
    voters: &VoterSet,
    round_number: u64,
    set_id: u64,
  ) -> Result<(usize, PushResult), VotingError> {
    vote.verify(round_number, set_id)?;
    let index = voters
      .index(&vote.id)
      .ok_or_else(|| VotingError::UnknownVoter(vote.id.clone()))?;

    let slot = &mut slots[index];
    let result = match slot.take() {
      None => {
        *slot = Some(Slot::Single(vote));
        *weight_sum += voters
          .weight_by_index(index)
          .expect("index was resolved from this voter set; qed");
        PushResult::Success
      }
      Some(Slot::Single(existing)) => {
        if existing.vote == vote.vote {
          *slot = Some(Slot::Single(existing));
          PushResult::Duplicate
        } else {
          *slot =
            Some(Slot::Equivocated(Box::new(existing), Box::new(vote)));
          PushResult::Equivocated
        }
      }
      // votes beyond the equivocating pair carry no new
      // information, the proof of misbehavior is already stored
      Some(equivocated) => {
        *slot = Some(equivocated);
        PushResult::Duplicate
      }
    };

    Ok((index, result))
  }

  /// Summed weight of all distinct voters that prevoted.
  pub fn prevote_weight(&self) -> u64 {
    self.prevote_weight
  }

  /// Summed weight of all distinct voters that precommitted.
  pub fn precommit_weight(&self) -> u64 {
    self.precommit_weight
  }

  /// Every recorded precommit with the index of its voter. Both
  /// legs of an equivocation are listed, callers pick at most
  /// one per voter.
  pub fn precommits(&self) -> Vec<(usize, &SignedPrecommit)> {
    self
      .precommits
      .iter()
      .enumerate()
      .filter_map(|(index, slot)| slot.as_ref().map(|s| (index, s)))
      .flat_map(|(index, slot)| slot.votes().map(move |v| (index, v)))
      .collect()
  }

  /// The minimal set of recorded precommits on descendants of
  /// `target` whose total weight reaches the finalization
  /// threshold: at most one precommit per voter, heaviest voters
  /// first.
  ///
  /// Returns `None` while the recorded weight on that subtree is
  /// still below the threshold.
  pub fn justification<C: BlockTree>(
    &self,
    target: BlockInfo,
    voters: &VoterSet,
    chain: &C,
  ) -> Option<Vec<SignedPrecommit>> {
    let candidates = self
      .precommits
      .iter()
      .enumerate()
      .filter_map(|(index, slot)| {
        slot.as_ref().and_then(|slot| {
          // for an equivocating voter either leg may justify the
          // target, whichever descends from it
          slot.votes().find(|vote| {
            chain
              .is_equal_or_descendant_of(target.hash, vote.vote.target_hash)
          })
          .map(|vote| (index, vote))
        })
      })
      .sorted_by_key(|(index, _)| {
        (
          std::cmp::Reverse(
            voters.weight_by_index(*index).unwrap_or_default(),
          ),
          *index,
        )
      });

    let threshold = voters.threshold();
    let mut weight = 0u64;
    let mut cover = vec![];
    for (index, vote) in candidates {
      if weight >= threshold {
        break;
      }
      weight += voters.weight_by_index(index)?;
      cover.push(vote.clone());
    }

    if weight >= threshold {
      Some(cover)
    } else {
      None
    }
  }
}
