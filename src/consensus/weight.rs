use {
  super::vote::VoteKind,
  bitvec::vec::BitVec,
};

/// Cumulative vote weight attached to one node of the vote
/// graph: which voters have prevoted or precommitted for the
/// node's block or any of its descendants.
///
/// Membership is tracked as one bit per voter index rather than
/// an integer counter. A voter that votes for sibling blocks
/// (an equivocation) ends up with its bit set on both branches,
/// but the union at every common ancestor still counts it once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VoteWeight {
  prevoted: BitVec,
  precommitted: BitVec,
  prevote_sum: u64,
  precommit_sum: u64,
}

impl VoteWeight {
  pub fn new(voters: usize) -> Self {
    Self {
      prevoted: BitVec::repeat(false, voters),
      precommitted: BitVec::repeat(false, voters),
      prevote_sum: 0,
      precommit_sum: 0,
    }
  }

  /// Marks a voter as having voted in this node's subtree and
  /// updates the cached weight sum. Returns whether the bit was
  /// newly set.
  pub fn set(&mut self, kind: VoteKind, index: usize, weight: u64) -> bool {
    let (bits, sum) = match kind {
      VoteKind::Prevote => (&mut self.prevoted, &mut self.prevote_sum),
      VoteKind::Precommit => (&mut self.precommitted, &mut self.precommit_sum),
    };

    if bits[index] {
      return false;
    }

    bits.set(index, true);
    *sum += weight;
    true
  }

  pub fn contains(&self, kind: VoteKind, index: usize) -> bool {
    match kind {
      VoteKind::Prevote => self.prevoted[index],
      VoteKind::Precommit => self.precommitted[index],
    }
  }

  /// The summed weight of all distinct voters in this subtree
  /// for the given vote kind.
  pub fn sum(&self, kind: VoteKind) -> u64 {
    match kind {
      VoteKind::Prevote => self.prevote_sum,
      VoteKind::Precommit => self.precommit_sum,
    }
  }
}
