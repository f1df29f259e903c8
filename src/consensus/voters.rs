use {
  crate::primitives::Pubkey,
  std::collections::HashMap,
};

/// The minimum voted weight that constitutes a supermajority.
///
/// This is the smallest integer strictly greater than two thirds
/// of the total weight, `⌊2W/3⌋ + 1`, computed here as
/// `W - ⌊(W - 1)/3⌋` to avoid overflowing `2W`.
pub fn threshold(total_weight: u64) -> u64 {
  total_weight - (total_weight - 1) / 3
}

/// The fixed, weighted set of voters taking part in one voter
/// set epoch of the finality protocol.
///
/// Voters keep a stable index in `[0, len)` for the lifetime of
/// the epoch. Those indices key the per-block voter bitsets in
/// the vote graph and the per-voter slots in the vote tracker.
#[derive(Clone, Debug)]
pub struct VoterSet {
  voters: Vec<(Pubkey, u64)>,
  indices: HashMap<Pubkey, usize>,
  total_weight: u64,
}

impl VoterSet {
  /// Builds a voter set from an ordered `(id, weight)` sequence.
  ///
  /// Returns `None` for an empty sequence, a zero weight or a
  /// duplicate voter, all of which would corrupt threshold
  /// accounting.
  pub fn new(
    voters: impl IntoIterator<Item = (Pubkey, u64)>,
  ) -> Option<Self> {
    let voters: Vec<_> = voters.into_iter().collect();
    if voters.is_empty() {
      return None;
    }

    let mut indices = HashMap::with_capacity(voters.len());
    let mut total_weight = 0u64;
    for (index, (id, weight)) in voters.iter().enumerate() {
      if *weight == 0 || indices.insert(id.clone(), index).is_some() {
        return None;
      }
      total_weight = total_weight.checked_add(*weight)?;
    }

    Some(Self {
      voters,
      indices,
      total_weight,
    })
  }

  pub fn len(&self) -> usize {
    self.voters.len()
  }

  pub fn is_empty(&self) -> bool {
    self.voters.is_empty()
  }

  pub fn total_weight(&self) -> u64 {
    self.total_weight
  }

  pub fn threshold(&self) -> u64 {
    threshold(self.total_weight)
  }

  pub fn contains(&self, id: &Pubkey) -> bool {
    self.indices.contains_key(id)
  }

  pub fn index(&self, id: &Pubkey) -> Option<usize> {
    self.indices.get(id).copied()
  }

  pub fn weight(&self, id: &Pubkey) -> Option<u64> {
    self.index(id).map(|i| self.voters[i].1)
  }

  pub fn weight_by_index(&self, index: usize) -> Option<u64> {
    self.voters.get(index).map(|(_, w)| *w)
  }

  pub fn id_by_index(&self, index: usize) -> Option<&Pubkey> {
    self.voters.get(index).map(|(id, _)| id)
  }

  /// The voter designated to broadcast the primary hint for a
  /// round: rotates through the set by round number.
  pub fn primary(&self, round_number: u64) -> &Pubkey {
    let index = (round_number % self.voters.len() as u64) as usize;
    &self.voters[index].0
  }

  pub fn iter(&self) -> impl Iterator<Item = &(Pubkey, u64)> {
    self.voters.iter()
  }
}
