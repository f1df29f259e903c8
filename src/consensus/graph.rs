//! The vote graph: a tree-shaped union of the ancestries of all
//! blocks referenced by any vote observed in a round, rooted at
//! the last finalized block.
//!
//! Every node carries cumulative voter bitsets covering the node
//! and its whole subtree, which is what GHOST selection and the
//! weighted ancestor walks operate on.

use {
  super::{
    chain::BlockTree,
    error::VotingError,
    vote::{BlockHash, BlockInfo, VoteKind},
    weight::VoteWeight,
  },
  std::collections::HashMap,
};

#[derive(Debug)]
struct GraphEntry {
  block: BlockInfo,
  parent: Option<BlockHash>,
  children: Vec<BlockHash>,
  weight: VoteWeight,
}

/// A rooted DAG of observed block ancestries with per-node
/// cumulative vote weight.
///
/// Unlike the block tree, which holds full blocks, this graph
/// only materializes `(hash, number)` pairs. Missing ancestry
/// between a voted block and the already known part of the graph
/// is fetched from the block tree on demand, so every node always
/// has a complete parent chain down to the base.
pub struct VoteGraph {
  base: BlockInfo,
  voters: usize,
  entries: HashMap<BlockHash, GraphEntry>,
}

impl VoteGraph {
  /// Creates a graph rooted at the given base block, sized for a
  /// voter set of `voters` members. The base is immutable for
  /// the lifetime of the graph.
  pub fn new(base: BlockInfo, voters: usize) -> Self {
    let mut entries = HashMap::new();
    entries.insert(base.hash, GraphEntry {
      block: base,
      parent: None,
      children: vec![],
      weight: VoteWeight::new(voters),
    });

    Self {
      base,
      voters,
      entries,
    }
  }

  pub fn base(&self) -> BlockInfo {
    self.base
  }

  pub fn contains(&self, hash: &BlockHash) -> bool {
    self.entries.contains_key(hash)
  }

  /// Records a vote of the given kind by one voter for `block`,
  /// materializing `block` and any missing ancestors first.
  ///
  /// The voter's bit is set on every node from `block` down to
  /// the base; set union keeps the voter counted once per node
  /// even when it votes for sibling blocks across calls.
  /// Deduplication per voter and kind is the tracker's job, this
  /// method is idempotent either way.
  pub fn insert<C: BlockTree>(
    &mut self,
    block: BlockInfo,
    kind: VoteKind,
    voter_index: usize,
    voter_weight: u64,
    chain: &C,
  ) -> Result<(), VotingError> {
    self.materialize(block, chain)?;

    let mut cursor = block.hash;
    loop {
      let entry = self
        .entries
        .get_mut(&cursor)
        .expect("materialize built the full path to the base; qed");
      entry.weight.set(kind, voter_index, voter_weight);
      match entry.parent {
        Some(parent) => cursor = parent,
        None => break,
      }
    }

    Ok(())
  }

  /// Ensures `block` and every ancestor up to the base are
  /// present as graph entries.
  fn materialize<C: BlockTree>(
    &mut self,
    block: BlockInfo,
    chain: &C,
  ) -> Result<(), VotingError> {
    if self.entries.contains_key(&block.hash) {
      return Ok(());
    }

    // full path of hashes from `block` down to the base; the
    // chain only answers when `block` descends from the base
    let mut path = Vec::with_capacity(2);
    path.push(block.hash);
    path.extend(chain.ancestry(self.base.hash, block.hash)?);
    path.push(self.base.hash);

    let first_known = path
      .iter()
      .position(|hash| self.entries.contains_key(hash))
      .expect("the base entry is never removed; qed");

    for index in (0..first_known).rev() {
      let hash = path[index];
      let parent = path[index + 1];
      let number = block.number - index as u64;

      self.entries.insert(hash, GraphEntry {
        block: BlockInfo::new(hash, number),
        parent: Some(parent),
        children: vec![],
        weight: VoteWeight::new(self.voters),
      });
      self
        .entries
        .get_mut(&parent)
        .expect("parent is either pre-existing or just inserted; qed")
        .children
        .push(hash);
    }

    Ok(())
  }

  /// Finds the deepest descendant of `head` (or of the base when
  /// `head` is `None`) whose cumulative weight of the given kind
  /// still satisfies `condition`.
  ///
  /// When several children qualify the heaviest one wins, with
  /// the lower block hash breaking exact ties, so the selection
  /// is deterministic across nodes.
  pub fn find_ghost<F>(
    &self,
    head: Option<BlockInfo>,
    kind: VoteKind,
    condition: F,
  ) -> Option<BlockInfo>
  where
    F: Fn(u64) -> bool,
  {
    let start = head.unwrap_or(self.base);
    let mut best = self.entries.get(&start.hash)?;

    if !condition(best.weight.sum(kind)) {
      return None;
    }

    loop {
      let mut next: Option<&GraphEntry> = None;
      for child_hash in &best.children {
        let child = self
          .entries
          .get(child_hash)
          .expect("children always reference graph entries; qed");
        if !condition(child.weight.sum(kind)) {
          continue;
        }
        next = match next {
          None => Some(child),
          Some(current) => {
            let (cw, nw) =
              (current.weight.sum(kind), child.weight.sum(kind));
            if nw > cw || (nw == cw && child.block.hash < current.block.hash)
            {
              Some(child)
            } else {
              Some(current)
            }
          }
        };
      }

      match next {
        Some(child) => best = child,
        None => return Some(best.block),
      }
    }
  }

  /// Walks from `start` towards the base and returns the deepest
  /// ancestor (including `start` itself) whose subtree weight
  /// satisfies `condition`.
  ///
  /// Cumulative weight only grows towards the base, so the first
  /// satisfying node on the walk is the deepest one.
  pub fn find_ancestor<F>(
    &self,
    start: BlockInfo,
    kind: VoteKind,
    condition: F,
  ) -> Option<BlockInfo>
  where
    F: Fn(u64) -> bool,
  {
    let mut cursor = self.entries.get(&start.hash)?;
    loop {
      if condition(cursor.weight.sum(kind)) {
        return Some(cursor.block);
      }
      cursor = self.entries.get(&cursor.parent?)?;
    }
  }

  /// Cumulative weight of the given kind at a block, if known.
  #[cfg(test)]
  fn weight_of(&self, hash: &BlockHash, kind: VoteKind) -> Option<u64> {
    self.entries.get(hash).map(|e| e.weight.sum(kind))
  }
}
