use {
  crate::{
    consensus::{
      BlockHash,
      BlockHeader,
      BlockInfo,
      BlockTree,
      Fin,
      Gossip,
      Justification,
      ScheduledChange,
      VoteMessage,
      VoterSet,
      VotingError,
    },
    primitives::Keypair,
  },
  multihash::{Hasher, Sha3_256},
  std::{cell::RefCell, collections::HashMap, rc::Rc},
};

/// Routes test logs through the usual subscriber; respects
/// `RUST_LOG` and is a no-op after the first call.
pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

/// Deterministic keypairs for tests, one per seed index.
pub fn keypairs(n: usize) -> Vec<Keypair> {
  (0..n)
    .map(|i| {
      let mut seed = [0xA5u8; 32];
      seed[0] = i as u8 + 1;
      Keypair::try_from(seed.as_slice()).unwrap()
    })
    .collect()
}

/// A voter set assigning every key the same weight.
pub fn voter_set(keys: &[Keypair], weight: u64) -> VoterSet {
  VoterSet::new(keys.iter().map(|k| (k.public(), weight))).unwrap()
}

fn name_root(name: &str) -> BlockHash {
  let mut sha3 = Sha3_256::default();
  sha3.update(name.as_bytes());
  BlockHash(sha3.finalize().try_into().unwrap())
}

/// An in-memory block tree addressed by human-readable block
/// names. Blocks at the same height under the same parent stay
/// distinguishable because a block's name seeds its state root.
pub struct TestChain {
  headers: HashMap<BlockHash, BlockHeader>,
  names: HashMap<String, BlockHash>,
  children: HashMap<BlockHash, Vec<BlockHash>>,
  finalized: BlockInfo,
  finalized_log: Vec<(BlockInfo, Justification)>,
}

impl Default for TestChain {
  fn default() -> Self {
    Self::new()
  }
}

impl TestChain {
  /// A chain holding only the finalized block named "genesis".
  pub fn new() -> Self {
    let header = BlockHeader {
      parent_hash: BlockHash([0; 32]),
      number: 0,
      state_root: name_root("genesis"),
      digest: None,
    };
    let info = header.info();

    let mut chain = Self {
      headers: HashMap::new(),
      names: HashMap::new(),
      children: HashMap::new(),
      finalized: info,
      finalized_log: vec![],
    };
    chain.headers.insert(info.hash, header);
    chain.names.insert("genesis".into(), info.hash);
    chain
  }

  /// Appends a linear run of named blocks under `parent`.
  pub fn push_blocks(&mut self, parent: &str, names: &[&str]) {
    let mut parent_hash = self.hash(parent);
    for name in names {
      parent_hash = self.add_block(parent_hash, name, None);
    }
  }

  /// Appends one block carrying a voter set change digest.
  pub fn push_block_with_change(
    &mut self,
    parent: &str,
    name: &str,
    change: ScheduledChange,
  ) {
    self.add_block(self.hash(parent), name, Some(change));
  }

  fn add_block(
    &mut self,
    parent_hash: BlockHash,
    name: &str,
    digest: Option<ScheduledChange>,
  ) -> BlockHash {
    let number = self.headers[&parent_hash].number + 1;
    let header = BlockHeader {
      parent_hash,
      number,
      state_root: name_root(name),
      digest,
    };
    let hash = header.hash();
    self.headers.insert(hash, header);
    self.names.insert(name.into(), hash);
    self.children.entry(parent_hash).or_default().push(hash);
    hash
  }

  pub fn hash(&self, name: &str) -> BlockHash {
    *self
      .names
      .get(name)
      .unwrap_or_else(|| panic!("unknown test block {name}"))
  }

  pub fn info(&self, name: &str) -> BlockInfo {
    let hash = self.hash(name);
    BlockInfo::new(hash, self.headers[&hash].number)
  }

  pub fn header_of(&self, name: &str) -> BlockHeader {
    self.headers[&self.hash(name)].clone()
  }

  /// Moves the finalized pointer without recording a
  /// justification, for seeding test scenarios.
  pub fn set_finalized(&mut self, name: &str) {
    self.finalized = self.info(name);
  }

  /// Every `finalize` call accepted so far, in order.
  pub fn finalized_log(&self) -> &[(BlockInfo, Justification)] {
    &self.finalized_log
  }
}

impl BlockTree for TestChain {
  fn last_finalized(&self) -> BlockInfo {
    self.finalized
  }

  fn header(&self, hash: &BlockHash) -> Option<BlockHeader> {
    self.headers.get(hash).cloned()
  }

  fn ancestry(
    &self,
    base: BlockHash,
    block: BlockHash,
  ) -> Result<Vec<BlockHash>, VotingError> {
    let mut hashes = vec![];
    let mut cursor = block;
    loop {
      let header = self
        .headers
        .get(&cursor)
        .ok_or(VotingError::ChainQueryFailed("unknown block"))?;
      if header.number == 0 {
        // walked the whole chain without meeting the base
        return Err(VotingError::NotDescendant);
      }
      if header.parent_hash == base {
        return Ok(hashes);
      }
      hashes.push(header.parent_hash);
      cursor = header.parent_hash;
    }
  }

  fn best_chain_containing(&self, block: BlockHash) -> Option<BlockInfo> {
    if !self.headers.contains_key(&block) {
      return None;
    }

    let mut best: Option<BlockInfo> = None;
    for (hash, header) in &self.headers {
      let is_leaf = self.children.get(hash).map_or(true, |c| c.is_empty());
      if !is_leaf || !self.is_equal_or_descendant_of(block, *hash) {
        continue;
      }
      let info = BlockInfo::new(*hash, header.number);
      best = match best {
        Some(current)
          if current.number > info.number
            || (current.number == info.number && current.hash < info.hash) =>
        {
          Some(current)
        }
        _ => Some(info),
      };
    }
    best
  }

  fn is_equal_or_descendant_of(
    &self,
    ancestor: BlockHash,
    descendant: BlockHash,
  ) -> bool {
    let mut cursor = descendant;
    loop {
      if cursor == ancestor {
        return true;
      }
      match self.headers.get(&cursor) {
        Some(header) if header.number > 0 => cursor = header.parent_hash,
        _ => return false,
      }
    }
  }

  fn finalize(
    &mut self,
    block: BlockHash,
    justification: Justification,
  ) -> Result<(), VotingError> {
    let header = self
      .headers
      .get(&block)
      .ok_or(VotingError::ChainQueryFailed("finalizing unknown block"))?;
    let number = header.number;
    if number <= self.finalized.number
      || !self.is_equal_or_descendant_of(self.finalized.hash, block)
    {
      return Err(VotingError::FinalizeRejected(number));
    }

    self.finalized = BlockInfo::new(block, number);
    self.finalized_log.push((self.finalized, justification));
    Ok(())
  }
}

/// Gossip port that records everything published through it.
#[derive(Default)]
pub struct TestGossip {
  pub votes: Vec<VoteMessage>,
  pub fins: Vec<Fin>,
}

impl Gossip for TestGossip {
  fn vote(&mut self, message: VoteMessage) {
    self.votes.push(message);
  }

  fn fin(&mut self, fin: Fin) {
    self.fins.push(fin);
  }
}

/// Shared handles so a test can keep inspecting the chain and
/// the gossip outbox while the voter owns them. The whole core
/// is single threaded, plain `Rc<RefCell<..>>` is enough.
#[derive(Clone)]
pub struct SharedChain(pub Rc<RefCell<TestChain>>);

impl SharedChain {
  pub fn new(chain: TestChain) -> Self {
    Self(Rc::new(RefCell::new(chain)))
  }
}

impl BlockTree for SharedChain {
  fn last_finalized(&self) -> BlockInfo {
    self.0.borrow().last_finalized()
  }

  fn header(&self, hash: &BlockHash) -> Option<BlockHeader> {
    self.0.borrow().header(hash)
  }

  fn ancestry(
    &self,
    base: BlockHash,
    block: BlockHash,
  ) -> Result<Vec<BlockHash>, VotingError> {
    self.0.borrow().ancestry(base, block)
  }

  fn best_chain_containing(&self, block: BlockHash) -> Option<BlockInfo> {
    self.0.borrow().best_chain_containing(block)
  }

  fn is_equal_or_descendant_of(
    &self,
    ancestor: BlockHash,
    descendant: BlockHash,
  ) -> bool {
    self
      .0
      .borrow()
      .is_equal_or_descendant_of(ancestor, descendant)
  }

  fn finalize(
    &mut self,
    block: BlockHash,
    justification: Justification,
  ) -> Result<(), VotingError> {
    self.0.borrow_mut().finalize(block, justification)
  }
}

#[derive(Clone, Default)]
pub struct SharedGossip(pub Rc<RefCell<TestGossip>>);

impl Gossip for SharedGossip {
  fn vote(&mut self, message: VoteMessage) {
    self.0.borrow_mut().vote(message);
  }

  fn fin(&mut self, fin: Fin) {
    self.0.borrow_mut().fin(fin);
  }
}
