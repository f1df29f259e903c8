//! The per-round voting state machine.
//!
//! A round moves through four steps, propose, prevote, precommit
//! and finalize, driven by two timer deadlines and by incoming
//! votes. The step function is deterministic: all inputs arrive
//! either through the message handlers or through [`VotingRound::poll`]
//! with an explicit clock reading, which is what makes rounds
//! testable against a simulated clock.

use {
  super::{
    chain::BlockTree,
    error::VotingError,
    graph::VoteGraph,
    justification::{Fin, Justification},
    tracker::{PushResult, VoteTracker},
    vote::{
      BlockInfo,
      Precommit,
      Prevote,
      Signed,
      Stage,
      Vote,
      VoteKind,
      VoteMessage,
    },
    voters::VoterSet,
  },
  crate::primitives::{Keypair, Pubkey},
  std::time::{Duration, Instant},
  tracing::{debug, warn},
};

/// Step of the round's vote-casting state machine. Steps only
/// ever advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Step {
  Start,
  Proposed,
  Prevoted,
  Precommitted,
}

/// The observable outcome of a round so far.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RoundState {
  /// GHOST-selected block at or above threshold prevote weight.
  pub prevote_ghost: Option<BlockInfo>,
  /// Deepest block that can still be finalized given the
  /// precommit weight not yet cast.
  pub estimate: Option<BlockInfo>,
  /// Block with threshold precommit weight on its ancestry.
  pub finalized: Option<BlockInfo>,
  /// Whether finality can no longer extend past the estimate,
  /// which is what permits starting the next round.
  pub completable: bool,
}

impl RoundState {
  /// The synthetic state of the round before the first: every
  /// field pinned to the starting base block.
  pub fn genesis(base: BlockInfo) -> Self {
    Self {
      prevote_ghost: Some(base),
      estimate: Some(base),
      finalized: Some(base),
      completable: true,
    }
  }
}

/// Effects a round asks its owner to perform. The round itself
/// never touches the network or the block tree write path.
#[derive(Clone, Debug)]
pub enum RoundAction {
  /// Gossip one of our own signed votes.
  Vote(VoteMessage),
  /// Gossip a commit message.
  Fin(Fin),
  /// Mark a block as finalized in the block tree.
  Finalize {
    target: BlockInfo,
    justification: Justification,
  },
  /// A voter signed two conflicting votes of the same kind.
  Equivocated { kind: VoteKind, id: Pubkey },
}

/// Everything needed to spin up one voting round.
pub struct RoundParams {
  pub round_number: u64,
  pub set_id: u64,
  pub voters: VoterSet,
  pub keypair: Keypair,
  /// Root of the vote graph: the last finalized block.
  pub base: BlockInfo,
  pub last_round_state: RoundState,
  /// Justification for the previous round's estimate, used by
  /// the primary to back its hint.
  pub prior_justification: Option<Justification>,
  pub start_time: Instant,
  /// The nominal round duration `D`; prevotes are due at
  /// `start + 2D` and precommits at `start + 4D`.
  pub duration: Duration,
}

/// A single round of voting.
pub struct VotingRound {
  round_number: u64,
  set_id: u64,
  voters: VoterSet,
  keypair: Keypair,
  step: Step,
  prevote_deadline: Instant,
  precommit_deadline: Instant,
  tracker: VoteTracker,
  graph: VoteGraph,
  state: RoundState,
  last_round_state: RoundState,
  prior_justification: Option<Justification>,
  primary_hint: Option<BlockInfo>,
  fin_received: bool,
  finalized_emitted: bool,
}

impl VotingRound {
  pub fn new(params: RoundParams) -> Self {
    let RoundParams {
      round_number,
      set_id,
      voters,
      keypair,
      base,
      last_round_state,
      prior_justification,
      start_time,
      duration,
    } = params;

    Self {
      round_number,
      set_id,
      tracker: VoteTracker::new(round_number, set_id, voters.len()),
      graph: VoteGraph::new(base, voters.len()),
      keypair,
      voters,
      step: Step::Start,
      prevote_deadline: start_time + duration * 2,
      precommit_deadline: start_time + duration * 4,
      state: RoundState {
        prevote_ghost: None,
        estimate: None,
        finalized: None,
        completable: false,
      },
      last_round_state,
      prior_justification,
      primary_hint: None,
      fin_received: false,
      finalized_emitted: false,
    }
  }

  pub fn round_number(&self) -> u64 {
    self.round_number
  }

  pub fn step(&self) -> Step {
    self.step
  }

  pub fn state(&self) -> &RoundState {
    &self.state
  }

  pub fn completable(&self) -> bool {
    self.state.completable
  }

  /// The next point in time at which [`Self::poll`] can make
  /// progress on its own, or `None` once all votes are cast.
  pub fn next_deadline(&self) -> Option<Instant> {
    match self.step {
      Step::Start | Step::Proposed => Some(self.prevote_deadline),
      Step::Prevoted => Some(self.precommit_deadline),
      Step::Precommitted => None,
    }
  }

  /// Builds the justification backing this round's estimate, for
  /// the next round's primary to re-broadcast.
  pub fn estimate_justification<C: BlockTree>(
    &self,
    chain: &C,
  ) -> Option<Justification> {
    let estimate = self.state.estimate?;
    let precommits = self.tracker.justification(estimate, &self.voters, chain)?;
    Justification::new(self.round_number, estimate, precommits, chain).ok()
  }

  /// Handles one incoming vote message for this round.
  ///
  /// Signature or membership failures surface as errors for the
  /// caller to log; the round state is untouched by them.
  pub fn on_vote_message<C: BlockTree>(
    &mut self,
    message: VoteMessage,
    chain: &C,
  ) -> Result<Vec<RoundAction>, VotingError> {
    if message.round_number != self.round_number
      || message.set_id != self.set_id
    {
      debug!(
        "dropping vote for round {} (set {}) routed to round {}",
        message.round_number, message.set_id, self.round_number
      );
      return Ok(vec![]);
    }

    let mut actions = vec![];
    match message.vote {
      Vote::Prevote(signed) => {
        let id = signed.id.clone();
        let target = signed.vote.target();
        let (index, result) = self.tracker.push_prevote(signed, &self.voters)?;
        self.apply_vote(
          VoteKind::Prevote,
          index,
          id,
          target,
          result,
          chain,
          &mut actions,
        );
      }
      Vote::Precommit(signed) => {
        let id = signed.id.clone();
        let target = signed.vote.target();
        let (index, result) =
          self.tracker.push_precommit(signed, &self.voters)?;
        self.apply_vote(
          VoteKind::Precommit,
          index,
          id,
          target,
          result,
          chain,
          &mut actions,
        );
      }
      Vote::PrimaryPropose(signed) => {
        signed.verify(self.round_number, self.set_id)?;
        if &signed.id == self.voters.primary(self.round_number) {
          self.on_primary_hint(signed.vote.target());
        } else {
          warn!(
            "ignoring primary propose from non-primary voter {}",
            signed.id
          );
        }
      }
    }

    Ok(actions)
  }

  fn apply_vote<C: BlockTree>(
    &mut self,
    kind: VoteKind,
    index: usize,
    id: Pubkey,
    target: BlockInfo,
    result: PushResult,
    chain: &C,
    actions: &mut Vec<RoundAction>,
  ) {
    match result {
      PushResult::Success => {
        self.insert_into_graph(target, kind, index, chain);
        self.update();
      }
      // the second vote of an equivocation still lands in the
      // graph; bitset union keeps the voter's weight counted
      // once at every common ancestor
      PushResult::Equivocated => {
        self.insert_into_graph(target, kind, index, chain);
        actions.push(RoundAction::Equivocated { kind, id });
        self.update();
      }
      PushResult::Duplicate => {}
    }
  }

  fn insert_into_graph<C: BlockTree>(
    &mut self,
    target: BlockInfo,
    kind: VoteKind,
    index: usize,
    chain: &C,
  ) {
    let weight = self
      .voters
      .weight_by_index(index)
      .expect("the tracker resolved this index from the voter set; qed");
    if let Err(error) = self.graph.insert(target, kind, index, weight, chain) {
      warn!(
        "vote for {:?} not inserted into round {} graph: {error}",
        target, self.round_number
      );
    }
  }

  /// Accepts an advisory primary hint for this round. Hints
  /// arriving after we prevoted can no longer influence anything
  /// and are ignored.
  pub fn on_primary_hint(&mut self, target: BlockInfo) {
    if self.step <= Step::Proposed && self.primary_hint.is_none() {
      debug!(
        "received primary hint {:?} for round {}",
        target, self.round_number
      );
      self.primary_hint = Some(target);
    }
  }

  /// Handles a commit message for this round: after the carried
  /// justification verifies, its precommits are ingested through
  /// the regular tracker path and the round state re-evaluated.
  pub fn on_fin<C: BlockTree>(
    &mut self,
    fin: &Fin,
    chain: &C,
  ) -> Result<Vec<RoundAction>, VotingError> {
    if fin.round_number != self.round_number {
      debug!(
        "dropping fin for round {} routed to round {}",
        fin.round_number, self.round_number
      );
      return Ok(vec![]);
    }
    fin.verify(self.set_id, &self.voters)?;

    self.fin_received = true;
    let mut actions = vec![];
    for signed in fin.justification.commit.precommits.iter() {
      let id = signed.id.clone();
      let target = signed.vote.target();
      match self.tracker.push_precommit(signed.clone(), &self.voters) {
        Ok((index, result)) => self.apply_vote(
          VoteKind::Precommit,
          index,
          id,
          target,
          result,
          chain,
          &mut actions,
        ),
        Err(error) => warn!("dropping precommit carried by fin: {error}"),
      }
    }

    Ok(actions)
  }

  /// Advances the state machine as far as the clock and the
  /// accumulated votes allow, returning the effects to perform.
  ///
  /// A completable round advances without waiting for its
  /// deadlines; the deadline that stops mattering is simply
  /// never acted upon again.
  pub fn poll<C: BlockTree>(
    &mut self,
    now: Instant,
    chain: &C,
  ) -> Result<Vec<RoundAction>, VotingError> {
    let mut actions = vec![];
    self.primary_propose(&mut actions);
    self.prevote(now, chain, &mut actions)?;
    self.precommit(now, chain, &mut actions)?;
    self.try_finalize(chain, &mut actions)?;
    Ok(actions)
  }

  /// If this node is the round's primary and the previous round
  /// left an estimate above its finalized block, re-broadcast
  /// that estimate as a hint for everyone's prevote.
  fn primary_propose(&mut self, actions: &mut Vec<RoundAction>) {
    if self.step != Step::Start {
      return;
    }
    if self.voters.primary(self.round_number) != &self.keypair.public() {
      return;
    }

    let estimate = match self.last_round_state.estimate {
      Some(estimate) => estimate,
      None => {
        debug!(
          "last round estimate does not exist, not sending primary hint \
           during round {}",
          self.round_number
        );
        return;
      }
    };
    let should_send = self
      .last_round_state
      .finalized
      .map(|finalized| estimate.number > finalized.number)
      .unwrap_or(false);
    if !should_send {
      return;
    }

    match &self.prior_justification {
      Some(justification) if justification.commit.target == estimate => {
        debug!("sending primary block hint for round {}", self.round_number);
        self.primary_hint = Some(estimate);
        actions.push(RoundAction::Fin(Fin {
          round_number: self.round_number - 1,
          target: estimate,
          justification: justification.clone(),
        }));
        self.step = Step::Proposed;
      }
      _ => debug!(
        "no justification backs the prior estimate, skipping primary hint \
         for round {}",
        self.round_number
      ),
    }
  }

  fn prevote<C: BlockTree>(
    &mut self,
    now: Instant,
    chain: &C,
    actions: &mut Vec<RoundAction>,
  ) -> Result<(), VotingError> {
    if !matches!(self.step, Step::Start | Step::Proposed) {
      return Ok(());
    }
    if now < self.prevote_deadline && !self.state.completable {
      return Ok(());
    }

    if self.voters.contains(&self.keypair.public()) {
      if let Some(prevote) = self.construct_prevote(chain)? {
        debug!("casting prevote for round {}", self.round_number);
        let signed =
          Signed::new(&self.keypair, prevote, self.round_number, self.set_id);
        actions.push(RoundAction::Vote(VoteMessage {
          round_number: self.round_number,
          set_id: self.set_id,
          vote: Vote::Prevote(signed),
        }));
      }
    }
    self.step = Step::Prevoted;

    Ok(())
  }

  fn precommit<C: BlockTree>(
    &mut self,
    now: Instant,
    chain: &C,
    actions: &mut Vec<RoundAction>,
  ) -> Result<(), VotingError> {
    if self.step != Step::Prevoted {
      return Ok(());
    }
    let last_round_estimate = match self.last_round_state.estimate {
      Some(estimate) => estimate,
      None => {
        warn!("rounds only start when the prior round is completable");
        return Ok(());
      }
    };

    // never precommit off the committed prefix: our prevote
    // ghost must sit on the chain of the previous estimate
    let safe = self.state.prevote_ghost.map_or(false, |ghost| {
      ghost.hash == last_round_estimate.hash
        || chain.is_equal_or_descendant_of(last_round_estimate.hash, ghost.hash)
    });
    let due = now >= self.precommit_deadline || self.state.completable;
    if !safe || !due {
      return Ok(());
    }

    if self.voters.contains(&self.keypair.public()) {
      let target = self
        .state
        .prevote_ghost
        .unwrap_or_else(|| self.graph.base());
      debug!("casting precommit for round {}", self.round_number);
      let signed = Signed::new(
        &self.keypair,
        Precommit::new(target),
        self.round_number,
        self.set_id,
      );
      actions.push(RoundAction::Vote(VoteMessage {
        round_number: self.round_number,
        set_id: self.set_id,
        vote: Vote::Precommit(signed),
      }));
    }
    self.step = Step::Precommitted;

    Ok(())
  }

  /// Picks the block to anchor our prevote on, then votes for
  /// the best chain containing it.
  fn construct_prevote<C: BlockTree>(
    &self,
    chain: &C,
  ) -> Result<Option<Prevote>, VotingError> {
    let last_round_estimate = match self.last_round_state.estimate {
      Some(estimate) => estimate,
      None => {
        warn!("rounds only start when the prior round is completable");
        return Ok(None);
      }
    };

    let anchor = match self.primary_hint {
      None => last_round_estimate,
      Some(primary) => {
        let last_prevote_ghost = match self.last_round_state.prevote_ghost {
          Some(ghost) => ghost,
          None => {
            warn!("rounds only start when the prior round is completable");
            return Ok(None);
          }
        };

        if primary == last_prevote_ghost {
          primary
        } else if primary.number >= last_prevote_ghost.number {
          last_round_estimate
        } else {
          // the primary block is below the last prevote ghost;
          // anchor on it only if it actually sits on the chain
          // between the last estimate and that ghost
          match chain
            .ancestry(last_round_estimate.hash, last_prevote_ghost.hash)
          {
            Ok(ancestry) => {
              let offset = last_prevote_ghost
                .number
                .saturating_sub(primary.number + 1)
                as usize;
              if ancestry.get(offset) == Some(&primary.hash) {
                primary
              } else {
                last_round_estimate
              }
            }
            Err(VotingError::NotDescendant) => last_round_estimate,
            Err(error) => return Err(error),
          }
        }
      }
    };

    match chain.best_chain_containing(anchor.hash) {
      Some(target) => Ok(Some(Prevote::new(target))),
      None => {
        // the anchor vanished from the block tree; sit this step
        // out and let the timers carry the round
        warn!(
          "could not cast prevote in round {}: {}",
          self.round_number,
          VotingError::BlockPruned
        );
        Ok(None)
      }
    }
  }

  fn try_finalize<C: BlockTree>(
    &mut self,
    chain: &C,
    actions: &mut Vec<RoundAction>,
  ) -> Result<(), VotingError> {
    if self.step != Step::Precommitted || self.finalized_emitted {
      return Ok(());
    }
    let estimate = match self.state.estimate {
      Some(estimate) => estimate,
      None => return Ok(()),
    };
    if estimate.number <= chain.last_finalized().number {
      return Ok(());
    }
    let precommits =
      match self.tracker.justification(estimate, &self.voters, chain) {
        Some(cover) => cover,
        None => return Ok(()),
      };

    let justification =
      Justification::new(self.round_number, estimate, precommits, chain)?;
    self.finalized_emitted = true;
    actions.push(RoundAction::Finalize {
      target: estimate,
      justification: justification.clone(),
    });
    if !self.fin_received {
      actions.push(RoundAction::Fin(Fin {
        round_number: self.round_number,
        target: estimate,
        justification,
      }));
    }

    Ok(())
  }

  /// Recomputes the round state after accepted votes.
  fn update(&mut self) {
    let threshold = self.voters.threshold();
    if self.tracker.prevote_weight() < threshold {
      return;
    }

    let prevote_ghost = match self.graph.find_ghost(
      None,
      VoteKind::Prevote,
      |weight| weight >= threshold,
    ) {
      Some(ghost) => ghost,
      None => return,
    };
    self.state.prevote_ghost = Some(prevote_ghost);

    let precommit_weight = self.tracker.precommit_weight();
    if precommit_weight > threshold {
      let finalized = self.graph.find_ancestor(
        prevote_ghost,
        VoteKind::Precommit,
        |weight| weight > threshold,
      );
      // within a round finalization never moves backwards
      if let Some(finalized) = finalized {
        if self
          .state
          .finalized
          .map_or(true, |previous| finalized.number >= previous.number)
        {
          self.state.finalized = Some(finalized);
        }
      }
    }

    if precommit_weight >= threshold {
      self.state.estimate = self.graph.find_ancestor(
        prevote_ghost,
        VoteKind::Precommit,
        |weight| weight >= threshold,
      );
    } else {
      self.state.estimate = Some(prevote_ghost);
      return; // not yet completable
    }

    self.state.completable = match self.state.estimate {
      Some(estimate) => {
        estimate.hash == prevote_ghost.hash
          || self
            .graph
            .find_ghost(Some(estimate), VoteKind::Precommit, |weight| {
              weight >= threshold
            })
            .is_none()
      }
      None => false,
    };
  }
}
