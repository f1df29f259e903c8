//! The round orchestrator: sequences voting rounds, routes
//! inbound gossip to them, executes their effects against the
//! block tree and the gossip port, and surfaces protocol events
//! to the embedding node.
//!
//! The whole core is single threaded and cooperative: every
//! mutation of round state happens on the executor driving this
//! stream, so no internal locking is needed.

use {
  super::{
    chain::BlockTree,
    gossip::Gossip,
    justification::{Fin, Justification},
    round::{RoundAction, RoundParams, RoundState, Step, VotingRound},
    vote::{BlockInfo, VoteKind, VoteMessage},
    voters::VoterSet,
  },
  crate::primitives::{Keypair, Pubkey},
  futures::Stream,
  std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
  },
  tokio::sync::mpsc,
  tracing::{debug, error, warn},
};

/// Messages buffered for a single not-yet-started round before
/// the excess is dropped.
const FUTURE_ROUND_BUFFER: usize = 1024;

/// Injected time source, so rounds can be driven by a simulated
/// clock in tests.
pub trait Clock {
  fn now(&self) -> Instant;
}

/// The wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> Instant {
    Instant::now()
  }
}

/// Protocol events emitted by the voter for the embedding node.
#[derive(Clone, Debug)]
pub enum VoterEvent {
  RoundStarted {
    round: u64,
    set_id: u64,
  },
  /// A block was marked final in the block tree.
  Finalized {
    round: u64,
    block: BlockInfo,
  },
  /// The block tree refused a finalization; this indicates a
  /// disagreement between the core and the tree and is never
  /// silently dropped.
  FinalizeRejected {
    round: u64,
    block: BlockInfo,
  },
  /// A voter signed two conflicting votes of the same kind.
  /// Detection only, slashing is up to the embedding node.
  Equivocated {
    round: u64,
    kind: VoteKind,
    id: Pubkey,
  },
  /// A scheduled voter set change activated.
  SetChanged {
    set_id: u64,
  },
}

enum Inbound {
  Vote(VoteMessage),
  Fin(Fin),
}

/// Cheap handle for feeding inbound gossip into the voter from
/// the transport layer.
#[derive(Clone)]
pub struct VoterHandle {
  sender: mpsc::UnboundedSender<Inbound>,
}

impl VoterHandle {
  pub fn on_vote_message(&self, message: VoteMessage) {
    let _ = self.sender.send(Inbound::Vote(message));
  }

  pub fn on_fin(&self, fin: Fin) {
    let _ = self.sender.send(Inbound::Fin(fin));
  }
}

/// Drives voting rounds to finality.
///
/// The voter owns the current round and retains the previous one
/// so that late votes and commit messages keep improving its
/// justification without re-opening it. Implemented as a stream
/// of [`VoterEvent`]s, in the same shape the chain state machine
/// of the block layer exposes its events.
pub struct Voter<B, G, C> {
  chain: B,
  gossip: G,
  clock: C,
  keypair: Keypair,
  voters: VoterSet,
  set_id: u64,
  round_duration: Duration,
  best_round: VotingRound,
  prev_round: Option<VotingRound>,
  buffered_votes: HashMap<u64, Vec<VoteMessage>>,
  buffered_fins: HashMap<u64, Vec<Fin>>,
  pending_change: Option<(u64, Vec<(Pubkey, u64)>)>,
  incoming: mpsc::UnboundedReceiver<Inbound>,
  events: VecDeque<VoterEvent>,
  timer: Option<Pin<Box<tokio::time::Sleep>>>,
  timer_deadline: Option<Instant>,
}

impl<B, G, C> Voter<B, G, C>
where
  B: BlockTree,
  G: Gossip,
  C: Clock,
{
  /// Creates a voter starting at round 1 of the given voter set
  /// epoch, rooted at the block tree's last finalized block.
  pub fn new(
    chain: B,
    gossip: G,
    clock: C,
    keypair: Keypair,
    voters: VoterSet,
    set_id: u64,
    round_duration: Duration,
  ) -> (Self, VoterHandle) {
    let (sender, incoming) = mpsc::unbounded_channel();
    let base = chain.last_finalized();
    let best_round = VotingRound::new(RoundParams {
      round_number: 1,
      set_id,
      voters: voters.clone(),
      keypair: keypair.clone(),
      base,
      last_round_state: RoundState::genesis(base),
      prior_justification: None,
      start_time: clock.now(),
      duration: round_duration,
    });

    let mut events = VecDeque::new();
    events.push_back(VoterEvent::RoundStarted { round: 1, set_id });

    let voter = Self {
      chain,
      gossip,
      clock,
      keypair,
      voters,
      set_id,
      round_duration,
      best_round,
      prev_round: None,
      buffered_votes: HashMap::new(),
      buffered_fins: HashMap::new(),
      pending_change: None,
      incoming,
      events,
      timer: None,
      timer_deadline: None,
    };

    (voter, VoterHandle { sender })
  }

  pub fn round_number(&self) -> u64 {
    self.best_round.round_number()
  }

  pub fn set_id(&self) -> u64 {
    self.set_id
  }

  pub fn voters(&self) -> &VoterSet {
    &self.voters
  }

  fn dispatch(&mut self, inbound: Inbound) {
    match inbound {
      Inbound::Vote(message) => self.dispatch_vote(message),
      Inbound::Fin(fin) => self.dispatch_fin(fin),
    }
  }

  fn dispatch_vote(&mut self, message: VoteMessage) {
    if message.set_id != self.set_id {
      debug!(
        "dropping vote for set {} while in set {}",
        message.set_id, self.set_id
      );
      return;
    }

    let best = self.best_round.round_number();
    let prev = self.prev_round.as_ref().map(|r| r.round_number());
    if message.round_number == best || Some(message.round_number) == prev {
      self.deliver_vote(message.round_number, message);
    } else if message.round_number > best {
      let buffer = self
        .buffered_votes
        .entry(message.round_number)
        .or_default();
      if buffer.len() < FUTURE_ROUND_BUFFER {
        buffer.push(message);
      } else {
        warn!(
          "dropping vote for future round {}: buffer full",
          message.round_number
        );
      }
    } else {
      debug!("dropping vote for completed round {}", message.round_number);
    }
  }

  /// Hands a vote to the round it belongs to and executes the
  /// effects. Per-message failures are logged and dropped, they
  /// never tear down the round.
  fn deliver_vote(&mut self, round_number: u64, message: VoteMessage) {
    let result = if self.best_round.round_number() == round_number {
      self.best_round.on_vote_message(message, &self.chain)
    } else if let Some(prev) = self
      .prev_round
      .as_mut()
      .filter(|r| r.round_number() == round_number)
    {
      prev.on_vote_message(message, &self.chain)
    } else {
      return;
    };

    match result {
      Ok(actions) => self.handle_actions(round_number, actions),
      Err(error) => {
        warn!("dropping vote message for round {round_number}: {error}")
      }
    }
  }

  fn dispatch_fin(&mut self, fin: Fin) {
    let best = self.best_round.round_number();
    if fin.round_number == best {
      self.on_current_fin(fin);
    } else if fin.round_number + 1 == best {
      self.on_prior_fin(fin);
    } else if fin.round_number > best {
      let buffer = self.buffered_fins.entry(fin.round_number).or_default();
      if buffer.len() < FUTURE_ROUND_BUFFER {
        buffer.push(fin);
      } else {
        warn!(
          "dropping fin for future round {}: buffer full",
          fin.round_number
        );
      }
    } else {
      debug!("dropping fin for completed round {}", fin.round_number);
    }
  }

  /// A commit message for the round we are still voting in. The
  /// carried precommits are ingested through the regular tracker
  /// path, the proven block is finalized, and the next round
  /// starts even if our own votes are lagging behind.
  fn on_current_fin(&mut self, fin: Fin) {
    let set_id = self.set_id;
    match self.best_round.on_fin(&fin, &self.chain) {
      Ok(actions) => {
        self.handle_actions(fin.round_number, actions);
        self.finalize(fin.round_number, fin.target, fin.justification.clone());
        self.pump();

        // a set change activated by this finalization already
        // replaced the round
        if self.set_id == set_id
          && self.best_round.round_number() == fin.round_number
        {
          let state = if self.best_round.completable() {
            self.best_round.state().clone()
          } else {
            // our own round lags behind its peers, seed the next
            // round from the proven commit instead
            RoundState {
              prevote_ghost: Some(fin.target),
              estimate: Some(fin.target),
              finalized: Some(fin.target),
              completable: true,
            }
          };
          self.start_next_round(state);
        }
      }
      Err(error) => {
        warn!("dropping invalid fin for round {}: {error}", fin.round_number)
      }
    }
  }

  /// A commit message for the previous round: the primary hint
  /// carrier for the current round, and a late justification
  /// improvement for the retained round.
  fn on_prior_fin(&mut self, fin: Fin) {
    if let Err(error) = fin.verify(self.set_id, &self.voters) {
      warn!("dropping invalid fin for round {}: {error}", fin.round_number);
      return;
    }

    self.best_round.on_primary_hint(fin.target);

    let late_actions = self
      .prev_round
      .as_mut()
      .filter(|r| r.round_number() == fin.round_number)
      .map(|prev| prev.on_fin(&fin, &self.chain));
    match late_actions {
      Some(Ok(actions)) => self.handle_actions(fin.round_number, actions),
      Some(Err(error)) => {
        warn!("fin rejected by round {}: {error}", fin.round_number)
      }
      None => {}
    }

    self.finalize(fin.round_number, fin.target, fin.justification.clone());
    self.pump();
  }

  fn handle_actions(&mut self, round_number: u64, actions: Vec<RoundAction>) {
    for action in actions {
      match action {
        RoundAction::Vote(message) => {
          // our own votes take the same import path as everyone
          // else's before they hit the wire
          self.deliver_vote(round_number, message.clone());
          self.gossip.vote(message);
        }
        RoundAction::Fin(fin) => self.gossip.fin(fin),
        RoundAction::Finalize {
          target,
          justification,
        } => self.finalize(round_number, target, justification),
        RoundAction::Equivocated { kind, id } => {
          warn!("voter {id} equivocated in round {round_number}");
          self.events.push_back(VoterEvent::Equivocated {
            round: round_number,
            kind,
            id,
          });
        }
      }
    }
  }

  fn finalize(
    &mut self,
    round_number: u64,
    target: BlockInfo,
    justification: Justification,
  ) {
    // finalization is monotone across rounds
    if target.number <= self.chain.last_finalized().number {
      return;
    }

    match self.chain.finalize(target.hash, justification) {
      Ok(()) => {
        debug!("finalized block {:?} in round {round_number}", target);
        self.events.push_back(VoterEvent::Finalized {
          round: round_number,
          block: target,
        });
        self.check_set_change(target);
      }
      Err(error) => {
        error!(
          "block tree rejected finalization of {:?} in round \
           {round_number}: {error}",
          target
        );
        self.events.push_back(VoterEvent::FinalizeRejected {
          round: round_number,
          block: target,
        });
      }
    }
  }

  /// Picks up a voter set change scheduled through the digest of
  /// a freshly finalized header and applies it once enough
  /// blocks are finalized on top of it.
  fn check_set_change(&mut self, finalized: BlockInfo) {
    if let Some(header) = self.chain.header(&finalized.hash) {
      if let Some(change) = header.digest {
        debug!(
          "voter set change scheduled at finalized block {}, activates \
           after {} more",
          header.number, change.delay
        );
        self.pending_change =
          Some((header.number + change.delay, change.voters));
      }
    }

    let activated = self
      .pending_change
      .as_ref()
      .map_or(false, |(at, _)| self.chain.last_finalized().number >= *at);
    if activated {
      if let Some((_, voters)) = self.pending_change.take() {
        self.apply_set_change(voters);
      }
    }
  }

  /// Drains in-flight rounds, bumps the set id and restarts
  /// voting from scratch against the new voter set.
  fn apply_set_change(&mut self, voters: Vec<(Pubkey, u64)>) {
    match VoterSet::new(voters) {
      Some(next) => {
        self.set_id += 1;
        self.voters = next;
        self.prev_round = None;
        self.buffered_votes.clear();
        self.buffered_fins.clear();

        let base = self.chain.last_finalized();
        debug!(
          "voter set change activated, starting set {} over base {:?}",
          self.set_id, base
        );
        self.best_round = VotingRound::new(RoundParams {
          round_number: 1,
          set_id: self.set_id,
          voters: self.voters.clone(),
          keypair: self.keypair.clone(),
          base,
          last_round_state: RoundState::genesis(base),
          prior_justification: None,
          start_time: self.clock.now(),
          duration: self.round_duration,
        });
        self.events.push_back(VoterEvent::SetChanged {
          set_id: self.set_id,
        });
        self.events.push_back(VoterEvent::RoundStarted {
          round: 1,
          set_id: self.set_id,
        });
      }
      None => error!(
        "scheduled voter set change is degenerate, keeping the current set"
      ),
    }
  }

  fn start_next_round(&mut self, last_state: RoundState) {
    let next_number = self.best_round.round_number() + 1;
    let prior_justification =
      self.best_round.estimate_justification(&self.chain);
    let base = self.chain.last_finalized();

    let next = VotingRound::new(RoundParams {
      round_number: next_number,
      set_id: self.set_id,
      voters: self.voters.clone(),
      keypair: self.keypair.clone(),
      base,
      last_round_state: last_state,
      prior_justification,
      start_time: self.clock.now(),
      duration: self.round_duration,
    });

    debug!("starting round {next_number}");
    self.prev_round = Some(std::mem::replace(&mut self.best_round, next));
    self.events.push_back(VoterEvent::RoundStarted {
      round: next_number,
      set_id: self.set_id,
    });

    // replay gossip that arrived before the round existed
    if let Some(votes) = self.buffered_votes.remove(&next_number) {
      for message in votes {
        self.deliver_vote(next_number, message);
      }
    }
    if let Some(fins) = self.buffered_fins.remove(&next_number) {
      for fin in fins {
        self.dispatch_fin(fin);
      }
    }
    self.buffered_votes.retain(|round, _| *round > next_number);
    self.buffered_fins.retain(|round, _| *round > next_number);
  }

  /// Polls the live rounds until no more progress can be made at
  /// the current clock reading, then hands over to the next
  /// round if the best one completed.
  fn pump(&mut self) {
    let now = self.clock.now();
    loop {
      let mut acted = false;

      let prev_polled = self
        .prev_round
        .as_mut()
        .map(|prev| (prev.round_number(), prev.poll(now, &self.chain)));
      if let Some((number, result)) = prev_polled {
        match result {
          Ok(actions) if !actions.is_empty() => {
            self.handle_actions(number, actions);
            acted = true;
          }
          Ok(_) => {}
          Err(error) => warn!("round {number} poll failed: {error}"),
        }
      }

      let number = self.best_round.round_number();
      match self.best_round.poll(now, &self.chain) {
        Ok(actions) if !actions.is_empty() => {
          self.handle_actions(number, actions);
          acted = true;
        }
        Ok(_) => {}
        Err(error) => warn!("round {number} poll failed: {error}"),
      }

      if self.best_round.step() == Step::Precommitted
        && self.best_round.completable()
      {
        let state = self.best_round.state().clone();
        self.start_next_round(state);
        acted = true;
      }

      if !acted {
        break;
      }
    }
  }

  fn next_deadline(&self) -> Option<Instant> {
    let best = self.best_round.next_deadline();
    let prev = self.prev_round.as_ref().and_then(|r| r.next_deadline());
    match (best, prev) {
      (Some(a), Some(b)) => Some(a.min(b)),
      (deadline, other) => deadline.or(other),
    }
  }
}

impl<B, G, C> Stream for Voter<B, G, C>
where
  B: BlockTree + Unpin,
  G: Gossip + Unpin,
  C: Clock + Unpin,
{
  type Item = VoterEvent;

  fn poll_next(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
  ) -> Poll<Option<Self::Item>> {
    let this = self.get_mut();

    loop {
      if let Some(event) = this.events.pop_front() {
        return Poll::Ready(Some(event));
      }

      let mut progressed = false;

      loop {
        match this.incoming.poll_recv(cx) {
          Poll::Ready(Some(inbound)) => {
            this.dispatch(inbound);
            progressed = true;
          }
          // all handles dropped, the voter shuts down
          Poll::Ready(None) => return Poll::Ready(None),
          Poll::Pending => break,
        }
      }

      // keep a single timer armed for the earliest deadline any
      // live round still cares about; deadlines that stopped
      // mattering are simply never acted upon. `timer_deadline`
      // survives the timer firing so an expired deadline the
      // rounds cannot act on yet is not re-armed as a busy loop,
      // progress then waits on incoming messages
      let deadline = this.next_deadline();
      if deadline != this.timer_deadline {
        this.timer_deadline = deadline;
        this.timer = deadline.map(|at| {
          let wait = at.saturating_duration_since(this.clock.now());
          Box::pin(tokio::time::sleep(wait))
        });
      }
      if let Some(timer) = this.timer.as_mut() {
        if timer.as_mut().poll(cx).is_ready() {
          this.timer = None;
          progressed = true;
        }
      }

      if progressed {
        this.pump();
        continue;
      }
      return Poll::Pending;
    }
  }
}

#[cfg(test)]
mod tests {
  use {
    super::*,
    crate::{
      consensus::{Precommit, Prevote, ScheduledChange, Signed, Stage, Vote},
      test::utils::{
        init_tracing,
        keypairs,
        voter_set,
        SharedChain,
        SharedGossip,
        TestChain,
      },
    },
    futures::StreamExt,
  };

  fn prevote_from(
    key: &Keypair,
    target: BlockInfo,
    round_number: u64,
  ) -> VoteMessage {
    VoteMessage {
      round_number,
      set_id: 0,
      vote: Vote::Prevote(Signed::new(
        key,
        Prevote::new(target),
        round_number,
        0,
      )),
    }
  }

  fn precommit_from(
    key: &Keypair,
    target: BlockInfo,
    round_number: u64,
  ) -> VoteMessage {
    VoteMessage {
      round_number,
      set_id: 0,
      vote: Vote::Precommit(Signed::new(
        key,
        Precommit::new(target),
        round_number,
        0,
      )),
    }
  }

  fn fin_for(
    keys: &[Keypair],
    target: BlockInfo,
    round_number: u64,
    chain: &TestChain,
  ) -> Fin {
    let precommits = keys
      .iter()
      .map(|key| Signed::new(key, Precommit::new(target), round_number, 0))
      .collect();
    Fin {
      round_number,
      target,
      justification: Justification::new(
        round_number,
        target,
        precommits,
        chain,
      )
      .unwrap(),
    }
  }

  async fn drive_until<B, G, C, T>(
    voter: &mut Voter<B, G, C>,
    pick: impl Fn(&VoterEvent) -> Option<T>,
  ) -> T
  where
    B: BlockTree + Unpin,
    G: Gossip + Unpin,
    C: Clock + Unpin,
  {
    loop {
      let event =
        tokio::time::timeout(Duration::from_secs(10), voter.next())
          .await
          .expect("voter made no progress")
          .expect("voter stream ended");
      if let Some(out) = pick(&event) {
        return out;
      }
    }
  }

  #[tokio::test]
  async fn solo_voter_finalizes_and_rolls_rounds() {
    init_tracing();
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A", "B", "C", "D", "E"]);
    let keys = keypairs(1);
    let voters = voter_set(&keys, 1);
    let chain = SharedChain::new(chain);
    let gossip = SharedGossip::default();

    let (mut voter, _handle) = Voter::new(
      chain.clone(),
      gossip.clone(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_millis(10),
    );

    let target = chain.0.borrow().info("E");
    let finalized = drive_until(&mut voter, |event| match event {
      VoterEvent::Finalized { block, .. } => Some(*block),
      _ => None,
    })
    .await;

    assert_eq!(finalized, target);
    assert!(!gossip.0.borrow().fins.is_empty());
    assert!(chain
      .0
      .borrow()
      .finalized_log()
      .iter()
      .any(|(block, _)| *block == target));
  }

  #[tokio::test]
  async fn round_finalizes_with_external_votes() {
    init_tracing();
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A", "B", "C", "D", "E"]);
    let keys = keypairs(4);
    let voters = voter_set(&keys, 1);
    let chain = SharedChain::new(chain);
    let gossip = SharedGossip::default();

    let (mut voter, handle) = Voter::new(
      chain.clone(),
      gossip.clone(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_millis(20),
    );

    // two peers echo whatever our node casts, which together
    // with our own vote reaches the threshold of three
    let mut finalized = None;
    let deadline = Instant::now() + Duration::from_secs(10);
    while finalized.is_none() && Instant::now() < deadline {
      match tokio::time::timeout(Duration::from_millis(10), voter.next())
        .await
      {
        Ok(Some(VoterEvent::Finalized { block, .. })) => {
          finalized = Some(block)
        }
        Ok(Some(_)) => {}
        Ok(None) => break,
        Err(_) => {}
      }

      let outbox = gossip.0.borrow().votes.clone();
      for message in outbox {
        match &message.vote {
          Vote::Prevote(signed) => {
            for key in &keys[1..3] {
              handle.on_vote_message(prevote_from(
                key,
                signed.vote.target(),
                message.round_number,
              ));
            }
          }
          Vote::Precommit(signed) => {
            for key in &keys[1..3] {
              handle.on_vote_message(precommit_from(
                key,
                signed.vote.target(),
                message.round_number,
              ));
            }
          }
          Vote::PrimaryPropose(_) => {}
        }
      }
    }

    assert_eq!(finalized.expect("round finalized").number, 5);
  }

  #[tokio::test]
  async fn fin_fast_forwards_a_lagging_round() {
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A", "B", "C", "D", "E"]);
    let target = chain.info("E");
    let fin = fin_for(&keypairs(4)[1..], target, 1, &chain);

    let keys = keypairs(4);
    let voters = voter_set(&keys, 1);
    let chain = SharedChain::new(chain);

    // timers far in the future: only the fin can move the round
    let (mut voter, handle) = Voter::new(
      chain.clone(),
      SharedGossip::default(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_secs(3600),
    );

    handle.on_fin(fin);

    let finalized = drive_until(&mut voter, |event| match event {
      VoterEvent::Finalized { round, block } => Some((*round, *block)),
      _ => None,
    })
    .await;
    assert_eq!(finalized, (1, target));

    let next_round = drive_until(&mut voter, |event| match event {
      VoterEvent::RoundStarted { round, .. } if *round > 1 => Some(*round),
      _ => None,
    })
    .await;
    assert_eq!(next_round, 2);
    assert_eq!(voter.round_number(), 2);
  }

  #[tokio::test]
  async fn equivocation_reaches_the_observer() {
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A"]);
    chain.push_blocks("genesis", &["B"]);
    let fork_a = chain.info("A");
    let fork_b = chain.info("B");

    let keys = keypairs(4);
    let voters = voter_set(&keys, 1);
    let (mut voter, handle) = Voter::new(
      SharedChain::new(chain),
      SharedGossip::default(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_secs(3600),
    );

    handle.on_vote_message(prevote_from(&keys[1], fork_a, 1));
    handle.on_vote_message(prevote_from(&keys[1], fork_b, 1));

    let (kind, id) = drive_until(&mut voter, |event| match event {
      VoterEvent::Equivocated { kind, id, .. } => {
        Some((*kind, id.clone()))
      }
      _ => None,
    })
    .await;
    assert_eq!(kind, VoteKind::Prevote);
    assert_eq!(id, keys[1].public());
  }

  #[tokio::test]
  async fn buffered_future_round_votes_replay_on_round_start() {
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A", "B", "C", "D", "E"]);
    let near = chain.info("C");
    let tip = chain.info("E");
    let keys = keypairs(4);
    let fin = fin_for(&keys[1..], near, 1, &chain);

    let voters = voter_set(&keys, 1);
    let chain = SharedChain::new(chain);
    let (mut voter, handle) = Voter::new(
      chain.clone(),
      SharedGossip::default(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_secs(3600),
    );

    // round 2 gossip arrives while round 1 is still running
    for key in &keys[1..] {
      handle.on_vote_message(prevote_from(key, tip, 2));
      handle.on_vote_message(precommit_from(key, tip, 2));
    }
    // the fin completes round 1 and starts round 2, which must
    // pick the buffered votes up and finalize without timers
    handle.on_fin(fin);

    let finalized = drive_until(&mut voter, |event| match event {
      VoterEvent::Finalized { round: 2, block } => Some(*block),
      _ => None,
    })
    .await;
    assert_eq!(finalized, tip);

    let log: Vec<_> = chain
      .0
      .borrow()
      .finalized_log()
      .iter()
      .map(|(block, _)| *block)
      .collect();
    assert_eq!(log, vec![near, tip]);
  }

  #[tokio::test]
  async fn voter_set_change_restarts_rounds_under_new_set() {
    let mut chain = TestChain::new();
    let next_keys = keypairs(7);
    let change = ScheduledChange {
      voters: next_keys[4..].iter().map(|k| (k.public(), 1)).collect(),
      delay: 0,
    };
    chain.push_block_with_change("genesis", "A", change);
    let target = chain.info("A");

    let keys = keypairs(4);
    let fin = fin_for(&keys[1..], target, 1, &chain);
    let voters = voter_set(&keys, 1);
    let (mut voter, handle) = Voter::new(
      SharedChain::new(chain),
      SharedGossip::default(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_secs(3600),
    );

    handle.on_fin(fin);

    let set_id = drive_until(&mut voter, |event| match event {
      VoterEvent::SetChanged { set_id } => Some(*set_id),
      _ => None,
    })
    .await;
    assert_eq!(set_id, 1);
    assert_eq!(voter.set_id(), 1);
    assert_eq!(voter.round_number(), 1);
    assert_eq!(voter.voters().len(), 3);
  }

  #[tokio::test]
  async fn rejected_finalization_is_escalated() {
    let mut chain = TestChain::new();
    chain.push_blocks("genesis", &["A1", "A2"]);
    chain.push_blocks("genesis", &["B1", "B2", "B3"]);
    // the tree already finalized a block on the A fork
    chain.set_finalized("A2");
    let conflicting = chain.info("B3");

    let keys = keypairs(4);
    let fin = fin_for(&keys[1..], conflicting, 1, &chain);
    let voters = voter_set(&keys, 1);
    let (mut voter, handle) = Voter::new(
      SharedChain::new(chain),
      SharedGossip::default(),
      SystemClock,
      keys[0].clone(),
      voters,
      0,
      Duration::from_secs(3600),
    );

    handle.on_fin(fin);

    let rejected = drive_until(&mut voter, |event| match event {
      VoterEvent::FinalizeRejected { block, .. } => Some(*block),
      _ => None,
    })
    .await;
    assert_eq!(rejected, conflicting);
  }
}
