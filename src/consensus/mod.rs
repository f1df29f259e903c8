//! Stewart, A., Kokoris-Kogias, E. "GRANDPA: a Byzantine Finality
//! Gadget." Implementation of the GHOST-based Recursive ANcestor
//! Deriving Prefix Agreement finality protocol: rounds of
//! prevotes and precommits over a weighted voter set agree on an
//! ever-growing finalized prefix of the block tree.

mod chain;
mod error;
mod gossip;
mod graph;
mod justification;
mod round;
mod tracker;
mod vote;
mod voter;
mod voters;
mod weight;

pub use {
  chain::{BlockHeader, BlockTree, ScheduledChange},
  error::{JustificationError, VotingError},
  gossip::Gossip,
  graph::VoteGraph,
  justification::{Commit, Fin, Justification},
  round::{RoundAction, RoundParams, RoundState, Step, VotingRound},
  tracker::{PushResult, VoteTracker},
  vote::{
    BlockHash,
    BlockInfo,
    Precommit,
    Prevote,
    PrimaryPropose,
    Signature,
    Signed,
    SignedPrecommit,
    SignedPrevote,
    Stage,
    Vote,
    VoteKind,
    VoteMessage,
  },
  voter::{Clock, SystemClock, Voter, VoterEvent, VoterHandle},
  voters::{threshold, VoterSet},
  weight::VoteWeight,
};
