use super::{justification::Fin, vote::VoteMessage};

/// Outbound side of the vote gossip network.
///
/// The finality core publishes through this seam and never holds
/// a reference back into the transport; inbound traffic reaches
/// the core through the orchestrator's message queue instead.
/// Implementations own their send queues and apply their own
/// back-pressure.
pub trait Gossip {
  /// Publishes a signed vote for the current round.
  fn vote(&mut self, message: VoteMessage);

  /// Publishes a commit message carrying a justification.
  fn fin(&mut self, fin: Fin);
}
