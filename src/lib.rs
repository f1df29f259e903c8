//! GRANDPA finality gadget core for Polkadot-family chains.
//!
//! Block production, storage, networking and configuration live
//! in the embedding node; this crate drives the per-round voting
//! state machine against injected block tree, gossip, keypair
//! and clock collaborators, and decides what becomes final.

pub mod consensus;
pub mod primitives;

#[cfg(test)]
pub mod test;
