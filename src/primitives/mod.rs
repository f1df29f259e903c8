mod b58;
mod keys;

pub use b58::ToBase58String;
pub use keys::{Keypair, Pubkey};
