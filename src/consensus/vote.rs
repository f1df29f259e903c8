use {
  super::error::VotingError,
  crate::primitives::{Keypair, Pubkey, ToBase58String},
  ed25519_dalek::{PublicKey, Verifier},
  parity_scale_codec::{Decode, Encode},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display},
    str::FromStr,
  },
};

/// Hash of a block as it appears on the wire: a fixed-width
/// 32 byte digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct BlockHash(pub [u8; 32]);

impl Display for BlockHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_b58())
  }
}

impl Debug for BlockHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "BlockHash({})", self.0.to_b58())
  }
}

impl FromStr for BlockHash {
  type Err = bs58::decode::Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes)?;
    Ok(Self(bytes))
  }
}

impl Serialize for BlockHash {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&self.0.to_b58())
  }
}

impl<'de> Deserialize<'de> for BlockHash {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse()
      .map_err(|e| serde::de::Error::custom(format!("{e:?}")))
  }
}

/// A block identified by its hash and its height in the chain.
///
/// Heights are monotonically increasing along any ancestry path,
/// which lets ancestry queries be answered with plain offsets.
#[derive(
  Clone, Copy, PartialEq, Eq, Hash, Encode, Decode, Serialize, Deserialize,
)]
pub struct BlockInfo {
  pub hash: BlockHash,
  pub number: u64,
}

impl BlockInfo {
  pub fn new(hash: BlockHash, number: u64) -> Self {
    Self { hash, number }
  }
}

impl Debug for BlockInfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "({}, {})", self.hash, self.number)
  }
}

/// ED25519 signature bytes over a vote payload.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct Signature(pub [u8; 64]);

impl Debug for Signature {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Signature({})", self.0.to_b58())
  }
}

impl From<ed25519_dalek::Signature> for Signature {
  fn from(s: ed25519_dalek::Signature) -> Self {
    Self(s.to_bytes())
  }
}

impl Serialize for Signature {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&self.0.to_b58())
  }
}

impl<'de> Deserialize<'de> for Signature {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    let mut bytes = [0u8; 64];
    bs58::decode(s)
      .into(&mut bytes)
      .map_err(|e| serde::de::Error::custom(format!("{e:?}")))?;
    Ok(Self(bytes))
  }
}

/// The two weighted stages of voting within a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteKind {
  Prevote,
  Precommit,
}

/// Common shape of the messages cast during a voting round.
///
/// The tag is mixed into the signed payload so that a signature
/// over a prevote can never be replayed as a precommit.
pub trait Stage: Clone + Debug + Encode {
  const TAG: u8;

  fn new(target: BlockInfo) -> Self;
  fn target(&self) -> BlockInfo;
}

macro_rules! stage_message {
  ($(#[$doc:meta])* $name:ident, $tag:expr) => {
    $(#[$doc])*
    #[derive(Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
    pub struct $name {
      pub target_hash: BlockHash,
      pub target_number: u64,
    }

    impl Stage for $name {
      const TAG: u8 = $tag;

      fn new(target: BlockInfo) -> Self {
        Self {
          target_hash: target.hash,
          target_number: target.number,
        }
      }

      fn target(&self) -> BlockInfo {
        BlockInfo::new(self.target_hash, self.target_number)
      }
    }

    impl Debug for $name {
      fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
          f,
          concat!(stringify!($name), "({}, {})"),
          self.target_hash, self.target_number
        )
      }
    }
  };
}

stage_message! {
  /// A first-stage vote on the head of the chain a voter
  /// considers best.
  Prevote, 0
}

stage_message! {
  /// A second-stage vote committing to a prefix of the chain.
  Precommit, 1
}

stage_message! {
  /// An advisory block hint broadcast by the round's primary.
  PrimaryPropose, 2
}

fn signing_payload<T: Stage>(
  vote: &T,
  round_number: u64,
  set_id: u64,
) -> Vec<u8> {
  (T::TAG, vote, round_number, set_id).encode()
}

/// A vote attributed to a voter and signed with its key.
///
/// The signed payload covers the stage tag, the vote target, the
/// round number and the voter set id, so a signature is only
/// valid for the exact round and voter set epoch it was cast in.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
#[serde(bound = "T: Serialize, for<'a> T: Deserialize<'a>")]
pub struct Signed<T> {
  pub vote: T,
  pub id: Pubkey,
  pub signature: Signature,
}

pub type SignedPrevote = Signed<Prevote>;
pub type SignedPrecommit = Signed<Precommit>;

impl<T: Stage> Signed<T> {
  /// Signs a vote for this round and voter set epoch using the
  /// local keypair.
  pub fn new(
    keypair: &Keypair,
    vote: T,
    round_number: u64,
    set_id: u64,
  ) -> Self {
    let payload = signing_payload(&vote, round_number, set_id);
    let signature = keypair.sign(&payload).into();
    Self {
      vote,
      id: keypair.public(),
      signature,
    }
  }

  /// Verifies the signature against the claimed voter identity.
  pub fn verify(
    &self,
    round_number: u64,
    set_id: u64,
  ) -> Result<(), VotingError> {
    let invalid = || VotingError::SignatureInvalid(self.id.clone());
    let payload = signing_payload(&self.vote, round_number, set_id);
    let pubkey =
      PublicKey::from_bytes(self.id.as_bytes()).map_err(|_| invalid())?;
    let signature = ed25519_dalek::Signature::from_bytes(&self.signature.0)
      .map_err(|_| invalid())?;
    pubkey.verify(&payload, &signature).map_err(|_| invalid())
  }
}

/// Any of the three signed votes that can appear in a vote
/// message. The encoding tag of each variant matches the stage
/// tag of the signed payload.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub enum Vote {
  Prevote(Signed<Prevote>),
  Precommit(Signed<Precommit>),
  PrimaryPropose(Signed<PrimaryPropose>),
}

impl Vote {
  pub fn id(&self) -> &Pubkey {
    match self {
      Vote::Prevote(v) => &v.id,
      Vote::Precommit(v) => &v.id,
      Vote::PrimaryPropose(v) => &v.id,
    }
  }

  pub fn target(&self) -> BlockInfo {
    match self {
      Vote::Prevote(v) => v.vote.target(),
      Vote::Precommit(v) => v.vote.target(),
      Vote::PrimaryPropose(v) => v.vote.target(),
    }
  }
}

/// The gossiped envelope around a single vote.
#[derive(Clone, PartialEq, Eq, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct VoteMessage {
  pub round_number: u64,
  pub set_id: u64,
  pub vote: Vote,
}

impl VoteMessage {
  pub fn to_bytes(&self) -> Vec<u8> {
    self.encode()
  }

  pub fn from_bytes(bytes: &[u8]) -> Result<Self, VotingError> {
    Ok(Self::decode(&mut &bytes[..])?)
  }
}
