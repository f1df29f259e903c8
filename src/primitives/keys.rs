use {
  super::b58::ToBase58String,
  ed25519_dalek::{PublicKey, SecretKey, Signer},
  parity_scale_codec::{Decode, Encode},
  serde::{Deserialize, Serialize},
  std::{
    fmt::{Debug, Display},
    str::FromStr,
  },
  thiserror::Error,
};

/// Identity of a voter in the finality protocol: the raw bytes
/// of an Ed25519 public key.
///
/// Inside vote messages a voter id travels as fixed 32 bytes of
/// the SCALE encoding; on diagnostic and configuration surfaces
/// it is rendered as a base58 string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
  pub fn as_bytes(&self) -> &[u8; 32] {
    &self.0
  }
}

impl Display for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0.to_b58())
  }
}

impl Debug for Pubkey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "Pubkey({})", self.0.to_b58())
  }
}

impl FromStr for Pubkey {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut bytes = [0u8; 32];
    bs58::decode(s).into(&mut bytes).map_err(KeyError::Base58)?;
    Ok(Self(bytes))
  }
}

impl From<PublicKey> for Pubkey {
  fn from(p: PublicKey) -> Self {
    Self(*p.as_bytes())
  }
}

impl Serialize for Pubkey {
  fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
  where
    S: serde::Serializer,
  {
    serializer.serialize_str(&self.0.to_b58())
  }
}

/// Voter ids only ever arrive as base58 strings on the
/// human-readable surface; raw bytes travel through SCALE.
impl<'de> Deserialize<'de> for Pubkey {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: serde::Deserializer<'de>,
  {
    let s = String::deserialize(deserializer)?;
    s.parse()
      .map_err(|e| serde::de::Error::custom(format!("{e:?}")))
  }
}

/// The local node's voting identity: the Ed25519 keypair whose
/// public half appears in the voter set and whose secret half
/// signs this node's prevotes, precommits and primary hints.
pub struct Keypair(ed25519_dalek::Keypair);

impl Keypair {
  pub fn public(&self) -> Pubkey {
    self.0.public.into()
  }

  /// Signs a vote payload with the voter's secret key.
  pub fn sign(&self, payload: &[u8]) -> ed25519_dalek::Signature {
    self.0.sign(payload)
  }
}

impl Clone for Keypair {
  fn clone(&self) -> Self {
    let secret = SecretKey::from_bytes(self.0.secret.as_bytes())
      .expect("secret bytes came from a valid key; qed");
    let public = (&secret).into();
    Self(ed25519_dalek::Keypair { secret, public })
  }
}

impl Debug for Keypair {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    // never expose secret material, identify by the public half
    write!(f, "Keypair({})", self.public())
  }
}

impl TryFrom<&[u8]> for Keypair {
  type Error = KeyError;

  fn try_from(secret_bytes: &[u8]) -> Result<Self, Self::Error> {
    let secret = SecretKey::from_bytes(secret_bytes)?;
    let public = (&secret).into();
    Ok(Self(ed25519_dalek::Keypair { secret, public }))
  }
}

impl FromStr for Keypair {
  type Err = KeyError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let mut secret_bytes = [0u8; 32];
    bs58::decode(s)
      .into(&mut secret_bytes)
      .map_err(KeyError::Base58)?;
    Self::try_from(secret_bytes.as_slice())
  }
}

#[derive(Debug, Error)]
pub enum KeyError {
  #[error("malformed base58 key encoding: {0:?}")]
  Base58(bs58::decode::Error),

  #[error("invalid ed25519 key material: {0}")]
  Material(#[from] ed25519_dalek::ed25519::Error),
}
