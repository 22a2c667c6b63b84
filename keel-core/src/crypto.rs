//! Cryptographic primitives for Keel.
//!
//! - BLAKE3 for content hashing (ledger digests, block commitments)
//! - Ed25519 for validator service identities and message envelopes
//!
//! Bitcoin keys and ECDSA signatures live in `keel-anchor`, on top of the
//! `bitcoin` crate; this module only covers the host-chain side.

use std::cmp::Ordering;
use std::fmt;

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decode a hex string into exactly `N` bytes.
fn decode_fixed<const N: usize>(s: &str) -> std::result::Result<[u8; N], String> {
    let bytes = hex::decode(s).map_err(|e| e.to_string())?;
    <[u8; N]>::try_from(bytes.as_slice())
        .map_err(|_| format!("want {} bytes, decoded {}", N, bytes.len()))
}

/// BLAKE3 digest of host-chain data: block hashes, ledger state digests.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// All-zero digest. Stands in for "no block" in commitments built
    /// before the host chain has produced anything.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Wrap a digest computed elsewhere.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Digest bytes, as committed in `OP_RETURN` payloads.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 64-character hex digest.
    pub fn from_hex(s: &str) -> Result<Self> {
        decode_fixed(s).map(Self).map_err(Error::invalid_hash)
    }

    /// Lowercase hex, as shown by the REST API.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hash").field(&hex::encode(&self.0[..8])).finish()
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// BLAKE3 digest of a single buffer.
pub fn hash(data: &[u8]) -> Hash {
    Hash(blake3::hash(data).into())
}

/// BLAKE3 digest of several buffers fed one after another.
///
/// Equivalent to [`hash`] over their concatenation.
pub fn hash_all<T: AsRef<[u8]>>(parts: &[T]) -> Hash {
    let digest = parts
        .iter()
        .fold(blake3::Hasher::new(), |mut hasher, part| {
            hasher.update(part.as_ref());
            hasher
        })
        .finalize();
    Hash(digest.into())
}

/// A validator service key, used to authenticate anchoring messages.
///
/// Serialized as hex for JSON and as raw bytes for bincode.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&self.to_hex())
        } else {
            self.as_bytes().serialize(s)
        }
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let parsed = if d.is_human_readable() {
            PublicKey::from_hex(&String::deserialize(d)?)
        } else {
            PublicKey::from_bytes(&<[u8; 32]>::deserialize(d)?)
        };
        parsed.map_err(serde::de::Error::custom)
    }
}

impl PublicKey {
    /// Parse a compressed Edwards point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| Error::invalid_key(e.to_string()))
    }

    /// Compressed point bytes.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Parse a hex-encoded key, as found in configs and API requests.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = decode_fixed::<32>(s).map_err(Error::invalid_key)?;
        Self::from_bytes(&bytes)
    }

    /// Lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// Check `signature` over `message`.
    pub fn verify(&self, message: &[u8], signature: &Sig) -> Result<()> {
        match self.0.verify(message, &signature.0) {
            Ok(()) => Ok(()),
            Err(_) => Err(Error::invalid_signature()),
        }
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey")
            .field(&hex::encode(&self.0.as_bytes()[..8]))
            .finish()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write(self.0.as_bytes());
    }
}

// Key sets are ordered by raw bytes, so every validator lays out a config
// the same way.
impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A validator's service signing key. Never serialized.
#[derive(Clone)]
pub struct SecretKey(ed25519_dalek::SigningKey);

impl SecretKey {
    /// Fresh key from the OS RNG.
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        Self(ed25519_dalek::SigningKey::generate(&mut rng))
    }

    /// Load a key from its 32-byte seed.
    pub fn from_bytes(seed: &[u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(seed))
    }

    /// The 32-byte seed.
    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// The matching service key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Ed25519 signature over `message`.
    pub fn sign(&self, message: &[u8]) -> Sig {
        Sig(self.0.sign(message))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// Ed25519 signature carried by message envelopes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SigHalves", into = "SigHalves")]
pub struct Sig(ed25519_dalek::Signature);

// serde derives arrays only up to 32 elements.
#[derive(Serialize, Deserialize)]
struct SigHalves([u8; 32], [u8; 32]);

impl From<Sig> for SigHalves {
    fn from(sig: Sig) -> Self {
        let bytes = sig.to_bytes();
        let mut halves = SigHalves([0u8; 32], [0u8; 32]);
        halves.0.copy_from_slice(&bytes[..32]);
        halves.1.copy_from_slice(&bytes[32..]);
        halves
    }
}

impl From<SigHalves> for Sig {
    fn from(SigHalves(r, s): SigHalves) -> Self {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&r);
        bytes[32..].copy_from_slice(&s);
        Sig::from_bytes(&bytes)
    }
}

impl Sig {
    /// Wrap raw `R || s` bytes. Validity is checked at verification.
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }

    /// Raw `R || s` bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }
}

impl fmt::Debug for Sig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sig")
            .field(&hex::encode(&self.to_bytes()[..8]))
            .finish()
    }
}
