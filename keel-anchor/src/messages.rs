//! Wire messages exchanged between validators.
//!
//! Messages are bincode-encoded serde types. Every message travels inside an
//! [`Envelope`] signed with the author's service key, which is how the
//! receiving node learns which validator sent it.

use bitcoin::{Transaction, Txid};
use keel_core::{PublicKey, SecretKey, Sig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::{AnchorError, Result};
use crate::signature::InputSignature;

/// Domain separator for envelope signatures.
const ENVELOPE_DOMAIN: &[u8] = b"keel-anchoring-envelope-v1";

/// Encode a wire value.
pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decode a wire value.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

/// A validator's signature over one input of the active proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignInput {
    /// Proposal transaction id.
    pub txid: Txid,
    /// Input index.
    pub input: u32,
    /// Signature over the input's sighash.
    pub input_signature: InputSignature,
}

/// A funding transaction paying the anchoring address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddFunds {
    /// Raw Bitcoin transaction.
    #[serde(with = "raw_tx")]
    pub transaction: Transaction,
}

impl AddFunds {
    /// Wrap a funding transaction.
    pub fn new(transaction: Transaction) -> Self {
        Self { transaction }
    }

    /// Parse from consensus-encoded hex.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| AnchorError::InvalidMessage(e.to_string()))?;
        Ok(Self::new(bitcoin::consensus::deserialize(&bytes)?))
    }
}

/// Messages validators broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchoringMessage {
    /// Signature for a proposal input.
    SignInput(SignInput),
    /// New funding.
    AddFunds(AddFunds),
}

impl AnchoringMessage {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignInput(_) => "sign_input",
            Self::AddFunds(_) => "add_funds",
        }
    }
}

/// A message signed by its author's service key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Author's service key.
    pub author: PublicKey,
    /// Payload.
    pub message: AnchoringMessage,
    /// Signature over the domain separator and the encoded payload.
    pub signature: Sig,
}

impl Envelope {
    /// Sign `message` with `key`.
    pub fn sign(message: AnchoringMessage, key: &SecretKey) -> Result<Self> {
        let digest = Self::signing_bytes(&message)?;
        Ok(Self {
            author: key.public_key(),
            signature: key.sign(&digest),
            message,
        })
    }

    /// Check the signature and return the authenticated author.
    pub fn verify(&self) -> Result<&PublicKey> {
        let digest = Self::signing_bytes(&self.message)?;
        self.author
            .verify(&digest, &self.signature)
            .map_err(|_| AnchorError::InvalidMessage(format!("bad signature from {}", self.author)))?;
        Ok(&self.author)
    }

    /// Encode for transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        to_bytes(self)
    }

    /// Decode and authenticate.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Self = from_bytes(bytes)?;
        envelope.verify()?;
        Ok(envelope)
    }

    fn signing_bytes(message: &AnchoringMessage) -> Result<Vec<u8>> {
        let mut bytes = ENVELOPE_DOMAIN.to_vec();
        bytes.extend(to_bytes(message)?);
        Ok(bytes)
    }
}

/// Consensus-encoded transaction; hex in human-readable formats.
pub(crate) mod raw_tx {
    use bitcoin::consensus::encode;
    use bitcoin::Transaction;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(tx: &Transaction, s: S) -> Result<S::Ok, S::Error> {
        let bytes = encode::serialize(tx);
        if s.is_human_readable() {
            hex::encode(bytes).serialize(s)
        } else {
            bytes.serialize(s)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Transaction, D::Error> {
        let bytes = if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s).map_err(serde::de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(d)?
        };
        encode::deserialize(&bytes).map_err(serde::de::Error::custom)
    }
}
