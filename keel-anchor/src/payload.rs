//! The commitment embedded in every anchoring transaction.
//!
//! Output 1 of an anchoring transaction is an `OP_RETURN` carrying:
//!
//! ```text
//! ┌────────┬─────────┬──────┬──────────────┬──────────────────┐
//! │ "KEEL" │ version │ kind │ height (LE)  │ block hash       │
//! │ 4 B    │ 1 B     │ 1 B  │ 8 B          │ 32 B             │
//! └────────┴─────────┴──────┴──────────────┴──────────────────┘
//! ```

use bitcoin::blockdata::opcodes::all::OP_RETURN;
use bitcoin::blockdata::script::{Builder, Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf, Transaction};
use keel_core::Hash;
use serde::{Deserialize, Serialize};

use crate::errors::{AnchorError, Result};

/// Payload prefix.
pub const PAYLOAD_MAGIC: &[u8; 4] = b"KEEL";

/// Current payload version.
pub const PAYLOAD_VERSION: u8 = 1;

/// Payload kind of a regular anchor.
pub const KIND_REGULAR: u8 = 0;

/// Encoded payload length.
pub const PAYLOAD_LEN: usize = 4 + 1 + 1 + 8 + 32;

/// Output index of the payload in an anchoring transaction.
pub const PAYLOAD_OUTPUT: usize = 1;

/// A host block being anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment {
    /// Host block height.
    pub height: u64,
    /// Host block hash.
    pub block_hash: Hash,
}

impl Commitment {
    /// Commit to block `height` with hash `block_hash`.
    pub fn new(height: u64, block_hash: Hash) -> Self {
        Self { height, block_hash }
    }

    /// Raw payload bytes.
    pub fn to_bytes(&self) -> [u8; PAYLOAD_LEN] {
        let mut out = [0u8; PAYLOAD_LEN];
        out[..4].copy_from_slice(PAYLOAD_MAGIC);
        out[4] = PAYLOAD_VERSION;
        out[5] = KIND_REGULAR;
        out[6..14].copy_from_slice(&self.height.to_le_bytes());
        out[14..].copy_from_slice(self.block_hash.as_bytes());
        out
    }

    /// Parse raw payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAYLOAD_LEN {
            return Err(AnchorError::InvalidPayload(format!(
                "expected {PAYLOAD_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        if &bytes[..4] != PAYLOAD_MAGIC {
            return Err(AnchorError::InvalidPayload("bad magic".into()));
        }
        if bytes[4] != PAYLOAD_VERSION {
            return Err(AnchorError::InvalidPayload(format!(
                "unsupported version {}",
                bytes[4]
            )));
        }
        if bytes[5] != KIND_REGULAR {
            return Err(AnchorError::InvalidPayload(format!(
                "unsupported kind {}",
                bytes[5]
            )));
        }

        let mut height = [0u8; 8];
        height.copy_from_slice(&bytes[6..14]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[14..]);
        Ok(Self {
            height: u64::from_le_bytes(height),
            block_hash: Hash::from_bytes(hash),
        })
    }

    /// `OP_RETURN <payload>` output script.
    pub fn to_script(&self) -> Result<ScriptBuf> {
        let push = PushBytesBuf::try_from(self.to_bytes().to_vec())
            .map_err(|e| AnchorError::InvalidPayload(e.to_string()))?;
        Ok(Builder::new()
            .push_opcode(OP_RETURN)
            .push_slice(push)
            .into_script())
    }

    /// Parse an `OP_RETURN` output script.
    pub fn from_script(script: &Script) -> Result<Self> {
        let mut instructions = script.instructions();
        match instructions.next() {
            Some(Ok(Instruction::Op(op))) if op == OP_RETURN => {}
            _ => return Err(AnchorError::InvalidPayload("not an OP_RETURN script".into())),
        }
        let data = match instructions.next() {
            Some(Ok(Instruction::PushBytes(push))) => push.as_bytes(),
            _ => return Err(AnchorError::InvalidPayload("missing data push".into())),
        };
        if instructions.next().is_some() {
            return Err(AnchorError::InvalidPayload("trailing script data".into()));
        }
        Self::from_bytes(data)
    }

    /// Extract the commitment from an anchoring transaction.
    pub fn from_transaction(tx: &Transaction) -> Result<Self> {
        let output = tx
            .output
            .get(PAYLOAD_OUTPUT)
            .ok_or_else(|| AnchorError::InvalidPayload("no payload output".into()))?;
        Self::from_script(&output.script_pubkey)
    }
}
