//! Validator anchoring keys and the multisig custody address.
//!
//! Every epoch's key set fixes one redeem script:
//!
//! ```text
//! OP_m <btc_key_1> <btc_key_2> ... <btc_key_n> OP_n OP_CHECKMULTISIG
//!
//! m = floor(n / 2) + 1
//! ```
//!
//! wrapped as P2WSH. Keys keep the order of the config, so reordering the
//! validators yields a different address.

use std::collections::{BTreeMap, HashSet};

use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::script::Builder;
use bitcoin::{Address, Network, Script, ScriptBuf};
use keel_core::PublicKey;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{AnchorError, Result};

/// Bare CHECKMULTISIG accepts at most this many keys.
pub const MAX_KEYS: usize = 20;

/// Sequential epoch number, starting at zero for the first configuration.
pub type EpochId = u64;

/// Number of signatures required out of `n` keys: a strict majority.
pub fn majority_count(n: usize) -> usize {
    n / 2 + 1
}

/// One validator's pair of keys for an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchoringKeys {
    /// Host-chain identity used to authenticate messages.
    pub service_key: PublicKey,
    /// Bitcoin key that co-signs the anchoring address.
    pub bitcoin_key: bitcoin::PublicKey,
}

impl AnchoringKeys {
    /// Pair a service key with a bitcoin key.
    pub fn new(service_key: PublicKey, bitcoin_key: bitcoin::PublicKey) -> Self {
        Self {
            service_key,
            bitcoin_key,
        }
    }
}

/// P2WSH multisig witness script for an ordered list of bitcoin keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemScript {
    script: ScriptBuf,
    keys: Vec<bitcoin::PublicKey>,
    quorum: usize,
}

impl RedeemScript {
    /// Build the `quorum`-of-`n` script over `keys`, in order.
    pub fn from_keys(keys: &[bitcoin::PublicKey]) -> Result<Self> {
        if keys.is_empty() {
            return Err(AnchorError::EmptyKeySet);
        }
        if keys.len() > MAX_KEYS {
            return Err(AnchorError::TooManyKeys(keys.len()));
        }
        let quorum = majority_count(keys.len());

        let mut builder = Builder::new().push_int(quorum as i64);
        for key in keys {
            builder = builder.push_key(key);
        }
        let script = builder
            .push_int(keys.len() as i64)
            .push_opcode(OP_CHECKMULTISIG)
            .into_script();

        Ok(Self {
            script,
            keys: keys.to_vec(),
            quorum,
        })
    }

    /// The witness script.
    pub fn script(&self) -> &Script {
        &self.script
    }

    /// Keys in script order.
    pub fn keys(&self) -> &[bitcoin::PublicKey] {
        &self.keys
    }

    /// Signatures needed to spend.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Position of `key` in the script, which is also the order signatures
    /// must appear in the witness.
    pub fn position(&self, key: &bitcoin::PublicKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    /// P2WSH address on `network`.
    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.script, network)
    }

    /// Output script paying to this redeem script.
    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address(Network::Bitcoin).script_pubkey()
    }
}

/// A validated key set together with its redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySet {
    keys: Vec<AnchoringKeys>,
    redeem_script: RedeemScript,
}

impl KeySet {
    /// Validate `keys` and derive their redeem script.
    pub fn new(keys: Vec<AnchoringKeys>) -> Result<Self> {
        KeyRegistry::validate_key_set(&keys)?;
        let bitcoin_keys: Vec<_> = keys.iter().map(|k| k.bitcoin_key).collect();
        let redeem_script = RedeemScript::from_keys(&bitcoin_keys)?;
        Ok(Self {
            keys,
            redeem_script,
        })
    }

    /// The key pairs, in config order.
    pub fn keys(&self) -> &[AnchoringKeys] {
        &self.keys
    }

    /// The derived redeem script.
    pub fn redeem_script(&self) -> &RedeemScript {
        &self.redeem_script
    }

    /// Number of validators.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false for a validated set.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Signatures needed per input.
    pub fn quorum(&self) -> usize {
        self.redeem_script.quorum()
    }

    /// Look up a validator by service key.
    pub fn find_service(&self, service_key: &PublicKey) -> Option<&AnchoringKeys> {
        self.keys.iter().find(|k| &k.service_key == service_key)
    }

    /// Look up a validator by bitcoin key.
    pub fn find_bitcoin(&self, bitcoin_key: &bitcoin::PublicKey) -> Option<&AnchoringKeys> {
        self.keys.iter().find(|k| &k.bitcoin_key == bitcoin_key)
    }

    /// Script position of the validator holding exactly this key pair.
    pub fn position_of(&self, signer: &AnchoringKeys) -> Option<usize> {
        self.keys.iter().position(|k| k == signer)
    }

    /// Whether `service_key` belongs to this set.
    pub fn contains_service(&self, service_key: &PublicKey) -> bool {
        self.find_service(service_key).is_some()
    }
}

/// Key sets of every epoch, indexed by epoch id.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    sets: BTreeMap<EpochId, KeySet>,
}

impl KeyRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject empty sets, repeated keys, oversize sets and uncompressed keys.
    pub fn validate_key_set(keys: &[AnchoringKeys]) -> Result<()> {
        if keys.is_empty() {
            return Err(AnchorError::EmptyKeySet);
        }
        if keys.len() > MAX_KEYS {
            return Err(AnchorError::TooManyKeys(keys.len()));
        }

        let mut service = HashSet::with_capacity(keys.len());
        let mut bitcoin = HashSet::with_capacity(keys.len());
        for entry in keys {
            if !service.insert(entry.service_key) {
                return Err(AnchorError::DuplicateKey {
                    kind: "service",
                    key: entry.service_key.to_hex(),
                });
            }
            if !bitcoin.insert(entry.bitcoin_key) {
                return Err(AnchorError::DuplicateKey {
                    kind: "bitcoin",
                    key: entry.bitcoin_key.to_string(),
                });
            }
            if !entry.bitcoin_key.compressed {
                return Err(AnchorError::UncompressedKey(entry.bitcoin_key.to_string()));
            }
        }
        Ok(())
    }

    /// Derive the anchoring address of `config`.
    pub fn derive_address(config: &Config) -> Result<Address> {
        Self::validate_key_set(&config.anchoring_keys)?;
        let bitcoin_keys: Vec<_> = config.anchoring_keys.iter().map(|k| k.bitcoin_key).collect();
        let script = RedeemScript::from_keys(&bitcoin_keys)?;
        Ok(script.address(config.network.to_network()))
    }

    /// Record the key set of `epoch`.
    pub fn register(&mut self, epoch: EpochId, keys: Vec<AnchoringKeys>) -> Result<&KeySet> {
        let set = KeySet::new(keys)?;
        Ok(self.sets.entry(epoch).or_insert(set))
    }

    /// Key set of `epoch`.
    pub fn key_set(&self, epoch: EpochId) -> Option<&KeySet> {
        self.sets.get(&epoch)
    }

    /// Number of registered epochs.
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    /// Whether any epoch was registered.
    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
