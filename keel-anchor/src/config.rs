//! Anchoring configuration and the epoch log.
//!
//! A [`Config`] is activated by a configuration-change event on the host
//! chain and stays immutable until the next one supersedes it. Each
//! activation opens a new [`Epoch`]:
//!
//! ```text
//!   height:   0 ......... 120 ............. 480 ..........
//!   epoch:    [ 0: keys A ][ 1: keys A,B,C ][ 2: keys B,C,D ]
//! ```
//!
//! Older epochs remain queryable because outputs paid to their addresses
//! must still be signed by their key sets.

use std::fmt;

use bitcoin::{Address, Network};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{AnchorError, Result};
use crate::keys::{AnchoringKeys, EpochId, KeyRegistry, KeySet};

/// Default number of host blocks between anchors.
pub const DEFAULT_ANCHORING_INTERVAL: u64 = 5_000;

/// Default fee rate in satoshis per virtual byte.
pub const DEFAULT_TRANSACTION_FEE: u64 = 10;

/// Largest accepted fee rate; Bitcoin Core's default `maxfeerate`
/// (0.1 BTC/kvB) in satoshis per virtual byte.
pub const MAX_TRANSACTION_FEE: u64 = 10_000;

/// Bitcoin network, carried on the wire as its message-start magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum BitcoinNetwork {
    /// Mainnet.
    Bitcoin = 0xD9B4_BEF9,
    /// Testnet3.
    Testnet = 0x0709_110B,
    /// Local regression test network.
    Regtest = 0xDAB5_BFFA,
}

impl BitcoinNetwork {
    /// The 32-bit network magic.
    pub fn magic(self) -> u32 {
        self as u32
    }

    /// Parse a network magic.
    pub fn from_magic(magic: u32) -> Result<Self> {
        match magic {
            0xD9B4_BEF9 => Ok(Self::Bitcoin),
            0x0709_110B => Ok(Self::Testnet),
            0xDAB5_BFFA => Ok(Self::Regtest),
            other => Err(AnchorError::UnknownNetwork(other)),
        }
    }

    /// The corresponding `bitcoin` crate network.
    pub fn to_network(self) -> Network {
        match self {
            Self::Bitcoin => Network::Bitcoin,
            Self::Testnet => Network::Testnet,
            Self::Regtest => Network::Regtest,
        }
    }
}

impl From<BitcoinNetwork> for u32 {
    fn from(network: BitcoinNetwork) -> Self {
        network.magic()
    }
}

impl TryFrom<u32> for BitcoinNetwork {
    type Error = AnchorError;

    fn try_from(magic: u32) -> Result<Self> {
        Self::from_magic(magic)
    }
}

impl fmt::Display for BitcoinNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bitcoin => write!(f, "bitcoin"),
            Self::Testnet => write!(f, "testnet"),
            Self::Regtest => write!(f, "regtest"),
        }
    }
}

/// Anchoring configuration of one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network anchors are published on.
    pub network: BitcoinNetwork,
    /// Validator keys; order fixes the redeem script.
    pub anchoring_keys: Vec<AnchoringKeys>,
    /// Host blocks between anchors.
    pub anchoring_interval: u64,
    /// Fee rate in satoshis per virtual byte.
    pub transaction_fee: u64,
}

impl Config {
    /// Create a config with default interval and fee.
    pub fn new(network: BitcoinNetwork, anchoring_keys: Vec<AnchoringKeys>) -> Self {
        Self {
            network,
            anchoring_keys,
            anchoring_interval: DEFAULT_ANCHORING_INTERVAL,
            transaction_fee: DEFAULT_TRANSACTION_FEE,
        }
    }

    /// Set the anchoring interval.
    pub fn with_interval(mut self, interval: u64) -> Self {
        self.anchoring_interval = interval;
        self
    }

    /// Set the fee rate.
    pub fn with_fee(mut self, sat_per_vbyte: u64) -> Self {
        self.transaction_fee = sat_per_vbyte;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        KeyRegistry::validate_key_set(&self.anchoring_keys)
            .map_err(|e| AnchorError::InvalidKeySet(Box::new(e)))?;
        if self.anchoring_interval == 0 {
            return Err(AnchorError::InvalidInterval);
        }
        if self.transaction_fee > MAX_TRANSACTION_FEE {
            return Err(AnchorError::FeeRateTooHigh {
                rate: self.transaction_fee,
                max: MAX_TRANSACTION_FEE,
            });
        }
        Ok(())
    }

    /// Anchoring address of this configuration.
    pub fn address(&self) -> Result<Address> {
        KeyRegistry::derive_address(self)
    }
}

/// An activated configuration with its derived key material.
#[derive(Debug, Clone)]
pub struct Epoch {
    /// Sequential id.
    pub id: EpochId,
    /// First host height governed by this epoch.
    pub activation_height: u64,
    /// The configuration.
    pub config: Config,
    /// Validated keys and redeem script.
    pub key_set: KeySet,
    /// Anchoring address.
    pub address: Address,
}

impl Epoch {
    /// Whether `height` is due for anchoring given the last anchored height.
    pub fn anchoring_due(&self, height: u64, last_anchored: u64) -> bool {
        height.saturating_sub(last_anchored) >= self.config.anchoring_interval
    }
}

/// Append-only log of epochs.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    epochs: Vec<Epoch>,
    registry: KeyRegistry,
}

impl ConfigStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate `config` starting at host `height`, opening a new epoch.
    pub fn activate(&mut self, config: Config, height: u64) -> Result<&Epoch> {
        config.validate()?;
        if let Some(current) = self.epochs.last() {
            if height <= current.activation_height {
                return Err(AnchorError::NonMonotonicEpoch {
                    height,
                    current: current.activation_height,
                });
            }
        }

        let id = self.epochs.len() as EpochId;
        let key_set = self
            .registry
            .register(id, config.anchoring_keys.clone())?
            .clone();
        let address = key_set.redeem_script().address(config.network.to_network());

        info!(
            epoch = id,
            height,
            validators = key_set.len(),
            quorum = key_set.quorum(),
            %address,
            "Activated anchoring config"
        );

        self.epochs.push(Epoch {
            id,
            activation_height: height,
            config,
            key_set,
            address,
        });
        self.epochs.last().ok_or(AnchorError::NotConfigured)
    }

    /// The active epoch.
    pub fn current_epoch(&self) -> Option<&Epoch> {
        self.epochs.last()
    }

    /// The active configuration.
    pub fn current_config(&self) -> Option<&Config> {
        self.current_epoch().map(|e| &e.config)
    }

    /// Epoch by id.
    pub fn epoch(&self, id: EpochId) -> Option<&Epoch> {
        self.epochs.get(id as usize)
    }

    /// Epoch governing host `height`.
    pub fn epoch_at(&self, height: u64) -> Option<&Epoch> {
        self.epochs
            .iter()
            .rev()
            .find(|e| e.activation_height <= height)
    }

    /// Configuration governing host `height`.
    pub fn config_at(&self, height: u64) -> Option<&Config> {
        self.epoch_at(height).map(|e| &e.config)
    }

    /// Key set of epoch `id`.
    pub fn key_set(&self, id: EpochId) -> Result<&KeySet> {
        self.registry
            .key_set(id)
            .ok_or(AnchorError::UnknownEpoch(id))
    }

    /// All epochs, oldest first.
    pub fn epochs(&self) -> &[Epoch] {
        &self.epochs
    }

    /// The key registry.
    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{config_for, validator_keys};

    #[test]
    fn test_network_magic() {
        assert_eq!(BitcoinNetwork::Bitcoin.magic(), 0xD9B4BEF9);
        assert_eq!(BitcoinNetwork::Testnet.magic(), 0x0709110B);
        assert_eq!(BitcoinNetwork::Regtest.magic(), 0xDAB5BFFA);
        assert_eq!(
            BitcoinNetwork::from_magic(0xDAB5BFFA).unwrap(),
            BitcoinNetwork::Regtest
        );
        assert!(matches!(
            BitcoinNetwork::from_magic(0x1234),
            Err(AnchorError::UnknownNetwork(0x1234))
        ));
    }

    #[test]
    fn test_network_serializes_as_magic() {
        let bytes = bincode::serialize(&BitcoinNetwork::Testnet).unwrap();
        assert_eq!(bytes, 0x0709110Bu32.to_le_bytes());

        let json = serde_json::to_string(&BitcoinNetwork::Bitcoin).unwrap();
        assert_eq!(json, "3652501241");

        assert!(bincode::deserialize::<BitcoinNetwork>(&7u32.to_le_bytes()).is_err());
    }

    #[test]
    fn test_config_validate() {
        let validators = validator_keys(3);
        let config = config_for(&validators, 10);
        assert!(config.validate().is_ok());

        let bad = config.clone().with_interval(0);
        assert!(matches!(bad.validate(), Err(AnchorError::InvalidInterval)));

        assert!(config.clone().with_fee(MAX_TRANSACTION_FEE).validate().is_ok());
        let greedy = config.clone().with_fee(u64::MAX / 2);
        assert!(matches!(
            greedy.validate(),
            Err(AnchorError::FeeRateTooHigh { max: MAX_TRANSACTION_FEE, .. })
        ));

        let empty = Config::new(BitcoinNetwork::Regtest, vec![]);
        assert!(matches!(
            empty.validate(),
            Err(AnchorError::InvalidKeySet(inner)) if matches!(*inner, AnchorError::EmptyKeySet)
        ));
    }

    #[test]
    fn test_activate_epochs() {
        let validators = validator_keys(4);
        let mut store = ConfigStore::new();
        assert!(store.current_config().is_none());

        store.activate(config_for(&validators[..3], 10), 0).unwrap();
        store.activate(config_for(&validators, 20), 50).unwrap();

        assert_eq!(store.current_epoch().unwrap().id, 1);
        assert_eq!(store.current_config().unwrap().anchoring_interval, 20);
        assert_eq!(store.config_at(49).unwrap().anchoring_keys.len(), 3);
        assert_eq!(store.config_at(50).unwrap().anchoring_keys.len(), 4);
        assert_eq!(store.key_set(0).unwrap().quorum(), 2);
        assert_eq!(store.key_set(1).unwrap().quorum(), 3);
        assert!(store.key_set(2).is_err());
    }

    #[test]
    fn test_activate_non_monotonic() {
        let validators = validator_keys(3);
        let mut store = ConfigStore::new();
        store.activate(config_for(&validators, 10), 100).unwrap();

        let result = store.activate(config_for(&validators, 15), 100);
        assert!(matches!(
            result,
            Err(AnchorError::NonMonotonicEpoch {
                height: 100,
                current: 100
            })
        ));
        assert_eq!(store.epochs().len(), 1);
    }

    #[test]
    fn test_activate_rejects_invalid_config() {
        let mut store = ConfigStore::new();
        let result = store.activate(Config::new(BitcoinNetwork::Regtest, vec![]), 0);
        assert!(matches!(result, Err(AnchorError::InvalidKeySet(_))));
        assert!(store.current_epoch().is_none());
    }

    #[test]
    fn test_epoch_address_matches_derivation() {
        let validators = validator_keys(3);
        let config = config_for(&validators, 10);
        let mut store = ConfigStore::new();
        let epoch = store.activate(config.clone(), 1).unwrap();

        assert_eq!(epoch.address, config.address().unwrap());
        assert!(epoch.anchoring_due(11, 1));
        assert!(!epoch.anchoring_due(10, 1));
    }
}
