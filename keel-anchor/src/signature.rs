//! Threshold signature collection for anchoring proposals.
//!
//! Each input of a proposal is a P2WSH multisig spend. Validators sign the
//! BIP143 sighash of every input they hold a key for, and the collector keeps
//! one verified signature per (input, key) until each input reaches the
//! quorum of the key set that owns its previous output:
//!
//! ```text
//!             keys of epoch 0 (3)     keys of epoch 1 (4)
//!   input 0   ■ ■ □  2/2 ✓            (chain output of epoch 0)
//!   input 1                           ■ ■ ■ □  3/3 ✓
//!   input 2                           ■ □ □ □  1/3
//! ```

use std::collections::BTreeMap;
use std::fmt;

use bitcoin::ecdsa;
use bitcoin::hashes::Hash as _;
use bitcoin::secp256k1::{All, Message, Secp256k1, SecretKey};
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Transaction, Txid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::config::ConfigStore;
use crate::errors::{AnchorError, Result};
use crate::keys::{AnchoringKeys, KeySet, RedeemScript};
use crate::messages::SignInput;
use crate::proposal::AnchoringProposal;

/// DER-encoded ECDSA signature followed by its sighash byte, exactly as it
/// appears in the witness. Only `SIGHASH_ALL` is accepted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputSignature(ecdsa::Signature);

impl InputSignature {
    /// Wrap a raw secp256k1 signature as `SIGHASH_ALL`.
    pub fn new(signature: bitcoin::secp256k1::ecdsa::Signature) -> Self {
        Self(ecdsa::Signature {
            signature,
            sighash_type: EcdsaSighashType::All,
        })
    }

    /// Parse witness bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let sig = ecdsa::Signature::from_slice(bytes)
            .map_err(|e| AnchorError::InvalidMessage(format!("bad input signature: {e}")))?;
        if sig.sighash_type != EcdsaSighashType::All {
            return Err(AnchorError::InvalidMessage(format!(
                "unsupported sighash type {}",
                sig.sighash_type
            )));
        }
        Ok(Self(sig))
    }

    /// Witness bytes.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The raw ECDSA signature.
    pub fn ecdsa(&self) -> &bitcoin::secp256k1::ecdsa::Signature {
        &self.0.signature
    }
}

impl fmt::Debug for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = hex::encode(self.to_vec());
        write!(f, "InputSignature({}..)", &hex[..16.min(hex.len())])
    }
}

impl Serialize for InputSignature {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            hex::encode(self.to_vec()).serialize(s)
        } else {
            self.to_vec().serialize(s)
        }
    }
}

impl<'de> Deserialize<'de> for InputSignature {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let bytes = if d.is_human_readable() {
            let s = String::deserialize(d)?;
            hex::decode(s).map_err(serde::de::Error::custom)?
        } else {
            Vec::<u8>::deserialize(d)?
        };
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Signs and verifies P2WSH multisig inputs.
#[derive(Clone)]
pub struct InputSigner {
    secp: Secp256k1<All>,
}

impl Default for InputSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InputSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InputSigner")
    }
}

impl InputSigner {
    /// Create a signer with a fresh secp256k1 context.
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    /// BIP143 sighash of input `input` spending `value` locked by `script`.
    pub fn sighash(
        &self,
        tx: &Transaction,
        input: usize,
        script: &RedeemScript,
        value: u64,
    ) -> Result<Message> {
        let mut cache = SighashCache::new(tx);
        let sighash = cache
            .p2wsh_signature_hash(
                input,
                script.script(),
                Amount::from_sat(value),
                EcdsaSighashType::All,
            )
            .map_err(|e| AnchorError::Sighash(e.to_string()))?;
        Ok(Message::from_digest(sighash.to_byte_array()))
    }

    /// Sign input `input` with `secret`.
    pub fn sign_input(
        &self,
        tx: &Transaction,
        input: usize,
        script: &RedeemScript,
        value: u64,
        secret: &SecretKey,
    ) -> Result<InputSignature> {
        let msg = self.sighash(tx, input, script, value)?;
        Ok(InputSignature::new(self.secp.sign_ecdsa(&msg, secret)))
    }

    /// Verify `signature` over input `input` against `public`.
    pub fn verify_input(
        &self,
        tx: &Transaction,
        input: usize,
        script: &RedeemScript,
        value: u64,
        public: &bitcoin::PublicKey,
        signature: &InputSignature,
    ) -> Result<()> {
        let msg = self.sighash(tx, input, script, value)?;
        self.secp
            .verify_ecdsa(&msg, signature.ecdsa(), &public.inner)
            .map_err(|_| AnchorError::SignatureVerificationFailed(input as u32))
    }
}

/// Effect of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// First signature from this signer for this input.
    Accepted,
    /// Identical to the stored signature; nothing changed.
    Duplicate,
    /// A different valid signature from the same signer replaced the old one.
    Replaced,
}

/// Signature count of one input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputProgress {
    /// Signatures collected.
    pub have: usize,
    /// Signatures required.
    pub need: usize,
}

#[derive(Debug, Clone)]
struct InputSlot {
    value: u64,
    authority: KeySet,
    // Keyed by position in the redeem script.
    signatures: BTreeMap<usize, InputSignature>,
}

/// Verified signatures for the active proposal.
#[derive(Debug, Clone)]
pub struct SignatureCollector {
    txid: Txid,
    transaction: Transaction,
    inputs: Vec<InputSlot>,
    signer: InputSigner,
}

impl SignatureCollector {
    /// Start collecting for `proposal`, resolving each input's key set.
    pub fn new(proposal: &AnchoringProposal, configs: &ConfigStore) -> Result<Self> {
        let inputs = proposal
            .inputs
            .iter()
            .map(|input| {
                Ok(InputSlot {
                    value: input.value,
                    authority: configs.key_set(input.epoch)?.clone(),
                    signatures: BTreeMap::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            txid: proposal.txid(),
            transaction: proposal.transaction.clone(),
            inputs,
            signer: InputSigner::new(),
        })
    }

    /// Transaction being signed.
    pub fn txid(&self) -> Txid {
        self.txid
    }

    /// Number of inputs.
    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Key set authorizing input `input`.
    pub fn authority(&self, input: u32) -> Option<&KeySet> {
        self.inputs.get(input as usize).map(|slot| &slot.authority)
    }

    /// Check that `msg` addresses an input of this proposal.
    pub fn check_target(&self, msg: &SignInput) -> Result<()> {
        if msg.txid != self.txid {
            return Err(AnchorError::UnknownTxid(msg.txid));
        }
        if msg.input as usize >= self.inputs.len() {
            return Err(AnchorError::InputOutOfRange {
                input: msg.input,
                count: self.inputs.len(),
            });
        }
        Ok(())
    }

    /// Verify and record a signature from `signer`.
    pub fn submit(&mut self, msg: &SignInput, signer: &AnchoringKeys) -> Result<Submission> {
        self.check_target(msg)?;
        let index = msg.input as usize;
        let slot = &self.inputs[index];

        let position = slot
            .authority
            .position_of(signer)
            .ok_or_else(|| AnchorError::UnauthorizedSigner {
                input: msg.input,
                signer: signer.service_key.to_hex(),
            })?;

        self.signer.verify_input(
            &self.transaction,
            index,
            slot.authority.redeem_script(),
            slot.value,
            &signer.bitcoin_key,
            &msg.input_signature,
        )?;

        let slot = &mut self.inputs[index];
        let outcome = match slot.signatures.insert(position, msg.input_signature) {
            None => Submission::Accepted,
            Some(previous) if previous == msg.input_signature => Submission::Duplicate,
            Some(_) => Submission::Replaced,
        };
        debug!(
            txid = %self.txid,
            input = msg.input,
            position,
            have = slot.signatures.len(),
            need = slot.authority.quorum(),
            ?outcome,
            "Recorded input signature"
        );
        Ok(outcome)
    }

    /// Whether every input reached its quorum.
    pub fn is_complete(&self) -> bool {
        self.inputs
            .iter()
            .all(|slot| slot.signatures.len() >= slot.authority.quorum())
    }

    /// Per-input signature counts.
    pub fn progress(&self) -> Vec<InputProgress> {
        self.inputs
            .iter()
            .map(|slot| InputProgress {
                have: slot.signatures.len(),
                need: slot.authority.quorum(),
            })
            .collect()
    }

    /// Signatures of input `input` in redeem-script key order.
    pub fn ordered_signatures(&self, input: usize) -> Vec<&InputSignature> {
        self.inputs
            .get(input)
            .map(|slot| slot.signatures.values().collect())
            .unwrap_or_default()
    }

    /// Whether the validator at `position` signed input `input`.
    pub fn has_signed(&self, input: usize, position: usize) -> bool {
        self.inputs
            .get(input)
            .map(|slot| slot.signatures.contains_key(&position))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainTracker;
    use crate::funding::FundingPool;
    use crate::payload::Commitment;
    use crate::proposal::build_proposal;
    use crate::testing::{config_for, funding_tx, validator_keys, TestValidator};

    struct Fixture {
        validators: Vec<TestValidator>,
        configs: ConfigStore,
        proposal: AnchoringProposal,
        signer: InputSigner,
    }

    impl Fixture {
        fn new(n: usize, funding: &[u64]) -> Self {
            let validators = validator_keys(n);
            let mut configs = ConfigStore::new();
            let epoch = configs.activate(config_for(&validators, 10), 0).unwrap().clone();
            let mut pool = FundingPool::new();
            for (i, value) in funding.iter().enumerate() {
                pool.add_funds(&funding_tx(&epoch.address, *value, i as u8 + 1), &epoch)
                    .unwrap();
            }
            let proposal = build_proposal(
                &configs,
                &ChainTracker::new(),
                &pool,
                Commitment::new(10, keel_core::hash(b"block 10")),
            )
            .unwrap();
            Self {
                validators,
                configs,
                proposal,
                signer: InputSigner::new(),
            }
        }

        fn sign(&self, validator: usize, input: u32) -> SignInput {
            let set = self.configs.key_set(0).unwrap();
            let sig = self
                .signer
                .sign_input(
                    &self.proposal.transaction,
                    input as usize,
                    set.redeem_script(),
                    self.proposal.inputs[input as usize].value,
                    &self.validators[validator].bitcoin,
                )
                .unwrap();
            SignInput {
                txid: self.proposal.txid(),
                input,
                input_signature: sig,
            }
        }

        fn collector(&self) -> SignatureCollector {
            SignatureCollector::new(&self.proposal, &self.configs).unwrap()
        }
    }

    #[test]
    fn test_sign_and_verify_input() {
        let fx = Fixture::new(3, &[50_000]);
        let msg = fx.sign(0, 0);
        let set = fx.configs.key_set(0).unwrap();

        fx.signer
            .verify_input(
                &fx.proposal.transaction,
                0,
                set.redeem_script(),
                50_000,
                &fx.validators[0].keys.bitcoin_key,
                &msg.input_signature,
            )
            .unwrap();

        // wrong key
        assert!(fx
            .signer
            .verify_input(
                &fx.proposal.transaction,
                0,
                set.redeem_script(),
                50_000,
                &fx.validators[1].keys.bitcoin_key,
                &msg.input_signature,
            )
            .is_err());

        // wrong amount changes the sighash
        assert!(fx
            .signer
            .verify_input(
                &fx.proposal.transaction,
                0,
                set.redeem_script(),
                49_999,
                &fx.validators[0].keys.bitcoin_key,
                &msg.input_signature,
            )
            .is_err());
    }

    #[test]
    fn test_input_signature_bytes() {
        let fx = Fixture::new(1, &[50_000]);
        let sig = fx.sign(0, 0).input_signature;
        let bytes = sig.to_vec();

        assert_eq!(*bytes.last().unwrap(), 0x01);
        assert_eq!(InputSignature::from_bytes(&bytes).unwrap(), sig);

        let mut none = bytes.clone();
        *none.last_mut().unwrap() = 0x02;
        assert!(InputSignature::from_bytes(&none).is_err());
        assert!(InputSignature::from_bytes(&bytes[..10]).is_err());
    }

    #[test]
    fn test_collect_to_quorum() {
        let fx = Fixture::new(4, &[80_000]);
        let mut collector = fx.collector();

        for v in 0..2 {
            assert_eq!(
                collector.submit(&fx.sign(v, 0), &fx.validators[v].keys).unwrap(),
                Submission::Accepted
            );
            assert!(!collector.is_complete());
        }
        collector.submit(&fx.sign(2, 0), &fx.validators[2].keys).unwrap();
        assert!(collector.is_complete());
        assert_eq!(collector.progress(), vec![InputProgress { have: 3, need: 3 }]);
    }

    #[test]
    fn test_duplicate_is_idempotent() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();
        let msg = fx.sign(1, 0);

        collector.submit(&msg, &fx.validators[1].keys).unwrap();
        let before = collector.progress();
        assert_eq!(
            collector.submit(&msg, &fx.validators[1].keys).unwrap(),
            Submission::Duplicate
        );
        assert_eq!(collector.progress(), before);
        assert!(!collector.is_complete());
    }

    #[test]
    fn test_unknown_txid() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();
        let mut msg = fx.sign(0, 0);
        msg.txid = Txid::from_byte_array([0xab; 32]);

        assert!(matches!(
            collector.submit(&msg, &fx.validators[0].keys),
            Err(AnchorError::UnknownTxid(_))
        ));
        assert_eq!(collector.progress()[0].have, 0);
    }

    #[test]
    fn test_input_out_of_range() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();
        let mut msg = fx.sign(0, 0);
        msg.input = 5;

        assert!(matches!(
            collector.submit(&msg, &fx.validators[0].keys),
            Err(AnchorError::InputOutOfRange { input: 5, count: 1 })
        ));
    }

    #[test]
    fn test_bad_signature() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();
        // validator 0 signed, but claims to be validator 1
        let msg = fx.sign(0, 0);

        assert!(matches!(
            collector.submit(&msg, &fx.validators[1].keys),
            Err(AnchorError::SignatureVerificationFailed(0))
        ));
    }

    #[test]
    fn test_unauthorized_signer() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();

        let outsider = validator_keys(1).remove(0);
        let set = fx.configs.key_set(0).unwrap();
        let sig = fx
            .signer
            .sign_input(
                &fx.proposal.transaction,
                0,
                set.redeem_script(),
                80_000,
                &outsider.bitcoin,
            )
            .unwrap();
        let msg = SignInput {
            txid: fx.proposal.txid(),
            input: 0,
            input_signature: sig,
        };

        assert!(matches!(
            collector.submit(&msg, &outsider.keys),
            Err(AnchorError::UnauthorizedSigner { input: 0, .. })
        ));
        assert_eq!(collector.progress()[0].have, 0);
    }

    #[test]
    fn test_ordered_by_script_position() {
        let fx = Fixture::new(3, &[80_000]);
        let mut collector = fx.collector();
        let m2 = fx.sign(2, 0);
        let m0 = fx.sign(0, 0);
        collector.submit(&m2, &fx.validators[2].keys).unwrap();
        collector.submit(&m0, &fx.validators[0].keys).unwrap();

        let ordered = collector.ordered_signatures(0);
        assert_eq!(ordered, vec![&m0.input_signature, &m2.input_signature]);
        assert!(collector.has_signed(0, 2));
        assert!(!collector.has_signed(0, 1));
    }
}
