//! Construction of anchoring proposals.
//!
//! [`build_proposal`] is a pure function of the epoch log, the anchor chain,
//! the funding pool and the commitment. Validators with identical state
//! therefore build byte-identical transactions without coordinating.
//!
//! ```text
//!   inputs                               outputs
//!   ┌──────────────────────────────┐     ┌───────────────────────────────┐
//!   │ 0: previous anchor (Chain)   │     │ 0: anchoring address (change) │
//!   │ 1..: funding, largest first  │ ──▶ │ 1: OP_RETURN commitment       │
//!   └──────────────────────────────┘     └───────────────────────────────┘
//! ```
//!
//! At genesis there is no chain input and every input comes from funding.

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{AnchorPoint, ChainTracker};
use crate::config::ConfigStore;
use crate::errors::{AnchorError, Result};
use crate::funding::{FundingPool, FundingUtxo};
use crate::keys::{EpochId, KeySet};
use crate::payload::Commitment;

/// Smallest change output kept; P2WSH dust limit at the default relay fee.
pub const MIN_CHANGE: u64 = 330;

/// Upper bound of a DER signature plus sighash byte.
const MAX_SIGNATURE_LEN: u64 = 73;

/// Where a proposal input comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputKind {
    /// Change output of the previous anchor.
    Chain,
    /// Donated funding output.
    Funding,
}

/// One input of a proposal, tagged with the epoch whose keys sign it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProposalInput {
    /// Output being spent.
    pub outpoint: OutPoint,
    /// Its value in satoshis.
    pub value: u64,
    /// Chain or funding.
    pub kind: InputKind,
    /// Epoch whose key set authorizes the spend.
    pub epoch: EpochId,
}

impl ProposalInput {
    /// Input spending the previous anchor.
    pub fn chain(point: &AnchorPoint) -> Self {
        Self {
            outpoint: point.outpoint(),
            value: point.value,
            kind: InputKind::Chain,
            epoch: point.epoch,
        }
    }

    /// Input spending a funding output.
    pub fn funding(utxo: &FundingUtxo) -> Self {
        Self {
            outpoint: utxo.outpoint,
            value: utxo.value,
            kind: InputKind::Funding,
            epoch: utxo.epoch,
        }
    }

    /// Whether this input spends the previous anchor.
    pub fn is_chain(&self) -> bool {
        self.kind == InputKind::Chain
    }
}

/// An unsigned anchoring transaction awaiting validator signatures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchoringProposal {
    /// The unsigned transaction.
    pub transaction: Transaction,
    /// Inputs, in transaction order.
    pub inputs: Vec<ProposalInput>,
    /// The anchored block.
    pub commitment: Commitment,
    /// Fee paid, in satoshis.
    pub fee: u64,
    /// Epoch the proposal was built under.
    pub epoch: EpochId,
}

impl AnchoringProposal {
    /// Transaction id; signatures do not change it.
    pub fn txid(&self) -> Txid {
        self.transaction.compute_txid()
    }

    /// Sum of input values.
    pub fn total_input(&self) -> u64 {
        self.inputs.iter().fold(0, |sum, i| sum.saturating_add(i.value))
    }

    /// Value carried to the next anchor.
    pub fn change_value(&self) -> u64 {
        self.transaction
            .output
            .first()
            .map(|o| o.value.to_sat())
            .unwrap_or(0)
    }

    /// Whether this is the first anchor of the chain.
    pub fn is_genesis(&self) -> bool {
        !self.inputs.first().map(ProposalInput::is_chain).unwrap_or(false)
    }

    /// Funding outputs consumed.
    pub fn funding_inputs(&self) -> impl Iterator<Item = &ProposalInput> {
        self.inputs.iter().filter(|i| !i.is_chain())
    }
}

/// Whether block `height` should be anchored.
pub fn anchoring_due(configs: &ConfigStore, chain: &ChainTracker, height: u64) -> bool {
    configs
        .current_epoch()
        .map(|epoch| epoch.anchoring_due(height, chain.latest_anchored_height()))
        .unwrap_or(false)
}

/// Build the proposal anchoring `commitment` under the current epoch.
pub fn build_proposal(
    configs: &ConfigStore,
    chain: &ChainTracker,
    pool: &FundingPool,
    commitment: Commitment,
) -> Result<AnchoringProposal> {
    let epoch = configs.current_epoch().ok_or(AnchorError::NotConfigured)?;
    let fee_rate = epoch.config.transaction_fee;
    let change_script = epoch.address.script_pubkey();
    let payload = commitment.to_script()?;

    let chain_input = chain.latest().map(ProposalInput::chain);
    let chain_value = chain_input.map(|i| i.value).unwrap_or(0);

    let mut funding: Vec<FundingUtxo> = Vec::new();
    loop {
        let inputs: Vec<ProposalInput> = chain_input
            .into_iter()
            .chain(funding.iter().map(ProposalInput::funding))
            .collect();
        let mut transaction = unsigned_transaction(&inputs, change_script.clone(), payload.clone());

        let vsize = estimate_vsize(&transaction, &inputs, configs)?;
        let have = chain_value.saturating_add(pool.total_value());
        let (fee, need) = fee_rate
            .checked_mul(vsize)
            .and_then(|fee| Some((fee, fee.checked_add(MIN_CHANGE)?)))
            .ok_or(AnchorError::InsufficientFunds {
                need: u64::MAX,
                have,
            })?;
        let total = inputs
            .iter()
            .try_fold(0u64, |sum, i| sum.checked_add(i.value))
            .ok_or_else(|| {
                AnchorError::InvalidFundingTransaction("input values overflow".into())
            })?;

        if total >= need {
            transaction.output[0].value = Amount::from_sat(total - fee);
            debug!(
                height = commitment.height,
                inputs = inputs.len(),
                vsize,
                fee,
                "Built anchoring proposal"
            );
            return Ok(AnchoringProposal {
                transaction,
                inputs,
                commitment,
                fee,
                epoch: epoch.id,
            });
        }

        let insufficient = AnchorError::InsufficientFunds { need, have };
        let next = pool
            .select_inputs(need.saturating_sub(chain_value))
            .map_err(|_| insufficient)?;
        if next.len() <= funding.len() {
            return Err(AnchorError::InsufficientFunds { need, have });
        }
        funding = next;
    }
}

fn unsigned_transaction(inputs: &[ProposalInput], change: ScriptBuf, payload: ScriptBuf) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![
            TxOut {
                value: Amount::ZERO,
                script_pubkey: change,
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: payload,
            },
        ],
    }
}

fn compact_size_len(n: u64) -> u64 {
    match n {
        0..=0xfc => 1,
        0xfd..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

/// Worst-case witness bytes spending a multisig output of `set`.
pub fn multisig_witness_len(set: &KeySet) -> u64 {
    let quorum = set.quorum() as u64;
    let script_len = set.redeem_script().script().len() as u64;
    // item count, empty CHECKMULTISIG dummy, signatures, witness script
    compact_size_len(quorum + 2)
        + 1
        + quorum * (1 + MAX_SIGNATURE_LEN)
        + compact_size_len(script_len)
        + script_len
}

/// Virtual size of `tx` once every input carries its multisig witness.
pub fn estimate_vsize(tx: &Transaction, inputs: &[ProposalInput], configs: &ConfigStore) -> Result<u64> {
    let base = tx.base_size() as u64;
    let mut witness = 2; // segwit marker and flag
    for input in inputs {
        witness += multisig_witness_len(configs.key_set(input.epoch)?);
    }
    Ok((base * 4 + witness + 3) / 4)
}
