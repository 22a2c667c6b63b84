//! Assembly of the fully signed anchoring transaction.
//!
//! Every input gets the P2WSH multisig witness
//!
//! ```text
//! <empty> <sig_1> ... <sig_m> <witness script>
//! ```
//!
//! with signatures in the order their keys appear in the witness script,
//! as `OP_CHECKMULTISIG` requires.

use bitcoin::{Transaction, Txid, Witness};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigStore;
use crate::errors::{AnchorError, Result};
use crate::keys::EpochId;
use crate::ledger::Ledger;
use crate::messages::raw_tx;
use crate::payload::Commitment;
use crate::proposal::{AnchoringProposal, ProposalInput};
use crate::signature::SignatureCollector;

/// A broadcastable anchoring transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAnchoringTx {
    /// The signed transaction.
    #[serde(with = "raw_tx")]
    pub transaction: Transaction,
    /// Its id.
    pub txid: Txid,
    /// The anchored block.
    pub commitment: Commitment,
    /// Inputs, as proposed.
    pub inputs: Vec<ProposalInput>,
    /// Epoch the transaction was built under.
    pub epoch: EpochId,
}

impl SignedAnchoringTx {
    /// Whether this is the first anchor of the chain.
    pub fn is_genesis(&self) -> bool {
        !self.inputs.first().map(ProposalInput::is_chain).unwrap_or(false)
    }

    /// Consensus-encoded transaction as hex.
    pub fn to_hex(&self) -> String {
        bitcoin::consensus::encode::serialize_hex(&self.transaction)
    }
}

/// Attach the collected signatures to `proposal`.
pub fn assemble(
    proposal: &AnchoringProposal,
    collector: &SignatureCollector,
    configs: &ConfigStore,
) -> Result<SignedAnchoringTx> {
    let txid = proposal.txid();
    if collector.txid() != txid {
        return Err(AnchorError::UnknownTxid(collector.txid()));
    }

    let mut transaction = proposal.transaction.clone();
    for (index, input) in proposal.inputs.iter().enumerate() {
        let key_set = configs.key_set(input.epoch)?;
        let quorum = key_set.quorum();
        let signatures = collector.ordered_signatures(index);
        if signatures.len() < quorum {
            return Err(AnchorError::IncompleteSignatures {
                input: index as u32,
                have: signatures.len(),
                need: quorum,
            });
        }

        let mut items: Vec<Vec<u8>> = Vec::with_capacity(quorum + 2);
        items.push(Vec::new());
        items.extend(signatures.iter().take(quorum).map(|s| s.to_vec()));
        items.push(key_set.redeem_script().script().to_bytes());
        transaction.input[index].witness = Witness::from_slice(&items);
    }

    Ok(SignedAnchoringTx {
        transaction,
        txid,
        commitment: proposal.commitment,
        inputs: proposal.inputs.clone(),
        epoch: proposal.epoch,
    })
}

/// Assemble `proposal` and record it in `ledger` before it is handed to the
/// relay.
pub fn finalize(
    ledger: &mut Ledger,
    proposal: &AnchoringProposal,
    collector: &SignatureCollector,
    configs: &ConfigStore,
) -> Result<SignedAnchoringTx> {
    let signed = assemble(proposal, collector, configs)?;
    let point = ledger.commit_finalization(&signed)?;
    info!(
        txid = %signed.txid,
        height = point.height,
        inputs = signed.inputs.len(),
        change = point.value,
        "Finalized anchoring transaction"
    );
    Ok(signed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::SignInput;
    use crate::proposal::build_proposal;
    use crate::signature::InputSigner;
    use crate::testing::{config_for, funding_tx, validator_keys};

    #[test]
    fn test_assemble_witness() {
        let validators = validator_keys(3);
        let mut configs = ConfigStore::new();
        let epoch = configs.activate(config_for(&validators, 10), 0).unwrap().clone();
        let mut ledger = Ledger::new();
        ledger
            .add_funds(&funding_tx(&epoch.address, 60_000, 1), &epoch)
            .unwrap();

        let proposal = build_proposal(
            &configs,
            ledger.chain(),
            ledger.pool(),
            Commitment::new(10, keel_core::hash(b"b10")),
        )
        .unwrap();
        let mut collector = SignatureCollector::new(&proposal, &configs).unwrap();

        assert!(matches!(
            assemble(&proposal, &collector, &configs),
            Err(AnchorError::IncompleteSignatures { input: 0, have: 0, need: 2 })
        ));

        let signer = InputSigner::new();
        let script = configs.key_set(0).unwrap().redeem_script().clone();
        for v in [2usize, 0, 1] {
            let sig = signer
                .sign_input(&proposal.transaction, 0, &script, 60_000, &validators[v].bitcoin)
                .unwrap();
            collector
                .submit(
                    &SignInput {
                        txid: proposal.txid(),
                        input: 0,
                        input_signature: sig,
                    },
                    &validators[v].keys,
                )
                .unwrap();
        }

        let signed = finalize(&mut ledger, &proposal, &collector, &configs).unwrap();
        let witness = &signed.transaction.input[0].witness;

        // dummy + quorum(2) signatures + script
        assert_eq!(witness.len(), 4);
        assert!(witness.nth(0).unwrap().is_empty());
        assert_eq!(
            witness.nth(1).unwrap(),
            collector.ordered_signatures(0)[0].to_vec().as_slice()
        );
        assert_eq!(witness.nth(3).unwrap(), script.script().as_bytes());

        // witness data does not change the txid
        assert_eq!(signed.transaction.compute_txid(), proposal.txid());
        assert!(signed.is_genesis());

        assert_eq!(ledger.chain().latest().unwrap().txid, signed.txid);
        assert!(ledger.pool().is_empty());
    }
}
