//! Donated funds available to anchoring transactions.
//!
//! Funding outputs are selected largest first, ties broken by ascending
//! outpoint, so every validator picks the same inputs from the same pool.

use std::collections::{BTreeMap, BTreeSet};

use bitcoin::{Amount, OutPoint, Transaction, Txid};
use serde::{Deserialize, Serialize};

use crate::config::Epoch;
use crate::errors::{AnchorError, Result};
use crate::keys::EpochId;

/// An unspent output paying an anchoring address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FundingUtxo {
    /// The output.
    pub outpoint: OutPoint,
    /// Value in satoshis.
    pub value: u64,
    /// Epoch whose address (and key set) owns the output.
    pub epoch: EpochId,
}

/// Pool of confirmed, unspent funding outputs.
#[derive(Debug, Clone, Default)]
pub struct FundingPool {
    available: BTreeMap<OutPoint, FundingUtxo>,
    spent: BTreeSet<OutPoint>,
}

impl FundingPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Outputs of `tx` paying the address of `epoch`.
    ///
    /// Fails if the transaction is malformed, pays someone else, or any
    /// paying output was already consumed by an anchor.
    pub fn funding_outputs(&self, tx: &Transaction, epoch: &Epoch) -> Result<Vec<FundingUtxo>> {
        let txid = tx.compute_txid();
        if tx.input.is_empty() || tx.output.is_empty() {
            return Err(AnchorError::InvalidFundingTransaction(format!(
                "{txid} has no inputs or no outputs"
            )));
        }

        let script_pubkey = epoch.address.script_pubkey();
        let utxos: Vec<_> = tx
            .output
            .iter()
            .enumerate()
            .filter(|(_, out)| out.script_pubkey == script_pubkey)
            .map(|(vout, out)| FundingUtxo {
                outpoint: OutPoint::new(txid, vout as u32),
                value: out.value.to_sat(),
                epoch: epoch.id,
            })
            .collect();

        if utxos.is_empty() {
            return Err(AnchorError::WrongRecipient(txid));
        }
        if utxos.iter().any(|u| u.value > Amount::MAX_MONEY.to_sat()) {
            return Err(AnchorError::InvalidFundingTransaction(format!(
                "{txid} pays more than the money supply"
            )));
        }
        if let Some(spent) = utxos.iter().find(|u| self.spent.contains(&u.outpoint)) {
            return Err(AnchorError::AlreadySpent(spent.outpoint.to_string()));
        }
        Ok(utxos)
    }

    /// Validate `tx` and add its paying outputs. Known outputs are skipped,
    /// so resubmitting a funding transaction is harmless. Returns the
    /// outputs that were new.
    pub fn add_funds(&mut self, tx: &Transaction, epoch: &Epoch) -> Result<Vec<FundingUtxo>> {
        let utxos = self.funding_outputs(tx, epoch)?;
        let mut added = Vec::with_capacity(utxos.len());
        for utxo in utxos {
            if self.insert(utxo)? {
                added.push(utxo);
            }
        }
        Ok(added)
    }

    /// Insert a single output; `Ok(false)` if it was already present.
    pub fn insert(&mut self, utxo: FundingUtxo) -> Result<bool> {
        if self.spent.contains(&utxo.outpoint) {
            return Err(AnchorError::AlreadySpent(utxo.outpoint.to_string()));
        }
        Ok(self.available.insert(utxo.outpoint, utxo).is_none())
    }

    /// Available outputs in selection order.
    pub fn candidates(&self) -> Vec<FundingUtxo> {
        let mut utxos: Vec<_> = self.available.values().copied().collect();
        utxos.sort_by(|a, b| b.value.cmp(&a.value).then(a.outpoint.cmp(&b.outpoint)));
        utxos
    }

    /// Shortest prefix of [`candidates`](Self::candidates) covering `target`.
    pub fn select_inputs(&self, target: u64) -> Result<Vec<FundingUtxo>> {
        let mut selected = Vec::new();
        let mut total = 0u64;
        for utxo in self.candidates() {
            if total >= target {
                break;
            }
            total = total.saturating_add(utxo.value);
            selected.push(utxo);
        }
        if total < target {
            return Err(AnchorError::InsufficientFunds {
                need: target,
                have: total,
            });
        }
        Ok(selected)
    }

    /// Mark an output consumed. Unknown outpoints are recorded too, so a
    /// later funding submission for them is rejected.
    pub fn mark_spent(&mut self, outpoint: OutPoint) -> Option<FundingUtxo> {
        self.spent.insert(outpoint);
        self.available.remove(&outpoint)
    }

    /// Whether an output was consumed.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains(outpoint)
    }

    /// Whether any output of `txid` is available.
    pub fn contains_tx(&self, txid: &Txid) -> bool {
        self.available.keys().any(|o| &o.txid == txid)
    }

    /// Available outputs, by outpoint.
    pub fn available(&self) -> impl Iterator<Item = &FundingUtxo> {
        self.available.values()
    }

    /// Sum of available outputs.
    pub fn total_value(&self) -> u64 {
        self.available
            .values()
            .fold(0, |sum, u| sum.saturating_add(u.value))
    }

    /// Number of available outputs.
    pub fn len(&self) -> usize {
        self.available.len()
    }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }
}
