//! Append-only ledger of custody events.
//!
//! The funding pool and the anchor chain are never mutated directly; every
//! change is a [`LedgerEntry`] applied through [`Ledger::commit`], which
//! validates the whole batch against a scratch copy of the state before
//! swapping it in. Replaying the entries reproduces the state exactly.
//!
//! ```text
//!   Funded(a) ─ Funded(b) ─ Spent(a) ─ Advanced(tx@10) ─ Funded(c) ─ ...
//!                           └──── one finalization batch ────┘
//!
//!   later batches also spend the previous anchor:
//!   Spent(tx@10:0) ─ Spent(c) ─ Advanced(tx@20)
//! ```

use std::collections::HashMap;

use bitcoin::{OutPoint, Transaction, Txid};
use keel_core::{hash_all, Hash};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::{AnchorPoint, ChainTracker};
use crate::config::Epoch;
use crate::errors::{AnchorError, Result};
use crate::finalizer::SignedAnchoringTx;
use crate::funding::{FundingPool, FundingUtxo};
use crate::messages::raw_tx;

/// A single custody event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LedgerEntry {
    /// A confirmed funding output entered the pool.
    Funded(FundingUtxo),
    /// An output was consumed by an anchoring transaction: a funding
    /// output, or the previous anchor's change.
    Spent {
        /// The consumed output.
        outpoint: OutPoint,
        /// The anchoring transaction spending it.
        by: Txid,
    },
    /// An anchoring transaction was finalized.
    Advanced {
        /// The new chain tip.
        point: AnchorPoint,
        /// Whether it starts the chain.
        genesis: bool,
        /// The signed transaction.
        #[serde(with = "raw_tx")]
        transaction: Transaction,
    },
}

#[derive(Debug, Clone, Default)]
struct State {
    pool: FundingPool,
    chain: ChainTracker,
    transactions: HashMap<Txid, Transaction>,
}

impl State {
    fn apply(&mut self, entry: &LedgerEntry) -> Result<()> {
        match entry {
            LedgerEntry::Funded(utxo) => {
                self.pool.insert(*utxo)?;
            }
            LedgerEntry::Spent { outpoint, .. } => {
                if self.pool.is_spent(outpoint) {
                    return Err(AnchorError::AlreadySpent(outpoint.to_string()));
                }
                self.pool.mark_spent(*outpoint);
            }
            LedgerEntry::Advanced {
                point,
                genesis,
                transaction,
            } => {
                let first_input = transaction
                    .input
                    .first()
                    .map(|i| i.previous_output)
                    .ok_or_else(|| {
                        AnchorError::NonContiguousAnchor(format!("{} has no inputs", point.txid))
                    })?;
                self.chain.advance(*point, first_input, *genesis)?;
                self.transactions.insert(point.txid, transaction.clone());
            }
        }
        Ok(())
    }
}

/// Custody state and the log that produced it.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    entries: Vec<LedgerEntry>,
    state: State,
}

impl Ledger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a ledger from its entries.
    pub fn replay(entries: impl IntoIterator<Item = LedgerEntry>) -> Result<Self> {
        let mut ledger = Self::new();
        ledger.commit(entries.into_iter().collect())?;
        Ok(ledger)
    }

    /// Apply `batch` atomically: either every entry applies or none does.
    pub fn commit(&mut self, batch: Vec<LedgerEntry>) -> Result<()> {
        let mut scratch = self.state.clone();
        for entry in &batch {
            scratch.apply(entry)?;
        }
        debug!(entries = batch.len(), total = self.entries.len() + batch.len(), "Committed ledger batch");
        self.state = scratch;
        self.entries.extend(batch);
        Ok(())
    }

    /// Validate a funding transaction against `epoch` and record its new
    /// outputs. Anchoring transactions are never funding: their change is
    /// either the chain tip or already spent by the next anchor.
    pub fn add_funds(&mut self, tx: &Transaction, epoch: &Epoch) -> Result<Vec<FundingUtxo>> {
        let utxos = self.state.pool.funding_outputs(tx, epoch)?;
        let txid = tx.compute_txid();
        if self.state.transactions.contains_key(&txid) {
            return Err(AnchorError::InvalidFundingTransaction(format!(
                "{txid} is an anchoring transaction"
            )));
        }
        let fresh: Vec<FundingUtxo> = utxos
            .into_iter()
            .filter(|u| !self.state.pool.available().any(|a| a.outpoint == u.outpoint))
            .collect();
        self.commit(fresh.iter().copied().map(LedgerEntry::Funded).collect())?;
        Ok(fresh)
    }

    /// Record a finalized anchoring transaction: every input becomes spent
    /// and the chain advances to its change output.
    pub fn commit_finalization(&mut self, signed: &SignedAnchoringTx) -> Result<AnchorPoint> {
        let change = signed
            .transaction
            .output
            .first()
            .ok_or_else(|| AnchorError::NonContiguousAnchor(format!("{} has no outputs", signed.txid)))?;
        let point = AnchorPoint {
            txid: signed.txid,
            output_index: 0,
            height: signed.commitment.height,
            block_hash: signed.commitment.block_hash,
            value: change.value.to_sat(),
            epoch: signed.epoch,
        };

        let mut batch: Vec<LedgerEntry> = signed
            .inputs
            .iter()
            .map(|i| LedgerEntry::Spent {
                outpoint: i.outpoint,
                by: signed.txid,
            })
            .collect();
        batch.push(LedgerEntry::Advanced {
            point,
            genesis: signed.is_genesis(),
            transaction: signed.transaction.clone(),
        });

        self.commit(batch)?;
        Ok(point)
    }

    /// The funding pool.
    pub fn pool(&self) -> &FundingPool {
        &self.state.pool
    }

    /// The anchor chain.
    pub fn chain(&self) -> &ChainTracker {
        &self.state.chain
    }

    /// Every entry, oldest first.
    pub fn entries(&self) -> &[LedgerEntry] {
        &self.entries
    }

    /// Signed anchoring transaction by id.
    pub fn transaction(&self, txid: &Txid) -> Option<&Transaction> {
        self.state.transactions.get(txid)
    }

    /// Signed anchoring transactions in chain order.
    pub fn anchoring_transactions(&self) -> Vec<(&AnchorPoint, &Transaction)> {
        self.state
            .chain
            .history()
            .iter()
            .filter_map(|p| self.state.transactions.get(&p.txid).map(|tx| (p, tx)))
            .collect()
    }

    /// Digest of the log, comparable across validators.
    pub fn state_hash(&self) -> Result<Hash> {
        let encoded = self
            .entries
            .iter()
            .map(bincode::serialize)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(hash_all(&encoded))
    }
}
