//! The chain of finalized anchoring transactions.
//!
//! Every anchor spends the change output of its predecessor, so the Bitcoin
//! transactions form a single chain:
//!
//! ```text
//!   genesis ──▶ anchor@10 ──▶ anchor@20 ──▶ anchor@30
//!   (funding     (input 0 =     (input 0 =
//!    inputs)      genesis:0)     anchor@10:0)
//! ```

use bitcoin::{OutPoint, Txid};
use keel_core::Hash;
use serde::{Deserialize, Serialize};

use crate::errors::{AnchorError, Result};
use crate::keys::EpochId;

/// A finalized anchor and the output the next anchor must spend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorPoint {
    /// Anchoring transaction id.
    pub txid: Txid,
    /// Index of the change output carried to the next anchor.
    pub output_index: u32,
    /// Anchored host height.
    pub height: u64,
    /// Anchored host block hash.
    pub block_hash: Hash,
    /// Value of the change output.
    pub value: u64,
    /// Epoch whose key set controls the change output.
    pub epoch: EpochId,
}

impl AnchorPoint {
    /// The change output.
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.output_index)
    }
}

/// Ordered history of anchors.
#[derive(Debug, Clone, Default)]
pub struct ChainTracker {
    history: Vec<AnchorPoint>,
}

impl ChainTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent anchor.
    pub fn latest(&self) -> Option<&AnchorPoint> {
        self.history.last()
    }

    /// Height of the most recent anchor, 0 before the first one.
    pub fn latest_anchored_height(&self) -> u64 {
        self.latest().map(|p| p.height).unwrap_or(0)
    }

    /// Whether no anchor has been finalized.
    pub fn is_genesis(&self) -> bool {
        self.history.is_empty()
    }

    /// Append `point`, whose transaction spends `first_input` first.
    ///
    /// `genesis` must be set exactly when the chain is empty.
    pub fn advance(&mut self, point: AnchorPoint, first_input: OutPoint, genesis: bool) -> Result<()> {
        match (self.latest(), genesis) {
            (None, true) => {}
            (None, false) => {
                return Err(AnchorError::NonContiguousAnchor(format!(
                    "{} claims a predecessor but the chain is empty",
                    point.txid
                )));
            }
            (Some(prev), true) => {
                return Err(AnchorError::NonContiguousAnchor(format!(
                    "{} claims genesis but the chain already ends at {}",
                    point.txid, prev.txid
                )));
            }
            (Some(prev), false) => {
                if point.height <= prev.height {
                    return Err(AnchorError::NonContiguousAnchor(format!(
                        "height {} does not exceed {}",
                        point.height, prev.height
                    )));
                }
                if first_input != prev.outpoint() {
                    return Err(AnchorError::NonContiguousAnchor(format!(
                        "first input {} does not spend {}",
                        first_input,
                        prev.outpoint()
                    )));
                }
            }
        }
        self.history.push(point);
        Ok(())
    }

    /// Every anchor, oldest first.
    pub fn history(&self) -> &[AnchorPoint] {
        &self.history
    }

    /// The first anchor at or above host `height`.
    pub fn nearest(&self, height: u64) -> Option<&AnchorPoint> {
        let idx = self.history.partition_point(|p| p.height < height);
        self.history.get(idx)
    }

    /// Anchor by transaction id.
    pub fn find(&self, txid: &Txid) -> Option<&AnchorPoint> {
        self.history.iter().find(|p| &p.txid == txid)
    }

    /// Number of anchors.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// Whether no anchor has been finalized.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
