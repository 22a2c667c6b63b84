//! Threshold-Signed Bitcoin Anchoring for Keel.
//!
//! Validators of a permissioned chain jointly custody a P2WSH multisig
//! address. Every `anchoring_interval` blocks they build one Bitcoin
//! transaction that spends the previous anchor's change output, commits the
//! current block hash in an `OP_RETURN` output, and is signed by a majority
//! of the key set before anyone broadcasts it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                       KEEL ANCHORING LAYER                           │
//! │                                                                      │
//! │  host chain ──▶ ┌───────────────────────────────────────────────┐   │
//! │  blocks,        │ ANCHORING NODE (one per validator)            │   │
//! │  configs,       │  ConfigStore ─▶ KeyRegistry (epochs, address) │   │
//! │  messages       │  Ledger ─────▶ FundingPool + ChainTracker     │   │
//! │                 │  ProposalBuilder ─▶ SignatureCollector        │   │
//! │                 │                   ─▶ TransactionFinalizer     │   │
//! │                 └───────────────────────────────────────────────┘   │
//! │                            │ effects                                 │
//! │              ┌─────────────┴─────────────┐                           │
//! │              ▼                           ▼                           │
//! │     SignInput broadcast           BitcoinRelay (send, confirmations) │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keel_anchor::{AnchoringNode, NodeSettings};
//!
//! let mut node = AnchoringNode::with_genesis(NodeSettings::default(), Some(signer), config)?;
//!
//! node.on_add_funds(&add_funds, confirmations)?;
//! let effects = node.on_block(height, block_hash)?;
//! for envelope in effects.broadcast {
//!     transport.send(envelope).await?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod chain;
pub mod config;
pub mod cycle;
pub mod errors;
pub mod finalizer;
pub mod funding;
pub mod keys;
pub mod ledger;
pub mod messages;
pub mod node;
pub mod payload;
pub mod proposal;
pub mod service;
pub mod settings;
pub mod signature;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod proptest;

pub use chain::{AnchorPoint, ChainTracker};
pub use config::{BitcoinNetwork, Config, ConfigStore, Epoch};
pub use cycle::{CycleState, Transition};
pub use errors::{AnchorError, ErrorKind, Result};
pub use finalizer::SignedAnchoringTx;
pub use funding::{FundingPool, FundingUtxo};
pub use keys::{majority_count, AnchoringKeys, EpochId, KeyRegistry, KeySet, RedeemScript};
pub use ledger::{Ledger, LedgerEntry};
pub use messages::{AddFunds, AnchoringMessage, Envelope, SignInput};
pub use node::{AnchoringNode, Effects, LocalSigner, NodeStatus, ProposalStatus};
pub use payload::Commitment;
pub use proposal::{build_proposal, AnchoringProposal, InputKind, ProposalInput};
pub use service::{AnchoringService, BitcoinRelay, HostEvent};
pub use settings::NodeSettings;
pub use signature::{InputProgress, InputSignature, InputSigner, SignatureCollector, Submission};
