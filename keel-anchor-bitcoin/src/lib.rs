//! Bitcoin Core relay for Keel anchoring.
//!
//! Implements [`keel_anchor::BitcoinRelay`] over the Bitcoin Core JSON-RPC
//! interface: finalized anchoring transactions are broadcast with
//! `sendrawtransaction`, and funding or anchoring confirmations are read
//! with `getrawtransaction`.
//!
//! ```text
//! ┌──────────────────┐  SignedAnchoringTx  ┌──────────┐  sendrawtransaction  ┌──────────────┐
//! │ AnchoringService │ ──────────────────▶ │ RpcRelay │ ───────────────────▶ │ Bitcoin Core │
//! │                  │ ◀────────────────── │          │ ◀─────────────────── │              │
//! └──────────────────┘    confirmations    └──────────┘  getrawtransaction   └──────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use keel_anchor_bitcoin::{RpcConfig, RpcRelay};
//!
//! let config = RpcConfig::regtest("http://127.0.0.1:18443").with_auth("user", "password");
//! let relay = RpcRelay::new(config)?;
//! relay.check_network()?;
//! relay.watch_address(&anchoring_address)?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod config;
mod error;
mod relay;
mod rpc;

pub use config::RpcConfig;
pub use error::{BitcoinError, Result};
pub use relay::RpcRelay;
pub use rpc::BitcoinRpc;

/// Seconds a cached block height stays fresh.
pub const HEIGHT_CACHE_SECS: i64 = 10;
