//! Read-only HTTP API for a Keel anchoring node.
//!
//! Operators and light clients use it to find the current anchoring address,
//! the chain of finalized anchors and the progress of the in-flight proposal.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      API Server                         │
//! │  (Axum router with CORS and tracing middleware)         │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!      ┌──────────────┬──────┴───────┬──────────────┐
//!      ▼              ▼              ▼              ▼
//! ┌──────────┐ ┌────────────┐ ┌────────────┐ ┌─────────────┐
//! │  status  │ │  config,   │ │   chain    │ │  funding,   │
//! │          │ │  address   │ │  anchors   │ │  proposal   │
//! └──────────┘ └────────────┘ └────────────┘ └─────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    ApiState                             │
//! │  (shared AnchoringNode handle)                          │
//! └─────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod rest;
pub mod server;

pub use rest::{
    AddressInfo, AnchorInfo, ApiError, ChainApi, ConfigApi, ConfigInfo, FundingApi, FundingInfo,
    KeyInfo, StatusApi, StatusResponse, UtxoInfo,
};
pub use server::{ApiConfig, ApiServer, ApiState};
