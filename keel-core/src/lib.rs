//! Keel Core - Fundamental types shared by the Keel anchoring crates.
//!
//! - [`crypto`] - Hashing (BLAKE3) and validator service identities (Ed25519)
//! - [`error`] - Structured errors with stable error codes
//!
//! # Example
//!
//! ```rust
//! use keel_core::crypto::SecretKey;
//!
//! let key = SecretKey::generate();
//! let sig = key.sign(b"sign input 0");
//! assert!(key.public_key().verify(b"sign input 0", &sig).is_ok());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod crypto;
pub mod error;

#[cfg(test)]
mod proptest;

pub use crypto::{hash, hash_all, Hash, PublicKey, SecretKey, Sig};
pub use error::{Error, ErrorCode, Result};
