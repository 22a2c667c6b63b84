//! Failures of the Bitcoin Core relay.

use keel_anchor::AnchorError;
use thiserror::Error;

/// Result alias for relay calls.
pub type Result<T> = std::result::Result<T, BitcoinError>;

/// What went wrong between the validator and its Bitcoin Core node.
#[derive(Debug, Error)]
pub enum BitcoinError {
    /// The HTTP transport could not be built.
    #[error("cannot reach bitcoind: {0}")]
    RpcConnection(String),

    /// bitcoind answered with an error, or not at all.
    #[error("bitcoind rpc: {0}")]
    RpcCall(String),

    /// `sendrawtransaction` refused the anchor.
    #[error("broadcast rejected: {0}")]
    Broadcast(String),

    /// `getrawtransaction` has no such transaction.
    #[error("unknown transaction: {0}")]
    TxNotFound(String),

    /// bitcoind runs a different chain than the anchoring config.
    #[error("bitcoind is on {got}, anchoring targets {expected}")]
    NetworkMismatch {
        /// Chain named in the relay config.
        expected: String,
        /// Chain reported by `getblockchaininfo`.
        got: String,
    },

    /// The node wallet refused an import or lookup.
    #[error("wallet: {0}")]
    Wallet(String),

    /// The relay config is unusable.
    #[error("invalid relay config: {0}")]
    Config(String),
}

impl From<bitcoincore_rpc::Error> for BitcoinError {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        Self::RpcCall(e.to_string())
    }
}

// Every relay failure is a funding-side problem for the anchoring node.
impl From<BitcoinError> for AnchorError {
    fn from(e: BitcoinError) -> Self {
        AnchorError::Relay(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_anchor::ErrorKind;

    #[test]
    fn test_relay_failures_become_funding_errors() {
        let err: AnchorError = BitcoinError::Broadcast("min relay fee not met".into()).into();
        assert_eq!(err.kind(), ErrorKind::Funding);
        assert!(matches!(err, AnchorError::Relay(ref msg) if msg.contains("min relay fee")));
    }

    #[test]
    fn test_network_mismatch_message() {
        let err = BitcoinError::NetworkMismatch {
            expected: "regtest".into(),
            got: "main".into(),
        };
        assert_eq!(err.to_string(), "bitcoind is on main, anchoring targets regtest");
    }
}
