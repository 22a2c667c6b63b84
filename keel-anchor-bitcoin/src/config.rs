//! Bitcoin Core connection settings.

use keel_anchor::BitcoinNetwork;
use serde::{Deserialize, Serialize};

use crate::error::{BitcoinError, Result};

/// Connection settings for a Bitcoin Core node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcConfig {
    /// Base URL of bitcoind's JSON-RPC server.
    pub rpc_url: String,

    /// `rpcuser`, when the node does not use cookie auth.
    pub rpc_user: Option<String>,

    /// `rpcpassword`, paired with `rpc_user`.
    pub rpc_password: Option<String>,

    /// Network the node must be on.
    pub network: BitcoinNetwork,

    /// Wallet name, for watching the anchoring address on multi-wallet nodes.
    pub wallet: Option<String>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl RpcConfig {
    /// Settings for `rpc_url` on `network`, unauthenticated, 30s timeout.
    pub fn new(rpc_url: impl Into<String>, network: BitcoinNetwork) -> Self {
        Self {
            rpc_url: rpc_url.into(),
            rpc_user: None,
            rpc_password: None,
            network,
            wallet: None,
            timeout_secs: 30,
        }
    }

    /// Settings for a mainnet node.
    pub fn mainnet(rpc_url: impl Into<String>) -> Self {
        Self::new(rpc_url, BitcoinNetwork::Bitcoin)
    }

    /// Settings for a testnet node.
    pub fn testnet(rpc_url: impl Into<String>) -> Self {
        Self::new(rpc_url, BitcoinNetwork::Testnet)
    }

    /// Settings for a local regtest node.
    pub fn regtest(rpc_url: impl Into<String>) -> Self {
        Self::new(rpc_url, BitcoinNetwork::Regtest)
    }

    /// Use user/password auth.
    pub fn with_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.rpc_user = Some(user.into());
        self.rpc_password = Some(password.into());
        self
    }

    /// Route wallet calls to `wallet`.
    pub fn with_wallet(mut self, wallet: impl Into<String>) -> Self {
        self.wallet = Some(wallet.into());
        self
    }

    /// Override the request timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Endpoint including the wallet path, if any.
    pub fn endpoint(&self) -> String {
        match &self.wallet {
            Some(wallet) => format!("{}/wallet/{}", self.rpc_url.trim_end_matches('/'), wallet),
            None => self.rpc_url.clone(),
        }
    }

    /// Reject settings the transport cannot use.
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() {
            return Err(BitcoinError::Config("rpc_url is empty".into()));
        }
        if !self.rpc_url.starts_with("http://") && !self.rpc_url.starts_with("https://") {
            return Err(BitcoinError::Config(format!(
                "rpc_url must use http or https, got {}",
                self.rpc_url
            )));
        }
        if self.rpc_user.is_some() != self.rpc_password.is_some() {
            return Err(BitcoinError::Config(
                "rpc_user and rpc_password go together".into(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(BitcoinError::Config("timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8332", BitcoinNetwork::Bitcoin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = RpcConfig::testnet("http://localhost:18332")
            .with_auth("user", "pass")
            .with_wallet("keel")
            .with_timeout(5);

        assert_eq!(config.network, BitcoinNetwork::Testnet);
        assert_eq!(config.rpc_user, Some("user".to_string()));
        assert_eq!(config.endpoint(), "http://localhost:18332/wallet/keel");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate() {
        assert!(RpcConfig::regtest("").validate().is_err());
        assert!(RpcConfig::regtest("localhost:18443").validate().is_err());
        assert!(RpcConfig::regtest("http://localhost:18443")
            .with_timeout(0)
            .validate()
            .is_err());

        let mut half_auth = RpcConfig::regtest("http://localhost:18443");
        half_auth.rpc_user = Some("user".into());
        assert!(half_auth.validate().is_err());
    }

    #[test]
    fn test_network_serialized_as_magic() {
        let json = serde_json::to_value(RpcConfig::regtest("http://localhost:18443")).unwrap();
        assert_eq!(json["network"], 0xDAB5_BFFAu32);
    }
}
