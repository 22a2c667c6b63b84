//! [`BitcoinRelay`] backed by Bitcoin Core.

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Address, Transaction, Txid};
use keel_anchor::BitcoinRelay;
use tracing::{debug, info};

use crate::config::RpcConfig;
use crate::error::Result;
use crate::rpc::BitcoinRpc;

/// Relays anchoring transactions through a Bitcoin Core node.
#[derive(Debug, Clone)]
pub struct RpcRelay {
    rpc: Arc<BitcoinRpc>,
}

impl RpcRelay {
    /// Create a relay without contacting the node.
    pub fn new(config: RpcConfig) -> Result<Self> {
        Ok(Self {
            rpc: Arc::new(BitcoinRpc::new(config)?),
        })
    }

    /// Create a relay and verify the node runs on the configured network.
    pub fn connect(config: RpcConfig) -> Result<Self> {
        let relay = Self::new(config)?;
        relay.check_network()?;
        Ok(relay)
    }

    /// Get the RPC client.
    pub fn rpc(&self) -> &BitcoinRpc {
        &self.rpc
    }

    /// Verify the node runs on the configured network.
    pub fn check_network(&self) -> Result<()> {
        self.rpc.test_connection()?;
        info!(network = ?self.rpc.config().network, "Connected to Bitcoin node");
        Ok(())
    }

    /// Have the node's wallet track an anchoring address, so funding and
    /// anchor confirmations resolve without `-txindex`.
    pub fn watch_address(&self, address: &Address) -> Result<()> {
        self.rpc.import_address(address)?;
        debug!(%address, "Watching anchoring address");
        Ok(())
    }

    /// Fetch a funding transaction by id.
    pub fn fetch_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.rpc.get_raw_transaction(txid)
    }
}

#[async_trait]
impl BitcoinRelay for RpcRelay {
    async fn send_transaction(&self, tx: &Transaction) -> keel_anchor::Result<Txid> {
        Ok(self.rpc.send_raw_transaction(tx)?)
    }

    async fn transaction_confirmations(&self, txid: &Txid) -> keel_anchor::Result<Option<u32>> {
        Ok(self.rpc.get_confirmations(txid)?)
    }
}
