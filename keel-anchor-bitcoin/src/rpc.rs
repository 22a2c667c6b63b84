//! Bitcoin Core RPC client wrapper.

use bitcoin::consensus::encode;
use bitcoin::{Address, Transaction, Txid};
use std::time::Duration;

use bitcoincore_rpc::jsonrpc::error::Error as JsonRpcError;
use bitcoincore_rpc::jsonrpc::simple_http::SimpleHttpTransport;
use bitcoincore_rpc::{jsonrpc, Client, RpcApi};
use parking_lot::RwLock;
use tracing::debug;

use crate::config::RpcConfig;
use crate::error::{BitcoinError, Result};
use crate::HEIGHT_CACHE_SECS;

/// `RPC_INVALID_ADDRESS_OR_KEY`: unknown transaction or address.
const RPC_NOT_FOUND: i32 = -5;

/// `RPC_VERIFY_ALREADY_IN_CHAIN`: the transaction is already mined.
const RPC_ALREADY_IN_CHAIN: i32 = -27;

/// Label for imported anchoring addresses.
const WATCH_LABEL: &str = "keel-anchoring";

/// Wrapper around the Bitcoin Core RPC client.
pub struct BitcoinRpc {
    client: Client,
    config: RpcConfig,
    /// (height, unix timestamp) of the last block count query.
    cached_height: RwLock<Option<(u64, i64)>>,
}

impl BitcoinRpc {
    /// Create a new RPC client. Does not contact the node.
    pub fn new(config: RpcConfig) -> Result<Self> {
        config.validate()?;

        let mut transport = SimpleHttpTransport::builder()
            .url(&config.endpoint())
            .map_err(|e| BitcoinError::RpcConnection(e.to_string()))?
            .timeout(Duration::from_secs(config.timeout_secs));
        if let Some(user) = &config.rpc_user {
            transport = transport.auth(user.as_str(), config.rpc_password.as_deref());
        }
        let client = Client::from_jsonrpc(jsonrpc::Client::with_transport(transport.build()));

        Ok(Self {
            client,
            config,
            cached_height: RwLock::new(None),
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Get current block count.
    pub fn get_block_count(&self) -> Result<u64> {
        Ok(self.client.get_block_count()?)
    }

    /// Get current block height, cached for a few seconds.
    pub fn get_block_height_cached(&self) -> Result<u64> {
        let now = chrono::Utc::now().timestamp();

        if let Some((height, ts)) = *self.cached_height.read() {
            if now - ts < HEIGHT_CACHE_SECS {
                return Ok(height);
            }
        }

        let height = self.get_block_count()?;
        *self.cached_height.write() = Some((height, now));
        Ok(height)
    }

    /// Fetch a transaction from the mempool, the chain, or the wallet.
    pub fn get_raw_transaction(&self, txid: &Txid) -> Result<Transaction> {
        self.client
            .get_raw_transaction(txid, None)
            .map_err(|e| BitcoinError::TxNotFound(e.to_string()))
    }

    /// Broadcast a raw transaction.
    ///
    /// A transaction the node already has in a block is reported as sent.
    pub fn send_raw_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let txid = tx.compute_txid();
        match self.client.send_raw_transaction(encode::serialize_hex(tx)) {
            Ok(sent) => Ok(sent),
            Err(e) if rpc_code(&e) == Some(RPC_ALREADY_IN_CHAIN) => {
                debug!(%txid, "Transaction already in chain");
                Ok(txid)
            }
            Err(e) => Err(BitcoinError::Broadcast(e.to_string())),
        }
    }

    /// Confirmations of a transaction.
    ///
    /// `None` if the node does not know it, `Some(0)` while it is in the
    /// mempool. Wallet transactions are consulted for nodes without
    /// `-txindex`.
    pub fn get_confirmations(&self, txid: &Txid) -> Result<Option<u32>> {
        match self.client.get_raw_transaction_info(txid, None) {
            Ok(info) => return Ok(Some(info.confirmations.unwrap_or(0))),
            Err(e) if rpc_code(&e) == Some(RPC_NOT_FOUND) => {}
            Err(e) => return Err(e.into()),
        }

        match self.client.get_transaction(txid, None) {
            // negative confirmations mark a conflicted wallet transaction
            Ok(info) => Ok(u32::try_from(info.info.confirmations).ok()),
            Err(e) if rpc_code(&e) == Some(RPC_NOT_FOUND) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Import an address into the node's wallet as watch-only, without
    /// rescanning.
    pub fn import_address(&self, address: &Address) -> Result<()> {
        self.client
            .import_address(address, Some(WATCH_LABEL), Some(false))
            .map_err(|e| BitcoinError::Wallet(e.to_string()))
    }

    /// Test connection to the node and verify its network.
    pub fn test_connection(&self) -> Result<()> {
        let info = self.client.get_blockchain_info()?;

        let expected = self.config.network.to_network();
        if info.chain != expected {
            return Err(BitcoinError::NetworkMismatch {
                expected: expected.to_string(),
                got: info.chain.to_string(),
            });
        }

        Ok(())
    }
}

impl std::fmt::Debug for BitcoinRpc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitcoinRpc")
            .field("url", &self.config.rpc_url)
            .field("network", &self.config.network)
            .finish()
    }
}

/// JSON-RPC error code carried by a node-side failure.
pub(crate) fn rpc_code(error: &bitcoincore_rpc::Error) -> Option<i32> {
    match error {
        bitcoincore_rpc::Error::JsonRpc(JsonRpcError::Rpc(rpc)) => Some(rpc.code),
        _ => None,
    }
}
