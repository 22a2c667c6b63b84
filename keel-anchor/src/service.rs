//! Async driver around [`AnchoringNode`].
//!
//! The service feeds host events into the node under its lock, then performs
//! the resulting I/O with the lock released: envelopes go to the transport
//! channel, finalized transactions go to the [`BitcoinRelay`].

use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{Transaction, Txid};
use keel_core::Hash;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{AnchorError, ErrorKind, Result};
use crate::funding::FundingUtxo;
use crate::messages::{AddFunds, AnchoringMessage, Envelope};
use crate::node::{AnchoringNode, Effects};

/// Access to the Bitcoin network.
#[async_trait]
pub trait BitcoinRelay: Send + Sync {
    /// Broadcast a transaction. Resending a known transaction succeeds.
    async fn send_transaction(&self, tx: &Transaction) -> Result<Txid>;

    /// Confirmations of `txid`: `None` if Bitcoin does not know it, `Some(0)`
    /// if it is in the mempool.
    async fn transaction_confirmations(&self, txid: &Txid) -> Result<Option<u32>>;
}

/// Events delivered by the host chain.
#[derive(Debug, Clone)]
pub enum HostEvent {
    /// A block was committed.
    Block {
        /// Block height.
        height: u64,
        /// Block hash.
        hash: Hash,
    },
    /// A new anchoring configuration was committed.
    ConfigChange {
        /// The configuration.
        config: Config,
        /// Height it takes effect.
        height: u64,
    },
    /// A validator message was delivered.
    Message(Envelope),
}

/// Runs one anchoring node.
pub struct AnchoringService {
    node: Arc<Mutex<AnchoringNode>>,
    relay: Arc<dyn BitcoinRelay>,
    outbound: mpsc::Sender<Envelope>,
}

impl AnchoringService {
    /// Create a service.
    pub fn new(
        node: Arc<Mutex<AnchoringNode>>,
        relay: Arc<dyn BitcoinRelay>,
        outbound: mpsc::Sender<Envelope>,
    ) -> Self {
        Self {
            node,
            relay,
            outbound,
        }
    }

    /// Shared handle to the node, for readers such as the API.
    pub fn node(&self) -> Arc<Mutex<AnchoringNode>> {
        Arc::clone(&self.node)
    }

    /// Apply one host event.
    pub async fn handle(&self, event: HostEvent) -> Result<()> {
        let effects = match event {
            HostEvent::Block { height, hash } => {
                let (effects, sync_due) = {
                    let mut node = self.node.lock();
                    let effects = node.on_block(height, hash)?;
                    let sync_due = node
                        .configs()
                        .current_config()
                        .map(|c| height % node.settings().sync_interval(c.anchoring_interval) == 0)
                        .unwrap_or(false);
                    (effects, sync_due)
                };
                self.dispatch(effects).await?;
                if sync_due {
                    self.sync_relay().await?;
                }
                return Ok(());
            }
            HostEvent::ConfigChange { config, height } => {
                let mut node = self.node.lock();
                node.on_config_change(config, height)?
            }
            HostEvent::Message(envelope) => {
                let confirmations = match &envelope.message {
                    AnchoringMessage::AddFunds(msg) => {
                        self.confirmations(&msg.transaction.compute_txid()).await?
                    }
                    AnchoringMessage::SignInput(_) => 0,
                };
                let mut node = self.node.lock();
                node.on_envelope(&envelope, confirmations)?
            }
        };
        self.dispatch(effects).await
    }

    /// Submit a funding transaction from this validator: apply it locally and
    /// announce it to the others.
    pub async fn submit_funds(&self, transaction: Transaction) -> Result<Vec<FundingUtxo>> {
        let confirmations = self.confirmations(&transaction.compute_txid()).await?;
        let msg = AddFunds::new(transaction);
        let (added, envelope) = {
            let mut node = self.node.lock();
            let added = node.on_add_funds(&msg, confirmations)?;
            (added, node.seal(AnchoringMessage::AddFunds(msg))?)
        };
        if let Some(envelope) = envelope {
            self.send(envelope).await?;
        }
        Ok(added)
    }

    /// Resend anchors Bitcoin has not seen.
    ///
    /// Walks back from the tip to the newest anchor Bitcoin knows, then
    /// resends every later one in chain order. Returns how many were sent.
    pub async fn sync_relay(&self) -> Result<usize> {
        let transactions: Vec<(Txid, Transaction)> = {
            let node = self.node.lock();
            node.ledger()
                .anchoring_transactions()
                .into_iter()
                .map(|(point, tx)| (point.txid, tx.clone()))
                .collect()
        };

        let mut first_unknown = transactions.len();
        for (index, (txid, _)) in transactions.iter().enumerate().rev() {
            if self.relay.transaction_confirmations(txid).await?.is_some() {
                break;
            }
            first_unknown = index;
        }

        let pending = &transactions[first_unknown..];
        for (txid, tx) in pending {
            self.relay.send_transaction(tx).await?;
            info!(%txid, "Resent anchoring transaction");
        }
        Ok(pending.len())
    }

    /// Run until `shutdown` fires or the event channel closes.
    pub async fn run(
        self,
        mut shutdown: mpsc::Receiver<()>,
        mut events: mpsc::Receiver<HostEvent>,
    ) {
        let tick = self.node.lock().settings().relay_tick();
        let mut ticker = interval(tick);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Anchoring service shutting down");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        warn!("Host event channel closed");
                        break;
                    };
                    if let Err(e) = self.handle(event).await {
                        match e.kind() {
                            ErrorKind::Signature | ErrorKind::Codec => {
                                debug!(error = %e, "Dropped anchoring message")
                            }
                            _ => warn!(error = %e, "Failed to handle host event"),
                        }
                    }
                }
                _ = ticker.tick() => {
                    match self.sync_relay().await {
                        Ok(0) => {}
                        Ok(sent) => debug!(sent, "Relay sync resent transactions"),
                        Err(e) => warn!("Relay sync failed: {}", e),
                    }
                }
            }
        }
    }

    async fn confirmations(&self, txid: &Txid) -> Result<u32> {
        Ok(self
            .relay
            .transaction_confirmations(txid)
            .await?
            .unwrap_or(0))
    }

    async fn dispatch(&self, effects: Effects) -> Result<()> {
        for envelope in effects.broadcast {
            self.send(envelope).await?;
        }
        for signed in effects.finalized {
            // the sync pass retries anything that fails here
            match self.relay.send_transaction(&signed.transaction).await {
                Ok(txid) => info!(%txid, height = signed.commitment.height, "Relayed anchoring transaction"),
                Err(e) => warn!(txid = %signed.txid, "Failed to relay anchoring transaction: {}", e),
            }
        }
        Ok(())
    }

    async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| AnchorError::Relay("outbound channel closed".into()))
    }
}
