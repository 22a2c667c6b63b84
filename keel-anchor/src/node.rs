//! Per-validator anchoring node.
//!
//! The node is a synchronous event handler. Each event (a new host block, a
//! configuration change, a peer message) is applied in one call that either
//! succeeds and returns the resulting [`Effects`], or fails without touching
//! custody state. Callers serialize events behind a single lock; no I/O
//! happens in here.
//!
//! ```text
//!   on_block ──────────▶ build proposal ──▶ sign own inputs ──▶ broadcast
//!   on_sign_input ─────▶ collector ──(quorum)──▶ finalize ──▶ relay
//!   on_config_change ──▶ new epoch ──(in flight)──▶ restart
//!   on_add_funds ──────▶ ledger
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use bitcoin::secp256k1::{Secp256k1, SecretKey as BtcSecretKey};
use bitcoin::Txid;
use keel_core::{Hash, PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::chain::AnchorPoint;
use crate::config::{Config, ConfigStore};
use crate::cycle::{CycleState, Transition};
use crate::errors::{AnchorError, Result};
use crate::finalizer::{self, SignedAnchoringTx};
use crate::funding::FundingUtxo;
use crate::keys::{AnchoringKeys, EpochId};
use crate::ledger::Ledger;
use crate::messages::{AddFunds, AnchoringMessage, Envelope, SignInput};
use crate::payload::Commitment;
use crate::proposal::{anchoring_due, build_proposal, AnchoringProposal};
use crate::settings::NodeSettings;
use crate::signature::{InputProgress, InputSigner, SignatureCollector};

/// Abandoned proposals remembered after restarts.
const MAX_ABANDONED: usize = 16;

/// A validator's private keys.
#[derive(Clone)]
pub struct LocalSigner {
    service: SecretKey,
    bitcoin: BtcSecretKey,
    keys: AnchoringKeys,
}

impl LocalSigner {
    /// Pair a service key with a bitcoin key.
    pub fn new(service: SecretKey, bitcoin: BtcSecretKey) -> Self {
        let secp = Secp256k1::signing_only();
        let keys = AnchoringKeys::new(
            service.public_key(),
            bitcoin::PublicKey::new(bitcoin.public_key(&secp)),
        );
        Self {
            service,
            bitcoin,
            keys,
        }
    }

    /// The public halves, as they appear in a config.
    pub fn keys(&self) -> &AnchoringKeys {
        &self.keys
    }

    /// Sign a message for broadcast.
    pub fn seal(&self, message: AnchoringMessage) -> Result<Envelope> {
        Envelope::sign(message, &self.service)
    }
}

impl fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSigner")
            .field("service_key", &self.keys.service_key)
            .field("bitcoin_key", &self.keys.bitcoin_key)
            .finish_non_exhaustive()
    }
}

/// What the caller must do after an event.
#[derive(Debug, Default)]
pub struct Effects {
    /// Messages to send to the other validators.
    pub broadcast: Vec<Envelope>,
    /// Signed anchoring transactions to hand to the Bitcoin relay.
    pub finalized: Vec<SignedAnchoringTx>,
}

impl Effects {
    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty() && self.finalized.is_empty()
    }

    fn merge(&mut self, other: Effects) {
        self.broadcast.extend(other.broadcast);
        self.finalized.extend(other.finalized);
    }
}

/// The proposal being signed and its signatures.
#[derive(Debug, Clone)]
pub struct ActiveProposal {
    /// The unsigned transaction.
    pub proposal: AnchoringProposal,
    /// Signatures collected so far.
    pub collector: SignatureCollector,
}

/// Snapshot of the in-flight proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalStatus {
    /// Transaction id.
    pub txid: Txid,
    /// Anchored host height.
    pub height: u64,
    /// Epoch it was built under.
    pub epoch: EpochId,
    /// Fee in satoshis.
    pub fee: u64,
    /// Value carried to the next anchor.
    pub change: u64,
    /// Signature progress per input.
    pub inputs: Vec<InputProgress>,
}

/// Snapshot of a node, for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    /// Cycle state.
    pub state: CycleState,
    /// Current epoch.
    pub epoch: Option<EpochId>,
    /// Last host block seen.
    pub last_block: Option<u64>,
    /// Chain tip.
    pub latest_anchor: Option<AnchorPoint>,
    /// Number of finalized anchors.
    pub anchors: usize,
    /// Spendable funding, in satoshis.
    pub available_funds: u64,
    /// Spendable funding outputs.
    pub funding_outputs: usize,
    /// The in-flight proposal.
    pub proposal: Option<ProposalStatus>,
    /// Why the last build attempt stalled.
    pub last_stall: Option<String>,
    /// Why anchoring is halted.
    pub halted: Option<String>,
}

/// One validator's view of the anchoring protocol.
#[derive(Debug)]
pub struct AnchoringNode {
    settings: NodeSettings,
    signer: Option<LocalSigner>,
    input_signer: InputSigner,
    configs: ConfigStore,
    ledger: Ledger,
    state: CycleState,
    active: Option<ActiveProposal>,
    last_block: Option<(u64, Hash)>,
    /// Transactions this node signed, by (epoch, anchored height).
    signed: BTreeMap<(EpochId, u64), Txid>,
    /// Latest transaction each validator signed other than the active
    /// proposal.
    foreign: HashMap<PublicKey, Txid>,
    /// Proposals dropped by a restart, newest last.
    abandoned: VecDeque<Txid>,
    last_stall: Option<String>,
    halted: Option<String>,
}

impl AnchoringNode {
    /// Create a node. Without a signer the node only observes.
    pub fn new(settings: NodeSettings, signer: Option<LocalSigner>) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            signer,
            input_signer: InputSigner::new(),
            configs: ConfigStore::new(),
            ledger: Ledger::new(),
            state: CycleState::Idle,
            active: None,
            last_block: None,
            signed: BTreeMap::new(),
            foreign: HashMap::new(),
            abandoned: VecDeque::new(),
            last_stall: None,
            halted: None,
        })
    }

    /// Create a node with the genesis configuration active from height 0.
    pub fn with_genesis(
        settings: NodeSettings,
        signer: Option<LocalSigner>,
        config: Config,
    ) -> Result<Self> {
        let mut node = Self::new(settings, signer)?;
        node.configs.activate(config, 0)?;
        Ok(node)
    }

    /// Restore a node from its ledger.
    pub fn with_ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = ledger;
        self
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// A new host block was committed.
    pub fn on_block(&mut self, height: u64, hash: Hash) -> Result<Effects> {
        self.last_block = Some((height, hash));
        if self.state == CycleState::Halted {
            debug!(height, "Anchoring halted, ignoring block");
            return Ok(Effects::default());
        }
        if self.state != CycleState::Idle
            || !anchoring_due(&self.configs, self.ledger.chain(), height)
        {
            return Ok(Effects::default());
        }

        self.transition(Transition::Start)?;
        let result = self.build(Commitment::new(height, hash));
        self.check_fatal(result)
    }

    /// A new configuration was committed by the host chain at `height`.
    pub fn on_config_change(&mut self, config: Config, height: u64) -> Result<Effects> {
        self.configs.activate(config, height)?;
        if !self.state.is_active() {
            return Ok(Effects::default());
        }

        let Some(previous) = self.active.take() else {
            return Ok(Effects::default());
        };
        let txid = previous.proposal.txid();
        info!(
            %txid,
            height = previous.proposal.commitment.height,
            "Config changed, restarting anchoring proposal"
        );
        self.transition(Transition::Restart)?;
        if self.abandoned.len() == MAX_ABANDONED {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(txid);
        let result = self.build(previous.proposal.commitment);
        self.check_fatal(result)
    }

    /// A validator's signature for a proposal input.
    pub fn on_sign_input(&mut self, author: &PublicKey, msg: &SignInput) -> Result<Effects> {
        if let Some(reason) = &self.halted {
            return Err(AnchorError::Halted(reason.clone()));
        }
        if self.ledger.transaction(&msg.txid).is_some() {
            debug!(txid = %msg.txid, input = msg.input, "Signature for finalized transaction");
            return Ok(Effects::default());
        }

        let result = self.accept_signature(author, msg);
        self.check_fatal(result)
    }

    /// A funding transaction with `confirmations` on Bitcoin.
    pub fn on_add_funds(&mut self, msg: &AddFunds, confirmations: u32) -> Result<Vec<FundingUtxo>> {
        let txid = msg.transaction.compute_txid();
        let need = self.settings.funding_confirmations;
        if confirmations < need {
            return Err(AnchorError::Unconfirmed {
                txid,
                got: confirmations,
                need,
            });
        }

        let epoch = self
            .configs
            .current_epoch()
            .ok_or(AnchorError::NotConfigured)?;
        let added = self.ledger.add_funds(&msg.transaction, epoch)?;
        info!(
            %txid,
            outputs = added.len(),
            value = added.iter().map(|u| u.value).sum::<u64>(),
            epoch = epoch.id,
            "Added anchoring funds"
        );
        Ok(added)
    }

    /// An authenticated peer message. `confirmations` is the Bitcoin
    /// confirmation count of an `AddFunds` transaction, fetched beforehand.
    pub fn on_envelope(&mut self, envelope: &Envelope, confirmations: u32) -> Result<Effects> {
        let author = *envelope.verify()?;
        match &envelope.message {
            AnchoringMessage::SignInput(msg) => self.on_sign_input(&author, msg),
            AnchoringMessage::AddFunds(msg) => {
                let authorized = self
                    .configs
                    .current_epoch()
                    .map(|e| e.key_set.contains_service(&author))
                    .unwrap_or(false);
                if !authorized {
                    return Err(AnchorError::InvalidMessage(format!(
                        "add_funds from non-validator {author}"
                    )));
                }
                self.on_add_funds(msg, confirmations)?;
                Ok(Effects::default())
            }
        }
    }

    /// Clear a halt. The next due block starts a fresh proposal.
    pub fn resume(&mut self) -> Result<()> {
        self.transition(Transition::Resume)?;
        let reason = self.halted.take();
        self.active = None;
        self.foreign.clear();
        info!(reason = ?reason, "Anchoring resumed");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Local settings.
    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    /// This node's keys, if it signs.
    pub fn keys(&self) -> Option<&AnchoringKeys> {
        self.signer.as_ref().map(LocalSigner::keys)
    }

    /// Sign a message as this node.
    pub fn seal(&self, message: AnchoringMessage) -> Result<Option<Envelope>> {
        self.signer.as_ref().map(|s| s.seal(message)).transpose()
    }

    /// Epoch log.
    pub fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    /// Custody ledger.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Cycle state.
    pub fn state(&self) -> CycleState {
        self.state
    }

    /// The in-flight proposal.
    pub fn active(&self) -> Option<&ActiveProposal> {
        self.active.as_ref()
    }

    /// Last host block seen.
    pub fn last_block(&self) -> Option<(u64, Hash)> {
        self.last_block
    }

    /// Why the last build attempt stalled.
    pub fn last_stall(&self) -> Option<&str> {
        self.last_stall.as_deref()
    }

    /// Why anchoring is halted.
    pub fn halted(&self) -> Option<&str> {
        self.halted.as_deref()
    }

    /// Operator snapshot.
    pub fn status(&self) -> NodeStatus {
        let pool = self.ledger.pool();
        NodeStatus {
            state: self.state,
            epoch: self.configs.current_epoch().map(|e| e.id),
            last_block: self.last_block.map(|(h, _)| h),
            latest_anchor: self.ledger.chain().latest().copied(),
            anchors: self.ledger.chain().len(),
            available_funds: pool.total_value(),
            funding_outputs: pool.len(),
            proposal: self.active.as_ref().map(|a| ProposalStatus {
                txid: a.proposal.txid(),
                height: a.proposal.commitment.height,
                epoch: a.proposal.epoch,
                fee: a.proposal.fee,
                change: a.proposal.change_value(),
                inputs: a.collector.progress(),
            }),
            last_stall: self.last_stall.clone(),
            halted: self.halted.clone(),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn transition(&mut self, transition: Transition) -> Result<()> {
        let next = self
            .state
            .next(transition)
            .ok_or_else(|| AnchorError::InvalidTransition {
                state: self.state.to_string(),
                transition: format!("{transition:?}"),
            })?;
        debug!(from = %self.state, to = %next, ?transition, "Anchoring cycle transition");
        self.state = next;
        Ok(())
    }

    /// Halt on consistency errors; pass everything else through.
    fn check_fatal<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.kind().is_fatal() && self.transition(Transition::Halt).is_ok() {
                error!(error = %e, "Halting anchoring");
                self.halted = Some(e.to_string());
                self.active = None;
            }
        }
        result
    }

    fn build(&mut self, commitment: Commitment) -> Result<Effects> {
        let built = build_proposal(
            &self.configs,
            self.ledger.chain(),
            self.ledger.pool(),
            commitment,
        )
        .and_then(|proposal| {
            let collector = SignatureCollector::new(&proposal, &self.configs)?;
            Ok(ActiveProposal {
                proposal,
                collector,
            })
        });

        let active = match built {
            Ok(active) => active,
            Err(e) => {
                warn!(height = commitment.height, error = %e, "Anchoring proposal stalled");
                self.last_stall = Some(e.to_string());
                self.transition(Transition::Stall)?;
                return match e.kind() {
                    crate::errors::ErrorKind::Proposal => Ok(Effects::default()),
                    _ => Err(e),
                };
            }
        };

        info!(
            txid = %active.proposal.txid(),
            height = commitment.height,
            epoch = active.proposal.epoch,
            inputs = active.proposal.inputs.len(),
            fee = active.proposal.fee,
            "Built anchoring proposal"
        );
        self.last_stall = None;
        self.foreign.clear();
        self.active = Some(active);
        self.transition(Transition::Built)?;

        let broadcast = self.sign_own_inputs()?;
        let mut effects = Effects {
            broadcast,
            finalized: Vec::new(),
        };
        effects.merge(self.finalize_if_complete()?);
        Ok(effects)
    }

    fn sign_own_inputs(&mut self) -> Result<Vec<Envelope>> {
        let (Some(signer), Some(active)) = (self.signer.as_ref(), self.active.as_mut()) else {
            return Ok(Vec::new());
        };

        let txid = active.proposal.txid();
        let guard = (active.proposal.epoch, active.proposal.commitment.height);
        if let Some(signed) = self.signed.get(&guard) {
            if *signed != txid {
                return Err(AnchorError::ConflictingProposal {
                    height: guard.1,
                    signed: *signed,
                    txid,
                });
            }
        }

        let mut envelopes = Vec::new();
        for (index, input) in active.proposal.inputs.iter().enumerate() {
            let Some(authority) = active.collector.authority(index as u32) else {
                continue;
            };
            if authority.position_of(signer.keys()).is_none() {
                continue;
            }

            let input_signature = self.input_signer.sign_input(
                &active.proposal.transaction,
                index,
                authority.redeem_script(),
                input.value,
                &signer.bitcoin,
            )?;
            let msg = SignInput {
                txid,
                input: index as u32,
                input_signature,
            };
            active.collector.submit(&msg, signer.keys())?;
            envelopes.push(signer.seal(AnchoringMessage::SignInput(msg))?);
        }

        if !envelopes.is_empty() {
            self.signed.insert(guard, txid);
            debug!(%txid, inputs = envelopes.len(), "Signed own inputs");
        }
        Ok(envelopes)
    }

    fn accept_signature(&mut self, author: &PublicKey, msg: &SignInput) -> Result<Effects> {
        let Some(active) = self.active.as_mut() else {
            return Err(AnchorError::UnknownTxid(msg.txid));
        };

        let local = active.collector.txid();
        if msg.txid != local {
            if self.abandoned.contains(&msg.txid) {
                debug!(txid = %msg.txid, input = msg.input, "Signature for abandoned proposal");
                return Err(AnchorError::UnknownTxid(msg.txid));
            }
            return self.track_foreign(author, msg.txid, local);
        }
        active.collector.check_target(msg)?;

        let signer = active
            .collector
            .authority(msg.input)
            .and_then(|set| set.find_service(author))
            .or_else(|| {
                self.configs
                    .current_epoch()
                    .and_then(|e| e.key_set.find_service(author))
            })
            .cloned()
            .ok_or_else(|| AnchorError::UnauthorizedSigner {
                input: msg.input,
                signer: author.to_hex(),
            })?;

        active.collector.submit(msg, &signer)?;
        self.finalize_if_complete()
    }

    /// Count signers of a transaction other than ours; a quorum of the
    /// current key set means this node diverged.
    fn track_foreign(&mut self, author: &PublicKey, remote: Txid, local: Txid) -> Result<Effects> {
        let Some(epoch) = self.configs.current_epoch() else {
            return Err(AnchorError::UnknownTxid(remote));
        };
        if !epoch.key_set.contains_service(author) {
            return Err(AnchorError::UnknownTxid(remote));
        }

        self.foreign.insert(*author, remote);
        let signers = self
            .foreign
            .iter()
            .filter(|(key, txid)| **txid == remote && epoch.key_set.contains_service(key))
            .count();
        warn!(
            %remote,
            %local,
            signers,
            quorum = epoch.key_set.quorum(),
            "Signature for a different anchoring transaction"
        );
        if signers >= epoch.key_set.quorum() {
            return Err(AnchorError::DivergentProposal { local, remote });
        }
        Err(AnchorError::UnknownTxid(remote))
    }

    fn finalize_if_complete(&mut self) -> Result<Effects> {
        let complete = self
            .active
            .as_ref()
            .map(|a| a.collector.is_complete())
            .unwrap_or(false);
        if !complete || self.state != CycleState::AwaitingSignatures {
            return Ok(Effects::default());
        }

        self.transition(Transition::Complete)?;
        let Some(active) = self.active.take() else {
            return Ok(Effects::default());
        };
        let signed = finalizer::finalize(
            &mut self.ledger,
            &active.proposal,
            &active.collector,
            &self.configs,
        )
        .map_err(|e| {
            AnchorError::Halted(format!(
                "finalization of {} failed: {e}",
                active.proposal.txid()
            ))
        })?;
        self.transition(Transition::Finalized)?;
        self.foreign.clear();
        let anchored = signed.commitment.height;
        self.signed.retain(|(_, height), _| *height > anchored);

        Ok(Effects {
            broadcast: Vec::new(),
            finalized: vec![signed],
        })
    }
}
