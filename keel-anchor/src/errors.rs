//! Error types for the anchoring layer.

use bitcoin::Txid;
use thiserror::Error;

/// Result type for anchoring operations.
pub type Result<T> = std::result::Result<T, AnchorError>;

/// Broad category of an [`AnchorError`], deciding how the node reacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad key set or interval; the config is rejected and never applied.
    Configuration,
    /// The proposal cannot be built this block; retried at the next one.
    Proposal,
    /// A signature message is dropped; other signers are unaffected.
    Signature,
    /// A funding submission is rejected.
    Funding,
    /// Local state disagrees with the network; the cycle halts.
    Consistency,
    /// Malformed bytes on the wire.
    Codec,
}

impl ErrorKind {
    /// Check if the node must stop anchoring until an operator intervenes.
    pub fn is_fatal(self) -> bool {
        matches!(self, ErrorKind::Consistency)
    }
}

/// Errors that can occur during anchoring operations.
#[derive(Debug, Error)]
pub enum AnchorError {
    // ========================================================================
    // Configuration
    // ========================================================================
    /// Key set has no entries.
    #[error("anchoring key set is empty")]
    EmptyKeySet,

    /// A service or bitcoin key appears twice in one key set.
    #[error("duplicate {kind} key in anchoring key set: {key}")]
    DuplicateKey {
        /// Which half of the entry repeats ("service" or "bitcoin").
        kind: &'static str,
        /// The repeated key, hex encoded.
        key: String,
    },

    /// More keys than a bare multisig script accepts.
    #[error("anchoring key set has {0} keys, at most {max} allowed", max = crate::keys::MAX_KEYS)]
    TooManyKeys(usize),

    /// Segwit scripts require compressed public keys.
    #[error("bitcoin key is not compressed: {0}")]
    UncompressedKey(String),

    /// Key set failed validation.
    #[error("invalid key set: {0}")]
    InvalidKeySet(#[source] Box<AnchorError>),

    /// Anchoring interval must be positive.
    #[error("anchoring interval must be greater than zero")]
    InvalidInterval,

    /// Fee rate above what Bitcoin Core relays by default.
    #[error("fee rate {rate} sat/vB exceeds the maximum of {max} sat/vB")]
    FeeRateTooHigh {
        /// Configured rate.
        rate: u64,
        /// Largest accepted rate.
        max: u64,
    },

    /// Unknown network magic.
    #[error("unknown bitcoin network magic: {0:#010x}")]
    UnknownNetwork(u32),

    /// Epoch activation heights must strictly increase.
    #[error("epoch activation at height {height} is not after the current activation at {current}")]
    NonMonotonicEpoch {
        /// Requested activation height.
        height: u64,
        /// Activation height of the current epoch.
        current: u64,
    },

    /// Epoch id not present in the log.
    #[error("unknown epoch: {0}")]
    UnknownEpoch(u64),

    /// No configuration is active.
    #[error("no anchoring configuration is active")]
    NotConfigured,

    /// Local node settings are invalid.
    #[error("invalid node settings: {0}")]
    InvalidSettings(String),

    // ========================================================================
    // Proposal
    // ========================================================================
    /// Available funding cannot cover the transaction.
    #[error("insufficient funds: need {need} sat, have {have} sat")]
    InsufficientFunds {
        /// Satoshis required (fee plus minimum output).
        need: u64,
        /// Satoshis available from the chain output and the pool.
        have: u64,
    },

    /// The anchor being appended does not extend the chain.
    #[error("anchor does not extend the chain: {0}")]
    NonContiguousAnchor(String),

    /// OP_RETURN payload could not be decoded.
    #[error("invalid anchoring payload: {0}")]
    InvalidPayload(String),

    // ========================================================================
    // Signature
    // ========================================================================
    /// The signature names a transaction other than the active proposal.
    #[error("signature for unknown transaction {0}")]
    UnknownTxid(Txid),

    /// Input index beyond the proposal's inputs.
    #[error("input {input} out of range, proposal has {count} inputs")]
    InputOutOfRange {
        /// Requested input index.
        input: u32,
        /// Number of inputs in the proposal.
        count: usize,
    },

    /// ECDSA verification against the sighash failed.
    #[error("signature verification failed for input {0}")]
    SignatureVerificationFailed(u32),

    /// Signer is not part of the key set authorizing the input.
    #[error("signer is not authorized for input {input}: {signer}")]
    UnauthorizedSigner {
        /// Input index.
        input: u32,
        /// The signer's service key.
        signer: String,
    },

    /// Finalization attempted before every input reached quorum.
    #[error("incomplete signatures: input {input} has {have} of {need}")]
    IncompleteSignatures {
        /// First incomplete input.
        input: u32,
        /// Signatures collected.
        have: usize,
        /// Signatures required.
        need: usize,
    },

    // ========================================================================
    // Funding
    // ========================================================================
    /// No output pays the current anchoring address.
    #[error("funding transaction {0} does not pay the anchoring address")]
    WrongRecipient(Txid),

    /// The funding output was consumed by an earlier anchor.
    #[error("funding output already spent: {0}")]
    AlreadySpent(String),

    /// Not enough Bitcoin confirmations yet.
    #[error("funding transaction {txid} has {got} confirmations, need {need}")]
    Unconfirmed {
        /// Funding transaction.
        txid: Txid,
        /// Confirmations observed.
        got: u32,
        /// Confirmations required.
        need: u32,
    },

    /// Structurally invalid funding transaction.
    #[error("invalid funding transaction: {0}")]
    InvalidFundingTransaction(String),

    // ========================================================================
    // Consistency
    // ========================================================================
    /// A quorum signed a transaction different from the local proposal.
    #[error("validators diverged: local proposal {local}, quorum signed {remote}")]
    DivergentProposal {
        /// Local proposal txid.
        local: Txid,
        /// Txid the quorum is signing.
        remote: Txid,
    },

    /// This node already signed another transaction for the same height.
    #[error("refusing to sign {txid}: already signed {signed} for height {height}")]
    ConflictingProposal {
        /// Anchored height.
        height: u64,
        /// The transaction previously signed.
        signed: Txid,
        /// The transaction now proposed.
        txid: Txid,
    },

    /// Anchoring is halted until an operator resumes it.
    #[error("anchoring halted: {0}")]
    Halted(String),

    /// An event arrived that the cycle cannot take in its current state.
    #[error("cannot apply {transition} in state {state}")]
    InvalidTransition {
        /// Current cycle state.
        state: String,
        /// Rejected transition.
        transition: String,
    },

    // ========================================================================
    // Codec
    // ========================================================================
    /// Envelope or wire message failed to decode or authenticate.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Bincode failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// Bitcoin consensus decoding failure.
    #[error("bitcoin decoding error: {0}")]
    BitcoinDecode(#[from] bitcoin::consensus::encode::Error),

    /// Sighash computation failure.
    #[error("sighash error: {0}")]
    Sighash(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] keel_core::Error),

    /// Relay or observer failure outside the core.
    #[error("relay error: {0}")]
    Relay(String),
}

impl AnchorError {
    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        use AnchorError::*;
        match self {
            EmptyKeySet
            | InvalidKeySet(_)
            | DuplicateKey { .. }
            | TooManyKeys(_)
            | UncompressedKey(_)
            | InvalidInterval
            | FeeRateTooHigh { .. }
            | UnknownNetwork(_)
            | NonMonotonicEpoch { .. }
            | UnknownEpoch(_)
            | NotConfigured
            | InvalidSettings(_) => ErrorKind::Configuration,
            InsufficientFunds { .. } | NonContiguousAnchor(_) | InvalidPayload(_) => {
                ErrorKind::Proposal
            }
            UnknownTxid(_)
            | InputOutOfRange { .. }
            | SignatureVerificationFailed(_)
            | UnauthorizedSigner { .. }
            | IncompleteSignatures { .. }
            | Sighash(_) => ErrorKind::Signature,
            WrongRecipient(_)
            | AlreadySpent(_)
            | Unconfirmed { .. }
            | InvalidFundingTransaction(_)
            | Relay(_) => ErrorKind::Funding,
            DivergentProposal { .. }
            | ConflictingProposal { .. }
            | Halted(_)
            | InvalidTransition { .. } => ErrorKind::Consistency,
            InvalidMessage(_) | Encoding(_) | BitcoinDecode(_) | Core(_) => ErrorKind::Codec,
        }
    }
}
