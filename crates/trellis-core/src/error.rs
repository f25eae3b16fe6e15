use thiserror::Error;

use crate::types::{H256, Level, Period, Round, Step};

#[derive(Debug, Error)]
pub enum TrellisError {
    // ── Canonical encoding ───────────────────────────────────────────────────
    #[error("malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("unexpected list size in {context}")]
    UnexpectedListSize { context: &'static str },

    // ── Transaction validation ───────────────────────────────────────────────
    #[error("invalid signature")]
    InvalidSignature,

    #[error("signature s-value above curve order half (low-s rule)")]
    HighS,

    #[error("chain id mismatch: expected {expected}, got {got}")]
    ChainIdMismatch { expected: u64, got: u64 },

    #[error("gas limit {got} exceeds block gas limit {limit}")]
    GasLimitTooHigh { got: u64, limit: u64 },

    #[error("nonce {got} below account nonce {account}")]
    NonceTooLow { account: u64, got: u64 },

    #[error("insufficient balance: need {need}, have {have}")]
    InsufficientBalance { need: String, have: String },

    #[error("transaction pool is full")]
    PoolFull,

    // ── DAG ──────────────────────────────────────────────────────────────────
    #[error("missing parent {parent} for DAG block {block}")]
    MissingParent { block: H256, parent: H256 },

    #[error("DAG block {block} level mismatch: declared {declared}, computed {computed}")]
    LevelMismatch {
        block: H256,
        declared: Level,
        computed: Level,
    },

    #[error("invalid VDF proof on DAG block {0}")]
    InvalidVdf(H256),

    #[error("unknown DAG block: {0}")]
    UnknownDagBlock(H256),

    // ── Votes / PBFT ─────────────────────────────────────────────────────────
    #[error("invalid VRF proof in vote sortition")]
    InvalidVrfProof,

    #[error("voter has no stake at period {0}")]
    NoStake(Period),

    #[error("vote carries zero sortition weight")]
    ZeroWeight,

    #[error("equivocating vote from same voter at period {period} round {round} step {step}")]
    Equivocation {
        period: Period,
        round: Round,
        step: Step,
    },

    #[error("no next-votes bundle for period {period} round {round}")]
    MissingNextVotesBundle { period: Period, round: Round },

    // ── Period finalization ──────────────────────────────────────────────────
    #[error("order hash mismatch for period {period}: expected {expected}, computed {computed}")]
    OrderMismatch {
        period: Period,
        expected: H256,
        computed: H256,
    },

    #[error("period {got} finalized out of order (expected {expected})")]
    PeriodOutOfOrder { expected: Period, got: Period },

    #[error("execution failed: {0}")]
    Execution(String),

    // ── Network / peers ──────────────────────────────────────────────────────
    #[error("malicious peer: {0}")]
    MaliciousPeer(String),

    #[error("peer chain mismatch (chain id or genesis hash)")]
    PeerChainMismatch,

    #[error("packet queue full")]
    PacketQueueFull,

    // ── Storage ──────────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    // ── Config ───────────────────────────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),
}

impl From<rlp::DecoderError> for TrellisError {
    fn from(e: rlp::DecoderError) -> Self {
        match e {
            rlp::DecoderError::RlpIncorrectListLen => TrellisError::UnexpectedListSize {
                context: "consensus record",
            },
            other => TrellisError::MalformedEncoding(other.to_string()),
        }
    }
}
