//! ─── Trellis protocol constants ─────────────────────────────────────────────
//!
//! Defaults for the consensus parameters. Everything here can be overridden
//! by chain config at genesis; these are the values a plain devnet runs with.

use once_cell::sync::Lazy;

use crate::encoding::keccak256;
use crate::types::H256;

// ── Gas ──────────────────────────────────────────────────────────────────────

/// Intrinsic gas of a plain value transfer.
pub const MIN_TRANSACTION_GAS: u64 = 21_000;

/// Default per-block (per-period) gas limit.
pub const DEFAULT_BLOCK_GAS_LIMIT: u64 = 10_000_000;

// ── PBFT timing ──────────────────────────────────────────────────────────────

/// Base round-timing parameter λ in milliseconds. The nominal timeout for
/// step `s` is λ·2^min(s−1, STEP_EXPONENT_CAP).
pub const DEFAULT_LAMBDA_MS: u64 = 1_500;

/// Cap on the timeout exponent so late steps stop doubling.
pub const STEP_EXPONENT_CAP: u32 = 5;

/// Step indexes within a round.
pub const PROPOSE_STEP: u32 = 1;
pub const SOFT_STEP: u32 = 2;
pub const CERT_STEP: u32 = 3;
pub const FIRST_NEXT_STEP: u32 = 4;

// ── Sortition ────────────────────────────────────────────────────────────────

/// Expected committee weight for soft/next steps.
pub const DEFAULT_SOFT_COMMITTEE: u64 = 100;

/// Expected committee weight for the cert step (larger for safety).
pub const DEFAULT_CERT_COMMITTEE: u64 = 150;

/// Stake snapshots lag finalization by this many periods.
pub const DEFAULT_DELEGATION_DELAY: u64 = 5;

// ── VDF gate ─────────────────────────────────────────────────────────────────

/// Difficulty bounds (leading zero bits; expected work 2^difficulty hashes).
pub const DEFAULT_VDF_DIFFICULTY_MIN: u16 = 16;
pub const DEFAULT_VDF_DIFFICULTY_MAX: u16 = 21;

/// Difficulty used when the DAG tip is stale (no recent level growth).
pub const DEFAULT_VDF_DIFFICULTY_STALE: u16 = 22;

// ── DAG anchoring ────────────────────────────────────────────────────────────

/// How far the anchor tip may diverge from the pivot chain.
pub const DEFAULT_MAX_GHOST_SIZE: u64 = 10;

/// Steps the anchor walks back when the GHOST cap is exceeded.
pub const DEFAULT_GHOST_PATH_MOVE_BACK: u64 = 1;

// ── Pool ─────────────────────────────────────────────────────────────────────

/// Default pending-transaction capacity before eviction kicks in.
pub const DEFAULT_POOL_CAPACITY: usize = 100_000;

// ── Peers ────────────────────────────────────────────────────────────────────

/// Sliding window over which per-peer processing time is accounted.
pub const PEER_SUSPICION_WINDOW_SECS: u64 = 10;

/// Blacklist entries expire after this many seconds.
pub const PEER_BLACKLIST_TIMEOUT_SECS: u64 = 600;

/// Per-peer cap on packets being processed concurrently.
pub const PEER_MAX_PACKETS_IN_FLIGHT: usize = 1;

// ── Computed sentinels ───────────────────────────────────────────────────────
//
// Computed once before workers start (main calls `init_sentinels`), never
// lazily mid-consensus.

/// Keccak-256 of the empty RLP list (0xc0). Stands in for the ommers hash of
/// the Ethereum-compatible header form.
pub static EMPTY_LIST_HASH: Lazy<H256> = Lazy::new(|| keccak256(&[0xc0]));

/// Keccak-256 of the RLP null string (0x80). Root of an empty trie.
pub static EMPTY_ROOT_HASH: Lazy<H256> = Lazy::new(|| keccak256(&[0x80]));

/// Keccak-256 of the empty byte string. Code hash of a code-less account.
pub static EMPTY_CODE_HASH: Lazy<H256> = Lazy::new(|| keccak256(&[]));

/// Force evaluation of the computed sentinels. Called once at startup.
pub fn init_sentinels() {
    Lazy::force(&EMPTY_LIST_HASH);
    Lazy::force(&EMPTY_ROOT_HASH);
    Lazy::force(&EMPTY_CODE_HASH);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_values_match_ethereum() {
        assert_eq!(
            hex::encode(EMPTY_LIST_HASH.as_bytes()),
            "1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
        );
        assert_eq!(
            hex::encode(EMPTY_ROOT_HASH.as_bytes()),
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        );
        assert_eq!(
            hex::encode(EMPTY_CODE_HASH.as_bytes()),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }
}
