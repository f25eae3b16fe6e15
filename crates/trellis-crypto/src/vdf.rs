//! Proof-of-delay gate on DAG block production.
//!
//! The proposer searches for a nonce whose Keccak digest over
//! `challenge ‖ nonce` clears `difficulty` leading zero bits — expected work
//! 2^difficulty hashes — while verification is a single hash. The solve loop
//! polls a cancellation flag so a round change can abort it mid-search.
//!
//! Difficulty is not fixed: each proposer derives it from its VRF output
//! within `[difficulty_min, difficulty_max]`, except when the DAG tip is
//! stale, which drops the gate to `difficulty_stale` so the chain restarts
//! cheaply.

use std::sync::atomic::{AtomicBool, Ordering};

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use sha3::{Digest, Keccak256};

use trellis_core::constants::{
    DEFAULT_VDF_DIFFICULTY_MAX, DEFAULT_VDF_DIFFICULTY_MIN, DEFAULT_VDF_DIFFICULTY_STALE,
};
use trellis_core::encoding::expect_list_size;
use trellis_core::types::VrfOutput;

/// Difficulty bounds for the delay gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VdfParams {
    pub difficulty_min: u16,
    pub difficulty_max: u16,
    pub difficulty_stale: u16,
}

impl Default for VdfParams {
    fn default() -> Self {
        Self {
            difficulty_min: DEFAULT_VDF_DIFFICULTY_MIN,
            difficulty_max: DEFAULT_VDF_DIFFICULTY_MAX,
            difficulty_stale: DEFAULT_VDF_DIFFICULTY_STALE,
        }
    }
}

/// A solved delay proof: the difficulty it was solved at and the winning
/// nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct VdfProof {
    pub difficulty: u16,
    pub nonce: u64,
}

impl Encodable for VdfProof {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.difficulty);
        s.append(&self.nonce);
    }
}

impl Decodable for VdfProof {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 2)?;
        Ok(Self {
            difficulty: rlp.val_at(0)?,
            nonce: rlp.val_at(1)?,
        })
    }
}

/// Pick the difficulty for the next DAG block from the proposer's VRF
/// output. A stale tip short-circuits to the stale difficulty.
pub fn select_difficulty(vrf_output: &VrfOutput, params: &VdfParams, stale: bool) -> u16 {
    if stale {
        return params.difficulty_stale;
    }
    let range = u64::from(params.difficulty_max - params.difficulty_min) + 1;
    params.difficulty_min + (vrf_output.upper_u64() % range) as u16
}

/// Search for a proof at `difficulty`. Returns `None` if `cancel` flips
/// before a nonce is found.
pub fn solve(challenge: &[u8], difficulty: u16, cancel: &AtomicBool) -> Option<VdfProof> {
    for nonce in 0u64.. {
        if cancel.load(Ordering::Relaxed) {
            return None;
        }
        if leading_zero_bits(&delay_hash(challenge, nonce)) >= difficulty {
            return Some(VdfProof { difficulty, nonce });
        }
    }
    unreachable!("delay-gate search exhausted u64 nonce range")
}

/// Verify a proof against the challenge. `expected_difficulty` pins what the
/// proposer was required to solve; a proof declaring less is rejected.
pub fn verify_vdf(challenge: &[u8], proof: &VdfProof, expected_difficulty: u16) -> bool {
    proof.difficulty >= expected_difficulty
        && leading_zero_bits(&delay_hash(challenge, proof.nonce)) >= proof.difficulty
}

fn delay_hash(challenge: &[u8], nonce: u64) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(challenge);
    hasher.update(nonce.to_be_bytes());
    hasher.finalize().into()
}

fn leading_zero_bits(hash: &[u8; 32]) -> u16 {
    let mut count = 0u16;
    for byte in hash {
        let lz = byte.leading_zeros() as u16;
        count += lz;
        if lz < 8 {
            break;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_verify_round_trip() {
        let cancel = AtomicBool::new(false);
        let proof = solve(b"challenge", 8, &cancel).unwrap();
        assert!(verify_vdf(b"challenge", &proof, 8));
        assert!(!verify_vdf(b"other challenge", &proof, 8));
    }

    #[test]
    fn underdeclared_difficulty_rejected() {
        let cancel = AtomicBool::new(false);
        let proof = solve(b"challenge", 4, &cancel).unwrap();
        assert!(!verify_vdf(b"challenge", &proof, 8));
    }

    #[test]
    fn cancelled_solve_returns_none() {
        let cancel = AtomicBool::new(true);
        assert!(solve(b"challenge", 30, &cancel).is_none());
    }

    #[test]
    fn stale_tip_selects_stale_difficulty() {
        let params = VdfParams::default();
        let output = VrfOutput([0xFF; 64]);
        assert_eq!(
            select_difficulty(&output, &params, true),
            params.difficulty_stale
        );
    }

    #[test]
    fn selected_difficulty_within_bounds() {
        let params = VdfParams::default();
        for seed in 0u8..32 {
            let output = VrfOutput([seed; 64]);
            let d = select_difficulty(&output, &params, false);
            assert!(d >= params.difficulty_min && d <= params.difficulty_max);
        }
    }

    #[test]
    fn leading_zero_count() {
        let mut hash = [0u8; 32];
        hash[0] = 0b0000_1111;
        assert_eq!(leading_zero_bits(&hash), 4);
        hash[0] = 0;
        hash[1] = 0b0100_0000;
        assert_eq!(leading_zero_bits(&hash), 9);
    }
}
