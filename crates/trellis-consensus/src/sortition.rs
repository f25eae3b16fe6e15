//! Stake-weighted sortition.
//!
//! The VRF output, read as a fraction h ∈ [0, 1), lands in one of the
//! cumulative-distribution buckets of Binomial(stake, τ/S): the bucket index
//! is the voter's weight (number of elected sub-voters). Weight 0 means not
//! elected. Every node evaluates the identical double-precision CDF, so the
//! bucket boundaries agree network-wide.

use statrs::distribution::{Binomial, DiscreteCDF};

use trellis_core::types::{VoteWeight, VrfOutput};

/// Fraction of [0, 1) encoded by the output's first 16 bytes.
fn output_fraction(output: &VrfOutput) -> f64 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&output.0[..16]);
    u128::from_be_bytes(bytes) as f64 / (u128::MAX as f64 + 1.0)
}

/// Sortition weight for a voter with `stake` out of `total_stake`, against
/// the step threshold `tau` (the expected committee weight).
///
/// Returns the bucket j with h ∈ [CDF(j−1), CDF(j)); callers treat 0 as
/// "not elected".
pub fn sortition_weight(
    output: &VrfOutput,
    stake: VoteWeight,
    total_stake: VoteWeight,
    tau: VoteWeight,
) -> VoteWeight {
    if stake == 0 || total_stake == 0 {
        return 0;
    }
    let p = (tau as f64 / total_stake as f64).min(1.0);
    if p <= 0.0 {
        return 0;
    }
    let h = output_fraction(output);
    let binomial = match Binomial::new(p, stake) {
        Ok(b) => b,
        Err(_) => return 0,
    };
    for k in 0..=stake {
        if h < binomial.cdf(k) {
            return k;
        }
    }
    stake
}
