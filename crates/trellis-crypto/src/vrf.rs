//! ECVRF-EDWARDS25519-SHA512-TAI (RFC 9381).
//!
//! Proofs are Γ ‖ c ‖ s (32 + 16 + 32 = 80 bytes); the output β is the
//! 64-byte SHA-512 digest of the cofactor-cleared Γ. `prove` is fully
//! deterministic in (secret key, message), which the sortition layer relies
//! on: one voter, one credential per (period, round, step).

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::{IsIdentity, VartimeMultiscalarMul};
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

use trellis_core::error::TrellisError;
use trellis_core::types::{VrfOutput, VrfProof, VrfPublicKey};

const SUITE: u8 = 0x03;
const DOMAIN_HASH_TO_CURVE: u8 = 0x01;
const DOMAIN_CHALLENGE: u8 = 0x02;
const DOMAIN_OUTPUT: u8 = 0x03;

/// VRF keypair: an Ed25519-style scalar plus the nonce-derivation half of
/// the expanded seed.
pub struct VrfKeyPair {
    scalar: Scalar,
    nonce_key: Zeroizing<[u8; 32]>,
    public: EdwardsPoint,
    public_bytes: [u8; 32],
}

impl VrfKeyPair {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let expanded = Sha512::digest(seed);
        let mut scalar_bytes = [0u8; 32];
        scalar_bytes.copy_from_slice(&expanded[..32]);
        scalar_bytes[0] &= 248;
        scalar_bytes[31] &= 127;
        scalar_bytes[31] |= 64;
        let scalar = Scalar::from_bytes_mod_order(scalar_bytes);

        let mut nonce_key = Zeroizing::new([0u8; 32]);
        nonce_key.copy_from_slice(&expanded[32..]);

        let public = EdwardsPoint::mul_base(&scalar);
        let public_bytes = public.compress().to_bytes();
        Self {
            scalar,
            nonce_key,
            public,
            public_bytes,
        }
    }

    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        rand::rngs::OsRng.fill_bytes(seed.as_mut());
        Self::from_seed(&seed)
    }

    pub fn public_key(&self) -> VrfPublicKey {
        VrfPublicKey(self.public_bytes)
    }

    /// Produce the proof and output for `msg`.
    pub fn prove(&self, msg: &[u8]) -> (VrfProof, VrfOutput) {
        let h = hash_to_curve(&self.public_bytes, msg);
        let h_compressed = h.compress();
        let gamma = h * self.scalar;

        // Deterministic nonce, RFC 8032 style: hash the seed suffix with the
        // curve point being signed over.
        let mut hasher = Sha512::new();
        hasher.update(self.nonce_key.as_ref());
        hasher.update(h_compressed.as_bytes());
        let mut wide = [0u8; 64];
        wide.copy_from_slice(&hasher.finalize());
        let k = Scalar::from_bytes_mod_order_wide(&wide);

        let u = EdwardsPoint::mul_base(&k);
        let v = h * k;
        let c = challenge(&self.public, &h, &gamma, &u, &v);
        let s = k + c * self.scalar;

        let mut proof = [0u8; 80];
        proof[..32].copy_from_slice(gamma.compress().as_bytes());
        proof[32..48].copy_from_slice(&c.to_bytes()[..16]);
        proof[48..].copy_from_slice(&s.to_bytes());
        let proof = VrfProof(proof);
        let output = gamma_to_output(&gamma);
        (proof, output)
    }
}

impl std::fmt::Debug for VrfKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VrfKeyPair {{ public: 0x{} }}", hex::encode(self.public_bytes))
    }
}

/// Verify `proof` against `(pk, msg)`; on success return the 64-byte output.
pub fn verify_vrf(
    pk: &VrfPublicKey,
    proof: &VrfProof,
    msg: &[u8],
) -> Result<VrfOutput, TrellisError> {
    let y = CompressedEdwardsY(pk.0)
        .decompress()
        .ok_or(TrellisError::InvalidVrfProof)?;
    if y.mul_by_cofactor().is_identity() {
        return Err(TrellisError::InvalidVrfProof);
    }

    let (gamma, c, s) = decode_proof(proof)?;
    let h = hash_to_curve(&pk.0, msg);

    // U = s·B − c·Y, V = s·H − c·Γ; a valid proof reproduces the challenge.
    let u = EdwardsPoint::vartime_double_scalar_mul_basepoint(&-c, &y, &s);
    let v = EdwardsPoint::vartime_multiscalar_mul([s, -c], [h, gamma]);
    let expected = challenge(&y, &h, &gamma, &u, &v);
    if expected != c {
        return Err(TrellisError::InvalidVrfProof);
    }
    Ok(gamma_to_output(&gamma))
}

/// Extract the output from a proof without verifying it. Only for use on
/// proofs this node produced or already verified.
pub fn proof_to_output(proof: &VrfProof) -> Result<VrfOutput, TrellisError> {
    let (gamma, _, _) = decode_proof(proof)?;
    Ok(gamma_to_output(&gamma))
}

fn decode_proof(proof: &VrfProof) -> Result<(EdwardsPoint, Scalar, Scalar), TrellisError> {
    let mut gamma_bytes = [0u8; 32];
    gamma_bytes.copy_from_slice(&proof.0[..32]);
    let gamma = CompressedEdwardsY(gamma_bytes)
        .decompress()
        .ok_or(TrellisError::InvalidVrfProof)?;

    let mut c_bytes = [0u8; 32];
    c_bytes[..16].copy_from_slice(&proof.0[32..48]);
    let c = Scalar::from_canonical_bytes(c_bytes);
    let c = Option::<Scalar>::from(c).ok_or(TrellisError::InvalidVrfProof)?;

    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&proof.0[48..]);
    let s = Option::<Scalar>::from(Scalar::from_canonical_bytes(s_bytes))
        .ok_or(TrellisError::InvalidVrfProof)?;

    Ok((gamma, c, s))
}

/// Try-and-increment hash-to-curve: the first counter whose digest
/// decompresses to a non-identity point (after cofactor clearing) wins.
fn hash_to_curve(pk_bytes: &[u8; 32], msg: &[u8]) -> EdwardsPoint {
    for ctr in 0u8..=255 {
        let mut hasher = Sha512::new();
        hasher.update([SUITE, DOMAIN_HASH_TO_CURVE]);
        hasher.update(pk_bytes);
        hasher.update(msg);
        hasher.update([ctr, 0x00]);
        let digest = hasher.finalize();
        let mut candidate = [0u8; 32];
        candidate.copy_from_slice(&digest[..32]);
        if let Some(point) = CompressedEdwardsY(candidate).decompress() {
            let cleared = point.mul_by_cofactor();
            if !cleared.is_identity() {
                return cleared;
            }
        }
    }
    unreachable!("SHA-512 cannot miss the curve 256 times in a row")
}

fn challenge(
    y: &EdwardsPoint,
    h: &EdwardsPoint,
    gamma: &EdwardsPoint,
    u: &EdwardsPoint,
    v: &EdwardsPoint,
) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update([SUITE, DOMAIN_CHALLENGE]);
    for point in [y, h, gamma, u, v] {
        hasher.update(point.compress().as_bytes());
    }
    hasher.update([0x00]);
    let digest = hasher.finalize();
    let mut c_bytes = [0u8; 32];
    c_bytes[..16].copy_from_slice(&digest[..16]);
    Scalar::from_bytes_mod_order(c_bytes)
}

fn gamma_to_output(gamma: &EdwardsPoint) -> VrfOutput {
    let mut hasher = Sha512::new();
    hasher.update([SUITE, DOMAIN_OUTPUT]);
    hasher.update(gamma.mul_by_cofactor().compress().as_bytes());
    hasher.update([0x00]);
    let mut out = [0u8; 64];
    out.copy_from_slice(&hasher.finalize());
    VrfOutput(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prove_verify_round_trip() {
        let kp = VrfKeyPair::from_seed(&[1u8; 32]);
        let (proof, output) = kp.prove(b"period 3 round 1 step 2");
        let verified = verify_vrf(&kp.public_key(), &proof, b"period 3 round 1 step 2").unwrap();
        assert_eq!(output.0.to_vec(), verified.0.to_vec());
    }

    #[test]
    fn proof_to_output_matches_prove() {
        let kp = VrfKeyPair::from_seed(&[2u8; 32]);
        let (proof, output) = kp.prove(b"msg");
        let extracted = proof_to_output(&proof).unwrap();
        assert_eq!(output.0.to_vec(), extracted.0.to_vec());
    }

    #[test]
    fn wrong_message_fails() {
        let kp = VrfKeyPair::from_seed(&[3u8; 32]);
        let (proof, _) = kp.prove(b"right");
        assert!(verify_vrf(&kp.public_key(), &proof, b"wrong").is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let kp = VrfKeyPair::from_seed(&[4u8; 32]);
        let other = VrfKeyPair::from_seed(&[5u8; 32]);
        let (proof, _) = kp.prove(b"msg");
        assert!(verify_vrf(&other.public_key(), &proof, b"msg").is_err());
    }

    #[test]
    fn prove_is_deterministic() {
        let kp = VrfKeyPair::from_seed(&[6u8; 32]);
        let (p1, o1) = kp.prove(b"msg");
        let (p2, o2) = kp.prove(b"msg");
        assert_eq!(p1.0.to_vec(), p2.0.to_vec());
        assert_eq!(o1.0.to_vec(), o2.0.to_vec());
    }

    #[test]
    fn outputs_differ_across_messages() {
        let kp = VrfKeyPair::from_seed(&[7u8; 32]);
        let (_, a) = kp.prove(b"a");
        let (_, b) = kp.prove(b"b");
        assert_ne!(a.0.to_vec(), b.0.to_vec());
    }
}
