use std::fmt;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

pub use ethereum_types::{Bloom, BloomInput, H160, H256, U256};

/// 20-byte account address: last 20 bytes of Keccak-256 of the secp256k1
/// public key.
pub type Address = H160;

/// 32-byte Keccak-256 content hash.
pub type BlockHash = H256;

/// Transaction hash (Keccak-256 of the signed RLP).
pub type TxHash = H256;

/// One finalized unit of the pivot chain.
pub type Period = u64;

/// One convergence attempt within a period.
pub type Round = u32;

/// Propose/soft/cert/next sub-phase within a round (1-indexed).
pub type Step = u32;

/// DAG block depth: 1 + max level over pivot and tips.
pub type Level = u64;

/// Gas quantities fit u64 (block gas limits are far below 2^64).
pub type GasAmount = u64;

/// Sortition weight: number of elected sub-voters.
pub type VoteWeight = u64;

/// Sentinel hash meaning "no value" (null next-vote target, genesis pivot).
pub const NULL_BLOCK_HASH: H256 = H256([0u8; 32]);

// ── Signature ─────────────────────────────────────────────────────────────────

/// 65-byte recoverable secp256k1 signature: r ‖ s ‖ v, with v ∈ {0, 1}.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Signature(pub [u8; 65]);

impl Signature {
    pub fn from_rsv(r: &H256, s: &H256, v: u8) -> Self {
        let mut out = [0u8; 65];
        out[..32].copy_from_slice(r.as_bytes());
        out[32..64].copy_from_slice(s.as_bytes());
        out[64] = v;
        Self(out)
    }

    pub fn r(&self) -> H256 {
        H256::from_slice(&self.0[..32])
    }

    pub fn s(&self) -> H256 {
        H256::from_slice(&self.0[32..64])
    }

    pub fn v(&self) -> u8 {
        self.0[64]
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl Default for Signature {
    fn default() -> Self {
        Self([0u8; 65])
    }
}

impl Encodable for Signature {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.to_vec());
    }
}

impl Decodable for Signature {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let data = rlp.data()?;
        if data.len() != 65 {
            return Err(DecoderError::Custom("signature must be 65 bytes"));
        }
        let mut out = [0u8; 65];
        out.copy_from_slice(data);
        Ok(Self(out))
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature(0x{}…)", &hex::encode(&self.0[..8]))
    }
}

// ── VRF output / proof ────────────────────────────────────────────────────────

/// 64-byte VRF output β. Interpreted as a fraction of [0, 1) by sortition.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VrfOutput(pub [u8; 64]);

impl VrfOutput {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// The output's upper 64 bits, big-endian. Used by VDF difficulty
    /// selection.
    pub fn upper_u64(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_be_bytes(b)
    }
}

impl fmt::Debug for VrfOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfOutput(0x{}…)", &hex::encode(&self.0[..8]))
    }
}

/// 80-byte VRF proof: Γ (32) ‖ c (16) ‖ s (32).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VrfProof(pub [u8; 80]);

impl VrfProof {
    pub fn as_bytes(&self) -> &[u8; 80] {
        &self.0
    }
}

impl Default for VrfProof {
    fn default() -> Self {
        Self([0u8; 80])
    }
}

impl Encodable for VrfProof {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.to_vec());
    }
}

impl Decodable for VrfProof {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let data = rlp.data()?;
        if data.len() != 80 {
            return Err(DecoderError::Custom("VRF proof must be 80 bytes"));
        }
        let mut out = [0u8; 80];
        out.copy_from_slice(data);
        Ok(Self(out))
    }
}

impl fmt::Debug for VrfProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfProof(0x{}…)", &hex::encode(&self.0[..8]))
    }
}

/// 32-byte Ed25519 VRF public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct VrfPublicKey(pub [u8; 32]);

impl Encodable for VrfPublicKey {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.append(&self.0.to_vec());
    }
}

impl Decodable for VrfPublicKey {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let data = rlp.data()?;
        if data.len() != 32 {
            return Err(DecoderError::Custom("VRF public key must be 32 bytes"));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(data);
        Ok(Self(out))
    }
}

impl fmt::Debug for VrfPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VrfPublicKey(0x{})", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_rlp_round_trip() {
        let mut raw = [0u8; 65];
        raw[0] = 0xAA;
        raw[64] = 1;
        let sig = Signature(raw);
        let bytes = rlp::encode(&sig);
        let back: Signature = rlp::decode(&bytes).unwrap();
        assert_eq!(sig, back);
    }

    #[test]
    fn short_signature_rejected() {
        let bytes = rlp::encode(&vec![0u8; 64]);
        assert!(rlp::decode::<Signature>(&bytes).is_err());
    }

    #[test]
    fn vrf_proof_rlp_round_trip() {
        let mut raw = [0u8; 80];
        raw[79] = 7;
        let proof = VrfProof(raw);
        let bytes = rlp::encode(&proof);
        let back: VrfProof = rlp::decode(&bytes).unwrap();
        assert_eq!(proof, back);
    }
}
