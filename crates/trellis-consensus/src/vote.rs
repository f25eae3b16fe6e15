use std::sync::OnceLock;

use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

use trellis_core::encoding::{expect_list_size, keccak256};
use trellis_core::error::TrellisError;
use trellis_core::types::{
    Address, BlockHash, Period, Round, Signature, Step, VrfProof, H256, NULL_BLOCK_HASH,
};
use trellis_crypto::ecdsa::{recover_signer, KeyPair};
use trellis_crypto::vrf::VrfKeyPair;

/// The sortition credential attached to every vote: which (period, round,
/// step) it elects the voter into, and the VRF proof of that election.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VrfSortition {
    pub period: Period,
    pub round: Round,
    pub step: Step,
    pub proof: VrfProof,
}

impl VrfSortition {
    /// The message the VRF proof is taken over.
    pub fn vrf_message(period: Period, round: Round, step: Step, period_hash: &H256) -> Vec<u8> {
        let mut s = RlpStream::new_list(4);
        s.append(&period);
        s.append(&round);
        s.append(&step);
        s.append(period_hash);
        s.out().to_vec()
    }

    pub fn message(&self, period_hash: &H256) -> Vec<u8> {
        Self::vrf_message(self.period, self.round, self.step, period_hash)
    }
}

/// A single PBFT vote: a target block hash (or the null sentinel), the
/// sortition credential, and the voter's signature.
#[derive(Clone, Debug)]
pub struct Vote {
    pub block_hash: BlockHash,
    pub sortition: VrfSortition,
    pub signature: Signature,

    cached_hash: OnceLock<H256>,
}

impl Vote {
    /// Build and sign a vote in one go.
    pub fn signed(
        block_hash: BlockHash,
        period: Period,
        round: Round,
        step: Step,
        period_hash: &H256,
        vrf: &VrfKeyPair,
        kp: &KeyPair,
    ) -> Self {
        let msg = VrfSortition::vrf_message(period, round, step, period_hash);
        let (proof, _) = vrf.prove(&msg);
        let mut vote = Self {
            block_hash,
            sortition: VrfSortition {
                period,
                round,
                step,
                proof,
            },
            signature: Signature::default(),
            cached_hash: OnceLock::new(),
        };
        vote.signature = kp.sign(&vote.signing_hash());
        vote
    }

    pub fn is_null_vote(&self) -> bool {
        self.block_hash == NULL_BLOCK_HASH
    }

    fn unsigned_rlp(&self) -> Vec<u8> {
        let mut s = RlpStream::new_list(5);
        s.append(&self.block_hash);
        s.append(&self.sortition.period);
        s.append(&self.sortition.round);
        s.append(&self.sortition.step);
        s.append(&self.sortition.proof);
        s.out().to_vec()
    }

    /// The message the voter signs.
    pub fn signing_hash(&self) -> H256 {
        keccak256(&self.unsigned_rlp())
    }

    /// Deduplication key: Keccak over the full vote record.
    pub fn vote_hash(&self) -> H256 {
        *self
            .cached_hash
            .get_or_init(|| keccak256(&rlp::encode(self)))
    }

    pub fn voter(&self) -> Result<Address, TrellisError> {
        recover_signer(&self.signature, &self.signing_hash())
    }
}

impl PartialEq for Vote {
    fn eq(&self, other: &Self) -> bool {
        self.block_hash == other.block_hash
            && self.sortition == other.sortition
            && self.signature == other.signature
    }
}

impl Eq for Vote {}

impl Encodable for Vote {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(6);
        s.append(&self.block_hash);
        s.append(&self.sortition.period);
        s.append(&self.sortition.round);
        s.append(&self.sortition.step);
        s.append(&self.sortition.proof);
        s.append(&self.signature);
    }
}

impl Decodable for Vote {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 6)?;
        Ok(Self {
            block_hash: rlp.val_at(0)?,
            sortition: VrfSortition {
                period: rlp.val_at(1)?,
                round: rlp.val_at(2)?,
                step: rlp.val_at(3)?,
                proof: rlp.val_at(4)?,
            },
            signature: rlp.val_at(5)?,
            cached_hash: OnceLock::new(),
        })
    }
}

/// The 2f+1 next-votes a node must present to advance a round. Peers
/// exchange these bundles during round-stall sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NextVotesBundle {
    pub period: Period,
    pub round: Round,
    /// The value the bundle converged on (may be the null sentinel).
    pub voted_value: BlockHash,
    pub votes: Vec<Vote>,
}

impl Encodable for NextVotesBundle {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(4);
        s.append(&self.period);
        s.append(&self.round);
        s.append(&self.voted_value);
        s.append_list(&self.votes);
    }
}

impl Decodable for NextVotesBundle {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        expect_list_size(rlp, 4)?;
        Ok(Self {
            period: rlp.val_at(0)?,
            round: rlp.val_at(1)?,
            voted_value: rlp.val_at(2)?,
            votes: rlp.list_at(3)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_vote_recovers_voter() {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[1u8; 32]);
        let vote = Vote::signed(H256::repeat_byte(5), 2, 1, 3, &H256::zero(), &vrf, &kp);
        assert_eq!(vote.voter().unwrap(), kp.address);
    }

    #[test]
    fn rlp_round_trip() {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[2u8; 32]);
        let vote = Vote::signed(NULL_BLOCK_HASH, 1, 2, 4, &H256::zero(), &vrf, &kp);
        assert!(vote.is_null_vote());
        let back: Vote = rlp::decode(&rlp::encode(&vote)).unwrap();
        assert_eq!(vote, back);
        assert_eq!(vote.vote_hash(), back.vote_hash());
    }

    #[test]
    fn bundle_rlp_round_trip() {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[3u8; 32]);
        let votes: Vec<Vote> = (0u8..3)
            .map(|i| {
                Vote::signed(
                    H256::repeat_byte(9),
                    1,
                    1,
                    4 + u32::from(i % 2),
                    &H256::zero(),
                    &vrf,
                    &kp,
                )
            })
            .collect();
        let bundle = NextVotesBundle {
            period: 1,
            round: 1,
            voted_value: H256::repeat_byte(9),
            votes,
        };
        let back: NextVotesBundle = rlp::decode(&rlp::encode(&bundle)).unwrap();
        assert_eq!(bundle, back);
    }

    #[test]
    fn vote_hash_differs_per_step() {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[4u8; 32]);
        let a = Vote::signed(H256::repeat_byte(1), 1, 1, 2, &H256::zero(), &vrf, &kp);
        let b = Vote::signed(H256::repeat_byte(1), 1, 1, 3, &H256::zero(), &vrf, &kp);
        assert_ne!(a.vote_hash(), b.vote_hash());
    }
}
