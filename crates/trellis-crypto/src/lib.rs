pub mod ecdsa;
pub mod vdf;
pub mod vrf;

pub use ecdsa::{recover_signer, sign_hash, KeyPair};
pub use trellis_core::encoding::keccak256;
pub use vdf::{select_difficulty, solve, verify_vdf, VdfParams, VdfProof};
pub use vrf::{proof_to_output, verify_vrf, VrfKeyPair};
