use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use trellis_core::encoding::keccak256;
use trellis_core::error::TrellisError;
use trellis_core::transaction::{Transaction, SECP256K1_HALF_N};
use trellis_core::types::{Address, Signature, H256, U256};

/// A node/account keypair over secp256k1.
///
/// Signing is RFC6979-deterministic (no signing nonce randomness) and always
/// produces low-s signatures. The secret key wipes itself on drop.
pub struct KeyPair {
    secret: SigningKey,
    pub address: Address,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Result<Self, TrellisError> {
        let secret =
            SigningKey::from_slice(bytes).map_err(|_| TrellisError::InvalidSignature)?;
        Ok(Self::from_signing_key(secret))
    }

    fn from_signing_key(secret: SigningKey) -> Self {
        let address = address_from_verifying_key(secret.verifying_key());
        Self { secret, address }
    }

    /// Secret key bytes, wrapped so the copy wipes on drop.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes().into())
    }

    /// Sign a 32-byte message hash, producing the 65-byte r‖s‖v form.
    pub fn sign(&self, msg_hash: &H256) -> Signature {
        sign_hash(&self.secret, msg_hash)
    }

    /// Sign a transaction's unsigned hash in place.
    pub fn sign_transaction(&self, tx: &mut Transaction) {
        tx.sig = self.sign(&tx.hash());
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair {{ address: {:?} }}", self.address)
    }
}

/// Address = last 20 bytes of Keccak-256 of the uncompressed public key.
pub fn address_from_verifying_key(key: &VerifyingKey) -> Address {
    let encoded = key.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Address::from_slice(&hash.as_bytes()[12..])
}

pub fn sign_hash(secret: &SigningKey, msg_hash: &H256) -> Signature {
    let (sig, recid): (EcdsaSignature, RecoveryId) = secret
        .sign_prehash_recoverable(msg_hash.as_bytes())
        .expect("signing over a fixed-width prehash cannot fail");
    let r = H256::from_slice(&sig.r().to_bytes());
    let s = H256::from_slice(&sig.s().to_bytes());
    Signature::from_rsv(&r, &s, recid.to_byte())
}

/// Recover the signer address from a 65-byte signature over `msg_hash`.
///
/// Enforces the low-s rule: a high-s signature is rejected even when it
/// would otherwise recover.
pub fn recover_signer(sig: &Signature, msg_hash: &H256) -> Result<Address, TrellisError> {
    if sig.is_zero() {
        return Err(TrellisError::InvalidSignature);
    }
    if U256::from_big_endian(sig.s().as_bytes()) > *SECP256K1_HALF_N {
        return Err(TrellisError::HighS);
    }
    let ecdsa_sig = EcdsaSignature::from_slice(&sig.0[..64])
        .map_err(|_| TrellisError::InvalidSignature)?;
    let recid = RecoveryId::from_byte(sig.v()).ok_or(TrellisError::InvalidSignature)?;
    let key = VerifyingKey::recover_from_prehash(msg_hash.as_bytes(), &ecdsa_sig, recid)
        .map_err(|_| TrellisError::InvalidSignature)?;
    Ok(address_from_verifying_key(&key))
}

/// Recover a transaction's sender from its signature.
pub fn recover_transaction_sender(tx: &Transaction) -> Result<Address, TrellisError> {
    recover_signer(&tx.sig, &tx.hash())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_recover_round_trip() {
        let kp = KeyPair::generate();
        let msg = keccak256(b"consensus message");
        let sig = kp.sign(&msg);
        let recovered = recover_signer(&sig, &msg).unwrap();
        assert_eq!(recovered, kp.address);
    }

    #[test]
    fn signing_is_deterministic() {
        let kp = KeyPair::from_secret_bytes(&[7u8; 32]).unwrap();
        let msg = keccak256(b"rfc6979");
        assert_eq!(kp.sign(&msg).0.to_vec(), kp.sign(&msg).0.to_vec());
    }

    #[test]
    fn tampered_hash_recovers_different_address() {
        let kp = KeyPair::generate();
        let msg = keccak256(b"original");
        let sig = kp.sign(&msg);
        let other = keccak256(b"tampered");
        match recover_signer(&sig, &other) {
            Ok(addr) => assert_ne!(addr, kp.address),
            Err(_) => {} // also acceptable: recovery can fail outright
        }
    }

    #[test]
    fn zero_signature_rejected() {
        let sig = Signature::default();
        let msg = keccak256(b"msg");
        assert!(recover_signer(&sig, &msg).is_err());
    }

    #[test]
    fn transaction_sender_recovery() {
        let kp = KeyPair::generate();
        let mut tx = Transaction::new_unsigned(
            0,
            U256::from(1u64),
            21_000,
            Some(Address::repeat_byte(2)),
            U256::from(5u64),
            vec![],
            1,
        );
        kp.sign_transaction(&mut tx);
        assert_eq!(recover_transaction_sender(&tx).unwrap(), kp.address);
    }
}
