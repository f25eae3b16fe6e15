//! Canonical consensus encoding.
//!
//! Every hash that enters a block hash or vote signature is taken over the
//! length-prefixed list encoding (RLP) produced here. Encoding must be
//! bijective on the structured value: decoders reject non-minimal length
//! prefixes (the `rlp` crate raises `RlpInvalidIndirection`) and fixed-shape
//! records check their exact item count via [`expect_list_size`].

use rlp::{DecoderError, Encodable, Rlp, RlpStream};
use sha3::{Digest, Keccak256};

use crate::types::H256;

/// Keccak-256 of arbitrary bytes → 32-byte hash.
pub fn keccak256(data: &[u8]) -> H256 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    H256::from_slice(&hasher.finalize())
}

/// Keccak-256 over the RLP encoding of `value`.
pub fn rlp_keccak<T: Encodable>(value: &T) -> H256 {
    keccak256(&rlp::encode(value))
}

/// Guard for fixed-shape records: the top-level item must be a list of
/// exactly `expected` items.
pub fn expect_list_size(rlp: &Rlp, expected: usize) -> Result<(), DecoderError> {
    if !rlp.is_list() {
        return Err(DecoderError::RlpExpectedToBeList);
    }
    let got = rlp.item_count()?;
    if got != expected {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    Ok(())
}

/// Keccak-256 of the RLP list of `items`, in order. Used for the order
/// hash a PBFT block commits to.
pub fn ordered_items_hash<T: Encodable>(items: &[T]) -> H256 {
    let mut s = RlpStream::new_list(items.len());
    for item in items {
        s.append(item);
    }
    keccak256(&s.out())
}

/// Keccak-backed hasher for the index-keyed tries.
struct KeccakHasher;

impl hash_db::Hasher for KeccakHasher {
    type Out = H256;
    type StdHasher = plain_hasher::PlainHasher;
    const LENGTH: usize = 32;

    fn hash(x: &[u8]) -> Self::Out {
        keccak256(x)
    }
}

/// Root of the Merkle-Patricia trie keyed by rlp(index) → item RLP. This is
/// what a block header's transactions/receipts roots are: the empty-items
/// root equals the canonical empty-trie hash.
pub fn ordered_trie_root<T: Encodable>(items: &[T]) -> H256 {
    triehash::ordered_trie_root::<KeccakHasher, _>(items.iter().map(|item| rlp::encode(item)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_matches_known_vector() {
        // Keccak-256 of the empty string.
        let h = keccak256(b"");
        assert_eq!(
            hex::encode(h.as_bytes()),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn list_size_guard() {
        let mut s = RlpStream::new_list(2);
        s.append(&1u64).append(&2u64);
        let out = s.out();
        let rlp = Rlp::new(&out);
        assert!(expect_list_size(&rlp, 2).is_ok());
        assert!(matches!(
            expect_list_size(&rlp, 3),
            Err(DecoderError::RlpIncorrectListLen)
        ));
    }

    #[test]
    fn non_list_rejected() {
        let bytes = rlp::encode(&7u64);
        let rlp = Rlp::new(&bytes);
        assert!(matches!(
            expect_list_size(&rlp, 1),
            Err(DecoderError::RlpExpectedToBeList)
        ));
    }

    #[test]
    fn ordered_hash_is_order_sensitive() {
        let a = ordered_items_hash(&[1u64, 2u64]);
        let b = ordered_items_hash(&[2u64, 1u64]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_trie_root_is_canonical() {
        // Root of the empty trie: Keccak-256 of the RLP null string.
        let root = ordered_trie_root::<u64>(&[]);
        assert_eq!(
            hex::encode(root.as_bytes()),
            "56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421"
        );
    }

    #[test]
    fn trie_root_is_order_and_content_sensitive() {
        let a = ordered_trie_root(&[1u64, 2u64]);
        let b = ordered_trie_root(&[2u64, 1u64]);
        let c = ordered_trie_root(&[1u64, 2u64, 3u64]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        // The trie root is not the flat list hash.
        assert_ne!(a, ordered_items_hash(&[1u64, 2u64]));
    }
}
