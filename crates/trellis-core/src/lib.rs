pub mod account;
pub mod constants;
pub mod encoding;
pub mod error;
pub mod header;
pub mod receipt;
pub mod transaction;
pub mod types;

pub use account::Account;
pub use constants::*;
pub use encoding::{expect_list_size, keccak256, ordered_trie_root, rlp_keccak};
pub use error::TrellisError;
pub use header::BlockHeader;
pub use receipt::{LogEntry, Receipt};
pub use transaction::Transaction;
pub use types::*;
