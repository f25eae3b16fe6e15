pub mod pool;

pub use pool::{AccountView, InsertResult, PoolConfig, TransactionPool};
