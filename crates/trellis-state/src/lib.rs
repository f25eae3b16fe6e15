pub mod db;
pub mod exec;
pub mod final_chain;

pub use db::{Cf, PeriodData, StateDb, WriteBatch};
pub use exec::{BlockContext, Execution, StateOverlay, TransferVm};
pub use final_chain::{FinalChain, HeadState};
