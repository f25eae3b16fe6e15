pub mod config;
pub mod engine;
pub mod pbft_block;
pub mod rewards;
pub mod sortition;
pub mod vote;
pub mod vote_manager;

pub use config::{CommitteeConfig, PbftConfig, StakeEntry, StakeTable, StakeView, StaticStakeView};
pub use engine::{ChainHead, ConsensusEvent, FinalizedPeriod, PbftEngine};
pub use rewards::{distribute_rewards, RewardsConfig, RewardsInput};
pub use pbft_block::PbftBlock;
pub use sortition::sortition_weight;
pub use vote::{NextVotesBundle, Vote, VrfSortition};
pub use vote_manager::{AddVoteResult, VoteManager};
