//! Wire packets of the trellis subprotocol.
//!
//! Every packet is one RLP list behind a one-byte type tag; fixed-shape
//! packets check their exact arity on decode. Packet types fall into three
//! priority bands: votes and vote bundles preempt block dissemination, which
//! preempts status chatter and bulk sync.

use rlp::{Rlp, RlpStream};

use trellis_consensus::pbft_block::PbftBlock;
use trellis_consensus::vote::{NextVotesBundle, Vote};
use trellis_core::encoding::expect_list_size;
use trellis_core::error::TrellisError;
use trellis_core::types::{BlockHash, Level, Period, Round};
use trellis_dag::block::DagBlock;
use trellis_state::db::PeriodData;
use trellis_core::transaction::Transaction;

/// On-wire packet ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SubprotocolPacketType {
    Vote = 0x01,
    GetNextVotesSync = 0x02,
    VotesBundle = 0x03,
    DagBlock = 0x10,
    DagSync = 0x11,
    Transactions = 0x12,
    StatusInitial = 0x20,
    StatusUpdate = 0x21,
    PbftSync = 0x22,
    GetPbftSync = 0x23,
    GetDagSync = 0x24,
    PbftBlock = 0x25,
}

impl SubprotocolPacketType {
    fn from_byte(b: u8) -> Option<Self> {
        use SubprotocolPacketType::*;
        Some(match b {
            0x01 => Vote,
            0x02 => GetNextVotesSync,
            0x03 => VotesBundle,
            0x10 => DagBlock,
            0x11 => DagSync,
            0x12 => Transactions,
            0x20 => StatusInitial,
            0x21 => StatusUpdate,
            0x22 => PbftSync,
            0x23 => GetPbftSync,
            0x24 => GetDagSync,
            0x25 => PbftBlock,
            _ => return None,
        })
    }
}

/// Dispatch priority bands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketPriority {
    High = 0,
    Mid = 1,
    Low = 2,
}

/// Handshake status (11 fields).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusInitial {
    pub chain_id: u64,
    pub genesis_hash: BlockHash,
    pub node_major: u32,
    pub node_minor: u32,
    pub node_patch: u32,
    pub pbft_chain_size: Period,
    pub pbft_round: Round,
    pub dag_level: Level,
    pub syncing: bool,
    pub is_light_node: bool,
    /// How many periods of history this peer can serve.
    pub history: u64,
}

/// Periodic status (4 fields).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub pbft_chain_size: Period,
    pub pbft_round: Round,
    pub dag_level: Level,
    pub syncing: bool,
}

#[derive(Clone, Debug)]
pub enum Packet {
    Vote(Vote),
    GetNextVotesSync { period: Period, round: Round },
    VotesBundle(NextVotesBundle),
    DagBlock { block: DagBlock, transactions: Vec<Transaction> },
    DagSync { blocks: Vec<DagBlock>, transactions: Vec<Transaction> },
    Transactions(Vec<Transaction>),
    StatusInitial(StatusInitial),
    StatusUpdate(StatusUpdate),
    PbftSync { data: Box<PeriodData>, remaining: u64 },
    GetPbftSync { from_period: Period },
    GetDagSync { known_tips: Vec<BlockHash>, period: Period },
    PbftBlock(PbftBlock),
}

impl Packet {
    pub fn kind(&self) -> SubprotocolPacketType {
        match self {
            Packet::Vote(_) => SubprotocolPacketType::Vote,
            Packet::GetNextVotesSync { .. } => SubprotocolPacketType::GetNextVotesSync,
            Packet::VotesBundle(_) => SubprotocolPacketType::VotesBundle,
            Packet::DagBlock { .. } => SubprotocolPacketType::DagBlock,
            Packet::DagSync { .. } => SubprotocolPacketType::DagSync,
            Packet::Transactions(_) => SubprotocolPacketType::Transactions,
            Packet::StatusInitial(_) => SubprotocolPacketType::StatusInitial,
            Packet::StatusUpdate(_) => SubprotocolPacketType::StatusUpdate,
            Packet::PbftSync { .. } => SubprotocolPacketType::PbftSync,
            Packet::GetPbftSync { .. } => SubprotocolPacketType::GetPbftSync,
            Packet::GetDagSync { .. } => SubprotocolPacketType::GetDagSync,
            Packet::PbftBlock(_) => SubprotocolPacketType::PbftBlock,
        }
    }

    pub fn priority(&self) -> PacketPriority {
        use SubprotocolPacketType::*;
        match self.kind() {
            Vote | GetNextVotesSync | VotesBundle | PbftBlock => PacketPriority::High,
            DagBlock | DagSync | Transactions => PacketPriority::Mid,
            StatusInitial | StatusUpdate | PbftSync | GetPbftSync | GetDagSync => {
                PacketPriority::Low
            }
        }
    }

    /// Frame: type byte followed by the packet's RLP list.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![self.kind() as u8];
        let mut s = RlpStream::new();
        match self {
            Packet::Vote(vote) => {
                s.append(vote);
            }
            Packet::GetNextVotesSync { period, round } => {
                s.begin_list(2);
                s.append(period);
                s.append(round);
            }
            Packet::VotesBundle(bundle) => {
                s.append(bundle);
            }
            Packet::DagBlock {
                block,
                transactions,
            } => {
                s.begin_list(2);
                s.append(block);
                s.append_list(transactions);
            }
            Packet::DagSync {
                blocks,
                transactions,
            } => {
                s.begin_list(2);
                s.append_list(blocks);
                s.append_list(transactions);
            }
            Packet::Transactions(transactions) => {
                s.append_list(transactions);
            }
            Packet::StatusInitial(status) => {
                s.begin_list(11);
                s.append(&status.chain_id);
                s.append(&status.genesis_hash);
                s.append(&status.node_major);
                s.append(&status.node_minor);
                s.append(&status.node_patch);
                s.append(&status.pbft_chain_size);
                s.append(&status.pbft_round);
                s.append(&status.dag_level);
                s.append(&status.syncing);
                s.append(&status.is_light_node);
                s.append(&status.history);
            }
            Packet::StatusUpdate(status) => {
                s.begin_list(4);
                s.append(&status.pbft_chain_size);
                s.append(&status.pbft_round);
                s.append(&status.dag_level);
                s.append(&status.syncing);
            }
            Packet::PbftSync { data, remaining } => {
                s.begin_list(2);
                s.append(data.as_ref());
                s.append(remaining);
            }
            Packet::GetPbftSync { from_period } => {
                s.begin_list(1);
                s.append(from_period);
            }
            Packet::GetDagSync { known_tips, period } => {
                s.begin_list(2);
                s.append_list(known_tips);
                s.append(period);
            }
            Packet::PbftBlock(block) => {
                s.append(block);
            }
        }
        out.extend_from_slice(&s.out());
        out
    }

    /// Parse a frame. RLP-shape violations surface as encoding errors the
    /// peer layer treats as malicious.
    pub fn decode(bytes: &[u8]) -> Result<Packet, TrellisError> {
        let (&kind, payload) = bytes
            .split_first()
            .ok_or_else(|| TrellisError::MalformedEncoding("empty packet".into()))?;
        let kind = SubprotocolPacketType::from_byte(kind)
            .ok_or_else(|| TrellisError::MalformedEncoding(format!("unknown packet id {kind}")))?;
        let rlp = Rlp::new(payload);
        let packet = match kind {
            SubprotocolPacketType::Vote => Packet::Vote(rlp.as_val()?),
            SubprotocolPacketType::GetNextVotesSync => {
                expect_list_size(&rlp, 2)?;
                Packet::GetNextVotesSync {
                    period: rlp.val_at(0)?,
                    round: rlp.val_at(1)?,
                }
            }
            SubprotocolPacketType::VotesBundle => Packet::VotesBundle(rlp.as_val()?),
            SubprotocolPacketType::DagBlock => {
                expect_list_size(&rlp, 2)?;
                Packet::DagBlock {
                    block: rlp.val_at(0)?,
                    transactions: rlp.list_at(1)?,
                }
            }
            SubprotocolPacketType::DagSync => {
                expect_list_size(&rlp, 2)?;
                Packet::DagSync {
                    blocks: rlp.list_at(0)?,
                    transactions: rlp.list_at(1)?,
                }
            }
            SubprotocolPacketType::Transactions => Packet::Transactions(rlp.as_list()?),
            SubprotocolPacketType::StatusInitial => {
                expect_list_size(&rlp, 11)?;
                Packet::StatusInitial(StatusInitial {
                    chain_id: rlp.val_at(0)?,
                    genesis_hash: rlp.val_at(1)?,
                    node_major: rlp.val_at(2)?,
                    node_minor: rlp.val_at(3)?,
                    node_patch: rlp.val_at(4)?,
                    pbft_chain_size: rlp.val_at(5)?,
                    pbft_round: rlp.val_at(6)?,
                    dag_level: rlp.val_at(7)?,
                    syncing: rlp.val_at(8)?,
                    is_light_node: rlp.val_at(9)?,
                    history: rlp.val_at(10)?,
                })
            }
            SubprotocolPacketType::StatusUpdate => {
                expect_list_size(&rlp, 4)?;
                Packet::StatusUpdate(StatusUpdate {
                    pbft_chain_size: rlp.val_at(0)?,
                    pbft_round: rlp.val_at(1)?,
                    dag_level: rlp.val_at(2)?,
                    syncing: rlp.val_at(3)?,
                })
            }
            SubprotocolPacketType::PbftSync => {
                expect_list_size(&rlp, 2)?;
                Packet::PbftSync {
                    data: Box::new(rlp.val_at(0)?),
                    remaining: rlp.val_at(1)?,
                }
            }
            SubprotocolPacketType::GetPbftSync => {
                expect_list_size(&rlp, 1)?;
                Packet::GetPbftSync {
                    from_period: rlp.val_at(0)?,
                }
            }
            SubprotocolPacketType::GetDagSync => {
                expect_list_size(&rlp, 2)?;
                Packet::GetDagSync {
                    known_tips: rlp.list_at(0)?,
                    period: rlp.val_at(1)?,
                }
            }
            SubprotocolPacketType::PbftBlock => Packet::PbftBlock(rlp.as_val()?),
        };
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::types::H256;
    use trellis_crypto::ecdsa::KeyPair;
    use trellis_crypto::vrf::VrfKeyPair;

    #[test]
    fn vote_packet_round_trip() {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[1u8; 32]);
        let vote = Vote::signed(H256::repeat_byte(1), 1, 1, 3, &H256::zero(), &vrf, &kp);
        let packet = Packet::Vote(vote.clone());
        assert_eq!(packet.priority(), PacketPriority::High);
        match Packet::decode(&packet.encode()).unwrap() {
            Packet::Vote(back) => assert_eq!(back, vote),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn status_initial_round_trip() {
        let status = StatusInitial {
            chain_id: 77,
            genesis_hash: H256::repeat_byte(9),
            node_major: 0,
            node_minor: 1,
            node_patch: 0,
            pbft_chain_size: 42,
            pbft_round: 3,
            dag_level: 100,
            syncing: false,
            is_light_node: false,
            history: 42,
        };
        let packet = Packet::StatusInitial(status.clone());
        assert_eq!(packet.priority(), PacketPriority::Low);
        match Packet::decode(&packet.encode()).unwrap() {
            Packet::StatusInitial(back) => assert_eq!(back, status),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn arity_violation_rejected() {
        // A GetPbftSync frame with two items instead of one.
        let mut bytes = vec![SubprotocolPacketType::GetPbftSync as u8];
        let mut s = RlpStream::new_list(2);
        s.append(&1u64);
        s.append(&2u64);
        bytes.extend_from_slice(&s.out());
        assert!(matches!(
            Packet::decode(&bytes),
            Err(TrellisError::UnexpectedListSize { .. })
        ));
    }

    #[test]
    fn unknown_packet_id_rejected() {
        assert!(Packet::decode(&[0xEE, 0xC0]).is_err());
        assert!(Packet::decode(&[]).is_err());
    }

    #[test]
    fn priority_bands() {
        let update = Packet::StatusUpdate(StatusUpdate {
            pbft_chain_size: 1,
            pbft_round: 1,
            dag_level: 1,
            syncing: true,
        });
        assert_eq!(update.priority(), PacketPriority::Low);
        let txs = Packet::Transactions(vec![]);
        assert_eq!(txs.priority(), PacketPriority::Mid);
        let get_bundle = Packet::GetNextVotesSync { period: 1, round: 2 };
        assert_eq!(get_bundle.priority(), PacketPriority::High);
    }
}
