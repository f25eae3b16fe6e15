pub mod packet;
pub mod peer;
pub mod queue;
pub mod router;
pub mod service;

pub use packet::{Packet, PacketPriority, StatusInitial, StatusUpdate, SubprotocolPacketType};
pub use peer::{PeerConfig, PeerState, PeerTable};
pub use queue::{PacketQueue, QueuedPacket};
pub use router::{PacketRouter, RouterConfig, Transport};
pub use service::{GossipConfig, GossipHandle, GossipService};
