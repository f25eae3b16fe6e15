//! Bounded three-band priority queue feeding the packet worker pool.
//!
//! Packets drain high band first. Per-peer processing stays serial: a peer
//! with a packet in flight is skipped until its worker calls
//! [`PacketQueue::complete`], so cross-peer work parallelizes while one
//! slow peer cannot occupy more than its slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use libp2p::PeerId;
use tokio::sync::Notify;

use trellis_core::constants::PEER_MAX_PACKETS_IN_FLIGHT;
use trellis_core::error::TrellisError;

use crate::packet::Packet;

#[derive(Debug)]
pub struct QueuedPacket {
    pub peer: PeerId,
    pub packet: Packet,
}

#[derive(Default)]
struct QueueInner {
    bands: [VecDeque<QueuedPacket>; 3],
    in_flight: HashMap<PeerId, usize>,
    len: usize,
}

pub struct PacketQueue {
    capacity: usize,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl PacketQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("packet queue lock").len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a packet in its priority band.
    pub fn push(&self, peer: PeerId, packet: Packet) -> Result<(), TrellisError> {
        {
            let mut inner = self.inner.lock().expect("packet queue lock");
            if inner.len >= self.capacity {
                return Err(TrellisError::PacketQueueFull);
            }
            let band = packet.priority() as usize;
            inner.bands[band].push_back(QueuedPacket { peer, packet });
            inner.len += 1;
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
        Ok(())
    }

    /// Take the next dispatchable packet: highest band first, skipping peers
    /// already at their in-flight cap. Waits when nothing is dispatchable.
    pub async fn pop(&self) -> QueuedPacket {
        loop {
            {
                let mut inner = self.inner.lock().expect("packet queue lock");
                let mut found: Option<(usize, usize)> = None;
                'bands: for (band_idx, band) in inner.bands.iter().enumerate() {
                    for (pos, queued) in band.iter().enumerate() {
                        let busy = inner
                            .in_flight
                            .get(&queued.peer)
                            .copied()
                            .unwrap_or(0);
                        if busy < PEER_MAX_PACKETS_IN_FLIGHT {
                            found = Some((band_idx, pos));
                            break 'bands;
                        }
                    }
                }
                if let Some((band_idx, pos)) = found {
                    let queued = inner.bands[band_idx].remove(pos).expect("indexed packet");
                    inner.len -= 1;
                    *inner.in_flight.entry(queued.peer).or_insert(0) += 1;
                    return queued;
                }
            }
            self.notify.notified().await;
        }
    }

    /// A worker finished a packet from `peer`; its next packet becomes
    /// dispatchable.
    pub fn complete(&self, peer: &PeerId) {
        {
            let mut inner = self.inner.lock().expect("packet queue lock");
            if let Some(count) = inner.in_flight.get_mut(peer) {
                *count -= 1;
                if *count == 0 {
                    inner.in_flight.remove(peer);
                }
            }
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Packet, StatusUpdate};
    use trellis_core::types::H256;
    use trellis_crypto::ecdsa::KeyPair;
    use trellis_crypto::vrf::VrfKeyPair;
    use trellis_consensus::vote::Vote;

    fn low_packet() -> Packet {
        Packet::StatusUpdate(StatusUpdate {
            pbft_chain_size: 1,
            pbft_round: 1,
            dag_level: 1,
            syncing: false,
        })
    }

    fn high_packet() -> Packet {
        let kp = KeyPair::generate();
        let vrf = VrfKeyPair::from_seed(&[1u8; 32]);
        Packet::Vote(Vote::signed(
            H256::repeat_byte(1),
            1,
            1,
            3,
            &H256::zero(),
            &vrf,
            &kp,
        ))
    }

    #[tokio::test]
    async fn high_band_preempts_low() {
        let queue = PacketQueue::new(8);
        let a = PeerId::random();
        let b = PeerId::random();
        queue.push(a, low_packet()).unwrap();
        queue.push(b, high_packet()).unwrap();
        let first = queue.pop().await;
        assert_eq!(first.peer, b, "vote drains before status");
    }

    #[tokio::test]
    async fn per_peer_processing_is_serial() {
        let queue = PacketQueue::new(8);
        let a = PeerId::random();
        let b = PeerId::random();
        queue.push(a, low_packet()).unwrap();
        queue.push(a, low_packet()).unwrap();
        queue.push(b, low_packet()).unwrap();

        let first = queue.pop().await;
        assert_eq!(first.peer, a);
        // a has one in flight: its second packet must wait, b's goes next.
        let second = queue.pop().await;
        assert_eq!(second.peer, b);
        queue.complete(&a);
        let third = queue.pop().await;
        assert_eq!(third.peer, a);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let queue = PacketQueue::new(2);
        let a = PeerId::random();
        queue.push(a, low_packet()).unwrap();
        queue.push(a, low_packet()).unwrap();
        assert!(matches!(
            queue.push(a, low_packet()),
            Err(TrellisError::PacketQueueFull)
        ));
    }
}
