//! libp2p gossip transport.
//!
//! A thin swarm wrapper: gossipsub for packet dissemination, Kademlia for
//! peer discovery, identify + ping for liveness. Frames on the topic carry
//! an envelope `[target, packet-bytes]`; an empty target means broadcast,
//! otherwise only the addressed peer processes the packet. Everything above
//! the envelope (validation, priority queueing, sync) lives in the router.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use futures::StreamExt;
use libp2p::{
    gossipsub, identify, kad, noise, ping, tcp, yamux,
    swarm::{NetworkBehaviour, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use rlp::{Rlp, RlpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::packet::Packet;
use crate::router::Transport;

/// Configuration for the gossip swarm.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Local listen address (e.g. "/ip4/0.0.0.0/tcp/10002").
    pub listen_addr: String,
    /// Boot-node multiaddresses.
    pub boot_nodes: Vec<String>,
    /// Protocol version string advertised to peers.
    pub protocol_version: String,
    /// GossipSub topic carrying all subprotocol packets.
    pub packet_topic: String,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/10002".into(),
            boot_nodes: Vec::new(),
            protocol_version: "/trellis/0.1.0".into(),
            packet_topic: "trellis-packets".into(),
        }
    }
}

/// Combined libp2p network behaviour.
///
/// The `#[derive(NetworkBehaviour)]` macro auto-generates a
/// `TrellisBehaviourEvent` enum with one variant per field.
#[derive(NetworkBehaviour)]
pub struct TrellisBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

enum Command {
    Publish { target: Option<PeerId>, bytes: Vec<u8> },
    Disconnect(PeerId),
}

/// Application-facing handle: implements [`Transport`] for the router and
/// exposes the inbound packet stream.
pub struct GossipHandle {
    commands: mpsc::Sender<Command>,
    pub local_peer_id: PeerId,
}

impl Transport for GossipHandle {
    fn send(&self, peer: &PeerId, packet: Packet) {
        let _ = self.commands.try_send(Command::Publish {
            target: Some(*peer),
            bytes: packet.encode(),
        });
    }

    fn broadcast(&self, packet: Packet) {
        let _ = self.commands.try_send(Command::Publish {
            target: None,
            bytes: packet.encode(),
        });
    }

    fn disconnect(&self, peer: &PeerId) {
        let _ = self.commands.try_send(Command::Disconnect(*peer));
    }
}

/// Owns the libp2p swarm. Pass to `tokio::spawn(service.run())`.
pub struct GossipService {
    swarm: Swarm<TrellisBehaviour>,
    topic: gossipsub::IdentTopic,
    commands_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<(PeerId, Vec<u8>)>,
    conn_tx: mpsc::Sender<(PeerId, bool)>,
}

impl GossipService {
    /// Build the swarm and return `(service, handle, inbound packets,
    /// connection events)`.
    #[allow(clippy::type_complexity)]
    pub fn new(
        config: &GossipConfig,
    ) -> Result<
        (
            Self,
            GossipHandle,
            mpsc::Receiver<(PeerId, Vec<u8>)>,
            mpsc::Receiver<(PeerId, bool)>,
        ),
        Box<dyn std::error::Error + Send + Sync>,
    > {
        let topic = gossipsub::IdentTopic::new(&config.packet_topic);

        let (conn_tx, conn_rx) = mpsc::channel(64);
        let mut swarm = libp2p::SwarmBuilder::with_new_identity()
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key: &libp2p::identity::Keypair| {
                let message_id_fn = |msg: &gossipsub::Message| {
                    let mut s = DefaultHasher::new();
                    msg.data.hash(&mut s);
                    gossipsub::MessageId::from(s.finish().to_string())
                };

                let gossipsub_config = gossipsub::ConfigBuilder::default()
                    .heartbeat_interval(Duration::from_secs(1))
                    .validation_mode(gossipsub::ValidationMode::Strict)
                    .message_id_fn(message_id_fn)
                    .build()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let gossipsub = gossipsub::Behaviour::new(
                    gossipsub::MessageAuthenticity::Signed(key.clone()),
                    gossipsub_config,
                )
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

                let store = kad::store::MemoryStore::new(key.public().to_peer_id());
                let kademlia = kad::Behaviour::new(key.public().to_peer_id(), store);

                let identify = identify::Behaviour::new(identify::Config::new(
                    config.protocol_version.clone(),
                    key.public(),
                ));

                let ping = ping::Behaviour::default();

                Ok(TrellisBehaviour {
                    gossipsub,
                    kademlia,
                    identify,
                    ping,
                })
            })?
            .build();

        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;

        let listen_addr: Multiaddr = config.listen_addr.parse()?;
        swarm.listen_on(listen_addr)?;

        for addr_str in &config.boot_nodes {
            if let Ok(addr) = addr_str.parse::<Multiaddr>() {
                if let Some(libp2p::multiaddr::Protocol::P2p(peer_id)) = addr.iter().last() {
                    swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    let _ = swarm.dial(addr.clone());
                    debug!(peer = %peer_id, "added boot node");
                }
            }
        }

        let local_peer_id = *swarm.local_peer_id();
        let (commands_tx, commands_rx) = mpsc::channel(1024);
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);

        let service = GossipService {
            swarm,
            topic,
            commands_rx,
            inbound_tx,
            conn_tx,
        };
        let handle = GossipHandle {
            commands: commands_tx,
            local_peer_id,
        };
        Ok((service, handle, inbound_rx, conn_rx))
    }

    /// Drive the swarm event loop. Run in a dedicated tokio task.
    pub async fn run(mut self) {
        let local = *self.swarm.local_peer_id();
        loop {
            tokio::select! {
                maybe_cmd = self.commands_rx.recv() => {
                    match maybe_cmd {
                        Some(Command::Publish { target, bytes }) => {
                            let framed = envelope(target, &bytes);
                            if let Err(e) = self
                                .swarm
                                .behaviour_mut()
                                .gossipsub
                                .publish(self.topic.clone(), framed)
                            {
                                debug!(error = %e, "gossipsub publish failed");
                            }
                        }
                        Some(Command::Disconnect(peer)) => {
                            let _ = self.swarm.disconnect_peer_id(peer);
                        }
                        None => break,
                    }
                }

                event = self.swarm.select_next_some() => {
                    match event {
                        SwarmEvent::NewListenAddr { address, .. } => {
                            info!(addr = %address, "gossip listening on");
                        }
                        SwarmEvent::Behaviour(TrellisBehaviourEvent::Gossipsub(
                            gossipsub::Event::Message { propagation_source, message, .. },
                        )) => {
                            match open_envelope(&message.data, &local) {
                                Some(bytes) => {
                                    let source = message.source.unwrap_or(propagation_source);
                                    let _ = self.inbound_tx.send((source, bytes)).await;
                                }
                                None => {} // addressed to someone else
                            }
                        }
                        SwarmEvent::Behaviour(TrellisBehaviourEvent::Identify(
                            identify::Event::Received { peer_id, info, .. },
                        )) => {
                            for addr in info.listen_addrs {
                                self.swarm
                                    .behaviour_mut()
                                    .kademlia
                                    .add_address(&peer_id, addr);
                            }
                        }
                        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                            debug!(peer = %peer_id, "connection established");
                            let _ = self.conn_tx.send((peer_id, true)).await;
                        }
                        SwarmEvent::ConnectionClosed { peer_id, .. } => {
                            debug!(peer = %peer_id, "connection closed");
                            let _ = self.conn_tx.send((peer_id, false)).await;
                        }
                        _ => {}
                    }
                }
            }
        }
        warn!("gossip service stopped");
    }
}

/// `[target, packet-bytes]`: empty target = broadcast.
fn envelope(target: Option<PeerId>, bytes: &[u8]) -> Vec<u8> {
    let mut s = RlpStream::new_list(2);
    match target {
        Some(peer) => s.append(&peer.to_bytes()),
        None => s.append_empty_data(),
    };
    s.append(&bytes.to_vec());
    s.out().to_vec()
}

/// Returns the packet bytes if the frame is broadcast or addressed to us.
fn open_envelope(frame: &[u8], local: &PeerId) -> Option<Vec<u8>> {
    let rlp = Rlp::new(frame);
    if !rlp.is_list() || rlp.item_count().ok()? != 2 {
        return None;
    }
    let target = rlp.at(0).ok()?.data().ok()?;
    if !target.is_empty() {
        let target = PeerId::from_bytes(target).ok()?;
        if target != *local {
            return None;
        }
    }
    rlp.at(1).ok()?.as_val::<Vec<u8>>().ok()
}
