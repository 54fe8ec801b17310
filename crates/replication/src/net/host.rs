use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Instant;

use super::channel::Fragment;
use super::frame::{Frame, FrameBody, MAX_DATAGRAM_SIZE};
use super::peer::{Peer, PeerId, PeerState};
use super::stats::{NetworkStats, PacketLossSimulation};
use super::{Channel, NetworkEvent};
use crate::config::TransportConfig;

const RECV_BUFFER_SIZE: usize = 2048;
/// Datagrams read per `service` call; the rest wait for the next one.
pub const MAX_DATAGRAMS_PER_SERVICE: usize = 1024;
pub const SERVER_FULL_REASON: &str = "server full";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Server { max_peers: usize },
    Client,
}

/// One bound UDP socket and the peers reached through it.
pub struct Host {
    socket: UdpSocket,
    local_addr: SocketAddr,
    role: HostRole,
    config: TransportConfig,
    peers: HashMap<PeerId, Peer>,
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    next_peer_id: u32,
    events: VecDeque<NetworkEvent>,
    stats: NetworkStats,
    loss: PacketLossSimulation,
    recv_buffer: Vec<u8>,
    recv_batch: usize,
    epoch: Instant,
    denial: Option<String>,
}

impl Host {
    pub fn bind(addr: SocketAddr, role: HostRole, config: TransportConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            role,
            config,
            peers: HashMap::new(),
            peers_by_addr: HashMap::new(),
            next_peer_id: 1,
            events: VecDeque::new(),
            stats: NetworkStats::default(),
            loss: PacketLossSimulation::default(),
            recv_buffer: vec![0u8; RECV_BUFFER_SIZE],
            recv_batch: MAX_DATAGRAMS_PER_SERVICE,
            epoch: Instant::now(),
            denial: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn role(&self) -> HostRole {
        self.role
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.loss = loss;
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats.clone();
        let connected: Vec<&Peer> = self.peers.values().filter(|p| p.is_connected()).collect();
        if !connected.is_empty() {
            let n = connected.len() as f32;
            stats.rtt_ms = connected.iter().map(|p| p.rtt().srtt()).sum::<f32>() / n;
            stats.rtt_variance = connected.iter().map(|p| p.rtt().rtt_var()).sum::<f32>() / n;
        }
        stats
    }

    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(&id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.values().filter(|p| p.is_connected()).count()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self
            .peers
            .values()
            .filter(|p| p.is_connected())
            .map(Peer::id)
            .collect();
        ids.sort();
        ids
    }

    pub fn has_peers(&self) -> bool {
        !self.peers.is_empty()
    }

    fn allocate_peer_id(&mut self) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id = self.next_peer_id.wrapping_add(1).max(1);
        id
    }

    /// Starts a handshake with `addr`. Client hosts only.
    pub fn connect(&mut self, addr: SocketAddr) -> PeerId {
        let id = self.allocate_peer_id();
        let peer = Peer::outgoing(id, addr, &self.config, Instant::now());
        self.denial = None;
        self.peers_by_addr.insert(addr, id);
        self.peers.insert(id, peer);
        log::debug!("Connecting to {} as {}", addr, id);
        id
    }

    /// Drops a peer without notifying anyone, as if it never existed.
    pub fn reset_peer(&mut self, id: PeerId) {
        if let Some(peer) = self.peers.remove(&id) {
            self.peers_by_addr.remove(&peer.addr());
        }
    }

    pub fn take_denial(&mut self) -> Option<String> {
        self.denial.take()
    }

    pub fn send(&mut self, id: PeerId, channel: Channel, reliable: bool, data: &[u8]) -> bool {
        self.peers
            .get_mut(&id)
            .is_some_and(|peer| peer.send(channel, reliable, data))
    }

    pub fn broadcast(&mut self, channel: Channel, reliable: bool, data: &[u8]) {
        for peer in self.peers.values_mut().filter(|p| p.is_connected()) {
            if !peer.send(channel, reliable, data) {
                log::warn!("Broadcast to {} rejected", peer.id());
            }
        }
    }

    pub fn disconnect_peer(&mut self, id: PeerId) -> bool {
        let Some(peer) = self.peers.get_mut(&id) else {
            return false;
        };
        if peer.state() == PeerState::Connecting {
            self.reset_peer(id);
            return true;
        }
        peer.begin_disconnect(Instant::now());
        true
    }

    pub fn disconnect_all(&mut self) {
        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.disconnect_peer(id);
        }
    }

    pub fn pop_event(&mut self) -> Option<NetworkEvent> {
        self.events.pop_front()
    }

    /// Removes the first queued `Connect` for `id`.
    pub fn take_connect_event(&mut self, id: PeerId) -> bool {
        let position = self
            .events
            .iter()
            .position(|event| matches!(event, NetworkEvent::Connect(peer) if *peer == id));
        position.and_then(|index| self.events.remove(index)).is_some()
    }

    /// Receives everything pending, runs timers, then flushes outgoing frames.
    pub fn service(&mut self) -> io::Result<()> {
        self.receive()?;
        let now = Instant::now();
        self.update(now);
        self.flush(now);
        Ok(())
    }

    fn receive(&mut self) -> io::Result<()> {
        for _ in 0..self.recv_batch {
            match self.socket.recv_from(&mut self.recv_buffer) {
                Ok((size, addr)) => {
                    self.stats.record_received(size);
                    match Frame::decode(&self.recv_buffer[..size]) {
                        Ok(frame) => self.handle_frame(addr, frame),
                        Err(err) => {
                            self.stats.malformed += 1;
                            log::debug!("Dropping malformed datagram from {}: {}", addr, err);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // A previous send hit a closed port; nothing to do with it here.
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, addr: SocketAddr, frame: Frame) {
        let now = Instant::now();
        let session = frame.header.session;

        if let FrameBody::Connect {
            client_salt,
            channel_count,
        } = frame.body
        {
            self.handle_connect(addr, client_salt, channel_count, now);
            return;
        }

        let Some(&id) = self.peers_by_addr.get(&addr) else {
            if frame.body == FrameBody::Disconnect {
                self.send_frame(addr, Frame::new(session, FrameBody::DisconnectAck));
            }
            return;
        };

        let connecting = self
            .peers
            .get(&id)
            .is_some_and(|peer| peer.state() == PeerState::Connecting);
        if connecting {
            self.handle_handshake_reply(id, session, frame.body, now);
            return;
        }

        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        if session != peer.session() {
            self.stats.malformed += 1;
            log::debug!("Dropping frame with stale session from {}", addr);
            return;
        }
        peer.touch(now);

        match frame.body {
            FrameBody::Disconnect => {
                let reply = Frame::new(session, FrameBody::DisconnectAck);
                self.send_frame(addr, reply);
                log::info!("{} disconnected", id);
                self.remove_peer(id, true);
            }
            FrameBody::DisconnectAck => {
                if peer.state() == PeerState::Disconnecting {
                    self.remove_peer(id, true);
                }
            }
            FrameBody::Ping { timestamp_ms } => {
                peer.queue_control(FrameBody::Pong { timestamp_ms });
            }
            FrameBody::Pong { timestamp_ms } => {
                let now_ms = self.now_ms();
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.receive_pong(timestamp_ms, now_ms);
                }
            }
            FrameBody::Payload {
                channel,
                reliable,
                sequence,
                fragment_index,
                fragment_count,
                data,
            } => {
                let fragment = Fragment {
                    sequence,
                    index: fragment_index,
                    count: fragment_count,
                    data,
                };
                for data in peer.receive_payload(channel, reliable, fragment) {
                    self.events.push_back(NetworkEvent::Receive {
                        peer: id,
                        channel,
                        data,
                    });
                }
            }
            FrameBody::Ack {
                channel,
                cumulative,
                ack,
                ack_bitfield,
            } => {
                peer.receive_ack(channel, cumulative, ack, ack_bitfield, now);
            }
            FrameBody::Accept { .. } => {
                // Our accept was lost and the handshake resent; already connected.
            }
            FrameBody::Deny { .. } | FrameBody::Connect { .. } => {}
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, client_salt: u64, channel_count: u8, now: Instant) {
        let HostRole::Server { max_peers } = self.role else {
            return;
        };

        if let Some(&id) = self.peers_by_addr.get(&addr) {
            let same_attempt = self
                .peers
                .get(&id)
                .is_some_and(|peer| peer.client_salt() == client_salt);
            if same_attempt {
                if let Some(peer) = self.peers.get_mut(&id) {
                    peer.touch(now);
                    peer.queue_accept();
                }
                return;
            }
            log::info!("{} reconnected from {}, replacing stale session", id, addr);
            self.remove_peer(id, true);
        }

        if channel_count != self.config.channel_count {
            log::warn!(
                "Refusing {}: {} channels requested, {} configured",
                addr,
                channel_count,
                self.config.channel_count
            );
            self.deny(addr, client_salt, "channel count mismatch");
            return;
        }

        if self.peers.len() >= max_peers {
            log::warn!("Refusing {}: {}", addr, SERVER_FULL_REASON);
            self.deny(addr, client_salt, SERVER_FULL_REASON);
            return;
        }

        let id = self.allocate_peer_id();
        let peer = Peer::incoming(id, addr, client_salt, &self.config, now);
        self.peers_by_addr.insert(addr, id);
        self.peers.insert(id, peer);
        self.events.push_back(NetworkEvent::Connect(id));
        log::info!("{} connected from {}", id, addr);
    }

    fn handle_handshake_reply(&mut self, id: PeerId, session: u64, body: FrameBody, now: Instant) {
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        match body {
            FrameBody::Accept {
                server_salt,
                peer_id,
            } => {
                if peer.accept(session, server_salt, peer_id, now) {
                    log::info!("Connected to {} as remote id {}", peer.addr(), peer_id);
                    self.events.push_back(NetworkEvent::Connect(id));
                } else {
                    self.stats.malformed += 1;
                }
            }
            FrameBody::Deny { reason } => {
                if session == peer.client_salt() {
                    log::warn!("Connection to {} refused: {}", peer.addr(), reason);
                    self.denial = Some(reason);
                    self.reset_peer(id);
                }
            }
            _ => {}
        }
    }

    fn deny(&mut self, addr: SocketAddr, client_salt: u64, reason: &str) {
        let frame = Frame::new(
            client_salt,
            FrameBody::Deny {
                reason: reason.to_string(),
            },
        );
        self.send_frame(addr, frame);
    }

    fn remove_peer(&mut self, id: PeerId, notify: bool) {
        let Some(mut peer) = self.peers.remove(&id) else {
            return;
        };
        self.peers_by_addr.remove(&peer.addr());
        let was_connected = matches!(
            peer.state(),
            PeerState::Connected | PeerState::Disconnecting
        );
        peer.mark_disconnected();
        if notify && was_connected {
            self.events.push_back(NetworkEvent::Disconnect(id));
        }
    }

    fn update(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for peer in self.peers.values() {
            if peer.state() == PeerState::Disconnecting && peer.disconnect_expired(now, &self.config) {
                log::debug!("{} did not acknowledge disconnect in time", peer.id());
                expired.push(peer.id());
            } else if peer.is_timed_out(now, &self.config) {
                log::warn!("{} timed out", peer.id());
                expired.push(peer.id());
            }
        }
        for id in expired {
            self.remove_peer(id, true);
        }
    }

    fn flush(&mut self, now: Instant) {
        let now_ms = self.now_ms();
        let mut datagrams = Vec::new();
        for peer in self.peers.values_mut() {
            let outgoing = peer.poll_outgoing(now, now_ms, &self.config);
            self.stats.retransmissions += outgoing.retransmissions;
            let session = peer.header_session();
            for body in outgoing.bodies {
                datagrams.push((peer.addr(), Frame::new(session, body)));
            }
        }
        for (addr, frame) in datagrams {
            self.send_frame(addr, frame);
        }
    }

    fn send_frame(&mut self, addr: SocketAddr, frame: Frame) {
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(err) => {
                log::error!("Failed to encode frame for {}: {}", addr, err);
                return;
            }
        };
        debug_assert!(bytes.len() <= MAX_DATAGRAM_SIZE);

        if self.loss.should_drop() {
            self.stats.dropped_by_simulation += 1;
            return;
        }

        match self.socket.send_to(&bytes, addr) {
            Ok(sent) => self.stats.record_sent(sent),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                log::debug!("Send buffer full, dropping datagram to {}", addr);
            }
            Err(e) => log::warn!("Failed to send to {}: {}", addr, e),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}
