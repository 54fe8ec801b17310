use std::collections::VecDeque;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::Channel;
use super::channel::{Fragment, ReliableReceiver, ReliableSender, UnreliableChannel};
use super::frame::{FrameBody, MAX_FRAGMENT_SIZE};
use super::tracking::RttEstimator;
use crate::config::TransportConfig;

/// Transport-assigned connection id. Never reused within one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer {}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug)]
struct ChannelState {
    reliable_tx: ReliableSender,
    reliable_rx: ReliableReceiver,
    unreliable: UnreliableChannel,
}

impl ChannelState {
    fn new(window: usize) -> Self {
        Self {
            reliable_tx: ReliableSender::new(window),
            reliable_rx: ReliableReceiver::new(window),
            unreliable: UnreliableChannel::default(),
        }
    }
}

/// Frames one `poll_outgoing` produced, and how many were retransmissions.
#[derive(Debug, Default)]
pub struct Outgoing {
    pub bodies: Vec<FrameBody>,
    pub retransmissions: u64,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    addr: SocketAddr,
    state: PeerState,
    client_salt: u64,
    server_salt: u64,
    remote_id: Option<u32>,
    channels: Vec<ChannelState>,
    control_out: VecDeque<FrameBody>,
    unreliable_out: VecDeque<FrameBody>,
    rtt: RttEstimator,
    last_receive: Instant,
    last_send: Instant,
    last_retry: Instant,
    disconnect_started: Option<Instant>,
}

impl Peer {
    /// Client side: a peer slot waiting for the server's accept.
    pub fn outgoing(id: PeerId, addr: SocketAddr, config: &TransportConfig, now: Instant) -> Self {
        let client_salt = rand::random::<u64>();
        let mut peer = Self::with_state(id, addr, PeerState::Connecting, client_salt, 0, config, now);
        peer.control_out.push_back(FrameBody::Connect {
            client_salt,
            channel_count: config.channel_count,
        });
        peer
    }

    /// Server side: an accepted peer. The accept is queued for the next flush.
    pub fn incoming(
        id: PeerId,
        addr: SocketAddr,
        client_salt: u64,
        config: &TransportConfig,
        now: Instant,
    ) -> Self {
        let server_salt = rand::random::<u64>();
        let mut peer = Self::with_state(
            id,
            addr,
            PeerState::Connected,
            client_salt,
            server_salt,
            config,
            now,
        );
        peer.queue_accept();
        peer
    }

    fn with_state(
        id: PeerId,
        addr: SocketAddr,
        state: PeerState,
        client_salt: u64,
        server_salt: u64,
        config: &TransportConfig,
        now: Instant,
    ) -> Self {
        Self {
            id,
            addr,
            state,
            client_salt,
            server_salt,
            remote_id: None,
            channels: (0..config.channel_count)
                .map(|_| ChannelState::new(config.reliable_window))
                .collect(),
            control_out: VecDeque::new(),
            unreliable_out: VecDeque::new(),
            rtt: RttEstimator::new(),
            last_receive: now,
            last_send: now,
            last_retry: now,
            disconnect_started: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerState::Connected
    }

    pub fn client_salt(&self) -> u64 {
        self.client_salt
    }

    /// The id the server assigned to this connection, as seen by a client.
    pub fn remote_id(&self) -> Option<u32> {
        self.remote_id
    }

    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Session key once both salts are known.
    pub fn session(&self) -> u64 {
        self.client_salt ^ self.server_salt
    }

    /// Key stamped on outgoing frames.
    pub fn header_session(&self) -> u64 {
        match self.state {
            PeerState::Connecting => self.client_salt,
            _ => self.session(),
        }
    }

    pub fn queue_accept(&mut self) {
        self.control_out.push_back(FrameBody::Accept {
            server_salt: self.server_salt,
            peer_id: self.id.0,
        });
    }

    pub fn queue_control(&mut self, body: FrameBody) {
        self.control_out.push_back(body);
    }

    /// Completes the client handshake. Returns false if the accept does not
    /// belong to this attempt.
    pub fn accept(&mut self, session: u64, server_salt: u64, remote_id: u32, now: Instant) -> bool {
        if self.state != PeerState::Connecting || session != self.client_salt ^ server_salt {
            return false;
        }
        self.server_salt = server_salt;
        self.remote_id = Some(remote_id);
        self.state = PeerState::Connected;
        self.touch(now);
        true
    }

    pub fn begin_disconnect(&mut self, now: Instant) {
        if matches!(self.state, PeerState::Disconnecting | PeerState::Disconnected) {
            return;
        }
        self.state = PeerState::Disconnecting;
        self.disconnect_started = Some(now);
        self.last_retry = now;
        self.unreliable_out.clear();
        self.control_out.push_back(FrameBody::Disconnect);
    }

    pub fn mark_disconnected(&mut self) {
        self.state = PeerState::Disconnected;
    }

    pub fn disconnect_expired(&self, now: Instant, config: &TransportConfig) -> bool {
        self.disconnect_started
            .is_some_and(|started| now.duration_since(started) >= config.disconnect_grace())
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_receive = now;
    }

    pub fn is_timed_out(&self, now: Instant, config: &TransportConfig) -> bool {
        now.duration_since(self.last_receive) > config.peer_timeout()
    }

    /// Queues application data. False if the peer cannot take it.
    pub fn send(&mut self, channel: Channel, reliable: bool, data: &[u8]) -> bool {
        if self.state != PeerState::Connected {
            return false;
        }
        let Some(state) = self.channels.get_mut(usize::from(channel)) else {
            return false;
        };

        if reliable {
            return state.reliable_tx.push(data);
        }

        if data.len() > MAX_FRAGMENT_SIZE {
            return false;
        }
        let sequence = state.unreliable.next_sequence();
        self.unreliable_out.push_back(FrameBody::Payload {
            channel,
            reliable: false,
            sequence,
            fragment_index: 0,
            fragment_count: 1,
            data: data.to_vec(),
        });
        true
    }

    /// Returns messages that became deliverable on `channel`.
    pub fn receive_payload(
        &mut self,
        channel: Channel,
        reliable: bool,
        fragment: Fragment,
    ) -> Vec<Vec<u8>> {
        if self.state != PeerState::Connected {
            return Vec::new();
        }
        let Some(state) = self.channels.get_mut(usize::from(channel)) else {
            log::debug!("{} sent on unknown channel {}", self.id, channel);
            return Vec::new();
        };

        if reliable {
            return state.reliable_rx.receive(fragment);
        }

        if fragment.count != 1 || !state.unreliable.accept(fragment.sequence) {
            return Vec::new();
        }
        vec![fragment.data]
    }

    /// Returns how many frames the ack released.
    pub fn receive_ack(
        &mut self,
        channel: Channel,
        cumulative: u32,
        ack: u32,
        ack_bitfield: u32,
        now: Instant,
    ) -> usize {
        let Some(state) = self.channels.get_mut(usize::from(channel)) else {
            return 0;
        };
        let outcome = state.reliable_tx.on_ack(cumulative, ack, ack_bitfield, now);
        for sample in outcome.rtt_samples_ms {
            self.rtt.update(sample);
        }
        outcome.acknowledged
    }

    pub fn receive_pong(&mut self, timestamp_ms: u64, now_ms: u64) {
        self.rtt.update(now_ms.saturating_sub(timestamp_ms) as f32);
    }

    /// True once every reliable frame has been acknowledged.
    pub fn is_drained(&self) -> bool {
        self.channels.iter().all(|state| state.reliable_tx.is_idle())
    }

    pub fn poll_outgoing(&mut self, now: Instant, now_ms: u64, config: &TransportConfig) -> Outgoing {
        let mut out = Outgoing::default();
        out.bodies.extend(self.control_out.drain(..));

        match self.state {
            PeerState::Connecting => {
                if now.duration_since(self.last_retry) >= config.connect_retry() {
                    self.last_retry = now;
                    out.bodies.push(FrameBody::Connect {
                        client_salt: self.client_salt,
                        channel_count: config.channel_count,
                    });
                }
            }
            PeerState::Disconnecting => {
                if now.duration_since(self.last_retry) >= config.connect_retry() {
                    self.last_retry = now;
                    out.bodies.push(FrameBody::Disconnect);
                }
            }
            PeerState::Connected => {
                let rto = self.rtt.rto(config.min_rto(), config.max_rto());
                for (index, state) in self.channels.iter_mut().enumerate() {
                    let channel = index as Channel;
                    if let Some((cumulative, ack, ack_bitfield)) = state.reliable_rx.take_ack() {
                        out.bodies.push(FrameBody::Ack {
                            channel,
                            cumulative,
                            ack,
                            ack_bitfield,
                        });
                    }
                    for (fragment, retransmit) in
                        state.reliable_tx.poll_transmit(now, rto, config.max_rto())
                    {
                        if retransmit {
                            out.retransmissions += 1;
                        }
                        out.bodies.push(FrameBody::Payload {
                            channel,
                            reliable: true,
                            sequence: fragment.sequence,
                            fragment_index: fragment.index,
                            fragment_count: fragment.count,
                            data: fragment.data,
                        });
                    }
                }
                out.bodies.extend(self.unreliable_out.drain(..));

                if out.bodies.is_empty()
                    && now.duration_since(self.last_send) >= config.ping_interval()
                {
                    out.bodies.push(FrameBody::Ping {
                        timestamp_ms: now_ms,
                    });
                }
            }
            PeerState::Disconnected => {}
        }

        if !out.bodies.is_empty() {
            self.last_send = now;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:7777".parse().unwrap()
    }

    #[test]
    fn outgoing_peer_queues_connect() {
        let config = TransportConfig::default();
        let now = Instant::now();
        let mut peer = Peer::outgoing(PeerId(1), addr(), &config, now);

        assert_eq!(peer.state(), PeerState::Connecting);
        assert_eq!(peer.header_session(), peer.client_salt());

        let out = peer.poll_outgoing(now, 0, &config);
        assert!(matches!(out.bodies.as_slice(), [FrameBody::Connect { .. }]));

        // Retried after the retry interval.
        let later = now + config.connect_retry();
        let out = peer.poll_outgoing(later, 0, &config);
        assert!(matches!(out.bodies.as_slice(), [FrameBody::Connect { .. }]));
    }

    #[test]
    fn accept_requires_matching_session() {
        let config = TransportConfig::default();
        let now = Instant::now();
        let mut peer = Peer::outgoing(PeerId(1), addr(), &config, now);
        let salt = peer.client_salt();

        assert!(!peer.accept(salt ^ 5 ^ 1, 5, 3, now));
        assert!(peer.accept(salt ^ 5, 5, 3, now));
        assert!(peer.is_connected());
        assert_eq!(peer.remote_id(), Some(3));
        assert_eq!(peer.header_session(), salt ^ 5);
    }

    #[test]
    fn send_rejects_bad_channel_and_oversized_unreliable() {
        let config = TransportConfig::default();
        let now = Instant::now();
        let mut peer = Peer::incoming(PeerId(1), addr(), 9, &config, now);

        assert!(peer.send(0, true, b"hello"));
        assert!(peer.send(1, false, b"state"));
        assert!(!peer.send(config.channel_count, true, b"nope"));
        assert!(!peer.send(1, false, &vec![0u8; MAX_FRAGMENT_SIZE + 1]));
        assert!(peer.send(0, true, &vec![0u8; MAX_FRAGMENT_SIZE * 3]));
    }

    #[test]
    fn connecting_peer_refuses_data() {
        let config = TransportConfig::default();
        let mut peer = Peer::outgoing(PeerId(1), addr(), &config, Instant::now());
        assert!(!peer.send(0, true, b"early"));
    }

    #[test]
    fn idle_peer_pings() {
        let config = TransportConfig::default();
        let now = Instant::now();
        let mut peer = Peer::incoming(PeerId(1), addr(), 9, &config, now);

        // Drains the queued accept.
        peer.poll_outgoing(now, 0, &config);
        assert!(peer.poll_outgoing(now, 0, &config).bodies.is_empty());

        let later = now + config.ping_interval() + Duration::from_millis(1);
        let out = peer.poll_outgoing(later, 1001, &config);
        assert!(matches!(
            out.bodies.as_slice(),
            [FrameBody::Ping { timestamp_ms: 1001 }]
        ));
    }

    #[test]
    fn disconnect_expires_after_grace() {
        let config = TransportConfig::default();
        let now = Instant::now();
        let mut peer = Peer::incoming(PeerId(1), addr(), 9, &config, now);

        peer.begin_disconnect(now);
        assert_eq!(peer.state(), PeerState::Disconnecting);
        assert!(!peer.send(0, true, b"late"));
        assert!(!peer.disconnect_expired(now, &config));
        assert!(peer.disconnect_expired(now + config.disconnect_grace(), &config));
    }
}
