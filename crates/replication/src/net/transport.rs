use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use super::host::{Host, HostRole};
use super::peer::PeerId;
use super::stats::{NetworkStats, PacketLossSimulation};
use super::{Channel, NetworkEvent};
use crate::config::TransportConfig;
use crate::error::TransportError;

const POLL_SLEEP: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostMode {
    None,
    Server,
    Client,
}

impl fmt::Display for HostMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostMode::None => write!(f, "missing"),
            HostMode::Server => write!(f, "server"),
            HostMode::Client => write!(f, "client"),
        }
    }
}

/// Owns at most one host and exposes it as an event stream.
///
/// All calls are non-reentrant; one owner drives a transport at a time.
pub struct Transport {
    config: TransportConfig,
    initialized: bool,
    host: Option<Host>,
    loss: PacketLossSimulation,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            initialized: false,
            host: None,
            loss: PacketLossSimulation::default(),
        }
    }

    pub fn initialize(&mut self) -> Result<(), TransportError> {
        if self.initialized {
            return Ok(());
        }
        self.config.validate()?;
        self.initialized = true;
        log::debug!("Transport initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn create_server(&mut self, port: u16, max_peers: usize) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        if max_peers == 0 {
            return Err(TransportError::InvalidConfig(
                "max_peers must be at least 1".into(),
            ));
        }
        self.destroy_host();

        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let mut host = Host::bind(addr, HostRole::Server { max_peers }, self.config.clone())
            .map_err(|source| TransportError::Bind { port, source })?;
        host.set_packet_loss(self.loss.clone());
        log::info!(
            "Server host listening on {} (max {} peers)",
            host.local_addr(),
            max_peers
        );
        self.host = Some(host);
        Ok(())
    }

    pub fn create_client(&mut self) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        self.destroy_host();

        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        let mut host = Host::bind(addr, HostRole::Client, self.config.clone())
            .map_err(|source| TransportError::Bind { port: 0, source })?;
        host.set_packet_loss(self.loss.clone());
        log::debug!("Client host bound to {}", host.local_addr());
        self.host = Some(host);
        Ok(())
    }

    /// Blocks up to `timeout` for the server's accept.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Duration) -> Result<PeerId, TransportError> {
        let mode = self.mode();
        let Some(client) = self.host.as_mut() else {
            return Err(TransportError::NoHost);
        };
        if client.role() != HostRole::Client {
            return Err(TransportError::WrongMode {
                operation: "connect",
                mode,
            });
        }
        if let Some(existing) = client.connected_peers().first() {
            let addr = client
                .peer(*existing)
                .map(|peer| peer.addr())
                .unwrap_or(client.local_addr());
            return Err(TransportError::AlreadyConnected(addr));
        }

        let addr = resolve(host, port)?;
        log::info!("Connecting to {} ({})", addr, host);
        let peer = client.connect(addr);

        let deadline = Instant::now() + timeout;
        loop {
            client.service()?;
            if client.take_connect_event(peer) {
                return Ok(peer);
            }
            if let Some(reason) = client.take_denial() {
                return Err(TransportError::Refused { reason });
            }
            if Instant::now() >= deadline {
                client.reset_peer(peer);
                return Err(TransportError::Timeout { addr, timeout });
            }
            thread::sleep(POLL_SLEEP);
        }
    }

    /// Gracefully disconnects every peer, waits at most the grace period,
    /// then destroys the host.
    pub fn disconnect(&mut self) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        host.disconnect_all();

        let deadline = Instant::now() + self.config.disconnect_grace();
        while host.has_peers() && Instant::now() < deadline {
            if let Err(err) = host.service() {
                log::warn!("Error while disconnecting: {}", err);
                break;
            }
            thread::sleep(POLL_SLEEP);
        }
        if host.has_peers() {
            log::warn!("Disconnect grace period elapsed, closing anyway");
        }
        self.destroy_host();
    }

    /// Starts a graceful disconnect of one peer. Its `Disconnect` event
    /// arrives once the peer acknowledges or the grace period runs out.
    pub fn disconnect_peer(&mut self, peer: PeerId) -> bool {
        self.host
            .as_mut()
            .is_some_and(|host| host.disconnect_peer(peer))
    }

    /// Services the host for up to `timeout` and returns at most one event.
    pub fn poll_event(&mut self, timeout: Duration) -> Option<NetworkEvent> {
        let host = self.host.as_mut()?;
        if let Some(event) = host.pop_event() {
            return Some(event);
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Err(err) = host.service() {
                log::warn!("Transport service failed: {}", err);
            }
            if let Some(event) = host.pop_event() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(POLL_SLEEP.min(deadline - now));
        }
    }

    /// Services the host once and takes every event that produced. Unlike
    /// looping on `poll_event`, this returns even under sustained traffic.
    pub fn drain_events(&mut self) -> Vec<NetworkEvent> {
        let Some(host) = self.host.as_mut() else {
            return Vec::new();
        };
        if let Err(err) = host.service() {
            log::warn!("Transport service failed: {}", err);
        }
        std::iter::from_fn(|| host.pop_event()).collect()
    }

    pub fn send_to_peer(&mut self, peer: PeerId, channel: Channel, reliable: bool, data: &[u8]) -> bool {
        self.host
            .as_mut()
            .is_some_and(|host| host.send(peer, channel, reliable, data))
    }

    pub fn broadcast(&mut self, channel: Channel, reliable: bool, data: &[u8]) {
        if let Some(host) = self.host.as_mut() {
            host.broadcast(channel, reliable, data);
        }
    }

    /// Sends queued frames now instead of on the next poll.
    pub fn flush(&mut self) {
        let Some(host) = self.host.as_mut() else {
            return;
        };
        if let Err(err) = host.service() {
            log::warn!("Transport flush failed: {}", err);
        }
    }

    pub fn shutdown(&mut self) {
        if self.host.is_some() {
            self.destroy_host();
        }
        if self.initialized {
            self.initialized = false;
            log::debug!("Transport shut down");
        }
    }

    fn destroy_host(&mut self) {
        if let Some(host) = self.host.take() {
            log::debug!("Destroying host on {}", host.local_addr());
        }
    }

    pub fn mode(&self) -> HostMode {
        match self.host.as_ref().map(Host::role) {
            None => HostMode::None,
            Some(HostRole::Server { .. }) => HostMode::Server,
            Some(HostRole::Client) => HostMode::Client,
        }
    }

    pub fn is_connected(&self, peer: PeerId) -> bool {
        self.host
            .as_ref()
            .and_then(|host| host.peer(peer))
            .is_some_and(|p| p.is_connected())
    }

    pub fn peer_count(&self) -> usize {
        self.host.as_ref().map_or(0, Host::peer_count)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.host
            .as_ref()
            .map(Host::connected_peers)
            .unwrap_or_default()
    }

    /// The id the remote side assigned to this connection.
    pub fn remote_peer_id(&self, peer: PeerId) -> Option<u32> {
        self.host
            .as_ref()
            .and_then(|host| host.peer(peer))
            .and_then(|p| p.remote_id())
    }

    pub fn peer_rtt_ms(&self, peer: PeerId) -> Option<f32> {
        self.host
            .as_ref()
            .and_then(|host| host.peer(peer))
            .map(|p| p.rtt().srtt())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.host.as_ref().map(Host::local_addr)
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.host.as_ref().map(Host::stats)
    }

    /// Applies to the current host and to hosts created later.
    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        if let Some(host) = self.host.as_mut() {
            host.set_packet_loss(loss.clone());
        }
        self.loss = loss;
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, TransportError> {
    let unresolved = || TransportError::Resolve {
        host: host.to_string(),
        port,
    };
    (host, port)
        .to_socket_addrs()
        .map_err(|_| unresolved())?
        .find(SocketAddr::is_ipv4)
        .ok_or_else(unresolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_creation_requires_initialize() {
        let mut transport = Transport::default();
        assert!(matches!(
            transport.create_server(0, 4),
            Err(TransportError::NotInitialized)
        ));
        assert!(matches!(
            transport.create_client(),
            Err(TransportError::NotInitialized)
        ));

        transport.initialize().unwrap();
        transport.initialize().unwrap();
        transport.create_client().unwrap();
        assert_eq!(transport.mode(), HostMode::Client);
    }

    #[test]
    fn invalid_config_is_reported() {
        let mut transport = Transport::new(TransportConfig {
            channel_count: 0,
            ..TransportConfig::default()
        });
        assert!(matches!(
            transport.initialize(),
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[test]
    fn connect_on_server_is_wrong_mode() {
        let mut transport = Transport::default();
        transport.initialize().unwrap();
        transport.create_server(0, 4).unwrap();

        let result = transport.connect("127.0.0.1", 1, Duration::from_millis(10));
        assert!(matches!(
            result,
            Err(TransportError::WrongMode {
                mode: HostMode::Server,
                ..
            })
        ));
    }

    #[test]
    fn connect_without_host_fails() {
        let mut transport = Transport::default();
        transport.initialize().unwrap();
        assert!(matches!(
            transport.connect("127.0.0.1", 1, Duration::from_millis(10)),
            Err(TransportError::NoHost)
        ));
    }

    #[test]
    fn connect_times_out_without_server() {
        let mut transport = Transport::default();
        transport.initialize().unwrap();
        transport.create_client().unwrap();

        // Bound but never serviced, so the handshake is never answered.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();

        let result = transport.connect("127.0.0.1", port, Duration::from_millis(100));
        assert!(matches!(result, Err(TransportError::Timeout { .. })));
        assert_eq!(transport.peer_count(), 0);
    }

    #[test]
    fn unresolvable_host() {
        let mut transport = Transport::default();
        transport.initialize().unwrap();
        transport.create_client().unwrap();
        let result = transport.connect("host.invalid", 7777, Duration::from_millis(10));
        assert!(matches!(result, Err(TransportError::Resolve { .. })));
    }

    #[test]
    fn create_server_replaces_host() {
        let mut transport = Transport::default();
        transport.initialize().unwrap();
        transport.create_client().unwrap();
        transport.create_server(0, 2).unwrap();
        assert_eq!(transport.mode(), HostMode::Server);
    }

    #[test]
    fn send_and_poll_without_host() {
        let mut transport = Transport::default();
        assert!(!transport.send_to_peer(PeerId(1), 0, true, b"x"));
        assert!(transport.poll_event(Duration::ZERO).is_none());
        transport.broadcast(0, true, b"x");
        transport.shutdown();
        transport.shutdown();
    }
}
