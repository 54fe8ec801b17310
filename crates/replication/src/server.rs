//! Authoritative server: peer registry, fixed-rate tick loop and broadcast of
//! entity lifecycle and state to every connected peer.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::events::{MAX_PENDING_EVENTS, ServerEvent};
use crate::net::{NetworkEvent, NetworkStats, PacketLossSimulation, PeerId, Transport};
use crate::protocol::{CATCH_UP_DELIVERY, Delivery, WireMessage};
use crate::world::{EntityChange, NetworkId, ReplicatedEntity, ReplicatedWorld, Transform};

pub const MAX_TICK_RATE: u32 = 1000;

/// Connected peers in connection order.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<PeerId>,
}

impl PeerRegistry {
    pub fn insert(&mut self, peer: PeerId) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer);
        true
    }

    pub fn remove(&mut self, peer: PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| *p != peer);
        self.peers.len() != before
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.peers.contains(&peer)
    }

    pub fn ids(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[derive(Debug)]
enum Command {
    Spawn { network_id: NetworkId, name: String },
    Transform { network_id: NetworkId, transform: Transform },
    Destroy { network_id: NetworkId },
    Replicate(ReplicatedEntity),
    Sync(Vec<ReplicatedEntity>),
    Chat(String),
    Kick(PeerId),
    PacketLoss(PacketLossSimulation),
}

/// Published by whichever thread owns the core, read by the handle.
#[derive(Debug, Default)]
struct Shared {
    tick: AtomicU64,
    peer_count: AtomicUsize,
    peers: Mutex<Vec<PeerId>>,
    stats: Mutex<NetworkStats>,
}

/// Event-processing state. Owned by the handle when stopped, by the tick
/// thread while running.
struct ServerCore {
    transport: Transport,
    registry: PeerRegistry,
    world: ReplicatedWorld,
    events: Sender<ServerEvent>,
    /// Used to discard the oldest event when the caller falls behind.
    overflow: Receiver<ServerEvent>,
    shared: Arc<Shared>,
}

impl ServerCore {
    fn tick(&mut self, commands: &Receiver<Command>) {
        for command in commands.try_iter() {
            self.apply(command);
        }

        for event in self.transport.drain_events() {
            self.handle_event(event);
        }
        self.transport.flush();

        self.shared.tick.fetch_add(1, Ordering::Relaxed);
        if let Some(stats) = self.transport.stats() {
            if let Ok(mut published) = self.shared.stats.lock() {
                *published = stats;
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Spawn { network_id, name } => self.spawn(network_id, &name),
            Command::Transform {
                network_id,
                transform,
            } => self.transform(network_id, transform),
            Command::Destroy { network_id } => self.destroy(network_id),
            Command::Replicate(entity) => self.replicate(entity),
            Command::Sync(entities) => {
                for change in self.world.diff(&entities) {
                    match change {
                        EntityChange::Spawned(entity) => self.replicate(entity),
                        EntityChange::Moved(network_id, transform) => {
                            self.transform(network_id, transform)
                        }
                        EntityChange::Destroyed(network_id) => self.destroy(network_id),
                    }
                }
            }
            Command::Chat(text) => self.broadcast(&WireMessage::ChatMessage { text }),
            Command::Kick(peer) => {
                if self.transport.disconnect_peer(peer) {
                    log::info!("Kicking {}", peer);
                } else {
                    log::warn!("Cannot kick unknown {}", peer);
                }
            }
            Command::PacketLoss(loss) => self.transport.set_packet_loss(loss),
        }
    }

    fn spawn(&mut self, network_id: NetworkId, name: &str) {
        if !self.world.spawn(network_id, name) {
            log::debug!("Re-spawning {} as {:?}", network_id, name);
        }
        self.broadcast(&WireMessage::EntitySpawn {
            network_id,
            name: name.to_string(),
        });
    }

    fn transform(&mut self, network_id: NetworkId, transform: Transform) {
        if !self.world.set_transform(network_id, transform) {
            log::debug!("Transform for unreplicated {}", network_id);
        }
        self.broadcast(&WireMessage::EntityTransform {
            network_id,
            values: transform.to_array(),
        });
    }

    /// Spawn followed by its initial transform, both on the reliable channel
    /// so the transform cannot overtake the spawn and be discarded.
    fn replicate(&mut self, entity: ReplicatedEntity) {
        self.spawn(entity.network_id, &entity.name);
        self.world.set_transform(entity.network_id, entity.transform);
        self.broadcast_with(
            &WireMessage::EntityTransform {
                network_id: entity.network_id,
                values: entity.transform.to_array(),
            },
            CATCH_UP_DELIVERY,
        );
    }

    fn destroy(&mut self, network_id: NetworkId) {
        self.world.destroy(network_id);
        self.broadcast(&WireMessage::EntityDestroy { network_id });
    }

    fn broadcast(&mut self, message: &WireMessage) {
        self.broadcast_with(message, message.delivery());
    }

    fn broadcast_with(&mut self, message: &WireMessage, delivery: Delivery) {
        self.transport
            .broadcast(delivery.channel, delivery.reliable, &message.encode());
    }

    fn send(&mut self, peer: PeerId, message: &WireMessage, delivery: Delivery) -> bool {
        self.transport
            .send_to_peer(peer, delivery.channel, delivery.reliable, &message.encode())
    }

    fn handle_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::Connect(peer) => {
                if !self.registry.insert(peer) {
                    log::warn!("Duplicate connect for {}", peer);
                    return;
                }
                log::info!("{} joined ({} connected)", peer, self.registry.len());
                self.catch_up(peer);
                self.publish_peers();
                self.emit(ServerEvent::PeerConnected { peer });
            }
            NetworkEvent::Disconnect(peer) => {
                if self.registry.remove(peer) {
                    log::info!("{} left ({} connected)", peer, self.registry.len());
                    self.publish_peers();
                    self.emit(ServerEvent::PeerDisconnected { peer });
                }
            }
            NetworkEvent::Receive { peer, data, .. } => match WireMessage::decode(&data) {
                Ok(WireMessage::PlayerInput { payload }) => {
                    self.emit(ServerEvent::Input { peer, payload })
                }
                Ok(WireMessage::ChatMessage { text }) => {
                    log::info!("[chat] {}: {}", peer, text);
                    self.emit(ServerEvent::Chat { peer, text });
                }
                Ok(other) => {
                    log::warn!(
                        "Dropping server-only message {:#04x} from {}",
                        other.tag(),
                        peer
                    );
                }
                Err(err) => log::warn!("Dropping malformed message from {}: {}", peer, err),
            },
        }
    }

    /// Spawn and transform of every replicated entity, to one peer.
    fn catch_up(&mut self, peer: PeerId) {
        let messages: Vec<WireMessage> = self
            .world
            .iter()
            .flat_map(|entity| {
                [
                    WireMessage::EntitySpawn {
                        network_id: entity.network_id,
                        name: entity.name.clone(),
                    },
                    WireMessage::EntityTransform {
                        network_id: entity.network_id,
                        values: entity.transform.to_array(),
                    },
                ]
            })
            .collect();

        if !messages.is_empty() {
            log::debug!("Sending {} catch-up messages to {}", messages.len(), peer);
        }
        for message in &messages {
            if !self.send(peer, message, CATCH_UP_DELIVERY) {
                log::warn!("Catch-up to {} failed", peer);
                break;
            }
        }
    }

    fn publish_peers(&self) {
        self.shared
            .peer_count
            .store(self.registry.len(), Ordering::Relaxed);
        if let Ok(mut peers) = self.shared.peers.lock() {
            *peers = self.registry.ids().to_vec();
        }
    }

    fn emit(&self, event: ServerEvent) {
        let event = match self.events.try_send(event) {
            Ok(()) => return,
            Err(TrySendError::Full(event)) => event,
            Err(TrySendError::Disconnected(_)) => return,
        };
        if self.overflow.try_recv().is_ok() {
            log::warn!("Server event queue full, discarding the oldest event");
        }
        let _ = self.events.try_send(event);
    }
}

struct TickWorker {
    running: Arc<AtomicBool>,
    handle: JoinHandle<ServerCore>,
}

pub struct Server {
    config: ServerConfig,
    core: Option<ServerCore>,
    worker: Option<TickWorker>,
    commands_tx: Sender<Command>,
    commands_rx: Receiver<Command>,
    events_tx: Sender<ServerEvent>,
    events_rx: Receiver<ServerEvent>,
    shared: Arc<Shared>,
    next_network_id: u32,
    local_addr: Option<SocketAddr>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        let (commands_tx, commands_rx) = crossbeam_channel::unbounded();
        let (events_tx, events_rx) = crossbeam_channel::bounded(MAX_PENDING_EVENTS);
        Self {
            config: ServerConfig::default(),
            core: None,
            worker: None,
            commands_tx,
            commands_rx,
            events_tx,
            events_rx,
            shared: Arc::new(Shared::default()),
            next_network_id: 1,
            local_addr: None,
        }
    }

    /// Binds the listening host. Replaces any previous host.
    pub fn initialize(&mut self, config: ServerConfig) -> Result<(), ServerError> {
        if !(1..=MAX_TICK_RATE).contains(&config.tick_rate) {
            return Err(ServerError::InvalidTickRate(config.tick_rate));
        }
        self.shutdown();

        let mut transport = Transport::new(config.transport.clone());
        transport.initialize()?;
        transport.create_server(config.port, config.max_peers)?;
        self.local_addr = transport.local_addr();

        self.shared = Arc::new(Shared::default());
        self.core = Some(ServerCore {
            transport,
            registry: PeerRegistry::default(),
            world: ReplicatedWorld::new(),
            events: self.events_tx.clone(),
            overflow: self.events_rx.clone(),
            shared: Arc::clone(&self.shared),
        });
        self.config = config;
        log::info!(
            "Server initialized on {:?} ({} Hz, max {} peers)",
            self.local_addr,
            self.config.tick_rate,
            self.config.max_peers
        );
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.core.is_some() || self.worker.is_some()
    }

    /// Moves event processing onto a dedicated thread ticking at the
    /// configured rate.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut core) = self.core.take() else {
            return Err(ServerError::NotInitialized);
        };

        let running = Arc::new(AtomicBool::new(true));
        let interval = self.config.tick_interval();
        let commands = self.commands_rx.clone();
        let flag = Arc::clone(&running);

        let handle = thread::Builder::new()
            .name("tether-tick".into())
            .spawn(move || {
                let mut next_tick = Instant::now();
                while flag.load(Ordering::SeqCst) {
                    core.tick(&commands);

                    next_tick += interval;
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    } else {
                        // Running behind; do not try to catch up.
                        next_tick = now;
                    }
                }
                core
            })
            .map_err(ServerError::Spawn)?;

        self.worker = Some(TickWorker { running, handle });
        log::info!("Tick loop started at {} Hz", self.config.tick_rate);
        Ok(())
    }

    /// Returns once the tick thread has exited.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        worker.running.store(false, Ordering::SeqCst);
        match worker.handle.join() {
            Ok(mut core) => {
                // Commands sent after the final tick still apply.
                for command in self.commands_rx.try_iter() {
                    core.apply(command);
                }
                core.transport.flush();
                self.core = Some(core);
            }
            Err(_) => log::error!("Tick thread panicked; server state lost"),
        }
        log::info!("Tick loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// One manual tick. Not allowed while the tick loop runs.
    pub fn tick(&mut self) -> Result<(), ServerError> {
        if self.worker.is_some() {
            return Err(ServerError::Running);
        }
        let core = self.core.as_mut().ok_or(ServerError::NotInitialized)?;
        core.tick(&self.commands_rx);
        Ok(())
    }

    /// Stops the loop, disconnects every peer gracefully and releases the host.
    pub fn shutdown(&mut self) {
        self.stop();
        if let Some(mut core) = self.core.take() {
            core.transport.disconnect();
            core.transport.shutdown();
            log::info!("Server shut down");
        }
        self.local_addr = None;
    }

    fn dispatch(&mut self, command: Command) {
        if let Some(core) = self.core.as_mut() {
            core.apply(command);
        } else if self.worker.is_some() {
            // The worker holds a receiver clone, so this cannot fail.
            let _ = self.commands_tx.send(command);
        } else {
            log::warn!("Server not initialized, dropping {:?}", command);
        }
    }

    pub fn broadcast_entity_spawn(&mut self, network_id: NetworkId, name: &str) {
        self.reserve_network_id(network_id);
        self.dispatch(Command::Spawn {
            network_id,
            name: name.to_string(),
        });
    }

    pub fn broadcast_entity_transform(&mut self, network_id: NetworkId, transform: Transform) {
        self.dispatch(Command::Transform {
            network_id,
            transform,
        });
    }

    pub fn broadcast_entity_destroy(&mut self, network_id: NetworkId) {
        self.dispatch(Command::Destroy { network_id });
    }

    /// Allocates a network id and replicates a new entity under it.
    pub fn replicate_entity(&mut self, name: &str, transform: Transform) -> NetworkId {
        let network_id = NetworkId(self.next_network_id);
        self.reserve_network_id(network_id);
        self.dispatch(Command::Replicate(ReplicatedEntity::new(
            network_id, name, transform,
        )));
        network_id
    }

    /// Brings peers in line with the simulation's current replicated set.
    pub fn sync_entities<'a, I>(&mut self, entities: I)
    where
        I: IntoIterator<Item = &'a ReplicatedEntity>,
    {
        let entities: Vec<ReplicatedEntity> = entities.into_iter().cloned().collect();
        for entity in &entities {
            self.reserve_network_id(entity.network_id);
        }
        self.dispatch(Command::Sync(entities));
    }

    pub fn broadcast_chat(&mut self, text: &str) {
        self.dispatch(Command::Chat(text.to_string()));
    }

    pub fn kick(&mut self, peer: PeerId) {
        self.dispatch(Command::Kick(peer));
    }

    pub fn set_packet_loss(&mut self, loss: PacketLossSimulation) {
        self.dispatch(Command::PacketLoss(loss));
    }

    fn reserve_network_id(&mut self, network_id: NetworkId) {
        if network_id.0 >= self.next_network_id {
            self.next_network_id = network_id.0.saturating_add(1);
        }
    }

    /// Takes the queued events. At most [`MAX_PENDING_EVENTS`] are kept, so
    /// drain at least once per tick.
    pub fn drain_events(&self) -> Vec<ServerEvent> {
        self.events_rx.try_iter().collect()
    }

    pub fn peer_count(&self) -> usize {
        self.shared.peer_count.load(Ordering::Relaxed)
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.shared
            .peers
            .lock()
            .map(|peers| peers.clone())
            .unwrap_or_default()
    }

    pub fn tick_count(&self) -> u64 {
        self.shared.tick.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> NetworkStats {
        self.shared
            .stats
            .lock()
            .map(|stats| stats.clone())
            .unwrap_or_default()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn local_config() -> ServerConfig {
        ServerConfig::new(0, 4, 60)
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = PeerRegistry::default();
        assert!(registry.insert(PeerId(1)));
        assert!(!registry.insert(PeerId(1)));
        assert!(registry.insert(PeerId(2)));
        assert_eq!(registry.ids(), &[PeerId(1), PeerId(2)]);

        assert!(registry.remove(PeerId(1)));
        assert!(!registry.remove(PeerId(1)));
        assert!(!registry.contains(PeerId(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn tick_before_initialize() {
        let mut server = Server::new();
        assert!(matches!(server.tick(), Err(ServerError::NotInitialized)));
        assert!(matches!(server.start(), Err(ServerError::NotInitialized)));
    }

    #[test]
    fn invalid_tick_rate() {
        let mut server = Server::new();
        let config = ServerConfig::new(0, 4, 0);
        assert!(matches!(
            server.initialize(config),
            Err(ServerError::InvalidTickRate(0))
        ));
    }

    #[test]
    fn manual_tick_rejected_while_running() {
        let mut server = Server::new();
        server.initialize(local_config()).unwrap();
        server.start().unwrap();
        assert!(server.is_running());
        assert!(matches!(server.tick(), Err(ServerError::Running)));

        server.stop();
        assert!(!server.is_running());
        server.tick().unwrap();
    }

    #[test]
    fn event_queue_keeps_the_newest() {
        let mut server = Server::new();
        server.initialize(local_config()).unwrap();
        let core = server.core.as_ref().unwrap();
        for i in 0..MAX_PENDING_EVENTS + 3 {
            core.emit(ServerEvent::Chat {
                peer: PeerId(1),
                text: i.to_string(),
            });
        }

        let events = server.drain_events();
        assert_eq!(events.len(), MAX_PENDING_EVENTS);
        assert_eq!(
            events[0],
            ServerEvent::Chat {
                peer: PeerId(1),
                text: "3".into()
            }
        );
    }

    #[test]
    fn loop_ticks_until_stopped() {
        let mut server = Server::new();
        server.initialize(local_config()).unwrap();
        server.start().unwrap();
        thread::sleep(Duration::from_millis(100));
        server.stop();

        let ticks = server.tick_count();
        assert!(ticks > 0);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(server.tick_count(), ticks);
    }

    #[test]
    fn replicate_allocates_after_explicit_ids() {
        let mut server = Server::new();
        server.initialize(local_config()).unwrap();

        let first = server.replicate_entity("a", Transform::IDENTITY);
        assert_eq!(first, NetworkId(1));

        server.broadcast_entity_spawn(NetworkId(10), "b");
        let next = server.replicate_entity("c", Transform::IDENTITY);
        assert_eq!(next, NetworkId(11));
    }
}
