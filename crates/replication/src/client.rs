//! Client side of replication: one connection to a server, mirrored into a
//! caller-owned [`LocalWorld`].

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientEvent, MAX_PENDING_EVENTS};
use crate::net::{HostMode, NetworkEvent, NetworkStats, PeerId, Transport};
use crate::protocol::{Delivery, WireMessage};
use crate::world::{EntityHandle, LocalWorld, NetworkId, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connected,
}

pub struct Client {
    config: ClientConfig,
    transport: Transport,
    initialized: bool,
    state: ClientState,
    server: Option<PeerId>,
    client_id: Option<u32>,
    entities: HashMap<NetworkId, EntityHandle>,
    events: VecDeque<ClientEvent>,
    /// Set when the connection ends; the mirror is cleared on the next update.
    clear_mirror: bool,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let transport = Transport::new(config.transport.clone());
        Self {
            config,
            transport,
            initialized: false,
            state: ClientState::Disconnected,
            server: None,
            client_id: None,
            entities: HashMap::new(),
            events: VecDeque::new(),
            clear_mirror: false,
        }
    }

    pub fn initialize(&mut self) -> Result<(), ClientError> {
        self.transport.initialize()?;
        self.transport.create_client()?;
        self.initialized = true;
        Ok(())
    }

    /// Blocks for up to the configured connect timeout.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        if !self.initialized {
            return Err(ClientError::NotInitialized);
        }
        // A previous disconnect destroyed the host.
        if self.transport.mode() == HostMode::None {
            self.transport.create_client()?;
        }

        let peer = self
            .transport
            .connect(host, port, self.config.connect_timeout())?;
        self.server = Some(peer);
        self.client_id = self.transport.remote_peer_id(peer);
        self.state = ClientState::Connected;

        let client_id = self.client_id.unwrap_or_default();
        log::info!("Connected to {}:{} as client {}", host, port, client_id);
        self.push_event(ClientEvent::Connected { client_id });
        Ok(())
    }

    /// Connects to the host and port from the client config.
    pub fn connect_configured(&mut self) -> Result<(), ClientError> {
        let host = self.config.server_host.clone();
        let port = self.config.server_port;
        self.connect(&host, port)
    }

    pub fn disconnect(&mut self) {
        if self.server.take().is_none() {
            return;
        }
        self.transport.disconnect();
        self.on_disconnected();
        log::info!("Disconnected from server");
    }

    pub fn shutdown(&mut self) {
        self.disconnect();
        self.transport.shutdown();
        self.initialized = false;
    }

    fn on_disconnected(&mut self) {
        self.server = None;
        self.client_id = None;
        self.state = ClientState::Disconnected;
        self.clear_mirror = true;
        self.push_event(ClientEvent::Disconnected);
    }

    /// Drains every pending network event into `world`. Call once per frame.
    pub fn update<W: LocalWorld>(&mut self, world: &mut W) {
        if self.clear_mirror {
            self.clear_mirror = false;
            self.despawn_all(world);
        }

        while let Some(event) = self.transport.poll_event(Duration::ZERO) {
            match event {
                NetworkEvent::Connect(peer) => {
                    log::debug!("Ignoring unexpected connect from {}", peer);
                }
                NetworkEvent::Disconnect(peer) => {
                    if self.server == Some(peer) {
                        log::warn!("Lost connection to server");
                        self.on_disconnected();
                        self.clear_mirror = false;
                        self.despawn_all(world);
                    }
                }
                NetworkEvent::Receive { data, .. } => match WireMessage::decode(&data) {
                    Ok(message) => self.apply(world, message),
                    Err(err) => log::warn!("Dropping malformed message from server: {}", err),
                },
            }
        }
    }

    fn apply<W: LocalWorld>(&mut self, world: &mut W, message: WireMessage) {
        match message {
            WireMessage::EntitySpawn { network_id, name } => {
                if let Some(old) = self.entities.remove(&network_id) {
                    log::debug!("Re-spawn of {}, replacing local entity", network_id);
                    world.despawn_entity(old);
                    self.push_event(ClientEvent::EntityDestroyed {
                        network_id,
                        handle: old,
                    });
                }
                let handle = world.spawn_entity(network_id, &name);
                self.entities.insert(network_id, handle);
                log::debug!("Spawned {} {:?}", network_id, name);
                self.push_event(ClientEvent::EntitySpawned {
                    network_id,
                    handle,
                    name,
                });
            }
            WireMessage::EntityTransform { network_id, values } => {
                match self.entities.get(&network_id) {
                    Some(&handle) => world.apply_transform(handle, &Transform::from_array(values)),
                    None => log::debug!("Transform for unknown {}", network_id),
                }
            }
            WireMessage::EntityDestroy { network_id } => match self.entities.remove(&network_id) {
                Some(handle) => {
                    world.despawn_entity(handle);
                    log::debug!("Destroyed {}", network_id);
                    self.push_event(ClientEvent::EntityDestroyed { network_id, handle });
                }
                None => log::debug!("Destroy for unknown {}", network_id),
            },
            WireMessage::ChatMessage { text } => {
                self.push_event(ClientEvent::Chat { text });
            }
            WireMessage::PlayerInput { .. } => {
                log::warn!("Dropping input message sent by the server");
            }
        }
    }

    fn despawn_all<W: LocalWorld>(&mut self, world: &mut W) {
        let mirrored: Vec<_> = self.entities.drain().collect();
        for (network_id, handle) in mirrored {
            world.despawn_entity(handle);
            self.push_event(ClientEvent::EntityDestroyed { network_id, handle });
        }
    }

    fn send(&mut self, message: &WireMessage) -> bool {
        let Some(peer) = self.server else {
            return false;
        };
        let Delivery { channel, reliable } = message.delivery();
        let queued = self
            .transport
            .send_to_peer(peer, channel, reliable, &message.encode());
        if queued {
            self.transport.flush();
        }
        queued
    }

    pub fn send_input(&mut self, payload: &[u8]) -> bool {
        self.send(&WireMessage::PlayerInput {
            payload: payload.to_vec(),
        })
    }

    pub fn send_chat_message(&mut self, text: &str) -> bool {
        self.send(&WireMessage::ChatMessage {
            text: text.to_string(),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.server
            .is_some_and(|peer| self.transport.is_connected(peer))
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// The peer id the server assigned to this client.
    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn handle_for(&self, network_id: NetworkId) -> Option<EntityHandle> {
        self.entities.get(&network_id).copied()
    }

    pub fn mirrored_count(&self) -> usize {
        self.entities.len()
    }

    pub fn rtt_ms(&self) -> Option<f32> {
        self.server.and_then(|peer| self.transport.peer_rtt_ms(peer))
    }

    pub fn stats(&self) -> Option<NetworkStats> {
        self.transport.stats()
    }

    /// Takes the queued events. At most [`MAX_PENDING_EVENTS`] are kept.
    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    fn push_event(&mut self, event: ClientEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
