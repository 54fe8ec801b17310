use crate::net::PeerId;
use crate::world::{EntityHandle, NetworkId};

/// Undrained events kept per queue. Past this the oldest are discarded, so
/// callers should drain once per tick or frame.
pub const MAX_PENDING_EVENTS: usize = 4096;

/// Raised by the server's event processing, drained with `Server::drain_events`.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PeerConnected { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    /// Opaque input bytes; the simulation decides what they mean.
    Input { peer: PeerId, payload: Vec<u8> },
    Chat { peer: PeerId, text: String },
}

impl ServerEvent {
    pub fn peer(&self) -> PeerId {
        match self {
            ServerEvent::PeerConnected { peer }
            | ServerEvent::PeerDisconnected { peer }
            | ServerEvent::Input { peer, .. }
            | ServerEvent::Chat { peer, .. } => *peer,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connected { client_id: u32 },
    Disconnected,
    EntitySpawned {
        network_id: NetworkId,
        handle: EntityHandle,
        name: String,
    },
    EntityDestroyed {
        network_id: NetworkId,
        handle: EntityHandle,
    },
    Chat { text: String },
}
