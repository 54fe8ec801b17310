pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod net;
pub mod protocol;
pub mod server;
pub mod world;

pub use client::{Client, ClientState};
pub use config::{
    ClientConfig, DEFAULT_MAX_PEERS, DEFAULT_PORT, DEFAULT_TICK_RATE, ServerConfig,
    TransportConfig,
};
pub use error::{ClientError, ConfigError, ServerError, TransportError};
pub use events::{ClientEvent, MAX_PENDING_EVENTS, ServerEvent};
pub use net::{
    Channel, HostMode, NetworkEvent, NetworkStats, PacketLossSimulation, PeerId, PeerState,
    Transport,
};
pub use protocol::{DecodeError, Delivery, WireMessage};
pub use server::{PeerRegistry, Server};
pub use world::{
    EntityHandle, LocalWorld, MirrorEntity, MirrorWorld, NetworkId, ReplicatedEntity,
    ReplicatedWorld, Transform,
};
