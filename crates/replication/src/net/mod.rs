//! UDP transport: connection handshake, per-channel reliable-ordered and
//! unreliable sequenced delivery, fragmentation, keepalive and timeouts.

mod channel;
mod frame;
mod host;
mod peer;
mod stats;
mod tracking;
mod transport;

pub use channel::{Fragment, ReliableReceiver, ReliableSender, UnreliableChannel, split_message};
pub use frame::{
    Frame, FrameBody, FrameError, FrameHeader, MAX_DATAGRAM_SIZE, MAX_FRAGMENT_COUNT,
    MAX_FRAGMENT_SIZE, MAX_MESSAGE_SIZE, PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
pub use host::SERVER_FULL_REASON;
pub use peer::{PeerId, PeerState};
pub use stats::{NetworkStats, PacketLossSimulation};
pub use tracking::{ReceiveTracker, RttEstimator, sequence_greater_than};
pub use transport::{HostMode, Transport};

/// Index of an independent ordered stream within one connection.
pub type Channel = u8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    Connect(PeerId),
    Disconnect(PeerId),
    Receive {
        peer: PeerId,
        channel: Channel,
        data: Vec<u8>,
    },
}
