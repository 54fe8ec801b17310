use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize, rancor};

use super::Channel;

pub const PROTOCOL_MAGIC: u32 = 0x5445_5448;
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest datagram the host will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 1400;
/// Payload bytes carried by one fragment.
pub const MAX_FRAGMENT_SIZE: usize = 1024;
pub const MAX_FRAGMENT_COUNT: usize = 1024;
/// Largest message `send` accepts on a reliable channel.
pub const MAX_MESSAGE_SIZE: usize = MAX_FRAGMENT_SIZE * MAX_FRAGMENT_COUNT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u32,
    /// Client salt XOR server salt once connected; the bare client salt
    /// during the handshake.
    pub session: u64,
}

impl FrameHeader {
    pub fn new(session: u64) -> Self {
        Self {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            session,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == PROTOCOL_MAGIC && self.version == PROTOCOL_VERSION
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum FrameBody {
    Connect {
        client_salt: u64,
        channel_count: u8,
    },
    Accept {
        server_salt: u64,
        peer_id: u32,
    },
    Deny {
        reason: String,
    },
    Disconnect,
    DisconnectAck,
    Ping {
        timestamp_ms: u64,
    },
    Pong {
        timestamp_ms: u64,
    },
    Payload {
        channel: Channel,
        reliable: bool,
        sequence: u32,
        fragment_index: u16,
        fragment_count: u16,
        data: Vec<u8>,
    },
    Ack {
        channel: Channel,
        /// Highest sequence delivered in order.
        cumulative: u32,
        ack: u32,
        ack_bitfield: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct Frame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("frame of {0} bytes exceeds the datagram limit")]
    TooLarge(usize),
    #[error("bad magic or version")]
    BadHeader,
}

impl Frame {
    pub fn new(session: u64, body: FrameBody) -> Self {
        Self {
            header: FrameHeader::new(session),
            body,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let bytes = rkyv::to_bytes::<rancor::Error>(self)
            .map(|aligned| aligned.into_vec())
            .map_err(FrameError::Serialize)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            return Err(FrameError::TooLarge(bytes.len()));
        }
        Ok(bytes)
    }

    /// Validates and decodes a received datagram.
    ///
    /// Datagram buffers carry no alignment guarantee, so the bytes are copied
    /// into an aligned buffer before the archive is checked.
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        let mut aligned = AlignedVec::<16>::with_capacity(data.len());
        aligned.extend_from_slice(data);
        let frame = rkyv::from_bytes::<Self, rancor::Error>(&aligned)
            .map_err(FrameError::Deserialize)?;
        if !frame.header.is_valid() {
            return Err(FrameError::BadHeader);
        }
        Ok(frame)
    }
}
