//! Application wire messages.
//!
//! Every message is a 1-byte tag followed by a fixed (or, for input, opaque)
//! little-endian payload:
//!
//! ```text
//! 0x01 Spawn      u32 network_id | [u8; 64] name (nul-terminated)
//! 0x02 Transform  u32 network_id | 10 x f32
//! 0x03 Destroy    u32 network_id
//! 0x10 Input      opaque bytes (datagram length - 1)
//! 0x11 Chat       [u8; 256] text (nul-terminated)
//! ```
//!
//! Decoding checks the length for the tag before touching any field and
//! ignores bytes past the fixed layout.

use crate::net::Channel;
use crate::world::NetworkId;

pub const TAG_SPAWN: u8 = 0x01;
pub const TAG_TRANSFORM: u8 = 0x02;
pub const TAG_DESTROY: u8 = 0x03;
pub const TAG_INPUT: u8 = 0x10;
pub const TAG_CHAT: u8 = 0x11;

pub const NAME_CAPACITY: usize = 64;
pub const TEXT_CAPACITY: usize = 256;
pub const TRANSFORM_FLOATS: usize = 10;

pub const SPAWN_SIZE: usize = 1 + 4 + NAME_CAPACITY;
pub const TRANSFORM_SIZE: usize = 1 + 4 + TRANSFORM_FLOATS * 4;
pub const DESTROY_SIZE: usize = 1 + 4;
pub const INPUT_MIN_SIZE: usize = 1;
pub const CHAT_SIZE: usize = 1 + TEXT_CAPACITY;

/// Reliable, ordered control channel: entity existence and chat.
pub const CONTROL_CHANNEL: Channel = 0;
/// Unreliable, latest-wins channel: high-frequency state.
pub const STATE_CHANNEL: Channel = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub channel: Channel,
    pub reliable: bool,
}

pub const SPAWN_DELIVERY: Delivery = Delivery {
    channel: CONTROL_CHANNEL,
    reliable: true,
};
pub const TRANSFORM_DELIVERY: Delivery = Delivery {
    channel: STATE_CHANNEL,
    reliable: false,
};
pub const DESTROY_DELIVERY: Delivery = Delivery {
    channel: CONTROL_CHANNEL,
    reliable: true,
};
pub const INPUT_DELIVERY: Delivery = Delivery {
    channel: STATE_CHANNEL,
    reliable: false,
};
pub const CHAT_DELIVERY: Delivery = Delivery {
    channel: CONTROL_CHANNEL,
    reliable: true,
};
/// Catch-up state for a joining peer must not overtake its spawns.
pub const CATCH_UP_DELIVERY: Delivery = Delivery {
    channel: CONTROL_CHANNEL,
    reliable: true,
};

#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    EntitySpawn {
        network_id: NetworkId,
        name: String,
    },
    EntityTransform {
        network_id: NetworkId,
        values: [f32; TRANSFORM_FLOATS],
    },
    EntityDestroy {
        network_id: NetworkId,
    },
    PlayerInput {
        payload: Vec<u8>,
    },
    ChatMessage {
        text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("unknown message tag {0:#04x}")]
    UnknownTag(u8),
    #[error("message with tag {tag:#04x} needs {expected} bytes, got {actual}")]
    Truncated {
        tag: u8,
        expected: usize,
        actual: usize,
    },
}

impl WireMessage {
    pub fn tag(&self) -> u8 {
        match self {
            Self::EntitySpawn { .. } => TAG_SPAWN,
            Self::EntityTransform { .. } => TAG_TRANSFORM,
            Self::EntityDestroy { .. } => TAG_DESTROY,
            Self::PlayerInput { .. } => TAG_INPUT,
            Self::ChatMessage { .. } => TAG_CHAT,
        }
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            Self::EntitySpawn { .. } => SPAWN_DELIVERY,
            Self::EntityTransform { .. } => TRANSFORM_DELIVERY,
            Self::EntityDestroy { .. } => DESTROY_DELIVERY,
            Self::PlayerInput { .. } => INPUT_DELIVERY,
            Self::ChatMessage { .. } => CHAT_DELIVERY,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::EntitySpawn { network_id, name } => {
                let mut buf = Vec::with_capacity(SPAWN_SIZE);
                buf.push(TAG_SPAWN);
                buf.extend_from_slice(&network_id.0.to_le_bytes());
                put_fixed_str(&mut buf, name, NAME_CAPACITY);
                buf
            }
            Self::EntityTransform { network_id, values } => {
                let mut buf = Vec::with_capacity(TRANSFORM_SIZE);
                buf.push(TAG_TRANSFORM);
                buf.extend_from_slice(&network_id.0.to_le_bytes());
                for value in values {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
                buf
            }
            Self::EntityDestroy { network_id } => {
                let mut buf = Vec::with_capacity(DESTROY_SIZE);
                buf.push(TAG_DESTROY);
                buf.extend_from_slice(&network_id.0.to_le_bytes());
                buf
            }
            Self::PlayerInput { payload } => {
                let mut buf = Vec::with_capacity(INPUT_MIN_SIZE + payload.len());
                buf.push(TAG_INPUT);
                buf.extend_from_slice(payload);
                buf
            }
            Self::ChatMessage { text } => {
                let mut buf = Vec::with_capacity(CHAT_SIZE);
                buf.push(TAG_CHAT);
                put_fixed_str(&mut buf, text, TEXT_CAPACITY);
                buf
            }
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (&tag, body) = bytes.split_first().ok_or(DecodeError::Empty)?;
        let required = match tag {
            TAG_SPAWN => SPAWN_SIZE,
            TAG_TRANSFORM => TRANSFORM_SIZE,
            TAG_DESTROY => DESTROY_SIZE,
            TAG_INPUT => INPUT_MIN_SIZE,
            TAG_CHAT => CHAT_SIZE,
            other => return Err(DecodeError::UnknownTag(other)),
        };
        if bytes.len() < required {
            return Err(DecodeError::Truncated {
                tag,
                expected: required,
                actual: bytes.len(),
            });
        }

        let mut reader = Reader::new(body);
        let message = match tag {
            TAG_SPAWN => Self::EntitySpawn {
                network_id: NetworkId(reader.u32()),
                name: reader.fixed_str(NAME_CAPACITY),
            },
            TAG_TRANSFORM => {
                let network_id = NetworkId(reader.u32());
                let mut values = [0.0; TRANSFORM_FLOATS];
                for value in &mut values {
                    *value = reader.f32();
                }
                Self::EntityTransform { network_id, values }
            }
            TAG_DESTROY => Self::EntityDestroy {
                network_id: NetworkId(reader.u32()),
            },
            TAG_INPUT => Self::PlayerInput {
                payload: body.to_vec(),
            },
            _ => Self::ChatMessage {
                text: reader.fixed_str(TEXT_CAPACITY),
            },
        };

        Ok(message)
    }
}

/// Truncates `value` so it fits `capacity - 1` bytes on a char boundary.
pub fn truncate_to_capacity(value: &str, capacity: usize) -> &str {
    let max = capacity.saturating_sub(1);
    if value.len() <= max {
        return value;
    }
    let mut end = max;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    &value[..end]
}

fn put_fixed_str(buf: &mut Vec<u8>, value: &str, capacity: usize) {
    let text = truncate_to_capacity(value, capacity);
    let start = buf.len();
    buf.extend_from_slice(text.as_bytes());
    buf.resize(start + capacity, 0);
}

/// Cursor over a body whose length was already checked against the layout.
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.bytes.get(self.pos..self.pos + N) {
            out.copy_from_slice(src);
        }
        self.pos += N;
        out
    }

    fn u32(&mut self) -> u32 {
        u32::from_le_bytes(self.take())
    }

    fn f32(&mut self) -> f32 {
        f32::from_le_bytes(self.take())
    }

    fn fixed_str(&mut self, capacity: usize) -> String {
        let field = self
            .bytes
            .get(self.pos..self.pos + capacity)
            .unwrap_or_default();
        self.pos += capacity;
        let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
        String::from_utf8_lossy(&field[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(message: WireMessage) {
        let encoded = message.encode();
        assert_eq!(encoded[0], message.tag());
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_round_trip_all_variants() {
        round_trip(WireMessage::EntitySpawn {
            network_id: NetworkId(42),
            name: "Rock".to_string(),
        });
        round_trip(WireMessage::EntityTransform {
            network_id: NetworkId(7),
            values: [1.0, -2.5, 3.25, 0.0, 0.0, 0.0, 1.0, 1.0, 2.0, 0.5],
        });
        round_trip(WireMessage::EntityDestroy {
            network_id: NetworkId(u32::MAX),
        });
        round_trip(WireMessage::PlayerInput {
            payload: vec![0xde, 0xad, 0xbe, 0xef],
        });
        round_trip(WireMessage::PlayerInput { payload: vec![] });
        round_trip(WireMessage::ChatMessage {
            text: "hello there".to_string(),
        });
    }

    #[test]
    fn test_round_trip_max_length_strings() {
        round_trip(WireMessage::EntitySpawn {
            network_id: NetworkId(1),
            name: "n".repeat(NAME_CAPACITY - 1),
        });
        round_trip(WireMessage::ChatMessage {
            text: "t".repeat(TEXT_CAPACITY - 1),
        });
    }

    #[test]
    fn test_fixed_sizes() {
        let spawn = WireMessage::EntitySpawn {
            network_id: NetworkId(1),
            name: String::new(),
        };
        assert_eq!(spawn.encode().len(), 69);

        let transform = WireMessage::EntityTransform {
            network_id: NetworkId(1),
            values: [0.0; TRANSFORM_FLOATS],
        };
        assert_eq!(transform.encode().len(), 45);

        let destroy = WireMessage::EntityDestroy {
            network_id: NetworkId(1),
        };
        assert_eq!(destroy.encode().len(), 5);

        let chat = WireMessage::ChatMessage {
            text: String::new(),
        };
        assert_eq!(chat.encode().len(), 257);
    }

    #[test]
    fn test_little_endian_layout() {
        let encoded = WireMessage::EntityDestroy {
            network_id: NetworkId(0x0403_0201),
        }
        .encode();
        assert_eq!(encoded, vec![TAG_DESTROY, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_long_chat_is_truncated_and_terminated() {
        let long = "x".repeat(400);
        let encoded = WireMessage::ChatMessage { text: long }.encode();

        assert_eq!(encoded.len(), CHAT_SIZE);
        assert_eq!(encoded[CHAT_SIZE - 1], 0);

        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::ChatMessage { text } => {
                assert_eq!(text.len(), TEXT_CAPACITY - 1);
                assert!(text.chars().all(|c| c == 'x'));
            }
            other => panic!("Expected ChatMessage, got {:?}", other),
        }
    }

    #[test]
    fn test_long_name_truncates_on_char_boundary() {
        // 'é' is two bytes; 40 of them straddle the 63-byte limit.
        let name = "é".repeat(40);
        let encoded = WireMessage::EntitySpawn {
            network_id: NetworkId(3),
            name,
        }
        .encode();
        assert_eq!(encoded.len(), SPAWN_SIZE);

        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::EntitySpawn { name, .. } => {
                assert_eq!(name, "é".repeat(31));
            }
            other => panic!("Expected EntitySpawn, got {:?}", other),
        }
    }

    #[test]
    fn test_short_buffers_rejected() {
        assert_eq!(WireMessage::decode(&[]), Err(DecodeError::Empty));

        let spawn = WireMessage::EntitySpawn {
            network_id: NetworkId(9),
            name: "Box".to_string(),
        }
        .encode();
        for len in 1..SPAWN_SIZE {
            assert_eq!(
                WireMessage::decode(&spawn[..len]),
                Err(DecodeError::Truncated {
                    tag: TAG_SPAWN,
                    expected: SPAWN_SIZE,
                    actual: len,
                })
            );
        }

        assert!(WireMessage::decode(&[TAG_TRANSFORM, 1, 0, 0, 0]).is_err());
        assert!(WireMessage::decode(&[TAG_DESTROY, 1, 0]).is_err());
        assert!(WireMessage::decode(&[TAG_CHAT, b'h', b'i', 0]).is_err());
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let mut encoded = WireMessage::EntityDestroy {
            network_id: NetworkId(5),
        }
        .encode();
        encoded.extend_from_slice(&[0xff; 16]);

        assert_eq!(
            WireMessage::decode(&encoded).unwrap(),
            WireMessage::EntityDestroy {
                network_id: NetworkId(5)
            }
        );
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert_eq!(
            WireMessage::decode(&[0x7f, 0, 0, 0, 0]),
            Err(DecodeError::UnknownTag(0x7f))
        );
    }

    #[test]
    fn test_name_without_terminator_stops_at_capacity() {
        let mut encoded = vec![TAG_SPAWN, 1, 0, 0, 0];
        encoded.extend_from_slice(&[b'a'; NAME_CAPACITY]);
        encoded.extend_from_slice(b"overflow");

        match WireMessage::decode(&encoded).unwrap() {
            WireMessage::EntitySpawn { name, .. } => assert_eq!(name, "a".repeat(NAME_CAPACITY)),
            other => panic!("Expected EntitySpawn, got {:?}", other),
        }
    }

    #[test]
    fn test_delivery_per_kind() {
        let spawn = WireMessage::EntitySpawn {
            network_id: NetworkId(1),
            name: String::new(),
        };
        assert_eq!(spawn.delivery(), SPAWN_DELIVERY);
        assert!(SPAWN_DELIVERY.reliable && DESTROY_DELIVERY.reliable);
        assert!(!TRANSFORM_DELIVERY.reliable);
        assert_ne!(TRANSFORM_DELIVERY.channel, SPAWN_DELIVERY.channel);
    }
}
