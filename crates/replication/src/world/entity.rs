use std::fmt;

use glam::{Quat, Vec3};

use crate::protocol::TRANSFORM_FLOATS;

/// Authoritative cross-machine identifier of a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct NetworkId(pub u32);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Handle into a caller-owned local world. Opaque to the replication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityHandle(pub u64);

impl EntityHandle {
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Wire layout: position xyz, rotation quaternion xyzw, scale xyz.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn to_array(&self) -> [f32; TRANSFORM_FLOATS] {
        let p = self.position;
        let r = self.rotation;
        let s = self.scale;
        [p.x, p.y, p.z, r.x, r.y, r.z, r.w, s.x, s.y, s.z]
    }

    pub fn from_array(values: [f32; TRANSFORM_FLOATS]) -> Self {
        let [px, py, pz, rx, ry, rz, rw, sx, sy, sz] = values;
        Self {
            position: Vec3::new(px, py, pz),
            rotation: Quat::from_xyzw(rx, ry, rz, rw),
            scale: Vec3::new(sx, sy, sz),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicatedEntity {
    pub network_id: NetworkId,
    pub name: String,
    pub transform: Transform,
}

impl ReplicatedEntity {
    pub fn new(network_id: NetworkId, name: impl Into<String>, transform: Transform) -> Self {
        Self {
            network_id,
            name: name.into(),
            transform,
        }
    }
}
