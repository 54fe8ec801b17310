mod entity;
mod mirror;
mod registry;

pub use entity::{EntityHandle, NetworkId, ReplicatedEntity, Transform};
pub use mirror::{LocalWorld, MirrorEntity, MirrorWorld};
pub use registry::{EntityChange, ReplicatedWorld};
