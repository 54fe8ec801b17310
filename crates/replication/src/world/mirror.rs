use std::collections::HashMap;

use super::entity::{EntityHandle, NetworkId, Transform};

/// The client-side world the replication layer writes into.
pub trait LocalWorld {
    fn spawn_entity(&mut self, network_id: NetworkId, name: &str) -> EntityHandle;
    fn apply_transform(&mut self, handle: EntityHandle, transform: &Transform);
    fn despawn_entity(&mut self, handle: EntityHandle);
}

#[derive(Debug, Clone, PartialEq)]
pub struct MirrorEntity {
    pub handle: EntityHandle,
    pub network_id: NetworkId,
    pub name: String,
    pub transform: Transform,
}

/// A plain map-backed `LocalWorld`.
#[derive(Debug, Default)]
pub struct MirrorWorld {
    entities: HashMap<EntityHandle, MirrorEntity>,
    next_handle: u64,
}

impl MirrorWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: EntityHandle) -> Option<&MirrorEntity> {
        self.entities.get(&handle)
    }

    pub fn find(&self, network_id: NetworkId) -> Option<&MirrorEntity> {
        self.entities.values().find(|e| e.network_id == network_id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &MirrorEntity> {
        self.entities.values()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    fn allocate_handle(&mut self) -> EntityHandle {
        self.next_handle += 1;
        EntityHandle(self.next_handle)
    }
}

impl LocalWorld for MirrorWorld {
    fn spawn_entity(&mut self, network_id: NetworkId, name: &str) -> EntityHandle {
        let handle = self.allocate_handle();
        self.entities.insert(
            handle,
            MirrorEntity {
                handle,
                network_id,
                name: name.to_string(),
                transform: Transform::IDENTITY,
            },
        );
        handle
    }

    fn apply_transform(&mut self, handle: EntityHandle, transform: &Transform) {
        if let Some(entity) = self.entities.get_mut(&handle) {
            entity.transform = *transform;
        }
    }

    fn despawn_entity(&mut self, handle: EntityHandle) {
        self.entities.remove(&handle);
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn spawn_apply_despawn() {
        let mut world = MirrorWorld::new();
        let handle = world.spawn_entity(NetworkId(7), "Box");
        assert_eq!(world.entity_count(), 1);
        assert_eq!(world.find(NetworkId(7)).map(|e| e.handle), Some(handle));

        let moved = Transform::from_position(Vec3::new(3.0, 0.0, -1.0));
        world.apply_transform(handle, &moved);
        assert_eq!(world.get(handle).unwrap().transform, moved);

        world.despawn_entity(handle);
        assert_eq!(world.entity_count(), 0);
    }

    #[test]
    fn handles_are_unique() {
        let mut world = MirrorWorld::new();
        let a = world.spawn_entity(NetworkId(1), "a");
        world.despawn_entity(a);
        let b = world.spawn_entity(NetworkId(1), "a");
        assert_ne!(a, b);
    }
}
