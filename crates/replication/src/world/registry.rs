use std::collections::{BTreeMap, BTreeSet};

use super::entity::{NetworkId, ReplicatedEntity, Transform};

/// A difference between the server's replicated record and the simulation.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Spawned(ReplicatedEntity),
    Moved(NetworkId, Transform),
    Destroyed(NetworkId),
}

/// The server's record of what every peer has been told exists.
///
/// Ordered by network id so catch-up replays entities in allocation order.
#[derive(Debug, Default)]
pub struct ReplicatedWorld {
    entities: BTreeMap<NetworkId, ReplicatedEntity>,
}

impl ReplicatedWorld {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id was already replicated; the record is replaced.
    pub fn spawn(&mut self, network_id: NetworkId, name: &str) -> bool {
        let previous = self.entities.insert(
            network_id,
            ReplicatedEntity::new(network_id, name, Transform::IDENTITY),
        );
        previous.is_none()
    }

    pub fn set_transform(&mut self, network_id: NetworkId, transform: Transform) -> bool {
        match self.entities.get_mut(&network_id) {
            Some(entity) => {
                entity.transform = transform;
                true
            }
            None => false,
        }
    }

    pub fn destroy(&mut self, network_id: NetworkId) -> Option<ReplicatedEntity> {
        self.entities.remove(&network_id)
    }

    pub fn get(&self, network_id: NetworkId) -> Option<&ReplicatedEntity> {
        self.entities.get(&network_id)
    }

    pub fn contains(&self, network_id: NetworkId) -> bool {
        self.entities.contains_key(&network_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicatedEntity> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Compares the simulation's current replicated set against this record.
    ///
    /// Does not mutate; the caller applies each change as it broadcasts it.
    pub fn diff<'a, I>(&self, current: I) -> Vec<EntityChange>
    where
        I: IntoIterator<Item = &'a ReplicatedEntity>,
    {
        let mut changes = Vec::new();
        let mut seen = BTreeSet::new();

        for entity in current {
            seen.insert(entity.network_id);
            match self.entities.get(&entity.network_id) {
                None => changes.push(EntityChange::Spawned(entity.clone())),
                Some(known) if known.name != entity.name => {
                    changes.push(EntityChange::Destroyed(entity.network_id));
                    changes.push(EntityChange::Spawned(entity.clone()));
                }
                Some(known) if known.transform != entity.transform => {
                    changes.push(EntityChange::Moved(entity.network_id, entity.transform));
                }
                Some(_) => {}
            }
        }

        for network_id in self.entities.keys() {
            if !seen.contains(network_id) {
                changes.push(EntityChange::Destroyed(*network_id));
            }
        }

        changes
    }
}
