use std::collections::HashMap;

use glam::{Quat, Vec3};
use tether::{NetworkId, PeerId, ReplicatedEntity, ServerEvent, Transform};

const ORBIT_RADIUS: f32 = 6.0;
const AVATAR_SPEED: f32 = 5.0;

/// Input payload: three signed bytes of movement direction, each /127.
pub fn decode_move_direction(payload: &[u8]) -> Option<Vec3> {
    let [x, y, z]: [u8; 3] = payload.get(..3)?.try_into().ok()?;
    Some(Vec3::new(
        f32::from(x as i8) / 127.0,
        f32::from(y as i8) / 127.0,
        f32::from(z as i8) / 127.0,
    ))
}

struct Avatar {
    network_id: NetworkId,
    velocity: Vec3,
}

/// A small world to replicate: props orbiting the origin plus one avatar per
/// connected peer, steered by that peer's input.
pub struct DemoSimulation {
    entities: Vec<ReplicatedEntity>,
    avatars: HashMap<PeerId, Avatar>,
    next_network_id: u32,
    elapsed: f32,
}

impl DemoSimulation {
    pub fn new(prop_count: usize) -> Self {
        let mut sim = Self {
            entities: Vec::new(),
            avatars: HashMap::new(),
            next_network_id: 1,
            elapsed: 0.0,
        };
        for i in 0..prop_count {
            sim.add_entity(format!("Prop{}", i), Transform::IDENTITY);
        }
        sim
    }

    fn add_entity(&mut self, name: String, transform: Transform) -> NetworkId {
        let network_id = NetworkId(self.next_network_id);
        self.next_network_id += 1;
        self.entities
            .push(ReplicatedEntity::new(network_id, name, transform));
        network_id
    }

    pub fn entities(&self) -> &[ReplicatedEntity] {
        &self.entities
    }

    pub fn handle_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::PeerConnected { peer } => {
                let network_id = self.add_entity(
                    format!("Player{}", peer.0),
                    Transform::from_position(Vec3::new(0.0, 1.0, 0.0)),
                );
                self.avatars.insert(
                    *peer,
                    Avatar {
                        network_id,
                        velocity: Vec3::ZERO,
                    },
                );
            }
            ServerEvent::PeerDisconnected { peer } => {
                if let Some(avatar) = self.avatars.remove(peer) {
                    self.entities.retain(|e| e.network_id != avatar.network_id);
                }
            }
            ServerEvent::Input { peer, payload } => {
                let Some(avatar) = self.avatars.get_mut(peer) else {
                    return;
                };
                match decode_move_direction(payload) {
                    Some(direction) => {
                        avatar.velocity = direction.clamp_length_max(1.0) * AVATAR_SPEED
                    }
                    None => log::debug!("Ignoring short input from {}", peer),
                }
            }
            ServerEvent::Chat { .. } => {}
        }
    }

    pub fn step(&mut self, dt: f32) {
        self.elapsed += dt;
        let avatar_ids: HashMap<NetworkId, Vec3> = self
            .avatars
            .values()
            .map(|a| (a.network_id, a.velocity))
            .collect();

        let prop_count = self.entities.len() - avatar_ids.len();
        for (index, entity) in self.entities.iter_mut().enumerate() {
            if let Some(velocity) = avatar_ids.get(&entity.network_id) {
                entity.transform.position += *velocity * dt;
                continue;
            }
            let phase = index as f32 / prop_count.max(1) as f32 * std::f32::consts::TAU;
            let angle = self.elapsed * 0.5 + phase;
            entity.transform.position = Vec3::new(
                angle.cos() * ORBIT_RADIUS,
                1.0 + (self.elapsed + phase).sin() * 0.5,
                angle.sin() * ORBIT_RADIUS,
            );
            entity.transform.rotation = Quat::from_rotation_y(-angle);
        }
    }
}
