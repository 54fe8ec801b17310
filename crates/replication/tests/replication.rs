use std::thread;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use tether::{
    Client, ClientConfig, ClientEvent, MirrorWorld, NetworkId, PacketLossSimulation,
    ReplicatedEntity, Server, ServerConfig, ServerEvent, Transform,
};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn running_server(max_peers: usize) -> (Server, u16) {
    let mut server = Server::new();
    server
        .initialize(ServerConfig::new(0, max_peers, 60))
        .unwrap();
    let port = server.local_addr().unwrap().port();
    server.start().unwrap();
    (server, port)
}

fn connected_client(port: u16) -> Client {
    let mut client = Client::default();
    client.initialize().unwrap();
    client.connect("127.0.0.1", port).unwrap();
    client
}

#[test]
fn test_peer_registered_within_two_ticks() {
    init_logger();
    let mut server = Server::new();
    server.initialize(ServerConfig::new(7777, 4, 60)).unwrap();
    server.start().unwrap();

    let mut client = Client::new(ClientConfig {
        connect_timeout_ms: 5000,
        ..ClientConfig::default()
    });
    client.initialize().unwrap();
    client.connect("localhost", 7777).unwrap();
    let connected_at = server.tick_count();

    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));
    assert!(server.tick_count() <= connected_at + 2);
    assert!(client.is_connected());
    assert!(client.client_id().is_some());

    let events = server.drain_events();
    assert!(matches!(
        events.as_slice(),
        [ServerEvent::PeerConnected { .. }]
    ));
    assert_eq!(server.peer_ids(), vec![events[0].peer()]);
}

#[test]
fn test_spawn_reaches_every_client() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut alice = connected_client(port);
    let mut bob = connected_client(port);
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 2));

    server.broadcast_entity_spawn(NetworkId(42), "Rock");

    let mut alice_world = MirrorWorld::new();
    let mut bob_world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(2), || {
        alice.update(&mut alice_world);
        bob.update(&mut bob_world);
        alice.handle_for(NetworkId(42)).is_some() && bob.handle_for(NetworkId(42)).is_some()
    }));

    for world in [&alice_world, &bob_world] {
        let rock = world.find(NetworkId(42)).unwrap();
        assert_eq!(rock.name, "Rock");
    }
}

#[test]
fn test_entity_lifecycle() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    server.broadcast_entity_spawn(NetworkId(7), "Box");
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        client.handle_for(NetworkId(7)).is_some()
    }));

    let target = Transform {
        position: Vec3::new(1.0, 2.0, 3.0),
        rotation: Quat::from_rotation_y(1.0),
        scale: Vec3::splat(2.0),
    };
    let handle = client.handle_for(NetworkId(7)).unwrap();
    // Transforms are unreliable; resend until one lands.
    assert!(wait_for(Duration::from_secs(2), || {
        server.broadcast_entity_transform(NetworkId(7), target);
        client.update(&mut world);
        world.get(handle).is_some_and(|e| e.transform == target)
    }));

    server.broadcast_entity_destroy(NetworkId(7));
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        client.handle_for(NetworkId(7)).is_none()
    }));
    assert_eq!(world.entity_count(), 0);

    let events = client.drain_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, ClientEvent::EntityDestroyed { network_id, .. } if *network_id == NetworkId(7))));
}

#[test]
fn test_late_joiner_receives_catch_up() {
    init_logger();
    let (mut server, port) = running_server(4);

    let placed = Transform::from_position(Vec3::new(-4.0, 0.5, 9.0));
    let tree = server.replicate_entity("Tree", placed);
    let rock = server.replicate_entity("Rock", Transform::IDENTITY);
    server.broadcast_entity_destroy(rock);

    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        world.find(tree).is_some_and(|e| e.transform == placed)
    }));
    assert!(client.handle_for(rock).is_none());
    assert_eq!(world.entity_count(), 1);
}

#[test]
fn test_input_and_chat_reach_server() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));
    server.drain_events();

    assert!(client.send_chat_message("hello"));
    let mut events = Vec::new();
    assert!(wait_for(Duration::from_secs(2), || {
        // Input is unreliable, so keep sending until one arrives.
        client.send_input(&[1, 2, 3]);
        events.extend(server.drain_events());
        let chat = events
            .iter()
            .any(|e| matches!(e, ServerEvent::Chat { text, .. } if text == "hello"));
        let input = events
            .iter()
            .any(|e| matches!(e, ServerEvent::Input { payload, .. } if payload == &[1, 2, 3]));
        chat && input
    }));
}

#[test]
fn test_long_chat_is_truncated() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    let long = "x".repeat(300);
    server.broadcast_chat(&long);

    let mut received = None;
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        for event in client.drain_events() {
            if let ClientEvent::Chat { text } = event {
                received = Some(text);
            }
        }
        received.is_some()
    }));
    assert_eq!(received, Some("x".repeat(255)));
}

#[test]
fn test_sync_entities_diffs_world() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    let mut entities = vec![
        ReplicatedEntity::new(NetworkId(1), "Box", Transform::IDENTITY),
        ReplicatedEntity::new(NetworkId(2), "Ball", Transform::IDENTITY),
    ];
    server.sync_entities(&entities);
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        world.entity_count() == 2
    }));

    entities.remove(0);
    entities[0].transform = Transform::from_position(Vec3::Y);
    server.sync_entities(&entities);
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        world.entity_count() == 1
            && world
                .find(NetworkId(2))
                .is_some_and(|e| e.transform.position == Vec3::Y)
    }));

    let next = server.replicate_entity("Late", Transform::IDENTITY);
    assert_eq!(next, NetworkId(3));
}

#[test]
fn test_kicked_client_clears_mirror() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    server.replicate_entity("Box", Transform::IDENTITY);
    assert!(wait_for(Duration::from_secs(2), || {
        client.update(&mut world);
        world.entity_count() == 1
    }));

    let peer = server.peer_ids()[0];
    server.kick(peer);
    assert!(wait_for(Duration::from_secs(3), || {
        client.update(&mut world);
        !client.is_connected()
    }));
    assert_eq!(world.entity_count(), 0);
    assert!(client.drain_events().contains(&ClientEvent::Disconnected));
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 0));
    assert!(!client.send_chat_message("still there?"));

    // Reconnecting is an explicit connect.
    client.connect("127.0.0.1", port).unwrap();
    assert!(client.is_connected());
}

#[test]
fn test_second_client_refused_when_full() {
    init_logger();
    let (server, port) = running_server(1);
    let _first = connected_client(port);

    let mut second = Client::default();
    second.initialize().unwrap();
    let result = second.connect("127.0.0.1", port);
    assert!(matches!(
        result,
        Err(tether::ClientError::Transport(tether::TransportError::Refused { .. }))
    ));
    assert_eq!(server.peer_count(), 1);
}

fn all_placed(world: &MirrorWorld, expected: &[(NetworkId, Transform)]) -> bool {
    expected
        .iter()
        .all(|(id, transform)| world.find(*id).is_some_and(|e| e.transform == *transform))
}

#[test]
fn test_static_entities_land_in_place_under_loss() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut client = connected_client(port);
    let mut world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    server.set_packet_loss(PacketLossSimulation::with_loss(30.0));

    let mut expected = Vec::new();
    for i in 0..20 {
        let placed = Transform::from_position(Vec3::new(5.0, 0.0, i as f32));
        let id = server.replicate_entity(&format!("Tree{}", i), placed);
        expected.push((id, placed));
    }

    // Static entities are never re-sent, so each spawn must carry its
    // transform through the loss.
    assert!(wait_for(Duration::from_secs(10), || {
        client.update(&mut world);
        all_placed(&world, &expected)
    }));
    assert_eq!(world.entity_count(), 20);
}

#[test]
fn test_synced_world_converges_under_loss() {
    init_logger();
    let (mut server, port) = running_server(4);
    let mut early = connected_client(port);
    let mut early_world = MirrorWorld::new();
    assert!(wait_for(Duration::from_secs(1), || server.peer_count() == 1));

    server.set_packet_loss(PacketLossSimulation::with_loss(30.0));

    let entities: Vec<ReplicatedEntity> = (1..=12)
        .map(|i| {
            ReplicatedEntity::new(
                NetworkId(i),
                format!("Crate{}", i),
                Transform {
                    position: Vec3::new(i as f32, 1.0, -2.0),
                    rotation: Quat::from_rotation_y(i as f32 * 0.1),
                    scale: Vec3::ONE,
                },
            )
        })
        .collect();
    server.sync_entities(&entities);
    let expected: Vec<(NetworkId, Transform)> =
        entities.iter().map(|e| (e.network_id, e.transform)).collect();

    // Joining while the server is still lossy exercises catch-up.
    let mut late = connected_client(port);
    let mut late_world = MirrorWorld::new();

    assert!(wait_for(Duration::from_secs(10), || {
        early.update(&mut early_world);
        late.update(&mut late_world);
        all_placed(&early_world, &expected) && all_placed(&late_world, &expected)
    }));
    assert_eq!(early_world.entity_count(), 12);
    assert_eq!(late_world.entity_count(), 12);
}
