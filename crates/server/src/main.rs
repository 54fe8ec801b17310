mod config;
mod simulation;

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tether::{Server, ServerEvent};

use config::Args;
use simulation::DemoSimulation;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.server_config()?;
    let tick_interval = config.tick_interval();

    let mut server = Server::new();
    server.initialize(config)?;
    if let Some(loss) = args.packet_loss() {
        log::info!("Simulating {:.1}% outgoing packet loss", loss.loss_percent);
        server.set_packet_loss(loss);
    }
    server.start()?;

    if let Some(addr) = server.local_addr() {
        log::info!(
            "Server listening on {} ({} Hz, {} peers max)",
            addr,
            server.config().tick_rate,
            server.config().max_peers
        );
    }

    let mut sim = DemoSimulation::new(args.demo_entities);
    server.sync_entities(sim.entities());

    let mut step = tokio::time::interval(tick_interval);
    let mut status = tokio::time::interval(Duration::from_secs(args.status_interval.max(1)));
    let dt = tick_interval.as_secs_f32();

    loop {
        tokio::select! {
            _ = step.tick() => {
                for event in server.drain_events() {
                    log_event(&event);
                    sim.handle_event(&event);
                }
                sim.step(dt);
                server.sync_entities(sim.entities());
            }
            _ = status.tick() => {
                let stats = server.stats();
                log::info!(
                    "tick {} | {} peers | rtt {:.1}ms | sent {} B | recv {} B | resent {}",
                    server.tick_count(),
                    server.peer_count(),
                    stats.rtt_ms,
                    stats.bytes_sent,
                    stats.bytes_received,
                    stats.retransmissions
                );
            }
            _ = tokio::signal::ctrl_c() => {
                log::info!("Shutting down");
                break;
            }
        }
    }

    server.broadcast_chat("server shutting down");
    server.shutdown();
    Ok(())
}

fn log_event(event: &ServerEvent) {
    match event {
        ServerEvent::PeerConnected { peer } => log::info!("{} connected", peer),
        ServerEvent::PeerDisconnected { peer } => log::info!("{} disconnected", peer),
        ServerEvent::Input { peer, payload } => {
            log::trace!("{} input ({} bytes)", peer, payload.len())
        }
        ServerEvent::Chat { peer, text } => log::info!("[{}] {}", peer, text),
    }
}
