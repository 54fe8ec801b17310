mod commands;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tether::{Client, ClientConfig, ClientEvent, MirrorWorld};
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::Command;

#[derive(Parser, Debug)]
#[command(name = "tether-client")]
#[command(about = "Headless replication client; stdin lines are sent as chat")]
struct Args {
    /// TOML file with client and transport settings; flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 'H', long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long, default_value_t = 60, help = "Client update rate in Hz")]
    update_rate: u32,
}

impl Args {
    fn client_config(&self) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ClientConfig::default(),
        };
        if let Some(host) = &self.host {
            config.server_host = host.clone();
        }
        if let Some(port) = self.port {
            config.server_port = port;
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = args.client_config()?;
    let target = format!("{}:{}", config.server_host, config.server_port);

    let mut client = Client::new(config);
    client.initialize()?;
    client
        .connect_configured()
        .with_context(|| format!("connecting to {}", target))?;

    let mut world = MirrorWorld::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut update = tokio::time::interval(Duration::from_secs_f64(
        1.0 / f64::from(args.update_rate.max(1)),
    ));

    loop {
        tokio::select! {
            _ = update.tick() => {
                client.update(&mut world);
                for event in client.drain_events() {
                    log_event(&event);
                }
                if !client.is_connected() {
                    log::info!("Connection to {} lost", target);
                    break;
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    log::info!("stdin closed");
                    break;
                };
                match Command::parse(&line) {
                    Some(Command::Chat(text)) => {
                        client.send_chat_message(&text);
                    }
                    Some(Command::Move(payload)) => {
                        client.send_input(&payload);
                    }
                    Some(Command::Status) => log::info!(
                        "{} entities mirrored, rtt {:.1}ms",
                        world.entity_count(),
                        client.rtt_ms().unwrap_or_default()
                    ),
                    Some(Command::Quit) => break,
                    None => {}
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.disconnect();
    Ok(())
}

fn log_event(event: &ClientEvent) {
    match event {
        ClientEvent::Connected { client_id } => log::info!("Connected as peer {}", client_id),
        ClientEvent::Disconnected => log::info!("Disconnected"),
        ClientEvent::EntitySpawned {
            network_id, name, ..
        } => log::debug!("Spawned {} {}", network_id, name),
        ClientEvent::EntityDestroyed { network_id, .. } => {
            log::debug!("Destroyed {}", network_id)
        }
        ClientEvent::Chat { text } => log::info!("[chat] {}", text),
    }
}
