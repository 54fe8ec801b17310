use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether::{PacketLossSimulation, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(about = "Authoritative replication server")]
pub struct Args {
    /// TOML file with server and transport settings; flags override it.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[arg(short, long)]
    pub port: Option<u16>,

    #[arg(short, long)]
    pub tick_rate: Option<u32>,

    #[arg(short, long)]
    pub max_peers: Option<usize>,

    #[arg(long, default_value_t = 3, help = "Number of demo entities to simulate")]
    pub demo_entities: usize,

    #[arg(long, help = "Enable outgoing packet loss simulation")]
    pub simulate_packet_loss: bool,

    #[arg(long, default_value_t = 0.0, help = "Packet loss percentage (0-100)")]
    pub loss_percent: f32,

    #[arg(long, default_value_t = 5, help = "Seconds between status lines")]
    pub status_interval: u64,
}

impl Args {
    pub fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(tick_rate) = self.tick_rate {
            config.tick_rate = tick_rate;
        }
        if let Some(max_peers) = self.max_peers {
            config.max_peers = max_peers;
        }
        Ok(config)
    }

    pub fn packet_loss(&self) -> Option<PacketLossSimulation> {
        self.simulate_packet_loss
            .then(|| PacketLossSimulation::with_loss(self.loss_percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from(["tether-server", "--port", "9000", "--max-peers", "8"]);
        let config = args.server_config().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_peers, 8);
        assert_eq!(config.tick_rate, 60);
        assert!(args.packet_loss().is_none());
    }

    #[test]
    fn loss_flags() {
        let args = Args::parse_from([
            "tether-server",
            "--simulate-packet-loss",
            "--loss-percent",
            "12.5",
        ]);
        let loss = args.packet_loss().unwrap();
        assert!(loss.enabled);
        assert_eq!(loss.loss_percent, 12.5);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let args = Args::parse_from(["tether-server", "--config", "/nonexistent/server.toml"]);
        assert!(args.server_config().is_err());
    }
}
