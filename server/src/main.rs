use clap::Parser;
use log::info;
use server::game::TurnConfig;
use server::network::{Server, ServerConfig};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8080")]
    port: u16,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "8")]
    max_clients: usize,

    /// Players required before the table starts
    #[arg(long, default_value = "2")]
    min_players: usize,

    /// Keep join order instead of shuffling the turn order
    #[arg(long)]
    no_shuffle: bool,

    /// Seed for the turn order shuffle
    #[arg(long)]
    seed: Option<u64>,

    /// End the game after this many rounds
    #[arg(long)]
    max_rounds: Option<u32>,

    /// Response window of End Turn phases in milliseconds
    #[arg(long, default_value = "0")]
    end_turn_window_ms: u64,

    /// Response window of Round End phases in milliseconds
    #[arg(long, default_value = "0")]
    round_end_window_ms: u64,
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        ServerConfig {
            addr: format!("{}:{}", args.host, args.port),
            max_clients: args.max_clients,
            min_players: args.min_players,
            turn: TurnConfig {
                shuffle_turn_order: !args.no_shuffle,
                rng_seed: args.seed,
                max_rounds: args.max_rounds,
            },
            end_turn_window: Duration::from_millis(args.end_turn_window_ms),
            round_end_window: Duration::from_millis(args.round_end_window_ms),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args = Args::parse();
    let config = ServerConfig::from(args);

    info!("Starting turn table server on {}", config.addr);
    info!(
        "Waiting for {} players (max {})",
        config.min_players, config.max_clients
    );

    let mut server = Server::new(config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
