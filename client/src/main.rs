use clap::Parser;
use client::network::{BotClient, BotConfig};
use log::info;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:8080")]
    server: String,

    /// Display name at the table
    #[arg(short = 'n', long, default_value = "bot")]
    name: String,

    /// How long to think before ending our Main phase, in milliseconds
    #[arg(short = 't', long, default_value = "250")]
    think_ms: u64,

    /// Random extra think time of up to this many milliseconds
    #[arg(short = 'j', long, default_value = "0")]
    jitter_ms: u64,

    /// Give up after this many seconds without hearing from the server
    #[arg(long, default_value = "30")]
    idle_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Set RUST_LOG=info for detailed logging");
    }

    let args = Args::parse();

    info!("Starting bot '{}'...", args.name);
    info!("Connecting to: {}", args.server);

    let config = BotConfig {
        server: args.server,
        name: args.name,
        think_time: Duration::from_millis(args.think_ms),
        think_jitter: Duration::from_millis(args.jitter_ms),
        idle_timeout: Duration::from_secs(args.idle_timeout_secs),
    };

    let mut bot = BotClient::new(config).await?;
    let summary = bot.run().await?;

    info!(
        "Stopped after {} turns over {} rounds: {}",
        summary.turns_taken,
        summary.rounds_seen,
        summary.stop_reason.as_deref().unwrap_or("unknown")
    );

    Ok(())
}
