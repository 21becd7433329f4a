//! # Turn Table Client Library
//!
//! A headless player for the turn table server. The bot connects over UDP,
//! follows the phase updates the server broadcasts and reports itself done
//! once its own Main phase has run for a configurable think time.
//!
//! ## Protocol Flow
//!
//! 1. `Connect` with the protocol version and a display name
//! 2. `Connected` assigns the player id
//! 3. `GameStarted` and `TurnOrder` announce who plays when
//! 4. `PhaseChanged` / `PhaseEntered` follow every phase of every turn
//! 5. `PlayerDone` ends our Main phase
//! 6. `GameOver` or `Disconnected` stops the bot
//!
//! A `Heartbeat` goes out every second so the server does not time us out
//! while other players take their turns.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{BotClient, BotConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let config = BotConfig {
//!         server: "127.0.0.1:8080".to_string(),
//!         name: "alice".to_string(),
//!         think_time: Duration::from_millis(500),
//!         ..BotConfig::default()
//!     };
//!
//!     let mut bot = BotClient::new(config).await?;
//!     let summary = bot.run().await?;
//!     println!("took {} turns", summary.turns_taken);
//!
//!     Ok(())
//! }
//! ```

pub mod network;
