//! # Turn Table Server Library
//!
//! This library provides the authoritative server for turn-based tables. It
//! decides whose turn it is, which phase of the turn is running, and when a
//! phase's response window has run out, and broadcasts every change to the
//! connected players.
//!
//! ## Core Responsibilities
//!
//! ### Phase Sequencing
//! Every stage of play is a [`phase::Phase`] executed by a
//! [`sequencer::Sequencer`]. The sequencer keeps exactly one current item,
//! resolves its response window and fires it immediately, after a one-shot
//! timer, or only when asked to.
//!
//! ### Turn Flow
//! [`game::TurnedGame`] walks `Round Startup → Begin Turn → Main → End Turn →
//! … → Round End` for every player in the turn order, round after round.
//! Game types hook into the flow through [`game::TurnRules`].
//!
//! ### Client Management
//! Handles the lifecycle of player connections:
//! - Connection establishment and player id assignment
//! - Heartbeat tracking and timeout cleanup
//! - Mirroring joins and leaves into the table
//!
//! ## Architecture Design
//!
//! ### Single Owner
//! The table is owned by one task. Incoming packets, client timeouts and
//! elapsed phase timers all arrive on channels polled by that task, so table
//! state is never touched concurrently. Timers never mutate the sequencer
//! themselves; they hand a [`sequencer::TimerToken`] back to the owner, and
//! tokens for phases that are no longer current are ignored.
//!
//! ### UDP-Based Communication
//! Uses UDP sockets with `bincode`-encoded [`shared::Packet`]s. Phase updates
//! carry the full phase snapshot, so a lost packet is repaired by the next one.
//!
//! ## Module Organization
//!
//! - `sequencer`: the single-current-item execution engine and its timers
//! - `phase`: named turn and round stages
//! - `game`: the round → turn → phase state machine and its rule hooks
//! - `client_manager`: connection tracking
//! - `network`: UDP front end and the table loop
//! - `error`: server and player action errors
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::network::{Server, ServerConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         addr: "127.0.0.1:8080".to_string(),
//!         min_players: 2,
//!         end_turn_window: Duration::from_secs(3),
//!         ..ServerConfig::default()
//!     };
//!
//!     // Runs until the game is over:
//!     // - seats players as they connect and starts at `min_players`
//!     // - advances phases on PlayerDone packets and elapsed timers
//!     // - broadcasts phase changes to every connected player
//!     let mut server = Server::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod error;
pub mod game;
pub mod network;
pub mod phase;
pub mod sequencer;
