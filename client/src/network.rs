//! Headless player that connects to a table and takes its turns

use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use rand::Rng;
use shared::{Packet, PhaseId, PhaseUpdate, PlayerId, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{interval, sleep_until, Instant};

pub type BotResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

#[derive(Debug, Clone)]
pub struct BotConfig {
    /// `ip:port` of the server
    pub server: String,
    pub name: String,
    /// Delay between our Main phase starting and reporting done
    pub think_time: Duration,
    /// Up to this much extra think time, picked at random each turn
    pub think_jitter: Duration,
    /// Give up when the server has been silent this long
    pub idle_timeout: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            server: "127.0.0.1:8080".to_string(),
            name: "bot".to_string(),
            think_time: Duration::from_millis(250),
            think_jitter: Duration::ZERO,
            idle_timeout: Duration::from_secs(30),
        }
    }
}

/// What the bot saw before it stopped
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BotSummary {
    pub client_id: Option<PlayerId>,
    pub turns_taken: u32,
    pub rounds_seen: u32,
    pub stop_reason: Option<String>,
}

pub struct BotClient {
    socket: UdpSocket,
    server_addr: SocketAddr,
    config: BotConfig,
    client_id: Option<PlayerId>,
    turn_order: Vec<PlayerId>,
    last_update: Option<PhaseUpdate>,
    done_at: Option<Instant>,
    stopped: bool,
    summary: BotSummary,
}

impl BotClient {
    pub async fn new(config: BotConfig) -> BotResult<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = config.server.parse()?;

        Ok(BotClient {
            socket,
            server_addr,
            config,
            client_id: None,
            turn_order: Vec::new(),
            last_update: None,
            done_at: None,
            stopped: false,
            summary: BotSummary::default(),
        })
    }

    pub fn client_id(&self) -> Option<PlayerId> {
        self.client_id
    }

    pub fn turn_order(&self) -> &[PlayerId] {
        &self.turn_order
    }

    pub fn last_update(&self) -> Option<&PhaseUpdate> {
        self.last_update.as_ref()
    }

    pub fn summary(&self) -> &BotSummary {
        &self.summary
    }

    async fn send_packet(&self, packet: &Packet) -> BotResult<()> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn connect(&mut self) -> BotResult<()> {
        info!("Connecting to {} as '{}'...", self.server_addr, self.config.name);

        let packet = Packet::Connect {
            client_version: PROTOCOL_VERSION,
            name: self.config.name.clone(),
        };
        self.send_packet(&packet).await
    }

    fn is_my_main_phase(&self, update: &PhaseUpdate) -> bool {
        update.phase == PhaseId::Main
            && update.current_player.is_some()
            && update.current_player == self.client_id
    }

    fn think_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.think_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return self.config.think_time;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.config.think_time + Duration::from_millis(extra)
    }

    fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected { client_id } => {
                info!("Connected! Player ID: {}", client_id);
                self.client_id = Some(client_id);
                self.summary.client_id = Some(client_id);
            }

            Packet::GameStarted { turn_order } => {
                info!("Game started, turn order {:?}", turn_order);
                self.turn_order = turn_order;
            }

            Packet::TurnOrder { turn_order } => {
                debug!("Turn order is now {:?}", turn_order);
                self.turn_order = turn_order;
            }

            Packet::PhaseChanged(update) => {
                info!(
                    "Round {}: {} ({:?})",
                    update.round, update.phase_name, update.current_player
                );
                if self.is_my_main_phase(&update) {
                    let think = self.think_delay();
                    debug!("Our turn, thinking for {:?}", think);
                    self.done_at = Some(Instant::now() + think);
                } else if update.current_player != self.client_id {
                    self.done_at = None;
                }
                self.summary.rounds_seen = self.summary.rounds_seen.max(update.round);
                self.last_update = Some(update);
            }

            Packet::PhaseEntered(update) => {
                debug!("Entered '{}' in round {}", update.phase_name, update.round);
                self.last_update = Some(update);
            }

            Packet::ResponseWindowOpened { phase, window_ms } => {
                debug!("{} resolves in {}ms", phase, window_ms);
            }

            Packet::ActionRejected { reason } => {
                warn!("Server rejected our action: {}", reason);
            }

            Packet::GameOver {
                rounds_played,
                reason,
            } => {
                info!("Game over after {} rounds: {}", rounds_played, reason);
                self.summary.rounds_seen = rounds_played;
                self.stop(reason);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.client_id = None;
                self.stop(reason);
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    fn stop(&mut self, reason: String) {
        self.stopped = true;
        self.done_at = None;
        self.summary.stop_reason = Some(reason);
    }

    async fn finish_turn(&mut self) -> BotResult<()> {
        self.done_at = None;
        self.summary.turns_taken += 1;
        info!("Done with our turn");
        self.send_packet(&Packet::PlayerDone).await
    }

    /// Plays until the game ends, the server disconnects us, or the server
    /// goes silent for longer than the idle timeout.
    pub async fn run(&mut self) -> BotResult<BotSummary> {
        self.connect().await?;

        let mut heartbeat_interval = interval(Duration::from_secs(1));
        let mut buffer = [0u8; 2048];
        let mut last_heard = Instant::now();

        while !self.stopped {
            let think_deadline = self.done_at.unwrap_or_else(Instant::now);
            let idle_deadline = last_heard + self.config.idle_timeout;

            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => {
                            last_heard = Instant::now();
                            match deserialize::<Packet>(&buffer[0..len]) {
                                Ok(packet) => self.handle_packet(packet),
                                Err(e) => warn!("Failed to deserialize packet: {}", e),
                            }
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = sleep_until(think_deadline), if self.done_at.is_some() => {
                    self.finish_turn().await?;
                },

                _ = heartbeat_interval.tick() => {
                    if self.client_id.is_some() {
                        self.send_packet(&Packet::Heartbeat).await?;
                    }
                },

                _ = sleep_until(idle_deadline) => {
                    warn!("No word from the server for {:?}", self.config.idle_timeout);
                    if self.client_id.is_some() {
                        if let Err(e) = self.send_packet(&Packet::Disconnect).await {
                            warn!("Failed to send disconnect: {}", e);
                        }
                    }
                    self.stop("server timed out".to_string());
                },
            }
        }

        Ok(self.summary.clone())
    }
}
