//! Server network layer handling UDP communications and the table loop

use crate::client_manager::ClientManager;
use crate::error::ServerError;
use crate::game::{GameStatus, StandardTurns, TurnConfig, TurnedGame};
use crate::sequencer::TimerToken;
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{Packet, PhaseId, PlayerId, PROTOCOL_VERSION};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `ip:port` to bind the UDP socket to
    pub addr: String,
    pub max_clients: usize,
    /// The table starts once this many players are connected
    pub min_players: usize,
    pub turn: TurnConfig,
    /// How long players may respond before an End Turn phase resolves
    pub end_turn_window: Duration,
    pub round_end_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
            max_clients: 8,
            min_players: 2,
            turn: TurnConfig::default(),
            end_turn_window: Duration::ZERO,
            round_end_window: Duration::ZERO,
        }
    }
}

impl ServerConfig {
    /// Rules for the table: the configured response windows on top of the
    /// standard turn flow.
    pub fn rules(&self) -> StandardTurns {
        StandardTurns::new()
            .with_response_window(PhaseId::EndTurn, self.end_turn_window)
            .with_response_window(PhaseId::RoundEnd, self.round_end_window)
    }
}

#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: PlayerId },
    Shutdown,
}

#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<PlayerId>,
    },
}

pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    game: TurnedGame<StandardTurns>,
    min_players: usize,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
    timer_rx: mpsc::UnboundedReceiver<TimerToken>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .addr
            .parse()
            .map_err(|_| ServerError::InvalidAddress(config.addr.clone()))?;
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let game = TurnedGame::new(config.rules(), config.turn.clone()).with_timer_sink(timer_tx);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(config.max_clients))),
            game,
            min_players: config.min_players.max(1),
            server_tx,
            server_rx,
            game_tx,
            game_rx,
            timer_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn game(&self) -> &TurnedGame<StandardTurns> {
        &self.game
    }

    /// Sender that can stop a running server with [`ServerMessage::Shutdown`]
    pub fn shutdown_handle(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 2048];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    fn spawn_network_sender(&mut self) -> JoinHandle<()> {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }

                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<PlayerId>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    /// Sends everything the table queued to every connected client
    fn flush_broadcasts(&mut self) {
        for packet in self.game.drain_broadcasts() {
            debug!("Broadcasting {:?}", packet);
            self.broadcast_packet(packet, None);
        }
    }

    async fn client_id_for(&self, addr: SocketAddr) -> Option<PlayerId> {
        let clients = self.clients.read().await;
        clients.find_client_by_addr(addr)
    }

    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                client_version,
                name,
            } => {
                info!(
                    "Client '{}' connecting from {} (version: {})",
                    name, addr, client_version
                );

                if client_version != PROTOCOL_VERSION {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Protocol version mismatch".to_string(),
                        },
                        addr,
                    );
                    return;
                }
                if self.game.status() == GameStatus::Finished {
                    self.send_packet(
                        Packet::Disconnected {
                            reason: "Game is over".to_string(),
                        },
                        addr,
                    );
                    return;
                }

                // Reconnecting from the same address replaces the old seat
                if let Some(existing_id) = self.client_id_for(addr).await {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    self.clients.write().await.remove_client(&existing_id);
                    self.game.remove_player(existing_id);
                }

                let client_id = self.clients.write().await.add_client(addr, name.clone());

                match client_id {
                    Some(client_id) => {
                        self.send_packet(Packet::Connected { client_id }, addr);
                        self.game.add_player(client_id, name);
                        self.maybe_start().await;
                    }
                    None => {
                        self.send_packet(
                            Packet::Disconnected {
                                reason: "Server full".to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::PlayerDone => {
                let Some(client_id) = self.client_id_for(addr).await else {
                    warn!("PlayerDone from unknown address {}", addr);
                    return;
                };
                self.clients.write().await.touch(client_id);

                if let Err(e) = self.game.player_done(client_id) {
                    info!("Rejected PlayerDone from client {}: {}", client_id, e);
                    self.send_packet(
                        Packet::ActionRejected {
                            reason: e.to_string(),
                        },
                        addr,
                    );
                }
            }

            Packet::Heartbeat => {
                if let Some(client_id) = self.client_id_for(addr).await {
                    self.clients.write().await.touch(client_id);
                }
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.client_id_for(addr).await {
                    self.clients.write().await.remove_client(&client_id);
                    self.game.remove_player(client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn maybe_start(&mut self) {
        if self.game.status() != GameStatus::Waiting {
            return;
        }

        let connected = self.clients.read().await.len();
        if connected >= self.min_players {
            info!("{} players connected, starting the table", connected);
            self.game.start();
        } else {
            debug!(
                "Waiting for players: {}/{} connected",
                connected, self.min_players
            );
        }
    }

    /// Runs the table until the game is over or a shutdown is requested.
    ///
    /// Packets, client timeouts and phase timers are all handled in this one
    /// loop, so the table only ever sees serialized calls.
    pub async fn run(&mut self) -> Result<(), ServerError> {
        self.spawn_network_receiver();
        let sender = self.spawn_network_sender();
        self.spawn_timeout_checker();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                            self.game.remove_player(client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                Some(token) = self.timer_rx.recv() => {
                    self.game.on_timer_elapsed(token);
                },
            }

            self.flush_broadcasts();

            if self.game.status() == GameStatus::Finished {
                info!(
                    "Table finished after {} rounds",
                    self.game.round_number()
                );
                break;
            }
        }

        self.flush_broadcasts();

        // Dropping the last sender lets the sender task drain its queue and exit
        drop(std::mem::replace(
            &mut self.game_tx,
            mpsc::unbounded_channel().0,
        ));
        if let Err(e) = sender.await {
            error!("Network sender task failed: {}", e);
        }

        Ok(())
    }
}
