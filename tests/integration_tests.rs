//! Integration tests for the turn table components
//!
//! These tests validate cross-component interactions: the table driven
//! through its public API, timers racing explicit completion, and real UDP
//! games between the server and bot clients.

use bincode::{deserialize, serialize};
use client::network::{BotClient, BotConfig};
use server::game::{StandardTurns, TurnConfig, TurnRules, TurnState, TurnedGame};
use server::network::{Server, ServerConfig};
use server::phase::Phase;
use server::sequencer::ResponseTimerMod;
use shared::{Packet, PhaseId, PhaseUpdate, PlayerId, PROTOCOL_VERSION};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn fixed_order() -> TurnConfig {
    TurnConfig {
        shuffle_turn_order: false,
        ..TurnConfig::default()
    }
}

fn entered(broadcasts: &[Packet]) -> Vec<(PhaseId, Option<PlayerId>)> {
    broadcasts
        .iter()
        .filter_map(|packet| match packet {
            Packet::PhaseEntered(update) => Some((update.phase, update.current_player)),
            _ => None,
        })
        .collect()
}

/// NETWORK PROTOCOL TESTS
mod protocol_tests {
    use super::*;

    /// Tests packet serialization round-trip for the table protocol
    #[tokio::test]
    async fn packet_serialization_roundtrip() {
        let update = PhaseUpdate {
            round: 2,
            phase: PhaseId::EndTurn,
            phase_name: "End Turn".to_string(),
            current_player: Some(7),
        };
        let test_packets = vec![
            Packet::Connect {
                client_version: PROTOCOL_VERSION,
                name: "alice".to_string(),
            },
            Packet::PlayerDone,
            Packet::Connected { client_id: 42 },
            Packet::PhaseChanged(update.clone()),
            Packet::ResponseWindowOpened {
                phase: PhaseId::EndTurn,
                window_ms: 1500,
            },
            Packet::GameOver {
                rounds_played: 3,
                reason: "round limit reached".to_string(),
            },
        ];

        for packet in test_packets {
            let serialized = serialize(&packet).unwrap();
            let deserialized: Packet = deserialize(&serialized).unwrap();

            match (&packet, &deserialized) {
                (Packet::Connect { .. }, Packet::Connect { .. }) => {}
                (Packet::PlayerDone, Packet::PlayerDone) => {}
                (Packet::Connected { .. }, Packet::Connected { .. }) => {}
                (Packet::PhaseChanged(sent), Packet::PhaseChanged(received)) => {
                    assert_eq!(sent, received);
                }
                (
                    Packet::ResponseWindowOpened { window_ms: sent, .. },
                    Packet::ResponseWindowOpened {
                        window_ms: received,
                        ..
                    },
                ) => assert_eq!(sent, received),
                (Packet::GameOver { .. }, Packet::GameOver { .. }) => {}
                _ => panic!("Packet type mismatch after serialization"),
            }
        }
    }

    /// Phase updates stay well under the receive buffer size
    #[test]
    fn phase_update_fits_receive_buffer() {
        let packet = Packet::PhaseEntered(PhaseUpdate {
            round: u32::MAX,
            phase: PhaseId::Custom(u16::MAX),
            phase_name: "x".repeat(256),
            current_player: Some(PlayerId::MAX),
        });

        let size = serialize(&packet).unwrap().len();
        assert!(size < 2048, "Phase update is {} bytes", size);
    }
}

/// TABLE FLOW TESTS
mod table_tests {
    use super::*;

    const COMBAT: u16 = 1;

    #[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
    struct CombatSetup {
        attacker: PlayerId,
        round: u32,
    }

    /// Inserts a combat phase between Main and End Turn
    struct CombatRules;

    impl TurnRules for CombatRules {
        fn next_turn_phase(&mut self, _state: &TurnState, ended: &Phase) -> Option<Phase> {
            match (ended.id(), ended.player()) {
                (PhaseId::BeginTurn, Some(player)) => Some(Phase::main(player)),
                (PhaseId::Main, Some(player)) => {
                    Some(Phase::custom(COMBAT, "Combat", Some(player)))
                }
                (PhaseId::Custom(COMBAT), Some(player)) => Some(Phase::end_turn(player)),
                _ => None,
            }
        }

        fn on_before_next_turn_phase(&mut self, state: &TurnState, next: &mut Phase) {
            if let (PhaseId::Custom(COMBAT), Some(attacker)) = (next.id(), next.player()) {
                let setup = CombatSetup {
                    attacker,
                    round: state.round_number(),
                };
                next.attach(&setup).unwrap();
            }
        }
    }

    #[test]
    fn custom_phase_waits_like_main() {
        let mut game = TurnedGame::new(CombatRules, fixed_order());
        game.add_player(1, "alice");
        game.add_player(2, "bob");
        game.start();

        game.player_done(1).unwrap();
        let combat = game.current_phase().unwrap();
        assert_eq!(combat.id(), PhaseId::Custom(COMBAT));
        assert_eq!(combat.name(), "Combat");
        assert!(combat.is_executed());
        assert_eq!(
            combat.payload::<CombatSetup>().unwrap().unwrap(),
            CombatSetup {
                attacker: 1,
                round: 1
            }
        );

        game.player_done(1).unwrap();
        assert_eq!(game.current_player(), Some(2));
        assert_eq!(game.current_phase().map(Phase::id), Some(PhaseId::Main));

        let phases = entered(&game.drain_broadcasts());
        let combat_at = phases
            .iter()
            .position(|p| *p == (PhaseId::Custom(COMBAT), Some(1)))
            .unwrap();
        assert_eq!(phases[combat_at + 1], (PhaseId::EndTurn, Some(1)));
    }

    #[test]
    fn phase_changed_precedes_phase_entered() {
        let mut game = TurnedGame::new(StandardTurns::new(), fixed_order());
        game.add_player(1, "alice");
        game.start();

        let broadcasts = game.drain_broadcasts();
        let position = |wanted: fn(&Packet) -> bool| broadcasts.iter().position(wanted).unwrap();

        let changed_at =
            position(|p| matches!(p, Packet::PhaseChanged(u) if u.phase == PhaseId::Main));
        let entered_at =
            position(|p| matches!(p, Packet::PhaseEntered(u) if u.phase == PhaseId::Main));
        assert!(changed_at < entered_at);
    }

    #[test]
    fn departures_and_arrivals_between_rounds() {
        let mut game = TurnedGame::new(StandardTurns::new(), fixed_order());
        for player in 1..=3 {
            game.add_player(player, format!("player-{}", player));
        }
        game.start();

        game.remove_player(3);
        game.player_done(1).unwrap();
        game.add_player(4, "dave");
        game.player_done(2).unwrap();
        assert_eq!(game.current_player(), Some(4));
        game.player_done(4).unwrap();

        assert_eq!(game.round_number(), 2);
        assert_eq!(game.player_turn_order(), &[1, 2, 4]);
        assert_eq!(game.current_player(), Some(1));
    }
}

/// TIMER AND CONCURRENCY TESTS
mod timer_tests {
    use super::*;

    /// Elapsed timers and explicit completion race on a shared table;
    /// every End Turn must execute exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timer_races_explicit_completion() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let rules =
            StandardTurns::new().with_response_window(PhaseId::EndTurn, Duration::from_millis(5));
        let game = TurnedGame::new(rules, fixed_order()).with_timer_sink(tx);
        let game = Arc::new(Mutex::new(game));

        {
            let mut game = game.lock().unwrap();
            game.add_player(1, "alice");
            game.add_player(2, "bob");
            game.start();
        }

        let timer_game = Arc::clone(&game);
        let timer_task = tokio::spawn(async move {
            while let Some(token) = rx.recv().await {
                timer_game.lock().unwrap().on_timer_elapsed(token);
            }
        });

        let turns = 30;
        let mut broadcasts = Vec::new();

        for turn in 0..turns {
            {
                let mut game = game.lock().unwrap();
                let player = game.current_player().unwrap();
                game.player_done(player).unwrap();
                broadcasts.extend(game.drain_broadcasts());
            }

            // Alternate between racing the timer and losing to it
            sleep(Duration::from_millis(if turn % 2 == 0 { 5 } else { 1 })).await;
            {
                let mut game = game.lock().unwrap();
                if game.current_phase().map(Phase::id) == Some(PhaseId::EndTurn) {
                    game.end_phase();
                }
            }

            let reached_main = timeout(Duration::from_secs(1), async {
                loop {
                    {
                        let mut game = game.lock().unwrap();
                        broadcasts.extend(game.drain_broadcasts());
                        if game.current_phase().map(Phase::id) == Some(PhaseId::Main) {
                            return;
                        }
                    }
                    sleep(Duration::from_millis(1)).await;
                }
            })
            .await;
            assert!(reached_main.is_ok(), "turn {} never reached Main", turn);
        }

        timer_task.abort();

        let phases = entered(&broadcasts);
        let end_turns = phases.iter().filter(|(p, _)| *p == PhaseId::EndTurn).count();
        let mains = phases.iter().filter(|(p, _)| *p == PhaseId::Main).count();
        assert_eq!(end_turns, turns);
        assert_eq!(mains, turns + 1);
        assert_eq!(game.lock().unwrap().round_number(), 1 + turns as u32 / 2);
    }

    #[tokio::test(start_paused = true)]
    async fn indefinite_round_end_holds_until_everyone_done() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let rules = StandardTurns::new().with_timer_mod(PhaseId::RoundEnd, ResponseTimerMod::Indefinite);
        let mut game = TurnedGame::new(rules, fixed_order()).with_timer_sink(tx);
        game.add_player(1, "alice");
        game.add_player(2, "bob");
        game.start();

        game.player_done(1).unwrap();
        game.player_done(2).unwrap();
        assert_eq!(game.current_phase().map(Phase::id), Some(PhaseId::RoundEnd));
        assert!(!game.sequencer().has_armed_timer());

        sleep(Duration::from_secs(3600)).await;
        assert_eq!(game.current_phase().map(Phase::id), Some(PhaseId::RoundEnd));

        game.player_done(2).unwrap();
        game.player_done(1).unwrap();
        assert_eq!(game.round_number(), 2);
        assert_eq!(game.current_player(), Some(1));
    }
}

/// END-TO-END NETWORK TESTS
mod network_tests {
    use super::*;

    fn bot_config(server: &str, name: &str) -> BotConfig {
        BotConfig {
            server: server.to_string(),
            name: name.to_string(),
            think_time: Duration::from_millis(20),
            idle_timeout: Duration::from_secs(5),
            ..BotConfig::default()
        }
    }

    /// Two bots play a full two-round game against a real server
    #[tokio::test]
    async fn bots_play_until_round_limit() {
        let config = ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            min_players: 2,
            turn: TurnConfig {
                shuffle_turn_order: false,
                rng_seed: None,
                max_rounds: Some(2),
            },
            end_turn_window: Duration::from_millis(50),
            ..ServerConfig::default()
        };
        let mut server = Server::new(config).await.unwrap();
        let server_addr = server.local_addr().unwrap().to_string();
        let server_task = tokio::spawn(async move { server.run().await });

        let mut alice = BotClient::new(bot_config(&server_addr, "alice")).await.unwrap();
        let mut bob = BotClient::new(bot_config(&server_addr, "bob")).await.unwrap();
        let alice_task = tokio::spawn(async move { alice.run().await });
        let bob_task = tokio::spawn(async move { bob.run().await });

        let (alice, bob) = timeout(Duration::from_secs(10), async {
            (alice_task.await, bob_task.await)
        })
        .await
        .expect("game did not finish in time");

        let alice = alice.unwrap().unwrap();
        let bob = bob.unwrap().unwrap();

        for summary in [&alice, &bob] {
            assert_eq!(summary.turns_taken, 2);
            assert_eq!(summary.rounds_seen, 2);
            assert_eq!(summary.stop_reason.as_deref(), Some("round limit reached"));
        }
        assert_ne!(alice.client_id, bob.client_id);

        let server_result = timeout(Duration::from_secs(5), server_task)
            .await
            .expect("server did not stop after game over");
        assert!(server_result.unwrap().is_ok());
    }

    /// A full server turns late connections away
    #[tokio::test]
    async fn full_server_rejects_connection() {
        let config = ServerConfig {
            addr: "127.0.0.1:0".to_string(),
            max_clients: 1,
            min_players: 2,
            ..ServerConfig::default()
        };
        let mut server = Server::new(config).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = server.shutdown_handle();
        let server_task = tokio::spawn(async move { server.run().await });

        let first = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let connect = serialize(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
            name: "player".to_string(),
        })
        .unwrap();

        let mut buf = [0u8; 2048];

        first.send_to(&connect, server_addr).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(2), first.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            deserialize::<Packet>(&buf[..len]).unwrap(),
            Packet::Connected { .. }
        ));

        second.send_to(&connect, server_addr).await.unwrap();
        let (len, _) = timeout(Duration::from_secs(2), second.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        match deserialize::<Packet>(&buf[..len]).unwrap() {
            Packet::Disconnected { reason } => assert_eq!(reason, "Server full"),
            other => panic!("Expected Disconnected, got {:?}", other),
        }

        shutdown
            .send(server::network::ServerMessage::Shutdown)
            .unwrap();
        let result = timeout(Duration::from_secs(2), server_task).await.unwrap();
        assert!(result.unwrap().is_ok());
    }
}
