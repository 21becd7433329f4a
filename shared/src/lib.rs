use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier the server assigns to each connected player
pub type PlayerId = u32;

pub const PROTOCOL_VERSION: u32 = 1;

/// Stage of a round or turn
///
/// The five standard stages drive the round → turn → phase loop. `Custom`
/// leaves room for game types that insert their own stages (combat, card
/// resolution) between the standard ones.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    RoundStartup,
    BeginTurn,
    Main,
    EndTurn,
    RoundEnd,
    Custom(u16),
}

impl PhaseId {
    pub fn default_name(&self) -> String {
        match self {
            PhaseId::RoundStartup => "Round Startup".to_string(),
            PhaseId::BeginTurn => "Begin Turn".to_string(),
            PhaseId::Main => "Main".to_string(),
            PhaseId::EndTurn => "End Turn".to_string(),
            PhaseId::RoundEnd => "Round End".to_string(),
            PhaseId::Custom(code) => format!("Custom {}", code),
        }
    }

    /// Round-level phases carry no player and end as soon as they execute
    pub fn is_round_level(&self) -> bool {
        matches!(self, PhaseId::RoundStartup | PhaseId::RoundEnd)
    }

    /// Turn bookends end as soon as they execute
    pub fn is_bookend(&self) -> bool {
        matches!(self, PhaseId::BeginTurn | PhaseId::EndTurn)
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.default_name())
    }
}

/// Snapshot of the table's phase state sent to every participant
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PhaseUpdate {
    pub round: u32,
    pub phase: PhaseId,
    pub phase_name: String,
    pub current_player: Option<PlayerId>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum Packet {
    Connect {
        client_version: u32,
        name: String,
    },
    PlayerDone,
    Heartbeat,
    Disconnect,

    Connected {
        client_id: PlayerId,
    },
    Disconnected {
        reason: String,
    },
    ActionRejected {
        reason: String,
    },
    GameStarted {
        turn_order: Vec<PlayerId>,
    },
    TurnOrder {
        turn_order: Vec<PlayerId>,
    },
    /// A phase became the current one
    PhaseChanged(PhaseUpdate),
    /// The current phase's effect fired
    PhaseEntered(PhaseUpdate),
    ResponseWindowOpened {
        phase: PhaseId,
        window_ms: u64,
    },
    GameOver {
        rounds_played: u32,
        reason: String,
    },
}
