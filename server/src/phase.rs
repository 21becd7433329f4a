//! Named stages of a round or turn, sequenced by the table's [`Sequencer`]
//!
//! [`Sequencer`]: crate::sequencer::Sequencer

use crate::sequencer::{EffectResult, SequencerItem};
use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::{PhaseId, PlayerId};
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Phase {
    id: PhaseId,
    name: String,
    /// Player whose turn this phase belongs to; `None` for round-level phases
    player: Option<PlayerId>,
    response_timeout: Duration,
    players_done: HashSet<PlayerId>,
    payload: Option<Vec<u8>>,
    is_current: bool,
    executed: bool,
}

impl Phase {
    pub fn new(id: PhaseId, player: Option<PlayerId>) -> Self {
        Self {
            id,
            name: id.default_name(),
            player,
            response_timeout: Duration::ZERO,
            players_done: HashSet::new(),
            payload: None,
            is_current: false,
            executed: false,
        }
    }

    pub fn round_startup() -> Self {
        Self::new(PhaseId::RoundStartup, None)
    }

    pub fn round_end() -> Self {
        Self::new(PhaseId::RoundEnd, None)
    }

    pub fn begin_turn(player: PlayerId) -> Self {
        Self::new(PhaseId::BeginTurn, Some(player))
    }

    pub fn main(player: PlayerId) -> Self {
        Self::new(PhaseId::Main, Some(player))
    }

    pub fn end_turn(player: PlayerId) -> Self {
        Self::new(PhaseId::EndTurn, Some(player))
    }

    pub fn custom(code: u16, name: impl Into<String>, player: Option<PlayerId>) -> Self {
        Self::new(PhaseId::Custom(code), player).with_name(name)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn id(&self) -> PhaseId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn player(&self) -> Option<PlayerId> {
        self.player
    }

    pub fn is_current(&self) -> bool {
        self.is_current
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    /// Attaches game-specific data to this phase
    pub fn attach<T: Serialize>(&mut self, value: &T) -> Result<(), bincode::Error> {
        self.payload = Some(bincode::serialize(value)?);
        Ok(())
    }

    /// Decodes the attached data, if any
    pub fn payload<T: DeserializeOwned>(&self) -> Option<Result<T, bincode::Error>> {
        self.payload.as_deref().map(bincode::deserialize)
    }

    /// Records that `player` is done with this phase.
    ///
    /// Returns true once the phase is complete: a turn phase completes when
    /// its owner is done, a round-level phase when every participant is.
    pub fn player_done(&mut self, player: PlayerId, participants: &[PlayerId]) -> bool {
        self.players_done.insert(player);
        self.is_complete(participants)
    }

    /// Whether the players done so far complete this phase for `participants`.
    ///
    /// A round-level phase with nobody seated is never complete.
    pub fn is_complete(&self, participants: &[PlayerId]) -> bool {
        match self.player {
            Some(owner) => self.players_done.contains(&owner),
            None => {
                !participants.is_empty()
                    && participants
                        .iter()
                        .all(|participant| self.players_done.contains(participant))
            }
        }
    }

    pub fn players_done(&self) -> usize {
        self.players_done.len()
    }
}

impl SequencerItem for Phase {
    fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    fn try_execute_effect(&mut self) -> EffectResult {
        self.executed = true;
        EffectResult::ok_with(format!("{} entered", self.name))
    }

    fn on_became_current(&mut self) {
        self.is_current = true;
        debug!("Phase '{}' became current", self.name);
    }

    fn on_became_not_current(&mut self) {
        self.is_current = false;
    }
}
