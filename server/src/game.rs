//! Turn-based table state machine
//!
//! A [`TurnedGame`] drives `RoundStartup → BeginTurn → Main → EndTurn → … →
//! RoundEnd → RoundStartup` entirely through its [`Sequencer`]. Every
//! transition clears the sequence, adds the next [`Phase`] and activates it;
//! the reaction to a phase executing decides what comes next.
//!
//! Game types customize the flow through [`TurnRules`]. All methods take
//! `&mut self`, so the owner decides how calls are serialized: the network
//! server funnels packets and timer tokens through one task, tests may wrap
//! the table in a mutex.

use crate::error::ActionError;
use crate::phase::Phase;
use crate::sequencer::{
    ActivationId, ResponseTimerMod, SequenceMode, Sequencer, SequencerEvent, SequencerId,
    TimerToken,
};
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use shared::{Packet, PhaseId, PhaseUpdate, PlayerId};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    Waiting,
    Running,
    Finished,
}

/// Decision returned when a round has ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    Continue,
    GameOver,
}

#[derive(Debug, Clone)]
pub struct Participant {
    pub id: PlayerId,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Shuffle the turn order once when the table starts
    pub shuffle_turn_order: bool,
    pub rng_seed: Option<u64>,
    /// End the game after this many completed rounds
    pub max_rounds: Option<u32>,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            shuffle_turn_order: true,
            rng_seed: None,
            max_rounds: None,
        }
    }
}

/// Players, turn order and round bookkeeping of one table
#[derive(Debug, Clone)]
pub struct TurnState {
    participants: Vec<Participant>,
    player_turn_order: Vec<PlayerId>,
    turn_order_index: Option<usize>,
    current_player: Option<PlayerId>,
    round_number: u32,
    status: GameStatus,
}

impl TurnState {
    fn new() -> Self {
        Self {
            participants: Vec::new(),
            player_turn_order: Vec::new(),
            turn_order_index: None,
            current_player: None,
            round_number: 0,
            status: GameStatus::Waiting,
        }
    }

    pub fn round_number(&self) -> u32 {
        self.round_number
    }

    pub fn current_player(&self) -> Option<PlayerId> {
        self.current_player
    }

    pub fn player_turn_order(&self) -> &[PlayerId] {
        &self.player_turn_order
    }

    pub fn turn_order_index(&self) -> Option<usize> {
        self.turn_order_index
    }

    pub fn status(&self) -> GameStatus {
        self.status
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant_ids(&self) -> Vec<PlayerId> {
        self.participants.iter().map(|p| p.id).collect()
    }

    pub fn is_participant(&self, player: PlayerId) -> bool {
        self.participants.iter().any(|p| p.id == player)
    }

    /// Finds the next turn order slot held by a seated player.
    ///
    /// Scans forward from the cursor. Entries for players who have left are
    /// removed from the turn order as they are encountered. `None` means the
    /// turn order is exhausted for this round.
    pub fn get_next_turn_order_index(&mut self) -> Option<usize> {
        let mut index = self.turn_order_index.map_or(0, |current| current + 1);

        while index < self.player_turn_order.len() {
            let player = self.player_turn_order[index];
            if self.is_participant(player) {
                return Some(index);
            }
            debug!("Dropping departed player {} from the turn order", player);
            self.player_turn_order.remove(index);
        }

        None
    }
}

/// Hooks a concrete game type uses to layer its rules on top of the phase loop
///
/// Every hook has a default; the defaults give plain round-robin turns of
/// `BeginTurn → Main → EndTurn`.
pub trait TurnRules: Send {
    /// Called once when the table starts, if shuffling is enabled
    fn reorder_player_turn_order(&mut self, turn_order: &mut Vec<PlayerId>, rng: &mut StdRng) {
        turn_order.shuffle(rng);
    }

    fn create_initial_player_turn_phase(&mut self, _state: &TurnState, player: PlayerId) -> Phase {
        Phase::begin_turn(player)
    }

    /// Phase that follows `ended` within a turn; `None` if there is none
    fn next_turn_phase(&mut self, _state: &TurnState, ended: &Phase) -> Option<Phase> {
        match (ended.id(), ended.player()) {
            (PhaseId::BeginTurn, Some(player)) => Some(Phase::main(player)),
            (PhaseId::Main, Some(player)) => Some(Phase::end_turn(player)),
            _ => None,
        }
    }

    fn response_timer_mod(&self, _state: &TurnState, _phase: &Phase) -> ResponseTimerMod {
        ResponseTimerMod::default()
    }

    fn on_before_next_turn_phase(&mut self, _state: &TurnState, _next: &mut Phase) {}

    fn on_next_turn_phase(&mut self, _state: &TurnState, _phase: &Phase) {}

    fn on_before_round_end(&mut self, _state: &TurnState) {}

    fn on_round_ended(&mut self, _state: &TurnState) -> RoundOutcome {
        RoundOutcome::Continue
    }

    fn on_before_next_round(&mut self, _state: &TurnState) {}

    fn on_next_round_began(&mut self, _state: &TurnState) {}

    fn on_player_added(&mut self, _state: &TurnState, _player: PlayerId) {}

    fn on_player_removed(&mut self, _state: &TurnState, _player: PlayerId) {}
}

/// Stock rules with optional per-phase response windows
#[derive(Debug, Clone, Default)]
pub struct StandardTurns {
    timer_mods: HashMap<PhaseId, ResponseTimerMod>,
}

impl StandardTurns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response_window(self, phase: PhaseId, window: Duration) -> Self {
        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        self.with_timer_mod(phase, ResponseTimerMod::Offset(window_ms))
    }

    pub fn with_timer_mod(mut self, phase: PhaseId, timer_mod: ResponseTimerMod) -> Self {
        self.timer_mods.insert(phase, timer_mod);
        self
    }
}

impl TurnRules for StandardTurns {
    fn response_timer_mod(&self, _state: &TurnState, phase: &Phase) -> ResponseTimerMod {
        self.timer_mods
            .get(&phase.id())
            .copied()
            .unwrap_or_default()
    }
}

pub struct TurnedGame<R: TurnRules = StandardTurns> {
    rules: R,
    config: TurnConfig,
    state: TurnState,
    sequencer: Sequencer<Phase>,
    broadcasts: Vec<Packet>,
    rng: StdRng,
}

impl<R: TurnRules> TurnedGame<R> {
    pub fn new(rules: R, config: TurnConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            rules,
            config,
            state: TurnState::new(),
            sequencer: Sequencer::new(SequenceMode::Queue),
            broadcasts: Vec::new(),
            rng,
        }
    }

    /// Routes elapsed phase timers to `sink`; feed them back with
    /// [`TurnedGame::on_timer_elapsed`].
    pub fn with_timer_sink(mut self, sink: mpsc::UnboundedSender<TimerToken>) -> Self {
        self.sequencer.set_timer_sink(sink);
        self
    }

    pub fn state(&self) -> &TurnState {
        &self.state
    }

    pub fn rules(&self) -> &R {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut R {
        &mut self.rules
    }

    pub fn sequencer(&self) -> &Sequencer<Phase> {
        &self.sequencer
    }

    pub fn sequencer_id(&self) -> SequencerId {
        self.sequencer.id()
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.sequencer.current_item()
    }

    pub fn current_player(&self) -> Option<PlayerId> {
        self.state.current_player
    }

    pub fn round_number(&self) -> u32 {
        self.state.round_number
    }

    pub fn status(&self) -> GameStatus {
        self.state.status
    }

    pub fn player_turn_order(&self) -> &[PlayerId] {
        &self.state.player_turn_order
    }

    /// Packets queued for every participant since the last call
    pub fn drain_broadcasts(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.broadcasts)
    }

    /// Seats a player. Players joining a running game take their first turn
    /// after everyone already in the turn order.
    pub fn add_player(&mut self, player: PlayerId, name: impl Into<String>) -> bool {
        if self.state.status == GameStatus::Finished {
            warn!("Player {} cannot join a finished table", player);
            return false;
        }
        if self.state.is_participant(player) {
            return false;
        }

        let name = name.into();
        info!("Player {} ({}) joined the table", player, name);
        self.state.participants.push(Participant { id: player, name });
        self.state.player_turn_order.push(player);
        self.rules.on_player_added(&self.state, player);

        if self.state.status == GameStatus::Running {
            self.broadcasts.push(Packet::TurnOrder {
                turn_order: self.state.player_turn_order.clone(),
            });
        }
        true
    }

    /// Unseats a player. The turn order entry is dropped lazily; if it was
    /// their turn, the turn is ended right away.
    pub fn remove_player(&mut self, player: PlayerId) -> bool {
        let Some(position) = self.state.participants.iter().position(|p| p.id == player) else {
            return false;
        };

        self.state.participants.remove(position);
        info!("Player {} left the table", player);
        self.rules.on_player_removed(&self.state, player);

        if self.state.status != GameStatus::Running {
            return true;
        }

        if self.state.participants.is_empty() {
            self.finish("all players left");
            return true;
        }

        let in_end_turn = self.current_phase().map(Phase::id) == Some(PhaseId::EndTurn);
        if self.state.current_player == Some(player) && !in_end_turn {
            info!("Current player {} left, ending their turn", player);
            self.end_players_turn();
            return true;
        }

        // A round-level phase may have been waiting only on the departed player
        let participants = self.state.participant_ids();
        let holdout_left = self
            .current_phase()
            .is_some_and(|phase| phase.player().is_none() && phase.is_complete(&participants));
        if holdout_left {
            info!("Everyone left at the table is done, ending the phase");
            self.end_phase();
        }
        true
    }

    /// Fixes the turn order and begins the first round
    pub fn start(&mut self) {
        if self.state.status != GameStatus::Waiting {
            warn!("Table already {:?}, ignoring start", self.state.status);
            return;
        }
        if self.state.participants.is_empty() {
            warn!("Cannot start a table without players");
            return;
        }

        if self.config.shuffle_turn_order {
            self.rules
                .reorder_player_turn_order(&mut self.state.player_turn_order, &mut self.rng);
        }
        self.state.status = GameStatus::Running;
        info!(
            "Table started with turn order {:?}",
            self.state.player_turn_order
        );
        self.broadcasts.push(Packet::GameStarted {
            turn_order: self.state.player_turn_order.clone(),
        });

        self.begin_next_round();
    }

    pub fn begin_next_round(&mut self) {
        if self.state.status == GameStatus::Finished {
            return;
        }
        if self.state.participants.is_empty() {
            warn!("No players remain, not starting another round");
            return;
        }

        self.mark_running();
        self.rules.on_before_next_round(&self.state);
        self.state.turn_order_index = None;
        self.state.current_player = None;
        self.transition_to(Phase::round_startup());
    }

    pub fn end_current_round(&mut self) {
        if self.state.status == GameStatus::Finished {
            return;
        }

        self.rules.on_before_round_end(&self.state);
        self.state.current_player = None;
        self.transition_to(Phase::round_end());
    }

    /// Hands the turn to the next seated player in the turn order, or ends
    /// the round when the order is exhausted.
    pub fn next_players_turn(&mut self) {
        if self.state.status == GameStatus::Finished {
            return;
        }
        self.mark_running();

        match self.state.get_next_turn_order_index() {
            None => {
                debug!(
                    "Turn order exhausted in round {}",
                    self.state.round_number
                );
                self.end_current_round();
            }
            Some(index) => {
                let player = self.state.player_turn_order[index];
                self.state.turn_order_index = Some(index);
                self.state.current_player = Some(player);
                info!(
                    "Round {}: player {}'s turn",
                    self.state.round_number, player
                );

                let phase = self
                    .rules
                    .create_initial_player_turn_phase(&self.state, player);
                self.transition_to(phase);
            }
        }
    }

    pub fn end_players_turn(&mut self) {
        if self.state.status == GameStatus::Finished {
            return;
        }
        let Some(player) = self.state.current_player else {
            warn!("No current player whose turn could end");
            return;
        };

        self.transition_to(Phase::end_turn(player));
    }

    /// Moves to `next` within the current turn.
    ///
    /// Without a next phase the turn cannot continue; the table falls back to
    /// ending the current turn instead of stalling.
    pub fn end_current_turn_phase(&mut self, next: Option<Phase>) {
        if self.state.status == GameStatus::Finished {
            return;
        }

        let Some(mut next) = next else {
            let current = self.current_phase().map(Phase::id);
            error!(
                "No phase follows {:?}, forcing the end of the current turn",
                current
            );
            if current != Some(PhaseId::EndTurn) && self.state.current_player.is_some() {
                self.end_players_turn();
            } else {
                self.next_players_turn();
            }
            return;
        };

        self.rules.on_before_next_turn_phase(&self.state, &mut next);
        self.transition_to(next);
    }

    /// Completes the current phase and advances the table.
    ///
    /// Executes the phase first if its response window is still open.
    pub fn end_phase(&mut self) {
        if self.state.status == GameStatus::Finished {
            return;
        }
        let Some(activation) = self.sequencer.current_activation() else {
            warn!("end_phase called with no current phase");
            return;
        };

        if self.sequencer.execute_current() {
            self.dispatch_sequencer_events();
        }
        // Reacting to the execution may already have moved the table on
        if self.sequencer.current_activation() != Some(activation) {
            return;
        }
        let Some(phase) = self.sequencer.current_item() else {
            return;
        };

        match phase.id() {
            PhaseId::RoundStartup => self.on_next_round_began(),
            PhaseId::RoundEnd => self.on_round_ended(),
            PhaseId::EndTurn => self.next_players_turn(),
            PhaseId::BeginTurn | PhaseId::Main | PhaseId::Custom(_) => {
                let next = self.rules.next_turn_phase(&self.state, phase);
                self.end_current_turn_phase(next);
            }
        }
    }

    /// A player signals they are done with the current phase
    pub fn player_done(&mut self, player: PlayerId) -> Result<(), ActionError> {
        if self.state.status == GameStatus::Finished {
            return Err(ActionError::GameFinished);
        }
        if !self.state.is_participant(player) {
            return Err(ActionError::UnknownPlayer(player));
        }

        let participants = self.state.participant_ids();
        let phase = self
            .sequencer
            .current_item_mut()
            .ok_or(ActionError::NoCurrentPhase)?;

        let complete = phase.player_done(player, &participants);
        debug!(
            "Player {} done with '{}' ({} of {} done, complete: {})",
            player,
            phase.name(),
            phase.players_done(),
            participants.len(),
            complete
        );

        if complete {
            self.end_phase();
        }
        Ok(())
    }

    /// Feeds an elapsed response timer back into the table
    pub fn on_timer_elapsed(&mut self, token: TimerToken) -> bool {
        if self.sequencer.handle_timer_elapsed(token) {
            self.dispatch_sequencer_events();
            true
        } else {
            false
        }
    }

    fn mark_running(&mut self) {
        if self.state.status == GameStatus::Waiting {
            self.state.status = GameStatus::Running;
        }
    }

    fn transition_to(&mut self, phase: Phase) {
        if self.state.status == GameStatus::Finished {
            debug!("Table finished, not entering '{}'", phase.name());
            return;
        }

        let timer_mod = self.rules.response_timer_mod(&self.state, &phase);
        self.sequencer.clear_sequence();
        self.sequencer.add_item(phase, timer_mod);
        self.sequencer.activate_next_item();
        self.dispatch_sequencer_events();
    }

    fn dispatch_sequencer_events(&mut self) {
        while let Some(event) = self.sequencer.poll_event() {
            match event {
                SequencerEvent::CurrentItemChanged { previous, current } => {
                    if let Some(previous) = previous {
                        debug!("Phase '{}' retired", previous.name());
                    }
                    if current.is_some() && current == self.sequencer.current_activation() {
                        if let Some(update) = self.phase_update() {
                            self.broadcasts.push(Packet::PhaseChanged(update));
                        }
                    }
                }
                SequencerEvent::ItemResponseTimerStarted {
                    activation,
                    timeout,
                } => {
                    if Some(activation) != self.sequencer.current_activation() {
                        continue;
                    }
                    if let Some(phase) = self.sequencer.current_item() {
                        self.broadcasts.push(Packet::ResponseWindowOpened {
                            phase: phase.id(),
                            window_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                }
                SequencerEvent::ItemExecuted {
                    activation,
                    success,
                    message,
                } => self.on_phase_executed(activation, success, message),
            }
        }
    }

    fn on_phase_executed(
        &mut self,
        activation: ActivationId,
        success: bool,
        message: Option<String>,
    ) {
        if self.sequencer.current_activation() != Some(activation) {
            debug!("Ignoring execution of a retired phase");
            return;
        }
        let Some(update) = self.phase_update() else {
            return;
        };

        if !success {
            warn!(
                "Phase '{}' failed to execute: {}",
                update.phase_name,
                message.as_deref().unwrap_or("no reason given")
            );
            return;
        }
        if let Some(message) = message {
            debug!("{}", message);
        }

        let phase_id = update.phase;
        self.broadcasts.push(Packet::PhaseEntered(update));

        if phase_id.is_round_level() {
            self.end_phase();
            return;
        }

        if phase_id == PhaseId::BeginTurn {
            if let Some(player) = self.state.current_player {
                if !self.state.is_participant(player) {
                    info!("Player {} left before their turn began", player);
                    self.next_players_turn();
                    return;
                }
            }
        }

        self.notify_next_turn_phase();
        if phase_id.is_bookend() {
            self.end_phase();
        }
    }

    fn on_next_round_began(&mut self) {
        self.state.round_number += 1;
        info!("Round {} began", self.state.round_number);
        self.rules.on_next_round_began(&self.state);
        self.next_players_turn();
    }

    fn on_round_ended(&mut self) {
        info!("Round {} ended", self.state.round_number);
        let outcome = self.rules.on_round_ended(&self.state);
        let limit_reached = self
            .config
            .max_rounds
            .map_or(false, |max| self.state.round_number >= max);

        if outcome == RoundOutcome::GameOver {
            self.finish("the rules ended the game");
        } else if limit_reached {
            self.finish("round limit reached");
        } else {
            self.begin_next_round();
        }
    }

    fn notify_next_turn_phase(&mut self) {
        if let Some(phase) = self.sequencer.current_item() {
            self.rules.on_next_turn_phase(&self.state, phase);
        }
    }

    fn phase_update(&self) -> Option<PhaseUpdate> {
        self.sequencer.current_item().map(|phase| PhaseUpdate {
            round: self.state.round_number,
            phase: phase.id(),
            phase_name: phase.name().to_string(),
            current_player: self.state.current_player,
        })
    }

    fn finish(&mut self, reason: &str) {
        if self.state.status == GameStatus::Finished {
            return;
        }

        self.sequencer.clear_sequence();
        self.sequencer.dispose();
        while self.sequencer.poll_event().is_some() {}

        self.state.status = GameStatus::Finished;
        self.state.current_player = None;
        info!(
            "Game over after {} rounds: {}",
            self.state.round_number, reason
        );
        self.broadcasts.push(Packet::GameOver {
            rounds_played: self.state.round_number,
            reason: reason.to_string(),
        });
    }
}
