// Battle turn controller: the state machine driving one prompt battle.

use serde::{Deserialize, Serialize};

/// Phase of a running battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "waiting")]
    Waiting,
    #[serde(rename = "player1-turn")]
    Player1Turn,
    #[serde(rename = "generating")]
    Generating,
    #[serde(rename = "player2-turn")]
    Player2Turn,
    #[serde(rename = "complete")]
    Complete,
}

/// What to do with a timeout-triggered submission that carries an empty prompt.
///
/// `Permissive` forwards the empty prompt to the generator (the historical
/// behavior); `Strict` rejects it the same way a manual submission would be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeoutPolicy {
    #[default]
    Permissive,
    Strict,
}

impl TimeoutPolicy {
    /// Parse from a config string. Unknown values fall back to permissive.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("strict") {
            TimeoutPolicy::Strict
        } else {
            TimeoutPolicy::Permissive
        }
    }
}

/// One player's slot in the battle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlayerSlot {
    pub prompt: String,
    pub image_url: Option<String>,
    pub is_submitted: bool,
}

/// Immutable snapshot of the battle state, serialized to clients as-is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BattleState {
    pub current_player: u8,
    pub time_left: u32,
    pub is_active: bool,
    pub phase: Phase,
    pub player1: PlayerSlot,
    pub player2: PlayerSlot,
    pub error: Option<String>,
}

impl BattleState {
    fn initial(time_limit: u32) -> Self {
        Self {
            current_player: 1,
            time_left: time_limit,
            is_active: false,
            phase: Phase::Waiting,
            player1: PlayerSlot::default(),
            player2: PlayerSlot::default(),
            error: None,
        }
    }

    fn slot(&self, player: u8) -> &PlayerSlot {
        if player == 1 {
            &self.player1
        } else {
            &self.player2
        }
    }

    fn slot_mut(&mut self, player: u8) -> &mut PlayerSlot {
        if player == 1 {
            &mut self.player1
        } else {
            &mut self.player2
        }
    }
}

/// An accepted submission, handed to the caller to run the generation call.
/// The caller reports the outcome back via `resolve_generation` with the
/// same sequence number; a stale sequence is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingGeneration {
    pub seq: u64,
    pub player: u8,
    pub prompt: String,
}

/// Errors surfaced by controller operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BattleError {
    #[error("Please enter a prompt before submitting")]
    EmptyPrompt,
    #[error("The battle has already started")]
    AlreadyStarted,
    #[error("It is not player {0}'s turn")]
    NotPlayersTurn(u8),
    #[error("player number must be 1 or 2")]
    InvalidPlayer,
}

/// Drives one battle through waiting → player1-turn → generating →
/// player2-turn → complete. All state mutations go through here; the
/// rendering/API layer only ever sees `BattleState` snapshots.
pub struct BattleController {
    state: BattleState,
    time_limit: u32,
    policy: TimeoutPolicy,
    next_seq: u64,
    /// The one in-flight generation, if any: (sequence, submitting player).
    pending: Option<(u64, u8)>,
}

impl BattleController {
    pub fn new(time_limit: u32, policy: TimeoutPolicy) -> Self {
        Self {
            state: BattleState::initial(time_limit),
            time_limit,
            policy,
            next_seq: 0,
            pending: None,
        }
    }

    pub fn snapshot(&self) -> BattleState {
        self.state.clone()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    pub fn time_limit(&self) -> u32 {
        self.time_limit
    }

    /// Start the battle: waiting → player1-turn.
    pub fn start(&mut self) -> Result<(), BattleError> {
        if self.state.phase != Phase::Waiting {
            return Err(BattleError::AlreadyStarted);
        }
        self.state.is_active = true;
        self.state.phase = Phase::Player1Turn;
        self.state.time_left = self.time_limit;
        Ok(())
    }

    /// Update the active player's prompt text. Only the player whose turn
    /// it is may edit, and only before they have submitted.
    pub fn set_prompt(&mut self, player: u8, text: &str) -> Result<(), BattleError> {
        self.check_turn(player)?;
        self.state.slot_mut(player).prompt = text.to_string();
        Ok(())
    }

    /// One second of countdown. Returns a `PendingGeneration` when the clock
    /// runs out and an implicit submission fires for the current player.
    /// Ticks outside an active player turn are no-ops.
    pub fn tick(&mut self) -> Option<PendingGeneration> {
        if !self.state.is_active {
            return None;
        }
        match self.state.phase {
            Phase::Player1Turn | Phase::Player2Turn => {}
            _ => return None,
        }
        if self.state.time_left > 1 {
            self.state.time_left -= 1;
            return None;
        }
        // Time is up: implicit submission with whatever prompt is present.
        let player = self.state.current_player;
        let prompt = self.state.slot(player).prompt.clone();
        if self.policy == TimeoutPolicy::Strict && prompt.trim().is_empty() {
            self.state.error = Some(BattleError::EmptyPrompt.to_string());
            return None;
        }
        Some(self.begin_generation(player, prompt))
    }

    /// Manual submission. Requires a non-empty trimmed prompt; a validation
    /// failure records the message and leaves the phase unchanged.
    pub fn submit(&mut self, player: u8) -> Result<PendingGeneration, BattleError> {
        self.check_turn(player).inspect_err(|e| {
            self.state.error = Some(e.to_string());
        })?;
        let prompt = self.state.slot(player).prompt.clone();
        if prompt.trim().is_empty() {
            self.state.error = Some(BattleError::EmptyPrompt.to_string());
            return Err(BattleError::EmptyPrompt);
        }
        Ok(self.begin_generation(player, prompt))
    }

    /// Report the outcome of a generation call. Returns false when the
    /// sequence number is stale (a reset or another submission happened
    /// while the call was in flight) and the outcome was discarded.
    pub fn resolve_generation(&mut self, seq: u64, outcome: Result<String, String>) -> bool {
        let player = match self.pending {
            Some((pending_seq, player)) if pending_seq == seq => player,
            _ => return false,
        };
        self.pending = None;
        match outcome {
            Ok(image_url) => {
                let slot = self.state.slot_mut(player);
                slot.image_url = Some(image_url);
                slot.is_submitted = true;
                if player == 1 {
                    self.state.phase = Phase::Player2Turn;
                    self.state.current_player = 2;
                    self.state.time_left = self.time_limit;
                } else {
                    self.state.phase = Phase::Complete;
                }
            }
            Err(msg) => {
                // The turn is retried, not advanced; the clock keeps
                // whatever was left on it.
                self.state.error = Some(msg);
                self.state.phase = if player == 1 {
                    Phase::Player1Turn
                } else {
                    Phase::Player2Turn
                };
            }
        }
        true
    }

    /// Back to the initial state. Any in-flight generation becomes stale.
    pub fn reset(&mut self) {
        self.state = BattleState::initial(self.time_limit);
        self.pending = None;
    }

    fn check_turn(&self, player: u8) -> Result<(), BattleError> {
        let expected = match self.state.phase {
            Phase::Player1Turn => 1,
            Phase::Player2Turn => 2,
            _ => return Err(BattleError::NotPlayersTurn(player)),
        };
        if player != 1 && player != 2 {
            return Err(BattleError::InvalidPlayer);
        }
        if player != expected || self.state.slot(player).is_submitted {
            return Err(BattleError::NotPlayersTurn(player));
        }
        Ok(())
    }

    fn begin_generation(&mut self, player: u8, prompt: String) -> PendingGeneration {
        self.next_seq += 1;
        self.pending = Some((self.next_seq, player));
        self.state.phase = Phase::Generating;
        self.state.error = None;
        PendingGeneration {
            seq: self.next_seq,
            player,
            prompt,
        }
    }
}
