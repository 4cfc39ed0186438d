use std::collections::BTreeMap;

use tracing::debug;

use crate::error::Rejected;
use crate::types::{ClientIntent, ServerEvent, WireStatus};

/// Phase of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Lobby,
    Active,
    RoundOver,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Lobby => write!(f, "lobby"),
            Self::Active => write!(f, "active"),
            Self::RoundOver => write!(f, "round over"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Frost,
    Runner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Active,
    Frozen,
}

/// Lobby ready flag. A local toggle stays `Pending` until the server
/// reports the participant's readiness again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Confirmed(bool),
    Pending { requested: bool, confirmed: bool },
}

impl Readiness {
    /// The value to display: the requested one while pending.
    pub fn is_ready(&self) -> bool {
        match *self {
            Self::Confirmed(ready) => ready,
            Self::Pending { requested, .. } => requested,
        }
    }

    /// The last value the server reported.
    pub fn confirmed(&self) -> bool {
        match *self {
            Self::Confirmed(ready) => ready,
            Self::Pending { confirmed, .. } => confirmed,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::Confirmed(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

/// A participant as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantState {
    pub id: String,
    pub role: Role,
    pub status: Status,
    pub username: Option<String>,
    pub ready: Readiness,
    pub connected: bool,
    pub location: Option<Location>,
}

impl ParticipantState {
    fn runner(id: &str) -> Self {
        Self {
            id: id.to_string(),
            role: Role::Runner,
            status: Status::Active,
            username: None,
            ready: Readiness::default(),
            connected: true,
            location: None,
        }
    }

    pub fn is_frost(&self) -> bool {
        self.role == Role::Frost
    }

    pub fn is_frozen(&self) -> bool {
        self.status == Status::Frozen
    }
}

/// Result of a round, exactly as the server announced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundOutcome {
    pub winner_id: String,
    pub winner_username: Option<String>,
    pub next_frost: Option<String>,
    pub frozen_players: Vec<String>,
}

/// Informational in-round events kept for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    PowerUsed { player_id: String, power_id: String },
    Proximity { player1_id: String, player2_id: String },
}

/// What applying an event did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Applied,
    /// The event was valid but the state already reflected it.
    Unchanged,
    Ignored(IgnoreReason),
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    UnknownParticipant(String),
    TargetIsFrost(String),
    WrongPhase { event: &'static str, phase: Phase },
    StaleRound { received: u32, current: u32 },
}

impl std::fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownParticipant(id) => write!(f, "unknown participant {id}"),
            Self::TargetIsFrost(id) => write!(f, "{id} is the frost"),
            Self::WrongPhase { event, phase } => write!(f, "{event} is not valid in the {phase} phase"),
            Self::StaleRound { received, current } => {
                write!(f, "round {received} is not newer than round {current}")
            }
        }
    }
}

/// One joined game room, spanning any number of rounds.
///
/// Only [`Session::apply`] and [`Session::tick`] mutate authoritative state;
/// the `*_intent` methods gate local actions and touch optimistic flags only.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    room_code: String,
    self_id: String,
    round_number: u32,
    phase: Phase,
    participants: BTreeMap<String, ParticipantState>,
    elapsed_seconds: u64,
    frost_id: Option<String>,
    outcome: Option<RoundOutcome>,
    restart_requested: bool,
    last_activity: Option<Activity>,
}

impl Session {
    pub fn new(room_code: impl Into<String>, self_id: impl Into<String>) -> Self {
        Self {
            room_code: room_code.into(),
            self_id: self_id.into(),
            round_number: 0,
            phase: Phase::Lobby,
            participants: BTreeMap::new(),
            elapsed_seconds: 0,
            frost_id: None,
            outcome: None,
            restart_requested: false,
            last_activity: None,
        }
    }

    /// Whether `event` confirms that `self_id` is a member of the room.
    pub fn acknowledges(event: &ServerEvent, self_id: &str) -> bool {
        match event {
            ServerEvent::PlayerJoined { player_id } => player_id == self_id,
            ServerEvent::GameStarted { mraz_id, player_statuses, .. } => {
                mraz_id == self_id || player_statuses.contains_key(self_id)
            }
            _ => false,
        }
    }

    // ─── Accessors ───────────────────────────────────────────────────

    pub fn room_code(&self) -> &str {
        &self.room_code
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn round_number(&self) -> u32 {
        self.round_number
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn elapsed_seconds(&self) -> u64 {
        self.elapsed_seconds
    }

    pub fn participants(&self) -> impl Iterator<Item = &ParticipantState> {
        self.participants.values()
    }

    pub fn participant(&self, id: &str) -> Option<&ParticipantState> {
        self.participants.get(id)
    }

    /// The local participant, once the server has listed it.
    pub fn local(&self) -> Option<&ParticipantState> {
        self.participants.get(&self.self_id)
    }

    pub fn frost(&self) -> Option<&ParticipantState> {
        self.frost_id.as_deref().and_then(|id| self.participants.get(id))
    }

    pub fn outcome(&self) -> Option<&RoundOutcome> {
        self.outcome.as_ref()
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested
    }

    pub fn last_activity(&self) -> Option<&Activity> {
        self.last_activity.as_ref()
    }

    pub fn frozen_ids(&self) -> Vec<&str> {
        self.participants
            .values()
            .filter(|p| p.is_frozen())
            .map(|p| p.id.as_str())
            .collect()
    }

    // ─── Reducer ─────────────────────────────────────────────────────

    /// Apply one server event. Events that make no sense in the current
    /// state are ignored and reported, never fatal.
    pub fn apply(&mut self, event: &ServerEvent) -> Transition {
        let transition = match event {
            ServerEvent::PlayerJoined { player_id } => self.on_joined(player_id),
            ServerEvent::PlayerLeft { player_id } => self.on_left(player_id),
            ServerEvent::PlayerReadyUpdate { player_id, is_ready } => self.on_ready(player_id, *is_ready),
            ServerEvent::GameStarted { mraz_id, mraz_username, player_statuses, round_number } => {
                self.on_started(mraz_id, mraz_username.as_deref(), player_statuses, *round_number)
            }
            ServerEvent::PlayerFrozen { frozen_player_id, .. } => self.on_frozen(frozen_player_id),
            ServerEvent::PlayerUnfrozen { unfrozen_player_id, .. } => self.on_unfrozen(unfrozen_player_id),
            ServerEvent::RoundOver { winner_id, winner_username, next_mraz } => self.on_round_over(
                event.name(),
                RoundOutcome {
                    winner_id: winner_id.clone(),
                    winner_username: winner_username.clone(),
                    next_frost: next_mraz.clone(),
                    frozen_players: Vec::new(),
                },
            ),
            ServerEvent::GameOver { winner, frozen_players } => self.on_round_over(
                event.name(),
                RoundOutcome {
                    winner_id: winner.clone(),
                    winner_username: None,
                    next_frost: None,
                    frozen_players: frozen_players.clone(),
                },
            ),
            ServerEvent::PowerUsed { player_id, power_id } => self.record(Activity::PowerUsed {
                player_id: player_id.clone(),
                power_id: power_id.clone(),
            }),
            ServerEvent::ProximityEvent { player1_id, player2_id } => self.record(Activity::Proximity {
                player1_id: player1_id.clone(),
                player2_id: player2_id.clone(),
            }),
            ServerEvent::LocationUpdate { player_id, latitude, longitude } => self.on_location(
                player_id,
                Location {
                    latitude: *latitude,
                    longitude: *longitude,
                },
            ),
        };

        if let Transition::Ignored(reason) = &transition {
            debug!(room = %self.room_code, event = event.name(), "ignored event: {}", reason);
        }
        transition
    }

    /// Advance the local clock by one second. Returns false outside a round.
    pub fn tick(&mut self) -> bool {
        if self.phase != Phase::Active {
            return false;
        }
        self.elapsed_seconds += 1;
        true
    }

    fn on_joined(&mut self, player_id: &str) -> Transition {
        match self.participants.get_mut(player_id) {
            Some(p) if p.connected => Transition::Unchanged,
            Some(p) => {
                p.connected = true;
                Transition::Applied
            }
            None => {
                self.participants
                    .insert(player_id.to_string(), ParticipantState::runner(player_id));
                Transition::Applied
            }
        }
    }

    fn on_left(&mut self, player_id: &str) -> Transition {
        if !self.participants.contains_key(player_id) {
            return Transition::Ignored(IgnoreReason::UnknownParticipant(player_id.to_string()));
        }

        // Mid-round the roster stays intact so the frost keeps its role.
        if self.phase == Phase::Lobby {
            self.participants.remove(player_id);
            return Transition::Applied;
        }

        match self.participants.get_mut(player_id) {
            Some(p) if p.connected => {
                p.connected = false;
                Transition::Applied
            }
            _ => Transition::Unchanged,
        }
    }

    fn on_ready(&mut self, player_id: &str, is_ready: bool) -> Transition {
        let confirmed = Readiness::Confirmed(is_ready);
        match self.participants.get_mut(player_id) {
            Some(p) if p.ready == confirmed => Transition::Unchanged,
            Some(p) => {
                p.ready = confirmed;
                Transition::Applied
            }
            None if self.phase == Phase::Lobby => {
                // A join we missed while reconnecting.
                let mut participant = ParticipantState::runner(player_id);
                participant.ready = confirmed;
                self.participants.insert(player_id.to_string(), participant);
                Transition::Applied
            }
            None => Transition::Ignored(IgnoreReason::UnknownParticipant(player_id.to_string())),
        }
    }

    fn on_started(
        &mut self,
        mraz_id: &str,
        mraz_username: Option<&str>,
        statuses: &BTreeMap<String, WireStatus>,
        round_number: u32,
    ) -> Transition {
        if round_number <= self.round_number {
            return Transition::Ignored(IgnoreReason::StaleRound {
                received: round_number,
                current: self.round_number,
            });
        }

        let mut previous = std::mem::take(&mut self.participants);
        let mut roster = if statuses.is_empty() {
            for p in previous.values_mut() {
                p.role = Role::Runner;
                p.status = Status::Active;
            }
            previous
        } else {
            let mut roster = BTreeMap::new();
            for (id, status) in statuses {
                let mut p = previous
                    .remove(id)
                    .unwrap_or_else(|| ParticipantState::runner(id));
                p.role = Role::Runner;
                p.status = match status {
                    WireStatus::Frozen => Status::Frozen,
                    WireStatus::Active | WireStatus::Mraz | WireStatus::Unknown => Status::Active,
                };
                roster.insert(id.clone(), p);
            }
            roster
        };

        let frost = roster
            .entry(mraz_id.to_string())
            .or_insert_with(|| ParticipantState::runner(mraz_id));
        frost.role = Role::Frost;
        frost.status = Status::Active;
        if let Some(name) = mraz_username {
            frost.username = Some(name.to_string());
        }

        for p in roster.values_mut() {
            p.ready = Readiness::Confirmed(p.ready.confirmed());
        }

        self.participants = roster;
        self.frost_id = Some(mraz_id.to_string());
        self.round_number = round_number;
        self.phase = Phase::Active;
        self.elapsed_seconds = 0;
        self.outcome = None;
        self.restart_requested = false;
        self.last_activity = None;
        Transition::Applied
    }

    fn on_frozen(&mut self, player_id: &str) -> Transition {
        if self.phase != Phase::Active {
            return self.wrong_phase("player_frozen");
        }
        let Some(p) = self.participants.get_mut(player_id) else {
            return Transition::Ignored(IgnoreReason::UnknownParticipant(player_id.to_string()));
        };
        if p.is_frost() {
            return Transition::Ignored(IgnoreReason::TargetIsFrost(player_id.to_string()));
        }
        if p.is_frozen() {
            return Transition::Unchanged;
        }
        p.status = Status::Frozen;
        Transition::Applied
    }

    fn on_unfrozen(&mut self, player_id: &str) -> Transition {
        if self.phase != Phase::Active {
            return self.wrong_phase("player_unfrozen");
        }
        let Some(p) = self.participants.get_mut(player_id) else {
            return Transition::Ignored(IgnoreReason::UnknownParticipant(player_id.to_string()));
        };
        if !p.is_frozen() {
            return Transition::Unchanged;
        }
        p.status = Status::Active;
        Transition::Applied
    }

    fn on_round_over(&mut self, event: &'static str, outcome: RoundOutcome) -> Transition {
        match self.phase {
            Phase::Active => {
                self.outcome = Some(outcome);
                self.phase = Phase::RoundOver;
                Transition::Applied
            }
            // Duplicate delivery of the same round end.
            Phase::RoundOver => Transition::Unchanged,
            Phase::Lobby => self.wrong_phase(event),
        }
    }

    fn on_location(&mut self, player_id: &str, location: Location) -> Transition {
        let Some(p) = self.participants.get_mut(player_id) else {
            return Transition::Ignored(IgnoreReason::UnknownParticipant(player_id.to_string()));
        };
        if p.location == Some(location) {
            return Transition::Unchanged;
        }
        p.location = Some(location);
        Transition::Applied
    }

    fn record(&mut self, activity: Activity) -> Transition {
        if self.last_activity.as_ref() == Some(&activity) {
            return Transition::Unchanged;
        }
        self.last_activity = Some(activity);
        Transition::Applied
    }

    fn wrong_phase(&self, event: &'static str) -> Transition {
        Transition::Ignored(IgnoreReason::WrongPhase {
            event,
            phase: self.phase,
        })
    }

    // ─── Local action gating ─────────────────────────────────────────

    fn require_phase(&self, phase: Phase) -> Result<(), Rejected> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(Rejected::WrongPhase(self.phase))
        }
    }

    fn require_local(&self) -> Result<&ParticipantState, Rejected> {
        self.local().ok_or(Rejected::NotParticipating)
    }

    fn require_target(&self, target: &str) -> Result<&ParticipantState, Rejected> {
        if target == self.self_id {
            return Err(Rejected::SelfTarget);
        }
        self.participants
            .get(target)
            .ok_or_else(|| Rejected::UnknownTarget(target.to_string()))
    }

    /// Freeze `target`. Only the frost may freeze, and only mid-round.
    pub fn freeze_intent(&self, target: &str) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Active)?;
        if !self.require_local()?.is_frost() {
            return Err(Rejected::NotFrost);
        }
        self.require_target(target)?;

        Ok(ClientIntent::FreezePlayer {
            room_code: self.room_code.clone(),
            frozen_player_id: target.to_string(),
            mraz_id: self.self_id.clone(),
        })
    }

    /// Unfreeze `target`. Only an unfrozen runner may unfreeze, and only mid-round.
    pub fn unfreeze_intent(&self, target: &str) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Active)?;
        let local = self.require_local()?;
        if local.is_frost() {
            return Err(Rejected::IsFrost);
        }
        if local.is_frozen() {
            return Err(Rejected::SelfFrozen);
        }
        self.require_target(target)?;

        Ok(ClientIntent::UnfreezePlayer {
            room_code: self.room_code.clone(),
            frozen_player_id: target.to_string(),
            unfreezer_id: self.self_id.clone(),
        })
    }

    /// Toggle the local ready flag. The new value stays pending until the
    /// server echoes it.
    pub fn ready_intent(&mut self) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Lobby)?;
        let local = self
            .participants
            .get_mut(&self.self_id)
            .ok_or(Rejected::NotParticipating)?;
        let requested = !local.ready.is_ready();
        local.ready = Readiness::Pending {
            requested,
            confirmed: local.ready.confirmed(),
        };

        Ok(ClientIntent::PlayerReady {
            room_code: self.room_code.clone(),
            player_id: self.self_id.clone(),
            is_ready: requested,
        })
    }

    pub fn start_intent(&self) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Lobby)?;
        Ok(ClientIntent::StartGame {
            room_code: self.room_code.clone(),
        })
    }

    /// Ask for another round. The phase only changes when the server
    /// starts it.
    pub fn restart_intent(&mut self) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::RoundOver)?;
        self.restart_requested = true;
        Ok(ClientIntent::RestartRound {
            room_code: self.room_code.clone(),
        })
    }

    pub fn leave_intent(&self) -> ClientIntent {
        ClientIntent::LeaveGame {
            room_code: self.room_code.clone(),
            player_id: self.self_id.clone(),
        }
    }

    pub fn power_intent(&self, power_id: &str) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Active)?;
        self.require_local()?;
        Ok(ClientIntent::UsePower {
            room_code: self.room_code.clone(),
            player_id: self.self_id.clone(),
            power_id: power_id.to_string(),
        })
    }

    /// Report that this device came within touching range of `other`.
    pub fn proximity_intent(&self, other: &str) -> Result<ClientIntent, Rejected> {
        self.require_phase(Phase::Active)?;
        self.require_local()?;
        self.require_target(other)?;
        Ok(ClientIntent::ProximityDetected {
            room_code: self.room_code.clone(),
            player1_id: self.self_id.clone(),
            player2_id: other.to_string(),
        })
    }

    pub fn location_intent(&self, latitude: f64, longitude: f64) -> ClientIntent {
        ClientIntent::UpdateLocation {
            room_code: self.room_code.clone(),
            player_id: self.self_id.clone(),
            latitude,
            longitude,
        }
    }
}
