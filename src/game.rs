use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ChannelEvent, ConnectionManager, Envelope};
use crate::session::{Phase, Session};
use crate::types::{ClientIntent, ServerEvent};

/// Commands the UI sends to the game task.
#[derive(Debug, Clone, PartialEq)]
pub enum GameCommand {
    Freeze { target: String },
    Unfreeze { target: String },
    ToggleReady,
    StartRound,
    RestartRound,
    UsePower { power_id: String },
    ReportProximity { other: String },
    UpdateLocation { latitude: f64, longitude: f64 },
    Leave,
}

/// Health of the channel as shown to the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnecting gave up; the player has to rejoin.
    Lost,
    Closed,
}

/// Everything the UI renders.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionView {
    pub link: LinkStatus,
    pub session: Option<Session>,
}

#[derive(Clone)]
pub struct GameHandle {
    pub room_code: String,
    pub self_id: String,
    pub cmd_tx: mpsc::Sender<GameCommand>,
    pub view_rx: watch::Receiver<SessionView>,
}

impl GameHandle {
    /// Queue a command. Returns false once the game task has ended.
    pub async fn command(&self, cmd: GameCommand) -> bool {
        self.cmd_tx.send(cmd).await.is_ok()
    }

    pub fn view(&self) -> SessionView {
        self.view_rx.borrow().clone()
    }
}

/// The state owned by one game task.
struct GameState {
    room_code: String,
    self_id: String,
    session: Option<Session>,
    link: LinkStatus,
    connection: ConnectionManager,
    tick: Option<Interval>,
    tick_interval: Duration,
    view_tx: watch::Sender<SessionView>,
}

impl GameState {
    fn view(&self) -> SessionView {
        SessionView {
            link: self.link,
            session: self.session.clone(),
        }
    }

    fn publish(&self) {
        let next = self.view();
        self.view_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }

    fn send(&self, intent: ClientIntent) {
        let name = intent.name();
        if let Err(e) = self.connection.send(intent) {
            debug!(room = %self.room_code, "{} not sent: {}", name, e);
        }
    }

    /// Start a fresh one-second clock for a new round, or stop it when the
    /// round is not running.
    fn sync_tick(&mut self, round_started: bool) {
        let running = self.session.as_ref().is_some_and(|s| s.phase() == Phase::Active);
        if !running {
            self.tick = None;
        } else if round_started || self.tick.is_none() {
            let mut interval = tokio::time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            self.tick = Some(interval);
        }
    }
}

/// Create a game session controller and spawn its task. Returns the handle.
pub fn spawn(config: &ClientConfig, room_code: impl Into<String>, self_id: impl Into<String>) -> GameHandle {
    let room_code = room_code.into();
    let self_id = self_id.into();

    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (view_tx, view_rx) = watch::channel(SessionView {
        link: LinkStatus::Connecting,
        session: None,
    });
    let (connection, envelopes) = ConnectionManager::new(config.server_url.clone(), config.reconnect.clone());

    let state = GameState {
        room_code: room_code.clone(),
        self_id: self_id.clone(),
        session: None,
        link: LinkStatus::Connecting,
        connection,
        tick: None,
        tick_interval: config.tick_interval(),
        view_tx,
    };

    tokio::spawn(game_task(state, cmd_rx, envelopes));

    info!("Game session started for room {} as {}", room_code, self_id);

    GameHandle {
        room_code,
        self_id,
        cmd_tx,
        view_rx,
    }
}

async fn next_tick(tick: &mut Option<Interval>) {
    match tick {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn game_task(
    mut state: GameState,
    mut cmd_rx: mpsc::Receiver<GameCommand>,
    mut envelopes: mpsc::Receiver<Envelope>,
) {
    let room_code = state.room_code.clone();
    let self_id = state.self_id.clone();
    state.connection.connect(&room_code, &self_id);
    state.publish();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(cmd) => {
                    if !handle_command(&mut state, cmd) {
                        break;
                    }
                }
                // Every handle dropped: the screen went away.
                None => break,
            },
            Some(envelope) = envelopes.recv() => {
                handle_envelope(&mut state, envelope);
            }
            _ = next_tick(&mut state.tick) => {
                if let Some(session) = state.session.as_mut() {
                    session.tick();
                }
            }
        }
        state.publish();
    }

    // Channel and clock go away with the session.
    state.connection.disconnect();
    state.tick = None;
    state.session = None;
    state.link = LinkStatus::Closed;
    state.publish();
    info!("Game session for room {} ended", state.room_code);
}

fn handle_envelope(state: &mut GameState, envelope: Envelope) {
    if state.connection.channel_id() != Some(envelope.channel_id) {
        debug!(channel = %envelope.channel_id, "dropping event from stale channel");
        return;
    }

    match envelope.event {
        ChannelEvent::Connected => {
            state.link = LinkStatus::Connected;
            info!("Connected to room {}", state.room_code);
        }
        ChannelEvent::Disconnected { reason } => {
            state.link = LinkStatus::Reconnecting { attempt: 0 };
            info!("Disconnected from room {}: {}", state.room_code, reason);
        }
        ChannelEvent::Reconnecting { attempt, delay } => {
            state.link = LinkStatus::Reconnecting { attempt };
            debug!("Reconnect attempt {} in {:?}", attempt, delay);
        }
        ChannelEvent::ReconnectExhausted => {
            state.link = LinkStatus::Lost;
            warn!("Lost connection to room {}", state.room_code);
        }
        ChannelEvent::Server(event) => handle_server_event(state, event),
    }
}

fn handle_server_event(state: &mut GameState, event: ServerEvent) {
    if state.session.is_none() {
        if !Session::acknowledges(&event, &state.self_id) {
            debug!(event = event.name(), "ignoring event before join acknowledgement");
            return;
        }
        info!("Joined room {} as {}", state.room_code, state.self_id);
        state.session = Some(Session::new(state.room_code.clone(), state.self_id.clone()));
    }

    let Some(session) = state.session.as_mut() else {
        return;
    };
    let transition = session.apply(&event);
    if transition.changed() {
        let round_started = matches!(event, ServerEvent::GameStarted { .. });
        if round_started {
            info!("Round {} started in room {}", session.round_number(), state.room_code);
        }
        state.sync_tick(round_started);
    }
}

/// Gate `cmd` against the session and send the resulting intent. Returns
/// false when the command ends the session.
fn handle_command(state: &mut GameState, cmd: GameCommand) -> bool {
    let leaving = cmd == GameCommand::Leave;

    let Some(session) = state.session.as_mut() else {
        if leaving {
            // The server may have registered the join before we saw it.
            state.send(ClientIntent::LeaveGame {
                room_code: state.room_code.clone(),
                player_id: state.self_id.clone(),
            });
            info!("Leaving room {}", state.room_code);
            return false;
        }
        debug!(?cmd, "ignoring command before join acknowledgement");
        return true;
    };

    let intent = match &cmd {
        GameCommand::Freeze { target } => session.freeze_intent(target),
        GameCommand::Unfreeze { target } => session.unfreeze_intent(target),
        GameCommand::ToggleReady => session.ready_intent(),
        GameCommand::StartRound => session.start_intent(),
        GameCommand::RestartRound => session.restart_intent(),
        GameCommand::UsePower { power_id } => session.power_intent(power_id),
        GameCommand::ReportProximity { other } => session.proximity_intent(other),
        GameCommand::UpdateLocation { latitude, longitude } => Ok(session.location_intent(*latitude, *longitude)),
        GameCommand::Leave => Ok(session.leave_intent()),
    };

    match intent {
        Ok(intent) => state.send(intent),
        Err(rejected) => debug!(?cmd, "suppressed: {}", rejected),
    }

    if leaving {
        info!("Leaving room {}", state.room_code);
    }
    !leaving
}
