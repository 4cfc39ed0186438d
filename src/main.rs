use tokio::io::{AsyncBufReadExt, BufReader};

use frosttag::config;
use frosttag::game::{self, GameCommand, LinkStatus, SessionView};
use frosttag::session::{Phase, Role, Status};

// ─── Commands ─────────────────────────────────────────────────────

const HELP: &str = "commands: ready | start | freeze <id> | unfreeze <id> | restart | power <id> | touch <id> | loc <lat> <lon> | leave";

/// Parse one stdin line. Blank lines yield `None`.
fn parse_command(line: &str) -> Result<Option<GameCommand>, String> {
    let mut parts = line.split_whitespace();
    let Some(verb) = parts.next() else {
        return Ok(None);
    };

    let mut arg = |name: &str| {
        parts
            .next()
            .map(str::to_string)
            .ok_or_else(|| format!("{verb} needs <{name}>"))
    };

    let cmd = match verb {
        "ready" => GameCommand::ToggleReady,
        "start" => GameCommand::StartRound,
        "restart" => GameCommand::RestartRound,
        "leave" | "quit" => GameCommand::Leave,
        "freeze" => GameCommand::Freeze { target: arg("id")? },
        "unfreeze" => GameCommand::Unfreeze { target: arg("id")? },
        "power" => GameCommand::UsePower { power_id: arg("id")? },
        "touch" => GameCommand::ReportProximity { other: arg("id")? },
        "loc" => {
            let latitude = arg("lat")?.parse::<f64>().map_err(|e| format!("bad latitude: {e}"))?;
            let longitude = arg("lon")?.parse::<f64>().map_err(|e| format!("bad longitude: {e}"))?;
            GameCommand::UpdateLocation { latitude, longitude }
        }
        other => return Err(format!("unknown command {other:?}; {HELP}")),
    };
    Ok(Some(cmd))
}

// ─── Rendering ────────────────────────────────────────────────────

fn describe(view: &SessionView) -> String {
    let link = match view.link {
        LinkStatus::Connecting => "connecting".to_string(),
        LinkStatus::Connected => "connected".to_string(),
        LinkStatus::Reconnecting { attempt } => format!("reconnecting (attempt {attempt})"),
        LinkStatus::Lost => "connection lost, rejoin the room".to_string(),
        LinkStatus::Closed => "closed".to_string(),
    };

    let Some(session) = &view.session else {
        return format!("[{link}] waiting to join");
    };

    let me = match session.local() {
        Some(p) if p.role == Role::Frost => "frost",
        Some(p) if p.status == Status::Frozen => "frozen",
        Some(_) => "runner",
        None => "spectating",
    };

    match session.phase() {
        Phase::Lobby => {
            let roster: Vec<String> = session
                .participants()
                .map(|p| {
                    let mark = if p.ready.is_pending() { "?" } else if p.ready.is_ready() { "+" } else { "-" };
                    format!("{}{}", p.id, mark)
                })
                .collect();
            format!("[{link}] lobby {} | players: {}", session.room_code(), roster.join(" "))
        }
        Phase::Active => format!(
            "[{link}] round {} {}s | you: {} | frost: {} | frozen: [{}]",
            session.round_number(),
            session.elapsed_seconds(),
            me,
            session.frost().map(|p| p.id.as_str()).unwrap_or("?"),
            session.frozen_ids().join(", "),
        ),
        Phase::RoundOver => {
            let outcome = session.outcome();
            format!(
                "[{link}] round {} over | winner: {} | next frost: {}{}",
                session.round_number(),
                outcome
                    .map(|o| o.winner_username.as_deref().unwrap_or(&o.winner_id))
                    .unwrap_or("?"),
                outcome.and_then(|o| o.next_frost.as_deref()).unwrap_or("?"),
                if session.restart_requested() { " | restart requested" } else { "" },
            )
        }
    }
}

// ─── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    config::init()?;
    let config = config::load_client_config()?;

    let mut args = std::env::args().skip(1);
    let room_code = args
        .next()
        .or_else(|| std::env::var("FROST_ROOM_CODE").ok())
        .ok_or("usage: frosttag <room_code> <player_id>")?;
    let player_id = args
        .next()
        .or_else(|| std::env::var("FROST_PLAYER_ID").ok())
        .ok_or("usage: frosttag <room_code> <player_id>")?;

    let handle = game::spawn(&config, room_code, player_id);

    let mut view_rx = handle.view_rx.clone();
    let watcher = tokio::spawn(async move {
        while view_rx.changed().await.is_ok() {
            let view = view_rx.borrow_and_update().clone();
            tracing::info!("{}", describe(&view));
            if view.link == LinkStatus::Closed {
                break;
            }
        }
    });

    tracing::info!("Joining room {} as {}. {}", handle.room_code, handle.self_id, HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(cmd)) => {
                let leaving = cmd == GameCommand::Leave;
                if !handle.command(cmd).await || leaving {
                    break;
                }
            }
            Ok(None) => {}
            Err(msg) => tracing::warn!("{}", msg),
        }
    }

    // stdin closed or leave sent; a second Leave is a no-op once the task is gone.
    handle.command(GameCommand::Leave).await;
    drop(handle);
    let _ = watcher.await;
    Ok(())
}
