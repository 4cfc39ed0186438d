use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ProtocolError;

/// Status of a player as reported in a `game_started` snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WireStatus {
    Active,
    Frozen,
    /// The player holding the Frost role this round.
    Mraz,
    /// Anything the server sends that this client does not know about.
    Unknown,
}

impl<'de> Deserialize<'de> for WireStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "active" => Self::Active,
            "frozen" => Self::Frozen,
            "mraz" => Self::Mraz,
            _ => Self::Unknown,
        })
    }
}

/// Events pushed by the game server over the socket channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    // Room membership
    PlayerJoined {
        player_id: String,
    },
    PlayerLeft {
        player_id: String,
    },
    PlayerReadyUpdate {
        player_id: String,
        is_ready: bool,
    },

    // Round lifecycle
    GameStarted {
        mraz_id: String,
        #[serde(default)]
        mraz_username: Option<String>,
        #[serde(default)]
        player_statuses: BTreeMap<String, WireStatus>,
        round_number: u32,
    },
    PlayerFrozen {
        frozen_player_id: String,
        #[serde(default)]
        mraz_id: Option<String>,
    },
    PlayerUnfrozen {
        unfrozen_player_id: String,
        #[serde(default)]
        unfreezer_id: Option<String>,
    },
    RoundOver {
        winner_id: String,
        #[serde(default)]
        winner_username: Option<String>,
        #[serde(default)]
        next_mraz: Option<String>,
    },
    /// Older servers announce the end of a round with this form instead.
    GameOver {
        winner: String,
        #[serde(default)]
        frozen_players: Vec<String>,
    },

    // In-round activity
    PowerUsed {
        player_id: String,
        power_id: String,
    },
    ProximityEvent {
        player1_id: String,
        player2_id: String,
    },
    LocationUpdate {
        player_id: String,
        latitude: f64,
        longitude: f64,
    },
}

impl ServerEvent {
    /// Decode a text frame into a typed event.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let name = value
            .get("event")
            .and_then(|e| e.as_str())
            .ok_or(ProtocolError::MissingEventName)?
            .to_string();

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { event: name, source })
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PlayerJoined { .. } => "player_joined",
            Self::PlayerLeft { .. } => "player_left",
            Self::PlayerReadyUpdate { .. } => "player_ready_update",
            Self::GameStarted { .. } => "game_started",
            Self::PlayerFrozen { .. } => "player_frozen",
            Self::PlayerUnfrozen { .. } => "player_unfrozen",
            Self::RoundOver { .. } => "round_over",
            Self::GameOver { .. } => "game_over",
            Self::PowerUsed { .. } => "power_used",
            Self::ProximityEvent { .. } => "proximity_event",
            Self::LocationUpdate { .. } => "location_update",
        }
    }
}

/// Intents sent from this client to the game server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientIntent {
    JoinGame {
        room_code: String,
        player_id: String,
    },
    PlayerReady {
        room_code: String,
        player_id: String,
        is_ready: bool,
    },
    StartGame {
        room_code: String,
    },
    FreezePlayer {
        room_code: String,
        frozen_player_id: String,
        mraz_id: String,
    },
    UnfreezePlayer {
        room_code: String,
        frozen_player_id: String,
        unfreezer_id: String,
    },
    RestartRound {
        room_code: String,
    },
    LeaveGame {
        room_code: String,
        player_id: String,
    },
    UsePower {
        room_code: String,
        player_id: String,
        power_id: String,
    },
    ProximityDetected {
        room_code: String,
        player1_id: String,
        player2_id: String,
    },
    UpdateLocation {
        room_code: String,
        player_id: String,
        latitude: f64,
        longitude: f64,
    },
}

impl ClientIntent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the intent.
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinGame { .. } => "join_game",
            Self::PlayerReady { .. } => "player_ready",
            Self::StartGame { .. } => "start_game",
            Self::FreezePlayer { .. } => "freeze_player",
            Self::UnfreezePlayer { .. } => "unfreeze_player",
            Self::RestartRound { .. } => "restart_round",
            Self::LeaveGame { .. } => "leave_game",
            Self::UsePower { .. } => "use_power",
            Self::ProximityDetected { .. } => "proximity_detected",
            Self::UpdateLocation { .. } => "update_location",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_game_started_snapshot() {
        let text = r#"{"event":"game_started","data":{
            "mraz_id":"p2","mraz_username":"Ana",
            "player_statuses":{"p1":"active","p2":"mraz","p3":"active"},
            "round_number":1}}"#;

        let event = ServerEvent::decode(text).unwrap();
        match event {
            ServerEvent::GameStarted { mraz_id, mraz_username, player_statuses, round_number } => {
                assert_eq!(mraz_id, "p2");
                assert_eq!(mraz_username.as_deref(), Some("Ana"));
                assert_eq!(player_statuses.get("p2"), Some(&WireStatus::Mraz));
                assert_eq!(player_statuses.len(), 3);
                assert_eq!(round_number, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn optional_fields_default() {
        let event = ServerEvent::decode(r#"{"event":"round_over","data":{"winner_id":"p1"}}"#).unwrap();
        assert_eq!(event, ServerEvent::RoundOver {
            winner_id: "p1".into(),
            winner_username: None,
            next_mraz: None,
        });
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let text = r#"{"event":"game_started","data":{"mraz_id":"a",
            "player_statuses":{"a":"mraz","b":"spectating"},"round_number":2}}"#;
        let ServerEvent::GameStarted { player_statuses, .. } = ServerEvent::decode(text).unwrap() else {
            panic!("expected game_started");
        };
        assert_eq!(player_statuses.get("b"), Some(&WireStatus::Unknown));
    }

    #[test]
    fn rejects_frames_without_event_name() {
        let err = ServerEvent::decode(r#"{"data":{"player_id":"p1"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingEventName));
    }

    #[test]
    fn rejects_unknown_event_and_bad_payload() {
        let err = ServerEvent::decode(r#"{"event":"confetti","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "confetti"));

        let err = ServerEvent::decode(r#"{"event":"player_frozen","data":{"who":"p1"}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { ref event, .. } if event == "player_frozen"));

        assert!(matches!(ServerEvent::decode("not json"), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn intent_wire_shape() {
        let intent = ClientIntent::FreezePlayer {
            room_code: "ABC123".into(),
            frozen_player_id: "p1".into(),
            mraz_id: "p2".into(),
        };
        let value: serde_json::Value = serde_json::from_str(&intent.encode().unwrap()).unwrap();
        assert_eq!(value["event"], "freeze_player");
        assert_eq!(value["data"]["room_code"], "ABC123");
        assert_eq!(value["data"]["frozen_player_id"], "p1");
        assert_eq!(value["data"]["mraz_id"], "p2");
        assert_eq!(intent.name(), "freeze_player");
    }
}
