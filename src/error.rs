use std::path::PathBuf;

/// Failure loading or writing `client.json`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// A frame that could not be turned into a typed event.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no event name")]
    MissingEventName,
    #[error("invalid payload for {event}: {source}")]
    InvalidPayload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("outbound queue is full")]
    Backlogged,
    #[error("channel task has shut down")]
    Closed,
}

/// Why a local action was not turned into an intent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejected {
    #[error("action is not available in the {0} phase")]
    WrongPhase(crate::session::Phase),
    #[error("only the frost can freeze")]
    NotFrost,
    #[error("the frost cannot unfreeze")]
    IsFrost,
    #[error("frozen players cannot act")]
    SelfFrozen,
    #[error("local player is not part of this round")]
    NotParticipating,
    #[error("unknown participant {0}")]
    UnknownTarget(String),
    #[error("cannot target yourself")]
    SelfTarget,
}
