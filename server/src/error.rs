use shared::PlayerId;
use thiserror::Error;

/// Failures of the server front end
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("packet codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid bind address '{0}'")]
    InvalidAddress(String),
}

/// Reasons a player action is refused by the table
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("player {0} is not seated at this table")]
    UnknownPlayer(PlayerId),

    #[error("no phase is in progress")]
    NoCurrentPhase,

    #[error("the game is already over")]
    GameFinished,
}
