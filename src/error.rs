use thiserror::Error;

/// Scheduling, completion and store errors. Channel failures are handled
/// separately inside the dispatcher (counted, never propagated).
#[derive(Debug, Error)]
pub enum Error {
    #[error("anchor date is outside the supported calendar range")]
    InvalidAnchorDate,

    #[error("topic {0} does not exist")]
    UnknownTopic(i64),

    #[error("user {0} does not exist")]
    UnknownUser(i64),

    #[error("repetition {0} does not exist")]
    UnknownRepetition(i64),

    #[error("repetition {0} is already completed")]
    AlreadyCompleted(i64),

    #[error("topic {0} already has a repetition schedule")]
    AlreadyScheduled(i64),

    #[error("difficulty rating must be between 1 and 5, got {0}")]
    InvalidDifficultyRating(i64),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),
}
