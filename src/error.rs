use crate::content::FlagStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("realtime socket error: {0}")]
    Socket(String),

    #[error("malformed row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("not signed in")]
    Unauthenticated,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("could not load items: {0}")]
    Fetch(#[source] BackendError),

    #[error("could not subscribe to changes: {0}")]
    Subscribe(#[source] BackendError),

    #[error("view is already subscribed")]
    AlreadySubscribed,

    #[error("view was unmounted or re-initialized before the result arrived")]
    Detached,
}

#[derive(Error, Debug)]
pub enum MutationError {
    #[error("sign in to continue")]
    Unauthenticated,

    #[error("comment cannot be empty")]
    EmptyBody,

    #[error("comment is longer than {max} characters")]
    BodyTooLong { max: usize },

    #[error("a reason is required")]
    EmptyReason,

    #[error("option {index} does not exist (poll has {options})")]
    InvalidOption { index: usize, options: usize },

    #[error("poll is closed")]
    PollClosed,

    #[error("flag was already resolved as {0}")]
    FlagAlreadyResolved(FlagStatus),

    #[error("flags can only move from pending to a final status")]
    InvalidTransition,

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("unexpected response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
pub type MutationResult<T> = Result<T, MutationError>;
