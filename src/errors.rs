use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Engine error kinds. Transient network and IMAP `NO` failures are retried
/// by the scheduler on the next cycle; `Auth` is not retried automatically.
#[derive(Error, Debug)]
pub enum Error {
    #[error("network error: {0}")]
    Net(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("tls error: {0}")]
    Tls(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("command failed: {0}")]
    No(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("lock held: {0}")]
    Lock(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("state error: {0}")]
    State(String),
}

impl Error {
    /// Lock contention means another fetch is already running; the cycle is
    /// a no-op rather than a failure.
    pub fn is_lock(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<Error>(), Some(Error::Lock(_)))
    }
}
