use thiserror::Error;

/// Errors raised while exchanging coordination messages between the master
/// and its workers.
///
/// None of these are retried. A malformed message means one side of the
/// channel is buggy, and dropping it would leave the pool partially
/// inconsistent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// The method is not one of the coordination methods.
    #[error("unknown coordination method `{0}`")]
    UnknownMethod(String),

    /// A known method arrived without its `params`.
    #[error("coordination message `{0}` has no payload")]
    MissingPayload(String),

    /// A known method arrived with params of the wrong shape.
    #[error("coordination message `{method}` is malformed: {reason}")]
    Malformed { method: String, reason: String },

    /// A master-originated message reached the master, or the reverse.
    #[error("coordination message `{0}` travelled in the wrong direction")]
    WrongDirection(String),

    /// The channel to the other side is gone.
    #[error("coordination channel closed: {0}")]
    ChannelClosed(String),
}

/// Errors raised while starting a worker.
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("failed to spawn worker for slot {slot}: {source}")]
    Io {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker for slot {slot} has no {pipe} pipe")]
    MissingPipe { slot: usize, pipe: &'static str },

    #[error("worker for slot {0} exited before reporting a pid")]
    NoPid(usize),

    #[error("spawner failed for slot {slot}: {reason}")]
    Other { slot: usize, reason: String },
}
