use skyhook_common::JobType;
use uuid::Uuid;

use crate::persistence::PersistenceError;
use crate::queue::QueueError;
use crate::stages::StageError;

/// A wrapper to capture any error possible in the orchestration core.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid payload: {0}")]
    Validation(String),
    #[error("failed to encode job payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to interact with the state store")]
    Store(#[from] PersistenceError),
    #[error("failed to interact with the queue")]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Stage(#[from] StageError),
    #[error("{0} handler exceeded its deadline")]
    DeadlineExceeded(JobType),
    #[error("cancelled by shutdown")]
    Cancelled,
    #[error("handler panicked: {0}")]
    HandlerPanicked(String),
    #[error("deployment {0} not found")]
    DeploymentNotFound(Uuid),
    #[error("infrastructure {0} not found")]
    InfrastructureNotFound(Uuid),
    #[error("io failure: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a retry has a chance of succeeding.
    ///
    /// Informational only: the pool retries every failure up to the
    /// attempt ceiling, which is the actual safety net.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Store(_)
            | Error::Queue(_)
            | Error::DeadlineExceeded(_)
            | Error::Cancelled
            | Error::Io(_) => true,
            Error::Stage(stage) => stage.is_transient(),
            Error::Validation(_)
            | Error::Encode(_)
            | Error::HandlerPanicked(_)
            | Error::DeploymentNotFound(_)
            | Error::InfrastructureNotFound(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
