use crate::session::SessionId;
use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("failed to load model: {0}")]
    Load(String),
    #[error("inference failed: {0}")]
    Inference(String),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("unexpected http status {0}")]
    Status(u16),
    #[error("image exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("error decoding image: {0}")]
    Decode(String),
}

/// Failure of a single `detect` command. The worker survives all of these.
#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("image fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("backend task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("worker for session {0} has stopped")]
    Stopped(SessionId),
    #[error("computation failed for session {session}: {source}")]
    Compute {
        session: SessionId,
        #[source]
        source: ComputeError,
    },
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no worker registered for session {0}")]
    UnknownSession(SessionId),
    #[error("failed to create worker for session {session}: {source}")]
    CreationFailure {
        session: SessionId,
        #[source]
        source: BackendError,
    },
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("session id must not be empty")]
    InvalidSessionId,
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error("computation failed for session {session}: {source}")]
    ComputeFailure {
        session: SessionId,
        #[source]
        source: ComputeError,
    },
    #[error("failed to create worker for session {session}: {source}")]
    CreationFailure {
        session: SessionId,
        #[source]
        source: BackendError,
    },
}

impl From<RegistryError> for ServiceError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownSession(session) => ServiceError::UnknownSession(session),
            RegistryError::CreationFailure { session, source } => {
                ServiceError::CreationFailure { session, source }
            }
        }
    }
}

impl From<WorkerError> for ServiceError {
    fn from(err: WorkerError) -> Self {
        match err {
            // A stopped worker means the session was terminated underneath the call
            WorkerError::Stopped(session) => ServiceError::UnknownSession(session),
            WorkerError::Compute { session, source } => {
                ServiceError::ComputeFailure { session, source }
            }
        }
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::InvalidSessionId => Status::invalid_argument(message),
            ServiceError::UnknownSession(_) => Status::not_found(message),
            ServiceError::ComputeFailure {
                source: ComputeError::Fetch(_),
                ..
            } => Status::invalid_argument(message),
            ServiceError::ComputeFailure { .. } => Status::internal(message),
            ServiceError::CreationFailure { .. } => Status::internal(message),
        }
    }
}
