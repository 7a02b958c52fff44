//! Error types for the collector
//!
//! `ClientError` is what the API adapters return; `GcError` is what workers
//! classify to decide between forgetting and requeueing an item.

use super::model::{ObjectReference, PartitionId};
use thiserror::Error;

/// Failure talking to a cluster's API server
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden(_))
    }
}

impl From<kube::Error> for ClientError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(response) => {
                let message = response.message.clone();
                match response.code {
                    404 => Self::NotFound,
                    409 => Self::Conflict(message),
                    403 => Self::Forbidden(message),
                    415 => Self::UnsupportedMediaType(message),
                    code => Self::Api { code, message },
                }
            }
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Outcome of processing one work item, other than success
#[derive(Error, Debug)]
pub enum GcError {
    /// The item turned out not to exist; a delete event was queued for it
    #[error("enqueued virtual delete event")]
    VirtualDeleteEnqueued,

    #[error("cluster-scoped objects cannot refer to namespaced owners")]
    NamespacedOwnerOfClusterScopedObject,

    #[error("no graph builder registered for partition {0}")]
    PartitionNotRegistered(PartitionId),

    #[error("partition {0} is already registered")]
    PartitionAlreadyRegistered(PartitionId),

    #[error("unable to get REST mapping for {api_version}/{kind}")]
    RestMapping { api_version: String, kind: String },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("conflict retries exhausted for {0}")]
    ConflictRetriesExhausted(ObjectReference),

    #[error("failed to orphan dependents of {owner}: {errors}")]
    OrphanFailed {
        owner: ObjectReference,
        errors: String,
    },

    #[error("discovery failed: {0}")]
    Discovery(String),
}

impl GcError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Client(ClientError::NotFound))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Client(ClientError::Conflict(_)))
    }

    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Client(ClientError::Forbidden(_)))
    }
}

pub type Result<T, E = GcError> = std::result::Result<T, E>;
