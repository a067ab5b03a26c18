//! Error types for the replication engine.

use kube::runtime::watcher;
use thiserror::Error;

/// Errors that can occur while replicating objects between clusters.
#[derive(Debug, Error)]
pub enum ReplicatorError {
    /// Kubernetes API error.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Watch stream error.
    #[error("Watch error: {0}")]
    WatchError(#[from] watcher::Error),

    /// Object not found.
    #[error("Object not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Object namespace (empty for cluster-scoped kinds).
        namespace: String,
    },

    /// Optimistic concurrency conflict (stale resource version).
    #[error("Conflict writing {kind}/{name}: {reason}")]
    Conflict {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// Reason reported by the store.
        reason: String,
    },

    /// The object already exists.
    #[error("Object already exists: {kind}/{name}")]
    AlreadyExists {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
    },

    /// Network timeout, throttling or a temporarily unavailable server.
    #[error("Transient endpoint error: {0}")]
    Transient(String),

    /// The endpoint could not be reached at all (connection refused, DNS).
    #[error("Endpoint unreachable: {0}")]
    Unreachable(String),

    /// A call did not complete within its deadline.
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline in milliseconds.
        after_ms: u64,
    },

    /// The peer cannot be used anymore (credentials revoked, unreachable).
    #[error("Peer {cluster} is unusable: {reason}")]
    PeerUnusable {
        /// Peer cluster identifier.
        cluster: String,
        /// Reason.
        reason: String,
    },

    /// The peer is not registered or is being torn down.
    #[error("Peer {0} is not active")]
    PeerNotActive(String),

    /// An object carries unparseable markers or lacks a required field.
    #[error("Malformed object {kind}/{name}: {reason}")]
    MalformedObject {
        /// Object kind.
        kind: String,
        /// Object name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A watch with the same key is already running.
    #[error("Duplicate watch: {0}")]
    DuplicateWatch(String),

    /// The surrounding subscription was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(String),
}

/// Result type for replication operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// How an error must be handled by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retry with bounded backoff at the call site.
    Transient,
    /// Re-read and retry the read-modify-write.
    Conflict,
    /// Drive the peer to Degraded.
    PeerUnusable,
    /// Skip the object and record a condition.
    Malformed,
    /// The target does not exist.
    NotFound,
    /// Programming error; fatal to the offending subscription.
    Invariant,
    /// Work stopped because its subscription was cancelled.
    Cancelled,
}

impl ReplicatorError {
    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            ReplicatorError::KubeError(e) => classify_kube(e),
            ReplicatorError::WatchError(e) => match e {
                watcher::Error::InitialListFailed(inner)
                | watcher::Error::WatchStartFailed(inner)
                | watcher::Error::WatchFailed(inner) => classify_kube(inner),
                watcher::Error::WatchError(resp) => classify_status(resp.code),
                _ => ErrorClass::Transient,
            },
            ReplicatorError::NotFound { .. } => ErrorClass::NotFound,
            ReplicatorError::Conflict { .. } | ReplicatorError::AlreadyExists { .. } => {
                ErrorClass::Conflict
            }
            ReplicatorError::Transient(_)
            | ReplicatorError::Unreachable(_)
            | ReplicatorError::Timeout { .. } => ErrorClass::Transient,
            ReplicatorError::PeerUnusable { .. } => ErrorClass::PeerUnusable,
            ReplicatorError::PeerNotActive(_) | ReplicatorError::Cancelled => ErrorClass::Cancelled,
            ReplicatorError::MalformedObject { .. } | ReplicatorError::SerializationError(_) => {
                ErrorClass::Malformed
            }
            ReplicatorError::DuplicateWatch(_)
            | ReplicatorError::InvalidConfig(_)
            | ReplicatorError::IoError(_) => ErrorClass::Invariant,
        }
    }

    /// Whether the error is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether the endpoint never answered, as opposed to answering with an
    /// error. Only these failures count towards declaring a peer unreachable.
    pub fn is_unreachable(&self) -> bool {
        match self {
            ReplicatorError::Unreachable(_) | ReplicatorError::Timeout { .. } => true,
            ReplicatorError::KubeError(e) => is_transport(e),
            ReplicatorError::WatchError(
                watcher::Error::InitialListFailed(e)
                | watcher::Error::WatchStartFailed(e)
                | watcher::Error::WatchFailed(e),
            ) => is_transport(e),
            _ => false,
        }
    }

    /// Whether the error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }

    /// Whether the error means the object does not exist.
    pub fn is_not_found(&self) -> bool {
        self.class() == ErrorClass::NotFound
    }
}

fn classify_kube(err: &kube::Error) -> ErrorClass {
    match err {
        kube::Error::Api(resp) => classify_status(resp.code),
        kube::Error::Auth(_) | kube::Error::InferConfig(_) => ErrorClass::PeerUnusable,
        kube::Error::SerdeError(_) => ErrorClass::Malformed,
        _ => ErrorClass::Transient,
    }
}

fn is_transport(err: &kube::Error) -> bool {
    matches!(err, kube::Error::HyperError(_) | kube::Error::Service(_))
}

fn classify_status(code: u16) -> ErrorClass {
    match code {
        404 | 410 => ErrorClass::NotFound,
        409 => ErrorClass::Conflict,
        401 | 403 => ErrorClass::PeerUnusable,
        400 | 422 => ErrorClass::Malformed,
        _ => ErrorClass::Transient,
    }
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(err: serde_json::Error) -> Self {
        ReplicatorError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ReplicatorError {
    fn from(err: serde_yaml::Error) -> Self {
        ReplicatorError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::IoError(err.to_string())
    }
}
