use crate::hub::ResourceId;

/// Failures of a [`crate::ServerStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("resource {0} not found")]
    NotFound(ResourceId),

    #[error("resource {0} already exists")]
    AlreadyExists(ResourceId),

    #[error("version conflict: expected {expected}, found {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// One resource of a multi-resource save had moved; nothing was written.
    #[error("version conflict on resource {resource}: expected {expected}, found {actual}")]
    BatchConflict {
        resource: ResourceId,
        expected: u64,
        actual: u64,
    },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage backend failed: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Failures of a [`crate::DispatchHub`] call.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("resource {0} not found")]
    NotFound(ResourceId),

    #[error("invalid base version {base}: resource is at version {current}")]
    InvalidBaseVersion { base: u64, current: u64 },

    #[error("request touches no resources")]
    NothingTouched,

    /// Another writer moved the stored resource underneath this hub.
    #[error("concurrent modification of resource {0}")]
    Conflict(ResourceId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of a [`crate::Transport`] call. Any of these takes the session
/// offline.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("server unreachable")]
    Unreachable,

    #[error("request refused: {0}")]
    Refused(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failures talking to a running session engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session engine has shut down")]
    Closed,
}
