use libp2p::PeerId;

/// Errors surfaced to the embedder through [`crate::controller::CoreController`].
///
/// `ProtocolError` and `CapacityDropped` from the design notes are
/// deliberately absent here: the former causes the offending stream to be
/// dropped silently (no event, no error), the latter is logged and never
/// returned from a public method.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("controller is not running")]
    NotRunning,
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("operation timed out")]
    Timeout,
    #[error("peer {0} is not connected")]
    NotConnected(PeerId),
    #[error("dial to {peer_id} failed: {reason}")]
    DialFailed { peer_id: PeerId, reason: String },
    #[error("not found")]
    NotFound,
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt persisted data: {0}")]
    Corrupt(String),
}

pub type CoreResult<T> = Result<T, CoreError>;
