use thiserror::Error;

/// Errors produced while building or applying forwarding policy.
#[derive(Debug, Error)]
pub enum KangarooError {
    #[error("config error: {0}")]
    Config(String),

    #[error("invalid address or prefix in set {set}: {entry:?}")]
    InvalidAddress { set: String, entry: String },

    #[error("duplicate address set: {0}")]
    DuplicateSet(String),

    #[error("policy {policy} references undefined address set {set}")]
    UnknownSet { policy: String, set: String },

    #[error("duplicate policy for source set: {0}")]
    DuplicatePolicy(String),

    #[error("invalid default action {0:?} (expected \"allow\", \"deny\" or empty)")]
    InvalidDefault(String),

    #[error("malformed forward request: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type KangarooResult<T> = Result<T, KangarooError>;
