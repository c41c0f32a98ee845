use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("document not found: {0}")]
    NotFound(i64),

    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    #[error("target collection exists: {0}")]
    CollectionExists(String),

    #[error("invalid collection name: {0}")]
    InvalidName(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unique index constraint violated: {0}")]
    UniqueViolation(String),

    #[error("invalid index mode: {0:#x}")]
    InvalidIndexMode(u8),

    #[error("index exists with mismatched uniqueness: {0}")]
    MismatchedUnique(String),

    #[error("patch parse error: {0}")]
    PatchParse(String),

    #[error("patch target invalid: {0}")]
    PatchTargetInvalid(String),

    #[error("patch test failed: {0}")]
    PatchTestFailed(String),

    #[error("patch value invalid: {0}")]
    PatchInvalidValue(String),

    #[error("query parse error: {0}")]
    QueryParse(String),

    #[error("json parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("json pointer did not resolve: {0}")]
    PathNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("data corrupted: {0}")]
    Corrupt(String),

    #[error("allocation limit exceeded: {0}")]
    Alloc(String),

    #[error("storage file is locked by another process")]
    LockedNonblocking,

    #[error("visitor re-entered a collection it is iterating: {0}")]
    DeadlockRisk(String),
}

pub type Result<T> = std::result::Result<T, Error>;
