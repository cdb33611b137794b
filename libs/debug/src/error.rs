use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A match-set reference resolved to a hashed name the cache has never seen registered
    /// (spec.md §7 `unknown set type`).
    #[error("unknown set type for hashed name {0}")]
    UnknownSetType(String),

    #[error("{0}")]
    ParseError(String),

    #[error("{0}")]
    Core(#[from] npm_core::Error),

    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
