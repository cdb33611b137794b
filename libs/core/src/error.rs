use thiserror::Error;

/// Errors surfaced by the CORE (kernel shim, ipset manager, rule engine, translator, cache).
///
/// The variants mirror the error-kind taxonomy in the propagation design: transient errors
/// are retried by the caller's work queue, permanent ones are surfaced as-is.
#[derive(Error, Debug)]
pub enum Error {
    /// Kernel filter utility's cooperative lock could not be acquired in time, or the
    /// underlying process timed out. Callers should re-queue with backoff.
    #[error("transient kernel error: {0}")]
    TransientKernel(String),

    /// The kernel filter utility rejected a rule/set batch outright. Permanent for the
    /// offending batch; the caller marks the policy failed until the next update.
    #[error("kernel utility rejected batch: {0}")]
    SyntaxReject(String),

    /// The kernel filter or ipset utility binary itself is missing. Fatal at startup.
    #[error("kernel utility missing: {0}")]
    UtilityMissing(String),

    /// An informer's local cache could not be kept in sync. Fatal for that controller.
    #[error("informer sync failed for {0}")]
    InformerSyncFailure(String),

    /// An event carried an object of unexpected type (or a malformed tombstone).
    #[error("failed to decode event object: {0}")]
    DecodeFailure(String),

    /// The debug converter encountered a hashed set name it cannot classify.
    #[error("unknown set type for hashed name {0}")]
    UnknownSetType(String),

    #[error("{0}")]
    ParseError(String),

    #[error("{0}: {1}")]
    KubeError(String, #[source] Box<kube::Error>),

    #[error("{0}")]
    K8sUtil(#[from] npm_k8s_util::error::Error),

    #[error("{0}: {1}")]
    Io(String, #[source] std::io::Error),

    #[error("{0}: {1}")]
    SerializationError(String, #[source] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
