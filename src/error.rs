//! Crate-wide error taxonomy.
//!
//! One `thiserror`-derived enum per component boundary, composed into
//! [`SidError`] via `#[from]`.

use thiserror::Error;

/// Errors returned by the KV store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("permission denied: record is MOD_PRIVATE, owned by a different module")]
    PrivateViolation,
    #[error("operation not permitted: record is MOD_PROTECTED, owned by a different module")]
    ProtectedViolation,
    #[error("resource busy: record is MOD_RESERVED, owned by a different module")]
    ReservedViolation,
    #[error("out of memory")]
    NoMemory,
    #[error("predicate rejected the write")]
    PredicateRejected,
    #[error("owner mismatch: record owned by {owner:?}, write attempted by {writer:?}")]
    OwnerMismatch { owner: String, writer: String },
    #[error("UDEV namespace may only hold blob values")]
    UdevNamespaceVectorValue,
    #[error("key not found")]
    NotFound,
}

/// Errors from the delta engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeltaError {
    #[error("vector value is not sorted ascending by element bytes")]
    UnsortedVector,
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Errors from the scan pipeline / command state machine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("phase {phase:?} forbids this mutation")]
    PhaseForbidden { phase: &'static str },
    #[error("module {module} returned failure at phase {phase:?}")]
    ModuleFailure { module: String, phase: &'static str },
    #[error("stale seqnum: stored {stored}, incoming {incoming}")]
    StaleSeqnum { stored: u64, incoming: u64 },
    #[error("malformed request frame")]
    MalformedFrame,
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u32),
    #[error("unknown command")]
    UnknownCommand,
    #[error("invalid command state transition: {from:?} -> {to:?}")]
    InvalidTransition { from: &'static str, to: &'static str },
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Errors from worker-control (C8): spawn, channel, timeout.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to fork worker: {0}")]
    Fork(#[source] nix::Error),
    #[error("failed to create channel: {0}")]
    Channel(#[source] std::io::Error),
    #[error("worker exited unexpectedly")]
    UnexpectedExit,
    #[error("worker timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("ancillary FD transfer failed: {0}")]
    FdTransfer(#[source] nix::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the bridge / front-end (C9).
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("authorization required: command must come from uid 0")]
    Unauthorized,
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level crate error.
#[derive(Debug, Error)]
pub enum SidError {
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Delta(#[from] DeltaError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SidResult<T> = Result<T, SidError>;
