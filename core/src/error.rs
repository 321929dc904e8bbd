//! Error taxonomy for the instrumentation runtime.
//!
//! Every fallible path in the crate funnels into one of these variants so that
//! the command pipeline can turn it into a `CommandResult` without ever
//! unwinding past a handler boundary (see `command::manager`).

use std::fmt;

/// Top level error type shared by every subsystem.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("scheduling error: {0}")]
    Scheduling(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialize(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors specific to the hook engine (§7, "Hook").
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("prefix_length {0} is smaller than the minimum control-transfer size {1}")]
    PrefixTooShort(usize, usize),

    #[error("a hook already exists at address {0:#x}")]
    DuplicateInstall(usize),

    #[error("no hook installed at address {0:#x}")]
    NotInstalled(usize),

    #[error("could not quiesce target region after {0} retries")]
    SuspendRetriesExhausted(u32),

    #[error("failed to allocate executable memory: {0}")]
    AllocFailed(String),

    #[error("failed to change memory protection: {0}")]
    ProtectFailed(String),
}

/// Errors specific to the storage layer (§4.4 / §7, "Storage").
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("no value stored under key {0:?}")]
    MissingKey(String),

    #[error("value stored under key {0:?} has a different type than requested")]
    TypeMismatch(String),
}

/// Errors specific to the command registry/manager (§7, "Scheduling").
#[derive(Debug, thiserror::Error)]
pub enum SchedulingError {
    #[error("no such queue {0}")]
    UnknownQueue(u64),

    #[error("command worker is no longer running")]
    WorkerStopped,

    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),
}

impl From<SchedulingError> for Error {
    fn from(e: SchedulingError) -> Self {
        Error::Scheduling(e.to_string())
    }
}

/// Errors specific to the transport layer (§7, "Protocol"/"Transport").
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("frame length {0} exceeds configured maximum {1}")]
    FrameTooLarge(u32, u32),

    #[error("connection closed by peer")]
    PeerClosed,

    #[error("malformed HTTP fallback request: {0}")]
    MalformedHttp(String),
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Wrap an arbitrary panic payload or displayable value into a `Handler` error.
/// Used at the command-invocation boundary so a panicking handler never takes
/// down the worker thread (see `command::manager::CommandManager::run`).
pub fn handler_error(e: impl fmt::Display) -> Error {
    Error::Handler(e.to_string())
}
