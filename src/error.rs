//! Unified error types for the fill controller.
//!
//! A single `Error` enum that every subsystem converts into.  Domain
//! faults (`position_timeout`, `out_of_tolerance`, ...) are not errors;
//! they are [`FaultRecord`](crate::fsm::context::FaultRecord)s produced by
//! the state machine.

use core::fmt;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation outside the state machine funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The persistence sink rejected a record.
    Persist(PersistError),
    /// The bus adapter failed.
    Bus(BusError),
    /// Configuration is invalid or could not be loaded.
    Config(ConfigError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Persist(e) => write!(f, "persist: {e}"),
            Self::Bus(e) => write!(f, "bus: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Decode errors
// ---------------------------------------------------------------------------

/// Why an inbound message never became a domain event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The topic is not one the router subscribes to.
    UnknownTopic,
    /// The payload is not UTF-8 JSON of the expected shape.
    Malformed(String),
    /// A numeric field is NaN or infinite.
    NonFinite(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownTopic => write!(f, "unknown topic"),
            Self::Malformed(msg) => write!(f, "malformed payload: {msg}"),
            Self::NonFinite(field) => write!(f, "non-finite value in '{field}'"),
        }
    }
}

impl std::error::Error for DecodeError {}

// ---------------------------------------------------------------------------
// Persistence errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistError {
    /// The sink could not be opened.
    Unavailable(String),
    /// A write or flush failed.
    WriteFailed(String),
    /// The record could not be serialised.
    Encode(String),
}

impl fmt::Display for PersistError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "sink unavailable: {msg}"),
            Self::WriteFailed(msg) => write!(f, "write failed: {msg}"),
            Self::Encode(msg) => write!(f, "encode failed: {msg}"),
        }
    }
}

impl std::error::Error for PersistError {}

impl From<PersistError> for Error {
    fn from(e: PersistError) -> Self {
        Self::Persist(e)
    }
}

// ---------------------------------------------------------------------------
// Bus errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Could not reach the broker.
    ConnectFailed(String),
    /// The connection dropped.
    Disconnected,
    /// A publish was rejected or could not be queued.
    PublishFailed,
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::PublishFailed => write!(f, "publish failed"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<BusError> for Error {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment value could not be parsed; carries the variable name.
    Invalid(&'static str),
    /// A field failed range validation.
    /// The `&'static str` describes which field and why.
    ValidationFailed(&'static str),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid(key) => write!(f, "invalid value for {key}"),
            Self::ValidationFailed(msg) => write!(f, "validation failed: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
