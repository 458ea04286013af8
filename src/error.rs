//! Closed error taxonomy for the session execution core (spec §7).
//!
//! Validation and adapter-protocol errors are typed so callers can match on
//! them; everything past the adapter boundary (process I/O, storage) flows
//! through `anyhow::Result` the way the rest of the crate does.

use thiserror::Error;

/// Errors raised by the safety gate (spec §4.1). Surfaced at session-runner
/// start; always flips the execution to `failed`, never retried.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("working directory is not absolute: {0}")]
    NotAbsolute(String),
    #[error("working directory does not exist: {0}")]
    NotExist(String),
    #[error("working directory is not in the allowlist: {0}")]
    NotInAllowlist(String),
    #[error("binary is not executable: {0}")]
    NotExecutable(String),
    #[error("missing required argument: {0}")]
    MissingRequired(String),
    #[error("argument '{0}' is not a scalar value")]
    NonScalar(String),
    #[error("argument '{field}' does not match required pattern")]
    PatternMismatch { field: String },
    #[error("command token '{0}' has no matching argument")]
    MissingToken(String),
    #[error("argument '{field}' contains a disallowed character")]
    DisallowedChar { field: String },
}

/// Errors raised while decoding an adapter's wire protocol. Per spec §7 these
/// are swallowed with a single warn inside event mapping and never abort the
/// session — callers should log and continue, not propagate.
#[derive(Debug, Error)]
pub enum AdapterProtocolError {
    #[error("malformed JSON frame: {0}")]
    MalformedJson(String),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(String),
}

/// The terminal disposition of a finished execution (spec §3, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}
