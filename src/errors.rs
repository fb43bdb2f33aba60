//! Error types for the plan-kernel crate.
//!
//! This module defines a unified error enumeration used across the plan data
//! model, the propagation kernel, transactions, the event log codec, and the
//! control protocol. It integrates with `thiserror` to provide rich `Display`
//! implementations and error source chaining where applicable.
//!
//! Notes:
//! - Each variant carries contextual details via its message payload.
//! - The variants mirror the failure taxonomy of the execution kernel:
//!   misuse of `call`/`emit`, broken relation policies, timeouts, and
//!   transaction conflicts.
//! - `ErrorKind` gives a payload-free discriminant for exception matchers.

use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for the plan-kernel library.
///
/// - Used across the plan model, propagation, transactions, log and protocol.
/// - Implements `std::error::Error` via `thiserror`.
pub enum PlanError {
    /// A user command raised; carries the generator and the original message.
    #[error("Command of `{0}` failed: {1}")]
    CommandFailed(String, String),

    /// A user emission handler raised; carries the generator and the message.
    #[error("Handler of `{0}` failed: {1}")]
    HandlerFailed(String, String),

    /// `emit` refused (incompatible task state, already finished, ...).
    #[error("Emission refused: {0}")]
    EmissionFailed(String),

    /// `call` on a generator that has no command.
    #[error("The `{0}` generator is not controllable.")]
    NotControllable(String),

    /// `call`/`emit` outside an executable plan, or on a non-instantiated task.
    #[error("Not executable: {0}")]
    NotExecutable(String),

    /// Operation on a generator that will never emit again.
    #[error("The `{0}` generator is unreachable.")]
    Unreachable(String),

    /// `call` on an event of a finished task.
    #[error("The task owning `{0}` is already finished.")]
    Finished(String),

    /// Command-time precondition violation (missing arguments, ...).
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A dependency relation invariant is broken: the child terminated
    /// through an event outside the edge's success/failure policy.
    #[error("Child failed: {0}")]
    ChildFailed(String),

    /// A registered deadline expired before the generator emitted.
    #[error("Timed out: {0}")]
    TimedOut(String),

    /// Edge insertion would create a cycle in a DAG relation.
    #[error("Adding the edge `{0}` would create a cycle.")]
    CycleDetected(String),

    /// Removal of an object still engaged in a strong relation.
    #[error("Removal forbidden: {0}")]
    ForbidsRemoval(String),

    /// The referenced object is not (or no longer) part of the plan.
    /// Handles held across finalization fail open to this variant.
    #[error("The object `{0}` has been finalized or never belonged to this plan.")]
    Finalized(String),

    /// Notice-only: an object was finalized while still referenced. Logged,
    /// never propagated as an exception.
    #[error("Finalization notice: {0}")]
    Finalization(String),

    /// Invalid function argument or malformed task argument set.
    #[error("Argument parse failed: {0}")]
    InvalidArgument(String),

    /// A task model failed validation (missing start, stop not terminal, ...).
    #[error("The `{0}` is not a valid task model: {1}")]
    InvalidModel(String, String),

    /// A transaction commit conflicted with concurrent plan changes.
    #[error("Commit conflict: {0}")]
    CommitConflict(String),

    /// Malformed or unsupported event log record.
    #[error("The `{0}` is not a valid log record.")]
    InvalidLogRecord(String),

    /// Invalid event log magic or version.
    #[error("The `{0}` is not a valid log header.")]
    InvalidLogHeader(String),

    /// I/O error from the underlying reader or writer.
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Text or JSON conversion error.
    #[error("Conversion error: {0}")]
    ConversionError(String),

    /// Generic custom error for miscellaneous failures.
    #[error("{0}")]
    CustomError(String),
}

/// Payload-free discriminant of [`PlanError`], used by exception matchers and
/// the log's exception records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    CommandFailed,
    HandlerFailed,
    EmissionFailed,
    NotControllable,
    NotExecutable,
    Unreachable,
    Finished,
    PreconditionFailed,
    ChildFailed,
    TimedOut,
    CycleDetected,
    ForbidsRemoval,
    Finalized,
    Finalization,
    InvalidArgument,
    InvalidModel,
    CommitConflict,
    InvalidLogRecord,
    InvalidLogHeader,
    IOError,
    ConversionError,
    CustomError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::HandlerFailed => "handler_failed",
            ErrorKind::EmissionFailed => "emission_failed",
            ErrorKind::NotControllable => "not_controllable",
            ErrorKind::NotExecutable => "not_executable",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::Finished => "finished",
            ErrorKind::PreconditionFailed => "precondition_failed",
            ErrorKind::ChildFailed => "child_failed",
            ErrorKind::TimedOut => "timed_out",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::ForbidsRemoval => "forbids_removal",
            ErrorKind::Finalized => "finalized",
            ErrorKind::Finalization => "finalization",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::InvalidModel => "invalid_model",
            ErrorKind::CommitConflict => "commit_conflict",
            ErrorKind::InvalidLogRecord => "invalid_log_record",
            ErrorKind::InvalidLogHeader => "invalid_log_header",
            ErrorKind::IOError => "io_error",
            ErrorKind::ConversionError => "conversion_error",
            ErrorKind::CustomError => "custom_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PlanError {
    /// The payload-free discriminant of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PlanError::CommandFailed(..) => ErrorKind::CommandFailed,
            PlanError::HandlerFailed(..) => ErrorKind::HandlerFailed,
            PlanError::EmissionFailed(_) => ErrorKind::EmissionFailed,
            PlanError::NotControllable(_) => ErrorKind::NotControllable,
            PlanError::NotExecutable(_) => ErrorKind::NotExecutable,
            PlanError::Unreachable(_) => ErrorKind::Unreachable,
            PlanError::Finished(_) => ErrorKind::Finished,
            PlanError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
            PlanError::ChildFailed(_) => ErrorKind::ChildFailed,
            PlanError::TimedOut(_) => ErrorKind::TimedOut,
            PlanError::CycleDetected(_) => ErrorKind::CycleDetected,
            PlanError::ForbidsRemoval(_) => ErrorKind::ForbidsRemoval,
            PlanError::Finalized(_) => ErrorKind::Finalized,
            PlanError::Finalization(_) => ErrorKind::Finalization,
            PlanError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            PlanError::InvalidModel(..) => ErrorKind::InvalidModel,
            PlanError::CommitConflict(_) => ErrorKind::CommitConflict,
            PlanError::InvalidLogRecord(_) => ErrorKind::InvalidLogRecord,
            PlanError::InvalidLogHeader(_) => ErrorKind::InvalidLogHeader,
            PlanError::IOError(_) => ErrorKind::IOError,
            PlanError::ConversionError(_) => ErrorKind::ConversionError,
            PlanError::CustomError(_) => ErrorKind::CustomError,
        }
    }
}
