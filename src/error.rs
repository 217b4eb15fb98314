//! Error-related types.
//!
//! Validation problems are reported through the
//! [`ErrorHandler`](crate::runtime::ErrorHandler) and accumulated; everything
//! after validation fails fast with one of the error types below.

use std::io;

use thiserror::Error;

use crate::binary::ReadError;

/// Why a script failed to compile.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The script text could not be parsed. Details were reported through the
    /// error handler.
    #[error("syntax error at line {line}")]
    Syntax { line: u32 },

    /// Validation reported one or more errors through the error handler.
    #[error("validation failed with {errors} error(s)")]
    Invalid { errors: usize },

    /// Code generation failed. This is a bug, not a script problem.
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A code generation failure.
///
/// These are internal errors: a validated AST must always generate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    /// A reserved jump slot was dropped without being resolved.
    #[error("unresolved jump offset in generated code")]
    UnresolvedJump,

    /// A node had no validation context attached.
    #[error("no validation context for node {0}")]
    MissingContext(u32),

    /// An object operand referenced an extension that cannot be indexed.
    #[error("extension index exhausted by {0}")]
    TooManyExtensions(&'static str),

    /// A command without an opcode reached the default emitter.
    #[error("command '{0}' has no opcode")]
    MissingOpcode(&'static str),

    /// A structural invariant the validator guarantees did not hold.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

/// Why a stored binary could not be loaded.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("not a sieve binary (bad magic)")]
    BadMagic,

    #[error("unsupported binary version {0}")]
    UnsupportedVersion(u16),

    #[error("malformed binary: {0}")]
    Malformed(#[from] ReadError),

    /// The binary's extension index names an extension that is not
    /// registered.
    #[error("binary requires unknown extension '{0}'")]
    UnknownExtension(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A failure during interpretation.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The code stream could not be decoded. Fatal; the run is aborted.
    #[error("corrupt binary at address {pc:#06x}: {source}")]
    CorruptBinary { pc: usize, source: ReadError },

    /// The binary references an extension unknown to the runtime.
    #[error("binary requires unknown extension '{0}'")]
    UnknownExtension(String),

    /// A script-level runtime failure, reported at the source line captured
    /// during generation.
    #[error("line {line}: {message}")]
    Script { line: u32, message: String },

    /// Two actions cannot both be part of one result.
    #[error(
        "{action} action (line {line}) conflicts with earlier {other_action} action (line {other_line})"
    )]
    ActionConflict {
        action: &'static str,
        line: u32,
        other_action: &'static str,
        other_line: u32,
    },

    /// An action was requested twice with the same effect.
    #[error("duplicate {action} action (line {line}, first at line {other_line})")]
    DuplicateAction {
        action: &'static str,
        line: u32,
        other_line: u32,
    },

    /// The host raised the abort flag; the run is discarded and the message
    /// is expected to be retried.
    #[error("execution aborted")]
    Aborted,
}

impl RuntimeError {
    pub(crate) fn corrupt(pc: usize, source: ReadError) -> Self {
        Self::CorruptBinary { pc, source }
    }

    /// The source line to blame, when one is known.
    pub fn line(&self) -> Option<u32> {
        match self {
            Self::Script { line, .. }
            | Self::ActionConflict { line, .. }
            | Self::DuplicateAction { line, .. } => Some(*line),
            _ => None,
        }
    }
}

/// Outcome of executing a binary against a message, as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// The script ran and actions beyond the implicit keep were committed.
    Ok,
    /// The script ran and only the implicit keep was committed.
    KeepOnly,
    /// The run was aborted or failed temporarily; the host should requeue
    /// the message and retry later.
    TempFailure,
    /// The binary is corrupt and must be recompiled.
    BinaryCorrupt,
    /// The run failed. Errors were reported through the error handler.
    Failed,
}
