//! Compiler and bytecode interpreter for the Sieve mail filtering language
//! ([RFC 5228](https://www.rfc-editor.org/rfc/rfc5228.html)).
//!
//! A script moves through four stages: the parser builds an AST, the
//! [`Validator`](validate::Validator) resolves commands and tags against the
//! registered extensions, the generator serializes the validated tree into a
//! compact [`Binary`], and the [`Interpreter`](interp::Interpreter) runs that
//! binary against one message, producing a
//! [`SieveResult`](result::SieveResult): the ordered set of actions the host
//! then commits.
//!
//! ## Example
//!
//! ```
//! use sieve_engine::{
//!     compile, execute, CompileOptions, ExitCode, Registry,
//!     runtime::{CollectingErrorHandler, MemoryMail, MessageContext, MessageData, ScriptEnv},
//! };
//!
//! let registry = Registry::with_defaults();
//! let mut ehandler = CollectingErrorHandler::default();
//!
//! let binary = compile(
//!     "require \"fileinto\";\nif header :is \"Subject\" \"Hi\" { fileinto \"INBOX.Greetings\"; }\n",
//!     &registry,
//!     &CompileOptions::default(),
//!     &mut ehandler,
//! )
//! .unwrap();
//!
//! let mail = MemoryMail::parse("Subject: Hi\r\n\r\nHello!\r\n");
//! let msg = MessageData::new(&mail);
//! let env = ScriptEnv::default();
//! let mut message_ctx = MessageContext::new();
//!
//! let (code, result) = execute(&binary, &registry, &msg, &env, &mut message_ctx, &mut ehandler);
//! assert_eq!(code, ExitCode::Ok);
//! assert_eq!(result.entries().len(), 1);
//! assert_eq!(result.entries()[0].name(), "fileinto");
//! ```

use std::path::Path;

pub mod binary;
pub mod command;
pub mod core;
pub mod error;
pub mod extensions;
pub mod generate;
pub mod interp;
pub mod matching;
pub mod op;
pub mod parse;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod validate;

pub use binary::Binary;
pub use error::{CompileError, ExitCode, LoadError, RuntimeError};
pub use registry::Registry;
pub use result::SieveResult;
pub use sieve_types;
pub use sieve_types as types;

use crate::{
    interp::Interpreter,
    runtime::{ErrorHandler, MessageContext, MessageData, ScriptEnv},
};

/// Knobs for one compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Validation stops reporting after this many errors.
    pub max_errors: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self { max_errors: 100 }
    }
}

/// Compile script text into a [`Binary`].
///
/// Diagnostics go through `ehandler`; the returned error only summarizes
/// why compilation failed.
pub fn compile(
    script: &str,
    registry: &Registry,
    options: &CompileOptions,
    ehandler: &mut dyn ErrorHandler,
) -> Result<Binary, CompileError> {
    let ast = parse::parse_script(script, ehandler)?;
    let validated = validate::Validator::new(registry, options, ehandler).run(&ast)?;
    Ok(generate::Generator::run(&ast, validated)?)
}

/// Compile a script file.
pub fn compile_file(
    path: impl AsRef<Path>,
    registry: &Registry,
    options: &CompileOptions,
    ehandler: &mut dyn ErrorHandler,
) -> Result<Binary, CompileError> {
    let script = std::fs::read_to_string(path)?;
    compile(&script, registry, options, ehandler)
}

/// Execute a binary against one message and commit the resulting actions.
///
/// Returns the exit code for the host together with the committed result;
/// the host performs the storage and forwarding the committed entries
/// describe.
pub fn execute(
    binary: &Binary,
    registry: &Registry,
    msg: &MessageData,
    env: &ScriptEnv,
    message_ctx: &mut MessageContext,
    ehandler: &mut dyn ErrorHandler,
) -> (ExitCode, SieveResult) {
    let mut interp = match Interpreter::new(binary, registry, msg, env, message_ctx) {
        Ok(interp) => interp,
        Err(error) => {
            ehandler.error(None, &error.to_string());
            return (ExitCode::Failed, SieveResult::new());
        }
    };

    match interp.run() {
        Ok(()) => {
            let mut result = interp.into_result();
            let outcome = result.commit(env, msg, ehandler);
            let code = match outcome.status {
                result::CommitStatus::Ok if outcome.keep_only => ExitCode::KeepOnly,
                result::CommitStatus::Ok => ExitCode::Ok,
                _ if outcome.temporary => ExitCode::TempFailure,
                _ => ExitCode::Failed,
            };
            (code, result)
        }
        Err(RuntimeError::Aborted) => {
            let mut result = interp.into_result();
            result.discard_on_abort(env, msg, ehandler);
            (ExitCode::TempFailure, result)
        }
        Err(error @ RuntimeError::CorruptBinary { .. }) => {
            ehandler.critical(&error.to_string());
            (ExitCode::BinaryCorrupt, SieveResult::new())
        }
        Err(error) => {
            ehandler.error(error.line(), &error.to_string());
            (ExitCode::Failed, SieveResult::new())
        }
    }
}
