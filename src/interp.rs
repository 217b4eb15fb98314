//! The bytecode interpreter.
//!
//! Execution is strictly sequential: Sieve has no user-defined procedures,
//! so there is no call stack. Conditionals and the short-circuit logical
//! tests compile to forward jumps; the single test-result register carries
//! verdicts from test operations to the jumps that consume them. An external
//! abort flag is polled between opcodes.

use std::{any::Any, collections::HashMap, sync::atomic::Ordering};

use crate::{
    binary::{Binary, ReadError, Reader},
    error::RuntimeError,
    matching::{self, AddressPart, Comparator, MatchType},
    op::{Dispatch, Outcome},
    registry::Registry,
    result::{SideEffect, SieveResult},
    runtime::{MessageContext, MessageData, ScriptEnv},
};

/// The comparator, match type, and address part a test runs with.
#[derive(Debug, Clone, Copy)]
pub struct SelectedMatch {
    pub comparator: &'static dyn Comparator,
    pub match_type: &'static dyn MatchType,
    pub address_part: &'static dyn AddressPart,
}

/// One script run.
pub struct Interpreter<'a> {
    pub(crate) reader: Reader<'a>,
    dispatch: Dispatch,
    test_result: bool,
    pub(crate) result: SieveResult,
    pub(crate) msg: &'a MessageData<'a>,
    pub(crate) env: &'a ScriptEnv<'a>,
    pub(crate) message_ctx: &'a mut MessageContext,
    contexts: HashMap<&'static str, Box<dyn Any>>,
}

impl std::fmt::Debug for Interpreter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("pc", &self.reader.pos())
            .field("test_result", &self.test_result)
            .finish_non_exhaustive()
    }
}

impl<'a> Interpreter<'a> {
    /// Build an interpreter for `binary`.
    ///
    /// Resolves the binary's extension index against the registry and runs
    /// every referenced extension's `runtime_load` hook. A binary referencing
    /// an unknown extension is refused here, before any opcode runs.
    pub fn new(
        binary: &'a Binary,
        registry: &Registry,
        msg: &'a MessageData<'a>,
        env: &'a ScriptEnv<'a>,
        message_ctx: &'a mut MessageContext,
    ) -> Result<Self, RuntimeError> {
        let dispatch = Dispatch::resolve(binary, registry)?;

        let mut interp = Self {
            reader: Reader::new(binary.code()),
            dispatch,
            test_result: false,
            result: SieveResult::new(),
            msg,
            env,
            message_ctx,
            contexts: HashMap::new(),
        };

        for extension in interp.dispatch.extensions().to_vec() {
            extension.runtime_load(&mut interp);
        }

        Ok(interp)
    }

    /// Run to completion (end of code or `stop`).
    pub fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            if let Some(flag) = self.env.abort {
                if flag.load(Ordering::Relaxed) {
                    return Err(RuntimeError::Aborted);
                }
            }

            if self.reader.at_end() {
                return Ok(());
            }

            let pc = self.reader.pos();
            let op = self
                .dispatch
                .operation(&mut self.reader)
                .map_err(|source| RuntimeError::corrupt(pc, source))?;

            log::trace!("{pc:04x}: {}", op.name());

            match op.execute(self)? {
                Outcome::Continue => {}
                Outcome::Stop => return Ok(()),
            }
        }
    }

    pub fn into_result(self) -> SieveResult {
        self.result
    }

    // ----- state accessed by operations -----

    pub fn test_result(&self) -> bool {
        self.test_result
    }

    pub fn set_test_result(&mut self, value: bool) {
        self.test_result = value;
    }

    pub fn msg(&self) -> &MessageData<'a> {
        self.msg
    }

    pub fn env(&self) -> &ScriptEnv<'a> {
        self.env
    }

    pub fn result_mut(&mut self) -> &mut SieveResult {
        &mut self.result
    }

    pub fn message_context(&mut self) -> &mut MessageContext {
        self.message_ctx
    }

    /// Wrap a decoding failure with the current address.
    pub(crate) fn corrupt(&self, source: ReadError) -> RuntimeError {
        RuntimeError::corrupt(self.reader.pos(), source)
    }

    /// The extension's per-run state, created on first use.
    pub fn context_mut<T: Any + Default>(&mut self, extension: &'static str) -> &mut T {
        self.contexts
            .entry(extension)
            .and_modify(|slot| {
                if !slot.is::<T>() {
                    *slot = Box::<T>::default();
                }
            })
            .or_insert_with(|| Box::<T>::default())
            .downcast_mut()
            .expect("slot type was just ensured")
    }

    pub fn context_ref<T: Any>(&self, extension: &'static str) -> Option<&T> {
        self.contexts
            .get(extension)
            .and_then(|slot| slot.downcast_ref())
    }

    /// Side effects the loaded extensions attach to a delivery action.
    pub(crate) fn collect_side_effects(&self) -> Vec<Box<dyn SideEffect>> {
        self.dispatch
            .extensions()
            .iter()
            .flat_map(|extension| extension.side_effects(self))
            .collect()
    }

    /// Read a test's optional-operand block: comparator, match type, and
    /// (for address tests) address part, falling back to the defaults
    /// `i;ascii-casemap` + `:is` + `:all`.
    pub(crate) fn read_match_operands(
        &mut self,
        allow_address_part: bool,
    ) -> Result<SelectedMatch, RuntimeError> {
        let mut selected = SelectedMatch {
            comparator: matching::CORE_COMPARATORS
                [matching::COMPARATOR_CASEMAP_CODE as usize],
            match_type: matching::CORE_MATCH_TYPES[matching::MATCH_TYPE_IS_CODE as usize],
            address_part: matching::address::CORE_ADDRESS_PARTS[0],
        };

        loop {
            let at = self.reader.pos();
            let code = self.reader.read_u8().map_err(|e| self.corrupt(e))?;

            match code {
                0 => return Ok(selected),
                matching::OPT_COMPARATOR => {
                    let (owner, object) =
                        self.reader.read_object().map_err(|e| self.corrupt(e))?;
                    selected.comparator = self
                        .dispatch
                        .comparator(at, owner, object)
                        .map_err(|e| self.corrupt(e))?;
                }
                matching::OPT_MATCH_TYPE => {
                    let (owner, object) =
                        self.reader.read_object().map_err(|e| self.corrupt(e))?;
                    selected.match_type = self
                        .dispatch
                        .match_type(at, owner, object)
                        .map_err(|e| self.corrupt(e))?;
                }
                matching::OPT_ADDRESS_PART if allow_address_part => {
                    let (owner, object) =
                        self.reader.read_object().map_err(|e| self.corrupt(e))?;
                    selected.address_part = self
                        .dispatch
                        .address_part(at, owner, object)
                        .map_err(|e| self.corrupt(e))?;
                }
                code => {
                    return Err(RuntimeError::corrupt(
                        at,
                        ReadError::UnknownOptional { at, code },
                    ))
                }
            }
        }
    }

    /// Read an empty optional-operand block (the 0 terminator of operations
    /// that accept no optional operands).
    pub(crate) fn read_empty_operands(&mut self) -> Result<(), RuntimeError> {
        let at = self.reader.pos();
        let code = self.reader.read_u8().map_err(|e| self.corrupt(e))?;
        if code != 0 {
            return Err(RuntimeError::corrupt(
                at,
                ReadError::UnknownOptional { at, code },
            ));
        }
        Ok(())
    }
}
