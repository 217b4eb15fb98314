//! Control commands: `require`, `if`/`elsif`/`else`, `stop`.
//!
//! The conditional commands have no operations of their own; the generator
//! compiles an if-chain into its tests and forward jumps. `require` is pure
//! validation state and emits nothing.

use sieve_types::ast::{ArgumentValue, Command as AstCommand};

use crate::{
    binary::Reader,
    command::{ArgumentCursor, BlockUsage, CommandCtx, CommandDef, CommandKind, SubtestArity},
    core::opcode,
    error::{GenerateError, RuntimeError},
    generate::Generator,
    interp::Interpreter,
    op::{dump_offset, Dispatch, Operation, Outcome},
    validate::Validator,
};

// ----- require -----

#[derive(Debug)]
pub struct RequireCmd;

pub static REQUIRE: RequireCmd = RequireCmd;

impl CommandDef for RequireCmd {
    fn name(&self) -> &'static str {
        "require"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        args: &mut ArgumentCursor,
        _node: &AstCommand,
    ) -> bool {
        let Some(arg) = args.next() else {
            validator.error(ctx.line, "require expects a capability list");
            return false;
        };

        let names = match &arg.value {
            ArgumentValue::String(name) => vec![name.clone()],
            ArgumentValue::StringList(names) => names.clone(),
            other => {
                validator.error(
                    arg.line,
                    &format!(
                        "require expects a string list, not {}",
                        other.type_name()
                    ),
                );
                return false;
            }
        };

        let mut ok = true;
        for name in &names {
            ok &= validator.require_extension(arg.line, name);
        }
        ok
    }

    fn generate(
        &self,
        _generator: &mut Generator,
        _ctx: &CommandCtx,
        _node: &AstCommand,
    ) -> Result<(), GenerateError> {
        Ok(())
    }
}

// ----- if / elsif / else -----

#[derive(Debug)]
pub struct IfCmd {
    name: &'static str,
    has_test: bool,
}

pub static IF: IfCmd = IfCmd {
    name: "if",
    has_test: true,
};
pub static ELSIF: IfCmd = IfCmd {
    name: "elsif",
    has_test: true,
};
pub static ELSE: IfCmd = IfCmd {
    name: "else",
    has_test: false,
};

impl CommandDef for IfCmd {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn subtest_arity(&self) -> SubtestArity {
        if self.has_test {
            SubtestArity::One
        } else {
            SubtestArity::None
        }
    }

    fn block_usage(&self) -> BlockUsage {
        BlockUsage::Required
    }

    fn generate(
        &self,
        _generator: &mut Generator,
        _ctx: &CommandCtx,
        _node: &AstCommand,
    ) -> Result<(), GenerateError> {
        // Chains are generated as a unit by the block generator; reaching a
        // branch on its own means the validator let a stray one through.
        Err(GenerateError::Internal("conditional outside an if chain"))
    }
}

// ----- stop -----

#[derive(Debug)]
pub struct StopCmd;

pub static STOP: StopCmd = StopCmd;

impl CommandDef for StopCmd {
    fn name(&self) -> &'static str {
        "stop"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn opcode(&self) -> Option<crate::command::OpcodeRef> {
        Some(crate::command::OpcodeRef::Core(opcode::STOP))
    }
}

#[derive(Debug)]
pub struct StopOp;

pub static STOP_OP: StopOp = StopOp;

impl Operation for StopOp {
    fn name(&self) -> &'static str {
        "STOP"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        interp.read_empty_operands()?;
        Ok(Outcome::Stop)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        _out: &mut String,
    ) -> Result<(), crate::binary::ReadError> {
        read_empty_block(reader)
    }
}

// ----- jumps -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JumpMode {
    Always,
    IfTrue,
    IfFalse,
}

#[derive(Debug)]
pub struct JumpOp {
    name: &'static str,
    mode: JumpMode,
}

pub static JMP_OP: JumpOp = JumpOp {
    name: "JMP",
    mode: JumpMode::Always,
};
pub static JMPTRUE_OP: JumpOp = JumpOp {
    name: "JMPTRUE",
    mode: JumpMode::IfTrue,
};
pub static JMPFALSE_OP: JumpOp = JumpOp {
    name: "JMPFALSE",
    mode: JumpMode::IfFalse,
};

impl Operation for JumpOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let offset = interp.reader.read_offset().map_err(|e| interp.corrupt(e))?;

        let taken = match self.mode {
            JumpMode::Always => true,
            JumpMode::IfTrue => interp.test_result(),
            JumpMode::IfFalse => !interp.test_result(),
        };

        if taken {
            interp.reader.jump(offset).map_err(|e| interp.corrupt(e))?;
        }

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), crate::binary::ReadError> {
        dump_offset(reader, out)
    }
}

/// Consume the 0 terminator of an empty optional-operand block.
pub(crate) fn read_empty_block(reader: &mut Reader) -> Result<(), crate::binary::ReadError> {
    let at = reader.pos();
    match reader.read_u8()? {
        0 => Ok(()),
        code => Err(crate::binary::ReadError::UnknownOptional { at, code }),
    }
}
