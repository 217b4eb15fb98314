//! Code generation: validated AST to binary.
//!
//! Commands emit their opcode, their source line where the operation wants
//! one, the optional-operand block collected by the tag validators, a 0
//! terminator, and their positional operands. Control flow compiles to
//! forward jumps with fixed-width offset slots that are reserved when the
//! branch is emitted and back-patched when its target is reached.

use sieve_types::ast::Command as AstCommand;

use crate::{
    binary::Binary,
    command::{CommandCtx, OpcodeRef, OperandValue, OptOperand},
    core::opcode,
    error::GenerateError,
    validate::ValidatedScript,
};

/// A reserved jump offset awaiting resolution.
///
/// Deliberately neither `Copy` nor `Clone`: every reserved slot must be
/// resolved exactly once.
#[derive(Debug)]
#[must_use]
pub struct JumpSlot(usize);

/// The code generator.
#[derive(Debug)]
pub struct Generator {
    binary: Binary,
    contexts: Vec<Option<CommandCtx>>,
    jumps_reserved: usize,
    jumps_resolved: usize,
}

impl Generator {
    pub(crate) fn run(
        script: &sieve_types::ast::Script,
        validated: ValidatedScript,
    ) -> Result<Binary, GenerateError> {
        let mut generator = Self {
            binary: Binary::new(),
            contexts: validated.contexts,
            jumps_reserved: 0,
            jumps_resolved: 0,
        };

        generator.generate_block(&script.commands)?;

        if generator.jumps_reserved != generator.jumps_resolved {
            return Err(GenerateError::UnresolvedJump);
        }

        Ok(generator.binary)
    }

    /// Consume the validation context of `node`. Contexts are consumed in
    /// post-order; no context is used twice.
    fn take_ctx(&mut self, node: &AstCommand) -> Result<CommandCtx, GenerateError> {
        self.contexts
            .get_mut(node.id as usize)
            .and_then(Option::take)
            .ok_or(GenerateError::MissingContext(node.id))
    }

    pub fn generate_block(&mut self, commands: &[AstCommand]) -> Result<(), GenerateError> {
        let mut index = 0;

        while index < commands.len() {
            let command = &commands[index];

            if command.name == "if" {
                let mut end = index + 1;
                while end < commands.len() && commands[end].name == "elsif" {
                    end += 1;
                }
                if end < commands.len() && commands[end].name == "else" {
                    end += 1;
                }

                self.generate_if_chain(&commands[index..end])?;
                index = end;
            } else {
                self.generate_command(command)?;
                index += 1;
            }
        }

        Ok(())
    }

    pub fn generate_command(&mut self, node: &AstCommand) -> Result<(), GenerateError> {
        let ctx = self.take_ctx(node)?;
        ctx.def.generate(self, &ctx, node)
    }

    pub fn generate_test(&mut self, node: &AstCommand) -> Result<(), GenerateError> {
        self.generate_command(node)
    }

    /// An `if [elsif]* [else]?` chain.
    ///
    /// Each conditional branch compiles to its test followed by
    /// `JMPFALSE <next branch>`; taken branches jump past the chain.
    fn generate_if_chain(&mut self, chain: &[AstCommand]) -> Result<(), GenerateError> {
        let mut exit_jumps = Vec::new();

        for (position, command) in chain.iter().enumerate() {
            let _ctx = self.take_ctx(command)?;
            let last = position + 1 == chain.len();
            let block = command.block.as_deref().unwrap_or(&[]);

            if command.name == "else" {
                self.generate_block(block)?;
            } else {
                self.generate_test(&command.tests[0])?;
                let skip = self.reserve_jump(opcode::JMPFALSE);
                self.generate_block(block)?;
                if !last {
                    exit_jumps.push(self.reserve_jump(opcode::JMP));
                }
                self.resolve_jump(skip);
            }
        }

        for jump in exit_jumps {
            self.resolve_jump(jump);
        }

        Ok(())
    }

    // ----- emission -----

    /// The default command emission: opcode, source line where applicable,
    /// optional-operand block, positional operands.
    pub fn emit_command(&mut self, ctx: &CommandCtx) -> Result<(), GenerateError> {
        let opcode = ctx
            .def
            .opcode()
            .ok_or(GenerateError::MissingOpcode(ctx.def.name()))?;
        self.emit_opcode(opcode)?;

        if ctx.def.emits_source_line() {
            self.binary.emit_uint(u64::from(ctx.line));
        }

        self.emit_optional_operands(&ctx.opt_operands)?;

        for operand in &ctx.positional {
            self.emit_operand(operand)?;
        }

        Ok(())
    }

    pub fn emit_opcode(&mut self, opcode: OpcodeRef) -> Result<(), GenerateError> {
        match opcode {
            OpcodeRef::Core(code) => {
                debug_assert!(code < 0x80);
                self.binary.emit_u8(code);
            }
            OpcodeRef::Ext { ext, code } => {
                let index = self
                    .binary
                    .extension_index(ext)
                    .ok_or(GenerateError::TooManyExtensions(ext))?;
                self.binary.emit_u8(0x80 | index);
                self.binary.emit_u8(code);
            }
        }
        Ok(())
    }

    pub fn emit_operand(&mut self, operand: &OperandValue) -> Result<(), GenerateError> {
        match operand {
            OperandValue::Number(value) => self.binary.emit_uint(*value),
            OperandValue::String(value) => self.binary.emit_string(value),
            OperandValue::StringList(values) => self.binary.emit_string_list(values),
            OperandValue::Object { owner, code } => {
                let owner = match owner {
                    None => 0,
                    Some(name) => {
                        let index = self
                            .binary
                            .extension_index(name)
                            .ok_or(GenerateError::TooManyExtensions(name))?;
                        u32::from(index) + 1
                    }
                };
                self.binary.emit_object(owner, *code);
            }
            OperandValue::Flag => {}
        }
        Ok(())
    }

    pub fn emit_optional_operands(&mut self, operands: &[OptOperand]) -> Result<(), GenerateError> {
        for operand in operands {
            debug_assert_ne!(operand.code, 0);
            self.binary.emit_u8(operand.code);
            self.emit_operand(&operand.value)?;
        }
        self.binary.emit_u8(0);
        Ok(())
    }

    /// Emit a jump operation with a reserved offset slot.
    pub fn reserve_jump(&mut self, jump_opcode: u8) -> JumpSlot {
        self.binary.emit_u8(jump_opcode);
        self.jumps_reserved += 1;
        JumpSlot(self.binary.reserve_offset())
    }

    /// Point a reserved jump at the current end of code.
    pub fn resolve_jump(&mut self, slot: JumpSlot) {
        self.binary.patch_offset_to_here(slot.0);
        self.jumps_resolved += 1;
    }

    /// Direct access for command generators that emit bespoke operands.
    pub fn binary_mut(&mut self) -> &mut Binary {
        &mut self.binary
    }
}
