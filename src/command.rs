//! Command and tag descriptors.
//!
//! A [`CommandDef`] binds a command or test name to its argument typing and
//! its validation/generation hooks. Validation produces one [`CommandCtx`]
//! per AST node, held in a side table indexed by node id; the generator
//! consumes these contexts in post-order.

use std::any::Any;

use sieve_types::ast::{Argument, ArgumentValue, Command as AstCommand};

use crate::{error::GenerateError, generate::Generator, validate::Validator};

/// Whether a name denotes a command or a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    Command,
    Test,
}

/// How many subtests a command takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtestArity {
    None,
    One,
    AtLeastOne,
}

/// Whether a command takes a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockUsage {
    Forbidden,
    Optional,
    Required,
}

/// The type a positional argument or tag parameter must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Number,
    /// A single string is accepted and coerced to a one-element list.
    StringList,
}

impl ArgType {
    pub fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::StringList => "string list",
        }
    }
}

/// An opcode reference: a stable core code, or an extension-local code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeRef {
    Core(u8),
    Ext { ext: &'static str, code: u8 },
}

/// A value emitted as an operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperandValue {
    Number(u64),
    String(String),
    StringList(Vec<String>),
    /// A registered object; `owner` is the contributing extension, `None`
    /// for core objects.
    Object {
        owner: Option<&'static str>,
        code: u64,
    },
    /// A bare optional-operand code without a payload.
    Flag,
}

/// One `(code, operand)` pair of an optional-operand block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptOperand {
    pub code: u8,
    pub value: OperandValue,
}

/// Validation context of one command node.
pub struct CommandCtx {
    pub def: &'static dyn CommandDef,
    /// Source line of the command.
    pub line: u32,
    /// Tag-contributed optional operands, in tag order.
    pub opt_operands: Vec<OptOperand>,
    /// Activated positional arguments, normalized and type-checked.
    pub positional: Vec<OperandValue>,
    /// Free-form slot owned by the command's validator.
    pub data: Option<Box<dyn Any + Send>>,
}

impl std::fmt::Debug for CommandCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandCtx")
            .field("command", &self.def.name())
            .field("line", &self.line)
            .field("opt_operands", &self.opt_operands)
            .field("positional", &self.positional)
            .finish_non_exhaustive()
    }
}

impl CommandCtx {
    pub(crate) fn new(def: &'static dyn CommandDef, line: u32) -> Self {
        Self {
            def,
            line,
            opt_operands: Vec::new(),
            positional: Vec::new(),
            data: None,
        }
    }

    pub fn has_opt(&self, code: u8) -> bool {
        self.opt_operands.iter().any(|opt| opt.code == code)
    }

    pub fn push_opt(&mut self, code: u8, value: OperandValue) {
        self.opt_operands.push(OptOperand { code, value });
    }

    pub fn data_mut<T: Any + Send + Default>(&mut self) -> &mut T {
        if self.data.as_ref().map_or(true, |d| !d.is::<T>()) {
            self.data = Some(Box::<T>::default());
        }
        self.data
            .as_mut()
            .and_then(|d| d.downcast_mut())
            .expect("slot was just initialized")
    }

    pub fn data_ref<T: Any>(&self) -> Option<&T> {
        self.data.as_deref().and_then(|d| d.downcast_ref())
    }
}

/// Cursor over a command's argument list.
///
/// The validator's tag loop consumes leading tags through this cursor; tag
/// validators may consume the arguments following their tag (the tag's
/// value); whatever remains is positional.
#[derive(Debug)]
pub struct ArgumentCursor<'a> {
    args: &'a [Argument],
    pos: usize,
}

impl<'a> ArgumentCursor<'a> {
    pub fn new(args: &'a [Argument]) -> Self {
        Self { args, pos: 0 }
    }

    pub fn peek(&self) -> Option<&'a Argument> {
        self.args.get(self.pos)
    }

    pub fn next(&mut self) -> Option<&'a Argument> {
        let arg = self.args.get(self.pos)?;
        self.pos += 1;
        Some(arg)
    }

    pub fn remaining(&self) -> usize {
        self.args.len() - self.pos
    }
}

/// Descriptor of a command or test.
pub trait CommandDef: Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> CommandKind;

    /// Positional parameters, validated in order by the default
    /// [`CommandDef::validate`].
    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[]
    }

    fn subtest_arity(&self) -> SubtestArity {
        SubtestArity::None
    }

    fn block_usage(&self) -> BlockUsage {
        BlockUsage::Forbidden
    }

    /// Core capability that must be required before the command may be used.
    fn capability(&self) -> Option<&'static str> {
        None
    }

    /// The operation the default generator emits.
    fn opcode(&self) -> Option<OpcodeRef> {
        None
    }

    /// Whether the operation carries its source line, as delivery actions do.
    fn emits_source_line(&self) -> bool {
        false
    }

    /// Called once when the command is registered with a validator.
    /// Registers the command's tags.
    fn registered(&self, registration: &mut CommandRegistration) {
        let _ = registration;
    }

    /// Validate and activate positional arguments.
    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        args: &mut ArgumentCursor,
        node: &AstCommand,
    ) -> bool {
        let _ = node;
        validator.validate_positionals(ctx, args, self.positionals())
    }

    /// Emit the command into the binary.
    fn generate(
        &self,
        generator: &mut Generator,
        ctx: &CommandCtx,
        node: &AstCommand,
    ) -> Result<(), GenerateError> {
        let _ = node;
        generator.emit_command(ctx)
    }
}

impl std::fmt::Debug for dyn CommandDef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "CommandDef({})", self.name())
    }
}

/// A command together with the tags registered for it.
#[derive(Debug)]
pub struct CommandRegistration {
    pub(crate) def: &'static dyn CommandDef,
    pub(crate) tags: Vec<TagEntry>,
}

#[derive(Clone, Copy)]
pub struct TagEntry {
    pub tag: &'static dyn TagDef,
    pub opt_code: u8,
}

impl std::fmt::Debug for TagEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "TagEntry(:{}, {})", self.tag.identifier(), self.opt_code)
    }
}

impl CommandRegistration {
    pub(crate) fn new(def: &'static dyn CommandDef) -> Self {
        let mut registration = Self {
            def,
            tags: Vec::new(),
        };
        def.registered(&mut registration);
        registration
    }

    pub fn register_tag(&mut self, tag: &'static dyn TagDef, opt_code: u8) {
        self.tags.push(TagEntry { tag, opt_code });
    }

    /// Accept `:is`, `:contains`, `:matches`, and any extension match types.
    pub fn link_match_type_tags(&mut self, opt_code: u8) {
        self.register_tag(&crate::matching::MATCH_TYPE_TAG, opt_code);
    }

    /// Accept `:comparator <name>`.
    pub fn link_comparator_tag(&mut self, opt_code: u8) {
        self.register_tag(&crate::matching::COMPARATOR_TAG, opt_code);
    }

    /// Accept `:all`, `:localpart`, `:domain`, and any extension parts.
    pub fn link_address_part_tags(&mut self, opt_code: u8) {
        self.register_tag(&crate::matching::ADDRESS_PART_TAG, opt_code);
    }
}

/// Descriptor of a tagged argument.
pub trait TagDef: Sync {
    /// The identifier without the leading `:`.
    fn identifier(&self) -> &'static str;

    /// Whether the tag accepts `identifier`. Tags backed by an object
    /// registry (match types, address parts) accept a family of identifiers.
    fn matches(&self, identifier: &str, validator: &Validator) -> bool {
        let _ = validator;
        identifier == self.identifier()
    }

    /// Validate the tag, consume its value arguments, and push its optional
    /// operands onto the context.
    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        identifier: &str,
        line: u32,
        args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool;
}

impl std::fmt::Debug for dyn TagDef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "TagDef(:{})", self.identifier())
    }
}

/// A tag taking one typed value (or none), emitted as one optional operand.
#[derive(Debug)]
pub struct ValueTag {
    pub identifier: &'static str,
    /// `None` for a bare tag without a value.
    pub ty: Option<ArgType>,
}

impl TagDef for ValueTag {
    fn identifier(&self) -> &'static str {
        self.identifier
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        identifier: &str,
        line: u32,
        args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool {
        if ctx.has_opt(opt_code) {
            validator.error(line, &format!("duplicate :{identifier} tag"));
            return false;
        }

        let value = match self.ty {
            None => OperandValue::Flag,
            Some(ty) => match validator.validate_tag_parameter(args, identifier, line, ty) {
                Some(value) => value,
                None => return false,
            },
        };

        ctx.push_opt(opt_code, value);
        true
    }
}

/// Render an argument value for diagnostics.
pub(crate) fn describe_argument(value: &ArgumentValue) -> String {
    match value {
        ArgumentValue::Tag(name) => format!(":{name}"),
        other => other.type_name().to_owned(),
    }
}
