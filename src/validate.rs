//! Semantic validation of the AST.
//!
//! The validator resolves command names against the registered command
//! table, runs the tag loop (leading tagged arguments are detached and
//! handed to their tag validators, which may consume value arguments),
//! type-checks positional arguments, enforces subtest and block arity, and
//! processes `require`. Errors accumulate through the error handler up to a
//! configurable limit; validation succeeds iff none were reported.
//!
//! Validation does not mutate the AST. It produces one
//! [`CommandCtx`](crate::command::CommandCtx) per node in a side table, which
//! the generator consumes in post-order.

use std::collections::{HashMap, HashSet};

use sieve_types::ast::{ArgumentValue, Command as AstCommand, Script};

use crate::{
    command::{
        describe_argument, ArgType, ArgumentCursor, CommandCtx, CommandDef, CommandKind,
        CommandRegistration, OperandValue, SubtestArity, TagDef,
    },
    error::CompileError,
    matching::{self, MatchTypeDef},
    registry::Registry,
    runtime::ErrorHandler,
    CompileOptions,
};

/// Output of a successful validation run.
#[derive(Debug)]
pub struct ValidatedScript {
    pub(crate) contexts: Vec<Option<CommandCtx>>,
}

/// The semantic checker.
pub struct Validator<'a> {
    registry: &'a Registry,
    ehandler: &'a mut dyn ErrorHandler,
    max_errors: usize,
    error_count: usize,
    limit_reported: bool,

    commands: HashMap<&'static str, CommandRegistration>,
    comparators: Vec<(&'static str, OperandValue)>,
    match_types: Vec<&'static dyn MatchTypeDef>,
    address_parts: Vec<(&'static str, OperandValue)>,

    capabilities: HashSet<String>,
    contexts: Vec<Option<CommandCtx>>,
}

impl std::fmt::Debug for Validator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("errors", &self.error_count)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl<'a> Validator<'a> {
    pub(crate) fn new(
        registry: &'a Registry,
        options: &CompileOptions,
        ehandler: &'a mut dyn ErrorHandler,
    ) -> Self {
        let mut validator = Self {
            registry,
            ehandler,
            max_errors: options.max_errors,
            error_count: 0,
            limit_reported: false,
            commands: HashMap::new(),
            comparators: Vec::new(),
            match_types: Vec::new(),
            address_parts: Vec::new(),
            capabilities: HashSet::new(),
            contexts: Vec::new(),
        };

        for def in crate::core::COMMANDS {
            validator.register_command(*def);
        }

        validator.register_comparator(
            "i;octet",
            OperandValue::Object {
                owner: None,
                code: matching::COMPARATOR_OCTET_CODE,
            },
        );
        validator.register_comparator(
            "i;ascii-casemap",
            OperandValue::Object {
                owner: None,
                code: matching::COMPARATOR_CASEMAP_CODE,
            },
        );

        validator.register_match_type(&matching::IS_DEF);
        validator.register_match_type(&matching::CONTAINS_DEF);
        validator.register_match_type(&matching::MATCHES_DEF);

        for (code, part) in matching::address::CORE_ADDRESS_PARTS.iter().enumerate() {
            validator.register_address_part(
                part.name(),
                OperandValue::Object {
                    owner: None,
                    code: code as u64,
                },
            );
        }

        for name in registry.implicit() {
            if let Some(extension) = registry.lookup(name) {
                if validator.capabilities.insert(name.clone()) {
                    extension.validator_load(&mut validator);
                }
            } else if Registry::is_core_capability(name) {
                validator.capabilities.insert(name.clone());
            } else {
                validator
                    .ehandler
                    .warning(None, &format!("ignoring unknown implicit extension '{name}'"));
            }
        }

        validator
    }

    // ----- registration -----

    pub fn register_command(&mut self, def: &'static dyn CommandDef) {
        self.commands
            .insert(def.name(), CommandRegistration::new(def));
    }

    /// Attach a tag to an already-registered command, the way an extension
    /// extends another extension's (or the core's) commands.
    pub fn register_tag(&mut self, command: &str, tag: &'static dyn TagDef, opt_code: u8) {
        if let Some(registration) = self.commands.get_mut(command) {
            registration.register_tag(tag, opt_code);
        }
    }

    pub fn register_comparator(&mut self, name: &'static str, object: OperandValue) {
        self.comparators.push((name, object));
    }

    pub fn register_match_type(&mut self, def: &'static dyn MatchTypeDef) {
        self.match_types.push(def);
    }

    pub fn register_address_part(&mut self, name: &'static str, object: OperandValue) {
        self.address_parts.push((name, object));
    }

    pub fn comparator_object(&self, name: &str) -> Option<OperandValue> {
        self.comparators
            .iter()
            .find(|(have, _)| *have == name)
            .map(|(_, object)| object.clone())
    }

    pub fn match_type_def(&self, name: &str) -> Option<&'static dyn MatchTypeDef> {
        self.match_types
            .iter()
            .copied()
            .find(|def| def.name() == name)
    }

    pub fn address_part_object(&self, name: &str) -> Option<OperandValue> {
        self.address_parts
            .iter()
            .find(|(have, _)| *have == name)
            .map(|(_, object)| object.clone())
    }

    // ----- diagnostics -----

    pub fn error(&mut self, line: u32, message: &str) {
        if self.error_count >= self.max_errors {
            if !self.limit_reported {
                self.limit_reported = true;
                self.ehandler.error(None, "too many errors; giving up");
            }
            return;
        }
        self.error_count += 1;
        self.ehandler.error(Some(line), message);
    }

    pub fn warning(&mut self, line: u32, message: &str) {
        self.ehandler.warning(Some(line), message);
    }

    fn exhausted(&self) -> bool {
        self.error_count >= self.max_errors
    }

    // ----- capabilities -----

    /// Process one `require` name.
    pub fn require_extension(&mut self, line: u32, name: &str) -> bool {
        if self.capabilities.contains(name) {
            return true;
        }

        if let Some(extension) = self.registry.lookup(name) {
            self.capabilities.insert(name.to_owned());
            extension.validator_load(self);
            true
        } else if Registry::is_core_capability(name) {
            self.capabilities.insert(name.to_owned());
            true
        } else {
            self.error(line, &format!("unknown extension '{name}'"));
            false
        }
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains(name)
    }

    // ----- argument validation -----

    /// Normalize a string literal: decode `${hex: ...}` / `${unicode: ...}`
    /// sequences once the `encoded-character` capability is active.
    pub fn normalize_string(&self, value: &str) -> String {
        if self.has_capability("encoded-character") {
            decode_encoded_characters(value)
        } else {
            value.to_owned()
        }
    }

    pub fn validate_positionals(
        &mut self,
        ctx: &mut CommandCtx,
        args: &mut ArgumentCursor,
        specs: &[(&'static str, ArgType)],
    ) -> bool {
        let mut ok = true;
        for (param, ty) in specs {
            ok &= self.validate_positional_argument(ctx, args, param, *ty);
        }
        ok
    }

    pub fn validate_positional_argument(
        &mut self,
        ctx: &mut CommandCtx,
        args: &mut ArgumentCursor,
        param: &str,
        ty: ArgType,
    ) -> bool {
        let command = ctx.def.name();

        let Some(arg) = args.peek() else {
            self.error(
                ctx.line,
                &format!("the {command} command expects a {param} argument ({})", ty.name()),
            );
            return false;
        };

        let value = match (ty, &arg.value) {
            (ArgType::String, ArgumentValue::String(value)) => {
                OperandValue::String(self.normalize_string(value))
            }
            (ArgType::Number, ArgumentValue::Number(value)) => OperandValue::Number(*value),
            (ArgType::StringList, ArgumentValue::String(value)) => {
                OperandValue::StringList(vec![self.normalize_string(value)])
            }
            (ArgType::StringList, ArgumentValue::StringList(values)) => OperandValue::StringList(
                values.iter().map(|value| self.normalize_string(value)).collect(),
            ),
            (_, other) => {
                let line = arg.line;
                let found = describe_argument(other);
                self.error(
                    line,
                    &format!(
                        "the {param} argument of the {command} command must be a {}, not {found}",
                        ty.name()
                    ),
                );
                return false;
            }
        };

        args.next();
        ctx.positional.push(value);
        true
    }

    /// Consume one typed tag value argument.
    pub fn validate_tag_parameter(
        &mut self,
        args: &mut ArgumentCursor,
        identifier: &str,
        line: u32,
        ty: ArgType,
    ) -> Option<OperandValue> {
        let found = args.peek().map(|arg| &arg.value);

        let value = match (ty, found) {
            (ArgType::String, Some(ArgumentValue::String(value))) => {
                OperandValue::String(self.normalize_string(value))
            }
            (ArgType::Number, Some(ArgumentValue::Number(value))) => OperandValue::Number(*value),
            (ArgType::StringList, Some(ArgumentValue::String(value))) => {
                OperandValue::StringList(vec![self.normalize_string(value)])
            }
            (ArgType::StringList, Some(ArgumentValue::StringList(values))) => {
                OperandValue::StringList(
                    values.iter().map(|value| self.normalize_string(value)).collect(),
                )
            }
            _ => {
                self.error(
                    line,
                    &format!(":{identifier} tag requires a {} argument", ty.name()),
                );
                return None;
            }
        };

        args.next();
        Some(value)
    }

    // ----- the walk -----

    pub(crate) fn run(mut self, script: &Script) -> Result<ValidatedScript, CompileError> {
        self.contexts = Vec::new();
        self.contexts
            .resize_with(script.node_count as usize, || None);

        self.validate_block(&script.commands, true);

        if self.error_count == 0 {
            Ok(ValidatedScript {
                contexts: self.contexts,
            })
        } else {
            Err(CompileError::Invalid {
                errors: self.error_count,
            })
        }
    }

    fn validate_block(&mut self, commands: &[AstCommand], toplevel: bool) {
        let mut seen_non_require = false;
        let mut previous: Option<&str> = None;

        for command in commands {
            if self.exhausted() {
                return;
            }

            match command.name.as_str() {
                "elsif" | "else" if !matches!(previous, Some("if" | "elsif")) => {
                    self.error(
                        command.line,
                        &format!("{} without a matching if", command.name),
                    );
                }
                "require" if toplevel && seen_non_require => {
                    self.error(command.line, "require commands must come first in a script");
                }
                "require" if !toplevel => {
                    self.error(command.line, "require is only allowed at the top level");
                }
                name if name != "require" => seen_non_require = true,
                _ => {}
            }

            self.validate_command(command, CommandKind::Command);
            previous = Some(command.name.as_str());
        }
    }

    fn validate_command(&mut self, node: &AstCommand, expected: CommandKind) {
        let Some(registration) = self.commands.get(node.name.as_str()) else {
            let what = match expected {
                CommandKind::Command => "command",
                CommandKind::Test => "test",
            };
            self.error(node.line, &format!("unknown {what} '{}'", node.name));
            return;
        };
        let def = registration.def;
        let tags: Vec<_> = registration.tags.clone();

        if def.kind() != expected {
            let message = match expected {
                CommandKind::Command => format!("'{}' is a test, not a command", node.name),
                CommandKind::Test => format!("'{}' is a command, not a test", node.name),
            };
            self.error(node.line, &message);
            return;
        }

        if let Some(capability) = def.capability() {
            if !self.has_capability(capability) {
                self.error(
                    node.line,
                    &format!(
                        "the {} {} requires the \"{capability}\" capability",
                        node.name,
                        match expected {
                            CommandKind::Command => "command",
                            CommandKind::Test => "test",
                        }
                    ),
                );
            }
        }

        let mut ctx = CommandCtx::new(def, node.line);
        let mut cursor = ArgumentCursor::new(&node.arguments);

        // The tag loop: leading tagged arguments are dispatched to their tag
        // validators, which may consume the tag's value arguments.
        while let Some(arg) = cursor.peek() {
            let ArgumentValue::Tag(identifier) = &arg.value else {
                break;
            };
            let line = arg.line;

            match tags.iter().find(|entry| entry.tag.matches(identifier, self)) {
                Some(entry) => {
                    cursor.next();
                    entry
                        .tag
                        .validate(self, &mut ctx, identifier, line, &mut cursor, entry.opt_code);
                }
                None => {
                    self.error(line, &format!("unknown tag :{identifier} for '{}'", node.name));
                    cursor.next();
                }
            }

            if self.exhausted() {
                return;
            }
        }

        if def.validate(self, &mut ctx, &mut cursor, node) {
            if let Some(extra) = cursor.peek() {
                self.error(
                    extra.line,
                    &format!(
                        "too many arguments to the {} command ({} left over)",
                        node.name,
                        cursor.remaining()
                    ),
                );
            }
        }

        match def.subtest_arity() {
            SubtestArity::None if !node.tests.is_empty() => {
                self.error(node.line, &format!("'{}' takes no tests", node.name));
            }
            SubtestArity::One if node.tests.len() != 1 => {
                self.error(
                    node.line,
                    &format!("'{}' expects exactly one test", node.name),
                );
            }
            SubtestArity::AtLeastOne if node.tests.is_empty() => {
                self.error(
                    node.line,
                    &format!("'{}' expects at least one test", node.name),
                );
            }
            _ => {}
        }

        for test in &node.tests {
            self.validate_command(test, CommandKind::Test);
        }

        match (def.block_usage(), &node.block) {
            (crate::command::BlockUsage::Forbidden, Some(_)) => {
                self.error(node.line, &format!("'{}' takes no block", node.name));
            }
            (crate::command::BlockUsage::Required, None) => {
                self.error(node.line, &format!("'{}' requires a block", node.name));
            }
            _ => {}
        }

        if let Some(block) = &node.block {
            self.validate_block(block, false);
        }

        if let Some(slot) = self.contexts.get_mut(node.id as usize) {
            *slot = Some(ctx);
        }
    }
}

/// Decode `${hex: XX .. }` and `${unicode: XXXX .. }` sequences
/// ([RFC 5228](https://www.rfc-editor.org/rfc/rfc5228.html), section 2.4.2.4).
/// Sequences that do not decode are kept verbatim.
fn decode_encoded_characters(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];

        match decode_one(candidate) {
            Some((decoded, consumed)) => {
                out.push_str(&decoded);
                rest = &candidate[consumed..];
            }
            None => {
                out.push_str("${");
                rest = &candidate[2..];
            }
        }
    }

    out.push_str(rest);
    out
}

fn decode_one(candidate: &str) -> Option<(String, usize)> {
    let end = candidate.find('}')?;
    let inner = &candidate[2..end];
    let (kind, body) = inner.split_once(':')?;

    let mut decoded = String::new();
    match kind.trim().to_ascii_lowercase().as_str() {
        "hex" => {
            let mut bytes = Vec::new();
            for token in body.split_ascii_whitespace() {
                if token.len() != 2 {
                    return None;
                }
                bytes.push(u8::from_str_radix(token, 16).ok()?);
            }
            if bytes.is_empty() {
                return None;
            }
            decoded.push_str(&String::from_utf8(bytes).ok()?);
        }
        "unicode" => {
            for token in body.split_ascii_whitespace() {
                let point = u32::from_str_radix(token, 16).ok()?;
                decoded.push(char::from_u32(point)?);
            }
            if decoded.is_empty() {
                return None;
            }
        }
        _ => return None,
    }

    Some((decoded, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encoded_characters() {
        assert_eq!(decode_encoded_characters("${hex: 24 }"), "$");
        assert_eq!(decode_encoded_characters("${HEX: 40}"), "@");
        assert_eq!(decode_encoded_characters("${unicode:40}"), "@");
        assert_eq!(decode_encoded_characters("${unicode: 0041 0042}"), "AB");
        // Not decodable: kept verbatim.
        assert_eq!(decode_encoded_characters("${hex: 2g }"), "${hex: 2g }");
        assert_eq!(decode_encoded_characters("${hex:}"), "${hex:}");
        assert_eq!(decode_encoded_characters("plain $ {hex:24}"), "plain $ {hex:24}");
    }
}
