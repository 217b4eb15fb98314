//! The `imap4flags` extension ([RFC 5232](https://www.rfc-editor.org/rfc/rfc5232.html)).
//!
//! `setflag`/`addflag`/`removeflag` edit an internal flag set kept for the
//! duration of one run; `hasflag` tests it. Delivery actions pick the set up
//! as a side effect, unless an explicit `:flags` tag overrides it.

use std::any::Any;

use sieve_types::{
    ast::Command as AstCommand,
    flag::{parse_flag_list, Flag},
};

use crate::{
    binary::{ReadError, Reader},
    command::{
        ArgType, ArgumentCursor, CommandCtx, CommandDef, CommandKind, CommandRegistration,
        OpcodeRef, OperandValue, TagDef,
    },
    core::control::read_empty_block,
    error::RuntimeError,
    interp::Interpreter,
    matching::{self, MatchContext},
    op::{dump_match_operands, dump_string_list, Dispatch, Operation, Outcome},
    registry::Extension,
    result::SideEffect,
    validate::Validator,
};

pub const NAME: &str = "imap4flags";

/// Optional-operand code of the `:flags` list on delivery actions.
pub const OPT_FLAGS: u8 = 4;

/// The per-run internal flag set.
#[derive(Debug, Default)]
pub struct FlagsContext {
    flags: Vec<Flag>,
}

impl FlagsContext {
    fn set(&mut self, flags: Vec<Flag>) {
        self.flags.clear();
        for flag in flags {
            self.add(flag);
        }
    }

    fn add(&mut self, flag: Flag) {
        if !self.flags.iter().any(|have| have.eq_ignore_case(&flag)) {
            self.flags.push(flag);
        }
    }

    fn remove(&mut self, flag: &Flag) {
        self.flags.retain(|have| !have.eq_ignore_case(flag));
    }

    pub fn flags(&self) -> &[Flag] {
        &self.flags
    }
}

/// IMAP flags attached to a delivery action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagsEffect {
    pub flags: Vec<Flag>,
}

impl SideEffect for FlagsEffect {
    fn name(&self) -> &'static str {
        "flags"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Parse a runtime flag list, dropping entries that do not parse.
pub(crate) fn effects_from_list(lists: &[String]) -> Vec<Box<dyn SideEffect>> {
    let mut flags: Vec<Flag> = Vec::new();
    for list in lists {
        match parse_flag_list(list) {
            Ok(parsed) => {
                for flag in parsed {
                    if !flags.iter().any(|have| have.eq_ignore_case(&flag)) {
                        flags.push(flag);
                    }
                }
            }
            Err(error) => log::warn!("ignoring invalid flag list '{list}': {error}"),
        }
    }

    if flags.is_empty() {
        Vec::new()
    } else {
        vec![Box::new(FlagsEffect { flags })]
    }
}

// ----- the :flags tag -----

#[derive(Debug)]
struct FlagsTag;

static FLAGS_TAG: FlagsTag = FlagsTag;

impl TagDef for FlagsTag {
    fn identifier(&self) -> &'static str {
        "flags"
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
            validator.error(line, "duplicate :flags tag");
            return false;
        }

        let Some(value) =
            validator.validate_tag_parameter(args, identifier, line, ArgType::StringList)
        else {
            return false;
        };

        if let OperandValue::StringList(lists) = &value {
            for list in lists {
                if let Err(error) = parse_flag_list(list) {
                    validator.error(line, &format!("invalid flag list '{list}': {error}"));
                    return false;
                }
            }
        }

        ctx.push_opt(opt_code, value);
        true
    }
}

// ----- flag edit commands -----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagEdit {
    Set,
    Add,
    Remove,
}

#[derive(Debug)]
pub struct FlagEditCmd {
    name: &'static str,
    code: u8,
}

pub static SETFLAG: FlagEditCmd = FlagEditCmd {
    name: "setflag",
    code: 0,
};
pub static ADDFLAG: FlagEditCmd = FlagEditCmd {
    name: "addflag",
    code: 1,
};
pub static REMOVEFLAG: FlagEditCmd = FlagEditCmd {
    name: "removeflag",
    code: 2,
};

impl CommandDef for FlagEditCmd {
    fn name(&self) -> &'static str {
        self.name
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[("list-of-flags", ArgType::StringList)]
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Ext {
            ext: NAME,
            code: self.code,
        })
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        args: &mut ArgumentCursor,
        node: &AstCommand,
    ) -> bool {
        if !validator.validate_positionals(ctx, args, self.positionals()) {
            return false;
        }

        if let Some(OperandValue::StringList(lists)) = ctx.positional.first() {
            for list in lists {
                if let Err(error) = parse_flag_list(list) {
                    validator.error(node.line, &format!("invalid flag list '{list}': {error}"));
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct FlagEditOp {
    name: &'static str,
    edit: FlagEdit,
}

pub static SETFLAG_OP: FlagEditOp = FlagEditOp {
    name: "SETFLAG",
    edit: FlagEdit::Set,
};
pub static ADDFLAG_OP: FlagEditOp = FlagEditOp {
    name: "ADDFLAG",
    edit: FlagEdit::Add,
};
pub static REMOVEFLAG_OP: FlagEditOp = FlagEditOp {
    name: "REMOVEFLAG",
    edit: FlagEdit::Remove,
};

impl Operation for FlagEditOp {
    fn name(&self) -> &'static str {
        self.name
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        interp.read_empty_operands()?;
        let lists = interp
            .reader
            .read_string_list()
            .map_err(|e| interp.corrupt(e))?;

        let mut flags = Vec::new();
        for list in &lists {
            match parse_flag_list(list) {
                Ok(parsed) => flags.extend(parsed),
                Err(error) => log::warn!("ignoring invalid flag list '{list}': {error}"),
            }
        }

        let context = interp.context_mut::<FlagsContext>(NAME);
        match self.edit {
            FlagEdit::Set => context.set(flags),
            FlagEdit::Add => {
                for flag in flags {
                    context.add(flag);
                }
            }
            FlagEdit::Remove => {
                for flag in &flags {
                    context.remove(flag);
                }
            }
        }

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        read_empty_block(reader)?;
        dump_string_list(reader, out)
    }
}

// ----- hasflag -----

#[derive(Debug)]
pub struct HasflagTest;

pub static HASFLAG: HasflagTest = HasflagTest;

impl CommandDef for HasflagTest {
    fn name(&self) -> &'static str {
        "hasflag"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Test
    }

    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[("list-of-flags", ArgType::StringList)]
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Ext { ext: NAME, code: 3 })
    }

    fn registered(&self, registration: &mut CommandRegistration) {
        registration.link_comparator_tag(matching::OPT_COMPARATOR);
        registration.link_match_type_tags(matching::OPT_MATCH_TYPE);
    }
}

#[derive(Debug)]
pub struct HasflagOp;

pub static HASFLAG_OP: HasflagOp = HasflagOp;

impl Operation for HasflagOp {
    fn name(&self) -> &'static str {
        "HASFLAG"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let selected = interp.read_match_operands(false)?;
        let keys = interp
            .reader
            .read_string_list()
            .map_err(|e| interp.corrupt(e))?;

        let flags: Vec<String> = interp
            .context_ref::<FlagsContext>(NAME)
            .map(|context| context.flags().iter().map(Flag::to_string).collect())
            .unwrap_or_default();

        let mut ctx = MatchContext::new(selected.comparator, selected.match_type, &keys);
        for flag in &flags {
            if ctx.matches(flag) {
                break;
            }
        }
        interp.set_test_result(ctx.finish());

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        dump_match_operands(reader, dispatch, out)?;
        dump_string_list(reader, out)
    }
}

// ----- the extension -----

#[derive(Debug)]
pub struct Imap4Flags;

pub static IMAP4FLAGS: Imap4Flags = Imap4Flags;

static OPERATIONS: [&dyn Operation; 4] = [&SETFLAG_OP, &ADDFLAG_OP, &REMOVEFLAG_OP, &HASFLAG_OP];

impl Extension for Imap4Flags {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validator_load(&'static self, validator: &mut Validator) {
        validator.register_command(&SETFLAG);
        validator.register_command(&ADDFLAG);
        validator.register_command(&REMOVEFLAG);
        validator.register_command(&HASFLAG);

        validator.register_tag("keep", &FLAGS_TAG, OPT_FLAGS);
        validator.register_tag("fileinto", &FLAGS_TAG, OPT_FLAGS);
    }

    fn runtime_load(&'static self, interp: &mut Interpreter) {
        interp.context_mut::<FlagsContext>(NAME);
    }

    fn operations(&self) -> &'static [&'static dyn Operation] {
        &OPERATIONS
    }

    fn side_effects(&self, interp: &Interpreter) -> Vec<Box<dyn SideEffect>> {
        match interp.context_ref::<FlagsContext>(NAME) {
            Some(context) if !context.flags.is_empty() => vec![Box::new(FlagsEffect {
                flags: context.flags.clone(),
            })],
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_set_semantics() {
        let mut context = FlagsContext::default();
        context.set(vec![Flag::Seen, Flag::Keyword("$Junk".into())]);
        context.add(Flag::Seen);
        assert_eq!(context.flags().len(), 2);

        context.add(Flag::Answered);
        context.remove(&Flag::Keyword("$junk".into()));
        assert_eq!(context.flags(), &[Flag::Seen, Flag::Answered]);
    }

    #[test]
    fn test_effects_from_list() {
        let effects = effects_from_list(&["\\Seen $Junk".to_owned(), "\\seen".to_owned()]);
        assert_eq!(effects.len(), 1);
        let flags = effects[0]
            .as_any()
            .downcast_ref::<FlagsEffect>()
            .unwrap();
        assert_eq!(flags.flags.len(), 2);

        assert!(effects_from_list(&[]).is_empty());
    }
}
