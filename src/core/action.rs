//! Delivery actions: `keep`, `discard`, `fileinto`, `redirect`.
//!
//! The operations enqueue actions; the externally visible work happens at
//! commit time. Mail storage and forwarding are the host's business: the
//! engine resolves the final mailbox (inbox, namespace prefix) and hands the
//! committed entries back through the result.

use sieve_types::ast::Command as AstCommand;

use crate::{
    binary::{ReadError, Reader},
    command::{
        ArgType, ArgumentCursor, CommandCtx, CommandDef, CommandKind, OpcodeRef, OperandValue,
    },
    core::opcode,
    error::RuntimeError,
    extensions::imap4flags,
    interp::Interpreter,
    matching::address,
    op::{dump_string, dump_string_list, dump_uint, Dispatch, Operation, Outcome},
    result::{ActionDef, ActionEntry, ActionFlags, CommitCx, DuplicateVerdict, SideEffect},
    validate::Validator,
};

/// Read the source line and the optional-operand block of a delivery
/// operation. The only optional operand is the `:flags` list contributed by
/// `imap4flags`.
fn read_action_preamble(
    interp: &mut Interpreter,
    with_flags: bool,
) -> Result<(u32, Option<Vec<String>>), RuntimeError> {
    let line = interp.reader.read_uint().map_err(|e| interp.corrupt(e))? as u32;

    let mut flags = None;
    loop {
        let at = interp.reader.pos();
        let code = interp.reader.read_u8().map_err(|e| interp.corrupt(e))?;
        match code {
            0 => return Ok((line, flags)),
            imap4flags::OPT_FLAGS if with_flags => {
                let list = interp
                    .reader
                    .read_string_list()
                    .map_err(|e| interp.corrupt(e))?;
                flags = Some(list);
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

/// Side effects for a delivery action: an explicit `:flags` list wins over
/// whatever the loaded extensions contribute.
fn delivery_side_effects(
    interp: &Interpreter,
    explicit_flags: Option<Vec<String>>,
) -> Vec<Box<dyn SideEffect>> {
    match explicit_flags {
        Some(list) => imap4flags::effects_from_list(&list),
        None => interp.collect_side_effects(),
    }
}

fn dump_action_preamble(reader: &mut Reader, out: &mut String) -> Result<(), ReadError> {
    out.push_str(" (line");
    dump_uint(reader, out)?;
    out.push(')');

    loop {
        let at = reader.pos();
        let code = reader.read_u8()?;
        match code {
            0 => return Ok(()),
            imap4flags::OPT_FLAGS => {
                out.push_str(" :flags");
                dump_string_list(reader, out)?;
            }
            code => return Err(ReadError::UnknownOptional { at, code }),
        }
    }
}

// ----- keep -----

#[derive(Debug)]
pub struct KeepCmd;

pub static KEEP: KeepCmd = KeepCmd;

impl CommandDef for KeepCmd {
    fn name(&self) -> &'static str {
        "keep"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Core(opcode::KEEP))
    }

    fn emits_source_line(&self) -> bool {
        true
    }
}

/// Context of a planned keep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeepContext {
    /// Resolved at commit time.
    pub mailbox: Option<String>,
}

#[derive(Debug)]
pub struct KeepAction;

pub static KEEP_ACTION: KeepAction = KeepAction;

impl ActionDef for KeepAction {
    fn name(&self) -> &'static str {
        "keep"
    }

    fn flags(&self) -> ActionFlags {
        ActionFlags {
            cancels_keep: true,
            sends_response: false,
        }
    }

    fn check_duplicate(&self, _new: &ActionEntry, _old: &ActionEntry) -> DuplicateVerdict {
        DuplicateVerdict::Coalesce
    }

    fn execute(&self, cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), crate::result::ActionError> {
        let mailbox = cx.env.inbox().to_owned();
        log::debug!("keep: delivering to '{mailbox}'");
        if let Some(context) = entry.context_mut::<KeepContext>() {
            context.mailbox = Some(mailbox);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct KeepOp;

pub static KEEP_OP: KeepOp = KeepOp;

impl Operation for KeepOp {
    fn name(&self) -> &'static str {
        "KEEP"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let (line, flags) = read_action_preamble(interp, true)?;
        let side_effects = delivery_side_effects(interp, flags);

        interp.result_mut().add_action(
            &KEEP_ACTION,
            line,
            Box::new(KeepContext::default()),
            side_effects,
        )?;

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        dump_action_preamble(reader, out)
    }
}

// ----- discard -----

#[derive(Debug)]
pub struct DiscardCmd;

pub static DISCARD: DiscardCmd = DiscardCmd;

impl CommandDef for DiscardCmd {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Core(opcode::DISCARD))
    }

    fn emits_source_line(&self) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DiscardContext;

#[derive(Debug)]
pub struct DiscardAction;

pub static DISCARD_ACTION: DiscardAction = DiscardAction;

impl ActionDef for DiscardAction {
    fn name(&self) -> &'static str {
        "discard"
    }

    fn flags(&self) -> ActionFlags {
        ActionFlags {
            cancels_keep: true,
            sends_response: false,
        }
    }

    fn check_duplicate(&self, _new: &ActionEntry, _old: &ActionEntry) -> DuplicateVerdict {
        DuplicateVerdict::Coalesce
    }

    fn execute(&self, _cx: &mut CommitCx, _entry: &mut ActionEntry) -> Result<(), crate::result::ActionError> {
        log::debug!("discard: message is not delivered");
        Ok(())
    }
}

#[derive(Debug)]
pub struct DiscardOp;

pub static DISCARD_OP: DiscardOp = DiscardOp;

impl Operation for DiscardOp {
    fn name(&self) -> &'static str {
        "DISCARD"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let (line, _) = read_action_preamble(interp, false)?;

        interp
            .result_mut()
            .add_action(&DISCARD_ACTION, line, Box::new(DiscardContext), Vec::new())?;

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        dump_action_preamble(reader, out)
    }
}

// ----- fileinto -----

#[derive(Debug)]
pub struct FileintoCmd;

pub static FILEINTO: FileintoCmd = FileintoCmd;

impl CommandDef for FileintoCmd {
    fn name(&self) -> &'static str {
        "fileinto"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn capability(&self) -> Option<&'static str> {
        Some("fileinto")
    }

    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[("mailbox", ArgType::String)]
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Core(opcode::FILEINTO))
    }

    fn emits_source_line(&self) -> bool {
        true
    }
}

/// Context of a planned fileinto.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileIntoContext {
    /// Mailbox as written in the script.
    pub mailbox: String,
    /// Mailbox with the environment's namespace applied; set at commit time.
    pub resolved: Option<String>,
}

#[derive(Debug)]
pub struct FileIntoAction;

pub static FILEINTO_ACTION: FileIntoAction = FileIntoAction;

impl ActionDef for FileIntoAction {
    fn name(&self) -> &'static str {
        "fileinto"
    }

    fn flags(&self) -> ActionFlags {
        ActionFlags {
            cancels_keep: true,
            sends_response: false,
        }
    }

    fn check_duplicate(&self, new: &ActionEntry, old: &ActionEntry) -> DuplicateVerdict {
        let same = matches!(
            (
                new.context::<FileIntoContext>(),
                old.context::<FileIntoContext>(),
            ),
            (Some(new), Some(old)) if new.mailbox == old.mailbox
        );
        if same {
            DuplicateVerdict::Coalesce
        } else {
            DuplicateVerdict::Distinct
        }
    }

    fn execute(&self, cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), crate::result::ActionError> {
        let namespace = cx.env.namespace.clone().unwrap_or_default();
        if let Some(context) = entry.context_mut::<FileIntoContext>() {
            let resolved = format!("{namespace}{}", context.mailbox);
            log::debug!("fileinto: delivering to '{resolved}'");
            context.resolved = Some(resolved);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FileintoOp;

pub static FILEINTO_OP: FileintoOp = FileintoOp;

impl Operation for FileintoOp {
    fn name(&self) -> &'static str {
        "FILEINTO"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let (line, flags) = read_action_preamble(interp, true)?;
        let mailbox = interp.reader.read_string().map_err(|e| interp.corrupt(e))?;
        let side_effects = delivery_side_effects(interp, flags);

        interp.result_mut().add_action(
            &FILEINTO_ACTION,
            line,
            Box::new(FileIntoContext {
                mailbox,
                resolved: None,
            }),
            side_effects,
        )?;

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        dump_action_preamble(reader, out)?;
        dump_string(reader, out)
    }
}

// ----- redirect -----

#[derive(Debug)]
pub struct RedirectCmd;

pub static REDIRECT: RedirectCmd = RedirectCmd;

impl CommandDef for RedirectCmd {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[("address", ArgType::String)]
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Core(opcode::REDIRECT))
    }

    fn emits_source_line(&self) -> bool {
        true
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

        // The address is always a literal; check it now.
        if let Some(OperandValue::String(value)) = ctx.positional.first() {
            let valid = address::parse_single(value)
                .map_or(false, |parsed| !parsed.domain.is_empty());
            if !valid {
                validator.error(node.line, &format!("invalid redirect address '{value}'"));
                return false;
            }
        }

        true
    }
}

/// Context of a planned redirect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectContext {
    pub address: String,
}

#[derive(Debug)]
pub struct RedirectAction;

pub static REDIRECT_ACTION: RedirectAction = RedirectAction;

impl ActionDef for RedirectAction {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn flags(&self) -> ActionFlags {
        ActionFlags {
            cancels_keep: true,
            sends_response: false,
        }
    }

    fn check_duplicate(&self, new: &ActionEntry, old: &ActionEntry) -> DuplicateVerdict {
        let same = matches!(
            (
                new.context::<RedirectContext>(),
                old.context::<RedirectContext>(),
            ),
            (Some(new), Some(old)) if new.address.eq_ignore_ascii_case(&old.address)
        );
        if same {
            DuplicateVerdict::Coalesce
        } else {
            DuplicateVerdict::Distinct
        }
    }

    fn execute(&self, _cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), crate::result::ActionError> {
        if let Some(context) = entry.context::<RedirectContext>() {
            log::debug!("redirect: forwarding to <{}>", context.address);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct RedirectOp;

pub static REDIRECT_OP: RedirectOp = RedirectOp;

impl Operation for RedirectOp {
    fn name(&self) -> &'static str {
        "REDIRECT"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let (line, _) = read_action_preamble(interp, false)?;
        let address = interp.reader.read_string().map_err(|e| interp.corrupt(e))?;

        if address::parse_single(&address).map_or(true, |parsed| parsed.domain.is_empty()) {
            return Err(RuntimeError::Script {
                line,
                message: format!("invalid redirect address '{address}'"),
            });
        }

        interp.result_mut().add_action(
            &REDIRECT_ACTION,
            line,
            Box::new(RedirectContext { address }),
            Vec::new(),
        )?;

        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        dump_action_preamble(reader, out)?;
        dump_string(reader, out)
    }
}
