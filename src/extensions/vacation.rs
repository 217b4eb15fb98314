//! The `vacation` extension ([RFC 5230](https://www.rfc-editor.org/rfc/rfc5230.html)).
//!
//! A vacation action composes an automated reply and submits it over the
//! environment's SMTP transport. Replies are suppressed for mailing-list
//! and auto-generated mail, for messages not addressed to the user, and for
//! senders that received a reply within the last `:days` days (tracked
//! through the environment's duplicate store).

use std::io::Write as _;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use crate::{
    binary::{ReadError, Reader},
    command::{
        ArgType, ArgumentCursor, CommandCtx, CommandDef, CommandKind, CommandRegistration,
        OpcodeRef, OperandValue, TagDef, ValueTag,
    },
    error::RuntimeError,
    interp::Interpreter,
    matching::address,
    op::{dump_string, dump_string_list, dump_uint, Dispatch, Operation, Outcome},
    registry::Extension,
    result::{ActionDef, ActionEntry, ActionError, ActionFlags, CommitCx},
    validate::Validator,
};

pub const NAME: &str = "vacation";

const OPT_DAYS: u8 = 1;
const OPT_SUBJECT: u8 = 2;
const OPT_FROM: u8 = 3;
const OPT_ADDRESSES: u8 = 4;
const OPT_HANDLE: u8 = 5;
const OPT_MIME: u8 = 6;

/// Reply period applied without `:days`.
const DEFAULT_DAYS: u64 = 7;

// ----- tags -----

/// `:days` clamps 0 to 1: one reply per period is the smallest supported
/// rate (RFC 5230 reads 0 as "reply once per script execution").
#[derive(Debug)]
struct DaysTag;

static DAYS_TAG: DaysTag = DaysTag;

impl TagDef for DaysTag {
    fn identifier(&self) -> &'static str {
        "days"
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
            validator.error(line, "duplicate :days tag");
            return false;
        }

        let Some(OperandValue::Number(days)) =
            validator.validate_tag_parameter(args, identifier, line, ArgType::Number)
        else {
            return false;
        };

        let days = if days == 0 {
            validator.warning(
                line,
                ":days 0 is interpreted as 1; replying once per script run is not supported",
            );
            1
        } else {
            days
        };

        ctx.push_opt(opt_code, OperandValue::Number(days));
        true
    }
}

static SUBJECT_TAG: ValueTag = ValueTag {
    identifier: "subject",
    ty: Some(ArgType::String),
};
static FROM_TAG: ValueTag = ValueTag {
    identifier: "from",
    ty: Some(ArgType::String),
};
static ADDRESSES_TAG: ValueTag = ValueTag {
    identifier: "addresses",
    ty: Some(ArgType::StringList),
};
static HANDLE_TAG: ValueTag = ValueTag {
    identifier: "handle",
    ty: Some(ArgType::String),
};
static MIME_TAG: ValueTag = ValueTag {
    identifier: "mime",
    ty: None,
};

// ----- the command -----

#[derive(Debug)]
pub struct VacationCmd;

pub static VACATION_CMD: VacationCmd = VacationCmd;

impl CommandDef for VacationCmd {
    fn name(&self) -> &'static str {
        "vacation"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Command
    }

    fn positionals(&self) -> &'static [(&'static str, ArgType)] {
        &[("reason", ArgType::String)]
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Ext { ext: NAME, code: 0 })
    }

    fn emits_source_line(&self) -> bool {
        true
    }

    fn registered(&self, registration: &mut CommandRegistration) {
        registration.register_tag(&DAYS_TAG, OPT_DAYS);
        registration.register_tag(&SUBJECT_TAG, OPT_SUBJECT);
        registration.register_tag(&FROM_TAG, OPT_FROM);
        registration.register_tag(&ADDRESSES_TAG, OPT_ADDRESSES);
        registration.register_tag(&HANDLE_TAG, OPT_HANDLE);
        registration.register_tag(&MIME_TAG, OPT_MIME);
    }
}

/// Context of a planned vacation reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacationContext {
    pub sender: String,
    pub reason: String,
    pub subject: Option<String>,
    pub from: Option<String>,
    pub handle: Option<String>,
    pub days: u64,
    pub mime: bool,
    /// Duplicate-store id of this reply.
    pub id: Vec<u8>,
}

// ----- the operation -----

#[derive(Debug)]
pub struct VacationOp;

pub static VACATION_OP: VacationOp = VacationOp;

impl Operation for VacationOp {
    fn name(&self) -> &'static str {
        "VACATION"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let line = interp.reader.read_uint().map_err(|e| interp.corrupt(e))? as u32;

        let mut days = DEFAULT_DAYS;
        let mut subject = None;
        let mut from = None;
        let mut addresses = Vec::new();
        let mut handle = None;
        let mut mime = false;

        loop {
            let at = interp.reader.pos();
            let code = interp.reader.read_u8().map_err(|e| interp.corrupt(e))?;
            match code {
                0 => break,
                OPT_DAYS => {
                    days = interp
                        .reader
                        .read_uint()
                        .map_err(|e| interp.corrupt(e))?
                        .max(1);
                }
                OPT_SUBJECT => {
                    subject = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_FROM => {
                    from = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_ADDRESSES => {
                    addresses = interp
                        .reader
                        .read_string_list()
                        .map_err(|e| interp.corrupt(e))?;
                }
                OPT_HANDLE => {
                    handle = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_MIME => mime = true,
                code => {
                    return Err(RuntimeError::corrupt(
                        at,
                        ReadError::UnknownOptional { at, code },
                    ))
                }
            }
        }

        let reason = interp.reader.read_string().map_err(|e| interp.corrupt(e))?;

        let Some(sender) = interp
            .msg
            .return_path
            .clone()
            .filter(|path| !path.is_empty())
        else {
            log::debug!("vacation: null return path; not replying");
            return Ok(Outcome::Continue);
        };

        if is_auto_generated(interp) {
            return Ok(Outcome::Continue);
        }

        if is_system_sender(&sender) {
            log::debug!("vacation: system sender <{sender}>; not replying");
            return Ok(Outcome::Continue);
        }

        if !is_addressed_to_user(interp, &addresses) {
            log::debug!("vacation: message is not directly addressed to the user; not replying");
            return Ok(Outcome::Continue);
        }

        let id = tracking_id(handle.as_deref(), subject.as_deref(), &reason, &sender);
        if let Some(store) = interp.env.duplicates {
            let user = interp.env.duplicate_user(interp.msg);
            if store.check(&id, user) {
                log::info!("discarded duplicate vacation response to <{sender}>");
                return Ok(Outcome::Continue);
            }
        } else {
            log::warn!("vacation: no duplicate store; responses are not rate-limited");
        }

        interp.result_mut().add_action(
            &VACATION_ACTION,
            line,
            Box::new(VacationContext {
                sender,
                reason,
                subject,
                from,
                handle,
                days,
                mime,
                id,
            }),
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
        out.push_str(" (line");
        dump_uint(reader, out)?;
        out.push(')');

        loop {
            let at = reader.pos();
            let code = reader.read_u8()?;
            match code {
                0 => break,
                OPT_DAYS => {
                    out.push_str(" :days");
                    dump_uint(reader, out)?;
                }
                OPT_SUBJECT => {
                    out.push_str(" :subject");
                    dump_string(reader, out)?;
                }
                OPT_FROM => {
                    out.push_str(" :from");
                    dump_string(reader, out)?;
                }
                OPT_ADDRESSES => {
                    out.push_str(" :addresses");
                    dump_string_list(reader, out)?;
                }
                OPT_HANDLE => {
                    out.push_str(" :handle");
                    dump_string(reader, out)?;
                }
                OPT_MIME => out.push_str(" :mime"),
                code => return Err(ReadError::UnknownOptional { at, code }),
            }
        }

        dump_string(reader, out)
    }
}

/// Mailing-list and auto-generated mail must never receive a reply.
fn is_auto_generated(interp: &Interpreter) -> bool {
    let mail = interp.msg.mail;

    if let Some(value) = mail.first_header("auto-submitted") {
        if !value.trim().eq_ignore_ascii_case("no") {
            log::debug!("vacation: message is auto-submitted; not replying");
            return true;
        }
    }

    if let Some(value) = mail.first_header("precedence") {
        if matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "bulk" | "list" | "junk"
        ) {
            log::debug!("vacation: precedence {value}; not replying");
            return true;
        }
    }

    for name in ["list-id", "list-post", "list-unsubscribe"] {
        if mail.first_header(name).is_some() {
            log::debug!("vacation: mailing-list message; not replying");
            return true;
        }
    }

    false
}

fn is_system_sender(sender: &str) -> bool {
    let Some(parsed) = address::parse_single(sender) else {
        return false;
    };
    let local = parsed.local_part.to_ascii_lowercase();

    matches!(local.as_str(), "mailer-daemon" | "postmaster" | "listserv" | "majordomo")
        || local.starts_with("owner-")
        || local.ends_with("-request")
}

/// "Replies MUST only be sent when the user's address is in a To, Cc, ...
/// line of the original message." The recipient set is the delivery address
/// plus the `:addresses` list; with neither available the check is skipped.
fn is_addressed_to_user(interp: &Interpreter, addresses: &[String]) -> bool {
    let mut candidates: Vec<String> = addresses.iter().map(|a| a.to_ascii_lowercase()).collect();
    if let Some(to) = &interp.msg.to_address {
        candidates.push(to.to_ascii_lowercase());
    }
    if candidates.is_empty() {
        return true;
    }

    for name in ["to", "cc", "bcc", "resent-to", "resent-cc", "delivered-to"] {
        for raw in interp.msg.mail.headers(name) {
            for parsed in address::parse_address_list(&raw) {
                let full = if parsed.domain.is_empty() {
                    parsed.local_part.to_ascii_lowercase()
                } else {
                    format!(
                        "{}@{}",
                        parsed.local_part.to_ascii_lowercase(),
                        parsed.domain
                    )
                };
                if candidates.contains(&full) {
                    return true;
                }
            }
        }
    }

    false
}

/// The duplicate-store id of a reply: per sender and, without `:handle`,
/// per response content.
fn tracking_id(handle: Option<&str>, subject: Option<&str>, reason: &str, sender: &str) -> Vec<u8> {
    let seed = match handle {
        Some(handle) => format!("vacation\u{0}h\u{0}{handle}\u{0}{}", sender.to_ascii_lowercase()),
        None => format!(
            "vacation\u{0}m\u{0}{}\u{0}{reason}\u{0}{}",
            subject.unwrap_or(""),
            sender.to_ascii_lowercase()
        ),
    };
    BASE64.encode(seed).into_bytes()
}

// ----- the action -----

#[derive(Debug)]
pub struct VacationAction;

pub static VACATION_ACTION: VacationAction = VacationAction;

impl ActionDef for VacationAction {
    fn name(&self) -> &'static str {
        "vacation"
    }

    fn flags(&self) -> ActionFlags {
        ActionFlags {
            cancels_keep: false,
            sends_response: true,
        }
    }

    fn execute(&self, cx: &mut CommitCx, entry: &mut ActionEntry) -> Result<(), ActionError> {
        let Some(smtp) = cx.env.smtp else {
            cx.ehandler.warning(
                Some(entry.line),
                "vacation action ignored: no SMTP transport available",
            );
            return Ok(());
        };

        let Some(context) = entry.context::<VacationContext>() else {
            return Err(ActionError::new("vacation entry without context"));
        };
        let context = context.clone();

        let reply = compose_reply(cx, &context);

        // Auto-replies are sent with the null return path so they can never
        // bounce back and forth.
        let mut submission = smtp
            .open(&context.sender, None)
            .map_err(|error| ActionError::temporary(format!("SMTP open failed: {error}")))?;
        submission
            .write_all(reply.as_bytes())
            .map_err(|error| ActionError::temporary(format!("SMTP write failed: {error}")))?;
        submission
            .close()
            .map_err(|error| ActionError::temporary(format!("SMTP close failed: {error}")))?;

        log::debug!("vacation: sent response to <{}>", context.sender);

        let expire_unix = Utc::now().timestamp() + (context.days * 86400) as i64;
        cx.defer_mark(context.id, expire_unix);

        Ok(())
    }
}

fn compose_reply(cx: &CommitCx, context: &VacationContext) -> String {
    let from = context
        .from
        .clone()
        .or_else(|| cx.env.postmaster_address.clone())
        .or_else(|| match (&cx.env.username, &cx.env.hostname) {
            (Some(user), Some(host)) => Some(format!("{user}@{host}")),
            _ => None,
        })
        .unwrap_or_else(|| "postmaster".to_owned());

    let subject = context.subject.clone().unwrap_or_else(|| {
        match cx.msg.mail.first_header("subject") {
            Some(original) => format!("Auto: {original}"),
            None => "Automated reply".to_owned(),
        }
    });

    let mut reply = String::new();
    reply.push_str(&format!("From: <{from}>\r\n"));
    reply.push_str(&format!("To: <{}>\r\n", context.sender));
    reply.push_str(&format!("Subject: {subject}\r\n"));
    if let Some(message_id) = &cx.msg.message_id {
        reply.push_str(&format!("In-Reply-To: {message_id}\r\n"));
        reply.push_str(&format!("References: {message_id}\r\n"));
    }
    reply.push_str("Auto-Submitted: auto-replied (vacation)\r\n");
    reply.push_str("Precedence: bulk\r\n");
    reply.push_str("X-Sieve: vacation\r\n");

    if context.mime {
        // With :mime the reason supplies its own MIME entity headers.
        reply.push_str(&context.reason);
    } else {
        reply.push_str("MIME-Version: 1.0\r\n");
        reply.push_str("Content-Type: text/plain; charset=utf-8\r\n");
        reply.push_str("\r\n");
        reply.push_str(&context.reason);
    }
    if !reply.ends_with("\r\n") {
        reply.push_str("\r\n");
    }

    reply
}

// ----- the extension -----

#[derive(Debug)]
pub struct Vacation;

pub static VACATION: Vacation = Vacation;

static OPERATIONS: [&dyn Operation; 1] = [&VACATION_OP];

impl Extension for Vacation {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validator_load(&'static self, validator: &mut Validator) {
        validator.register_command(&VACATION_CMD);
    }

    fn operations(&self) -> &'static [&'static dyn Operation] {
        &OPERATIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_id_is_stable_per_sender() {
        let a = tracking_id(Some("h1"), None, "away", "alice@example.com");
        let b = tracking_id(Some("h1"), None, "different reason", "ALICE@example.com");
        assert_eq!(a, b);

        let c = tracking_id(Some("h1"), None, "away", "bob@example.com");
        assert_ne!(a, c);
    }

    #[test]
    fn test_tracking_id_without_handle_depends_on_content() {
        let a = tracking_id(None, Some("Away"), "gone fishing", "x@y.test");
        let b = tracking_id(None, Some("Away"), "back on monday", "x@y.test");
        assert_ne!(a, b);
    }

    #[test]
    fn test_system_senders() {
        assert!(is_system_sender("MAILER-DAEMON@example.com"));
        assert!(is_system_sender("owner-users@example.com"));
        assert!(is_system_sender("users-request@example.com"));
        assert!(!is_system_sender("alice@example.com"));
    }
}
