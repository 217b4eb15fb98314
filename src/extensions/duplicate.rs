//! The `duplicate` extension ([RFC 7352](https://www.rfc-editor.org/rfc/rfc7352.html)).
//!
//! The `duplicate` test is true when a message with the same unique id was
//! seen before. The id is tracked through the environment's duplicate store;
//! the mark recording this message runs only when the whole result commits,
//! so a failed delivery is not remembered as seen. Within one message,
//! checks are cached in the message context so chained scripts agree.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;

use crate::{
    binary::{ReadError, Reader},
    command::{
        ArgType, ArgumentCursor, CommandCtx, CommandDef, CommandKind, CommandRegistration,
        OpcodeRef, TagDef, ValueTag,
    },
    error::RuntimeError,
    interp::Interpreter,
    op::{dump_string, dump_uint, Dispatch, Operation, Outcome},
    registry::Extension,
    validate::Validator,
};

pub const NAME: &str = "duplicate";

const OPT_HEADER: u8 = 1;
const OPT_UNIQUEID: u8 = 2;
const OPT_HANDLE: u8 = 3;
const OPT_SECONDS: u8 = 4;
const OPT_LAST: u8 = 5;

/// Tracking period applied without `:seconds`.
const DEFAULT_PERIOD_SECONDS: u64 = 14 * 86400;

/// Cached check results for this message, shared across chained scripts.
#[derive(Debug, Default)]
pub struct DuplicateCache {
    checks: HashMap<Vec<u8>, bool>,
}

// ----- tags -----

/// `:header` and `:uniqueid` are mutually exclusive sources of the id.
#[derive(Debug)]
struct IdSourceTag {
    identifier: &'static str,
    ty: ArgType,
}

static HEADER_TAG: IdSourceTag = IdSourceTag {
    identifier: "header",
    ty: ArgType::String,
};
static UNIQUEID_TAG: IdSourceTag = IdSourceTag {
    identifier: "uniqueid",
    ty: ArgType::String,
};

impl TagDef for IdSourceTag {
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
        if ctx.has_opt(OPT_HEADER) || ctx.has_opt(OPT_UNIQUEID) {
            validator.error(line, "duplicate takes at most one of :header and :uniqueid");
            return false;
        }

        let Some(value) = validator.validate_tag_parameter(args, identifier, line, self.ty) else {
            return false;
        };

        ctx.push_opt(opt_code, value);
        true
    }
}

static HANDLE_TAG: ValueTag = ValueTag {
    identifier: "handle",
    ty: Some(ArgType::String),
};
static SECONDS_TAG: ValueTag = ValueTag {
    identifier: "seconds",
    ty: Some(ArgType::Number),
};
static LAST_TAG: ValueTag = ValueTag {
    identifier: "last",
    ty: None,
};

// ----- the test -----

#[derive(Debug)]
pub struct DuplicateTest;

pub static DUPLICATE_TEST: DuplicateTest = DuplicateTest;

impl CommandDef for DuplicateTest {
    fn name(&self) -> &'static str {
        "duplicate"
    }

    fn kind(&self) -> CommandKind {
        CommandKind::Test
    }

    fn opcode(&self) -> Option<OpcodeRef> {
        Some(OpcodeRef::Ext { ext: NAME, code: 0 })
    }

    fn registered(&self, registration: &mut CommandRegistration) {
        registration.register_tag(&HEADER_TAG, OPT_HEADER);
        registration.register_tag(&UNIQUEID_TAG, OPT_UNIQUEID);
        registration.register_tag(&HANDLE_TAG, OPT_HANDLE);
        registration.register_tag(&SECONDS_TAG, OPT_SECONDS);
        registration.register_tag(&LAST_TAG, OPT_LAST);
    }
}

#[derive(Debug)]
pub struct DuplicateOp;

pub static DUPLICATE_OP: DuplicateOp = DuplicateOp;

impl Operation for DuplicateOp {
    fn name(&self) -> &'static str {
        "DUPLICATE"
    }

    fn execute(&self, interp: &mut Interpreter) -> Result<Outcome, RuntimeError> {
        let mut header = None;
        let mut uniqueid = None;
        let mut handle = None;
        let mut seconds = DEFAULT_PERIOD_SECONDS;
        let mut last = false;

        loop {
            let at = interp.reader.pos();
            let code = interp.reader.read_u8().map_err(|e| interp.corrupt(e))?;
            match code {
                0 => break,
                OPT_HEADER => {
                    header = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_UNIQUEID => {
                    uniqueid = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_HANDLE => {
                    handle = Some(interp.reader.read_string().map_err(|e| interp.corrupt(e))?);
                }
                OPT_SECONDS => {
                    seconds = interp.reader.read_uint().map_err(|e| interp.corrupt(e))?;
                }
                OPT_LAST => last = true,
                code => {
                    return Err(RuntimeError::corrupt(
                        at,
                        ReadError::UnknownOptional { at, code },
                    ))
                }
            }
        }

        let value = match (&uniqueid, &header) {
            (Some(uniqueid), _) => Some(uniqueid.clone()),
            (None, Some(name)) => interp.msg.mail.first_header(name),
            (None, None) => interp.msg.message_id.clone(),
        };

        let Some(value) = value.filter(|value| !value.is_empty()) else {
            log::debug!("duplicate: no unique id available; test is false");
            interp.set_test_result(false);
            return Ok(Outcome::Continue);
        };

        let Some(store) = interp.env.duplicates else {
            log::warn!("duplicate: no duplicate store available; test is false");
            interp.set_test_result(false);
            return Ok(Outcome::Continue);
        };

        let id = tracking_id(handle.as_deref(), &value);
        let user = interp.env.duplicate_user(interp.msg).to_owned();

        let cache = interp.message_ctx.slot_mut::<DuplicateCache>(NAME);
        let seen = match cache.checks.get(&id) {
            Some(seen) => *seen,
            None => {
                let seen = store.check(&id, &user);
                cache.checks.insert(id.clone(), seen);
                seen
            }
        };

        if !seen || last {
            let expire_unix = Utc::now().timestamp() + seconds as i64;
            interp.result_mut().defer_mark(id, expire_unix);
        }

        interp.set_test_result(seen);
        Ok(Outcome::Continue)
    }

    fn dump(
        &self,
        reader: &mut Reader,
        _dispatch: &Dispatch,
        out: &mut String,
    ) -> Result<(), ReadError> {
        loop {
            let at = reader.pos();
            let code = reader.read_u8()?;
            match code {
                0 => return Ok(()),
                OPT_HEADER => {
                    out.push_str(" :header");
                    dump_string(reader, out)?;
                }
                OPT_UNIQUEID => {
                    out.push_str(" :uniqueid");
                    dump_string(reader, out)?;
                }
                OPT_HANDLE => {
                    out.push_str(" :handle");
                    dump_string(reader, out)?;
                }
                OPT_SECONDS => {
                    out.push_str(" :seconds");
                    dump_uint(reader, out)?;
                }
                OPT_LAST => out.push_str(" :last"),
                code => return Err(ReadError::UnknownOptional { at, code }),
            }
        }
    }
}

fn tracking_id(handle: Option<&str>, value: &str) -> Vec<u8> {
    let seed = format!("duplicate\u{0}{}\u{0}{value}", handle.unwrap_or(""));
    BASE64.encode(seed).into_bytes()
}

// ----- the extension -----

#[derive(Debug)]
pub struct Duplicate;

pub static DUPLICATE: Duplicate = Duplicate;

static OPERATIONS: [&dyn Operation; 1] = [&DUPLICATE_OP];

impl Extension for Duplicate {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validator_load(&'static self, validator: &mut Validator) {
        validator.register_command(&DUPLICATE_TEST);
    }

    fn operations(&self) -> &'static [&'static dyn Operation] {
        &OPERATIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracking_id() {
        let a = tracking_id(None, "<msg1@x>");
        let b = tracking_id(None, "<msg1@x>");
        assert_eq!(a, b);

        assert_ne!(tracking_id(None, "<msg2@x>"), a);
        assert_ne!(tracking_id(Some("h"), "<msg1@x>"), a);
    }
}
