//! The match engine.
//!
//! Tests such as `header` and `address` combine three orthogonal
//! capabilities: a [`Comparator`] (how characters compare), a [`MatchType`]
//! (what counts as a match), and, for address tests, an
//! [`AddressPart`](crate::matching::AddressPart) (which part of the address
//! to look at). The selected triple is resolved at validation time and
//! emitted as object operands; the interpreter never searches.

use std::cmp::Ordering;

use sieve_types::ast::ArgumentValue;

pub use address::{parse_address_list, AddressPart, ParsedAddress, ALL, DOMAIN, LOCAL_PART};
pub use glob::Pattern;

use crate::{
    command::{ArgType, ArgumentCursor, CommandCtx, OperandValue, TagDef},
    validate::Validator,
};

pub mod address;
pub mod glob;

/// Optional-operand codes shared by every test that links match tags.
pub const OPT_COMPARATOR: u8 = 1;
pub const OPT_MATCH_TYPE: u8 = 2;
pub const OPT_ADDRESS_PART: u8 = 3;

// ----- Comparator -----

/// A collation, per [RFC 4790](https://www.rfc-editor.org/rfc/rfc4790.html).
pub trait Comparator: Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &str, b: &str) -> Ordering;

    fn contains(&self, haystack: &str, needle: &str) -> bool;

    /// Single-character equivalence, used by `:matches` patterns.
    fn char_match(&self, a: char, b: char) -> bool;

    fn equals(&self, a: &str, b: &str) -> bool {
        self.compare(a, b) == Ordering::Equal
    }
}

impl std::fmt::Debug for dyn Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Comparator({})", self.name())
    }
}

/// `i;octet`: raw byte comparison.
#[derive(Debug)]
pub struct Octet;

impl Comparator for Octet {
    fn name(&self) -> &'static str {
        "i;octet"
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        a.as_bytes().cmp(b.as_bytes())
    }

    fn contains(&self, haystack: &str, needle: &str) -> bool {
        needle.is_empty() || haystack.contains(needle)
    }

    fn char_match(&self, a: char, b: char) -> bool {
        a == b
    }
}

/// `i;ascii-casemap`: ASCII letters compare case-insensitively.
#[derive(Debug)]
pub struct AsciiCasemap;

impl Comparator for AsciiCasemap {
    fn name(&self) -> &'static str {
        "i;ascii-casemap"
    }

    fn compare(&self, a: &str, b: &str) -> Ordering {
        let folded = |s: &str| s.bytes().map(|b| b.to_ascii_lowercase()).collect::<Vec<_>>();
        folded(a).cmp(&folded(b))
    }

    fn contains(&self, haystack: &str, needle: &str) -> bool {
        needle.is_empty()
            || haystack
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase())
    }

    fn char_match(&self, a: char, b: char) -> bool {
        a.eq_ignore_ascii_case(&b)
    }
}

pub static OCTET: Octet = Octet;
pub static ASCII_CASEMAP: AsciiCasemap = AsciiCasemap;

/// Core comparators, indexed by object code.
pub(crate) static CORE_COMPARATORS: [&dyn Comparator; 2] = [&OCTET, &ASCII_CASEMAP];

pub(crate) const COMPARATOR_OCTET_CODE: u64 = 0;
pub(crate) const COMPARATOR_CASEMAP_CODE: u64 = 1;

// ----- MatchType -----

/// The matching algorithm of a test.
///
/// Values are streamed through [`MatchContext::matches`]; accumulating types
/// such as `:count` deliver their verdict in [`MatchType::finish`].
pub trait MatchType: Sync {
    fn name(&self) -> &'static str;

    /// Feed one value. `true` is a definitive match; the caller may stop.
    fn matches(&self, ctx: &mut MatchContext, value: &str) -> bool;

    /// Final verdict after all values have been fed.
    fn finish(&self, ctx: &mut MatchContext) -> bool {
        ctx.matched
    }
}

impl std::fmt::Debug for dyn MatchType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MatchType(:{})", self.name())
    }
}

#[derive(Debug)]
pub struct Is;

impl MatchType for Is {
    fn name(&self) -> &'static str {
        "is"
    }

    fn matches(&self, ctx: &mut MatchContext, value: &str) -> bool {
        ctx.keys.iter().any(|key| ctx.comparator.equals(value, key))
    }
}

#[derive(Debug)]
pub struct Contains;

impl MatchType for Contains {
    fn name(&self) -> &'static str {
        "contains"
    }

    fn matches(&self, ctx: &mut MatchContext, value: &str) -> bool {
        ctx.keys
            .iter()
            .any(|key| ctx.comparator.contains(value, key))
    }
}

#[derive(Debug)]
pub struct Matches;

impl MatchType for Matches {
    fn name(&self) -> &'static str {
        "matches"
    }

    fn matches(&self, ctx: &mut MatchContext, value: &str) -> bool {
        let comparator = ctx.comparator;
        ctx.patterns()
            .iter()
            .any(|pattern| pattern.matches(value, comparator))
    }
}

pub static IS: Is = Is;
pub static CONTAINS: Contains = Contains;
pub static MATCHES: Matches = Matches;

/// Core match types, indexed by object code.
pub(crate) static CORE_MATCH_TYPES: [&dyn MatchType; 3] = [&IS, &CONTAINS, &MATCHES];

pub(crate) const MATCH_TYPE_IS_CODE: u64 = 0;

/// Per-test match state.
///
/// Carried across a test's value iterations so that accumulating match types
/// see every value before deciding.
pub struct MatchContext<'a> {
    pub(crate) comparator: &'static dyn Comparator,
    match_type: &'static dyn MatchType,
    pub(crate) keys: &'a [String],
    pub(crate) matched: bool,
    /// Values fed so far, for `:count`.
    pub(crate) value_count: u64,
    patterns: Option<Vec<Pattern>>,
}

impl std::fmt::Debug for MatchContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("MatchContext")
            .field("comparator", &self.comparator.name())
            .field("match_type", &self.match_type.name())
            .field("keys", &self.keys)
            .field("matched", &self.matched)
            .finish_non_exhaustive()
    }
}

impl<'a> MatchContext<'a> {
    pub fn new(
        comparator: &'static dyn Comparator,
        match_type: &'static dyn MatchType,
        keys: &'a [String],
    ) -> Self {
        Self {
            comparator,
            match_type,
            keys,
            matched: false,
            value_count: 0,
            patterns: None,
        }
    }

    /// Feed one value; `true` means the test may stop early.
    pub fn matches(&mut self, value: &str) -> bool {
        let match_type = self.match_type;
        if match_type.matches(self, value) {
            self.matched = true;
        }
        self.matched
    }

    /// The final verdict.
    pub fn finish(mut self) -> bool {
        let match_type = self.match_type;
        match_type.finish(&mut self)
    }

    /// Keys compiled as glob patterns, built on first use.
    pub(crate) fn patterns(&mut self) -> &[Pattern] {
        if self.patterns.is_none() {
            self.patterns = Some(self.keys.iter().map(|key| glob::compile(key)).collect());
        }
        self.patterns.as_deref().expect("patterns were just built")
    }
}

// ----- Validator-side selectors -----

/// A match type selectable by tag.
///
/// Split from [`MatchType`] because selection may consume further arguments
/// (`:count "ge"`) and resolve to a different runtime object per argument.
pub trait MatchTypeDef: Sync {
    fn name(&self) -> &'static str;

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        line: u32,
        args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool;
}

impl std::fmt::Debug for dyn MatchTypeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "MatchTypeDef(:{})", self.name())
    }
}

/// A core match type: selecting it emits a fixed object operand.
#[derive(Debug)]
pub struct CoreMatchTypeDef {
    name: &'static str,
    code: u64,
}

impl MatchTypeDef for CoreMatchTypeDef {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        line: u32,
        _args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool {
        if ctx.has_opt(opt_code) {
            validator.error(line, "multiple match types specified");
            return false;
        }

        ctx.push_opt(
            opt_code,
            OperandValue::Object {
                owner: None,
                code: self.code,
            },
        );
        true
    }
}

pub static IS_DEF: CoreMatchTypeDef = CoreMatchTypeDef {
    name: "is",
    code: 0,
};
pub static CONTAINS_DEF: CoreMatchTypeDef = CoreMatchTypeDef {
    name: "contains",
    code: 1,
};
pub static MATCHES_DEF: CoreMatchTypeDef = CoreMatchTypeDef {
    name: "matches",
    code: 2,
};

// ----- Tags -----

/// The match-type tag: accepts any identifier registered as a match type.
#[derive(Debug)]
pub struct MatchTypeTag;

pub static MATCH_TYPE_TAG: MatchTypeTag = MatchTypeTag;

impl TagDef for MatchTypeTag {
    fn identifier(&self) -> &'static str {
        "match-type"
    }

    fn matches(&self, identifier: &str, validator: &Validator) -> bool {
        validator.match_type_def(identifier).is_some()
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
        let def = validator
            .match_type_def(identifier)
            .expect("tag only matches registered match types");
        def.validate(validator, ctx, line, args, opt_code)
    }
}

/// The `:comparator <name>` tag.
#[derive(Debug)]
pub struct ComparatorTag;

pub static COMPARATOR_TAG: ComparatorTag = ComparatorTag;

impl TagDef for ComparatorTag {
    fn identifier(&self) -> &'static str {
        "comparator"
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
            validator.error(line, "multiple comparators specified");
            return false;
        }

        let name = match args.peek().map(|arg| &arg.value) {
            Some(ArgumentValue::String(name)) => {
                let name = name.clone();
                args.next();
                name
            }
            _ => {
                validator.error(line, &format!(":{identifier} tag requires a string argument"));
                return false;
            }
        };

        match validator.comparator_object(&name) {
            Some(value) => {
                ctx.push_opt(opt_code, value);
                true
            }
            None => {
                validator.error(line, &format!("unknown comparator '{name}'"));
                false
            }
        }
    }
}

/// The address-part tag: accepts any identifier registered as a part.
#[derive(Debug)]
pub struct AddressPartTag;

pub static ADDRESS_PART_TAG: AddressPartTag = AddressPartTag;

impl TagDef for AddressPartTag {
    fn identifier(&self) -> &'static str {
        "address-part"
    }

    fn matches(&self, identifier: &str, validator: &Validator) -> bool {
        validator.address_part_object(identifier).is_some()
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        identifier: &str,
        line: u32,
        _args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool {
        if ctx.has_opt(opt_code) {
            validator.error(line, "multiple address parts specified");
            return false;
        }

        let value = validator
            .address_part_object(identifier)
            .expect("tag only matches registered address parts");
        ctx.push_opt(opt_code, value);
        true
    }
}

/// Consume one typed tag parameter.
pub(crate) fn tag_string_parameter(
    validator: &mut Validator,
    args: &mut ArgumentCursor,
    identifier: &str,
    line: u32,
) -> Option<String> {
    match validator.validate_tag_parameter(args, identifier, line, ArgType::String) {
        Some(OperandValue::String(value)) => Some(value),
        _ => None,
    }
}
