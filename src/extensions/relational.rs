//! The `relational` extension ([RFC 5231](https://www.rfc-editor.org/rfc/rfc5231.html)).
//!
//! Adds the `:count` and `:value` match types. `:value` relates each value
//! to each key under the selected comparator; `:count` counts the values a
//! test produces and relates the total to numeric keys.

use std::cmp::Ordering;

use crate::{
    command::{ArgumentCursor, CommandCtx, OperandValue},
    matching::{tag_string_parameter, MatchContext, MatchType, MatchTypeDef},
    registry::Extension,
    validate::Validator,
};

pub const NAME: &str = "relational";

/// relation = "gt" / "ge" / "lt" / "le" / "eq" / "ne"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Relation {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "gt" => Self::Gt,
            "ge" => Self::Ge,
            "lt" => Self::Lt,
            "le" => Self::Le,
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Eq => "eq",
            Self::Ne => "ne",
        }
    }

    fn index(self) -> u64 {
        match self {
            Self::Gt => 0,
            Self::Ge => 1,
            Self::Lt => 2,
            Self::Le => 3,
            Self::Eq => 4,
            Self::Ne => 5,
        }
    }

    pub fn evaluate(self, ordering: Ordering) -> bool {
        match self {
            Self::Gt => ordering == Ordering::Greater,
            Self::Ge => ordering != Ordering::Less,
            Self::Lt => ordering == Ordering::Less,
            Self::Le => ordering != Ordering::Greater,
            Self::Eq => ordering == Ordering::Equal,
            Self::Ne => ordering != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelationalKind {
    Count,
    Value,
}

/// One resolved relational match type, e.g. `:count "ge"`.
#[derive(Debug)]
pub struct RelationalMatch {
    name: &'static str,
    kind: RelationalKind,
    relation: Relation,
}

impl MatchType for RelationalMatch {
    fn name(&self) -> &'static str {
        self.name
    }

    fn matches(&self, ctx: &mut MatchContext, value: &str) -> bool {
        ctx.value_count += 1;

        match self.kind {
            // Counting never decides early; the verdict comes in finish.
            RelationalKind::Count => false,
            RelationalKind::Value => ctx
                .keys
                .iter()
                .any(|key| self.relation.evaluate(ctx.comparator.compare(value, key))),
        }
    }

    fn finish(&self, ctx: &mut MatchContext) -> bool {
        match self.kind {
            RelationalKind::Count => ctx.keys.iter().any(|key| match key.parse::<u64>() {
                Ok(key) => self.relation.evaluate(ctx.value_count.cmp(&key)),
                Err(_) => {
                    log::warn!("ignoring non-numeric :count key '{key}'");
                    false
                }
            }),
            RelationalKind::Value => ctx.matched,
        }
    }
}

macro_rules! relational_objects {
    ($(($name:ident, $label:literal, $kind:ident, $relation:ident)),* $(,)?) => {
        $(static $name: RelationalMatch = RelationalMatch {
            name: $label,
            kind: RelationalKind::$kind,
            relation: Relation::$relation,
        };)*
    };
}

relational_objects![
    (COUNT_GT, "count-gt", Count, Gt),
    (COUNT_GE, "count-ge", Count, Ge),
    (COUNT_LT, "count-lt", Count, Lt),
    (COUNT_LE, "count-le", Count, Le),
    (COUNT_EQ, "count-eq", Count, Eq),
    (COUNT_NE, "count-ne", Count, Ne),
    (VALUE_GT, "value-gt", Value, Gt),
    (VALUE_GE, "value-ge", Value, Ge),
    (VALUE_LT, "value-lt", Value, Lt),
    (VALUE_LE, "value-le", Value, Le),
    (VALUE_EQ, "value-eq", Value, Eq),
    (VALUE_NE, "value-ne", Value, Ne),
];

/// Relational match objects; the object code is `kind * 6 + relation`.
static MATCH_TYPES: [&dyn MatchType; 12] = [
    &COUNT_GT, &COUNT_GE, &COUNT_LT, &COUNT_LE, &COUNT_EQ, &COUNT_NE, &VALUE_GT, &VALUE_GE,
    &VALUE_LT, &VALUE_LE, &VALUE_EQ, &VALUE_NE,
];

fn object_code(kind: RelationalKind, relation: Relation) -> u64 {
    let kind = match kind {
        RelationalKind::Count => 0,
        RelationalKind::Value => 1,
    };
    kind * 6 + relation.index()
}

// ----- validator-side selectors -----

#[derive(Debug)]
pub struct RelationalDef {
    name: &'static str,
    kind: RelationalKind,
}

pub static COUNT_DEF: RelationalDef = RelationalDef {
    name: "count",
    kind: RelationalKind::Count,
};
pub static VALUE_DEF: RelationalDef = RelationalDef {
    name: "value",
    kind: RelationalKind::Value,
};

impl MatchTypeDef for RelationalDef {
    fn name(&self) -> &'static str {
        self.name
    }

    fn validate(
        &self,
        validator: &mut Validator,
        ctx: &mut CommandCtx,
        line: u32,
        args: &mut ArgumentCursor,
        opt_code: u8,
    ) -> bool {
        if ctx.has_opt(opt_code) {
            validator.error(line, "multiple match types specified");
            return false;
        }

        let Some(name) = tag_string_parameter(validator, args, self.name, line) else {
            return false;
        };

        let Some(relation) = Relation::from_name(&name) else {
            validator.error(line, &format!("invalid relation '{name}'"));
            return false;
        };

        ctx.push_opt(
            opt_code,
            OperandValue::Object {
                owner: Some(NAME),
                code: object_code(self.kind, relation),
            },
        );
        true
    }
}

// ----- the extension -----

#[derive(Debug)]
pub struct Relational;

pub static RELATIONAL: Relational = Relational;

impl Extension for Relational {
    fn name(&self) -> &'static str {
        NAME
    }

    fn validator_load(&'static self, validator: &mut Validator) {
        validator.register_match_type(&COUNT_DEF);
        validator.register_match_type(&VALUE_DEF);
    }

    fn match_types(&self) -> &'static [&'static dyn MatchType] {
        &MATCH_TYPES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::ASCII_CASEMAP;

    const RELATIONS: [Relation; 6] = [
        Relation::Gt,
        Relation::Ge,
        Relation::Lt,
        Relation::Le,
        Relation::Eq,
        Relation::Ne,
    ];

    #[test]
    fn test_relation_evaluate() {
        assert!(Relation::Ge.evaluate(Ordering::Equal));
        assert!(Relation::Ge.evaluate(Ordering::Greater));
        assert!(!Relation::Ge.evaluate(Ordering::Less));
        assert!(Relation::Ne.evaluate(Ordering::Less));
        assert!(!Relation::Eq.evaluate(Ordering::Greater));
    }

    #[test]
    fn test_count_match() {
        let keys = vec!["2".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &COUNT_GE, &keys);
        assert!(!ctx.matches("a"));
        assert!(!ctx.matches("b"));
        assert!(ctx.finish());

        let keys = vec!["3".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &COUNT_GE, &keys);
        assert!(!ctx.matches("a"));
        assert!(!ctx.finish());
    }

    #[test]
    fn test_count_ignores_bad_keys() {
        let keys = vec!["many".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &COUNT_EQ, &keys);
        assert!(!ctx.matches("a"));
        assert!(!ctx.finish());
    }

    #[test]
    fn test_value_match() {
        let keys = vec!["3".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &VALUE_GE, &keys);
        assert!(ctx.matches("5"));

        let keys = vec!["3".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &VALUE_LT, &keys);
        assert!(ctx.matches("1"));
        // Lexicographic comparison under the core comparators.
        let keys = vec!["10".to_owned()];
        let mut ctx = MatchContext::new(&ASCII_CASEMAP, &VALUE_LT, &keys);
        assert!(!ctx.matches("9"));
    }

    #[test]
    fn test_object_codes_line_up() {
        for (code, match_type) in MATCH_TYPES.iter().enumerate() {
            let (kind, relation) = if code < 6 {
                (RelationalKind::Count, RELATIONS[code])
            } else {
                (RelationalKind::Value, RELATIONS[code - 6])
            };
            assert_eq!(object_code(kind, relation), code as u64);
            assert!(match_type.name().ends_with(relation.name()));
        }
    }
}
