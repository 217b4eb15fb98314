//! The abstract syntax tree handed to the validator.
//!
//! The parser produces a [`Script`], a sequence of [`Command`]s. Commands and
//! tests share one node type: a test is a command of test kind appearing in a
//! test position (`if`, `anyof`, ...). Every node carries the source line it
//! started on and a script-unique id, which validation and generation use to
//! attach per-node state without back-pointers into the tree.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A parsed Sieve script.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    /// Top-level commands, in source order.
    pub commands: Vec<Command>,
    /// Number of nodes in the tree; node ids are `0..node_count`.
    pub node_count: u32,
}

/// A command or test node.
///
/// "Commands are identifiers followed by arguments." ([RFC 5228](https://www.rfc-editor.org/rfc/rfc5228.html))
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Script-unique node id, assigned in pre-order by the parser.
    pub id: u32,
    /// The identifier, lowercased.
    pub name: String,
    /// Source line the identifier started on (1-based).
    pub line: u32,
    /// Tagged and positional arguments, in source order.
    pub arguments: Vec<Argument>,
    /// Subtests from a test or test-list argument.
    pub tests: Vec<Command>,
    /// An attached block, if any.
    pub block: Option<Vec<Command>>,
}

/// An argument to a command or test.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    pub value: ArgumentValue,
    /// Source line the argument started on (1-based).
    pub line: u32,
}

/// The value of an argument.
///
/// Numbers carry their quantifier already applied: `10K` parses as `10240`.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgumentValue {
    String(String),
    Number(u64),
    StringList(Vec<String>),
    /// A tagged argument, without the leading `:`.
    Tag(String),
}

impl ArgumentValue {
    /// Name of the value's type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::StringList(_) => "string list",
            Self::Tag(_) => "tag",
        }
    }

    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u64> {
        match self {
            Self::Number(value) => Some(*value),
            _ => None,
        }
    }

    /// A single string is accepted everywhere a string list is expected.
    pub fn to_string_list(&self) -> Option<Vec<String>> {
        match self {
            Self::String(value) => Some(vec![value.clone()]),
            Self::StringList(values) => Some(values.clone()),
            _ => None,
        }
    }
}

impl Command {
    /// True iff the node has a test or test-list argument.
    pub fn has_subtests(&self) -> bool {
        !self.tests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_coerces_to_string_list() {
        let arg = ArgumentValue::String("Subject".into());
        assert_eq!(arg.to_string_list(), Some(vec!["Subject".to_string()]));

        let arg = ArgumentValue::StringList(vec!["To".into(), "Cc".into()]);
        assert_eq!(
            arg.to_string_list(),
            Some(vec!["To".to_string(), "Cc".to_string()])
        );

        assert_eq!(ArgumentValue::Number(1).to_string_list(), None);
    }
}
