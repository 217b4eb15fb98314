//! Flag-related types.

use std::fmt::{Display, Formatter};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrorKind};

/// There are two types of flags: system and keyword flags.
///
/// A system flag is a flag name that is pre-defined in RFC 3501. All system
/// flags begin with "\\". Flags that begin with "\\" but are not pre-defined
/// system flags are extension flags. A keyword is defined by the server
/// implementation and does not begin with "\\".
///
/// The `imap4flags` extension ([RFC 5232](https://www.rfc-editor.org/rfc/rfc5232.html))
/// attaches flags of either type to `keep` and `fileinto` actions.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Flag {
    /// Message has been answered (`\Answered`).
    Answered,
    /// Message is "deleted" for removal by later EXPUNGE (`\Deleted`).
    Deleted,
    /// Message has not completed composition (`\Draft`).
    Draft,
    /// Message is "flagged" for urgent/special attention (`\Flagged`).
    Flagged,
    /// Message has been read (`\Seen`).
    Seen,
    /// A future expansion of a system flag.
    Extension(String),
    /// A keyword.
    Keyword(String),
}

impl Flag {
    pub fn system(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "answered" => Self::Answered,
            "deleted" => Self::Deleted,
            "draft" => Self::Draft,
            "flagged" => Self::Flagged,
            "seen" => Self::Seen,
            _ => Self::Extension(name.to_owned()),
        }
    }

    pub fn keyword(name: &str) -> Self {
        Self::Keyword(name.to_owned())
    }

    pub fn verify(value: impl AsRef<[u8]>) -> Result<(), ValidationError> {
        let value = value.as_ref();

        if value.is_empty() {
            return Err(ValidationError::new(ValidationErrorKind::Empty));
        }

        if let Some(at) = value.iter().position(|b| !is_flag_char(*b)) {
            return Err(ValidationError::new(ValidationErrorKind::InvalidByteAt {
                byte: value[at],
                at,
            }));
        }

        Ok(())
    }

    /// Flags compare case-insensitively.
    pub fn eq_ignore_case(&self, other: &Flag) -> bool {
        match (self, other) {
            (Self::Extension(a), Self::Extension(b)) | (Self::Keyword(a), Self::Keyword(b)) => {
                a.eq_ignore_ascii_case(b)
            }
            (a, b) => a == b,
        }
    }
}

impl TryFrom<&str> for Flag {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Ok(if let Some(value) = value.strip_prefix('\\') {
            Self::verify(value)?;
            Self::system(value)
        } else {
            Self::verify(value)?;
            Self::keyword(value)
        })
    }
}

impl Display for Flag {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Flag::Answered => f.write_str("\\Answered"),
            Flag::Deleted => f.write_str("\\Deleted"),
            Flag::Draft => f.write_str("\\Draft"),
            Flag::Flagged => f.write_str("\\Flagged"),
            Flag::Seen => f.write_str("\\Seen"),
            Flag::Extension(other) => write!(f, "\\{other}"),
            Flag::Keyword(keyword) => write!(f, "{keyword}"),
        }
    }
}

/// Parse a flag-list string.
///
/// "A string containing multiple flags is interpreted as a space separated
/// list of flags." (RFC 5232)
pub fn parse_flag_list(value: &str) -> Result<Vec<Flag>, ValidationError> {
    value
        .split_ascii_whitespace()
        .map(Flag::try_from)
        .collect()
}

/// atom-specials minus "\\", which selects the system flag space.
fn is_flag_char(byte: u8) -> bool {
    !matches!(
        byte,
        0x00..=0x1f | 0x7f | b'(' | b')' | b'{' | b' ' | b'%' | b'*' | b'"' | b'\\' | b']'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_from_str() {
        assert_eq!(Flag::try_from("\\Answered"), Ok(Flag::Answered));
        assert_eq!(Flag::try_from("\\ANSWERED"), Ok(Flag::Answered));
        assert_eq!(
            Flag::try_from("\\Recent"),
            Ok(Flag::Extension("Recent".to_owned()))
        );
        assert_eq!(
            Flag::try_from("$Junk"),
            Ok(Flag::Keyword("$Junk".to_owned()))
        );

        assert!(Flag::try_from("").is_err());
        assert!(Flag::try_from("\\").is_err());
        assert!(Flag::try_from("two words").is_err());
    }

    #[test]
    fn test_parse_flag_list() {
        assert_eq!(
            parse_flag_list("\\Seen $Junk"),
            Ok(vec![Flag::Seen, Flag::Keyword("$Junk".to_owned())])
        );
        assert!(parse_flag_list("\\Seen \"").is_err());
    }

    #[test]
    fn test_eq_ignore_case() {
        assert!(Flag::Keyword("$junk".into()).eq_ignore_case(&Flag::Keyword("$Junk".into())));
        assert!(!Flag::Seen.eq_ignore_case(&Flag::Draft));
    }
}
