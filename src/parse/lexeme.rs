//! Lexical elements of the Sieve grammar.
//!
//! white-space  = 1*(SP / CRLF / HTAB) / comment
//! comment      = bracket-comment / hash-comment
//! identifier   = (ALPHA / "_") *(ALPHA / DIGIT / "_")
//! tag          = ":" identifier
//! number       = 1*DIGIT [ QUANTIFIER ]
//! string       = quoted-string / multi-line

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_until, take_while, take_while1},
    character::complete::{digit1, one_of},
    combinator::{opt, value},
    multi::{many0_count, separated_list1},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// hash-comment = "#" *CHAR-NOT-CRLF CRLF
fn hash_comment(input: &str) -> IResult<&str, ()> {
    let (input, _) = tag("#")(input)?;
    let (input, _) = take_while(|ch| ch != '\n')(input)?;
    let (input, _) = opt(tag("\n"))(input)?;

    Ok((input, ()))
}

/// bracket-comment = "/*" ... "*/" (no nesting)
fn bracket_comment(input: &str) -> IResult<&str, ()> {
    let (input, _) = tag("/*")(input)?;
    let (input, _) = take_until("*/")(input)?;
    let (input, _) = tag("*/")(input)?;

    Ok((input, ()))
}

/// Zero or more white space characters or comments.
pub fn ws0(input: &str) -> IResult<&str, ()> {
    let space = value((), take_while1(|ch| matches!(ch, ' ' | '\t' | '\r' | '\n')));
    let (input, _) = many0_count(alt((space, hash_comment, bracket_comment)))(input)?;

    Ok((input, ()))
}

pub fn identifier(input: &str) -> IResult<&str, &str> {
    let (rest, _) = take_while1(is_identifier_start)(input)?;
    let consumed = input.len() - rest.len();
    let (rest, _) = take_while(is_identifier_char)(rest)?;
    let end = consumed + (input.len() - consumed - rest.len());

    Ok((rest, &input[..end]))
}

/// tag = ":" identifier
pub fn tag_argument(input: &str) -> IResult<&str, &str> {
    preceded(tag(":"), identifier)(input)
}

/// number = 1*DIGIT [ "K" / "M" / "G" ]
///
/// Quantifiers scale by powers of 1024. Overflowing u64 is a hard error.
pub fn number(input: &str) -> IResult<&str, u64> {
    let (input, digits) = digit1(input)?;
    let (input, quantifier) = opt(one_of("KkMmGg"))(input)?;

    let scale: u64 = match quantifier.map(|q| q.to_ascii_uppercase()) {
        None => 1,
        Some('K') => 1024,
        Some('M') => 1024 * 1024,
        _ => 1024 * 1024 * 1024,
    };

    match digits.parse::<u64>().ok().and_then(|n| n.checked_mul(scale)) {
        Some(value) => Ok((input, value)),
        None => Err(nom::Err::Failure(nom::error::make_error(
            input,
            nom::error::ErrorKind::TooLarge,
        ))),
    }
}

/// quoted-string = DQUOTE *CHAR DQUOTE, with "\" escaping the next character.
pub fn quoted_string(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = tag("\"")(input)?;
    let mut out = String::new();

    let mut chars = rest.char_indices();
    while let Some((index, ch)) = chars.next() {
        match ch {
            '"' => {
                rest = &rest[index + 1..];
                return Ok((rest, out));
            }
            '\\' => match chars.next() {
                Some((_, escaped)) => out.push(escaped),
                None => break,
            },
            ch => out.push(ch),
        }
    }

    Err(nom::Err::Failure(nom::error::make_error(
        input,
        nom::error::ErrorKind::Char,
    )))
}

/// multi-line = "text:" *(SP / HTAB) (hash-comment / CRLF) *(multiline-literal) "." CRLF
///
/// A leading ".." on a line is reduced to ".".
pub fn multiline_string(input: &str) -> IResult<&str, String> {
    let (input, _) = tag_no_case("text:")(input)?;
    let (input, _) = take_while(|ch| matches!(ch, ' ' | '\t'))(input)?;
    let (mut input, _) = alt((hash_comment, value((), pair(opt(tag("\r")), tag("\n")))))(input)?;

    let mut lines: Vec<String> = Vec::new();
    loop {
        let line_end = input.find('\n');
        let (line, rest) = match line_end {
            Some(end) => (&input[..end], &input[end + 1..]),
            None => (input, ""),
        };
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line == "." {
            let mut body = lines.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            return Ok((rest, body));
        }
        if line_end.is_none() {
            // Unterminated literal.
            return Err(nom::Err::Failure(nom::error::make_error(
                input,
                nom::error::ErrorKind::Eof,
            )));
        }

        let line = if line.starts_with("..") { &line[1..] } else { line };
        lines.push(line.to_owned());
        input = rest;
    }
}

/// string = quoted-string / multi-line
pub fn string(input: &str) -> IResult<&str, String> {
    alt((quoted_string, multiline_string))(input)
}

/// string-list = "[" string *("," string) "]" / string
///
/// Only the bracketed form is parsed here; the coercion of a single string
/// happens during validation.
pub fn string_list(input: &str) -> IResult<&str, Vec<String>> {
    delimited(
        terminated(tag("["), ws0),
        separated_list1(delimited(ws0, tag(","), ws0), string),
        preceded(ws0, tag("]")),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_and_comments() {
        let (rest, ()) = ws0("  # note\n\t/* multi\nline */ \r\nx").unwrap();
        assert_eq!(rest, "x");

        let (rest, ()) = ws0("x").unwrap();
        assert_eq!(rest, "x");
    }

    #[test]
    fn test_identifier() {
        assert_eq!(identifier("fileinto;"), Ok((";", "fileinto")));
        assert_eq!(identifier("anyof ("), Ok((" (", "anyof")));
        assert_eq!(identifier("_x1 "), Ok((" ", "_x1")));
        assert!(identifier("1abc").is_err());
    }

    #[test]
    fn test_number_quantifiers() {
        assert_eq!(number("100K"), Ok(("", 100 * 1024)));
        assert_eq!(number("2M;"), Ok((";", 2 * 1024 * 1024)));
        assert_eq!(number("1G"), Ok(("", 1024 * 1024 * 1024)));
        assert_eq!(number("42"), Ok(("", 42)));
        assert!(matches!(
            number("99999999999999999999G"),
            Err(nom::Err::Failure(_))
        ));
    }

    #[test]
    fn test_quoted_string() {
        assert_eq!(quoted_string("\"Hi\""), Ok(("", "Hi".to_owned())));
        assert_eq!(
            quoted_string("\"a \\\"b\\\" \\\\ c\";"),
            Ok((";", "a \"b\" \\ c".to_owned()))
        );
        assert!(matches!(
            quoted_string("\"unterminated"),
            Err(nom::Err::Failure(_))
        ));
    }

    #[test]
    fn test_multiline_string() {
        let input = "text:\nline one\n..dot\n.\nrest";
        assert_eq!(
            multiline_string(input),
            Ok(("rest", "line one\n.dot\n".to_owned()))
        );

        let input = "text: # comment\n.\n";
        assert_eq!(multiline_string(input), Ok(("", String::new())));
    }

    #[test]
    fn test_string_list() {
        assert_eq!(
            string_list("[\"a\", \"b\" ,\"c\"]"),
            Ok(("", vec!["a".to_owned(), "b".to_owned(), "c".to_owned()]))
        );
        assert!(string_list("[]").is_err());
    }

    #[test]
    fn test_tag() {
        assert_eq!(tag_argument(":contains "), Ok((" ", "contains")));
        assert!(tag_argument("contains").is_err());
    }
}
