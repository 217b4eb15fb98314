//! The command grammar.
//!
//! command   = identifier arguments (";" / block)
//! arguments = *argument [ test / test-list ]
//! test      = identifier arguments
//! test-list = "(" test *("," test) ")"
//! block     = "{" *command "}"

use nom::{
    branch::alt,
    bytes::complete::tag,
    combinator::{map, opt},
    multi::{many0, separated_list1},
    sequence::{delimited, preceded},
    IResult,
};
use sieve_types::ast::{Argument, ArgumentValue, Command};

use super::lexeme;

/// Grammar driver, carrying the full source so node positions can be mapped
/// to lines.
pub(super) struct Grammar<'s> {
    src: &'s str,
    /// Byte offsets of line starts.
    line_starts: Vec<usize>,
}

impl<'s> Grammar<'s> {
    pub(super) fn new(src: &'s str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(
            src.bytes()
                .enumerate()
                .filter(|(_, byte)| *byte == b'\n')
                .map(|(index, _)| index + 1),
        );

        Self { src, line_starts }
    }

    /// 1-based source line at the position `rest` points into.
    pub(super) fn line_at(&self, rest: &str) -> u32 {
        let offset = self.src.len() - rest.len();
        self.line_starts.partition_point(|start| *start <= offset) as u32
    }

    pub(super) fn commands<'a>(&self, input: &'a str) -> IResult<&'a str, Vec<Command>> {
        many0(|i| self.command(i))(input)
    }

    fn command<'a>(&self, input: &'a str) -> IResult<&'a str, Command> {
        let (input, ()) = lexeme::ws0(input)?;
        let line = self.line_at(input);
        let (input, name) = lexeme::identifier(input)?;
        let (input, arguments) = self.arguments(input)?;
        let (input, tests) = self.subtests(input)?;

        let (input, ()) = lexeme::ws0(input)?;
        let (input, block) = opt(|i| self.block(i))(input)?;
        let input = match block {
            Some(_) => input,
            None => tag::<_, _, nom::error::Error<&str>>(";")(input)?.0,
        };

        Ok((
            input,
            Command {
                id: 0,
                name: name.to_ascii_lowercase(),
                line,
                arguments,
                tests,
                block,
            },
        ))
    }

    fn arguments<'a>(&self, input: &'a str) -> IResult<&'a str, Vec<Argument>> {
        many0(|i| self.argument(i))(input)
    }

    fn argument<'a>(&self, input: &'a str) -> IResult<&'a str, Argument> {
        let (input, ()) = lexeme::ws0(input)?;
        let line = self.line_at(input);

        let (input, value) = alt((
            map(lexeme::string, ArgumentValue::String),
            map(lexeme::number, ArgumentValue::Number),
            map(lexeme::string_list, ArgumentValue::StringList),
            map(lexeme::tag_argument, |name| {
                ArgumentValue::Tag(name.to_ascii_lowercase())
            }),
        ))(input)?;

        Ok((input, Argument { value, line }))
    }

    /// An optional trailing test or parenthesized test list.
    fn subtests<'a>(&self, input: &'a str) -> IResult<&'a str, Vec<Command>> {
        let (input, ()) = lexeme::ws0(input)?;

        if input.starts_with('(') {
            return delimited(
                preceded(tag("("), lexeme::ws0),
                separated_list1(delimited(lexeme::ws0, tag(","), lexeme::ws0), |i| {
                    self.test(i)
                }),
                preceded(lexeme::ws0, tag(")")),
            )(input);
        }

        match opt(|i| self.test(i))(input)? {
            (input, Some(test)) => Ok((input, vec![test])),
            (input, None) => Ok((input, Vec::new())),
        }
    }

    fn test<'a>(&self, input: &'a str) -> IResult<&'a str, Command> {
        let (input, ()) = lexeme::ws0(input)?;
        let line = self.line_at(input);
        let (input, name) = lexeme::identifier(input)?;
        let (input, arguments) = self.arguments(input)?;
        let (input, tests) = self.subtests(input)?;

        Ok((
            input,
            Command {
                id: 0,
                name: name.to_ascii_lowercase(),
                line,
                arguments,
                tests,
                block: None,
            },
        ))
    }

    fn block<'a>(&self, input: &'a str) -> IResult<&'a str, Vec<Command>> {
        delimited(
            tag("{"),
            |i| self.commands(i),
            preceded(lexeme::ws0, tag("}")),
        )(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Vec<Command> {
        let grammar = Grammar::new(src);
        let (rest, commands) = grammar.commands(src).unwrap();
        let (rest, ()) = lexeme::ws0(rest).unwrap();
        assert_eq!(rest, "", "unparsed input");
        commands
    }

    #[test]
    fn test_simple_command() {
        let commands = parse("keep;");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "keep");
        assert!(commands[0].arguments.is_empty());
        assert!(commands[0].block.is_none());
    }

    #[test]
    fn test_command_with_arguments() {
        let commands = parse("fileinto :copy \"INBOX.Greetings\";");
        let args = &commands[0].arguments;
        assert_eq!(args.len(), 2);
        assert_eq!(args[0].value, ArgumentValue::Tag("copy".to_owned()));
        assert_eq!(
            args[1].value,
            ArgumentValue::String("INBOX.Greetings".to_owned())
        );
    }

    #[test]
    fn test_if_with_block() {
        let commands = parse("if header :is \"Subject\" \"Hi\" { fileinto \"a\"; stop; }");
        let cmd = &commands[0];
        assert_eq!(cmd.name, "if");
        assert_eq!(cmd.tests.len(), 1);
        assert_eq!(cmd.tests[0].name, "header");
        assert_eq!(cmd.tests[0].arguments.len(), 3);
        assert_eq!(cmd.block.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_test_list() {
        let commands = parse("if anyof (header :contains \"X-Spam\" \"YES\", size :over 100K) { discard; }");
        let anyof = &commands[0].tests[0];
        assert_eq!(anyof.name, "anyof");
        assert_eq!(anyof.tests.len(), 2);
        assert_eq!(anyof.tests[0].name, "header");
        assert_eq!(anyof.tests[1].name, "size");
        assert_eq!(
            anyof.tests[1].arguments[1].value,
            ArgumentValue::Number(100 * 1024)
        );
    }

    #[test]
    fn test_nested_tests() {
        let commands = parse("if not header :is \"a\" \"b\" { keep; }");
        let not = &commands[0].tests[0];
        assert_eq!(not.name, "not");
        assert_eq!(not.tests[0].name, "header");
    }

    #[test]
    fn test_line_numbers() {
        let commands = parse("keep;\n\nif size :over 1K\n{\n  discard;\n}\n");
        assert_eq!(commands[0].line, 1);
        assert_eq!(commands[1].line, 3);
        assert_eq!(commands[1].block.as_ref().unwrap()[0].line, 5);
    }

    #[test]
    fn test_case_insensitive_names() {
        let commands = parse("KEEP;");
        assert_eq!(commands[0].name, "keep");
    }
}
