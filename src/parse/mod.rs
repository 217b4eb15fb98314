//! The script front-end: text to AST.

use sieve_types::ast::{Command, Script};

use crate::{error::CompileError, runtime::ErrorHandler};

mod lexeme;
mod script;

/// Parse a script into its AST.
///
/// Syntax problems are reported through the error handler and returned as
/// [`CompileError::Syntax`].
pub fn parse_script(src: &str, ehandler: &mut dyn ErrorHandler) -> Result<Script, CompileError> {
    let grammar = script::Grammar::new(src);

    let failed_at = |rest: &str| {
        let line = grammar.line_at(rest);
        let snippet: String = rest.chars().take(24).take_while(|ch| *ch != '\n').collect();
        let message = if snippet.is_empty() {
            "syntax error: unexpected end of script".to_owned()
        } else {
            format!("syntax error near '{snippet}'")
        };
        (line, message)
    };

    let (rest, mut commands) = match grammar.commands(src) {
        Ok(parsed) => parsed,
        Err(nom::Err::Error(error)) | Err(nom::Err::Failure(error)) => {
            let (line, message) = failed_at(error.input);
            ehandler.error(Some(line), &message);
            return Err(CompileError::Syntax { line });
        }
        Err(nom::Err::Incomplete(_)) => unreachable!("complete parsers never suspend"),
    };

    // The command list parser stops at the first byte it cannot use; only
    // trailing white space may remain.
    let (rest, ()) = lexeme::ws0(rest).unwrap_or((rest, ()));
    if !rest.is_empty() {
        let (line, message) = failed_at(rest);
        ehandler.error(Some(line), &message);
        return Err(CompileError::Syntax { line });
    }

    let node_count = assign_ids(&mut commands, 0);

    Ok(Script {
        commands,
        node_count,
    })
}

/// Number nodes in pre-order; returns the next free id.
fn assign_ids(commands: &mut [Command], mut next: u32) -> u32 {
    for command in commands {
        command.id = next;
        next += 1;
        next = assign_ids(&mut command.tests, next);
        if let Some(block) = &mut command.block {
            next = assign_ids(block, next);
        }
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::CollectingErrorHandler;

    #[test]
    fn test_parse_assigns_unique_ids() {
        let mut ehandler = CollectingErrorHandler::default();
        let script = parse_script(
            "require \"fileinto\";\nif anyof (true, false) { fileinto \"a\"; }\n",
            &mut ehandler,
        )
        .unwrap();

        let mut seen = Vec::new();
        fn collect(commands: &[Command], seen: &mut Vec<u32>) {
            for command in commands {
                seen.push(command.id);
                collect(&command.tests, seen);
                if let Some(block) = &command.block {
                    collect(block, seen);
                }
            }
        }
        collect(&script.commands, &mut seen);

        assert_eq!(seen.len() as u32, script.node_count);
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len());
    }

    #[test]
    fn test_syntax_error_is_reported_with_line() {
        let mut ehandler = CollectingErrorHandler::default();
        let result = parse_script("keep;\nnonsense $$$\n", &mut ehandler);

        assert!(matches!(result, Err(CompileError::Syntax { line: 2 })));
        assert_eq!(ehandler.errors.len(), 1);
        assert!(ehandler.errors[0].contains("syntax error"));
    }

    #[test]
    fn test_missing_semicolon() {
        let mut ehandler = CollectingErrorHandler::default();
        assert!(parse_script("keep", &mut ehandler).is_err());
    }
}
