//! nom-based line parser.
//!
//! Splits a wire line into prefix, command, and parameter slices without
//! allocating; [`Message`](crate::Message) builds its owned form on top.

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::opt,
    error::ErrorKind,
    sequence::preceded,
    IResult,
};

use crate::error::ParseError;

/// Middle parameters are capped at 14; the 15th and final parameter takes
/// the remainder of the line whether or not it carries the `:` marker.
const MAX_PARAMS: usize = 15;

/// A parsed line holding slices into the original input.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ParsedLine<'a> {
    pub prefix: Option<&'a str>,
    pub command: &'a str,
    pub params: Vec<&'a str>,
}

fn parse_prefix(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Command: all-alphabetic, or exactly three digits (a numeric).
fn parse_command(input: &str) -> IResult<&str, &str> {
    let (rest, cmd) = take_while1(|c: char| c.is_ascii_alphanumeric())(input)?;

    let is_word = cmd.chars().all(|c| c.is_ascii_alphabetic());
    let is_numeric = cmd.len() == 3 && cmd.chars().all(|c| c.is_ascii_digit());

    if is_word || is_numeric {
        Ok((rest, cmd))
    } else {
        Err(nom::Err::Error(nom::error::Error::new(
            input,
            ErrorKind::AlphaNumeric,
        )))
    }
}

/// Parse the parameter list following the command.
///
/// Runs of spaces separate parameters; a `:`-opened parameter is trailing
/// and runs to end of line. Once 14 middle parameters have been taken, the
/// remainder of the line becomes the final parameter even without `:`.
fn parse_params(input: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut rest = input;

    while rest.as_bytes().first() == Some(&b' ') {
        while rest.as_bytes().first() == Some(&b' ') {
            rest = &rest[1..];
        }

        if rest.is_empty() || rest.starts_with('\r') || rest.starts_with('\n') {
            break;
        }

        let line_end = rest.find(['\r', '\n']).unwrap_or(rest.len());

        if rest.starts_with(':') {
            params.push(&rest[1..line_end]);
            break;
        }

        if params.len() == MAX_PARAMS - 1 {
            params.push(&rest[..line_end]);
            break;
        }

        let end = rest.find([' ', '\r', '\n']).unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    params
}

pub(crate) fn parse_line(input: &str) -> Result<ParsedLine<'_>, ParseError> {
    let trimmed = input.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(ParseError::Empty);
    }

    let result: IResult<&str, (Option<&str>, &str)> = (|input| {
        let (input, prefix) = opt(parse_prefix)(input)?;
        let (input, _) = space0(input)?;
        let (input, command) = parse_command(input)?;
        Ok((input, (prefix, command)))
    })(trimmed);

    match result {
        Ok((rest, (prefix, command))) => {
            // Anything left after the parameters is a malformed line.
            let params = parse_params(rest);
            Ok(ParsedLine {
                prefix,
                command,
                params,
            })
        }
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            let position = trimmed.len() - e.input.len();
            match e.code {
                ErrorKind::AlphaNumeric => Err(ParseError::InvalidCommand { position }),
                _ => Err(ParseError::Malformed { position }),
            }
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Malformed {
            position: trimmed.len(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_command() {
        let line = parse_line("PING").unwrap();
        assert_eq!(line.command, "PING");
        assert!(line.prefix.is_none());
        assert!(line.params.is_empty());
    }

    #[test]
    fn prefix_and_trailing() {
        let line = parse_line(":8B4 SJOIN 500 #x +ns :@8B4AAAAAB 8B4AAAAAC\r\n").unwrap();
        assert_eq!(line.prefix, Some("8B4"));
        assert_eq!(line.command, "SJOIN");
        assert_eq!(
            line.params,
            vec!["500", "#x", "+ns", "@8B4AAAAAB 8B4AAAAAC"]
        );
    }

    #[test]
    fn numeric_command() {
        let line = parse_line(":hub.example 402 8B4AAAAAB no.such :No such server").unwrap();
        assert_eq!(line.command, "402");
        assert_eq!(line.params.len(), 3);
    }

    #[test]
    fn empty_trailing_kept() {
        let line = parse_line("AWAY :").unwrap();
        assert_eq!(line.params, vec![""]);
    }

    #[test]
    fn run_of_spaces_is_one_separator() {
        let line = parse_line("USER guest  0   * :Real Name").unwrap();
        assert_eq!(line.params, vec!["guest", "0", "*", "Real Name"]);
    }

    #[test]
    fn command_shape_enforced() {
        assert!(parse_line("PING2 x").is_err());
        assert!(parse_line("12 x").is_err());
        assert!(parse_line("1234 x").is_err());
        assert!(parse_line("123 x").is_ok());
    }

    #[test]
    fn fifteenth_param_takes_remainder() {
        let raw = "CMD p1 p2 p3 p4 p5 p6 p7 p8 p9 p10 p11 p12 p13 p14 p15 p16";
        let line = parse_line(raw).unwrap();
        assert_eq!(line.params.len(), 15);
        assert_eq!(line.params[14], "p15 p16");
    }

    #[test]
    fn empty_line_rejected() {
        assert_eq!(parse_line("\r\n"), Err(ParseError::Empty));
        assert_eq!(parse_line(""), Err(ParseError::Empty));
    }
}
