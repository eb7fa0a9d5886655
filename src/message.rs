//! Parsing of framed protocol lines.
//!
//! The listener only needs the command and parameters of a line to drive
//! registration and SASL; everything else is passed through to the sink
//! untouched.
//!
//! ```text
//! [@tags] [:prefix] <command> [params...] [:trailing]
//! ```

use nom::{
    bytes::complete::{take_till1, take_while1},
    character::complete::{char, space0},
    combinator::opt,
    error::{context, VerboseError},
    sequence::preceded,
    IResult,
};

type ParseResult<I, O> = IResult<I, O, VerboseError<I>>;

/// A parsed line with owned fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Raw tags without the leading `@`.
    pub tags: Option<String>,
    /// Source without the leading `:`.
    pub prefix: Option<String>,
    /// Command name or three-digit numeric.
    pub command: String,
    /// Parameters, trailing last.
    pub params: Vec<String>,
}

impl Message {
    /// Parse one line (without its terminator).
    ///
    /// Returns `None` for input that has no command.
    pub fn parse(line: &str) -> Option<Self> {
        let (_, (tags, prefix, command, params)) = parse_line(line).ok()?;
        Some(Self {
            tags: tags.map(str::to_owned),
            prefix: prefix.map(str::to_owned),
            command: command.to_ascii_uppercase(),
            params: params.into_iter().map(str::to_owned).collect(),
        })
    }

    /// Parameter at `index`, if present.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }

    /// Last parameter, usually the trailing text.
    pub fn trailing(&self) -> Option<&str> {
        self.params.last().map(String::as_str)
    }

    /// Nickname part of the prefix.
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .map(|p| p.split(['!', '@']).next().unwrap_or(p))
    }

    /// True for three-digit numeric replies.
    pub fn is_numeric(&self) -> bool {
        self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit())
    }
}

impl std::fmt::Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(tags) = &self.tags {
            write!(f, "@{} ", tags)?;
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        if let Some((last, middle)) = self.params.split_last() {
            for param in middle {
                write!(f, " {}", param)?;
            }
            if last.is_empty() || last.contains(' ') || last.starts_with(':') {
                write!(f, " :{}", last)?;
            } else {
                write!(f, " {}", last)?;
            }
        }
        Ok(())
    }
}

fn parse_tags(input: &str) -> ParseResult<&str, &str> {
    context(
        "parsing message tags",
        preceded(char('@'), take_till1(|c: char| c == ' ')),
    )(input)
}

fn parse_prefix(input: &str) -> ParseResult<&str, &str> {
    context(
        "parsing message prefix",
        preceded(char(':'), take_till1(|c: char| c == ' ')),
    )(input)
}

fn parse_command(input: &str) -> ParseResult<&str, &str> {
    context(
        "parsing command",
        take_while1(|c: char| c.is_ascii_alphanumeric()),
    )(input)
}

type Parts<'a> = (Option<&'a str>, Option<&'a str>, &'a str, Vec<&'a str>);

fn parse_line(input: &str) -> ParseResult<&str, Parts<'_>> {
    let (input, _) = space0::<_, VerboseError<&str>>(input)?;
    let (input, tags) = opt(parse_tags)(input)?;
    let (input, _) = space0::<_, VerboseError<&str>>(input)?;
    let (input, prefix) = opt(parse_prefix)(input)?;
    let (input, _) = space0::<_, VerboseError<&str>>(input)?;
    let (mut rest, command) = parse_command(input)?;

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            params.push(trailing);
            rest = "";
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        params.push(&rest[..end]);
        rest = &rest[end..];
    }

    Ok((rest, (tags, prefix, command, params)))
}
