//! Nom-based IRC wire parser.
//!
//! Parses a single line (without the trailing CR LF) into a [`Command`],
//! applying the grammar `[@tags SP] [:source SP] verb (SP arg)* [SP
//! :trailing]`.

use std::collections::BTreeMap;

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, space0},
    combinator::opt,
    sequence::preceded,
    IResult,
};

use crate::error::{Error, Result};

use super::tags::{is_valid_tag_key, unescape_tag_value};
use super::{is_valid_verb, Command, CommandKind};

/// Parse IRCv3 message tags (the part after `@` and before the first space).
fn parse_tags_section(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_while1(|c| c != ' '))(input)
}

/// Parse the source prefix (the part after `:` and before the first space).
fn parse_source_section(input: &str) -> IResult<&str, &str> {
    preceded(char(':'), take_while1(|c| c != ' '))(input)
}

/// Parse the verb token. Charset validation happens separately, per kind.
fn parse_verb_token(input: &str) -> IResult<&str, &str> {
    take_while1(|c| c != ' ')(input)
}

/// Parse the remaining input into arguments, including an optional
/// trailing parameter. Runs of spaces act as a single separator.
fn parse_args(input: &str) -> (Vec<&str>, bool) {
    let mut args = Vec::new();
    let mut has_trailing = false;
    let mut rest = input;

    while rest.as_bytes().first() == Some(&b' ') {
        while rest.as_bytes().first() == Some(&b' ') {
            rest = &rest[1..];
        }
        if rest.is_empty() {
            break;
        }
        if let Some(trailing) = rest.strip_prefix(':') {
            args.push(trailing);
            has_trailing = true;
            break;
        }
        let end = rest.find(' ').unwrap_or(rest.len());
        args.push(&rest[..end]);
        rest = &rest[end..];
    }

    (args, has_trailing)
}

struct RawParts<'a> {
    tags: Option<&'a str>,
    source: Option<&'a str>,
    verb: &'a str,
    args: Vec<&'a str>,
    has_trailing: bool,
}

fn parse_raw(input: &str) -> Result<RawParts<'_>> {
    let invalid = |what: &str| Error::InvalidMessage(format!("{}: {:?}", what, input));

    let (rest, tags) = opt(parse_tags_section)(input)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("bad tags"))?;
    let (rest, _) = space0::<_, nom::error::Error<&str>>(rest).map_err(|_| invalid("bad tags"))?;

    let (rest, source) = opt(parse_source_section)(rest)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("bad source"))?;
    let (rest, _) = space0::<_, nom::error::Error<&str>>(rest).map_err(|_| invalid("bad source"))?;

    let (rest, verb) =
        parse_verb_token(rest).map_err(|_: nom::Err<nom::error::Error<&str>>| invalid("missing verb"))?;

    let (args, has_trailing) = parse_args(rest);

    Ok(RawParts {
        tags,
        source,
        verb,
        args,
        has_trailing,
    })
}

fn parse_tag_map(raw: &str, line: &str) -> Result<BTreeMap<String, Option<String>>> {
    let mut map = BTreeMap::new();
    for item in raw.split(';') {
        if item.is_empty() {
            return Err(Error::InvalidMessage(format!("empty tag in {:?}", line)));
        }
        let (key, value) = match item.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (item, None),
        };
        if !is_valid_tag_key(key) {
            return Err(Error::InvalidMessage(format!(
                "invalid tag key {:?} in {:?}",
                key, line
            )));
        }
        // `=`-empty values normalise to absent (also when the unescaped
        // form ends up empty); duplicate keys keep the last occurrence.
        let value = value
            .map(unescape_tag_value)
            .filter(|v| !v.is_empty());
        map.insert(key.to_string(), value);
    }
    Ok(map)
}

impl Command {
    /// Parse a wire line (without CR LF) into a command.
    ///
    /// `kind` selects the verb grammar and the applicable tag budget for
    /// later serialization. Fails with [`Error::InvalidMessage`] when the
    /// line does not match the grammar.
    ///
    /// # Examples
    ///
    /// ```
    /// use slirc_client::command::{Command, CommandKind};
    ///
    /// let cmd = Command::parse(
    ///     CommandKind::Server,
    ///     ":nick!user@host PRIVMSG #chan :hello world",
    /// )
    /// .unwrap();
    /// assert_eq!(cmd.verb(), "PRIVMSG");
    /// assert_eq!(cmd.args(), &["#chan", "hello world"]);
    /// ```
    pub fn parse(kind: CommandKind, line: &str) -> Result<Self> {
        if line.is_empty() {
            return Err(Error::InvalidMessage("empty line".to_string()));
        }
        if line.contains(['\r', '\n', '\0']) {
            return Err(Error::InvalidMessage(format!(
                "control character in line {:?}",
                line
            )));
        }

        let raw = parse_raw(line)?;

        if !is_valid_verb(kind, raw.verb) {
            return Err(Error::InvalidMessage(format!(
                "invalid verb {:?} in {:?}",
                raw.verb, line
            )));
        }

        let tags = match raw.tags {
            Some(t) => parse_tag_map(t, line)?,
            None => BTreeMap::new(),
        };

        Ok(Command::from_parts(
            kind,
            raw.source.map(str::to_string),
            raw.verb.to_ascii_uppercase(),
            raw.args.into_iter().map(str::to_string).collect(),
            tags,
            raw.has_trailing,
        ))
    }
}
