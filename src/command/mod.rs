//! IRC command codec.
//!
//! A [`Command`] is the atomic protocol unit: an optional source, a verb,
//! ordered arguments, and a map of IRCv3 message tags. Commands are parsed
//! from single wire lines (without the trailing CR LF) and serialize back
//! into two fragments: the prefixed command part (`:source VERB args…
//! [:trailing]`) and the tag part (`@k1=v1;k2`).
//!
//! # Reference
//! - RFC 2812: Internet Relay Chat: Client Protocol
//! - IRCv3 message-tags: <https://ircv3.net/specs/extensions/message-tags>

mod parse;
mod serialize;
pub mod tags;

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// RFC minimum for the command-part line budget (bytes, including CR LF).
pub const MIN_LINE_LENGTH: usize = 512;
/// RFC minimum for client-originated tag data (bytes).
pub const MIN_CLIENT_TAG_LENGTH: usize = 4096;
/// RFC minimum for server-originated tag data (bytes).
pub const MIN_SERVER_TAG_LENGTH: usize = 8191;

/// Who a command is attributed to, for grammar and budget selection.
///
/// `Bot` exists only at the codec surface: it widens the verb grammar to
/// `[A-Za-z0-9_]+` but is otherwise treated exactly like `Client`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// A command received from (or attributed to) the server.
    Server,
    /// A command originated by this client.
    #[default]
    Client,
    /// A client command with a widened verb charset.
    Bot,
}

/// Length budgets applied when constructing commands.
///
/// Budgets may be raised above the RFC minima (e.g. from ISUPPORT
/// `LINELEN`) but never lowered below them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandOptions {
    line_length: usize,
    client_tag_length: usize,
    server_tag_length: usize,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            line_length: MIN_LINE_LENGTH,
            client_tag_length: MIN_CLIENT_TAG_LENGTH,
            server_tag_length: MIN_SERVER_TAG_LENGTH,
        }
    }
}

impl CommandOptions {
    /// Budgets at the RFC minima.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the command-part budget. Values below 512 are rejected.
    pub fn with_line_length(mut self, bytes: usize) -> Result<Self> {
        if bytes < MIN_LINE_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "line length budget {} below RFC minimum {}",
                bytes, MIN_LINE_LENGTH
            )));
        }
        self.line_length = bytes;
        Ok(self)
    }

    /// Set the client tag budget. Values below 4096 are rejected.
    pub fn with_client_tag_length(mut self, bytes: usize) -> Result<Self> {
        if bytes < MIN_CLIENT_TAG_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "client tag budget {} below RFC minimum {}",
                bytes, MIN_CLIENT_TAG_LENGTH
            )));
        }
        self.client_tag_length = bytes;
        Ok(self)
    }

    /// Set the server tag budget. Values below 8191 are rejected.
    pub fn with_server_tag_length(mut self, bytes: usize) -> Result<Self> {
        if bytes < MIN_SERVER_TAG_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "server tag budget {} below RFC minimum {}",
                bytes, MIN_SERVER_TAG_LENGTH
            )));
        }
        self.server_tag_length = bytes;
        Ok(self)
    }

    /// The command-part budget in bytes, including CR LF.
    pub fn line_length(&self) -> usize {
        self.line_length
    }

    /// The client tag budget in bytes.
    pub fn client_tag_length(&self) -> usize {
        self.client_tag_length
    }

    /// The server tag budget in bytes.
    pub fn server_tag_length(&self) -> usize {
        self.server_tag_length
    }
}

/// A structured IRC command.
///
/// Tag values are stored unescaped; the wire escape layer is applied only
/// at serialization. Keys are unique; key order on the wire is
/// deterministic (sorted) but consumers must only rely on key-set
/// equality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    source: Option<String>,
    verb: String,
    args: Vec<String>,
    tags: BTreeMap<String, Option<String>>,
    has_trailing: bool,
}

impl Command {
    /// Start building a command of the given kind.
    pub fn builder(kind: CommandKind, verb: impl Into<String>) -> CommandBuilder {
        CommandBuilder {
            kind,
            source: None,
            verb: verb.into(),
            args: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    /// Shorthand for a client-kind builder.
    pub fn client(verb: impl Into<String>) -> CommandBuilder {
        Self::builder(CommandKind::Client, verb)
    }

    /// The kind this command was parsed or built as.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// The source (hostmask or server name), if any.
    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// The nick portion of the source, up to the first `!`.
    pub fn source_nick(&self) -> Option<&str> {
        self.source
            .as_deref()
            .map(|s| s.split_once('!').map_or(s, |(nick, _)| nick))
    }

    /// The verb, uppercased for letter verbs.
    pub fn verb(&self) -> &str {
        &self.verb
    }

    /// All arguments in order.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// The argument at `index`, if present.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    /// Whether the final argument was (or will be) carried as trailing.
    pub fn has_trailing(&self) -> bool {
        self.has_trailing
    }

    /// Whether the verb is an error numeric (4xx or 5xx).
    pub fn is_error_numeric(&self) -> bool {
        let bytes = self.verb.as_bytes();
        bytes.len() == 3
            && matches!(bytes[0], b'4' | b'5')
            && bytes.iter().all(u8::is_ascii_digit)
    }

    /// The tag map. Values are unescaped.
    pub fn tags(&self) -> &BTreeMap<String, Option<String>> {
        &self.tags
    }

    /// Look up a tag: `None` if absent, `Some(None)` for a valueless tag.
    pub fn tag(&self, key: &str) -> Option<Option<&str>> {
        self.tags.get(key).map(|v| v.as_deref())
    }

    /// Replace the source, validating its charset. The trailing flag and
    /// everything else is preserved.
    pub fn with_source(mut self, source: Option<String>) -> Result<Self> {
        if let Some(ref src) = source {
            validate_source(src)?;
        }
        self.source = source;
        Ok(self)
    }

    pub(crate) fn from_parts(
        kind: CommandKind,
        source: Option<String>,
        verb: String,
        args: Vec<String>,
        tags: BTreeMap<String, Option<String>>,
        has_trailing: bool,
    ) -> Self {
        Self {
            kind,
            source,
            verb,
            args,
            tags,
            has_trailing,
        }
    }
}

/// Builder for [`Command`] values.
///
/// `build` performs all structural validation and budget enforcement.
#[derive(Clone, Debug)]
pub struct CommandBuilder {
    kind: CommandKind,
    source: Option<String>,
    verb: String,
    args: Vec<String>,
    tags: BTreeMap<String, Option<String>>,
}

impl CommandBuilder {
    /// Set the source prefix.
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append an optional argument; `None` entries are dropped.
    pub fn opt_arg(mut self, arg: Option<impl Into<String>>) -> Self {
        if let Some(arg) = arg {
            self.args.push(arg.into());
        }
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set a tag. An empty-string value normalises to a valueless tag.
    pub fn tag(mut self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        let value = value.map(Into::into).filter(|v| !v.is_empty());
        self.tags.insert(key.into(), value);
        self
    }

    /// Validate and produce the command, enforcing `options` budgets.
    pub fn build(self, options: &CommandOptions) -> Result<Command> {
        let verb = normalize_verb(self.kind, &self.verb)?;

        if let Some(ref src) = self.source {
            validate_source(src)?;
        }

        let last = self.args.len().checked_sub(1);
        for (i, arg) in self.args.iter().enumerate() {
            if arg.contains(['\r', '\n', '\0']) {
                return Err(Error::InvalidArgument(format!(
                    "argument {:?} contains a forbidden control character",
                    arg
                )));
            }
            let needs_trailing = arg.is_empty() || arg.starts_with(':') || arg.contains(' ');
            if needs_trailing && Some(i) != last {
                return Err(Error::InvalidArgument(format!(
                    "argument {:?} must be the final argument",
                    arg
                )));
            }
        }

        for key in self.tags.keys() {
            if !tags::is_valid_tag_key(key) {
                return Err(Error::InvalidArgument(format!("invalid tag key {:?}", key)));
            }
        }

        let has_trailing = self
            .args
            .last()
            .map(|a| a.is_empty() || a.starts_with(':') || a.contains(' '))
            .unwrap_or(false);

        let command = Command {
            kind: self.kind,
            source: self.source,
            verb,
            args: self.args,
            tags: self.tags,
            has_trailing,
        };
        command.check_budgets(options)?;
        Ok(command)
    }
}

fn normalize_verb(kind: CommandKind, verb: &str) -> Result<String> {
    if !is_valid_verb(kind, verb) {
        return Err(Error::InvalidArgument(format!("invalid verb {:?}", verb)));
    }
    Ok(verb.to_ascii_uppercase())
}

pub(crate) fn is_valid_verb(kind: CommandKind, verb: &str) -> bool {
    if verb.is_empty() {
        return false;
    }
    let numeric = verb.len() == 3 && verb.bytes().all(|b| b.is_ascii_digit());
    match kind {
        CommandKind::Server | CommandKind::Client => {
            numeric || verb.bytes().all(|b| b.is_ascii_alphabetic())
        }
        CommandKind::Bot => {
            numeric || verb.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
        }
    }
}

pub(crate) fn validate_source(source: &str) -> Result<()> {
    if source.is_empty() || source.contains([' ', '\r', '\n', '\0']) {
        return Err(Error::InvalidArgument(format!(
            "invalid source {:?}",
            source
        )));
    }
    Ok(())
}
