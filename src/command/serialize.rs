//! Command serialization.
//!
//! A command serializes into two fragments: the prefixed command part
//! (`:source VERB args… [:trailing]`) and the tag part (`@k1=v1;k2`).
//! Budget enforcement happens at construction time; the serializers here
//! are infallible.

use std::fmt;

use crate::error::{Error, Result};

use super::tags::escape_tag_value_string;
use super::{Command, CommandKind, CommandOptions};

impl Command {
    /// Serialize the prefixed command part: `:source VERB args…
    /// [:trailing]`, without tags and without CR LF.
    pub fn command_part(&self) -> String {
        let mut out = String::with_capacity(64);
        if let Some(ref source) = self.source {
            out.push(':');
            out.push_str(source);
            out.push(' ');
        }
        out.push_str(&self.verb);

        let last = self.args.len().checked_sub(1);
        for (i, arg) in self.args.iter().enumerate() {
            out.push(' ');
            if Some(i) == last && self.arg_is_trailing(arg) {
                out.push(':');
            }
            out.push_str(arg);
        }
        out
    }

    /// Serialize the tag part (`@k1=v1;k2`), or `None` when the command
    /// carries no tags. Keys are emitted in sorted order.
    pub fn tag_part(&self) -> Option<String> {
        if self.tags.is_empty() {
            return None;
        }
        let mut out = String::with_capacity(32);
        out.push('@');
        for (i, (key, value)) in self.tags.iter().enumerate() {
            if i > 0 {
                out.push(';');
            }
            out.push_str(key);
            if let Some(value) = value {
                out.push('=');
                out.push_str(&escape_tag_value_string(value));
            }
        }
        Some(out)
    }

    /// The full wire form (tag part, space, command part), without CR LF.
    pub fn to_wire(&self) -> String {
        match self.tag_part() {
            Some(tags) => format!("{} {}", tags, self.command_part()),
            None => self.command_part(),
        }
    }

    fn arg_is_trailing(&self, arg: &str) -> bool {
        self.has_trailing || arg.is_empty() || arg.starts_with(':') || arg.contains(' ')
    }

    /// Enforce the construction budgets against this command's serialized
    /// fragments.
    pub(crate) fn check_budgets(&self, options: &CommandOptions) -> Result<()> {
        // Reserve two bytes for CR LF.
        let line_budget = options.line_length() - 2;
        let part = self.command_part();
        if part.len() > line_budget {
            return Err(Error::CommandTooLong {
                part: "command",
                len: part.len(),
                budget: line_budget,
            });
        }
        if let Some(tag_part) = self.tag_part() {
            let tag_budget = match self.kind {
                CommandKind::Server => options.server_tag_length(),
                CommandKind::Client | CommandKind::Bot => options.client_tag_length(),
            };
            if tag_part.len() > tag_budget {
                return Err(Error::CommandTooLong {
                    part: "tags",
                    len: tag_part.len(),
                    budget: tag_budget,
                });
            }
        }
        Ok(())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}
