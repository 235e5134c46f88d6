//! Outgoing PRIVMSG/NOTICE preparation.
//!
//! Splits message text into wire-sized pieces (word boundaries preferred,
//! codepoint-safe hard breaks otherwise), chooses the `CPRIVMSG`/`CNOTICE`
//! variants when the server offers them, and wraps multi-piece output in a
//! `draft/multiline` batch when negotiated.

use std::collections::BTreeMap;

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::command::{Command, CommandOptions};
use crate::error::{Error, Result};
use crate::state::NetworkState;
use crate::util::split_words;

/// Outgoing message verb family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    /// `PRIVMSG` (or `CPRIVMSG`).
    Message,
    /// `NOTICE` (or `CNOTICE`).
    Notice,
}

impl MessageKind {
    fn verb(self) -> &'static str {
        match self {
            Self::Message => "PRIVMSG",
            Self::Notice => "NOTICE",
        }
    }

    fn c_verb(self) -> &'static str {
        match self {
            Self::Message => "CPRIVMSG",
            Self::Notice => "CNOTICE",
        }
    }
}

struct Piece {
    text: String,
    /// Produced by splitting one over-long logical line; marked with
    /// `draft/multiline-concat` inside a batch.
    continuation: bool,
}

/// Prepare `text` for `target` as one or more ready-to-send commands.
pub(crate) fn prepare_message(
    state: &NetworkState,
    kind: MessageKind,
    target: &str,
    text: &str,
    tags: &BTreeMap<String, Option<String>>,
    shared_channel: Option<&str>,
) -> Result<Vec<Command>> {
    // CPRIVMSG/CNOTICE bypass server-side flood penalties when we share a
    // channel with the target; use them when advertised.
    let use_c_variant =
        shared_channel.is_some() && state.isupport(kind.c_verb()).is_some();
    let verb = if use_c_variant {
        kind.c_verb()
    } else {
        kind.verb()
    };
    let shared = if use_c_variant { shared_channel } else { None };

    let line_limit = state.limits().line_length;
    let hostmask = state.self_user().hostmask();
    let reserve = 21
        + hostmask.len()
        + verb.len()
        + target.len()
        + shared.map_or(0, |s| 1 + s.len());
    let max_len = line_limit
        .checked_sub(reserve)
        .filter(|n| *n > 0)
        .ok_or_else(|| {
            Error::InvalidArgument(format!("target {:?} leaves no room for text", target))
        })?;

    let mut pieces = Vec::new();
    for line in text.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            pieces.push(Piece {
                text: String::new(),
                continuation: false,
            });
            continue;
        }
        for (i, part) in split_words(line, max_len).enumerate() {
            pieces.push(Piece {
                text: part.to_string(),
                continuation: i > 0,
            });
        }
    }
    if pieces.is_empty() {
        pieces.push(Piece {
            text: String::new(),
            continuation: false,
        });
    }

    let codec = CommandOptions::new().with_line_length(line_limit)?;

    let multiline = multiline_limits(state, max_len).filter(|_| pieces.len() > 1);
    let Some((max_bytes, max_lines)) = multiline else {
        return pieces
            .iter()
            .map(|piece| build_piece(verb, shared, target, &piece.text, tags, None, false, &codec))
            .collect();
    };

    // Group pieces into batches bounded by the advertised limits.
    let mut commands = Vec::new();
    let mut batch: Vec<&Piece> = Vec::new();
    let mut batch_bytes = 0usize;
    for piece in &pieces {
        if !batch.is_empty()
            && (batch.len() + 1 > max_lines || batch_bytes + piece.text.len() > max_bytes)
        {
            flush_batch(&mut commands, &batch, verb, shared, target, tags, &codec)?;
            batch.clear();
            batch_bytes = 0;
        }
        batch.push(piece);
        batch_bytes += piece.text.len();
    }
    if !batch.is_empty() {
        flush_batch(&mut commands, &batch, verb, shared, target, tags, &codec)?;
    }
    Ok(commands)
}

/// The negotiated `draft/multiline` limits, or `None` when multiline is
/// unavailable or not worth using (limits at or below a single line).
fn multiline_limits(state: &NetworkState, max_len: usize) -> Option<(usize, usize)> {
    let (enabled, value) = state.cap_enabled("draft/multiline");
    if !enabled || !state.cap_enabled("batch").0 {
        return None;
    }
    let mut max_bytes = usize::MAX;
    let mut max_lines = usize::MAX;
    for part in value.unwrap_or("").split(',') {
        match part.split_once('=') {
            Some(("max-bytes", v)) => max_bytes = v.parse().unwrap_or(usize::MAX),
            Some(("max-lines", v)) => max_lines = v.parse().unwrap_or(usize::MAX),
            _ => {}
        }
    }
    if max_bytes <= max_len || max_lines <= 1 {
        return None;
    }
    Some((max_bytes, max_lines))
}

fn flush_batch(
    commands: &mut Vec<Command>,
    batch: &[&Piece],
    verb: &str,
    shared: Option<&str>,
    target: &str,
    tags: &BTreeMap<String, Option<String>>,
    codec: &CommandOptions,
) -> Result<()> {
    let reference = generate_batch_ref();
    commands.push(
        Command::client("BATCH")
            .arg(format!("+{}", reference))
            .arg("draft/multiline")
            .arg(target)
            .build(codec)?,
    );
    for piece in batch {
        commands.push(build_piece(
            verb,
            shared,
            target,
            &piece.text,
            tags,
            Some(&reference),
            piece.continuation,
            codec,
        )?);
    }
    commands.push(
        Command::client("BATCH")
            .arg(format!("-{}", reference))
            .build(codec)?,
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn build_piece(
    verb: &str,
    shared: Option<&str>,
    target: &str,
    text: &str,
    tags: &BTreeMap<String, Option<String>>,
    batch: Option<&str>,
    continuation: bool,
    codec: &CommandOptions,
) -> Result<Command> {
    let mut builder = Command::client(verb);
    if let Some(shared) = shared {
        builder = builder.arg(shared);
    }
    builder = builder.arg(target).arg(text);
    for (key, value) in tags {
        builder = builder.tag(key, value.as_deref());
    }
    if let Some(reference) = batch {
        builder = builder.tag("batch", Some(reference));
        if continuation {
            builder = builder.tag("draft/multiline-concat", None::<String>);
        }
    }
    builder.build(codec)
}

fn generate_batch_ref() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> NetworkState {
        NetworkState::new("testnet", "me")
    }

    fn multiline_state(max_bytes: usize, max_lines: usize) -> NetworkState {
        state()
            .with_cap_supported(
                "draft/multiline",
                Some(&format!("max-bytes={},max-lines={}", max_bytes, max_lines)),
            )
            .with_cap_enabled("draft/multiline")
            .with_cap_supported("batch", None)
            .with_cap_enabled("batch")
    }

    fn no_tags() -> BTreeMap<String, Option<String>> {
        BTreeMap::new()
    }

    #[test]
    fn test_single_short_message() {
        let cmds =
            prepare_message(&state(), MessageKind::Message, "#c", "hello", &no_tags(), None)
                .unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].to_wire(), "PRIVMSG #c hello");
    }

    #[test]
    fn test_notice_verb() {
        let cmds =
            prepare_message(&state(), MessageKind::Notice, "nick", "hi there", &no_tags(), None)
                .unwrap();
        assert_eq!(cmds[0].verb(), "NOTICE");
    }

    #[test]
    fn test_long_line_splits_within_budget() {
        let st = state();
        let text = "word ".repeat(300);
        let cmds = prepare_message(&st, MessageKind::Message, "#c", text.trim_end(), &no_tags(), None)
            .unwrap();
        assert!(cmds.len() > 1);
        let limit = st.limits().line_length - 2;
        for cmd in &cmds {
            assert!(cmd.command_part().len() <= limit);
            assert_eq!(cmd.verb(), "PRIVMSG");
        }
    }

    #[test]
    fn test_cprivmsg_selection() {
        let st = state().with_isupport_token("CPRIVMSG");
        let cmds = prepare_message(
            &st,
            MessageKind::Message,
            "nick",
            "hi",
            &no_tags(),
            Some("#shared"),
        )
        .unwrap();
        assert_eq!(cmds[0].to_wire(), "CPRIVMSG #shared nick hi");

        // Without the ISUPPORT token the plain verb is used.
        let cmds = prepare_message(
            &state(),
            MessageKind::Message,
            "nick",
            "hi",
            &no_tags(),
            Some("#shared"),
        )
        .unwrap();
        assert_eq!(cmds[0].to_wire(), "PRIVMSG nick hi");
    }

    #[test]
    fn test_multiline_batches_split_on_max_lines() {
        let st = multiline_state(512, 3);
        let cmds = prepare_message(
            &st,
            MessageKind::Message,
            "#c",
            "one\ntwo\nthree\nfour\nfive",
            &no_tags(),
            None,
        )
        .unwrap();
        // Two batches: 3 + 2 messages, each fenced by BATCH commands.
        assert_eq!(cmds.len(), 9);
        assert_eq!(cmds[0].verb(), "BATCH");
        assert!(cmds[0].arg(0).unwrap().starts_with('+'));
        assert_eq!(cmds[0].arg(1), Some("draft/multiline"));
        assert_eq!(cmds[0].arg(2), Some("#c"));
        assert_eq!(cmds[4].verb(), "BATCH");
        assert!(cmds[4].arg(0).unwrap().starts_with('-'));

        let first_ref = cmds[0].arg(0).unwrap()[1..].to_string();
        for cmd in &cmds[1..4] {
            assert_eq!(cmd.verb(), "PRIVMSG");
            assert_eq!(cmd.tag("batch"), Some(Some(first_ref.as_str())));
            // Hard newlines are separate lines, not soft continuations.
            assert_eq!(cmd.tag("draft/multiline-concat"), None);
        }

        let second_ref = cmds[5].arg(0).unwrap()[1..].to_string();
        assert_ne!(first_ref, second_ref);
        assert_eq!(cmds.last().unwrap().arg(0).unwrap(), &format!("-{}", second_ref));
    }

    #[test]
    fn test_multiline_concat_marks_soft_breaks() {
        let st = multiline_state(4096, 24);
        let text = "word ".repeat(300);
        let cmds = prepare_message(&st, MessageKind::Message, "#c", text.trim_end(), &no_tags(), None)
            .unwrap();
        let privmsgs: Vec<_> = cmds.iter().filter(|c| c.verb() == "PRIVMSG").collect();
        assert!(privmsgs.len() > 1);
        assert_eq!(privmsgs[0].tag("draft/multiline-concat"), None);
        for cmd in &privmsgs[1..] {
            assert_eq!(cmd.tag("draft/multiline-concat"), Some(None));
        }
    }

    #[test]
    fn test_multiline_ignored_when_limits_too_small() {
        // max-lines=1 makes batching pointless.
        let st = multiline_state(4096, 1);
        let cmds =
            prepare_message(&st, MessageKind::Message, "#c", "a\nb", &no_tags(), None).unwrap();
        assert!(cmds.iter().all(|c| c.verb() == "PRIVMSG"));
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn test_single_piece_skips_batch() {
        let st = multiline_state(4096, 24);
        let cmds =
            prepare_message(&st, MessageKind::Message, "#c", "just one", &no_tags(), None).unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].verb(), "PRIVMSG");
    }

    #[test]
    fn test_user_tags_carried() {
        let mut tags = BTreeMap::new();
        tags.insert("+draft/reply".to_string(), Some("id1".to_string()));
        let cmds =
            prepare_message(&state(), MessageKind::Message, "#c", "hi", &tags, None).unwrap();
        assert_eq!(cmds[0].tag("+draft/reply"), Some(Some("id1")));
    }

    #[test]
    fn test_oversized_target_rejected() {
        let st = state();
        let target = "#".repeat(600);
        let err = prepare_message(&st, MessageKind::Message, &target, "hi", &no_tags(), None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
