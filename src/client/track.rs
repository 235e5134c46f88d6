//! Post-registration message handling: state effects.
//!
//! [`apply`] folds one inbound command into the network state, producing a
//! replacement state and any protocol-mandated replies (PONG). It is pure
//! with respect to I/O so the effects can be tested without a connection.

use tracing::{debug, warn};

use crate::command::Command;
use crate::error::{Error, Result};
use crate::isupport::ChanModeClass;
use crate::state::{NetworkState, UserId};

/// Minimum argument counts for verbs the engine interprets. Messages
/// below the minimum are logged and dropped before reaching subscribers.
const MIN_ARITY: &[(&str, usize)] = &[
    ("001", 1),
    ("005", 2),
    ("221", 2),
    ("315", 1),
    ("332", 3),
    ("352", 8),
    ("353", 4),
    ("432", 2),
    ("433", 2),
    ("900", 3),
    ("ACCOUNT", 1),
    ("AUTHENTICATE", 1),
    ("CAP", 2),
    ("CHGHOST", 2),
    ("ERROR", 1),
    ("JOIN", 1),
    ("KICK", 2),
    ("MODE", 2),
    ("NICK", 1),
    ("NOTICE", 2),
    ("PART", 1),
    ("PING", 1),
    ("PONG", 1),
    ("PRIVMSG", 2),
    ("RENAME", 2),
    ("SETNAME", 1),
    ("TOPIC", 2),
];

/// Minimum arity for `verb`, when known.
pub(crate) fn min_arity(verb: &str) -> Option<usize> {
    MIN_ARITY
        .iter()
        .find(|(v, _)| *v == verb)
        .map(|(_, n)| *n)
}

/// State replacement and replies produced by one inbound command.
#[derive(Default, Debug)]
pub(crate) struct TrackOutcome {
    pub state: Option<NetworkState>,
    pub sends: Vec<String>,
}

/// Fold `cmd` into `state`.
///
/// Fails with [`Error::ProtocolViolation`] for malformed sub-protocol
/// content and [`Error::BadState`] when the state cannot absorb the
/// change; the caller decides whether to surface or drop.
pub(crate) fn apply(state: &NetworkState, cmd: &Command) -> Result<TrackOutcome> {
    let mut out = TrackOutcome::default();
    match cmd.verb() {
        "001" => handle_welcome(state, cmd, &mut out)?,
        "005" => handle_isupport(state, cmd, &mut out),
        "221" => handle_umode_reply(state, cmd, &mut out)?,
        "332" => handle_topic_reply(state, cmd, &mut out)?,
        "352" => handle_who_reply(state, cmd, &mut out)?,
        "353" => handle_names_reply(state, cmd, &mut out)?,
        "JOIN" => handle_join(state, cmd, &mut out)?,
        "PART" => handle_part(state, cmd.source_nick(), cmd.arg(0), &mut out)?,
        "KICK" => handle_part(state, cmd.arg(1), cmd.arg(0), &mut out)?,
        "NICK" => handle_nick(state, cmd, &mut out)?,
        "RENAME" => handle_rename(state, cmd, &mut out)?,
        "ACCOUNT" => handle_account(state, cmd, &mut out)?,
        "AWAY" => handle_away(state, cmd, &mut out)?,
        "CHGHOST" => handle_chghost(state, cmd, &mut out)?,
        "SETNAME" => handle_setname(state, cmd, &mut out)?,
        "TOPIC" => handle_topic(state, cmd, &mut out)?,
        "QUIT" => handle_quit(state, cmd, &mut out)?,
        "MODE" => handle_mode(state, cmd, &mut out)?,
        "PING" => handle_ping(cmd, &mut out),
        "ERROR" => {
            warn!(reason = cmd.arg(0).unwrap_or(""), "server sent ERROR");
        }
        _ => {}
    }
    Ok(out)
}

fn source_parts(cmd: &Command) -> Option<(&str, Option<&str>, Option<&str>)> {
    let source = cmd.source()?;
    match source.split_once('!') {
        Some((nick, rest)) => match rest.split_once('@') {
            Some((ident, host)) => Some((nick, Some(ident), Some(host))),
            None => Some((nick, Some(rest), None)),
        },
        None => Some((source, None, None)),
    }
}

fn upsert_user(
    state: NetworkState,
    nick: &str,
    ident: Option<&str>,
    host: Option<&str>,
) -> Result<(NetworkState, UserId)> {
    let (state, id) = match state.user_by_nick(nick) {
        Some(user) => (state.clone(), user.id),
        None => state.with_user_added(nick)?,
    };
    let state = state.with_user_updated(id, |u| {
        if let Some(ident) = ident {
            u.ident = ident.to_string();
        }
        if let Some(host) = host {
            u.host = host.to_string();
        }
    })?;
    Ok((state, id))
}

fn handle_welcome(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let assigned = cmd.arg(0).unwrap_or("");
    if !assigned.is_empty() && assigned != state.self_user().nick {
        out.state = Some(state.with_user_updated(state.self_id(), |u| {
            u.nick = assigned.to_string();
        })?);
    }
    Ok(())
}

fn handle_isupport(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) {
    let args = cmd.args();
    let end = if cmd.has_trailing() {
        args.len().saturating_sub(1)
    } else {
        args.len()
    };
    let mut working = state.clone();
    for token in &args[1..end] {
        working = working.with_isupport_token(token);
    }
    out.state = Some(working);
}

fn handle_umode_reply(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let modes = cmd.arg(1).unwrap_or("");
    let mut collected = std::collections::BTreeSet::new();
    let mut adding = true;
    for c in modes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            c if adding => {
                collected.insert(c);
            }
            _ => {}
        }
    }
    out.state = Some(state.with_user_updated(state.self_id(), |u| {
        u.modes = collected;
    })?);
    Ok(())
}

fn handle_topic_reply(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let (name, topic) = (cmd.arg(1).unwrap_or(""), cmd.arg(2).unwrap_or(""));
    if let Some(chan) = state.channel(name) {
        let id = chan.id;
        let topic = topic.to_string();
        out.state = Some(state.with_channel_updated(id, move |c| c.topic = topic)?);
    }
    Ok(())
}

fn handle_topic(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let (name, topic) = (cmd.arg(0).unwrap_or(""), cmd.arg(1).unwrap_or(""));
    if let Some(chan) = state.channel(name) {
        let id = chan.id;
        let topic = topic.to_string();
        out.state = Some(state.with_channel_updated(id, move |c| c.topic = topic)?);
    }
    Ok(())
}

fn handle_who_reply(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let channel = cmd.arg(1).unwrap_or("*");
    let ident = cmd.arg(2).unwrap_or("");
    let host = cmd.arg(3).unwrap_or("");
    let nick = cmd.arg(5).unwrap_or("");
    let flags = cmd.arg(6).unwrap_or("");
    // The trailing argument is "<hops> <realname>".
    let realname = cmd
        .arg(7)
        .and_then(|t| t.split_once(' ').map(|(_, r)| r))
        .unwrap_or("");
    if nick.is_empty() {
        return Ok(());
    }

    let away = flags.starts_with('G');
    let prefix_spec = state.isupport_map().prefix();
    let prefixes: String = flags
        .chars()
        .filter(|c| *c != '*' && prefix_spec.is_symbol(*c))
        .collect();

    let (working, id) = upsert_user(state.clone(), nick, Some(ident), Some(host))?;
    let realname = realname.to_string();
    let mut working = working.with_user_updated(id, move |u| {
        u.away = away;
        u.realname = realname;
    })?;

    if let Some(chan) = working.channel(channel) {
        let chan_id = chan.id;
        let normalized = prefix_spec.normalize(&prefixes);
        working = working.with_membership(id, chan_id, &normalized)?;
    }

    out.state = Some(working.with_lost_users_pruned());
    Ok(())
}

fn handle_names_reply(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    // Without userhost-in-names the entries carry no hostmask, so no user
    // records can be built from them.
    if !state.cap_enabled("userhost-in-names").0 {
        return Ok(());
    }
    let Some(chan) = state.channel(cmd.arg(2).unwrap_or("")) else {
        return Ok(());
    };
    let chan_id = chan.id;
    let prefix_spec = state.isupport_map().prefix();

    let mut working = state.clone();
    for entry in cmd.arg(3).unwrap_or("").split_whitespace() {
        let prefixes: String = entry
            .chars()
            .take_while(|c| prefix_spec.is_symbol(*c))
            .collect();
        let mask = &entry[prefixes.len()..];
        let Some((nick, rest)) = mask.split_once('!') else {
            return Err(Error::ProtocolViolation(format!(
                "NAMES entry {:?} lacks a hostmask despite userhost-in-names",
                entry
            )));
        };
        let Some((ident, host)) = rest.split_once('@') else {
            return Err(Error::ProtocolViolation(format!(
                "NAMES entry {:?} lacks a hostmask despite userhost-in-names",
                entry
            )));
        };
        let (w, id) = upsert_user(working, nick, Some(ident), Some(host))?;
        working = w.with_membership(id, chan_id, &prefix_spec.normalize(&prefixes))?;
    }
    out.state = Some(working);
    Ok(())
}

fn handle_join(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let Some((nick, ident, host)) = source_parts(cmd) else {
        return Ok(());
    };
    let channel = cmd.arg(0).unwrap_or("");
    let extended = state.cap_enabled("extended-join").0;
    let (account, realname) = if extended && cmd.args().len() >= 3 {
        (
            cmd.arg(1).filter(|a| *a != "*").map(str::to_string),
            cmd.arg(2).map(str::to_string),
        )
    } else {
        (None, None)
    };

    if state.is_self(nick) {
        let mut working = state.clone();
        let chan_id = match working.channel(channel) {
            Some(chan) => chan.id,
            None => {
                let (w, id) = working.with_channel_added(channel)?;
                working = w;
                id
            }
        };
        working = working.with_membership(state.self_id(), chan_id, "")?;
        working = working.with_user_updated(state.self_id(), move |u| {
            if let Some(ident) = ident {
                u.ident = ident.to_string();
            }
            if let Some(host) = host {
                u.host = host.to_string();
            }
        })?;
        out.state = Some(working);
        return Ok(());
    }

    let Some(chan) = state.channel(channel) else {
        debug!(channel, "JOIN for untracked channel ignored");
        return Ok(());
    };
    let chan_id = chan.id;
    let (working, id) = upsert_user(state.clone(), nick, ident, host)?;
    let working = working.with_user_updated(id, move |u| {
        if account.is_some() {
            u.account = account;
        }
        if let Some(realname) = realname {
            u.realname = realname;
        }
    })?;
    out.state = Some(working.with_membership(id, chan_id, "")?);
    Ok(())
}

fn handle_part(
    state: &NetworkState,
    nick: Option<&str>,
    channel: Option<&str>,
    out: &mut TrackOutcome,
) -> Result<()> {
    let (Some(nick), Some(channel)) = (nick, channel) else {
        return Ok(());
    };
    let Some(chan) = state.channel(channel) else {
        return Ok(());
    };
    let chan_id = chan.id;

    if state.is_self(nick) {
        let working = state.with_channel_removed(chan_id)?;
        out.state = Some(working.with_lost_users_pruned());
        return Ok(());
    }

    let Some(user) = state.user_by_nick(nick) else {
        return Ok(());
    };
    let working = state.without_membership(user.id, chan_id)?;
    out.state = Some(working.with_lost_users_pruned());
    Ok(())
}

fn valid_nick(state: &NetworkState, nick: &str) -> bool {
    let Some(first) = nick.chars().next() else {
        return false;
    };
    if first == ':' || first == '$' {
        return false;
    }
    if state.isupport_map().chantypes().contains(first) {
        return false;
    }
    if state.isupport_map().prefix().is_symbol(first) {
        return false;
    }
    !nick.contains([' ', ',', '*', '?', '!', '@'])
}

fn handle_nick(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let Some((old, _, _)) = source_parts(cmd) else {
        return Ok(());
    };
    let new = cmd.arg(0).unwrap_or("");
    if !valid_nick(state, new) {
        return Err(Error::ProtocolViolation(format!(
            "invalid nick {:?} in NICK",
            new
        )));
    }
    let Some(user) = state.user_by_nick(old) else {
        return Ok(());
    };
    let id = user.id;
    let new = new.to_string();
    out.state = Some(state.with_user_updated(id, move |u| u.nick = new)?);
    Ok(())
}

fn handle_rename(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let old = cmd.arg(0).unwrap_or("");
    let new = cmd.arg(1).unwrap_or("");
    let valid = new
        .chars()
        .next()
        .is_some_and(|c| state.isupport_map().chantypes().contains(c));
    if !valid {
        return Err(Error::ProtocolViolation(format!(
            "RENAME target {:?} has no valid channel type",
            new
        )));
    }
    if let Some(chan) = state.channel(old) {
        let id = chan.id;
        let new = new.to_string();
        out.state = Some(state.with_channel_updated(id, move |c| c.name = new)?);
    }
    Ok(())
}

fn with_source_user(
    state: &NetworkState,
    cmd: &Command,
    f: impl FnOnce(&mut crate::state::UserRecord),
) -> Result<Option<NetworkState>> {
    let Some((nick, _, _)) = source_parts(cmd) else {
        return Ok(None);
    };
    let Some(user) = state.user_by_nick(nick) else {
        return Ok(None);
    };
    Ok(Some(state.with_user_updated(user.id, f)?))
}

fn handle_account(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let account = cmd.arg(0).filter(|a| *a != "*").map(str::to_string);
    out.state = with_source_user(state, cmd, move |u| u.account = account)?;
    Ok(())
}

fn handle_away(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let away = cmd.arg(0).is_some_and(|reason| !reason.is_empty());
    out.state = with_source_user(state, cmd, move |u| u.away = away)?;
    Ok(())
}

fn handle_chghost(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let ident = cmd.arg(0).unwrap_or("").to_string();
    let host = cmd.arg(1).unwrap_or("").to_string();
    out.state = with_source_user(state, cmd, move |u| {
        u.ident = ident;
        u.host = host;
    })?;
    Ok(())
}

fn handle_setname(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let realname = cmd.arg(0).unwrap_or("").to_string();
    out.state = with_source_user(state, cmd, move |u| u.realname = realname)?;
    Ok(())
}

fn handle_quit(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let Some((nick, _, _)) = source_parts(cmd) else {
        return Ok(());
    };
    if state.is_self(nick) {
        // A server-relayed QUIT for ourselves would corrupt the state.
        return Err(Error::ProtocolViolation(
            "QUIT sourced from own client".to_string(),
        ));
    }
    if let Some(user) = state.user_by_nick(nick) {
        out.state = Some(state.with_user_removed(user.id)?);
    }
    Ok(())
}

fn handle_mode(state: &NetworkState, cmd: &Command, out: &mut TrackOutcome) -> Result<()> {
    let target = cmd.arg(0).unwrap_or("");

    if state.is_self(target) {
        let modes = cmd.arg(1).unwrap_or("");
        let mut adding = true;
        out.state = Some(state.with_user_updated(state.self_id(), |u| {
            for c in modes.chars() {
                match c {
                    '+' => adding = true,
                    '-' => adding = false,
                    c => {
                        if adding {
                            u.modes.insert(c);
                        } else {
                            u.modes.remove(&c);
                        }
                    }
                }
            }
        })?);
        return Ok(());
    }

    let is_channel = target
        .chars()
        .next()
        .is_some_and(|c| state.isupport_map().chantypes().contains(c));
    if !is_channel {
        return Ok(());
    }
    let Some(chan) = state.channel(target) else {
        return Ok(());
    };
    let chan_id = chan.id;

    let prefix_spec = state.isupport_map().prefix();
    let chanmodes = state.isupport_map().chanmodes();
    let modestring = cmd.arg(1).unwrap_or("");
    let mut mode_args = cmd.args().iter().skip(2);
    let mut adding = true;
    let mut working = state.clone();
    let mut tracked: Vec<(char, bool, Option<String>)> = Vec::new();

    for c in modestring.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            c if prefix_spec.is_mode(c) => {
                let Some(nick) = mode_args.next() else {
                    return Err(Error::ProtocolViolation(format!(
                        "status mode {:?} without an argument",
                        c
                    )));
                };
                let Some(user) = working.user_by_nick(nick) else {
                    debug!(nick = %nick, "status mode for untracked user ignored");
                    continue;
                };
                let user_id = user.id;
                let symbol = prefix_spec
                    .symbol_for_mode(c)
                    .expect("status mode letter has a symbol");
                let mut prefixes: String = user
                    .channels
                    .get(&chan_id)
                    .cloned()
                    .unwrap_or_default();
                if adding {
                    if !prefixes.contains(symbol) {
                        prefixes.push(symbol);
                    }
                } else {
                    prefixes.retain(|s| s != symbol);
                }
                let normalized = prefix_spec.normalize(&prefixes);
                working = working.with_membership(user_id, chan_id, &normalized)?;
            }
            c => match chanmodes.classify(c) {
                Some(ChanModeClass::A) => {
                    // List modes consume an argument but are not tracked.
                    mode_args.next();
                }
                Some(ChanModeClass::B) => {
                    let arg = mode_args.next().cloned();
                    tracked.push((c, adding, if adding { arg } else { None }));
                }
                Some(ChanModeClass::C) => {
                    let arg = if adding { mode_args.next().cloned() } else { None };
                    tracked.push((c, adding, arg));
                }
                Some(ChanModeClass::D) | None => {
                    tracked.push((c, adding, None));
                }
            },
        }
    }

    if !tracked.is_empty() {
        working = working.with_channel_updated(chan_id, move |chan| {
            for (letter, add, arg) in tracked {
                if add {
                    chan.modes.insert(letter, arg);
                } else {
                    chan.modes.remove(&letter);
                }
            }
        })?;
    }
    out.state = Some(working);
    Ok(())
}

fn handle_ping(cmd: &Command, out: &mut TrackOutcome) {
    let token = cmd.arg(0).unwrap_or("");
    let line = if token.is_empty() || token.starts_with(':') || token.contains(' ') {
        format!("PONG :{}", token)
    } else {
        format!("PONG {}", token)
    };
    out.sends.push(line);
}
