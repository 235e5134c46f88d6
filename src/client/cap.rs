//! IRCv3 capability negotiation.
//!
//! The negotiator consumes `CAP` messages and produces lines to send,
//! state replacements, and capability events. It is sans-IO: the
//! dispatcher owns the transport and applies the outcome.
//!
//! # Reference
//! - <https://ircv3.net/specs/extensions/capability-negotiation>

use std::sync::Arc;

use tracing::debug;

use crate::command::Command;
use crate::options::CapFilter;
use crate::state::NetworkState;

use super::{CapSubcommand, Event};

/// Capabilities requested whenever the server advertises them.
pub(crate) const DEFAULT_CAPS: &[&str] = &[
    "account-notify",
    "away-notify",
    "batch",
    "cap-notify",
    "chghost",
    "draft/channel-rename",
    "draft/multiline",
    "extended-join",
    "message-ids",
    "message-tags",
    "multi-prefix",
    "server-time",
    "setname",
    "userhost-in-names",
];

/// The server's `ACK`/`NAK` echo must fit a 512-byte reply; this is the
/// fixed overhead reserved around the capability list itself.
const CAP_REPLY_RESERVE: usize = 434;

/// What the dispatcher must do after one `CAP` message.
#[derive(Default)]
pub(crate) struct CapOutcome {
    /// Raw lines to send, in order.
    pub sends: Vec<String>,
    /// Replacement network state, when capabilities changed.
    pub state: Option<NetworkState>,
    /// Events to publish.
    pub events: Vec<Event>,
    /// `sasl` was acknowledged: start the SASL exchange and withhold
    /// `CAP END` until it finishes.
    pub start_sasl: bool,
}

/// Sans-IO CAP negotiation driver.
pub(crate) struct CapNegotiator {
    filter: Option<Arc<CapFilter>>,
    sasl_wanted: bool,
    /// Capabilities accumulated across multi-line `LS` replies.
    ls_buffer: Vec<(String, Option<String>)>,
    /// Guard so `CAP END` is sent at most once per connection.
    pub(crate) cap_end_sent: bool,
}

impl CapNegotiator {
    pub(crate) fn new(filter: Option<Arc<CapFilter>>, sasl_wanted: bool) -> Self {
        Self {
            filter,
            sasl_wanted,
            ls_buffer: Vec::new(),
            cap_end_sent: false,
        }
    }

    /// The `CAP END` line, at most once per connection.
    pub(crate) fn cap_end_line(&mut self) -> Option<String> {
        if self.cap_end_sent {
            None
        } else {
            self.cap_end_sent = true;
            Some("CAP END".to_string())
        }
    }

    fn mark_cap_end(&mut self, outcome: &mut CapOutcome) {
        if let Some(line) = self.cap_end_line() {
            outcome.sends.push(line);
        }
    }

    fn should_request(&self, name: &str, value: Option<&str>, sasl_available: bool) -> bool {
        if DEFAULT_CAPS.contains(&name) {
            return true;
        }
        if name == "sasl" && self.sasl_wanted && sasl_available {
            return true;
        }
        if let Some(filter) = &self.filter {
            return filter(name, value);
        }
        false
    }

    /// Split requested capability names into `CAP REQ` lines whose echoed
    /// reply fits the server's 512-byte line: the list may use at most
    /// `434 - len(nick) - len(source)` bytes.
    fn chunk_requests(&self, names: &[String], nick: &str, source_len: usize) -> Vec<String> {
        let reserve = CAP_REPLY_RESERVE.saturating_sub(nick.len() + source_len).max(1);
        let mut lines = Vec::new();
        let mut current = String::new();
        for name in names {
            let extra = if current.is_empty() { name.len() } else { name.len() + 1 };
            if !current.is_empty() && current.len() + extra > reserve {
                lines.push(format!("CAP REQ :{}", current));
                current.clear();
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(name);
        }
        if !current.is_empty() {
            lines.push(format!("CAP REQ :{}", current));
        }
        lines
    }

    /// Handle one `CAP` message. `registered` suppresses `CAP END`;
    /// `sasl_done` suppresses re-entering SASL.
    pub(crate) fn handle(
        &mut self,
        state: &NetworkState,
        cmd: &Command,
        registered: bool,
        sasl_done: bool,
    ) -> CapOutcome {
        let mut outcome = CapOutcome::default();
        let Some(sub) = cmd.arg(1) else {
            return outcome;
        };
        match sub.to_ascii_uppercase().as_str() {
            "LS" => self.handle_ls(state, cmd, registered, &mut outcome),
            "ACK" => self.handle_ack(state, cmd, registered, sasl_done, &mut outcome),
            "LIST" => self.handle_enable_list(state, cmd, CapSubcommand::List, &mut outcome),
            "NEW" => self.handle_new(state, cmd, sasl_done, &mut outcome),
            "DEL" => self.handle_del(state, cmd, &mut outcome),
            "NAK" => {
                if !registered {
                    self.mark_cap_end(&mut outcome);
                }
            }
            other => debug!(subcommand = other, "ignoring unknown CAP subcommand"),
        }
        outcome
    }

    fn handle_ls(
        &mut self,
        state: &NetworkState,
        cmd: &Command,
        registered: bool,
        outcome: &mut CapOutcome,
    ) {
        let (is_final, caps) = if cmd.arg(2) == Some("*") {
            (false, cmd.arg(3).unwrap_or(""))
        } else {
            (true, cmd.arg(2).unwrap_or(""))
        };
        for token in caps.split_whitespace() {
            let (name, value) = split_cap_value(token);
            self.ls_buffer
                .push((name.to_string(), value.map(str::to_string)));
        }
        if !is_final {
            return;
        }

        let advertised = std::mem::take(&mut self.ls_buffer);
        let sasl_available = advertised.iter().any(|(n, _)| n == "sasl");
        let mut working = state.clone();
        let mut to_request = Vec::new();
        for (name, value) in &advertised {
            working = working.with_cap_supported(name, value.as_deref());
            if self.should_request(name, value.as_deref(), sasl_available) {
                to_request.push(name.clone());
            }
        }
        outcome.state = Some(working);

        if to_request.is_empty() {
            if !registered {
                self.mark_cap_end(outcome);
            }
            return;
        }
        let nick = state.self_user().nick.clone();
        let source_len = cmd.source().map_or(0, str::len);
        outcome
            .sends
            .extend(self.chunk_requests(&to_request, &nick, source_len));
    }

    fn handle_ack(
        &mut self,
        state: &NetworkState,
        cmd: &Command,
        registered: bool,
        sasl_done: bool,
        outcome: &mut CapOutcome,
    ) {
        let caps = cmd.arg(2).unwrap_or("");
        let mut working = state.clone();
        let mut sasl_acked = false;
        for token in caps.split_whitespace() {
            if let Some(name) = token.strip_prefix('-') {
                let (_, value) = working.cap_enabled(name);
                let value = value.map(str::to_string);
                working = working.with_cap_disabled(name);
                outcome.events.push(Event::CapDisabled {
                    cap: name.to_string(),
                    value,
                    subcommand: CapSubcommand::Ack,
                });
                continue;
            }
            let (name, _) = split_cap_value(token);
            working = working.with_cap_enabled(name);
            let value = working.cap_enabled(name).1.map(str::to_string);
            outcome.events.push(Event::CapEnabled {
                cap: name.to_string(),
                value,
                subcommand: CapSubcommand::Ack,
            });
            if name == "sasl" {
                sasl_acked = true;
            }
        }
        outcome.state = Some(working);

        if sasl_acked && self.sasl_wanted && !sasl_done {
            // CAP END is withheld until the SASL exchange resolves.
            outcome.start_sasl = true;
        } else if !registered {
            self.mark_cap_end(outcome);
        }
    }

    fn handle_enable_list(
        &mut self,
        state: &NetworkState,
        cmd: &Command,
        subcommand: CapSubcommand,
        outcome: &mut CapOutcome,
    ) {
        let caps = cmd.arg(2).unwrap_or("");
        let mut working = state.clone();
        for token in caps.split_whitespace() {
            let (name, _) = split_cap_value(token);
            working = working.with_cap_enabled(name);
            let value = working.cap_enabled(name).1.map(str::to_string);
            outcome.events.push(Event::CapEnabled {
                cap: name.to_string(),
                value,
                subcommand,
            });
        }
        outcome.state = Some(working);
    }

    fn handle_new(
        &mut self,
        state: &NetworkState,
        cmd: &Command,
        sasl_done: bool,
        outcome: &mut CapOutcome,
    ) {
        let caps = cmd.arg(2).unwrap_or("");
        let mut working = state.clone();
        let mut to_request = Vec::new();
        let sasl_available = caps
            .split_whitespace()
            .any(|t| split_cap_value(t).0 == "sasl")
            && !sasl_done;
        for token in caps.split_whitespace() {
            let (name, value) = split_cap_value(token);
            working = working.with_cap_supported(name, value);
            if self.should_request(name, value, sasl_available) {
                // Never re-request sasl once authenticated.
                if name == "sasl" && sasl_done {
                    continue;
                }
                to_request.push(name.to_string());
            }
        }
        outcome.state = Some(working);

        if to_request.is_empty() {
            return;
        }
        let nick = state.self_user().nick.clone();
        let source_len = cmd.source().map_or(0, str::len);
        outcome
            .sends
            .extend(self.chunk_requests(&to_request, &nick, source_len));
    }

    fn handle_del(&mut self, state: &NetworkState, cmd: &Command, outcome: &mut CapOutcome) {
        let caps = cmd.arg(2).unwrap_or("");
        let mut working = state.clone();
        for token in caps.split_whitespace() {
            let (name, _) = split_cap_value(token);
            let value = working.cap_enabled(name).1.map(str::to_string);
            working = working.with_cap_disabled(name);
            outcome.events.push(Event::CapDisabled {
                cap: name.to_string(),
                value,
                subcommand: CapSubcommand::Del,
            });
        }
        outcome.state = Some(working);
    }
}

fn split_cap_value(token: &str) -> (&str, Option<&str>) {
    match token.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (token, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    fn state() -> NetworkState {
        NetworkState::new("testnet", "me")
    }

    fn cap(line: &str) -> Command {
        Command::parse(CommandKind::Server, line).unwrap()
    }

    fn negotiator(sasl: bool) -> CapNegotiator {
        CapNegotiator::new(None, sasl)
    }

    #[test]
    fn test_ls_requests_defaults() {
        let mut neg = negotiator(false);
        let st = state();
        let outcome = neg.handle(
            &st,
            &cap(":srv CAP * LS :message-tags server-time unknown-cap"),
            false,
            false,
        );
        assert_eq!(outcome.sends, vec!["CAP REQ :message-tags server-time"]);
        let st = outcome.state.unwrap();
        assert_eq!(st.supported_caps().len(), 3);
    }

    #[test]
    fn test_ls_multiline_accumulates() {
        let mut neg = negotiator(false);
        let st = state();
        let outcome = neg.handle(&st, &cap(":srv CAP * LS * :message-tags"), false, false);
        assert!(outcome.sends.is_empty());
        let outcome = neg.handle(&st, &cap(":srv CAP * LS :server-time"), false, false);
        assert_eq!(outcome.sends, vec!["CAP REQ :message-tags server-time"]);
    }

    #[test]
    fn test_ls_nothing_wanted_ends() {
        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP * LS :unknown-cap"), false, false);
        assert_eq!(outcome.sends, vec!["CAP END"]);
        assert!(neg.cap_end_sent);
    }

    #[test]
    fn test_sasl_requested_only_when_configured() {
        let mut neg = negotiator(true);
        let outcome = neg.handle(&state(), &cap(":srv CAP * LS :sasl=PLAIN"), false, false);
        assert_eq!(outcome.sends, vec!["CAP REQ :sasl"]);

        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP * LS :sasl=PLAIN"), false, false);
        assert_eq!(outcome.sends, vec!["CAP END"]);
    }

    #[test]
    fn test_filter_opts_in() {
        let filter: Arc<CapFilter> = Arc::new(|name, _| name == "unknown-cap");
        let mut neg = CapNegotiator::new(Some(filter), false);
        let outcome = neg.handle(&state(), &cap(":srv CAP * LS :unknown-cap other"), false, false);
        assert_eq!(outcome.sends, vec!["CAP REQ :unknown-cap"]);
    }

    #[test]
    fn test_ack_enables_and_ends() {
        let mut neg = negotiator(false);
        let st = state();
        let outcome = neg.handle(&st, &cap(":srv CAP * ACK :message-tags batch"), false, false);
        let st = outcome.state.unwrap();
        assert!(st.cap_enabled("message-tags").0);
        assert!(st.cap_enabled("batch").0);
        assert_eq!(outcome.events.len(), 2);
        assert_eq!(outcome.sends, vec!["CAP END"]);
    }

    #[test]
    fn test_ack_sasl_withholds_cap_end() {
        let mut neg = negotiator(true);
        let outcome = neg.handle(&state(), &cap(":srv CAP * ACK :sasl"), false, false);
        assert!(outcome.start_sasl);
        assert!(outcome.sends.is_empty());
        assert!(!neg.cap_end_sent);
    }

    #[test]
    fn test_ack_after_registration_no_end() {
        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP me ACK :batch"), true, false);
        assert!(outcome.sends.is_empty());
    }

    #[test]
    fn test_list_never_sends_end() {
        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP me LIST :batch server-time"), false, false);
        assert!(outcome.sends.is_empty());
        assert!(outcome.state.unwrap().cap_enabled("batch").0);
        assert_eq!(outcome.events.len(), 2);
    }

    #[test]
    fn test_del_disables() {
        let mut neg = negotiator(false);
        let st = state().with_cap_supported("batch", None).with_cap_enabled("batch");
        let outcome = neg.handle(&st, &cap(":srv CAP me DEL :batch"), true, false);
        assert!(!outcome.state.unwrap().cap_enabled("batch").0);
        assert!(matches!(
            outcome.events[0],
            Event::CapDisabled { ref cap, .. } if cap == "batch"
        ));
    }

    #[test]
    fn test_nak_pre_registration_ends() {
        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP * NAK :batch"), false, false);
        assert_eq!(outcome.sends, vec!["CAP END"]);

        let mut neg = negotiator(false);
        let outcome = neg.handle(&state(), &cap(":srv CAP * NAK :batch"), true, false);
        assert!(outcome.sends.is_empty());
    }

    #[test]
    fn test_new_rerequests() {
        let mut neg = negotiator(true);
        let outcome = neg.handle(&state(), &cap(":srv CAP me NEW :batch sasl=PLAIN"), true, false);
        assert_eq!(outcome.sends, vec!["CAP REQ :batch sasl"]);

        // Once authenticated, sasl is not re-requested.
        let mut neg = negotiator(true);
        let outcome = neg.handle(&state(), &cap(":srv CAP me NEW :sasl=PLAIN"), true, true);
        assert!(outcome.sends.is_empty());
    }

    #[test]
    fn test_req_chunking_fits_reserve() {
        let neg = negotiator(false);
        let names: Vec<String> = (0..60).map(|i| format!("vendor/capability-{:02}", i)).collect();
        let nick = "somenick";
        let source_len = "irc.example.org".len();
        let reserve = CAP_REPLY_RESERVE - nick.len() - source_len;
        let lines = neg.chunk_requests(&names, nick, source_len);
        assert!(lines.len() > 1);
        for line in &lines {
            let list = line.strip_prefix("CAP REQ :").unwrap();
            assert!(list.len() <= reserve, "{} > {}", list.len(), reserve);
        }
        // Nothing dropped.
        let rejoined: Vec<&str> = lines
            .iter()
            .flat_map(|l| l.strip_prefix("CAP REQ :").unwrap().split(' '))
            .collect();
        assert_eq!(rejoined.len(), names.len());
    }
}
