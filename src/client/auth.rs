//! The SASL `AUTHENTICATE` exchange.
//!
//! One [`SaslSession`] lives for the duration of a connection's SASL
//! negotiation. It walks the candidate mechanisms in preference order,
//! offers TLS channel binding data to mechanisms that want it, buffers
//! chunked server challenges, and produces chunked client responses. The
//! dispatcher owns the numerics (900-908) and calls back into the session
//! to retry or abort.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::options::{ClientOptions, ServerEntry};
use crate::sasl::{
    chunk_payload, decode_payload, encode_payload, parse_mechanism_list, SaslMechanism,
    SaslMechanismFactory, MAX_SASL_BUFFER, SASL_CHUNK_SIZE,
};
use crate::transport::ChannelBindingKind;

/// Channel binding data captured from the transport before the exchange.
#[derive(Clone, Debug, Default)]
pub(crate) struct ChannelBindings {
    pub unique: Option<Vec<u8>>,
    pub endpoint: Option<Vec<u8>>,
}

impl ChannelBindings {
    fn get(&self, kind: ChannelBindingKind) -> Option<&[u8]> {
        match kind {
            ChannelBindingKind::Unique => self.unique.as_deref(),
            ChannelBindingKind::Endpoint => self.endpoint.as_deref(),
        }
    }
}

/// Lines to send after feeding the session, plus a terminal-failure flag.
#[derive(Default)]
pub(crate) struct SaslOutcome {
    pub sends: Vec<String>,
    /// No candidate mechanism is left; the dispatcher decides whether to
    /// abort the connection or fall back to `CAP END`.
    pub exhausted: bool,
}

/// In-flight SASL negotiation state.
pub(crate) struct SaslSession {
    factory: Arc<dyn SaslMechanismFactory>,
    bindings: ChannelBindings,
    candidates: Vec<String>,
    mechanism: Option<Box<dyn SaslMechanism>>,
    buffer: String,
}

impl SaslSession {
    /// Build the candidate list (factory order, intersected with the
    /// server's advertisement, minus disabled mechanisms) and attempt the
    /// first mechanism.
    pub(crate) fn start(
        factory: Arc<dyn SaslMechanismFactory>,
        options: &ClientOptions,
        server: &ServerEntry,
        advertised: Option<&str>,
        bindings: ChannelBindings,
    ) -> (Self, SaslOutcome) {
        let advertised: Option<Vec<String>> = advertised.map(parse_mechanism_list);
        let candidates = factory
            .supported(options, server)
            .into_iter()
            .filter(|name| {
                advertised
                    .as_ref()
                    .map_or(true, |list| list.iter().any(|a| a.eq_ignore_ascii_case(name)))
            })
            .filter(|name| {
                !options
                    .disabled_sasl_mechs
                    .iter()
                    .any(|d| d.eq_ignore_ascii_case(name))
            })
            .collect();
        let mut session = Self {
            factory,
            bindings,
            candidates,
            mechanism: None,
            buffer: String::new(),
        };
        let outcome = session.try_next(options);
        (session, outcome)
    }

    /// Move on to the next candidate mechanism (after 904/905).
    pub(crate) fn try_next(&mut self, options: &ClientOptions) -> SaslOutcome {
        let mut outcome = SaslOutcome::default();
        self.mechanism = None;
        self.buffer.clear();

        while !self.candidates.is_empty() {
            let name = self.candidates.remove(0);
            let Some(mut mechanism) = self.factory.create(&name, options) else {
                debug!(mechanism = %name, "factory declined to create mechanism");
                continue;
            };
            if mechanism.supports_channel_binding() {
                let accepted = [ChannelBindingKind::Unique, ChannelBindingKind::Endpoint]
                    .into_iter()
                    .any(|kind| match self.bindings.get(kind) {
                        Some(data) => mechanism.set_channel_binding(kind, data),
                        None => false,
                    });
                if !accepted {
                    debug!(mechanism = %name, "no acceptable channel binding, skipping");
                    continue;
                }
            }
            outcome.sends.push(format!("AUTHENTICATE {}", name));
            self.mechanism = Some(mechanism);
            return outcome;
        }

        outcome.exhausted = true;
        outcome
    }

    /// Narrow the candidate list to the server's updated advertisement
    /// (numeric 908). Returns whether any candidate remains.
    pub(crate) fn update_advertised(&mut self, list: &str) -> bool {
        let advertised = parse_mechanism_list(list);
        self.candidates
            .retain(|name| advertised.iter().any(|a| a.eq_ignore_ascii_case(name)));
        self.mechanism.is_some() || !self.candidates.is_empty()
    }

    /// Feed one `AUTHENTICATE` line from the server.
    pub(crate) fn on_authenticate(&mut self, payload: &str) -> SaslOutcome {
        let mut outcome = SaslOutcome::default();
        let Some(mechanism) = self.mechanism.as_mut() else {
            warn!("AUTHENTICATE received with no mechanism in flight");
            return outcome;
        };

        let terminal = if payload == "+" {
            true
        } else {
            self.buffer.push_str(payload);
            if self.buffer.len() > MAX_SASL_BUFFER {
                warn!(len = self.buffer.len(), "SASL challenge over limit, aborting");
                self.buffer.clear();
                outcome.sends.push("AUTHENTICATE *".to_string());
                return outcome;
            }
            payload.len() < SASL_CHUNK_SIZE
        };
        if !terminal {
            return outcome;
        }

        let encoded = std::mem::take(&mut self.buffer);
        let challenge = match decode_payload(&encoded) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("undecodable SASL challenge: {}", e);
                outcome.sends.push("AUTHENTICATE *".to_string());
                return outcome;
            }
        };

        let (ok, response) = mechanism.authenticate(&challenge);
        if !ok {
            outcome.sends.push("AUTHENTICATE *".to_string());
            return outcome;
        }
        for chunk in chunk_payload(&encode_payload(&response)) {
            outcome.sends.push(format!("AUTHENTICATE {}", chunk));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ServerEntry;
    use crate::sasl::PlainMechanism;

    struct StubFactory {
        mechs: Vec<&'static str>,
    }

    impl SaslMechanismFactory for StubFactory {
        fn supported(&self, _options: &ClientOptions, _server: &ServerEntry) -> Vec<String> {
            self.mechs.iter().map(|m| m.to_string()).collect()
        }

        fn create(&self, name: &str, _options: &ClientOptions) -> Option<Box<dyn SaslMechanism>> {
            match name {
                "PLAIN" => Some(Box::new(PlainMechanism::new("user", "pass"))),
                "BOUND" => Some(Box::new(BindingMechanism { bound: false })),
                _ => None,
            }
        }
    }

    /// A mechanism that insists on channel binding.
    struct BindingMechanism {
        bound: bool,
    }

    impl SaslMechanism for BindingMechanism {
        fn name(&self) -> &str {
            "BOUND"
        }

        fn supports_channel_binding(&self) -> bool {
            true
        }

        fn set_channel_binding(&mut self, kind: ChannelBindingKind, _data: &[u8]) -> bool {
            self.bound = kind == ChannelBindingKind::Endpoint;
            self.bound
        }

        fn authenticate(&mut self, _server_data: &[u8]) -> (bool, Vec<u8>) {
            (self.bound, b"bound".to_vec())
        }
    }

    fn options() -> ClientOptions {
        let mut o = ClientOptions::new(
            "net",
            vec![ServerEntry::tls("irc.example.org", 6697)],
            "me",
        );
        o.account_password = Some("pass".into());
        o
    }

    fn server() -> ServerEntry {
        ServerEntry::tls("irc.example.org", 6697)
    }

    fn start(
        mechs: Vec<&'static str>,
        advertised: Option<&str>,
        bindings: ChannelBindings,
        options: &ClientOptions,
    ) -> (SaslSession, SaslOutcome) {
        SaslSession::start(
            Arc::new(StubFactory { mechs }),
            options,
            &server(),
            advertised,
            bindings,
        )
    }

    #[test]
    fn test_start_sends_mechanism_name() {
        let options = options();
        let (_, outcome) = start(vec!["PLAIN"], Some("PLAIN,EXTERNAL"), Default::default(), &options);
        assert_eq!(outcome.sends, vec!["AUTHENTICATE PLAIN"]);
        assert!(!outcome.exhausted);
    }

    #[test]
    fn test_intersection_and_disabled() {
        let options = options();
        // Not advertised by the server.
        let (_, outcome) = start(vec!["PLAIN"], Some("EXTERNAL"), Default::default(), &options);
        assert!(outcome.exhausted);

        // Disabled locally.
        let mut options = self::options();
        options.disabled_sasl_mechs = vec!["plain".into()];
        let (_, outcome) = start(vec!["PLAIN"], Some("PLAIN"), Default::default(), &options);
        assert!(outcome.exhausted);
    }

    #[test]
    fn test_binding_mechanism_skipped_without_data() {
        let options = options();
        let (_, outcome) = start(
            vec!["BOUND", "PLAIN"],
            None,
            Default::default(),
            &options,
        );
        // BOUND is skipped (no binding data), PLAIN is attempted.
        assert_eq!(outcome.sends, vec!["AUTHENTICATE PLAIN"]);
    }

    #[test]
    fn test_binding_mechanism_bound_when_available() {
        let options = options();
        let bindings = ChannelBindings {
            unique: None,
            endpoint: Some(vec![1, 2, 3]),
        };
        let (_, outcome) = start(vec!["BOUND", "PLAIN"], None, bindings, &options);
        assert_eq!(outcome.sends, vec!["AUTHENTICATE BOUND"]);
    }

    #[test]
    fn test_plain_exchange() {
        let options = options();
        let (mut session, _) = start(vec!["PLAIN"], None, Default::default(), &options);
        let outcome = session.on_authenticate("+");
        assert_eq!(outcome.sends.len(), 1);
        let payload = outcome.sends[0].strip_prefix("AUTHENTICATE ").unwrap();
        assert_eq!(decode_payload(payload).unwrap(), b"\0user\0pass");
    }

    #[test]
    fn test_challenge_accumulation() {
        let options = options();
        let (mut session, _) = start(vec!["PLAIN"], None, Default::default(), &options);
        // A 400-character chunk keeps the buffer open.
        let chunk = "A".repeat(SASL_CHUNK_SIZE);
        assert!(session.on_authenticate(&chunk).sends.is_empty());
        // A short chunk terminates; the combined buffer is decoded.
        let outcome = session.on_authenticate("QQ==");
        assert!(!outcome.sends.is_empty());
    }

    #[test]
    fn test_buffer_limit_aborts() {
        let options = options();
        let (mut session, _) = start(vec!["PLAIN"], None, Default::default(), &options);
        let chunk = "A".repeat(SASL_CHUNK_SIZE);
        // 163 full chunks buffer 65200 bytes without aborting.
        for _ in 0..(MAX_SASL_BUFFER / SASL_CHUNK_SIZE) {
            assert!(session.on_authenticate(&chunk).sends.is_empty());
        }
        // The next full chunk pushes past 64 KiB and aborts.
        let outcome = session.on_authenticate(&chunk);
        assert_eq!(outcome.sends, vec!["AUTHENTICATE *"]);
    }

    #[test]
    fn test_buffer_at_exact_limit_continues() {
        let options = options();
        let (mut session, _) = start(vec!["PLAIN"], None, Default::default(), &options);
        let chunk = "A".repeat(SASL_CHUNK_SIZE);
        for _ in 0..(MAX_SASL_BUFFER / SASL_CHUNK_SIZE) {
            assert!(session.on_authenticate(&chunk).sends.is_empty());
        }
        // A terminal chunk landing the buffer on exactly 64 KiB is decoded,
        // not aborted (65536 is a multiple of 4, so the base64 decodes).
        let last = "A".repeat(MAX_SASL_BUFFER - (MAX_SASL_BUFFER / SASL_CHUNK_SIZE) * SASL_CHUNK_SIZE);
        let outcome = session.on_authenticate(&last);
        assert_ne!(outcome.sends, vec!["AUTHENTICATE *".to_string()]);
        assert!(!outcome.sends.is_empty());
    }

    #[test]
    fn test_bad_base64_aborts() {
        let options = options();
        let (mut session, _) = start(vec!["PLAIN"], None, Default::default(), &options);
        let outcome = session.on_authenticate("!not-base64!");
        assert_eq!(outcome.sends, vec!["AUTHENTICATE *"]);
    }

    #[test]
    fn test_retry_moves_to_next() {
        let mut options = options();
        options.account_password = Some("pass".into());
        let (mut session, outcome) = start(vec!["BOUND", "PLAIN"], None, ChannelBindings {
            unique: None,
            endpoint: Some(vec![9]),
        }, &options);
        assert_eq!(outcome.sends, vec!["AUTHENTICATE BOUND"]);
        let outcome = session.try_next(&options);
        assert_eq!(outcome.sends, vec!["AUTHENTICATE PLAIN"]);
        let outcome = session.try_next(&options);
        assert!(outcome.exhausted);
    }

    #[test]
    fn test_update_advertised() {
        let options = options();
        let (mut session, _) = start(vec!["BOUND", "PLAIN"], None, Default::default(), &options);
        // PLAIN is in flight; narrowing to EXTERNAL leaves nothing queued
        // but the in-flight mechanism stands.
        assert!(session.update_advertised("PLAIN"));
        session.mechanism = None;
        assert!(!session.update_advertised("EXTERNAL"));
    }
}
