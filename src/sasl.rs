//! SASL authentication for IRC.
//!
//! The engine drives the `AUTHENTICATE` sub-protocol against pluggable
//! mechanisms. A mechanism is single-shot: it is created for one attempt,
//! optionally primed with TLS channel binding data, fed the server's
//! (possibly empty) challenge, and dropped afterwards.
//!
//! PLAIN (RFC 4616) and EXTERNAL ship as the default mechanism set; the
//! [`SaslMechanismFactory`] trait lets consumers supply others (e.g.
//! SCRAM-SHA-256) without the engine knowing their internals.
//!
//! # Reference
//! - IRCv3 SASL: <https://ircv3.net/specs/extensions/sasl-3.2>
//! - RFC 4616 (PLAIN): <https://tools.ietf.org/html/rfc4616>

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::options::{ClientOptions, ServerEntry};
use crate::transport::ChannelBindingKind;

/// Maximum length of a single `AUTHENTICATE` chunk.
///
/// Responses longer than this are split; a final chunk of exactly this
/// length is followed by an empty (`+`) chunk to mark completion.
pub const SASL_CHUNK_SIZE: usize = 400;

/// Maximum accumulated server challenge before the exchange is aborted.
pub const MAX_SASL_BUFFER: usize = 64 * 1024;

/// One single-shot authentication attempt.
pub trait SaslMechanism: Send {
    /// The IANA mechanism name (e.g. `PLAIN`).
    fn name(&self) -> &str;

    /// Whether this mechanism can make use of TLS channel binding data.
    fn supports_channel_binding(&self) -> bool {
        false
    }

    /// Offer channel binding data of `kind`. Returns true if the mechanism
    /// accepted it.
    fn set_channel_binding(&mut self, kind: ChannelBindingKind, data: &[u8]) -> bool {
        let _ = (kind, data);
        false
    }

    /// Process the server's decoded challenge and produce the client
    /// response. Returns `(success, response_bytes)`; on `false` the
    /// exchange is aborted.
    fn authenticate(&mut self, server_data: &[u8]) -> (bool, Vec<u8>);
}

/// Source of mechanism instances, consulted during CAP negotiation.
pub trait SaslMechanismFactory: Send + Sync {
    /// Mechanism names this factory can produce for the given
    /// configuration, in preference order.
    fn supported(&self, options: &ClientOptions, server: &ServerEntry) -> Vec<String>;

    /// Create a fresh single-shot mechanism.
    fn create(&self, name: &str, options: &ClientOptions) -> Option<Box<dyn SaslMechanism>>;
}

/// The PLAIN mechanism: `authzid NUL authcid NUL password`.
pub struct PlainMechanism {
    authcid: String,
    password: String,
    used: bool,
}

impl PlainMechanism {
    /// A PLAIN attempt for `authcid` with `password`.
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authcid: authcid.into(),
            password: password.into(),
            used: false,
        }
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn authenticate(&mut self, _server_data: &[u8]) -> (bool, Vec<u8>) {
        if self.used {
            return (false, Vec::new());
        }
        self.used = true;
        let mut payload = Vec::with_capacity(self.authcid.len() * 2 + self.password.len() + 2);
        payload.push(0);
        payload.extend_from_slice(self.authcid.as_bytes());
        payload.push(0);
        payload.extend_from_slice(self.password.as_bytes());
        (true, payload)
    }
}

/// The EXTERNAL mechanism: authentication is carried by the TLS client
/// certificate; the payload is the (usually empty) authorization identity.
pub struct ExternalMechanism {
    authzid: String,
    used: bool,
}

impl ExternalMechanism {
    /// An EXTERNAL attempt, optionally naming an authorization identity.
    pub fn new(authzid: Option<&str>) -> Self {
        Self {
            authzid: authzid.unwrap_or_default().to_string(),
            used: false,
        }
    }
}

impl SaslMechanism for ExternalMechanism {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn authenticate(&mut self, _server_data: &[u8]) -> (bool, Vec<u8>) {
        if self.used {
            return (false, Vec::new());
        }
        self.used = true;
        (true, self.authzid.clone().into_bytes())
    }
}

/// Factory for the built-in PLAIN and EXTERNAL mechanisms.
///
/// EXTERNAL is offered when a client certificate is configured; PLAIN when
/// an account password is configured and the transport is secure (or
/// `allow_insecure_sasl_plain` is set).
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultSaslFactory;

impl SaslMechanismFactory for DefaultSaslFactory {
    fn supported(&self, options: &ClientOptions, server: &ServerEntry) -> Vec<String> {
        let mut mechs = Vec::new();
        if options.account_certificate_file.is_some() && server.secure {
            mechs.push("EXTERNAL".to_string());
        }
        if options.account_password.is_some()
            && (server.secure || options.allow_insecure_sasl_plain)
        {
            mechs.push("PLAIN".to_string());
        }
        mechs
    }

    fn create(&self, name: &str, options: &ClientOptions) -> Option<Box<dyn SaslMechanism>> {
        match name {
            "PLAIN" => {
                let password = options.account_password.clone()?;
                Some(Box::new(PlainMechanism::new(
                    options.effective_account_name(),
                    password,
                )))
            }
            "EXTERNAL" => Some(Box::new(ExternalMechanism::new(None))),
            _ => None,
        }
    }
}

/// Base64-encode a mechanism response for the wire.
pub fn encode_payload(payload: &[u8]) -> String {
    BASE64.encode(payload)
}

/// Decode an accumulated base64 challenge. `+` (captured as an empty
/// buffer) decodes to no bytes.
pub fn decode_payload(encoded: &str) -> Result<Vec<u8>, base64::DecodeError> {
    if encoded.is_empty() || encoded == "+" {
        return Ok(Vec::new());
    }
    BASE64.decode(encoded)
}

/// Split an encoded response into `AUTHENTICATE` chunks.
///
/// An empty response yields a single `+`. A response whose final chunk is
/// exactly [`SASL_CHUNK_SIZE`] long gets a trailing `+` marking
/// completion.
pub fn chunk_payload(encoded: &str) -> Vec<String> {
    if encoded.is_empty() {
        return vec!["+".to_string()];
    }
    let mut chunks: Vec<String> = encoded
        .as_bytes()
        .chunks(SASL_CHUNK_SIZE)
        // base64 output is always ASCII
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    if encoded.len() % SASL_CHUNK_SIZE == 0 {
        chunks.push("+".to_string());
    }
    chunks
}

/// Parse a comma-separated mechanism list (CAP `sasl` value, numeric 908).
pub fn parse_mechanism_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_with_password() -> ClientOptions {
        let mut o = ClientOptions::new(
            "net",
            vec![ServerEntry::tls("irc.example.org", 6697)],
            "me",
        );
        o.account_password = Some("hunter2".into());
        o
    }

    #[test]
    fn test_plain_payload() {
        let mut mech = PlainMechanism::new("user", "pass");
        let (ok, payload) = mech.authenticate(&[]);
        assert!(ok);
        assert_eq!(payload, b"\0user\0pass");
        // Single shot.
        assert!(!mech.authenticate(&[]).0);
    }

    #[test]
    fn test_external_payload() {
        let mut mech = ExternalMechanism::new(None);
        let (ok, payload) = mech.authenticate(&[]);
        assert!(ok);
        assert!(payload.is_empty());

        let mut mech = ExternalMechanism::new(Some("other"));
        assert_eq!(mech.authenticate(&[]).1, b"other");
    }

    #[test]
    fn test_default_factory_gating() {
        let factory = DefaultSaslFactory;
        let tls = ServerEntry::tls("irc.example.org", 6697);
        let plain = ServerEntry::new("irc.example.org", 6667);

        let options = options_with_password();
        assert_eq!(factory.supported(&options, &tls), vec!["PLAIN"]);
        // PLAIN is withheld on insecure transports by default.
        assert!(factory.supported(&options, &plain).is_empty());

        let mut options = options_with_password();
        options.allow_insecure_sasl_plain = true;
        assert_eq!(factory.supported(&options, &plain), vec!["PLAIN"]);

        let mut options = options_with_password();
        options.account_certificate_file = Some("client.pem".into());
        assert_eq!(factory.supported(&options, &tls), vec!["EXTERNAL", "PLAIN"]);
    }

    #[test]
    fn test_factory_create() {
        let factory = DefaultSaslFactory;
        let options = options_with_password();
        let mech = factory.create("PLAIN", &options).unwrap();
        assert_eq!(mech.name(), "PLAIN");
        assert!(factory.create("SCRAM-SHA-256", &options).is_none());
    }

    #[test]
    fn test_encode_decode() {
        let encoded = encode_payload(b"\0user\0pass");
        assert_eq!(decode_payload(&encoded).unwrap(), b"\0user\0pass");
        assert!(decode_payload("+").unwrap().is_empty());
        assert!(decode_payload("").unwrap().is_empty());
        assert!(decode_payload("!!!").is_err());
    }

    #[test]
    fn test_chunk_payload() {
        assert_eq!(chunk_payload(""), vec!["+"]);

        let short = "a".repeat(399);
        assert_eq!(chunk_payload(&short), vec![short.clone()]);

        // An exact multiple of the chunk size gets a trailing `+`.
        let exact = "a".repeat(400);
        assert_eq!(chunk_payload(&exact), vec![exact.clone(), "+".to_string()]);

        let long = "a".repeat(900);
        let chunks = chunk_payload(&long);
        assert_eq!(
            chunks,
            vec!["a".repeat(400), "a".repeat(400), "a".repeat(100)]
        );
    }

    #[test]
    fn test_parse_mechanism_list() {
        assert_eq!(
            parse_mechanism_list("plain, EXTERNAL,scram-sha-256"),
            vec!["PLAIN", "EXTERNAL", "SCRAM-SHA-256"]
        );
        assert!(parse_mechanism_list("").is_empty());
    }
}
