//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandOptions;
use crate::error::{Error, Result};

/// One server endpoint in the connection rotation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerEntry {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether to negotiate TLS.
    pub secure: bool,
}

impl ServerEntry {
    /// A plaintext endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: false,
        }
    }

    /// A TLS endpoint.
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secure: true,
        }
    }
}

impl fmt::Display for ServerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}{}",
            self.host,
            self.port,
            if self.secure { " (tls)" } else { "" }
        )
    }
}

/// Predicate deciding whether a non-default capability should be requested.
pub type CapFilter = dyn Fn(&str, Option<&str>) -> bool + Send + Sync;

/// Configuration for one [`Client`](crate::client::Client) instance.
///
/// Durations of zero mean "no timeout". `connect_retries` of zero means a
/// single full pass over the server list.
#[derive(Clone)]
pub struct ClientOptions {
    /// User-chosen name for this network (used in events and logging).
    pub network: String,
    /// Ordered server rotation. Must be non-empty.
    pub servers: Vec<ServerEntry>,
    /// Extra passes over the server list after the first.
    pub connect_retries: u32,
    /// Per-server TCP+TLS connect timeout.
    pub connect_timeout: Duration,
    /// Per-attempt registration timeout.
    pub registration_timeout: Duration,
    /// Liveness probe interval.
    pub ping_interval: Duration,
    /// Deadline for each outstanding liveness probe.
    pub ping_timeout: Duration,

    /// Nick to register with. Must be non-empty.
    pub primary_nick: String,
    /// Fallback nick on collision; defaults to `<primary>_`.
    pub secondary_nick: Option<String>,
    /// Ident (username); defaults to the primary nick.
    pub ident: Option<String>,
    /// Real name (GECOS); defaults to the primary nick.
    pub real_name: Option<String>,
    /// Server password (`PASS`), if the network requires one.
    pub server_password: Option<String>,
    /// Local address to bind before connecting.
    pub bind_host: Option<String>,

    /// Accept any server certificate. Forces `check_online_revocation`
    /// off.
    pub accept_all_certificates: bool,
    /// SHA-256 fingerprints of trusted server certificates.
    pub trusted_certificate_fingerprints: Vec<String>,
    /// SHA-256 fingerprints of trusted server public keys (SPKI).
    pub trusted_public_key_fingerprints: Vec<String>,
    /// Check certificate revocation during the handshake.
    pub check_online_revocation: bool,

    /// Client certificate file for SASL EXTERNAL.
    pub account_certificate_file: Option<String>,
    /// Password for the client certificate file.
    pub account_certificate_password: Option<String>,
    /// Account password for SASL PLAIN.
    pub account_password: Option<String>,
    /// Account name; defaults to the primary nick.
    pub account_name: Option<String>,

    /// Attempt SASL when the server advertises it.
    pub use_sasl: bool,
    /// Abort the connection attempt on non-recoverable SASL failure.
    pub abort_on_sasl_failure: bool,
    /// Allow PLAIN over non-TLS transports.
    pub allow_insecure_sasl_plain: bool,
    /// Mechanism names that must never be attempted.
    pub disabled_sasl_mechs: Vec<String>,

    /// Codec length budgets.
    pub command_options: CommandOptions,
    /// Opt-in filter for capabilities outside the default set.
    pub should_enable_cap: Option<Arc<CapFilter>>,
}

impl ClientOptions {
    /// Options for `network` with the given server rotation and nick, all
    /// other settings at their defaults.
    pub fn new(
        network: impl Into<String>,
        servers: Vec<ServerEntry>,
        primary_nick: impl Into<String>,
    ) -> Self {
        Self {
            network: network.into(),
            servers,
            connect_retries: 0,
            connect_timeout: Duration::from_secs(30),
            registration_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_secs(30),
            primary_nick: primary_nick.into(),
            secondary_nick: None,
            ident: None,
            real_name: None,
            server_password: None,
            bind_host: None,
            accept_all_certificates: false,
            trusted_certificate_fingerprints: Vec::new(),
            trusted_public_key_fingerprints: Vec::new(),
            check_online_revocation: false,
            account_certificate_file: None,
            account_certificate_password: None,
            account_password: None,
            account_name: None,
            use_sasl: true,
            abort_on_sasl_failure: true,
            allow_insecure_sasl_plain: false,
            disabled_sasl_mechs: Vec::new(),
            command_options: CommandOptions::default(),
            should_enable_cap: None,
        }
    }

    /// The ident to register with (defaults to the primary nick).
    pub fn effective_ident(&self) -> &str {
        self.ident
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.primary_nick)
    }

    /// The real name to register with (defaults to the primary nick).
    pub fn effective_real_name(&self) -> &str {
        self.real_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.primary_nick)
    }

    /// The fallback nick (defaults to `<primary>_`).
    pub fn effective_secondary_nick(&self) -> String {
        match self.secondary_nick.as_deref().filter(|s| !s.is_empty()) {
            Some(nick) => nick.to_string(),
            None => format!("{}_", self.primary_nick),
        }
    }

    /// The SASL account name (defaults to the primary nick).
    pub fn effective_account_name(&self) -> &str {
        self.account_name
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.primary_nick)
    }

    /// Revocation checking, with the `accept_all_certificates` override
    /// applied.
    pub fn effective_check_revocation(&self) -> bool {
        self.check_online_revocation && !self.accept_all_certificates
    }

    /// Validate structural requirements.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(Error::InvalidArgument("no servers configured".into()));
        }
        if self.primary_nick.is_empty() {
            return Err(Error::InvalidArgument("primary nick must not be empty".into()));
        }
        if self.effective_ident().is_empty() {
            return Err(Error::InvalidArgument("ident must not be empty".into()));
        }
        for server in &self.servers {
            if server.host.is_empty() {
                return Err(Error::InvalidArgument("server host must not be empty".into()));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("network", &self.network)
            .field("servers", &self.servers)
            .field("connect_retries", &self.connect_retries)
            .field("connect_timeout", &self.connect_timeout)
            .field("registration_timeout", &self.registration_timeout)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("primary_nick", &self.primary_nick)
            .field("secondary_nick", &self.secondary_nick)
            .field("ident", &self.ident)
            .field("real_name", &self.real_name)
            .field("server_password", &self.server_password.as_ref().map(|_| "<redacted>"))
            .field("bind_host", &self.bind_host)
            .field("accept_all_certificates", &self.accept_all_certificates)
            .field(
                "trusted_certificate_fingerprints",
                &self.trusted_certificate_fingerprints,
            )
            .field(
                "trusted_public_key_fingerprints",
                &self.trusted_public_key_fingerprints,
            )
            .field("check_online_revocation", &self.check_online_revocation)
            .field("use_sasl", &self.use_sasl)
            .field("abort_on_sasl_failure", &self.abort_on_sasl_failure)
            .field("allow_insecure_sasl_plain", &self.allow_insecure_sasl_plain)
            .field("disabled_sasl_mechs", &self.disabled_sasl_mechs)
            .field("command_options", &self.command_options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> ClientOptions {
        ClientOptions::new("testnet", vec![ServerEntry::tls("irc.example.org", 6697)], "me")
    }

    #[test]
    fn test_defaults() {
        let o = opts();
        assert!(o.use_sasl);
        assert!(o.abort_on_sasl_failure);
        assert!(!o.allow_insecure_sasl_plain);
        assert_eq!(o.effective_ident(), "me");
        assert_eq!(o.effective_real_name(), "me");
        assert_eq!(o.effective_secondary_nick(), "me_");
        o.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_empty() {
        let mut o = opts();
        o.servers.clear();
        assert!(o.validate().is_err());

        let mut o = opts();
        o.primary_nick.clear();
        assert!(o.validate().is_err());

        let mut o = opts();
        o.servers[0].host.clear();
        assert!(o.validate().is_err());
    }

    #[test]
    fn test_accept_all_forces_revocation_off() {
        let mut o = opts();
        o.check_online_revocation = true;
        assert!(o.effective_check_revocation());
        o.accept_all_certificates = true;
        assert!(!o.effective_check_revocation());
    }

    #[test]
    fn test_secondary_nick_override() {
        let mut o = opts();
        o.secondary_nick = Some("backup".into());
        assert_eq!(o.effective_secondary_nick(), "backup");
    }
}
