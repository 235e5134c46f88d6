//! # slirc-client
//!
//! An IRCv3 client library: wire codec, TCP/TLS transport, immutable
//! network state tracking, and a rate-limited send pipeline.
//!
//! ## Features
//!
//! - IRC message parsing and serialization with IRCv3 message tags
//! - TLS with pluggable certificate trust (fingerprint pinning, ALPN)
//! - Registration with CAP negotiation and SASL (PLAIN, EXTERNAL,
//!   pluggable mechanisms with TLS channel binding)
//! - Case-mapping-aware network state snapshots with structural sharing
//! - PING/PONG liveness and server-rotation reconnection
//! - Rate-limited sends with deferred response correlation
//! - `draft/multiline` message batching
//!
//! ## Quick Start
//!
//! ```no_run
//! use slirc_client::{Client, ClientOptions, Event, MessageKind, ServerEntry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> slirc_client::Result<()> {
//! let mut options = ClientOptions::new(
//!     "libera",
//!     vec![ServerEntry::tls("irc.libera.chat", 6697)],
//!     "mynick",
//! );
//! options.account_password = Some("hunter2".into());
//!
//! let client = Client::new(options)?;
//! let mut events = client.subscribe()?;
//! client.connect(&CancellationToken::new()).await?;
//!
//! for cmd in client.prepare_message(MessageKind::Message, "#rust", "hello!", None, None)? {
//!     client.send(cmd).await?;
//! }
//!
//! while let Ok(event) = events.recv().await {
//!     if let Event::Command(cmd) = event {
//!         println!("<- {}", cmd);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod casemap;
pub mod client;
pub mod command;
pub mod error;
pub mod isupport;
pub mod options;
pub mod ratelimit;
pub mod sasl;
pub mod state;
pub mod transport;
pub mod util;

pub use self::casemap::CaseMapping;
pub use self::client::{CapSubcommand, Client, DeferredCommand, Event, MessageKind};
pub use self::command::{Command, CommandBuilder, CommandKind, CommandOptions};
pub use self::error::{Error, Result};
pub use self::isupport::{ChanModeClass, ChanModes, Isupport, PrefixSpec};
pub use self::options::{ClientOptions, ServerEntry};
pub use self::ratelimit::{Lease, RateLimiter, TokenBucketLimiter, UnlimitedRateLimiter};
pub use self::sasl::{
    DefaultSaslFactory, ExternalMechanism, PlainMechanism, SaslMechanism, SaslMechanismFactory,
};
pub use self::state::{ChannelId, ChannelRecord, NetworkState, UserId, UserRecord};
pub use self::transport::{ChannelBindingKind, Transport};
