//! The IRC client engine.
//!
//! A [`Client`] manages one connection to one network: it walks the
//! configured server rotation, performs registration with CAP negotiation
//! and SASL, keeps an immutable [`NetworkState`] snapshot up to date, and
//! exposes a rate-limited send path with deferred-response correlation.
//!
//! The engine runs as a single dispatcher task per connection; consumers
//! observe it through the broadcast [`Event`] stream, which delivers
//! commands in wire order.

mod auth;
mod cap;
mod deferred;
mod dispatcher;
mod pinger;
mod prepare;
mod track;

pub use deferred::DeferredCommand;
pub use prepare::MessageKind;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{Command, CommandKind};
use crate::error::{Error, Result};
use crate::options::ClientOptions;
use crate::ratelimit::{RateLimiter, TokenBucketLimiter};
use crate::sasl::{DefaultSaslFactory, SaslMechanismFactory};
use crate::state::NetworkState;
use crate::transport::Transport;

use dispatcher::{Dispatcher, SendRequest};

/// Which CAP subcommand produced a capability event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapSubcommand {
    /// `CAP LS` advertisement.
    Ls,
    /// `CAP ACK` acknowledgement.
    Ack,
    /// `CAP LIST` of currently enabled capabilities.
    List,
    /// `CAP NEW` mid-session advertisement.
    New,
    /// `CAP DEL` withdrawal.
    Del,
    /// `CAP NAK` rejection.
    Nak,
}

/// Events published by the engine.
#[derive(Clone, Debug)]
pub enum Event {
    /// A connection attempt is underway.
    Connecting {
        /// The configured network name.
        network: String,
    },
    /// Registration completed; the connection is usable.
    Connected {
        /// The configured network name.
        network: String,
    },
    /// The connection ended, with the failure reason when abnormal.
    Disconnected {
        /// The configured network name.
        network: String,
        /// Human-readable cause, absent for a local disconnect.
        error: Option<String>,
    },
    /// One inbound command, in wire order.
    Command(Command),
    /// A capability became enabled.
    CapEnabled {
        /// Capability name.
        cap: String,
        /// Server-advertised value, if any.
        value: Option<String>,
        /// The subcommand that enabled it.
        subcommand: CapSubcommand,
    },
    /// A capability became disabled.
    CapDisabled {
        /// Capability name.
        cap: String,
        /// Server-advertised value, if any.
        value: Option<String>,
        /// The subcommand that disabled it.
        subcommand: CapSubcommand,
    },
}

pub(crate) struct ConnHandle {
    send_tx: mpsc::Sender<SendRequest>,
    token: CancellationToken,
}

pub(crate) struct ClientInner {
    pub(crate) options: ClientOptions,
    pub(crate) state: RwLock<Arc<NetworkState>>,
    pub(crate) events: broadcast::Sender<Event>,
    pub(crate) rate_limiter: Arc<dyn RateLimiter>,
    pub(crate) sasl_factory: Arc<dyn SaslMechanismFactory>,
    pub(crate) disposed: AtomicBool,
    pub(crate) dispose_token: CancellationToken,
    pub(crate) conn: Mutex<Option<ConnHandle>>,
}

/// One IRC network connection manager.
///
/// Cloning the handle is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client with the default rate limiter and SASL mechanisms.
    pub fn new(options: ClientOptions) -> Result<Self> {
        Self::with_collaborators(
            options,
            Arc::new(TokenBucketLimiter::default()),
            Arc::new(DefaultSaslFactory),
        )
    }

    /// Create a client with explicit collaborators.
    pub fn with_collaborators(
        options: ClientOptions,
        rate_limiter: Arc<dyn RateLimiter>,
        sasl_factory: Arc<dyn SaslMechanismFactory>,
    ) -> Result<Self> {
        options.validate()?;
        let (events, _) = broadcast::channel(256);
        let state = NetworkState::new(&options.network, &options.primary_nick);
        Ok(Self {
            inner: Arc::new(ClientInner {
                state: RwLock::new(Arc::new(state)),
                options,
                events,
                rate_limiter,
                sasl_factory,
                disposed: AtomicBool::new(false),
                dispose_token: CancellationToken::new(),
                conn: Mutex::new(None),
            }),
        })
    }

    fn ensure_live(&self) -> Result<()> {
        if self.inner.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    fn conn_handle(&self) -> Result<(mpsc::Sender<SendRequest>, CancellationToken)> {
        let conn = self.inner.conn.lock();
        match conn.as_ref() {
            Some(handle) => Ok((handle.send_tx.clone(), handle.token.clone())),
            None => Err(Error::BadState("not connected".into())),
        }
    }

    /// Subscribe to the engine's event stream. Events arrive in emit
    /// order; commands in wire order.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<Event>> {
        self.ensure_live()?;
        Ok(self.inner.events.subscribe())
    }

    /// The current immutable state snapshot.
    pub fn state(&self) -> Result<Arc<NetworkState>> {
        self.ensure_live()?;
        Ok(self.inner.state.read().clone())
    }

    /// Whether a registered connection is currently up.
    pub fn is_connected(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    /// Connect and register, walking the server rotation up to
    /// `1 + connect_retries` times.
    ///
    /// Returns once registration completes; the connection then runs in
    /// the background until `disconnect`, a transport fault, or a ping
    /// timeout, announced by `Disconnected`. Reconnection after that is
    /// the caller's decision, by calling `connect` again.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live()?;
        if self.is_connected() {
            return Err(Error::BadState("already connected".into()));
        }
        let options = &self.inner.options;
        let mut attempts = 0usize;

        for pass in 0..=options.connect_retries {
            for server in &options.servers {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                self.ensure_live()?;
                attempts += 1;
                debug!(%server, pass, "connecting");

                // Fresh state for every attempt.
                *self.inner.state.write() = Arc::new(NetworkState::new(
                    &options.network,
                    &options.primary_nick,
                ));

                // The per-server timeout and the caller's cancel are kept
                // distinguishable: a timeout moves to the next server, a
                // caller cancel propagates.
                let io_token = cancel.child_token();
                let connected = {
                    let connect_fut = Transport::connect(server, options, &io_token);
                    if options.connect_timeout.is_zero() {
                        connect_fut.await
                    } else {
                        tokio::select! {
                            result = connect_fut => result,
                            _ = tokio::time::sleep(options.connect_timeout) => {
                                io_token.cancel();
                                Err(Error::Cancelled)
                            }
                        }
                    }
                };
                let transport = match connected {
                    Ok(transport) => transport,
                    Err(Error::Cancelled) if cancel.is_cancelled() => {
                        return Err(Error::Cancelled)
                    }
                    Err(Error::Cancelled) => {
                        warn!(%server, "connect timed out");
                        continue;
                    }
                    Err(e) => {
                        warn!(%server, error = %e, "connect failed");
                        continue;
                    }
                };

                self.emit(Event::Connecting {
                    network: options.network.clone(),
                });

                let (send_tx, send_rx) = mpsc::channel(64);
                let (latch_tx, latch_rx) = oneshot::channel();
                let conn_token = self.inner.dispose_token.child_token();
                let dispatcher = Dispatcher::new(
                    self.inner.clone(),
                    transport,
                    server.clone(),
                    send_rx,
                    conn_token.clone(),
                    latch_tx,
                );
                // The handle must exist before registration completes so
                // subscribers reacting to `Connected` can send.
                *self.inner.conn.lock() = Some(ConnHandle {
                    send_tx,
                    token: conn_token.clone(),
                });
                tokio::spawn(dispatcher.run());

                let registration = async {
                    match latch_rx.await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(reason)) => Err(Error::BadState(reason)),
                        Err(_) => Err(Error::BadState("connection task ended".into())),
                    }
                };
                let outcome = if options.registration_timeout.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        result = registration => result,
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => Err(Error::Cancelled),
                        _ = tokio::time::sleep(options.registration_timeout) => {
                            Err(Error::BadState("registration timed out".into()))
                        }
                        result = registration => result,
                    }
                };

                match outcome {
                    Ok(()) => {
                        self.emit(Event::Connected {
                            network: options.network.clone(),
                        });
                        return Ok(());
                    }
                    Err(Error::Cancelled) => {
                        conn_token.cancel();
                        *self.inner.conn.lock() = None;
                        return Err(Error::Cancelled);
                    }
                    Err(e) => {
                        warn!(%server, error = %e, "registration failed");
                        conn_token.cancel();
                        *self.inner.conn.lock() = None;
                    }
                }
            }
        }
        Err(Error::ConnectExhausted { attempts })
    }

    /// Send a command through the rate-limited path.
    ///
    /// Returns a [`DeferredCommand`] subscribed to all commands received
    /// after the send, for reply correlation.
    pub async fn send(&self, command: Command) -> Result<DeferredCommand> {
        self.ensure_live()?;
        let (send_tx, token) = self.conn_handle()?;

        let lease = self.inner.rate_limiter.acquire(&command, &token).await?;
        if !lease.is_acquired() {
            return Err(Error::RateLimitRejected {
                reason: lease
                    .reason()
                    .unwrap_or("lease not acquired")
                    .to_string(),
            });
        }

        // Subscribe before the bytes hit the wire so no reply is missed.
        let events = self.inner.events.subscribe();
        let (ack_tx, ack_rx) = oneshot::channel();
        send_tx
            .send(SendRequest {
                line: command.to_wire(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::BadState("connection closed".into()))?;
        lease.release();

        match ack_rx.await {
            Ok(Ok(())) => Ok(DeferredCommand::new(command, events)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::BadState("connection closed".into())),
        }
    }

    /// Parse `line` as a client command, validate it against the codec
    /// budgets as the server will relay it (with our hostmask as source),
    /// and send it through the rate-limited path.
    pub async fn send_raw(&self, line: &str) -> Result<DeferredCommand> {
        self.ensure_live()?;
        let command = Command::parse(CommandKind::Client, line)?;
        let hostmask = self.state()?.self_user().hostmask();
        command
            .clone()
            .with_source(Some(hostmask))?
            .check_budgets(&self.inner.options.command_options)?;
        self.send(command).await
    }

    /// Write `line` verbatim (plus CR LF), bypassing parsing, rebuilding,
    /// and rate limiting.
    ///
    /// Reserved for protocol-layer traffic; never expose it to untrusted
    /// input.
    pub async fn unsafe_send_raw(&self, line: &str) -> Result<()> {
        self.ensure_live()?;
        let (send_tx, _) = self.conn_handle()?;
        let (ack_tx, ack_rx) = oneshot::channel();
        send_tx
            .send(SendRequest {
                line: line.to_string(),
                ack: ack_tx,
            })
            .await
            .map_err(|_| Error::BadState("connection closed".into()))?;
        match ack_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::BadState("connection closed".into())),
        }
    }

    /// Prepare a PRIVMSG/NOTICE for `target`, splitting `text` across as
    /// many wire lines as needed and batching with `draft/multiline`
    /// when negotiated. The returned commands are ready for [`send`].
    ///
    /// [`send`]: Self::send
    pub fn prepare_message(
        &self,
        kind: MessageKind,
        target: &str,
        text: &str,
        tags: Option<&BTreeMap<String, Option<String>>>,
        shared_channel: Option<&str>,
    ) -> Result<Vec<Command>> {
        self.ensure_live()?;
        let state = self.inner.state.read().clone();
        let empty = BTreeMap::new();
        prepare::prepare_message(
            &state,
            kind,
            target,
            text,
            tags.unwrap_or(&empty),
            shared_channel,
        )
    }

    /// Disconnect locally: send `QUIT` (errors swallowed), then close the
    /// connection. `Disconnected` is emitted with no error.
    pub async fn disconnect(&self, reason: Option<&str>) -> Result<()> {
        self.ensure_live()?;
        let handle = {
            let mut conn = self.inner.conn.lock();
            conn.take()
        };
        let Some(handle) = handle else {
            return Ok(());
        };

        let quit = match reason {
            Some(reason) => format!("QUIT :{}", reason),
            None => "QUIT".to_string(),
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if handle
            .send_tx
            .send(SendRequest {
                line: quit,
                ack: ack_tx,
            })
            .await
            .is_ok()
        {
            // Best effort: the connection may already be gone.
            let _ = ack_rx.await;
        }
        handle.token.cancel();
        Ok(())
    }

    /// Tear the client down: cancel the dispatcher, end the event stream,
    /// and fail every later call with [`Error::Disposed`].
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.dispose_token.cancel();
        *self.inner.conn.lock() = None;
    }
}
