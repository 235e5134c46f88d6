//! The per-connection message loop.
//!
//! One dispatcher task owns the transport for the lifetime of a
//! connection. It multiplexes inbound commands, queued outbound sends,
//! the liveness timer, and the shutdown token; handles registration, CAP,
//! and SASL; folds state effects through [`super::track`]; and publishes
//! events. The loop never unwinds: every failure funnels into the
//! disconnect path, which faults pending registration and emits
//! `Disconnected`.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::command::{Command, CommandBuilder};
use crate::error::{Error, Result};
use crate::options::ServerEntry;
use crate::state::NetworkState;
use crate::transport::{ChannelBindingKind, Transport};

use super::auth::{ChannelBindings, SaslSession};
use super::cap::CapNegotiator;
use super::pinger::Pinger;
use super::track;
use super::{ClientInner, Event};

/// One queued outbound line with a completion acknowledgement.
pub(crate) struct SendRequest {
    pub(crate) line: String,
    pub(crate) ack: oneshot::Sender<Result<()>>,
}

/// Registration completion latch payload.
pub(crate) type RegistrationResult = std::result::Result<(), String>;

enum Wake {
    Inbound(Result<Command>),
    Send(Option<SendRequest>),
    PingTick,
    PingDeadline,
    Shutdown,
}

pub(crate) struct Dispatcher {
    inner: Arc<ClientInner>,
    transport: Transport,
    server: ServerEntry,
    send_rx: mpsc::Receiver<SendRequest>,
    token: CancellationToken,
    latch: Option<oneshot::Sender<RegistrationResult>>,
    registered: bool,
    nick_fallback_exhausted: bool,
    cap: CapNegotiator,
    sasl: Option<SaslSession>,
    sasl_done: bool,
    pinger: Pinger,
}

impl Dispatcher {
    pub(crate) fn new(
        inner: Arc<ClientInner>,
        transport: Transport,
        server: ServerEntry,
        send_rx: mpsc::Receiver<SendRequest>,
        token: CancellationToken,
        latch: oneshot::Sender<RegistrationResult>,
    ) -> Self {
        let options = &inner.options;
        // SASL is negotiated only when it is wanted *and* at least one
        // mechanism is available for this server.
        let sasl_wanted =
            options.use_sasl && !inner.sasl_factory.supported(options, &server).is_empty();
        let cap = CapNegotiator::new(options.should_enable_cap.clone(), sasl_wanted);
        let pinger = Pinger::new(options.ping_timeout);
        Self {
            inner,
            transport,
            server,
            send_rx,
            token,
            latch: Some(latch),
            registered: false,
            nick_fallback_exhausted: false,
            cap,
            sasl: None,
            sasl_done: false,
            pinger,
        }
    }

    /// Drive the connection until shutdown or failure.
    pub(crate) async fn run(mut self) {
        if let Err(e) = self.handshake().await {
            self.finish(Some(e)).await;
            return;
        }

        let ping_enabled = !self.inner.options.ping_interval.is_zero();
        let period = if ping_enabled {
            self.inner.options.ping_interval
        } else {
            std::time::Duration::from_secs(3600)
        };
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.pinger.earliest_deadline();
            let io_token = self.token.clone();
            let wake = tokio::select! {
                _ = self.token.cancelled() => Wake::Shutdown,
                inbound = self.transport.receive(&io_token) => Wake::Inbound(inbound),
                request = self.send_rx.recv() => Wake::Send(request),
                _ = interval.tick(), if ping_enabled => Wake::PingTick,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() => Wake::PingDeadline,
            };

            match wake {
                Wake::Inbound(Ok(cmd)) => {
                    if let Err(e) = self.handle_inbound(cmd).await {
                        self.finish(Some(e)).await;
                        return;
                    }
                }
                Wake::Inbound(Err(Error::InvalidMessage(msg))) => {
                    // A single unparseable line does not poison the
                    // connection.
                    warn!(%msg, "dropping unparseable line");
                }
                Wake::Inbound(Err(Error::Cancelled)) => {
                    self.finish(None).await;
                    return;
                }
                Wake::Inbound(Err(e)) => {
                    self.finish(Some(e)).await;
                    return;
                }
                Wake::Send(Some(request)) => {
                    match self.transport.send_raw(&request.line, &self.token).await {
                        Ok(()) => {
                            let _ = request.ack.send(Ok(()));
                        }
                        Err(e) => {
                            let reason = e.to_string();
                            let _ = request.ack.send(Err(e));
                            self.finish(Some(Error::Transport(std::io::Error::new(
                                std::io::ErrorKind::BrokenPipe,
                                reason,
                            ))))
                            .await;
                            return;
                        }
                    }
                }
                Wake::Send(None) => {
                    self.finish(None).await;
                    return;
                }
                Wake::PingTick => {
                    if let Some(cookie) = self.pinger.on_tick() {
                        if let Err(e) = self.send_line(&format!("PING {}", cookie)).await {
                            self.finish(Some(e)).await;
                            return;
                        }
                    }
                }
                Wake::PingDeadline => {
                    if self.pinger.expired(Instant::now()) {
                        self.finish(Some(Error::ProtocolViolation("ping timeout".into())))
                            .await;
                        return;
                    }
                }
                Wake::Shutdown => {
                    self.finish(None).await;
                    return;
                }
            }
        }
    }

    //
    // Registration handshake
    //

    async fn handshake(&mut self) -> Result<()> {
        let options = self.inner.options.clone();
        self.send_line("CAP LS 302").await?;
        if let Some(password) = &options.server_password {
            self.send_command(Command::client("PASS").arg(password))
                .await?;
        }
        self.send_command(Command::client("NICK").arg(&options.primary_nick))
            .await?;
        self.send_command(
            Command::client("USER")
                .arg(options.effective_ident())
                .arg("0")
                .arg("*")
                .arg(options.effective_real_name()),
        )
        .await?;
        Ok(())
    }

    //
    // Inbound routing
    //

    async fn handle_inbound(&mut self, cmd: Command) -> Result<()> {
        self.pinger.note_activity();

        if let Some(min) = track::min_arity(cmd.verb()) {
            if cmd.args().len() < min {
                warn!(
                    verb = cmd.verb(),
                    got = cmd.args().len(),
                    want = min,
                    "dropping message below minimum arity"
                );
                return Ok(());
            }
        }

        match cmd.verb() {
            "PONG" => {
                if let Some(token) = cmd.args().last() {
                    self.pinger.on_pong(token);
                }
            }
            "CAP" => {
                let outcome = {
                    let state = self.state();
                    self.cap
                        .handle(&state, &cmd, self.registered, self.sasl_done)
                };
                if let Some(next) = outcome.state {
                    self.swap_state(next);
                }
                for event in outcome.events {
                    self.emit(event);
                }
                self.send_all(&outcome.sends).await?;
                if outcome.start_sasl {
                    self.start_sasl().await?;
                }
            }
            "AUTHENTICATE" => {
                let payload = cmd.arg(0).unwrap_or("").to_string();
                match self.sasl.as_mut() {
                    Some(session) => {
                        let outcome = session.on_authenticate(&payload);
                        self.send_all(&outcome.sends).await?;
                    }
                    None => warn!("unexpected AUTHENTICATE outside a SASL exchange"),
                }
            }
            "432" | "433" if !self.registered => self.on_nick_rejected(&cmd).await?,
            "376" | "422" if !self.registered => {
                let nick = self.state().self_user().nick.clone();
                self.send_command(Command::client("WHO").arg(nick)).await?;
            }
            "315" if !self.registered => {
                self.registered = true;
                if let Some(latch) = self.latch.take() {
                    let _ = latch.send(Ok(()));
                }
            }
            "410" => {
                let failed_end = cmd
                    .arg(1)
                    .is_some_and(|sub| sub.eq_ignore_ascii_case("END"));
                if !failed_end {
                    if let Some(line) = self.cap.cap_end_line() {
                        self.send_line(&line).await?;
                    }
                }
            }
            "900" => {
                if let Some(account) = cmd.arg(2) {
                    let account = account.to_string();
                    let state = self.state();
                    if let Ok(next) = state.with_user_updated(state.self_id(), move |u| {
                        u.account = Some(account);
                    }) {
                        self.swap_state(next);
                    }
                }
            }
            "903" | "907" => self.on_sasl_success().await?,
            "904" | "905" => self.on_sasl_retry().await?,
            "902" | "906" => {
                let reason = cmd
                    .args()
                    .last()
                    .map(String::as_str)
                    .unwrap_or("not authorised")
                    .to_string();
                self.on_sasl_failed(&reason).await?;
            }
            "908" => {
                let list = cmd.arg(1).unwrap_or("").to_string();
                let viable = match self.sasl.as_mut() {
                    Some(session) => session.update_advertised(&list),
                    None => true,
                };
                if !viable {
                    self.on_sasl_failed("no mechanism in common").await?;
                }
            }
            _ => {}
        }

        let state = self.state();
        match track::apply(&state, &cmd) {
            Ok(outcome) => {
                if let Some(next) = outcome.state {
                    self.swap_state(next);
                }
                self.send_all(&outcome.sends).await?;
            }
            Err(e) => {
                // The offending message is logged and withheld from state,
                // but still delivered to subscribers.
                warn!(error = %e, verb = cmd.verb(), "state tracking rejected message");
            }
        }

        self.emit(Event::Command(cmd));
        Ok(())
    }

    async fn on_nick_rejected(&mut self, cmd: &Command) -> Result<()> {
        let attempted = cmd.arg(1).unwrap_or("");
        let options = &self.inner.options;
        let secondary = options.effective_secondary_nick();
        if attempted == options.primary_nick && !self.nick_fallback_exhausted {
            let state = self.state();
            let next_nick = secondary.clone();
            if let Ok(next) = state.with_user_updated(state.self_id(), move |u| {
                u.nick = next_nick;
            }) {
                self.swap_state(next);
            }
            self.send_command(Command::client("NICK").arg(secondary))
                .await?;
        } else if attempted == secondary {
            // Registration will run into its timeout; the connect loop
            // moves on to the next server.
            warn!(nick = %secondary, "fallback nick also rejected, abandoning");
            self.nick_fallback_exhausted = true;
        }
        Ok(())
    }

    //
    // SASL
    //

    async fn start_sasl(&mut self) -> Result<()> {
        let state = self.state();
        let advertised = state.cap_enabled("sasl").1.map(str::to_string);
        let bindings = ChannelBindings {
            unique: self.transport.channel_binding(ChannelBindingKind::Unique),
            endpoint: self.transport.channel_binding(ChannelBindingKind::Endpoint),
        };
        let (session, outcome) = SaslSession::start(
            self.inner.sasl_factory.clone(),
            &self.inner.options,
            &self.server,
            advertised.as_deref(),
            bindings,
        );
        self.sasl = Some(session);
        self.send_all(&outcome.sends).await?;
        if outcome.exhausted {
            self.on_sasl_failed("no usable mechanism").await?;
        }
        Ok(())
    }

    async fn on_sasl_success(&mut self) -> Result<()> {
        self.sasl = None;
        self.sasl_done = true;
        if !self.registered {
            if let Some(line) = self.cap.cap_end_line() {
                self.send_line(&line).await?;
            }
        }
        Ok(())
    }

    async fn on_sasl_retry(&mut self) -> Result<()> {
        let Some(session) = self.sasl.as_mut() else {
            return Ok(());
        };
        let options = self.inner.options.clone();
        let outcome = session.try_next(&options);
        self.send_all(&outcome.sends).await?;
        if outcome.exhausted {
            self.on_sasl_failed("all mechanisms rejected").await?;
        }
        Ok(())
    }

    async fn on_sasl_failed(&mut self, reason: &str) -> Result<()> {
        self.sasl = None;
        if self.inner.options.abort_on_sasl_failure {
            return Err(Error::ProtocolViolation(format!(
                "SASL authentication failed: {}",
                reason
            )));
        }
        debug!(reason, "continuing without SASL");
        if !self.registered {
            if let Some(line) = self.cap.cap_end_line() {
                self.send_line(&line).await?;
            }
        }
        Ok(())
    }

    //
    // Plumbing
    //

    fn state(&self) -> Arc<NetworkState> {
        self.inner.state.read().clone()
    }

    fn swap_state(&self, next: NetworkState) {
        *self.inner.state.write() = Arc::new(next);
    }

    fn emit(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.transport.send_raw(line, &self.token).await
    }

    async fn send_all(&mut self, lines: &[String]) -> Result<()> {
        for line in lines {
            self.send_line(line).await?;
        }
        Ok(())
    }

    async fn send_command(&mut self, builder: CommandBuilder) -> Result<()> {
        let command = builder.build(&self.inner.options.command_options)?;
        self.transport.send(&command, &self.token).await
    }

    /// The single disconnect path: fault pending registration, close the
    /// transport, clear the connection handle, and announce the outcome.
    async fn finish(mut self, error: Option<Error>) {
        let reason = error.map(|e| e.to_string());
        if let Some(latch) = self.latch.take() {
            let _ = latch.send(Err(reason
                .clone()
                .unwrap_or_else(|| "connection closed".to_string())));
        }
        self.transport.disconnect().await;
        *self.inner.conn.lock() = None;
        self.emit(Event::Disconnected {
            network: self.inner.options.network.clone(),
            error: reason,
        });
    }
}
