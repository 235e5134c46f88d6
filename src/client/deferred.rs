//! Deferred response correlation.
//!
//! A [`DeferredCommand`] pairs a sent command with the stream of commands
//! received after it, so callers can compose "send, then await the first
//! reply matching a predicate, failing on an error numeric, within a
//! window". Each deferred command holds its own event subscription,
//! dropped on resolution.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::command::Command;
use crate::error::{Error, Result};

use super::Event;

/// A sent command plus the inbound commands that followed it.
pub struct DeferredCommand {
    command: Command,
    events: broadcast::Receiver<Event>,
}

impl DeferredCommand {
    pub(crate) fn new(command: Command, events: broadcast::Receiver<Event>) -> Self {
        Self { command, events }
    }

    /// The command that was sent.
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// The next inbound command. Fails with [`Error::Disposed`] once the
    /// client's event stream has ended.
    pub async fn next_command(&mut self) -> Result<Command> {
        loop {
            match self.events.recv().await {
                Ok(Event::Command(cmd)) => return Ok(cmd),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "deferred command subscription lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(Error::Disposed),
            }
        }
    }

    /// The first inbound command matching `matches` within `window`.
    /// Returns `None` when the window elapses.
    pub async fn first_match(
        &mut self,
        mut matches: impl FnMut(&Command) -> bool,
        window: Duration,
    ) -> Result<Option<Command>> {
        let wait = async {
            loop {
                let cmd = self.next_command().await?;
                if matches(&cmd) {
                    return Ok(Some(cmd));
                }
            }
        };
        if window.is_zero() {
            return wait.await;
        }
        match tokio::time::timeout(window, wait).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// The first inbound command matching `matches`; an earlier command
    /// matching `fails` (typically an error numeric) resolves as a
    /// protocol error instead. A window of zero waits indefinitely; an
    /// elapsed window fails with [`Error::Cancelled`].
    pub async fn response(
        mut self,
        mut matches: impl FnMut(&Command) -> bool,
        mut fails: impl FnMut(&Command) -> bool,
        window: Duration,
    ) -> Result<Command> {
        let found = self
            .first_match(|cmd| matches(cmd) || fails(cmd), window)
            .await?
            .ok_or(Error::Cancelled)?;
        if fails(&found) && !matches(&found) {
            return Err(Error::ProtocolViolation(format!(
                "error reply: {}",
                found.to_wire()
            )));
        }
        Ok(found)
    }
}
