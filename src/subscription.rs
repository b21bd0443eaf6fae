use tokio::sync::mpsc;

use crate::error::{AzmError, Result};
use crate::supervisor::Command;
use crate::types::{FormatTag, ParameterName, ParameterUpdate, SubscriptionHandle};

/// Receiver for value changes of one subscribed parameter
///
/// Obtained from [`AzmClient::subscribe`](crate::AzmClient::subscribe). The
/// subscription survives reconnects and ends when this receiver is dropped
/// or its [`handle`](Self::handle) is passed to
/// [`AzmClient::unsubscribe`](crate::AzmClient::unsubscribe).
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    param: ParameterName,
    format: FormatTag,
    rx: mpsc::UnboundedReceiver<ParameterUpdate>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub(crate) fn new(
        handle: SubscriptionHandle,
        param: ParameterName,
        format: FormatTag,
        rx: mpsc::UnboundedReceiver<ParameterUpdate>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            handle,
            param,
            format,
            rx,
            commands,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Subscribed parameter name
    pub fn param(&self) -> &str {
        &self.param
    }

    pub fn format(&self) -> FormatTag {
        self.format
    }

    /// Receive the next value change
    ///
    /// Fails with [`AzmError::Stopped`] once the subscription was removed or
    /// the client shut down.
    pub async fn recv(&mut self) -> Result<ParameterUpdate> {
        self.rx.recv().await.ok_or(AzmError::Stopped)
    }

    /// Try to receive a value change without blocking
    ///
    /// Returns `None` if no update is available.
    pub fn try_recv(&mut self) -> Result<Option<ParameterUpdate>> {
        match self.rx.try_recv() {
            Ok(update) => Ok(Some(update)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(AzmError::Stopped),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // a second unsubscribe for the same handle is ignored
        let _ = self.commands.send(Command::Unsubscribe {
            handle: self.handle,
        });
    }
}
