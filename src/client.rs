use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, ParameterCache};
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AzmError, Result};
use crate::subscription::Subscription;
use crate::supervisor::{Command, Status, Supervisor};
use crate::transport;
use crate::types::{
    ConnectionState, Delivery, DeviceError, FormatTag, ParamEntry, ParameterName,
    ParameterValue, SubscriptionHandle,
};

/// Client for an Atlas AZM4/AZM8 processor
///
/// The `AzmClient` keeps a TCP control connection to the device alive in the
/// background, reconnecting with backoff whenever it drops, and listens for
/// meter pushes on a local UDP port. Subscriptions survive reconnects; one-off
/// requests fail with [`AzmError::ConnectionLost`] instead of being retried.
///
/// Cloning is cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct AzmClient {
    commands: mpsc::UnboundedSender<Command>,
    cache: ParameterCache,
    state: watch::Receiver<ConnectionState>,
    ready: watch::Receiver<bool>,
    transitions: broadcast::Sender<ConnectionState>,
    errors: broadcast::Sender<DeviceError>,
    meter_addr: watch::Receiver<Option<SocketAddr>>,
    cancel: CancellationToken,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl AzmClient {
    /// Start talking to the device described by `config`
    ///
    /// Returns as soon as the background tasks are running; the connection
    /// itself is established asynchronously. Use [`wait_ready`](Self::wait_ready)
    /// to wait for it.
    ///
    /// # Example
    ///
    /// ```no_run
    /// use atlas_azm::{AzmClient, ClientConfig, FormatTag};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = AzmClient::start(ClientConfig::new("192.168.1.50")).await?;
    ///     client.wait_ready().await?;
    ///     client.set("ZoneGain_0", FormatTag::Val, -20.0).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;

        let cache = ParameterCache::new();
        let (errors, _) = broadcast::channel(64);
        let (transitions, _) = broadcast::channel(32);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (ready_tx, ready) = watch::channel(false);
        let (meter_tx, meter_addr) = watch::channel(None);
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        // The meter channel is optional; control works without it
        let socket = match transport::bind_meter_socket(config.udp_port).await {
            Ok(socket) => {
                meter_tx.send_replace(socket.local_addr().ok());
                Some(socket)
            }
            Err(e) => {
                tracing::warn!(
                    "Failed to bind meter socket on port {}: {}, retrying in background",
                    config.udp_port,
                    e
                );
                None
            }
        };
        transport::spawn_meter_listener(
            socket,
            config.udp_port,
            config.meter_rebind_delay,
            events_tx.clone(),
            meter_tx,
            cancel.clone(),
        );

        let supervisor = Supervisor::new(
            config,
            Dispatcher::new(cache.clone(), errors.clone()),
            commands_rx,
            events_tx,
            events_rx,
            Status {
                state: state_tx,
                ready: ready_tx,
                transitions: transitions.clone(),
            },
            cancel.clone(),
        );
        let done = cancel.clone();
        let supervisor = tokio::spawn(async move {
            supervisor.run().await;
            done.cancel();
        });

        Ok(Self {
            commands,
            cache,
            state,
            ready,
            transitions,
            errors,
            meter_addr,
            cancel,
            supervisor: Arc::new(Mutex::new(Some(supervisor))),
        })
    }

    /// Read the current value of a parameter from the device
    pub async fn get(
        &self,
        param: impl Into<ParameterName>,
        format: FormatTag,
    ) -> Result<ParameterValue> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            param: param.into(),
            format,
            reply,
        })?;
        rx.await.map_err(|_| AzmError::Stopped)?
    }

    /// Set a parameter and wait for the device to acknowledge it
    ///
    /// Values are passed through unchecked apart from matching `format`; the
    /// device reports out-of-range input as [`AzmError::Device`].
    pub async fn set(
        &self,
        param: impl Into<ParameterName>,
        format: FormatTag,
        value: impl Into<ParameterValue>,
    ) -> Result<()> {
        let entry = checked_entry(param.into(), format, value.into())?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Set { entry, reply })?;
        rx.await.map_err(|_| AzmError::Stopped)?
    }

    /// Adjust a numeric parameter by `delta`
    pub async fn bump(
        &self,
        param: impl Into<ParameterName>,
        format: FormatTag,
        delta: impl Into<ParameterValue>,
    ) -> Result<()> {
        if format == FormatTag::Str {
            return Err(AzmError::InvalidValue(
                "bump needs a numeric format".to_string(),
            ));
        }
        let entry = checked_entry(param.into(), format, delta.into())?;
        let (reply, rx) = oneshot::channel();
        self.send(Command::Bump { entry, reply })?;
        rx.await.map_err(|_| AzmError::Stopped)?
    }

    /// Subscribe to changes pushed over the control connection
    ///
    /// If a value for `param` in this format is already cached, it is delivered
    /// first.
    pub fn subscribe(
        &self,
        param: impl Into<ParameterName>,
        format: FormatTag,
    ) -> Result<Subscription> {
        self.add_subscription(param.into(), format, Delivery::Control)
    }

    /// Subscribe to a meter, whose values are pushed over UDP
    pub fn subscribe_meter(
        &self,
        param: impl Into<ParameterName>,
        format: FormatTag,
    ) -> Result<Subscription> {
        self.add_subscription(param.into(), format, Delivery::Meter)
    }

    /// End a subscription; unknown handles are ignored
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        self.send(Command::Unsubscribe { handle })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Whether requests are currently accepted
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the connection is up and subscriptions are replayed
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| AzmError::Stopped)
    }

    /// Receiver for every connection state transition from now on
    pub fn state_changes(&self) -> broadcast::Receiver<ConnectionState> {
        self.transitions.subscribe()
    }

    /// Receiver for errors the device reports outside any request
    pub fn device_errors(&self) -> broadcast::Receiver<DeviceError> {
        self.errors.subscribe()
    }

    /// Last known value of `param`
    pub fn read(&self, param: &str) -> Option<CacheEntry> {
        self.cache.read(param)
    }

    pub fn cache(&self) -> &ParameterCache {
        &self.cache
    }

    /// Local address of the meter socket, while it is bound
    pub fn meter_addr(&self) -> Option<SocketAddr> {
        *self.meter_addr.borrow()
    }

    /// Close the connection and stop all background work
    ///
    /// Outstanding requests fail with [`AzmError::Stopped`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.supervisor.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!("Supervisor task failed: {}", e);
            }
        }
    }

    fn add_subscription(
        &self,
        param: ParameterName,
        format: FormatTag,
        delivery: Delivery,
    ) -> Result<Subscription> {
        let handle = SubscriptionHandle::new();
        let (sink, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe {
            handle,
            param: param.clone(),
            format,
            delivery,
            sink,
        })?;
        Ok(Subscription::new(
            handle,
            param,
            format,
            rx,
            self.commands.clone(),
        ))
    }

    fn send(&self, command: Command) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AzmError::Stopped);
        }
        self.commands.send(command).map_err(|_| AzmError::Stopped)
    }
}

impl std::fmt::Debug for AzmClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzmClient")
            .field("state", &self.connection_state())
            .field("ready", &self.is_ready())
            .field("meter_addr", &self.meter_addr())
            .finish()
    }
}

fn checked_entry(
    param: ParameterName,
    format: FormatTag,
    value: ParameterValue,
) -> Result<ParamEntry> {
    if !format.accepts(&value) {
        return Err(AzmError::InvalidValue(format!(
            "{} is not a valid {} value for {}",
            value, format, param
        )));
    }
    // JSON has no encoding for these
    if value.as_f64().is_some_and(|n| !n.is_finite()) {
        return Err(AzmError::InvalidValue(format!(
            "{} is not a finite number for {}",
            value, param
        )));
    }
    Ok(ParamEntry::with_value(param, format, value))
}
