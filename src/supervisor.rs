//! Connection state machine and the single event loop that owns all client
//! state.
//!
//! Disconnected -> Connecting -> Connected -> (link down) -> Backoff ->
//! Connecting -> ... until shut down. Client commands, socket events, the
//! timeout sweep, batch flushes and keep-alives are all handled on this one
//! task, so the registry, request table and connection state need no locks.

use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{AzmError, Result};
use crate::keepalive::KeepAlive;
use crate::outbox::{Batch, Outbox, Outgoing};
use crate::pending::{Expect, Failure, Waiter, KEEPALIVE_PARAM};
use crate::protocol::{Method, Params, Request};
use crate::transport::{self, Event, Link, TcpTransport};
use crate::types::{
    ConnectionState, Delivery, FormatTag, ParamEntry, ParameterName, ParameterUpdate,
    ParameterValue, SubscriptionHandle,
};

/// Requests from client handles
#[derive(Debug)]
pub(crate) enum Command {
    Get {
        param: ParameterName,
        format: FormatTag,
        reply: oneshot::Sender<Result<ParameterValue>>,
    },
    Set {
        entry: ParamEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    Bump {
        entry: ParamEntry,
        reply: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        handle: SubscriptionHandle,
        param: ParameterName,
        format: FormatTag,
        delivery: Delivery,
        sink: mpsc::UnboundedSender<ParameterUpdate>,
    },
    Unsubscribe {
        handle: SubscriptionHandle,
    },
}

/// Observable connection status
pub(crate) struct Status {
    pub state: watch::Sender<ConnectionState>,
    pub ready: watch::Sender<bool>,
    pub transitions: broadcast::Sender<ConnectionState>,
}

enum LinkState {
    Idle,
    Connecting,
    Up { transport: TcpTransport, since: Instant },
    Waiting { until: Instant },
}

pub(crate) struct Supervisor {
    config: ClientConfig,
    dispatcher: Dispatcher,
    outbox: Outbox,
    keepalive: KeepAlive,
    backoff: Backoff,
    link: LinkState,
    ready: bool,
    epoch: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    status: Status,
    cancel: CancellationToken,
}

impl Supervisor {
    pub(crate) fn new(
        config: ClientConfig,
        dispatcher: Dispatcher,
        commands: mpsc::UnboundedReceiver<Command>,
        events_tx: mpsc::UnboundedSender<Event>,
        events: mpsc::UnboundedReceiver<Event>,
        status: Status,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            outbox: Outbox::new(
                config.batch_window,
                config.max_batch_size,
                config.min_batch_interval,
            ),
            keepalive: KeepAlive::new(config.keepalive_interval, config.keepalive_max_misses),
            backoff: Backoff::new(
                config.backoff_floor,
                config.backoff_ceiling,
                config.stability_threshold,
            ),
            config,
            dispatcher,
            link: LinkState::Idle,
            ready: false,
            epoch: 0,
            commands,
            events_tx,
            events,
            status,
            cancel,
        }
    }

    pub(crate) async fn run(mut self) {
        self.begin_connect();

        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let reconnect_at = match &self.link {
                LinkState::Waiting { until } => Some(*until),
                _ => None,
            };
            let flush_at = match &self.link {
                LinkState::Up { .. } => self.outbox.due_at(),
                _ => None,
            };
            let keepalive_at = self.keepalive.due_at();

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle_event(event),
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::debug!("All client handles dropped");
                        break;
                    }
                },
                _ = sweep.tick() => self.sweep(),
                _ = sleep_until_opt(reconnect_at) => self.begin_connect(),
                _ = sleep_until_opt(flush_at) => self.flush(),
                _ = sleep_until_opt(keepalive_at) => self.send_keepalive(),
            }
        }

        self.stop();
    }

    // ========== Connection lifecycle ==========

    fn begin_connect(&mut self) {
        self.epoch += 1;
        let epoch = self.epoch;
        self.link = LinkState::Connecting;
        self.set_state(ConnectionState::Connecting);

        let host = self.config.host.clone();
        let port = self.config.tcp_port;
        let limit = self.config.connect_timeout;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = transport::connect(&host, port, limit).await;
            let _ = events.send(Event::Connected { epoch, result });
        });
    }

    fn on_connected(&mut self, epoch: u64, result: Result<tokio::net::TcpStream>) {
        if epoch != self.epoch || !matches!(self.link, LinkState::Connecting) {
            return;
        }

        match result {
            Ok(stream) => {
                let now = Instant::now();
                tracing::info!("TCP connection established to {}:{}", self.config.host, self.config.tcp_port);
                let transport = TcpTransport::spawn(stream, epoch, self.events_tx.clone());
                self.link = LinkState::Up {
                    transport,
                    since: now,
                };
                self.set_state(ConnectionState::Connected);
                self.outbox.hold_until(now + self.config.settle_delay);
                self.queue_replay(now);
            }
            Err(e) => {
                tracing::warn!("Failed to connect: {}", e);
                self.enter_backoff(None);
            }
        }
    }

    /// Re-send every subscription; the link counts as ready once this drains
    fn queue_replay(&mut self, now: Instant) {
        let entries = self.dispatcher.registry.replay_entries();
        tracing::info!("Replaying {} subscriptions", entries.len());

        for entry in &entries {
            self.outbox.push(Outgoing::Sub(entry.clone()), now);
        }
        if self.config.prime_on_subscribe {
            for entry in entries {
                self.outbox.push(Outgoing::Get { entry, waiter: None }, now);
            }
        }
        self.outbox.push(Outgoing::Ready, now);
    }

    fn link_lost(&mut self, reason: &str) {
        let uptime = match std::mem::replace(&mut self.link, LinkState::Idle) {
            LinkState::Up { transport, since } => {
                drop(transport);
                since.elapsed()
            }
            other => {
                self.link = other;
                return;
            }
        };

        tracing::warn!("Lost connection to AZM after {:?}: {}", uptime, reason);
        self.set_ready(false);
        self.keepalive.stop();
        let failed = self.abort_outstanding(Failure::ConnectionLost);
        if failed > 0 {
            tracing::info!("Failed {} outstanding requests", failed);
        }
        self.enter_backoff(Some(uptime));
    }

    fn enter_backoff(&mut self, uptime: Option<Duration>) {
        let delay = match uptime {
            Some(uptime) => self.backoff.link_lost(uptime),
            None => self.backoff.next_delay(),
        };
        tracing::info!("Reconnecting in {:?}", delay);
        self.link = LinkState::Waiting {
            until: Instant::now() + delay,
        };
        self.set_state(ConnectionState::Backoff);
    }

    fn stop(&mut self) {
        tracing::info!("Disconnected from AZM");
        self.link = LinkState::Idle;
        self.keepalive.stop();
        self.set_ready(false);
        self.abort_outstanding(Failure::Stopped);

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Get { reply, .. } => {
                    let _ = reply.send(Err(AzmError::Stopped));
                }
                Command::Set { reply, .. } | Command::Bump { reply, .. } => {
                    let _ = reply.send(Err(AzmError::Stopped));
                }
                Command::Subscribe { .. } | Command::Unsubscribe { .. } => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Fail pending and queued requests; returns how many were pending
    fn abort_outstanding(&mut self, failure: Failure) -> usize {
        let pending = self.dispatcher.pending.len();
        self.dispatcher.pending.fail_all(failure.clone());

        for item in self.outbox.drain() {
            match item {
                Outgoing::Get {
                    waiter: Some(tx), ..
                } => {
                    Waiter::Value(tx).fail(&failure);
                }
                Outgoing::Set { waiter, .. } | Outgoing::Bump { waiter, .. } => {
                    Waiter::Ack(waiter).fail(&failure);
                }
                // replay restores subscriptions on the next link
                _ => {}
            }
        }
        pending
    }

    // ========== Event handling ==========

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connected { epoch, result } => self.on_connected(epoch, result),
            Event::Frame { link, message } => {
                if let Link::Tcp(epoch) = link {
                    if epoch != self.epoch {
                        tracing::trace!("Dropping frame from stale connection {}", epoch);
                        return;
                    }
                }
                let settled = self.dispatcher.dispatch(link, message, Instant::now());
                if settled.keepalive_acked {
                    self.keepalive.acked();
                }
            }
            Event::LinkDown { epoch, reason } => {
                if epoch == self.epoch {
                    self.link_lost(&reason);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Get {
                param,
                format,
                reply,
            } => {
                if !self.ready {
                    let _ = reply.send(Err(AzmError::NotConnected));
                    return;
                }
                let entry = ParamEntry::format_only(param, format);
                self.outbox.push(
                    Outgoing::Get {
                        entry,
                        waiter: Some(reply),
                    },
                    now,
                );
            }
            Command::Set { entry, reply } => {
                if !self.ready {
                    let _ = reply.send(Err(AzmError::NotConnected));
                    return;
                }
                self.outbox.push(Outgoing::Set { entry, waiter: reply }, now);
            }
            Command::Bump { entry, reply } => {
                if !self.ready {
                    let _ = reply.send(Err(AzmError::NotConnected));
                    return;
                }
                self.outbox.push(Outgoing::Bump { entry, waiter: reply }, now);
            }
            Command::Subscribe {
                handle,
                param,
                format,
                delivery,
                sink,
            } => {
                if let Some(cached) = self.dispatcher.cache().read(&param) {
                    if cached.format == format {
                        let _ = sink.send(ParameterUpdate {
                            param: param.clone(),
                            format,
                            value: cached.value,
                        });
                    }
                }

                let first =
                    self.dispatcher
                        .registry
                        .subscribe(handle, param.clone(), format, delivery, sink);
                tracing::debug!(
                    "Subscribed to {} ({}), {} references",
                    param,
                    format,
                    self.dispatcher.registry.references(&param, format)
                );

                if first && matches!(self.link, LinkState::Up { .. }) {
                    let entry = ParamEntry::format_only(param, format);
                    self.outbox.push(Outgoing::Sub(entry.clone()), now);
                    if self.config.prime_on_subscribe {
                        self.outbox.push(Outgoing::Get { entry, waiter: None }, now);
                    }
                }
            }
            Command::Unsubscribe { handle } => {
                if let Some(entry) = self.dispatcher.registry.unsubscribe(handle) {
                    tracing::debug!("Unsubscribed from {} ({})", entry.param, entry.format);
                    if matches!(self.link, LinkState::Up { .. }) {
                        self.outbox.push(Outgoing::Unsub(entry), now);
                    }
                }
            }
        }
    }

    // ========== Timers ==========

    fn sweep(&mut self) {
        if self.dispatcher.pending.is_empty() {
            return;
        }
        let settled = self.dispatcher.pending.expire(Instant::now());
        if settled.resolved > 0 {
            tracing::debug!("{} requests timed out", settled.resolved);
        }
        if settled.keepalive_missed {
            tracing::warn!("Keep-alive timed out");
            if self.keepalive.missed() {
                self.link_lost("keep-alive timed out");
            }
        }
    }

    fn flush(&mut self) {
        let now = Instant::now();
        let LinkState::Up { transport, .. } = &self.link else {
            return;
        };
        let Some(batch) = self.outbox.pop_batch(now) else {
            return;
        };

        let (method, items) = match batch {
            Batch::Ready => {
                self.set_ready(true);
                self.keepalive.start(now);
                tracing::info!(
                    "AZM ready with {} subscriptions",
                    self.dispatcher.registry.len()
                );
                return;
            }
            Batch::Wire { method, items } => (method, items),
        };

        let timeout = self.config.request_timeout;
        let mut entries = Vec::with_capacity(items.len());
        let mut acks = Vec::new();
        for item in items {
            match item {
                Outgoing::Sub(entry) | Outgoing::Unsub(entry) => entries.push(entry),
                Outgoing::Get { entry, waiter } => {
                    if let Some(tx) = waiter {
                        self.dispatcher.pending.issue(
                            Expect::Value {
                                param: entry.param.clone(),
                                format: entry.format,
                            },
                            vec![Waiter::Value(tx)],
                            now,
                            timeout,
                        );
                    }
                    entries.push(entry);
                }
                Outgoing::Set { entry, waiter } | Outgoing::Bump { entry, waiter } => {
                    acks.push(Waiter::Ack(waiter));
                    entries.push(entry);
                }
                Outgoing::Ready => {}
            }
        }

        let mut request = Request::new(method, Params::from_entries(entries));
        if !acks.is_empty() {
            let id = self.dispatcher.pending.issue(Expect::Ack, acks, now, timeout);
            request = request.with_id(id);
        }
        transport.send(request);
        tracing::trace!("{} requests still queued", self.outbox.len());
    }

    fn send_keepalive(&mut self) {
        let now = Instant::now();
        let LinkState::Up { transport, .. } = &self.link else {
            self.keepalive.stop();
            return;
        };

        let id = self.dispatcher.pending.issue(
            Expect::KeepAlive,
            vec![Waiter::KeepAlive],
            now,
            self.config.request_timeout,
        );
        let request = Request::new(
            Method::Get,
            Params::Single(ParamEntry::format_only(KEEPALIVE_PARAM, FormatTag::Str)),
        )
        .with_id(id);
        transport.send(request);
        self.keepalive.sent(now);
        tracing::debug!("Sent keep-alive {}", id);
    }

    // ========== Status ==========

    fn set_state(&self, state: ConnectionState) {
        if *self.status.state.borrow() == state {
            return;
        }
        tracing::debug!("Connection state: {}", state);
        self.status.state.send_replace(state);
        let _ = self.status.transitions.send(state);
    }

    fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
        self.status.ready.send_replace(ready);
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
