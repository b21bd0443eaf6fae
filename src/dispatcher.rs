//! Routes decoded frames from both channels.
//!
//! Values go to the cache first, then to subscribers, then to any request
//! waiting on them. Nothing in a payload can take the link down.

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::cache::ParameterCache;
use crate::pending::{PendingTable, Settled};
use crate::protocol::Message;
use crate::registry::SubscriptionRegistry;
use crate::transport::Link;
use crate::types::{DeviceError, ParamEntry};

pub(crate) struct Dispatcher {
    pub(crate) registry: SubscriptionRegistry,
    pub(crate) pending: PendingTable,
    cache: ParameterCache,
    errors: broadcast::Sender<DeviceError>,
}

impl Dispatcher {
    pub(crate) fn new(cache: ParameterCache, errors: broadcast::Sender<DeviceError>) -> Self {
        Self {
            registry: SubscriptionRegistry::new(),
            pending: PendingTable::new(),
            cache,
            errors,
        }
    }

    pub(crate) fn cache(&self) -> &ParameterCache {
        &self.cache
    }

    pub(crate) fn dispatch(&mut self, link: Link, message: Message, now: Instant) -> Settled {
        match message {
            Message::Update(entries) | Message::GetResp(entries) => {
                self.apply_values(link, entries, now)
            }
            Message::Response { id, error } => {
                if let Some(message) = &error {
                    tracing::warn!("Device rejected request {}: {}", id, message);
                }
                if let Some(settled) = self.pending.resolve_id(id, error.clone()) {
                    return settled;
                }
                // nobody waits for it anymore, e.g. the request already timed out
                match error {
                    Some(message) => {
                        let _ = self.errors.send(DeviceError {
                            message,
                            id: Some(id),
                        });
                    }
                    None => tracing::debug!("Dropping response for unknown request {}", id),
                }
                Settled::default()
            }
            Message::DeviceError(error) => {
                tracing::warn!("Error from AZM: {}", error.message);
                let _ = self.errors.send(error);
                Settled::default()
            }
            Message::Request(request) => {
                tracing::debug!(
                    "Dropping unexpected {} request from device",
                    request.method.as_str()
                );
                Settled::default()
            }
        }
    }

    fn apply_values(&mut self, link: Link, entries: Vec<ParamEntry>, now: Instant) -> Settled {
        let mut settled = Settled::default();

        for ParamEntry {
            param,
            format,
            value,
        } in entries
        {
            let Some(value) = value else {
                tracing::debug!("Ignoring {} entry without a value", param);
                continue;
            };

            if link == Link::Udp && !self.registry.accepts_meter(&param, format) {
                tracing::trace!("Discarding unsolicited meter value for {}", param);
                continue;
            }

            self.cache.write(&param, format, value.clone(), now);
            let delivered = self.registry.notify(&param, format, &value);
            tracing::trace!("{} = {} ({} subscribers)", param, value, delivered);

            let resolved = self.pending.resolve_value(&param, format, &value);
            settled.resolved += resolved.resolved;
            settled.keepalive_acked |= resolved.keepalive_acked;
        }

        settled
    }
}
