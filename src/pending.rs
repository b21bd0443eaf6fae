//! Request correlation table.
//!
//! Every entry is resolved exactly once: by a matching reply, by the periodic
//! timeout sweep, or by a link loss. Removal from the map is what guarantees it.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::AzmError;
use crate::types::{FormatTag, ParameterValue};

/// Parameter polled by the keep-alive
pub(crate) const KEEPALIVE_PARAM: &str = "KeepAlive";

/// What reply settles a pending request
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expect {
    /// `{"result":"OK","id":N}`
    Ack,
    /// A `getResp`/`update` entry for this pair
    Value { param: String, format: FormatTag },
    /// Either an id-matched ack or a `getResp` for [`KEEPALIVE_PARAM`]
    KeepAlive,
}

/// Who is waiting on a pending request
#[derive(Debug)]
pub(crate) enum Waiter {
    Ack(oneshot::Sender<crate::Result<()>>),
    Value(oneshot::Sender<crate::Result<ParameterValue>>),
    KeepAlive,
}

/// Why a request failed
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Failure {
    Timeout,
    ConnectionLost,
    Stopped,
    Device(String),
}

impl Failure {
    fn to_error(&self) -> AzmError {
        match self {
            Failure::Timeout => AzmError::Timeout,
            Failure::ConnectionLost => AzmError::ConnectionLost,
            Failure::Stopped => AzmError::Stopped,
            Failure::Device(message) => AzmError::Device {
                message: message.clone(),
            },
        }
    }
}

impl Waiter {
    /// Fail the waiter; reports whether it was the keep-alive
    pub(crate) fn fail(self, failure: &Failure) -> bool {
        match self {
            Waiter::Ack(tx) => {
                let _ = tx.send(Err(failure.to_error()));
                false
            }
            Waiter::Value(tx) => {
                let _ = tx.send(Err(failure.to_error()));
                false
            }
            Waiter::KeepAlive => true,
        }
    }

    fn succeed(self, value: Option<&ParameterValue>) -> bool {
        match self {
            Waiter::Ack(tx) => {
                let _ = tx.send(Ok(()));
                false
            }
            Waiter::Value(tx) => {
                let result = value.cloned().ok_or_else(|| {
                    AzmError::Protocol("acknowledged without a value".to_string())
                });
                let _ = tx.send(result);
                false
            }
            Waiter::KeepAlive => true,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    expect: Expect,
    deadline: Instant,
    waiters: Vec<Waiter>,
}

/// Keep-alive outcome of a table operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Settled {
    pub resolved: usize,
    pub keepalive_acked: bool,
    pub keepalive_missed: bool,
}

/// Maps request ids to their waiters
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    next_id: u64,
    requests: HashMap<u64, PendingRequest>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a request and return its fresh id
    pub(crate) fn issue(
        &mut self,
        expect: Expect,
        waiters: Vec<Waiter>,
        now: Instant,
        timeout: Duration,
    ) -> u64 {
        let id = self.fresh_id();
        self.requests.insert(
            id,
            PendingRequest {
                expect,
                deadline: now + timeout,
                waiters,
            },
        );
        id
    }

    fn fresh_id(&mut self) -> u64 {
        loop {
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.requests.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.requests.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Settle the request with `id`; `None` if nothing was waiting on it
    pub(crate) fn resolve_id(&mut self, id: u64, error: Option<String>) -> Option<Settled> {
        let request = self.requests.remove(&id)?;
        let mut settled = Settled {
            resolved: 1,
            ..Settled::default()
        };
        let failure = error.map(Failure::Device);
        for waiter in request.waiters {
            let keepalive = match &failure {
                Some(failure) => waiter.fail(failure),
                None => waiter.succeed(None),
            };
            if keepalive {
                // any reply proves the link is alive
                settled.keepalive_acked = true;
            }
        }
        Some(settled)
    }

    /// Settle every request waiting on a value for `param`/`format`
    pub(crate) fn resolve_value(
        &mut self,
        param: &str,
        format: FormatTag,
        value: &ParameterValue,
    ) -> Settled {
        let matched: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, request)| match &request.expect {
                Expect::Value {
                    param: p,
                    format: f,
                } => p == param && *f == format,
                Expect::KeepAlive => param == KEEPALIVE_PARAM,
                Expect::Ack => false,
            })
            .map(|(id, _)| *id)
            .collect();

        let mut settled = Settled::default();
        for id in matched {
            if let Some(request) = self.requests.remove(&id) {
                settled.resolved += 1;
                for waiter in request.waiters {
                    settled.keepalive_acked |= waiter.succeed(Some(value));
                }
            }
        }
        settled
    }

    /// Fail everything whose deadline has passed
    pub(crate) fn expire(&mut self, now: Instant) -> Settled {
        let expired: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut settled = Settled::default();
        for id in expired {
            if let Some(request) = self.requests.remove(&id) {
                tracing::debug!("Request {} ({:?}) timed out", id, request.expect);
                settled.resolved += 1;
                for waiter in request.waiters {
                    settled.keepalive_missed |= waiter.fail(&Failure::Timeout);
                }
            }
        }
        settled
    }

    /// Fail every outstanding request
    pub(crate) fn fail_all(&mut self, failure: Failure) -> usize {
        let count = self.requests.len();
        for (_, request) in self.requests.drain() {
            for waiter in request.waiters {
                waiter.fail(&failure);
            }
        }
        count
    }
}
