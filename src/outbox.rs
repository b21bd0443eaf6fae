//! Coalescing queue for outgoing requests.
//!
//! Consecutive requests of the same method are flushed together in array
//! form once the batch is full, a different method queues behind it, or the
//! coalescing window has passed. Flushes are spaced by a minimum interval.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::protocol::Method;
use crate::types::{ParamEntry, ParameterValue};

/// A queued request
#[derive(Debug)]
pub(crate) enum Outgoing {
    Sub(ParamEntry),
    Unsub(ParamEntry),
    Get {
        entry: ParamEntry,
        waiter: Option<oneshot::Sender<crate::Result<ParameterValue>>>,
    },
    Set {
        entry: ParamEntry,
        waiter: oneshot::Sender<crate::Result<()>>,
    },
    Bump {
        entry: ParamEntry,
        waiter: oneshot::Sender<crate::Result<()>>,
    },
    /// Marks the end of a replay; nothing goes on the wire
    Ready,
}

impl Outgoing {
    fn method(&self) -> Option<Method> {
        match self {
            Outgoing::Sub(_) => Some(Method::Sub),
            Outgoing::Unsub(_) => Some(Method::Unsub),
            Outgoing::Get { .. } => Some(Method::Get),
            Outgoing::Set { .. } => Some(Method::Set),
            Outgoing::Bump { .. } => Some(Method::Bmp),
            Outgoing::Ready => None,
        }
    }
}

/// What a flush produced
#[derive(Debug)]
pub(crate) enum Batch {
    Ready,
    Wire { method: Method, items: Vec<Outgoing> },
}

#[derive(Debug)]
struct Queued {
    item: Outgoing,
    queued_at: Instant,
}

#[derive(Debug)]
pub(crate) struct Outbox {
    queue: VecDeque<Queued>,
    window: Duration,
    max_batch: usize,
    min_interval: Duration,
    not_before: Option<Instant>,
}

impl Outbox {
    pub(crate) fn new(window: Duration, max_batch: usize, min_interval: Duration) -> Self {
        Self {
            queue: VecDeque::new(),
            window,
            max_batch: max_batch.max(1),
            min_interval,
            not_before: None,
        }
    }

    pub(crate) fn push(&mut self, item: Outgoing, now: Instant) {
        self.queue.push_back(Queued {
            item,
            queued_at: now,
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Hold every flush until `until`
    pub(crate) fn hold_until(&mut self, until: Instant) {
        self.not_before = Some(self.not_before.map_or(until, |gate| gate.max(until)));
    }

    /// When the next flush may happen, if anything is queued
    pub(crate) fn due_at(&self) -> Option<Instant> {
        let front = self.queue.front()?;

        let ready_at = match front.item.method() {
            None => front.queued_at,
            Some(method) => {
                let run = self.run_length(method);
                let closed = run >= self.max_batch || run < self.queue.len();
                if closed {
                    front.queued_at
                } else {
                    front.queued_at + self.window
                }
            }
        };

        Some(match self.not_before {
            Some(gate) => ready_at.max(gate),
            None => ready_at,
        })
    }

    /// Take the next batch off the queue
    pub(crate) fn pop_batch(&mut self, now: Instant) -> Option<Batch> {
        let method = match self.queue.front()?.item.method() {
            Some(method) => method,
            None => {
                self.queue.pop_front();
                return Some(Batch::Ready);
            }
        };

        let run = self.run_length(method);
        let items = self.queue.drain(..run).map(|q| q.item).collect();
        self.not_before = Some(now + self.min_interval);
        Some(Batch::Wire { method, items })
    }

    /// Empty the queue, e.g. on link loss
    pub(crate) fn drain(&mut self) -> Vec<Outgoing> {
        self.not_before = None;
        self.queue.drain(..).map(|q| q.item).collect()
    }

    fn run_length(&self, method: Method) -> usize {
        self.queue
            .iter()
            .take(self.max_batch)
            .take_while(|q| q.item.method() == Some(method))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FormatTag;

    const WINDOW: Duration = Duration::from_millis(50);
    const PACE: Duration = Duration::from_millis(20);

    fn sub(param: &str) -> Outgoing {
        Outgoing::Sub(ParamEntry::format_only(param, FormatTag::Val))
    }

    fn wire_len(batch: Batch) -> (Method, usize) {
        match batch {
            Batch::Wire { method, items } => (method, items.len()),
            Batch::Ready => panic!("expected a wire batch"),
        }
    }

    #[test]
    fn open_run_waits_for_the_window() {
        let mut outbox = Outbox::new(WINDOW, 8, PACE);
        let now = Instant::now();
        assert!(outbox.due_at().is_none());

        outbox.push(sub("ZoneGain_0"), now);
        outbox.push(sub("ZoneGain_1"), now + Duration::from_millis(10));
        assert_eq!(outbox.due_at(), Some(now + WINDOW));

        assert_eq!(wire_len(outbox.pop_batch(now + WINDOW).unwrap()), (Method::Sub, 2));
        assert_eq!(outbox.len(), 0);
    }

    #[test]
    fn full_batch_flushes_immediately_and_splits() {
        let mut outbox = Outbox::new(WINDOW, 3, PACE);
        let now = Instant::now();
        for i in 0..7 {
            outbox.push(sub(&format!("ZoneGain_{}", i)), now);
        }

        assert_eq!(outbox.due_at(), Some(now));
        assert_eq!(wire_len(outbox.pop_batch(now).unwrap()), (Method::Sub, 3));

        // pacing gate applies to the next batch
        assert_eq!(outbox.due_at(), Some(now + PACE));
        assert_eq!(wire_len(outbox.pop_batch(now + PACE).unwrap()), (Method::Sub, 3));
        // the leftover run is open again, so it waits out its window
        assert_eq!(outbox.due_at(), Some(now + WINDOW));
        assert_eq!(wire_len(outbox.pop_batch(now + WINDOW).unwrap()), (Method::Sub, 1));
    }

    #[test]
    fn method_change_closes_the_run_and_preserves_order() {
        let mut outbox = Outbox::new(WINDOW, 8, Duration::ZERO);
        let now = Instant::now();
        let (tx, _rx) = oneshot::channel();

        outbox.push(sub("ZoneGain_0"), now);
        outbox.push(
            Outgoing::Get {
                entry: ParamEntry::format_only("ZoneGain_0", FormatTag::Val),
                waiter: Some(tx),
            },
            now,
        );
        outbox.push(Outgoing::Ready, now);

        assert_eq!(outbox.due_at(), Some(now));
        assert_eq!(wire_len(outbox.pop_batch(now).unwrap()), (Method::Sub, 1));
        assert_eq!(wire_len(outbox.pop_batch(now).unwrap()), (Method::Get, 1));
        assert!(matches!(outbox.pop_batch(now), Some(Batch::Ready)));
        assert!(outbox.pop_batch(now).is_none());
    }

    #[test]
    fn hold_delays_everything() {
        let mut outbox = Outbox::new(WINDOW, 1, Duration::ZERO);
        let now = Instant::now();
        outbox.hold_until(now + Duration::from_millis(500));
        outbox.push(sub("ZoneGain_0"), now);
        assert_eq!(outbox.due_at(), Some(now + Duration::from_millis(500)));

        assert_eq!(outbox.drain().len(), 1);
        assert!(outbox.due_at().is_none());
    }
}
