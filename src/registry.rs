//! Subscription registry.
//!
//! Holds caller intent, not device state: entries survive link loss and the
//! whole set is replayed after every reconnect.

use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

use crate::types::{
    Delivery, FormatTag, ParamEntry, ParameterName, ParameterUpdate, ParameterValue,
    SubscriptionHandle,
};

type Key = (ParameterName, FormatTag);

#[derive(Debug)]
struct Subscriber {
    handle: SubscriptionHandle,
    delivery: Delivery,
    sink: mpsc::UnboundedSender<ParameterUpdate>,
}

/// Reference-counted set of (parameter, format) pairs
#[derive(Debug, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: BTreeMap<Key, Vec<Subscriber>>,
    handles: HashMap<SubscriptionHandle, Key>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber; `true` if this is the first reference to the pair
    pub(crate) fn subscribe(
        &mut self,
        handle: SubscriptionHandle,
        param: ParameterName,
        format: FormatTag,
        delivery: Delivery,
        sink: mpsc::UnboundedSender<ParameterUpdate>,
    ) -> bool {
        let key = (param, format);
        self.handles.insert(handle, key.clone());
        let subscribers = self.entries.entry(key).or_default();
        subscribers.push(Subscriber {
            handle,
            delivery,
            sink,
        });
        subscribers.len() == 1
    }

    /// Drop a subscriber. Returns the pair when its last reference went away.
    ///
    /// Unknown handles are a no-op.
    pub(crate) fn unsubscribe(&mut self, handle: SubscriptionHandle) -> Option<ParamEntry> {
        let Some(key) = self.handles.remove(&handle) else {
            tracing::debug!("Ignoring unsubscribe for unknown handle {}", handle);
            return None;
        };

        let subscribers = self.entries.get_mut(&key)?;
        subscribers.retain(|s| s.handle != handle);
        if !subscribers.is_empty() {
            return None;
        }

        self.entries.remove(&key);
        let (param, format) = key;
        Some(ParamEntry::format_only(param, format))
    }

    /// Number of live references to the pair
    pub(crate) fn references(&self, param: &str, format: FormatTag) -> usize {
        self.entries
            .get(&(param.to_string(), format))
            .map_or(0, Vec::len)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether UDP delivery was asked for on this pair
    pub(crate) fn accepts_meter(&self, param: &str, format: FormatTag) -> bool {
        self.entries
            .get(&(param.to_string(), format))
            .is_some_and(|subs| subs.iter().any(|s| s.delivery == Delivery::Meter))
    }

    /// Hand the value to every subscriber of the pair; returns how many took it
    pub(crate) fn notify(&self, param: &str, format: FormatTag, value: &ParameterValue) -> usize {
        let Some(subscribers) = self.entries.get(&(param.to_string(), format)) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            let update = ParameterUpdate {
                param: param.to_string(),
                format,
                value: value.clone(),
            };
            if subscriber.sink.send(update).is_ok() {
                delivered += 1;
            } else {
                tracing::trace!("Subscriber {} dropped its receiver", subscriber.handle);
            }
        }
        delivered
    }

    /// Every pair with at least one reference, in stable order
    pub(crate) fn replay_entries(&self) -> Vec<ParamEntry> {
        self.entries
            .keys()
            .map(|(param, format)| ParamEntry::format_only(param.clone(), *format))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn sink() -> (
        mpsc::UnboundedSender<ParameterUpdate>,
        mpsc::UnboundedReceiver<ParameterUpdate>,
    ) {
        mpsc::unbounded_channel()
    }

    #[test]
    fn reference_counting_controls_wire_traffic() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();
        let a = SubscriptionHandle::new();
        let b = SubscriptionHandle::new();

        assert!(registry.subscribe(a, "ZoneGain_0".into(), FormatTag::Val, Delivery::Control, tx.clone()));
        assert!(!registry.subscribe(b, "ZoneGain_0".into(), FormatTag::Val, Delivery::Control, tx));
        assert_eq!(registry.references("ZoneGain_0", FormatTag::Val), 2);

        assert!(registry.unsubscribe(a).is_none());
        assert_eq!(
            registry.unsubscribe(b),
            Some(ParamEntry::format_only("ZoneGain_0", FormatTag::Val))
        );
        assert_eq!(registry.len(), 0);

        // already gone
        assert!(registry.unsubscribe(b).is_none());
    }

    #[test]
    fn same_param_different_formats_are_distinct() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, mut rx) = sink();
        registry.subscribe(SubscriptionHandle::new(), "ZoneGain_0".into(), FormatTag::Val, Delivery::Control, tx.clone());
        registry.subscribe(SubscriptionHandle::new(), "ZoneGain_0".into(), FormatTag::Pct, Delivery::Control, tx);

        assert_eq!(registry.notify("ZoneGain_0", FormatTag::Pct, &ParameterValue::Number(50.0)), 1);
        let update = rx.try_recv().unwrap();
        assert_eq!(update.format, FormatTag::Pct);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn meter_acceptance_follows_delivery() {
        let mut registry = SubscriptionRegistry::new();
        let (tx, _rx) = sink();
        registry.subscribe(SubscriptionHandle::new(), "ZoneGain_0".into(), FormatTag::Val, Delivery::Control, tx.clone());
        let meter = SubscriptionHandle::new();
        registry.subscribe(meter, "SourceMeter_0".into(), FormatTag::Val, Delivery::Meter, tx);

        assert!(!registry.accepts_meter("ZoneGain_0", FormatTag::Val));
        assert!(registry.accepts_meter("SourceMeter_0", FormatTag::Val));
        assert!(!registry.accepts_meter("SourceMeter_1", FormatTag::Val));

        registry.unsubscribe(meter);
        assert!(!registry.accepts_meter("SourceMeter_0", FormatTag::Val));
    }

    const PARAMS: [&str; 4] = ["ZoneGain_0", "ZoneMute_0", "SourceMeter_1", "ZoneName_2"];

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe { param: usize, format: usize },
        Unsubscribe { pick: usize },
        /// Unsubscribe a handle that is already gone
        UnsubscribeAgain { pick: usize },
        Reconnect,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0..PARAMS.len(), 0..FormatTag::ALL.len())
                .prop_map(|(param, format)| Op::Subscribe { param, format }),
            2 => any::<usize>().prop_map(|pick| Op::Unsubscribe { pick }),
            1 => any::<usize>().prop_map(|pick| Op::UnsubscribeAgain { pick }),
            1 => Just(Op::Reconnect),
        ]
    }

    fn assert_replay_matches(
        registry: &SubscriptionRegistry,
        live: &[(SubscriptionHandle, (String, FormatTag))],
    ) -> Result<(), TestCaseError> {
        let replayed: Vec<(String, FormatTag)> = registry
            .replay_entries()
            .into_iter()
            .map(|e| (e.param, e.format))
            .collect();
        let unique: BTreeSet<_> = replayed.iter().cloned().collect();
        let expected: BTreeSet<_> = live.iter().map(|(_, key)| key.clone()).collect();

        prop_assert_eq!(unique.len(), replayed.len(), "duplicate replay entries");
        prop_assert_eq!(unique, expected);
        Ok(())
    }

    proptest! {
        #[test]
        fn replay_matches_intent(ops in prop::collection::vec(op_strategy(), 0..40)) {
            let mut registry = SubscriptionRegistry::new();
            let mut live: Vec<(SubscriptionHandle, (String, FormatTag))> = Vec::new();
            let mut gone: Vec<SubscriptionHandle> = Vec::new();
            let (tx, _rx) = sink();

            for op in ops {
                match op {
                    Op::Subscribe { param, format } => {
                        let handle = SubscriptionHandle::new();
                        let param = PARAMS[param];
                        let format = FormatTag::ALL[format];
                        registry.subscribe(handle, param.into(), format, Delivery::Control, tx.clone());
                        live.push((handle, (param.to_string(), format)));
                    }
                    Op::Unsubscribe { pick } => {
                        if live.is_empty() {
                            continue;
                        }
                        let (handle, _) = live.swap_remove(pick % live.len());
                        registry.unsubscribe(handle);
                        gone.push(handle);
                    }
                    Op::UnsubscribeAgain { pick } => {
                        if gone.is_empty() {
                            continue;
                        }
                        prop_assert!(registry.unsubscribe(gone[pick % gone.len()]).is_none());
                    }
                    Op::Reconnect => assert_replay_matches(&registry, &live)?,
                }
            }

            assert_replay_matches(&registry, &live)?;
        }
    }
}
