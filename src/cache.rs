use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::time::Instant;

use crate::types::{FormatTag, ParameterName, ParameterValue};

/// Last known value of a parameter
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: ParameterValue,
    pub format: FormatTag,
    pub updated_at: Instant,
}

/// Last-known value per parameter.
///
/// Readable from anywhere; only the dispatcher writes. Entries are never
/// removed, so a read after unsubscribing may return a stale value.
#[derive(Debug, Clone, Default)]
pub struct ParameterCache {
    entries: Arc<RwLock<HashMap<ParameterName, CacheEntry>>>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current entry for `param`
    pub fn read(&self, param: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(param)
            .cloned()
    }

    /// Number of parameters seen so far
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every entry
    pub fn snapshot(&self) -> HashMap<ParameterName, CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Store `value`; the newer timestamp wins
    pub(crate) fn write(
        &self,
        param: &str,
        format: FormatTag,
        value: ParameterValue,
        at: Instant,
    ) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entries.get(param) {
            if existing.updated_at > at {
                return false;
            }
        }
        entries.insert(
            param.to_string(),
            CacheEntry {
                value,
                format,
                updated_at: at,
            },
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn latest_write_wins_regardless_of_format() {
        let cache = ParameterCache::new();
        let t0 = Instant::now();
        assert!(cache.read("ZoneGain_0").is_none());

        assert!(cache.write("ZoneGain_0", FormatTag::Val, ParameterValue::Number(-20.0), t0));
        assert!(cache.write(
            "ZoneGain_0",
            FormatTag::Pct,
            ParameterValue::Number(40.0),
            t0 + Duration::from_millis(5)
        ));

        let entry = cache.read("ZoneGain_0").unwrap();
        assert_eq!(entry.value, ParameterValue::Number(40.0));
        assert_eq!(entry.format, FormatTag::Pct);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn older_write_is_ignored() {
        let cache = ParameterCache::new();
        let t0 = Instant::now();
        cache.write("ZoneName_0", FormatTag::Str, "Patio".into(), t0 + Duration::from_secs(1));
        assert!(!cache.write("ZoneName_0", FormatTag::Str, "Lobby".into(), t0));
        assert_eq!(cache.read("ZoneName_0").unwrap().value, ParameterValue::from("Patio"));
    }

    #[test]
    fn clones_share_state() {
        let cache = ParameterCache::new();
        let reader = cache.clone();
        cache.write("ZoneMute_1", FormatTag::Val, true.into(), Instant::now());
        assert_eq!(reader.read("ZoneMute_1").unwrap().value, ParameterValue::Number(1.0));
        assert_eq!(reader.snapshot().len(), 1);
    }
}
