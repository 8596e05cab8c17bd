use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;

/// Counters for one computed property.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PropertyStats {
    pub recompute_count: u64,
    pub update_count: u64,
    pub total_time: Duration,
}

/// Per-property statistics, keyed by `Class.property`. Owned by one engine.
#[derive(Debug, Default)]
pub struct ComputedStats {
    props: DashMap<String, PropertyStats>,
}

impl ComputedStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_recompute(&self, key: &str, elapsed: Duration) {
        let mut entry = self.props.entry(key.to_owned()).or_default();
        entry.recompute_count += 1;
        entry.total_time += elapsed;
    }

    pub(crate) fn record_update(&self, key: &str) {
        self.props.entry(key.to_owned()).or_default().update_count += 1;
    }

    pub fn get(&self, key: &str) -> Option<PropertyStats> {
        self.props.get(key).map(|e| *e)
    }

    /// All properties, most expensive first.
    pub fn snapshot(&self) -> Vec<(String, PropertyStats)> {
        let mut all: Vec<_> = self
            .props
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        all.sort_by(|a, b| b.1.total_time.cmp(&a.1.total_time).then_with(|| a.0.cmp(&b.0)));
        all
    }

    pub fn reset(&self) {
        self.props.clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_key() {
        let stats = ComputedStats::new();
        stats.record_recompute("Player.level", Duration::from_millis(2));
        stats.record_recompute("Player.level", Duration::from_millis(3));
        stats.record_update("Player.level");
        stats.record_recompute("Game.score", Duration::from_millis(10));

        let level = stats.get("Player.level").unwrap();
        assert_eq!(level.recompute_count, 2);
        assert_eq!(level.update_count, 1);
        assert_eq!(level.total_time, Duration::from_millis(5));
        assert_eq!(stats.snapshot()[0].0, "Game.score");

        stats.reset();
        assert!(stats.snapshot().is_empty());
    }
}
