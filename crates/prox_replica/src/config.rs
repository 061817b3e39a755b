//! # Replica Configuration
//!
//! Tunables for replication sessions. Deserializable so hosts can load them
//! from their own configuration files; every field has a production default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-process configuration shared by all replication sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Interval between spatial-engine evaluation ticks, per session.
    pub tick_interval_ms: u64,
    /// How long a replicated node stays unobserved before it is coarsened.
    pub unobserved_timeout_ms: u64,
    /// Age after which orphaned property deltas with no matching topology
    /// addition are garbage collected.
    pub orphan_max_age_ms: u64,
    /// Speculative-index garbage collection runs every this many ticks.
    pub gc_interval_ticks: u64,
    /// Upper bound on events drained per query per tick; leftovers carry
    /// over to the next tick.
    pub max_events_per_query_tick: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 100,
            unobserved_timeout_ms: 15_000,
            orphan_max_age_ms: 60_000,
            gc_interval_ticks: 50,
            max_events_per_query_tick: 64,
        }
    }
}

impl ReplicaConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn unobserved_timeout(&self) -> Duration {
        Duration::from_millis(self.unobserved_timeout_ms)
    }

    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_millis(self.orphan_max_age_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let config = ReplicaConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.unobserved_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn partial_config_files_fill_in_defaults() {
        let config: ReplicaConfig = serde_json::from_str(r#"{"tick_interval_ms": 50}"#).unwrap();
        assert_eq!(config.tick_interval_ms, 50);
        assert_eq!(config.unobserved_timeout_ms, 15_000);
    }
}
