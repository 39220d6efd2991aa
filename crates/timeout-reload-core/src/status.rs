// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Status helpers exposing the configuration in effect and the cached
//! pipelines to embedders (health endpoints, debug logs).

use serde::Serialize;
use serde_json::Value;

use crate::cache::{saturating_millis, PipelineCache, PipelineEntry};
use crate::model::SnapshotSource;
use crate::store::ConfigurationStore;

/// Serializable view of the store and the cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    /// Timeout currently in effect.
    pub timeout_seconds: u64,
    /// Origin of the current value.
    pub source: SnapshotSource,
    /// Milliseconds since the current value was last fetched.
    pub age_ms: u64,
    /// Reload interval of the poller, in seconds.
    pub reload_interval_seconds: u64,
    /// Whether the store has been disposed.
    pub disposed: bool,
    /// Cached pipelines sorted by name.
    pub pipelines: Vec<PipelineEntry>,
}

impl StatusSnapshot {
    /// Captures the current state of `store` and `cache`.
    pub fn capture(store: &ConfigurationStore, cache: &PipelineCache) -> Self {
        let snapshot = store.snapshot();
        Self {
            timeout_seconds: snapshot.config.timeout_seconds(),
            source: snapshot.source,
            age_ms: saturating_millis(snapshot.fetched_at.elapsed()),
            reload_interval_seconds: store.reload_interval().as_secs(),
            disposed: store.is_disposed(),
            pipelines: cache.entries(),
        }
    }

    /// Renders the snapshot as JSON.
    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Formats the current status as a JSON object
/// (`{"timeoutSeconds":..,"source":..,"pipelines":[..],..}`).
pub fn status_json(store: &ConfigurationStore, cache: &PipelineCache) -> Value {
    StatusSnapshot::capture(store, cache).to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::test_support::ScriptedSource;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn status_reports_configuration_and_pipelines() {
        let store = ConfigurationStore::load(
            ScriptedSource::new([Some(6)]),
            StoreConfig {
                reload_interval: Duration::from_secs(15),
                ..Default::default()
            },
        )
        .await;
        let cache = PipelineCache::new(store.clone(), Default::default());
        cache.get_or_build("quotes");
        tokio::time::advance(Duration::from_millis(40)).await;

        assert_eq!(
            status_json(&store, &cache),
            json!({
                "timeoutSeconds": 6,
                "source": "remote",
                "ageMs": 40,
                "reloadIntervalSeconds": 15,
                "disposed": false,
                "pipelines": [
                    {"name": "quotes", "timeoutSeconds": 6, "ageMs": 40}
                ]
            })
        );
    }

    #[tokio::test]
    async fn status_reports_fallback_and_disposal() {
        let store = ConfigurationStore::load(ScriptedSource::unavailable(), StoreConfig::default()).await;
        let cache = PipelineCache::new(store.clone(), Default::default());
        store.dispose();

        let status = StatusSnapshot::capture(&store, &cache);
        assert_eq!(status.timeout_seconds, 30);
        assert_eq!(status.source, SnapshotSource::Fallback);
        assert!(status.disposed);
        assert!(status.pipelines.is_empty());
    }
}
