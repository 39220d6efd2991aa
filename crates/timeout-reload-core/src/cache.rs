// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Name-keyed cache of resilience pipelines.
//!
//! An entry is reused while it is younger than the cache TTL *and* bound to
//! the timeout currently held by the store. Either condition failing rebuilds
//! the pipeline, so a configuration change takes effect on the next request
//! without waiting for the TTL. Concurrent rebuilds of the same name are
//! tolerated; the last insert wins.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::PipelineConfig;
use crate::pipeline::{PipelineFactory, ResiliencePipeline, ResiliencePipelineFactory};
use crate::store::ConfigurationStore;
use crate::telemetry::{NoopTelemetry, ReloadTelemetry};

#[derive(Clone)]
struct CachedPipeline {
    pipeline: Arc<ResiliencePipeline>,
    created_at: Instant,
    bound_timeout_seconds: u64,
}

/// Read-only view of a cache entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineEntry {
    /// Pipeline name.
    pub name: String,
    /// Timeout the pipeline was built with.
    pub timeout_seconds: u64,
    /// Time since the pipeline was built.
    #[serde(rename = "ageMs", serialize_with = "serialize_millis")]
    pub age: Duration,
}

fn serialize_millis<S: serde::Serializer>(age: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(saturating_millis(*age))
}

/// Whole milliseconds of `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Cache of [`ResiliencePipeline`]s bound to the store's current timeout.
pub struct PipelineCache {
    store: ConfigurationStore,
    factory: Arc<dyn PipelineFactory>,
    ttl: Duration,
    entries: DashMap<String, CachedPipeline>,
    telemetry: Arc<dyn ReloadTelemetry>,
}

impl fmt::Debug for PipelineCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineCache")
            .field("ttl", &self.ttl)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl PipelineCache {
    /// Creates a cache building pipelines with the default factory for `config`.
    pub fn new(store: ConfigurationStore, config: PipelineConfig) -> Self {
        let config = config.sanitise();
        let factory = Arc::new(ResiliencePipelineFactory::new(config.retry));
        Self::with_factory(store, factory, config.cache_ttl)
    }

    /// Creates a cache delegating construction to `factory`.
    pub fn with_factory(
        store: ConfigurationStore,
        factory: Arc<dyn PipelineFactory>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            factory,
            ttl,
            entries: DashMap::new(),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Attaches a telemetry sink notified on builds and hits.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn ReloadTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Store the cache reads its configuration from.
    pub fn store(&self) -> &ConfigurationStore {
        &self.store
    }

    /// Returns the pipeline for `name`, building a new one when the cached
    /// entry is missing, older than the TTL, or bound to an outdated timeout.
    pub fn get_or_build(&self, name: &str) -> Arc<ResiliencePipeline> {
        let current = self.store.current_value();

        let previous = match self.entries.get(name) {
            Some(entry) => {
                if entry.bound_timeout_seconds == current.timeout_seconds()
                    && entry.created_at.elapsed() < self.ttl
                {
                    debug!(
                        pipeline = name,
                        timeout_seconds = entry.bound_timeout_seconds,
                        "timeout-reload: reusing cached pipeline"
                    );
                    self.telemetry.on_pipeline_reused(name);
                    return entry.pipeline.clone();
                }
                Some(entry.bound_timeout_seconds)
            }
            None => None,
        };

        match previous {
            Some(previous) if previous != current.timeout_seconds() => info!(
                pipeline = name,
                previous,
                current = current.timeout_seconds(),
                "timeout-reload: rebuilding pipeline after configuration change"
            ),
            Some(_) => debug!(pipeline = name, "timeout-reload: cached pipeline expired"),
            None => debug!(
                pipeline = name,
                timeout_seconds = current.timeout_seconds(),
                "timeout-reload: building pipeline"
            ),
        }

        let pipeline = Arc::new(self.factory.build(name, current));
        self.telemetry
            .on_pipeline_built(name, current.timeout_seconds());
        self.entries.insert(
            name.to_string(),
            CachedPipeline {
                pipeline: pipeline.clone(),
                created_at: Instant::now(),
                bound_timeout_seconds: current.timeout_seconds(),
            },
        );
        pipeline
    }

    /// Drops the entry for `name`. Returns whether one existed.
    pub fn invalidate(&self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached pipelines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the cached entries, sorted by name.
    pub fn entries(&self) -> Vec<PipelineEntry> {
        let mut entries: Vec<PipelineEntry> = self
            .entries
            .iter()
            .map(|entry| PipelineEntry {
                name: entry.key().clone(),
                timeout_seconds: entry.bound_timeout_seconds,
                age: entry.created_at.elapsed(),
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}
