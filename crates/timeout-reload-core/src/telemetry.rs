// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Telemetry hooks for the configuration store and the resilience pipelines.
//!
//! Every hook has a no-op default so embedders only implement what they
//! export. [`CountingTelemetry`] keeps relaxed atomic counters that can be
//! surfaced through any metric backend, and [`CompositeTelemetry`] fans events
//! out to several sinks.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::model::TimeoutConfiguration;
use crate::store::FetchError;

/// Observer of store and pipeline events.
pub trait ReloadTelemetry: Send + Sync {
    /// Called after a successful fetch; `changed` tells whether the value moved.
    fn on_refresh_success(&self, _changed: bool) {}
    /// Called when a fetch fails and the store keeps its current value.
    fn on_refresh_error(&self, _error: &FetchError) {}
    /// Called after a new configuration has been installed.
    fn on_reload(&self, _previous: TimeoutConfiguration, _current: TimeoutConfiguration) {}
    /// Called when the cache builds a pipeline.
    fn on_pipeline_built(&self, _name: &str, _timeout_seconds: u64) {}
    /// Called when the cache hands out an existing pipeline.
    fn on_pipeline_reused(&self, _name: &str) {}
    /// Called before sleeping ahead of a retry.
    fn on_retry_scheduled(&self, _pipeline: &str, _attempt: u32) {}
    /// Called when an operation is rejected by its timeout.
    fn on_operation_timeout(&self, _pipeline: &str, _timeout_seconds: u64) {}
}

/// Telemetry implementation that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl ReloadTelemetry for NoopTelemetry {}

/// Aggregated telemetry counters (all values use relaxed atomics).
#[derive(Debug, Default)]
pub struct TelemetryCounters {
    refresh_success: AtomicU64,
    refresh_error: AtomicU64,
    reloads: AtomicU64,
    current_timeout_seconds: AtomicU64,
    pipelines_built: AtomicU64,
    pipelines_reused: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
}

impl TelemetryCounters {
    /// Captures a point-in-time snapshot of the counters.
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            refresh_success: self.refresh_success.load(Ordering::Relaxed),
            refresh_error: self.refresh_error.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            current_timeout_seconds: self.current_timeout_seconds.load(Ordering::Relaxed),
            pipelines_built: self.pipelines_built.load(Ordering::Relaxed),
            pipelines_reused: self.pipelines_reused.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Plain data representation of [`TelemetryCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Number of successful fetches.
    pub refresh_success: u64,
    /// Number of failed fetches.
    pub refresh_error: u64,
    /// Number of configuration changes installed.
    pub reloads: u64,
    /// Timeout installed by the latest reload (0 until the first one).
    pub current_timeout_seconds: u64,
    /// Number of pipelines built by the cache.
    pub pipelines_built: u64,
    /// Number of cache hits.
    pub pipelines_reused: u64,
    /// Number of retries scheduled.
    pub retries: u64,
    /// Number of operations rejected by a timeout.
    pub timeouts: u64,
}

impl fmt::Display for TelemetrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "refresh_success={}, refresh_error={}, reloads={}, current_timeout_seconds={}, pipelines_built={}, pipelines_reused={}, retries={}, timeouts={}",
            self.refresh_success,
            self.refresh_error,
            self.reloads,
            self.current_timeout_seconds,
            self.pipelines_built,
            self.pipelines_reused,
            self.retries,
            self.timeouts
        )
    }
}

/// Telemetry implementation that maintains atomic counters for every signal.
#[derive(Debug, Clone)]
pub struct CountingTelemetry {
    counters: Arc<TelemetryCounters>,
}

impl CountingTelemetry {
    /// Creates a new telemetry instance backed by the provided counter set.
    pub fn new(counters: Arc<TelemetryCounters>) -> Self {
        Self { counters }
    }

    /// Returns the underlying counter set.
    pub fn counters(&self) -> Arc<TelemetryCounters> {
        self.counters.clone()
    }
}

impl Default for CountingTelemetry {
    fn default() -> Self {
        Self::new(Arc::new(TelemetryCounters::default()))
    }
}

impl ReloadTelemetry for CountingTelemetry {
    fn on_refresh_success(&self, _changed: bool) {
        self.counters
            .refresh_success
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_refresh_error(&self, _error: &FetchError) {
        self.counters.refresh_error.fetch_add(1, Ordering::Relaxed);
    }

    fn on_reload(&self, _previous: TimeoutConfiguration, current: TimeoutConfiguration) {
        self.counters.reloads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .current_timeout_seconds
            .store(current.timeout_seconds(), Ordering::Relaxed);
    }

    fn on_pipeline_built(&self, _name: &str, _timeout_seconds: u64) {
        self.counters
            .pipelines_built
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_pipeline_reused(&self, _name: &str) {
        self.counters
            .pipelines_reused
            .fetch_add(1, Ordering::Relaxed);
    }

    fn on_retry_scheduled(&self, _pipeline: &str, _attempt: u32) {
        self.counters.retries.fetch_add(1, Ordering::Relaxed);
    }

    fn on_operation_timeout(&self, _pipeline: &str, _timeout_seconds: u64) {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Telemetry implementation that forwards events to multiple observers.
pub struct CompositeTelemetry {
    observers: Vec<Arc<dyn ReloadTelemetry>>,
}

impl CompositeTelemetry {
    /// Creates an empty dispatcher.
    pub fn new() -> Self {
        Self {
            observers: Vec::new(),
        }
    }

    /// Adds a telemetry observer to the dispatcher.
    pub fn with_observer(mut self, telemetry: Arc<dyn ReloadTelemetry>) -> Self {
        self.observers.push(telemetry);
        self
    }
}

impl Default for CompositeTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompositeTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeTelemetry")
            .field("observer_count", &self.observers.len())
            .finish()
    }
}

impl ReloadTelemetry for CompositeTelemetry {
    fn on_refresh_success(&self, changed: bool) {
        for observer in &self.observers {
            observer.on_refresh_success(changed);
        }
    }

    fn on_refresh_error(&self, error: &FetchError) {
        for observer in &self.observers {
            observer.on_refresh_error(error);
        }
    }

    fn on_reload(&self, previous: TimeoutConfiguration, current: TimeoutConfiguration) {
        for observer in &self.observers {
            observer.on_reload(previous, current);
        }
    }

    fn on_pipeline_built(&self, name: &str, timeout_seconds: u64) {
        for observer in &self.observers {
            observer.on_pipeline_built(name, timeout_seconds);
        }
    }

    fn on_pipeline_reused(&self, name: &str) {
        for observer in &self.observers {
            observer.on_pipeline_reused(name);
        }
    }

    fn on_retry_scheduled(&self, pipeline: &str, attempt: u32) {
        for observer in &self.observers {
            observer.on_retry_scheduled(pipeline, attempt);
        }
    }

    fn on_operation_timeout(&self, pipeline: &str, timeout_seconds: u64) {
        for observer in &self.observers {
            observer.on_operation_timeout(pipeline, timeout_seconds);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout(seconds: u64) -> TimeoutConfiguration {
        TimeoutConfiguration::new(seconds).expect("non-zero")
    }

    /// Confirms counters increment for every telemetry callback.
    #[test]
    fn counting_telemetry_tracks_all_events() {
        let telemetry = CountingTelemetry::default();
        telemetry.on_refresh_success(true);
        telemetry.on_refresh_error(&FetchError::Cancelled);
        telemetry.on_reload(timeout(30), timeout(5));
        telemetry.on_pipeline_built("quotes", 5);
        telemetry.on_pipeline_reused("quotes");
        telemetry.on_retry_scheduled("quotes", 1);
        telemetry.on_operation_timeout("quotes", 5);

        let snapshot = telemetry.counters().snapshot();
        assert_eq!(snapshot.refresh_success, 1);
        assert_eq!(snapshot.refresh_error, 1);
        assert_eq!(snapshot.reloads, 1);
        assert_eq!(snapshot.current_timeout_seconds, 5);
        assert_eq!(snapshot.pipelines_built, 1);
        assert_eq!(snapshot.pipelines_reused, 1);
        assert_eq!(snapshot.retries, 1);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[test]
    fn composite_telemetry_forwards_calls() {
        let primary = Arc::new(CountingTelemetry::default());
        let secondary = Arc::new(CountingTelemetry::default());

        let composite = CompositeTelemetry::new()
            .with_observer(primary.clone())
            .with_observer(secondary.clone());

        composite.on_reload(timeout(30), timeout(7));
        composite.on_operation_timeout("quotes", 7);

        for sink in [primary, secondary] {
            let snapshot = sink.counters().snapshot();
            assert_eq!(snapshot.reloads, 1);
            assert_eq!(snapshot.current_timeout_seconds, 7);
            assert_eq!(snapshot.timeouts, 1);
        }
    }

    #[test]
    fn counting_telemetry_uses_external_counters() {
        let counters = Arc::new(TelemetryCounters::default());
        let telemetry = CountingTelemetry::new(counters.clone());
        assert!(Arc::ptr_eq(&counters, &telemetry.counters()));
    }

    #[test]
    fn telemetry_snapshot_display_includes_all_fields() {
        let rendered = TelemetryCounters::default().snapshot().to_string();
        for field in [
            "refresh_success=0",
            "refresh_error=0",
            "reloads=0",
            "current_timeout_seconds=0",
            "pipelines_built=0",
            "pipelines_reused=0",
            "retries=0",
            "timeouts=0",
        ] {
            assert!(rendered.contains(field), "missing {field} in {rendered}");
        }
    }
}
