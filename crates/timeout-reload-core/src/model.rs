// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire and in-memory types shared by the store, the pipeline cache, and the
//! HTTP clients.

use std::fmt;
use std::num::NonZeroU64;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Timeout applied when no remote value has ever been observed.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// The single runtime parameter managed by this crate.
///
/// Values are immutable: a reload replaces the whole configuration. The JSON
/// representation matches the `/config` endpoint (`{"timeoutSeconds": 5}`) and
/// rejects zero at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfiguration {
    timeout_seconds: NonZeroU64,
}

impl TimeoutConfiguration {
    /// Builds a configuration, returning `None` for a zero timeout.
    pub fn new(timeout_seconds: u64) -> Option<Self> {
        NonZeroU64::new(timeout_seconds).map(|timeout_seconds| Self { timeout_seconds })
    }

    /// Timeout in whole seconds.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds.get()
    }

    /// Timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.get())
    }
}

impl Default for TimeoutConfiguration {
    fn default() -> Self {
        Self {
            timeout_seconds: NonZeroU64::MIN.saturating_add(DEFAULT_TIMEOUT_SECONDS - 1),
        }
    }
}

impl fmt::Display for TimeoutConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.timeout_seconds)
    }
}

/// Where the value held by a [`ConfigurationSnapshot`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotSource {
    /// Installed because no remote value was available yet.
    Fallback,
    /// Returned by the remote configuration endpoint.
    Remote,
}

/// Immutable point-in-time copy of the store state.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSnapshot {
    /// Configuration in effect.
    pub config: TimeoutConfiguration,
    /// Moment the configuration was last fetched (or installed, for the fallback).
    pub fetched_at: Instant,
    /// Origin of `config`.
    pub source: SnapshotSource,
}

impl ConfigurationSnapshot {
    /// Snapshot holding the fallback configuration.
    pub fn fallback(config: TimeoutConfiguration) -> Self {
        Self {
            config,
            fetched_at: Instant::now(),
            source: SnapshotSource::Fallback,
        }
    }

    /// Snapshot holding a freshly fetched remote configuration.
    pub fn remote(config: TimeoutConfiguration) -> Self {
        Self {
            config,
            fetched_at: Instant::now(),
            source: SnapshotSource::Remote,
        }
    }

    /// Whether a remote value has been observed.
    pub fn is_remote(&self) -> bool {
        self.source == SnapshotSource::Remote
    }
}

/// Payload of the `/quotations` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotationValue {
    /// Quoted value for the requested ticker.
    pub value: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_thirty_seconds() {
        let config = TimeoutConfiguration::default();
        assert_eq!(config.timeout_seconds(), DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.to_string(), "30s");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(TimeoutConfiguration::new(0).is_none());
        let err = serde_json::from_str::<TimeoutConfiguration>(r#"{"timeoutSeconds":0}"#);
        assert!(err.is_err(), "zero must not decode");
    }

    #[test]
    fn decodes_camel_case_payload() {
        let config: TimeoutConfiguration =
            serde_json::from_str(r#"{"timeoutSeconds":5}"#).expect("valid payload");
        assert_eq!(config.timeout_seconds(), 5);
        assert_eq!(
            serde_json::to_string(&config).expect("serialize"),
            r#"{"timeoutSeconds":5}"#
        );
    }

    #[test]
    fn negative_and_missing_values_are_rejected() {
        assert!(serde_json::from_str::<TimeoutConfiguration>(r#"{"timeoutSeconds":-1}"#).is_err());
        assert!(serde_json::from_str::<TimeoutConfiguration>("{}").is_err());
    }

    #[tokio::test]
    async fn snapshot_constructors_record_source() {
        let config = TimeoutConfiguration::new(7).expect("non-zero");
        assert!(!ConfigurationSnapshot::fallback(config).is_remote());
        assert!(ConfigurationSnapshot::remote(config).is_remote());
    }
}
