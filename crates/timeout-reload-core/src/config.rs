// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-driven settings and the typed runtime configs derived from them.
//!
//! Reload cadence follows two named modes: a fast mode for development
//! deployments and a standard mode everywhere else. An explicit interval
//! always wins over the mode.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use tracing::warn;

use crate::model::TimeoutConfiguration;

/// Base URL of the service exposing `GET /config`.
const ENV_CONFIG_SERVER_URL: &str = "TIMEOUT_RELOAD_CONFIG_SERVER_URL";
/// Base URL of the service exposing `GET /quotations`.
const ENV_QUOTATION_SERVER_URL: &str = "TIMEOUT_RELOAD_QUOTATION_SERVER_URL";
/// Deployment environment name; `development` selects the fast reload mode.
const ENV_ENVIRONMENT: &str = "TIMEOUT_RELOAD_ENVIRONMENT";
/// Explicit reload interval in seconds.
const ENV_INTERVAL: &str = "TIMEOUT_RELOAD_INTERVAL_SECONDS";
/// Timeout used until a remote value is observed.
const ENV_FALLBACK: &str = "TIMEOUT_RELOAD_FALLBACK_SECONDS";
/// Lifetime of cached pipelines.
const ENV_CACHE_TTL: &str = "TIMEOUT_RELOAD_CACHE_TTL_SECONDS";
/// HTTP timeout applied to the configuration fetch itself.
const ENV_FETCH_TIMEOUT: &str = "TIMEOUT_RELOAD_FETCH_TIMEOUT_SECONDS";

/// Reload cadence in fast mode.
pub const FAST_RELOAD_INTERVAL: Duration = Duration::from_secs(15);
/// Reload cadence in standard mode.
pub const STANDARD_RELOAD_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Reload cadence when a store is built without a mode or override.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(60);
/// Shortest reload interval accepted by [`StoreConfig::sanitise`].
pub const MIN_RELOAD_INTERVAL: Duration = Duration::from_secs(1);
/// Default lifetime of a cached pipeline.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);
/// Default HTTP timeout of the configuration fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound of any single retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60 * 60);

/// Reload cadence selected by the deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadMode {
    /// Short interval for quick iteration.
    Fast,
    /// Moderate interval for stable deployments.
    Standard,
}

impl ReloadMode {
    /// Maps an environment name to a mode (`development`, case-insensitive, is fast).
    pub fn from_environment(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("development") {
            Self::Fast
        } else {
            Self::Standard
        }
    }

    /// Poll interval associated with the mode.
    pub fn interval(self) -> Duration {
        match self {
            Self::Fast => FAST_RELOAD_INTERVAL,
            Self::Standard => STANDARD_RELOAD_INTERVAL,
        }
    }
}

/// Settings captured from the process environment.
#[derive(Debug, Clone)]
pub struct ReloadEnv {
    /// Base URL of the configuration service.
    pub config_server_url: Option<String>,
    /// Base URL of the quotation service.
    pub quotation_server_url: Option<String>,
    /// Reload mode derived from the deployment environment.
    pub mode: ReloadMode,
    /// Explicit reload interval overriding the mode.
    pub interval_override: Option<Duration>,
    /// Fallback timeout used while no remote value is known.
    pub fallback: TimeoutConfiguration,
    /// Lifetime of cached pipelines.
    pub cache_ttl: Duration,
    /// HTTP timeout of the configuration fetch.
    pub fetch_timeout: Duration,
}

impl ReloadEnv {
    /// Builds settings from the current process environment.
    pub fn from_os_env() -> Self {
        Self::from_env_iter(env::vars())
    }

    /// Builds settings from key/value pairs (typically for tests).
    pub fn from_env_iter<I, K, V>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        let mode = map
            .get(ENV_ENVIRONMENT)
            .map(|value| ReloadMode::from_environment(value))
            .unwrap_or(ReloadMode::Standard);
        let fallback = parse_seconds(&map, ENV_FALLBACK)
            .and_then(|seconds| TimeoutConfiguration::new(seconds.as_secs()))
            .unwrap_or_default();

        Self {
            config_server_url: map.get(ENV_CONFIG_SERVER_URL).and_then(|v| sanitize_url(v)),
            quotation_server_url: map
                .get(ENV_QUOTATION_SERVER_URL)
                .and_then(|v| sanitize_url(v)),
            mode,
            interval_override: parse_seconds(&map, ENV_INTERVAL),
            fallback,
            cache_ttl: parse_seconds(&map, ENV_CACHE_TTL).unwrap_or(DEFAULT_CACHE_TTL),
            fetch_timeout: parse_seconds(&map, ENV_FETCH_TIMEOUT).unwrap_or(DEFAULT_FETCH_TIMEOUT),
        }
    }

    /// Interval the poller should use: the override when present, the mode otherwise.
    pub fn reload_interval(&self) -> Duration {
        self.interval_override.unwrap_or_else(|| self.mode.interval())
    }

    /// Store settings derived from the environment.
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            reload_interval: self.reload_interval(),
            fallback: self.fallback,
        }
    }

    /// Pipeline settings derived from the environment.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            cache_ttl: self.cache_ttl,
            ..Default::default()
        }
    }
}

/// Parses a whole number of seconds; blank or malformed values are ignored.
fn parse_seconds(map: &HashMap<String, String>, key: &str) -> Option<Duration> {
    let raw = map.get(key)?.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(seconds) => Some(Duration::from_secs(seconds)),
        Err(_) => {
            warn!(key, value = raw, "ignoring non-numeric duration setting");
            None
        }
    }
}

/// Trims whitespace and trailing slashes; blank values become `None`.
fn sanitize_url(value: &str) -> Option<String> {
    let trimmed = value.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Settings of the configuration store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Delay between two polls.
    pub reload_interval: Duration,
    /// Configuration installed when the initial fetch fails.
    pub fallback: TimeoutConfiguration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            fallback: TimeoutConfiguration::default(),
        }
    }
}

impl StoreConfig {
    /// Store settings for the given mode.
    pub fn for_mode(mode: ReloadMode) -> Self {
        Self {
            reload_interval: mode.interval(),
            ..Default::default()
        }
    }

    /// Clamps values that would turn the poller into a busy loop.
    pub(crate) fn sanitise(mut self) -> Self {
        if self.reload_interval < MIN_RELOAD_INTERVAL {
            warn!(
                "reload interval {:?} is below the minimum {:?}; clamping",
                self.reload_interval, MIN_RELOAD_INTERVAL
            );
            self.reload_interval = MIN_RELOAD_INTERVAL;
        }
        self
    }
}

/// Retry policy parameters for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied for each subsequent retry.
    pub factor: f64,
    /// Upper bound of a single backoff delay.
    pub max_delay: Duration,
    /// Randomise each delay to avoid synchronised retries.
    pub jitter: bool,
}

impl RetryConfig {
    /// Copy the backoff can always evaluate: a finite factor of at least one
    /// and delays no longer than [`MAX_RETRY_DELAY`].
    pub(crate) fn bounded(mut self) -> Self {
        if !self.factor.is_finite() || self.factor < 1.0 {
            self.factor = Self::default().factor;
        }
        self.max_delay = self.max_delay.min(MAX_RETRY_DELAY);
        self.base_delay = self.base_delay.min(self.max_delay);
        self
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(2),
            factor: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// Settings of the pipeline cache and of the pipelines it builds.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Age after which a cached pipeline is rebuilt even if still current.
    pub cache_ttl: Duration,
    /// Retry policy composed under the timeout.
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Repairs inconsistent retry parameters.
    pub(crate) fn sanitise(mut self) -> Self {
        if !self.retry.factor.is_finite() || self.retry.factor < 1.0 {
            warn!(
                "retry factor {} is invalid; using {}",
                self.retry.factor,
                RetryConfig::default().factor
            );
            self.retry.factor = RetryConfig::default().factor;
        }
        if self.retry.base_delay > MAX_RETRY_DELAY {
            warn!(
                "retry base delay {:?} exceeds {:?}; clamping",
                self.retry.base_delay, MAX_RETRY_DELAY
            );
            self.retry.base_delay = MAX_RETRY_DELAY;
        }
        if self.retry.max_delay > MAX_RETRY_DELAY {
            warn!(
                "retry max delay {:?} exceeds {:?}; clamping",
                self.retry.max_delay, MAX_RETRY_DELAY
            );
            self.retry.max_delay = MAX_RETRY_DELAY;
        }
        if self.retry.max_delay < self.retry.base_delay {
            warn!(
                "retry max delay {:?} is below base delay {:?}; aligning",
                self.retry.max_delay, self.retry.base_delay
            );
            self.retry.max_delay = self.retry.base_delay;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DEFAULT_TIMEOUT_SECONDS;

    #[test]
    fn development_selects_fast_mode() {
        let env = ReloadEnv::from_env_iter(vec![(ENV_ENVIRONMENT, "Development")]);
        assert_eq!(env.mode, ReloadMode::Fast);
        assert_eq!(env.reload_interval(), Duration::from_secs(15));
    }

    #[test]
    fn other_environments_select_standard_mode() {
        let env = ReloadEnv::from_env_iter(vec![(ENV_ENVIRONMENT, "staging")]);
        assert_eq!(env.mode, ReloadMode::Standard);
        assert_eq!(env.reload_interval(), Duration::from_secs(300));

        let empty = ReloadEnv::from_env_iter::<Vec<(String, String)>, _, _>(Vec::new());
        assert_eq!(empty.mode, ReloadMode::Standard);
        assert_eq!(empty.fallback.timeout_seconds(), 30);
        assert_eq!(empty.cache_ttl, DEFAULT_CACHE_TTL);
        assert!(empty.config_server_url.is_none());
    }

    #[test]
    fn explicit_interval_overrides_mode() {
        let env = ReloadEnv::from_env_iter(vec![
            (ENV_ENVIRONMENT, "development"),
            (ENV_INTERVAL, "42"),
        ]);
        assert_eq!(env.store_config().reload_interval, Duration::from_secs(42));
    }

    #[test]
    fn malformed_values_fall_back_to_defaults() {
        let env = ReloadEnv::from_env_iter(vec![
            (ENV_FALLBACK, "0"),
            (ENV_CACHE_TTL, "soon"),
            (ENV_CONFIG_SERVER_URL, "  http://config.local/ "),
            (ENV_QUOTATION_SERVER_URL, "   "),
        ]);
        assert_eq!(env.fallback.timeout_seconds(), DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(env.pipeline_config().cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(env.config_server_url.as_deref(), Some("http://config.local"));
        assert!(env.quotation_server_url.is_none());
    }

    #[test]
    fn sanitise_clamps_store_and_retry_settings() {
        let store = StoreConfig {
            reload_interval: Duration::from_millis(10),
            ..Default::default()
        }
        .sanitise();
        assert_eq!(store.reload_interval, MIN_RELOAD_INTERVAL);

        let pipeline = PipelineConfig {
            retry: RetryConfig {
                factor: 0.5,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        }
        .sanitise();
        assert_eq!(pipeline.retry.factor, 2.0);
        assert_eq!(pipeline.retry.max_delay, Duration::from_secs(5));
    }

    #[test]
    fn sanitise_caps_retry_delays() {
        let pipeline = PipelineConfig {
            retry: RetryConfig {
                base_delay: Duration::MAX,
                max_delay: Duration::MAX,
                ..Default::default()
            },
            ..Default::default()
        }
        .sanitise();
        assert_eq!(pipeline.retry.base_delay, MAX_RETRY_DELAY);
        assert_eq!(pipeline.retry.max_delay, MAX_RETRY_DELAY);
    }

    #[test]
    fn bounded_retry_config_replaces_unusable_values() {
        let retry = RetryConfig {
            factor: -1.0,
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            ..Default::default()
        }
        .bounded();
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.max_delay, MAX_RETRY_DELAY);
        assert_eq!(retry.base_delay, MAX_RETRY_DELAY);

        let retry = RetryConfig {
            factor: f64::NAN,
            ..Default::default()
        }
        .bounded();
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.base_delay, Duration::from_secs(2));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn store_config_for_mode_uses_mode_interval() {
        assert_eq!(
            StoreConfig::for_mode(ReloadMode::Fast).reload_interval,
            FAST_RELOAD_INTERVAL
        );
        assert_eq!(StoreConfig::default().reload_interval, DEFAULT_RELOAD_INTERVAL);
    }
}
