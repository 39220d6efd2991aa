// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Timeout and retry composition applied around outbound operations.
//!
//! A [`ResiliencePipeline`] binds one timeout value to a retry policy. The
//! timeout is the outer layer: it bounds the whole retry sequence, including
//! backoff sleeps, so a slow dependency can never stretch a call past the
//! configured budget. Retries only apply to errors reporting themselves as
//! [`Transient`]; timeout rejections are never retried.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::saturating_millis;
use crate::config::RetryConfig;
use crate::model::TimeoutConfiguration;
use crate::telemetry::{NoopTelemetry, ReloadTelemetry};

/// Classifies operation errors the retry policy is allowed to handle.
pub trait Transient {
    /// Whether a later attempt may succeed (transport failures, aborted requests).
    fn is_transient(&self) -> bool;
}

/// Failure modes of an operation executed under a pipeline.
#[derive(Debug, Error)]
pub enum ExecutionError<E> {
    /// The timeout elapsed before the operation (and its retries) completed.
    #[error("operation '{pipeline}' timed out after {timeout_seconds}s")]
    TimedOut {
        /// Pipeline the operation ran under.
        pipeline: String,
        /// Timeout bound to the pipeline when it ran.
        timeout_seconds: u64,
    },
    /// The caller cancelled the operation.
    #[error("operation '{pipeline}' was cancelled")]
    Cancelled {
        /// Pipeline the operation ran under.
        pipeline: String,
    },
    /// The operation's own error, after the retry budget was spent when applicable.
    #[error("{0}")]
    Failed(E),
}

impl<E> ExecutionError<E> {
    /// Whether this is a timeout rejection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    /// Returns the operation error, if that is what failed.
    pub fn into_failed(self) -> Option<E> {
        match self {
            Self::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Exponential backoff tracker for a single retry sequence.
#[derive(Debug)]
pub(crate) struct Backoff {
    config: RetryConfig,
    retries: u32,
}

impl Backoff {
    pub(crate) fn new(config: RetryConfig) -> Self {
        Self {
            config: config.bounded(),
            retries: 0,
        }
    }

    /// Delay before the next retry: `base * factor^n`, capped, optionally jittered.
    pub(crate) fn next_delay(&mut self) -> Duration {
        // Beyond 30 doublings every delay is already at the cap.
        let exponent = self.retries.min(30) as i32;
        self.retries = self.retries.saturating_add(1);

        let max = self.config.max_delay.as_secs_f64();
        let raw = self.config.base_delay.as_secs_f64() * self.config.factor.powi(exponent);
        let mut delay = raw.min(max);
        if self.config.jitter {
            delay = (delay * (0.5 + fastrand::f64())).min(max);
        }
        Duration::try_from_secs_f64(delay).unwrap_or(self.config.max_delay)
    }
}

/// Timeout + retry policy bound to a specific timeout value.
pub struct ResiliencePipeline {
    name: String,
    timeout: TimeoutConfiguration,
    retry: RetryConfig,
    telemetry: Arc<dyn ReloadTelemetry>,
}

impl fmt::Debug for ResiliencePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResiliencePipeline")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl ResiliencePipeline {
    /// Creates a pipeline without telemetry.
    pub fn new(name: impl Into<String>, timeout: TimeoutConfiguration, retry: RetryConfig) -> Self {
        Self {
            name: name.into(),
            timeout,
            retry,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Attaches a telemetry sink notified about scheduled retries.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn ReloadTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Name the pipeline was built for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Timeout bound at construction.
    pub fn timeout_seconds(&self) -> u64 {
        self.timeout.timeout_seconds()
    }

    /// Retry policy of the pipeline.
    pub fn retry_config(&self) -> RetryConfig {
        self.retry
    }

    /// Runs `operation` under the timeout and retry policy.
    ///
    /// Each attempt receives a child of `cancel` that is also cancelled when the
    /// timeout fires. Cancelling `cancel` aborts the current attempt or backoff
    /// immediately and wins over the timeout.
    pub async fn execute<T, E, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let attempt_token = cancel.child_token();
        let sequence = self.run_with_retries(&attempt_token, &mut operation);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecutionError::Cancelled {
                pipeline: self.name.clone(),
            }),
            outcome = tokio::time::timeout(self.timeout.timeout(), sequence) => match outcome {
                Ok(result) => result.map_err(ExecutionError::Failed),
                Err(_) => {
                    attempt_token.cancel();
                    Err(ExecutionError::TimedOut {
                        pipeline: self.name.clone(),
                        timeout_seconds: self.timeout.timeout_seconds(),
                    })
                }
            }
        }
    }

    async fn run_with_retries<T, E, F, Fut>(
        &self,
        token: &CancellationToken,
        operation: &mut F,
    ) -> Result<T, E>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let mut backoff = Backoff::new(self.retry);
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match operation(token.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt <= self.retry.max_retries => {
                    let delay = backoff.next_delay();
                    debug!(
                        pipeline = %self.name,
                        attempt,
                        delay_ms = saturating_millis(delay),
                        %err,
                        "retrying transient failure"
                    );
                    self.telemetry.on_retry_scheduled(&self.name, attempt);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Builds pipelines for the cache.
pub trait PipelineFactory: Send + Sync {
    /// Builds a pipeline named `name` bound to `config`.
    fn build(&self, name: &str, config: TimeoutConfiguration) -> ResiliencePipeline;
}

/// Default factory: timeout from the configuration, retry policy from [`RetryConfig`].
pub struct ResiliencePipelineFactory {
    retry: RetryConfig,
    telemetry: Arc<dyn ReloadTelemetry>,
}

impl ResiliencePipelineFactory {
    /// Creates a factory applying `retry` to every pipeline it builds.
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Attaches a telemetry sink propagated to every built pipeline.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn ReloadTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }
}

impl Default for ResiliencePipelineFactory {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl PipelineFactory for ResiliencePipelineFactory {
    fn build(&self, name: &str, config: TimeoutConfiguration) -> ResiliencePipeline {
        ResiliencePipeline::new(name, config, self.retry).with_telemetry(self.telemetry.clone())
    }
}
