// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Entry point used by callers to run operations under the current timeout.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::PipelineCache;
use crate::pipeline::{ExecutionError, Transient};
use crate::telemetry::{NoopTelemetry, ReloadTelemetry};

/// Resolves pipelines through the cache and runs operations under them.
#[derive(Clone)]
pub struct PipelineExecutor {
    cache: Arc<PipelineCache>,
    telemetry: Arc<dyn ReloadTelemetry>,
}

impl fmt::Debug for PipelineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineExecutor")
            .field("cache", &self.cache)
            .finish()
    }
}

impl PipelineExecutor {
    /// Creates an executor backed by `cache`.
    pub fn new(cache: Arc<PipelineCache>) -> Self {
        Self {
            cache,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    /// Attaches a telemetry sink notified about timeouts.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn ReloadTelemetry>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Cache the executor resolves pipelines from.
    pub fn cache(&self) -> &Arc<PipelineCache> {
        &self.cache
    }

    /// Runs `operation` under the pipeline registered as `name`.
    ///
    /// The pipeline is resolved on every call, so a reload applies to the next
    /// execution. Timeouts are logged with the pipeline name and the timeout
    /// that fired, then returned as [`ExecutionError::TimedOut`]. Operation
    /// errors come back unchanged in [`ExecutionError::Failed`].
    pub async fn execute<T, E, F, Fut>(
        &self,
        name: &str,
        operation: F,
        cancel: &CancellationToken,
    ) -> Result<T, ExecutionError<E>>
    where
        F: FnMut(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + fmt::Display,
    {
        let pipeline = self.cache.get_or_build(name);
        let result = pipeline.execute(cancel, operation).await;
        if let Err(ExecutionError::TimedOut {
            pipeline,
            timeout_seconds,
        }) = &result
        {
            warn!(
                pipeline = %pipeline,
                timeout_seconds,
                "timeout-reload: operation timed out"
            );
            self.telemetry
                .on_operation_timeout(pipeline, *timeout_seconds);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, StoreConfig};
    use crate::pipeline::ResiliencePipelineFactory;
    use crate::store::test_support::ScriptedSource;
    use crate::store::ConfigurationStore;
    use crate::telemetry::CountingTelemetry;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq)]
    struct Unavailable;

    impl fmt::Display for Unavailable {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "unavailable")
        }
    }

    impl Transient for Unavailable {
        fn is_transient(&self) -> bool {
            false
        }
    }

    #[derive(Debug, PartialEq)]
    struct Flaky;

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "connection reset")
        }
    }

    impl Transient for Flaky {
        fn is_transient(&self) -> bool {
            true
        }
    }

    async fn store(script: Vec<Option<u64>>) -> ConfigurationStore {
        ConfigurationStore::load(
            ScriptedSource::new(script),
            StoreConfig {
                reload_interval: Duration::from_secs(3600),
                ..Default::default()
            },
        )
        .await
    }

    async fn executor(script: Vec<Option<u64>>) -> PipelineExecutor {
        let store = store(script).await;
        PipelineExecutor::new(Arc::new(PipelineCache::new(store, Default::default())))
    }

    async fn executor_with_retry(script: Vec<Option<u64>>, retry: RetryConfig) -> PipelineExecutor {
        let store = store(script).await;
        let factory = Arc::new(ResiliencePipelineFactory::new(retry));
        PipelineExecutor::new(Arc::new(PipelineCache::with_factory(
            store,
            factory,
            Duration::from_secs(30),
        )))
    }

    /// Fails with a transient error `failures` times, then succeeds.
    async fn flaky(attempts: &AtomicU32, failures: u32) -> Result<&'static str, Flaky> {
        if attempts.fetch_add(1, Ordering::SeqCst) < failures {
            Err(Flaky)
        } else {
            Ok("done")
        }
    }

    async fn slow(delay: Duration) -> Result<&'static str, Unavailable> {
        sleep(delay).await;
        Ok("done")
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_returned_unchanged() {
        let executor = executor(vec![Some(5)]).await;
        let value = executor
            .execute("quotes", |_| slow(Duration::from_secs(1)), &CancellationToken::new())
            .await
            .expect("fast operation");
        assert_eq!(value, "done");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn timeout_is_logged_with_pipeline_and_seconds() {
        let telemetry = Arc::new(CountingTelemetry::default());
        let executor = executor(vec![Some(2)]).await.with_telemetry(telemetry.clone());
        let err = executor
            .execute("quotes", |_| slow(Duration::from_secs(10)), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExecutionError::TimedOut {
                pipeline,
                timeout_seconds,
            } => {
                assert_eq!(pipeline, "quotes");
                assert_eq!(timeout_seconds, 2);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(logs_contain("operation timed out"));
        assert!(logs_contain("pipeline=quotes"));
        assert!(logs_contain("timeout_seconds=2"));
        assert_eq!(telemetry.counters().snapshot().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reload_applies_to_the_next_execution() {
        let executor = executor(vec![Some(5), Some(2)]).await;
        let cancel = CancellationToken::new();
        assert!(executor
            .execute("quotes", |_| slow(Duration::from_secs(3)), &cancel)
            .await
            .is_ok());

        assert!(executor.cache().store().refresh_once().await.is_changed());
        let err = executor
            .execute("quotes", |_| slow(Duration::from_secs(3)), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn domain_errors_pass_through() {
        let executor = executor(vec![Some(5)]).await;
        let err = executor
            .execute(
                "quotes",
                |_| async { Err::<(), _>(Unavailable) },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.into_failed(), Some(Unavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let executor = executor(vec![Some(30)]).await;
        let attempts = AtomicU32::new(0);
        let value = executor
            .execute("quotes", |_| flaky(&attempts, 2), &CancellationToken::new())
            .await
            .expect("third attempt succeeds");
        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_counts_against_the_timeout() {
        // The timeout bounds the whole retry sequence. Sleeping 2s then 4s
        // overruns a 5s pipeline before the third attempt. With jitter on,
        // the same setup times out in most runs but not all.
        let executor = executor_with_retry(
            vec![Some(5)],
            RetryConfig {
                jitter: false,
                ..Default::default()
            },
        )
        .await;
        let attempts = AtomicU32::new(0);
        let err = executor
            .execute("quotes", |_| flaky(&attempts, 2), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        let executor = executor_with_retry(
            vec![Some(7)],
            RetryConfig {
                jitter: false,
                ..Default::default()
            },
        )
        .await;
        let attempts = AtomicU32::new(0);
        let value = executor
            .execute("quotes", |_| flaky(&attempts, 2), &CancellationToken::new())
            .await
            .expect("6s of backoff fits in 7s");
        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn pre_cancelled_token_short_circuits() {
        let executor = executor(vec![Some(5)]).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = executor
            .execute("quotes", |_| slow(Duration::from_secs(1)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled { .. }));
    }
}
