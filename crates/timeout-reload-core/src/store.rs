// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory configuration store with a background poller.
//!
//! The store holds one [`ConfigurationSnapshot`] behind an atomic pointer.
//! Readers never block and always observe either the old or the new snapshot.
//! The poller is the only periodic writer: every `reload_interval` it fetches
//! the remote value, compares it with the current one and, when it differs,
//! swaps the snapshot and notifies subscribers on the polling task. A failed
//! fetch never replaces the value in place.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::http::HttpError;
use crate::model::{ConfigurationSnapshot, TimeoutConfiguration};
use crate::telemetry::{NoopTelemetry, ReloadTelemetry};

/// Errors surfaced by a [`ConfigSource`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The HTTP request failed or returned an unusable payload.
    #[error(transparent)]
    Http(#[from] HttpError),
    /// The fetch was cancelled before completing.
    #[error("configuration fetch cancelled")]
    Cancelled,
    /// The store was disposed and no longer owns a source.
    #[error("configuration store disposed")]
    Disposed,
}

/// Failures while tearing the store down. Only ever logged.
#[derive(Debug, Error)]
pub enum DisposalError {
    /// A lock guarding store internals was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    PoisonedLock,
    /// The poller task panicked.
    #[error("configuration poller failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Provider of timeout configurations, usually a [`RemoteConfigClient`](crate::http::RemoteConfigClient).
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetches the current configuration. Must return promptly once `cancel` fires.
    async fn fetch_configuration(
        &self,
        cancel: &CancellationToken,
    ) -> Result<TimeoutConfiguration, FetchError>;
}

/// Identifier returned by [`ConfigurationStore::subscribe_to_reload`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ReloadCallback = Arc<dyn Fn(&TimeoutConfiguration) + Send + Sync>;

/// Result of a single fetch-compare-swap cycle.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// A different value was installed and subscribers were notified.
    Changed {
        /// Value in effect before the swap.
        previous: TimeoutConfiguration,
        /// Value now in effect.
        current: TimeoutConfiguration,
    },
    /// The fetched value matched the current one.
    Unchanged(TimeoutConfiguration),
    /// The fetch failed; the current value was kept.
    Failed(FetchError),
}

impl RefreshOutcome {
    /// Whether the snapshot was replaced.
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed { .. })
    }
}

struct StoreShared {
    snapshot: ArcSwap<ConfigurationSnapshot>,
    source: Mutex<Option<Arc<dyn ConfigSource>>>,
    observers: Mutex<Vec<(SubscriptionId, ReloadCallback)>>,
    next_subscription: AtomicU64,
    poller: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    disposed: AtomicBool,
    telemetry: Arc<dyn ReloadTelemetry>,
    reload_interval: Duration,
}

impl Drop for StoreShared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StoreShared {
    async fn refresh_from(
        &self,
        source: &dyn ConfigSource,
        cancel: &CancellationToken,
    ) -> RefreshOutcome {
        match source.fetch_configuration(cancel).await {
            Ok(config) => self.apply(config),
            Err(err) => {
                if matches!(err, FetchError::Cancelled) {
                    debug!("timeout-reload: configuration fetch cancelled");
                } else {
                    warn!(
                        %err,
                        current = %self.snapshot.load().config,
                        "timeout-reload: configuration fetch failed; keeping last known configuration"
                    );
                }
                self.telemetry.on_refresh_error(&err);
                RefreshOutcome::Failed(err)
            }
        }
    }

    /// Installs `config` unless the current remote value is equal.
    fn apply(&self, config: TimeoutConfiguration) -> RefreshOutcome {
        let mut previous = self.snapshot.load_full();
        loop {
            // A fallback snapshot counts as "no prior value": the first remote
            // value always installs and notifies.
            if previous.is_remote() && previous.config == config {
                debug!(
                    timeout_seconds = config.timeout_seconds(),
                    "timeout-reload: configuration unchanged"
                );
                // Refresh the fetch time only; a concurrent writer wins.
                let _ = self
                    .snapshot
                    .compare_and_swap(&previous, Arc::new(ConfigurationSnapshot::remote(config)));
                self.telemetry.on_refresh_success(false);
                return RefreshOutcome::Unchanged(config);
            }
            let next = Arc::new(ConfigurationSnapshot::remote(config));
            let witnessed = self.snapshot.compare_and_swap(&previous, next);
            if Arc::ptr_eq(&*witnessed, &previous) {
                break;
            }
            previous = arc_swap::Guard::into_inner(witnessed);
        }

        info!(
            previous = previous.config.timeout_seconds(),
            current = config.timeout_seconds(),
            "timeout-reload: timeout configuration changed"
        );
        self.telemetry.on_refresh_success(true);
        self.telemetry.on_reload(previous.config, config);
        self.notify(&config);
        RefreshOutcome::Changed {
            previous: previous.config,
            current: config,
        }
    }

    fn notify(&self, config: &TimeoutConfiguration) {
        let observers: Vec<ReloadCallback> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in observers {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(config))).is_err() {
                error!("timeout-reload: reload subscriber panicked");
            }
        }
    }

    fn release(&self) -> Result<(), DisposalError> {
        self.cancel.cancel();
        let source = self
            .source
            .lock()
            .map_err(|_| DisposalError::PoisonedLock)?
            .take();
        drop(source);
        self.observers
            .lock()
            .map_err(|_| DisposalError::PoisonedLock)?
            .clear();
        Ok(())
    }
}

/// Shared handle to the configuration store.
///
/// Cloning is cheap; every clone observes the same snapshot. The poller stops
/// on [`dispose`](Self::dispose) or once the last handle is dropped.
#[derive(Clone)]
pub struct ConfigurationStore {
    shared: Arc<StoreShared>,
}

impl fmt::Debug for ConfigurationStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigurationStore")
            .field("snapshot", &self.shared.snapshot.load())
            .field("reload_interval", &self.shared.reload_interval)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl ConfigurationStore {
    /// Performs the initial fetch and starts the poller.
    ///
    /// A failed initial fetch installs `config.fallback`; polling starts
    /// either way so the store recovers once the remote comes back.
    pub async fn load(source: Arc<dyn ConfigSource>, config: StoreConfig) -> Self {
        Self::load_with_telemetry(source, config, Arc::new(NoopTelemetry)).await
    }

    /// Same as [`load`](Self::load), reporting events to `telemetry`.
    pub async fn load_with_telemetry(
        source: Arc<dyn ConfigSource>,
        config: StoreConfig,
        telemetry: Arc<dyn ReloadTelemetry>,
    ) -> Self {
        let config = config.sanitise();
        let cancel = CancellationToken::new();

        let initial = match source.fetch_configuration(&cancel).await {
            Ok(value) => {
                info!(
                    timeout_seconds = value.timeout_seconds(),
                    "timeout-reload: initial configuration loaded"
                );
                telemetry.on_refresh_success(true);
                ConfigurationSnapshot::remote(value)
            }
            Err(err) => {
                warn!(
                    %err,
                    fallback = %config.fallback,
                    "timeout-reload: initial configuration fetch failed; using fallback"
                );
                telemetry.on_refresh_error(&err);
                ConfigurationSnapshot::fallback(config.fallback)
            }
        };

        let shared = Arc::new(StoreShared {
            snapshot: ArcSwap::from_pointee(initial),
            source: Mutex::new(Some(source.clone())),
            observers: Mutex::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            poller: Mutex::new(None),
            cancel: cancel.clone(),
            disposed: AtomicBool::new(false),
            telemetry,
            reload_interval: config.reload_interval,
        });

        let handle = tokio::spawn(poll_loop(
            Arc::downgrade(&shared),
            source,
            config.reload_interval,
            cancel,
        ));
        *shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        debug!(
            interval_secs = config.reload_interval.as_secs(),
            "timeout-reload: configuration poller started"
        );

        Self { shared }
    }

    /// Configuration currently in effect.
    pub fn current_value(&self) -> TimeoutConfiguration {
        self.shared.snapshot.load().config
    }

    /// Full snapshot currently in effect.
    pub fn snapshot(&self) -> Arc<ConfigurationSnapshot> {
        self.shared.snapshot.load_full()
    }

    /// Interval between two polls after sanitisation.
    pub fn reload_interval(&self) -> Duration {
        self.shared.reload_interval
    }

    /// Registers `callback`, invoked on the polling task after every change.
    pub fn subscribe_to_reload<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&TimeoutConfiguration) + Send + Sync + 'static,
    {
        let id = SubscriptionId(
            self.shared
                .next_subscription
                .fetch_add(1, Ordering::Relaxed),
        );
        let callback: ReloadCallback = Arc::new(callback);
        self.shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, callback));
        id
    }

    /// Removes a subscription. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .shared
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Runs one fetch-compare-swap cycle immediately.
    pub async fn refresh_once(&self) -> RefreshOutcome {
        let source = self
            .shared
            .source
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match source {
            Some(source) => {
                self.shared
                    .refresh_from(source.as_ref(), &self.shared.cancel)
                    .await
            }
            None => RefreshOutcome::Failed(FetchError::Disposed),
        }
    }

    /// Whether [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Stops the poller and releases the configuration source.
    ///
    /// Idempotent: only the first call does work and logs. Errors are logged,
    /// never returned. The last snapshot stays readable.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.shared.release() {
            warn!(%err, "timeout-reload: error while disposing configuration store");
        }
        info!("timeout-reload: configuration store disposed");
    }

    /// Disposes the store and waits for the poller to exit.
    pub async fn shutdown(&self) {
        self.dispose();
        let handle = self
            .shared
            .poller
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(()) => {}
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    let err = DisposalError::from(err);
                    warn!(%err, "timeout-reload: configuration poller did not stop cleanly");
                }
            }
        }
    }
}

async fn poll_loop(
    shared: Weak<StoreShared>,
    source: Arc<dyn ConfigSource>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("timeout-reload: configuration poller shutting down");
                break;
            }
            _ = sleep(interval) => {}
        }

        let Some(shared) = shared.upgrade() else {
            debug!("timeout-reload: configuration store dropped; poller exiting");
            break;
        };
        let outcome = shared.refresh_from(source.as_ref(), &cancel).await;
        if matches!(outcome, RefreshOutcome::Failed(FetchError::Cancelled)) {
            break;
        }
    }
}
