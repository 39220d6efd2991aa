// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Dynamic timeout configuration for outbound calls.
//!
//! A [`ConfigurationStore`] polls a remote `/config` endpoint and keeps the
//! latest timeout in memory. A [`PipelineCache`] builds timeout + retry
//! pipelines bound to that value, and a [`PipelineExecutor`] runs operations
//! through them, so a timeout change takes effect without a restart.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod cache;
pub mod config;
pub mod executor;
pub mod http;
pub mod model;
pub mod pipeline;
pub mod status;
pub mod store;
pub mod telemetry;

pub use cache::{PipelineCache, PipelineEntry};
pub use config::{PipelineConfig, ReloadEnv, ReloadMode, RetryConfig, StoreConfig};
pub use executor::PipelineExecutor;
pub use http::{HttpClient, HttpClientOptions, HttpError, QuotationClient, RemoteConfigClient};
pub use model::{ConfigurationSnapshot, QuotationValue, SnapshotSource, TimeoutConfiguration};
pub use pipeline::{
    ExecutionError, PipelineFactory, ResiliencePipeline, ResiliencePipelineFactory, Transient,
};
pub use status::{status_json, StatusSnapshot};
pub use store::{
    ConfigSource, ConfigurationStore, DisposalError, FetchError, RefreshOutcome, SubscriptionId,
};
pub use telemetry::{
    CompositeTelemetry, CountingTelemetry, NoopTelemetry, ReloadTelemetry, TelemetryCounters,
    TelemetrySnapshot,
};
