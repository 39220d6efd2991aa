// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, sync::Arc};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use timeout_reload_core::{
    status_json, ConfigurationStore, CountingTelemetry, ExecutionError, HttpClient,
    HttpClientOptions, PipelineCache, PipelineExecutor, QuotationClient, ReloadEnv,
    RemoteConfigClient,
};

const QUOTATION_PIPELINE: &str = "quotations";
const QUOTATION_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_TICKERS: &str = "PETR4";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("TIMEOUT_RELOAD_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let reload_env = ReloadEnv::from_os_env();
    let tickers = parse_tickers(env::var("TIMEOUT_RELOAD_TICKERS").ok().as_deref());

    let Some(config_url) = reload_env.config_server_url.clone() else {
        error!("TIMEOUT_RELOAD_CONFIG_SERVER_URL not set. Shutting down.");
        return;
    };
    let Some(quotation_url) = reload_env.quotation_server_url.clone() else {
        error!("TIMEOUT_RELOAD_QUOTATION_SERVER_URL not set. Shutting down.");
        return;
    };

    let config_http = match HttpClient::new(
        config_url,
        HttpClientOptions {
            request_timeout: Some(reload_env.fetch_timeout),
        },
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating configuration client: {e}");
            return;
        }
    };
    // Quotation calls are bounded by the pipeline timeout, not by reqwest.
    let quotation_http = match HttpClient::new(
        quotation_url,
        HttpClientOptions {
            request_timeout: None,
        },
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Error creating quotation client: {e}");
            return;
        }
    };

    let telemetry = Arc::new(CountingTelemetry::default());
    let source = Arc::new(RemoteConfigClient::new(config_http, reload_env.fallback));
    let store = ConfigurationStore::load_with_telemetry(
        source,
        reload_env.store_config(),
        telemetry.clone(),
    )
    .await;
    info!(
        timeout_seconds = store.current_value().timeout_seconds(),
        reload_interval_secs = store.reload_interval().as_secs(),
        "Timeout configuration store started"
    );

    store.subscribe_to_reload(|config| {
        info!(
            timeout_seconds = config.timeout_seconds(),
            "Timeout configuration reloaded"
        );
    });

    let cache = Arc::new(
        PipelineCache::new(store.clone(), reload_env.pipeline_config())
            .with_telemetry(telemetry.clone()),
    );
    let executor = PipelineExecutor::new(cache.clone()).with_telemetry(telemetry.clone());
    let quotations = QuotationClient::new(quotation_http);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!("Unable to listen for shutdown signal: {e}"),
        }
        signal_token.cancel();
    });

    let mut lookup_interval = interval(QUOTATION_INTERVAL);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = lookup_interval.tick() => {}
        }

        for ticker in &tickers {
            lookup_quotation(&executor, &quotations, ticker, &shutdown).await;
        }

        debug!(
            status = %status_json(&store, &cache),
            telemetry = %telemetry.counters().snapshot(),
            "timeout-reload status"
        );
    }

    store.shutdown().await;
    info!("timeout-reload agent stopped");
}

async fn lookup_quotation(
    executor: &PipelineExecutor,
    quotations: &QuotationClient,
    ticker: &str,
    cancel: &CancellationToken,
) {
    let result = executor
        .execute(
            QUOTATION_PIPELINE,
            move |token| async move { quotations.fetch_quotation(ticker, &token).await },
            cancel,
        )
        .await;
    match result {
        Ok(quotation) => info!(ticker, value = quotation.value, "Quotation retrieved"),
        // The executor already logged the timeout with the pipeline name.
        Err(ExecutionError::TimedOut {
            timeout_seconds, ..
        }) => info!(ticker, timeout_seconds, "Operation timed out"),
        Err(ExecutionError::Cancelled { .. }) => debug!(ticker, "Quotation lookup cancelled"),
        Err(ExecutionError::Failed(e)) => error!(ticker, "Quotation lookup failed: {e}"),
    }
}

/// Splits a comma-separated ticker list, dropping blanks.
fn parse_tickers(raw: Option<&str>) -> Vec<String> {
    let tickers: Vec<String> = raw
        .unwrap_or(DEFAULT_TICKERS)
        .split(',')
        .map(|ticker| ticker.trim().to_uppercase())
        .filter(|ticker| !ticker.is_empty())
        .collect();
    if tickers.is_empty() {
        vec![DEFAULT_TICKERS.to_string()]
    } else {
        tickers
    }
}
