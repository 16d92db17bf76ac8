// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process entry point: parse configuration, wire the pipeline, and run the
//! stream controller forever. Grounded on `nozzle/main.go`'s `Run` and the
//! package `main` in the original CLI, which do the same construction in a
//! single function before entering the blocking loop.

use std::collections::HashSet;
use std::sync::Arc;

use nozzle_core::appclient::{AppLookup, AuthTokenProvider, HttpAppLookup};
use nozzle_core::cache::{AppInfoCache, CacheConfig};
use nozzle_core::config::Config;
use nozzle_core::emitter::MetricEmitter;
use nozzle_core::filter::FilterEngine;
use nozzle_core::pipeline::IngestQueue;
use nozzle_core::sender::Senders;
use nozzle_core::stream::StreamController;
use nozzle_core::transform::EventTransformer;

fn install_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    install_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let app_client = HttpAppLookup::new(config.app_client.clone())?;

    let cache = if config.enable_app_cache {
        Some(AppInfoCache::new(
            CacheConfig {
                capacity: config.app_cache_size,
                ttl: config.app_cache_expiration,
                ..CacheConfig::default()
            },
            Arc::clone(&app_client) as Arc<dyn AppLookup>,
        ))
    } else {
        None
    };

    let filter = FilterEngine::new(&config.filter)?;
    let senders = Senders::build(&config.sender)?;
    let emitter = MetricEmitter::new(filter, senders);
    let transformer = Arc::new(EventTransformer::new(
        config.prefix.clone(),
        config.foundation.clone(),
        hostname(),
    ));

    let selected_types: HashSet<_> = config.selected_events.iter().copied().collect();
    let queue = IngestQueue::new(config.channel_size, config.workers, selected_types, transformer, cache, emitter);

    let auth: Arc<dyn AuthTokenProvider> = app_client;
    let source = StreamController::build_source(config.legacy, &config.log_stream_url, &config.firehose_subscription_id);
    let controller = StreamController::new(auth, source, queue);

    controller.run().await
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}
