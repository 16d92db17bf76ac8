// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wraps the metric and histogram senders, enforces the filter, records
//! throughput/failure counters and emits a minute-periodic health log.
//! Grounded on `internal/wavefront/wavefront.go`'s `SendMetric`/
//! `startHealthReport`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::info;

use crate::filter::FilterEngine;
use crate::sample::MetricSample;
use crate::sender::Senders;
use crate::telemetry;

const HEALTH_LOG_PERIOD: Duration = Duration::from_secs(60);

/// Non-blocking with respect to the upstream: a blocked downstream flush
/// only stalls the calling worker, never the producer (§4.3).
pub struct MetricEmitter {
    filter: FilterEngine,
    senders: Senders,
    sent: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

impl MetricEmitter {
    pub fn new(filter: FilterEngine, senders: Senders) -> Arc<Self> {
        let emitter = Arc::new(Self {
            filter,
            senders,
            sent: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        });
        let health = Arc::clone(&emitter);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEALTH_LOG_PERIOD);
            loop {
                ticker.tick().await;
                health.log_health();
            }
        });
        emitter
    }

    fn log_health(&self) {
        info!(
            total_sent = self.sent.load(Ordering::Relaxed),
            filtered = self.filtered.load(Ordering::Relaxed),
            failures = self.failed.load(Ordering::Relaxed),
            "nozzle health"
        );
    }

    /// Applies the filter, routes to the metric or histogram sender, and
    /// records the three counters plus the send-time histogram (§4.3).
    pub async fn emit(&self, mut sample: MetricSample) {
        if !self.filter.accepts(&sample.name, &mut sample.tags) {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            counter!(telemetry::METRICS_FILTERED).increment(1);
            return;
        }

        let sender = if self.filter.is_histogram(&sample.name) {
            &self.senders.histogram
        } else {
            &self.senders.metric
        };

        let start = Instant::now();
        let result = sender
            .send_metric(&sample.name, sample.value, sample.ts, &sample.source, &sample.tags)
            .await;
        histogram!(telemetry::METRICS_SEND_TIME).record(start.elapsed().as_nanos() as f64);

        match result {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                counter!(telemetry::TOTAL_METRICS_SENT).increment(1);
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                counter!(telemetry::METRICS_SEND_FAILURE).increment(1);
                tracing::debug!(error = %e, metric = %sample.name, "downstream send failed");
            }
        }
    }

    pub fn total_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn total_filtered(&self) -> u64 {
        self.filtered.load(Ordering::Relaxed)
    }

    pub fn total_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}
