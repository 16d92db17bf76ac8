// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The bounded ingress queue and its worker pool (§4.5): one producer (C6),
//! N workers draining a single `tokio::sync::mpsc` channel, each invoking
//! C4 -> C2 -> C3 and consulting C1 for container-shaped payloads. Grounded
//! on `nozzle/main.go`'s `Run` (the `eventsChannel`/`puts` wiring) and
//! `nozzle/nozzle.go`'s `run`/`handleEvent` worker loop.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::AppInfoCache;
use crate::emitter::MetricEmitter;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::telemetry;
use crate::transform::EventTransformer;

const GAUGE_REPORT_PERIOD: Duration = Duration::from_secs(10);

/// Producer-side handle into the bounded ingest channel. Offers are
/// non-blocking: a full queue drops the envelope and increments
/// `nozzle.queue.drops` rather than applying backpressure to the stream
/// controller (§4.5 backpressure policy).
#[derive(Clone)]
pub struct IngestQueue {
    tx: mpsc::Sender<Envelope>,
    capacity: usize,
}

impl IngestQueue {
    /// Builds the channel and spawns `workers` long-lived worker tasks plus
    /// a periodic task reporting `nozzle.queue.size`/`nozzle.queue.used`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capacity: usize,
        workers: usize,
        selected_types: HashSet<EnvelopeKind>,
        transformer: Arc<EventTransformer>,
        cache: Option<Arc<AppInfoCache>>,
        emitter: Arc<MetricEmitter>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self { tx, capacity };

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        for id in 0..workers.max(1) {
            tokio::spawn(Self::worker_loop(
                id,
                Arc::clone(&rx),
                selected_types.clone(),
                Arc::clone(&transformer),
                cache.clone(),
                Arc::clone(&emitter),
            ));
        }

        let gauge_tx = queue.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(GAUGE_REPORT_PERIOD);
            loop {
                ticker.tick().await;
                let used = capacity.saturating_sub(gauge_tx.capacity());
                gauge!(telemetry::QUEUE_SIZE).set(capacity as f64);
                gauge!(telemetry::QUEUE_USED).set(used as f64);
            }
        });

        queue
    }

    /// Non-blocking enqueue, called by the stream controller (C6) for every
    /// envelope it pulls off the upstream. Never blocks the producer.
    pub fn try_put(&self, envelope: Envelope) {
        match self.tx.try_send(envelope) {
            Ok(()) => counter!(telemetry::QUEUE_PUTS).increment(1),
            Err(_) => {
                counter!(telemetry::QUEUE_DROPS).increment(1);
                debug!("ingest queue full, dropping envelope");
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    async fn worker_loop(
        id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
        selected_types: HashSet<EnvelopeKind>,
        transformer: Arc<EventTransformer>,
        cache: Option<Arc<AppInfoCache>>,
        emitter: Arc<MetricEmitter>,
    ) {
        loop {
            let envelope = {
                let mut rx = rx.lock().await;
                rx.recv().await
            };
            let Some(envelope) = envelope else {
                debug!(worker = id, "ingest channel closed, worker exiting");
                return;
            };

            if !selected_types.contains(&envelope.kind()) {
                continue;
            }

            let samples = transformer.transform(&envelope, cache.as_deref());
            for sample in samples {
                emitter.emit(sample).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::MetricEmitter;
    use crate::envelope::EnvelopeBody;
    use crate::filter::{FilterEngine, FilterSpec};
    use crate::sender::{MetricSender, Senders};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSender(Arc<AtomicUsize>);

    #[async_trait]
    impl MetricSender for CountingSender {
        async fn send_metric(
            &self,
            _name: &str,
            _value: f64,
            _ts: i64,
            _source: &str,
            _tags: &HashMap<String, String>,
        ) -> Result<(), crate::error::NozzleError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn envelope(kind: EnvelopeKind) -> Envelope {
        let body = match kind {
            EnvelopeKind::ValueMetric => EnvelopeBody::ValueMetric {
                name: "x".to_string(),
                unit: "u".to_string(),
                value: 1.0,
            },
            EnvelopeKind::Log => EnvelopeBody::Log,
            _ => unreachable!(),
        };
        Envelope {
            timestamp: 0,
            origin: "o".to_string(),
            source_id: None,
            deployment: None,
            job: None,
            ip: Some("h".to_string()),
            tags: HashMap::new(),
            body,
        }
    }

    #[tokio::test]
    async fn overflow_drop_scenario_6() {
        // Capacity 2, no workers draining: three puts before anything is
        // consumed -> first two succeed, third drops, depth stays at 2.
        let (tx, mut rx) = mpsc::channel::<Envelope>(2);
        let queue = IngestQueue { tx, capacity: 2 };
        queue.try_put(envelope(EnvelopeKind::ValueMetric));
        queue.try_put(envelope(EnvelopeKind::ValueMetric));
        queue.try_put(envelope(EnvelopeKind::ValueMetric));
        assert_eq!(queue.capacity() - queue.tx.capacity(), 2);
        rx.close();
    }

    #[tokio::test]
    async fn non_selected_variant_is_discarded_before_transform() {
        let calls = Arc::new(AtomicUsize::new(0));
        let sender: Arc<dyn MetricSender> = Arc::new(CountingSender(Arc::clone(&calls)));
        let senders = Senders { metric: Arc::clone(&sender), histogram: sender };
        let filter = FilterEngine::new(&FilterSpec::default()).unwrap();
        let emitter = MetricEmitter::new(filter, senders);
        let transformer = Arc::new(EventTransformer::new("pcf", "fA", "h"));

        let mut selected = HashSet::new();
        selected.insert(EnvelopeKind::ValueMetric);

        let queue = IngestQueue::new(10, 1, selected, transformer, None, emitter);
        queue.try_put(envelope(EnvelopeKind::Log));
        queue.try_put(envelope(EnvelopeKind::ValueMetric));

        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) >= 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
