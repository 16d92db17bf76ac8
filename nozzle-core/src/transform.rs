// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deterministic envelope -> `MetricSample` mapping (§4.4).
//!
//! Grounded on `nozzle/nozzle.go`'s `BuildCounterEvent`/`BuildGaugeEvent` and
//! the commented-out `BuildContainerEvent`/`BuildValueMetricEvent` in
//! `nozzle/event_handler.go`, which together cover every envelope variant
//! spec.md §4.4 lists.

use std::collections::HashMap;

use crate::cache::AppInfoCache;
use crate::envelope::{Envelope, EnvelopeBody};
use crate::sample::MetricSample;

/// Exact-match translation table applied only to v2 container gauges,
/// after name assembly (§4.4, F7).
const CONTAINER_NAME_TRANSLATIONS: &[(&str, &str)] = &[
    ("pcf.container.rep.cpu.percentage", "pcf.container.rep.cpu_percentage"),
    ("pcf.container.rep.disk.bytes", "pcf.container.rep.disk_bytes"),
    ("pcf.container.rep.disk_quota.bytes", "pcf.container.rep.disk_bytes_quota"),
    ("pcf.container.rep.memory.bytes", "pcf.container.rep.memory_bytes"),
    ("pcf.container.rep.memory_quota.bytes", "pcf.container.rep.memory_bytes_quota"),
];

fn translate_container_name(name: &str) -> String {
    for (from, to) in CONTAINER_NAME_TRANSLATIONS {
        if name == *from {
            return (*to).to_string();
        }
    }
    name.to_string()
}

/// Maps one envelope to zero or more metric samples. `prefix` and
/// `foundation` are immutable configured strings (§4.4); `hostname` backs
/// the last fallback in source resolution.
pub struct EventTransformer {
    prefix: String,
    foundation: String,
    hostname: String,
}

impl EventTransformer {
    pub fn new(prefix: impl Into<String>, foundation: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            foundation: foundation.into(),
            hostname: hostname.into(),
        }
    }

    /// Tags shared by every variant: `foundation` always first so nothing
    /// merged in later can ever displace it (spec invariant).
    fn base_tags(&self, envelope: &Envelope) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        if let Some(deployment) = envelope.deployment.as_deref().filter(|s| !s.is_empty()) {
            tags.insert("deployment".to_string(), deployment.to_string());
        }
        if let Some(job) = envelope.job.as_deref().filter(|s| !s.is_empty()) {
            tags.insert("job".to_string(), job.to_string());
        }
        tags
    }

    /// Merges remaining envelope tags last, skipping empty keys/values, and
    /// re-asserts `foundation` so an envelope tag named `foundation` can
    /// never override the configured value (§3 invariants).
    fn finish_tags(&self, mut tags: HashMap<String, String>, envelope: &Envelope) -> HashMap<String, String> {
        for (k, v) in &envelope.tags {
            if !k.is_empty() && !v.is_empty() {
                tags.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        tags.insert("foundation".to_string(), self.foundation.clone());
        tags
    }

    fn source(&self, envelope: &Envelope) -> String {
        envelope.resolve_source(&self.hostname)
    }

    /// Applies the variant table in §4.4. `cache` is consulted only for
    /// container-shaped payloads (old `ContainerMetric` and v2 `rep` gauges)
    /// when the envelope itself carries no identity tags.
    pub fn transform(&self, envelope: &Envelope, cache: Option<&AppInfoCache>) -> Vec<MetricSample> {
        let ts = envelope.timestamp;
        let source = self.source(envelope);

        match &envelope.body {
            EnvelopeBody::ValueMetric { name, unit, value } => {
                let metric_name = format!("{}.{}.{}.{}", self.prefix, envelope.origin, name, unit);
                let tags = self.finish_tags(self.base_tags(envelope), envelope);
                vec![MetricSample::new(metric_name, *value, ts, source, tags)]
            }

            EnvelopeBody::CounterEvent { name, total, delta } | EnvelopeBody::Counter { name, total, delta } => {
                let base = format!("{}.{}.{}", self.prefix, envelope.origin, name);
                let tags = self.finish_tags(self.base_tags(envelope), envelope);
                vec![
                    MetricSample::new(format!("{base}.total"), *total as f64, ts, source.clone(), tags.clone()),
                    MetricSample::new(format!("{base}.delta"), *delta as f64, ts, source, tags),
                ]
            }

            EnvelopeBody::Gauge { metrics } => {
                let is_container = envelope.source_id.as_deref().is_some_and(|s| !s.is_empty());
                metrics
                    .iter()
                    .map(|(name, gv)| {
                        let mut metric_name = self.prefix.clone();
                        if is_container {
                            metric_name.push_str(".container");
                        }
                        metric_name.push('.');
                        metric_name.push_str(&envelope.origin);
                        metric_name.push('.');
                        metric_name.push_str(name);
                        if !gv.unit.is_empty() {
                            metric_name.push('.');
                            metric_name.push_str(&gv.unit);
                        }
                        if is_container {
                            metric_name = translate_container_name(&metric_name);
                        }

                        let tags = self.container_gauge_tags(envelope, is_container, cache);
                        MetricSample::new(metric_name, gv.value, ts, source.clone(), tags)
                    })
                    .collect()
            }

            EnvelopeBody::ContainerMetric {
                application_id,
                instance_index,
                cpu_percentage,
                disk_bytes,
                disk_bytes_quota,
                memory_bytes,
                memory_bytes_quota,
            } => {
                let base = format!("{}.container.{}", self.prefix, envelope.origin);
                let mut tags = self.finish_tags(self.base_tags(envelope), envelope);
                tags.insert("applicationId".to_string(), application_id.clone());
                tags.insert("instanceIndex".to_string(), format!("{instance_index}"));
                if let Some(cache) = cache {
                    if let Some(info) = cache.get(application_id) {
                        tags.insert("applicationName".to_string(), info.name);
                        tags.insert("space".to_string(), info.space);
                        tags.insert("org".to_string(), info.org);
                    }
                }

                vec![
                    MetricSample::new(format!("{base}.cpu_percentage"), *cpu_percentage, ts, source.clone(), tags.clone()),
                    MetricSample::new(format!("{base}.disk_bytes"), *disk_bytes as f64, ts, source.clone(), tags.clone()),
                    MetricSample::new(format!("{base}.disk_bytes_quota"), *disk_bytes_quota as f64, ts, source.clone(), tags.clone()),
                    MetricSample::new(format!("{base}.memory_bytes"), *memory_bytes as f64, ts, source.clone(), tags.clone()),
                    MetricSample::new(format!("{base}.memory_bytes_quota"), *memory_bytes_quota as f64, ts, source, tags),
                ]
            }

            // Variant-gated out before a transformer ever sees them (§4.5).
            EnvelopeBody::Log | EnvelopeBody::Timer | EnvelopeBody::Event | EnvelopeBody::HttpStartStop => Vec::new(),
        }
    }

    /// v2 container gauge identity resolution: `rep` origin tries the
    /// envelope's own `app_name`/`organization_name`/`space_name` tags
    /// first (no cache lookup needed), falling back to `source_id` through
    /// the cache. Those three raw tags are always stripped from the final
    /// set regardless of which path resolved them (§4.4).
    fn container_gauge_tags(
        &self,
        envelope: &Envelope,
        is_container: bool,
        cache: Option<&AppInfoCache>,
    ) -> HashMap<String, String> {
        let mut tags = self.base_tags(envelope);

        if is_container && envelope.origin == "rep" {
            let app_name = envelope.tags.get("app_name").cloned();
            if let Some(app_name) = app_name {
                tags.insert("applicationName".to_string(), app_name);
                if let Some(org) = envelope.tags.get("organization_name") {
                    tags.insert("org".to_string(), org.clone());
                }
                if let Some(space) = envelope.tags.get("space_name") {
                    tags.insert("space".to_string(), space.clone());
                }
            } else if let (Some(cache), Some(source_id)) = (cache, envelope.source_id.as_deref()) {
                if let Some(info) = cache.get(source_id) {
                    tags.insert("applicationName".to_string(), info.name);
                    tags.insert("org".to_string(), info.org);
                    tags.insert("space".to_string(), info.space);
                }
            }
        }

        let mut tags = self.finish_tags(tags, envelope);
        tags.remove("app_name");
        tags.remove("organization_name");
        tags.remove("space_name");
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope(body: EnvelopeBody) -> Envelope {
        Envelope {
            timestamp: 1000,
            origin: "rtr".to_string(),
            source_id: None,
            deployment: Some("cf".to_string()),
            job: Some("router".to_string()),
            ip: Some("10.0.0.1".to_string()),
            tags: HashMap::new(),
            body,
        }
    }

    #[test]
    fn value_metric_scenario_1() {
        let xf = EventTransformer::new("pcf", "fA", "h1");
        let env = envelope(EnvelopeBody::ValueMetric {
            name: "latency".to_string(),
            unit: "ms".to_string(),
            value: 2.5,
        });
        let samples = xf.transform(&env, None);
        assert_eq!(samples.len(), 1);
        let s = &samples[0];
        assert_eq!(s.name, "pcf.rtr.latency.ms");
        assert_eq!(s.value, 2.5);
        assert_eq!(s.ts, 1000);
        assert_eq!(s.source, "10.0.0.1");
        assert_eq!(s.tags.get("foundation").unwrap(), "fA");
        assert_eq!(s.tags.get("deployment").unwrap(), "cf");
        assert_eq!(s.tags.get("job").unwrap(), "router");
    }

    #[test]
    fn counter_event_scenario_2() {
        let xf = EventTransformer::new("pcf", "fA", "h1");
        let mut env = envelope(EnvelopeBody::CounterEvent {
            name: "logins".to_string(),
            total: 100,
            delta: 3,
        });
        env.origin = "uaa".to_string();
        env.ip = None;
        env.job = None;
        env.deployment = None;
        env.timestamp = 2000;
        let samples = xf.transform(&env, None);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].name, "pcf.uaa.logins.total");
        assert_eq!(samples[0].value, 100.0);
        assert_eq!(samples[0].source, "h1");
        assert_eq!(samples[1].name, "pcf.uaa.logins.delta");
        assert_eq!(samples[1].value, 3.0);
        assert_eq!(samples[0].tags.len(), 1);
        assert_eq!(samples[0].tags.get("foundation").unwrap(), "fA");
    }

    #[test]
    fn container_metric_cache_miss_scenario_3() {
        let xf = EventTransformer::new("pcf", "fA", "h1");
        let mut env = envelope(EnvelopeBody::ContainerMetric {
            application_id: "G1".to_string(),
            instance_index: 2,
            cpu_percentage: 12.5,
            disk_bytes: 10,
            disk_bytes_quota: 100,
            memory_bytes: 20,
            memory_bytes_quota: 200,
        });
        env.origin = "rep".to_string();
        env.ip = Some("10.0.0.2".to_string());
        env.job = None;
        env.deployment = None;
        env.timestamp = 3000;
        let samples = xf.transform(&env, None);
        assert_eq!(samples.len(), 5);
        let names: Vec<&str> = samples.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "pcf.container.rep.cpu_percentage",
                "pcf.container.rep.disk_bytes",
                "pcf.container.rep.disk_bytes_quota",
                "pcf.container.rep.memory_bytes",
                "pcf.container.rep.memory_bytes_quota",
            ]
        );
        for s in &samples {
            assert_eq!(s.tags.get("applicationId").unwrap(), "G1");
            assert_eq!(s.tags.get("instanceIndex").unwrap(), "2");
            assert!(!s.tags.contains_key("applicationName"));
            assert!(!s.tags.contains_key("space"));
            assert!(!s.tags.contains_key("org"));
        }
    }

    #[test]
    fn foundation_tag_cannot_be_overridden_by_envelope() {
        let xf = EventTransformer::new("pcf", "fA", "h1");
        let mut env = envelope(EnvelopeBody::ValueMetric {
            name: "x".to_string(),
            unit: "u".to_string(),
            value: 1.0,
        });
        env.tags.insert("foundation".to_string(), "attacker-controlled".to_string());
        let samples = xf.transform(&env, None);
        assert_eq!(samples[0].tags.get("foundation").unwrap(), "fA");
    }

    #[test]
    fn container_name_translation_applied_only_to_v2_container_gauges() {
        assert_eq!(
            translate_container_name("pcf.container.rep.cpu.percentage"),
            "pcf.container.rep.cpu_percentage"
        );
        assert_eq!(
            translate_container_name("pcf.container.rep.disk.bytes"),
            "pcf.container.rep.disk_bytes"
        );
        assert_eq!(
            translate_container_name("pcf.container.rep.disk_quota.bytes"),
            "pcf.container.rep.disk_bytes_quota"
        );
        assert_eq!(
            translate_container_name("pcf.container.rep.memory.bytes"),
            "pcf.container.rep.memory_bytes"
        );
        assert_eq!(
            translate_container_name("pcf.container.rep.memory_quota.bytes"),
            "pcf.container.rep.memory_bytes_quota"
        );
        // Non-matching name: left untouched, and idempotent under a second pass.
        let untouched = translate_container_name("pcf.container.rep.other_thing");
        assert_eq!(untouched, "pcf.container.rep.other_thing");
        assert_eq!(translate_container_name(&untouched), untouched);
    }

    #[test]
    fn v2_gauge_container_path_resolves_from_envelope_tags_without_cache() {
        let xf = EventTransformer::new("pcf", "fA", "h1");
        let mut metrics = HashMap::new();
        metrics.insert(
            "cpu.percentage".to_string(),
            crate::envelope::GaugeValue { value: 42.0, unit: String::new() },
        );
        let mut env = envelope(EnvelopeBody::Gauge { metrics });
        env.origin = "rep".to_string();
        env.source_id = Some("G2".to_string());
        env.tags.insert("app_name".to_string(), "myapp".to_string());
        env.tags.insert("organization_name".to_string(), "myorg".to_string());
        env.tags.insert("space_name".to_string(), "myspace".to_string());

        let samples = xf.transform(&env, None);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].name, "pcf.container.rep.cpu_percentage");
        assert_eq!(samples[0].tags.get("applicationName").unwrap(), "myapp");
        assert_eq!(samples[0].tags.get("org").unwrap(), "myorg");
        assert_eq!(samples[0].tags.get("space").unwrap(), "myspace");
        assert!(!samples[0].tags.contains_key("app_name"));
        assert!(!samples[0].tags.contains_key("organization_name"));
        assert!(!samples[0].tags.contains_key("space_name"));
    }

    #[tokio::test]
    async fn v2_gauge_container_path_falls_back_to_cache_by_source_id() {
        use crate::appclient::AppLookup;
        use crate::cache::{AppInfo, CacheConfig};
        use async_trait::async_trait;

        struct FakeLookup;
        #[async_trait]
        impl AppLookup for FakeLookup {
            async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>> {
                Ok(vec![])
            }
            async fn lookup_one(&self, guid: &str) -> anyhow::Result<AppInfo> {
                Ok(AppInfo {
                    guid: guid.to_string(),
                    name: "looked-up-app".to_string(),
                    space: "s".to_string(),
                    org: "o".to_string(),
                })
            }
        }

        let cache = AppInfoCache::new(
            CacheConfig { enable_preload: false, ..Default::default() },
            Arc::new(FakeLookup),
        );

        let xf = EventTransformer::new("pcf", "fA", "h1");
        let mut metrics = HashMap::new();
        metrics.insert("cpu.percentage".to_string(), crate::envelope::GaugeValue { value: 1.0, unit: String::new() });
        let mut env = envelope(EnvelopeBody::Gauge { metrics });
        env.origin = "rep".to_string();
        env.source_id = Some("G3".to_string());

        let first = xf.transform(&env, Some(&cache));
        assert!(!first[0].tags.contains_key("applicationName"));

        for _ in 0..50 {
            if cache.get("G3").is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let second = xf.transform(&env, Some(&cache));
        assert_eq!(second[0].tags.get("applicationName").unwrap(), "looked-up-app");
    }
}
