// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The envelope data model: one message from the upstream event stream.

use std::collections::HashMap;

/// A variant of envelope selectable in `NOZZLE_SELECTED_EVENTS`. Used by the
/// worker pool's variant gate (§4.5) and by the stream controller to build
/// its subscription selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    Counter,
    Gauge,
    Log,
    Timer,
    Event,
    HttpStartStop,
    ValueMetric,
    CounterEvent,
    ContainerMetric,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvelopeKind::Counter => "Counter",
            EnvelopeKind::Gauge => "Gauge",
            EnvelopeKind::Log => "Log",
            EnvelopeKind::Timer => "Timer",
            EnvelopeKind::Event => "Event",
            EnvelopeKind::HttpStartStop => "HttpStartStop",
            EnvelopeKind::ValueMetric => "ValueMetric",
            EnvelopeKind::CounterEvent => "CounterEvent",
            EnvelopeKind::ContainerMetric => "ContainerMetric",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s.trim() {
            "Counter" => EnvelopeKind::Counter,
            "Gauge" => EnvelopeKind::Gauge,
            "Log" => EnvelopeKind::Log,
            "Timer" => EnvelopeKind::Timer,
            "Event" => EnvelopeKind::Event,
            "HttpStartStop" => EnvelopeKind::HttpStartStop,
            "ValueMetric" => EnvelopeKind::ValueMetric,
            "CounterEvent" => EnvelopeKind::CounterEvent,
            "ContainerMetric" => EnvelopeKind::ContainerMetric,
            _ => return None,
        })
    }
}

/// A single value in a v2 `Gauge` envelope's metric map.
#[derive(Debug, Clone, PartialEq)]
pub struct GaugeValue {
    pub value: f64,
    pub unit: String,
}

/// The payload carried by an envelope, tagged by variant. `Log`, `Timer`,
/// `Event` and `HttpStartStop` carry no payload: the worker pool's variant
/// gate discards them before a transformer ever sees them, but they still
/// need a representation so gating is a cheap enum match rather than a
/// missing-case panic.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeBody {
    Counter {
        name: String,
        total: u64,
        delta: u64,
    },
    Gauge {
        metrics: HashMap<String, GaugeValue>,
    },
    Log,
    Timer,
    Event,
    HttpStartStop,
    ValueMetric {
        name: String,
        unit: String,
        value: f64,
    },
    CounterEvent {
        name: String,
        total: u64,
        delta: u64,
    },
    ContainerMetric {
        application_id: String,
        instance_index: i32,
        cpu_percentage: f64,
        disk_bytes: u64,
        disk_bytes_quota: u64,
        memory_bytes: u64,
        memory_bytes_quota: u64,
    },
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            EnvelopeBody::Counter { .. } => EnvelopeKind::Counter,
            EnvelopeBody::Gauge { .. } => EnvelopeKind::Gauge,
            EnvelopeBody::Log => EnvelopeKind::Log,
            EnvelopeBody::Timer => EnvelopeKind::Timer,
            EnvelopeBody::Event => EnvelopeKind::Event,
            EnvelopeBody::HttpStartStop => EnvelopeKind::HttpStartStop,
            EnvelopeBody::ValueMetric { .. } => EnvelopeKind::ValueMetric,
            EnvelopeBody::CounterEvent { .. } => EnvelopeKind::CounterEvent,
            EnvelopeBody::ContainerMetric { .. } => EnvelopeKind::ContainerMetric,
        }
    }
}

/// One message pulled off the upstream stream. `timestamp` is nanoseconds
/// since epoch, matching the wire format's resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub timestamp: i64,
    pub origin: String,
    pub source_id: Option<String>,
    pub deployment: Option<String>,
    pub job: Option<String>,
    pub ip: Option<String>,
    pub tags: HashMap<String, String>,
    pub body: EnvelopeBody,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// `ip` else `job` else `hostname` else `"unknown"` — the source
    /// resolution shared by every variant (spec invariant).
    pub fn resolve_source(&self, hostname: &str) -> String {
        if let Some(ip) = self.ip.as_deref().filter(|s| !s.is_empty()) {
            return ip.to_string();
        }
        if let Some(job) = self.job.as_deref().filter(|s| !s.is_empty()) {
            return job.to_string();
        }
        if !hostname.is_empty() {
            return hostname.to_string();
        }
        "unknown".to_string()
    }
}
