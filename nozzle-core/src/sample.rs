// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The sample type produced by the transformer and consumed by the emitter.

use std::collections::HashMap;

/// One time-series point, fully resolved: name, value, timestamp, source and
/// tags are final by the time a worker hands this to [`crate::emitter`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub ts: i64,
    pub source: String,
    pub tags: HashMap<String, String>,
}

impl MetricSample {
    pub fn new(
        name: impl Into<String>,
        value: f64,
        ts: i64,
        source: impl Into<String>,
        tags: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            ts,
            source: source.into(),
            tags,
        }
    }
}
