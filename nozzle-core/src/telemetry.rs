// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Self-telemetry metric names. One source of truth so components never
//! inline string literals when recording to the `metrics` registry.

pub const CACHE_SIZE: &str = "cache.size";
pub const CACHE_MISS: &str = "cache.miss";
pub const CACHE_ERRORS: &str = "cache.errors";

pub const QUEUE_SIZE: &str = "nozzle.queue.size";
pub const QUEUE_USED: &str = "nozzle.queue.used";
pub const QUEUE_PUTS: &str = "nozzle.queue.puts";
pub const QUEUE_DROPS: &str = "nozzle.queue.drops";

pub const METRICS_FILTERED: &str = "metrics-filtered";
pub const METRICS_SEND_FAILURE: &str = "metrics-send-failure";
pub const TOTAL_METRICS_SENT: &str = "total-metrics-sent";
pub const METRICS_SEND_TIME: &str = "metrics-send-time";
