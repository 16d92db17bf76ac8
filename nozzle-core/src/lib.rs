// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core streaming pipeline for the telemetry nozzle: subscribe to an event
//! firehose, transform envelopes into metric samples, enrich with
//! application identity, filter, and forward to a metrics backend.

pub mod appclient;
pub mod cache;
pub mod config;
pub mod emitter;
pub mod envelope;
pub mod error;
pub mod filter;
pub mod pipeline;
pub mod sample;
pub mod sender;
pub mod stream;
pub mod telemetry;
pub mod transform;

pub use error::NozzleError;
