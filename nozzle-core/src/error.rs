// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the nozzle pipeline.

/// The four error kinds the pipeline distinguishes, each with a fixed
/// handling policy (see spec §7): configuration failures halt the process,
/// everything else is logged and the pipeline continues.
#[derive(Debug, thiserror::Error)]
pub enum NozzleError {
    /// Missing required variable, conflicting credential pair, unparseable
    /// filter, or no sender configuration found. Fatal at start-up.
    #[error("configuration error: {0}")]
    Config(String),

    /// Network error, auth 404, or peer close on the upstream stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// App-identity lookup failure. Non-fatal; the container metric is
    /// still emitted without identity tags.
    #[error("app lookup failed for {guid}: {source}")]
    Lookup {
        guid: String,
        #[source]
        source: anyhow::Error,
    },

    /// Downstream sender failure. Non-fatal.
    #[error("send failed: {0}")]
    Send(String),
}
