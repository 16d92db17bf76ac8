// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The upstream subscription loop (§4.6): acquire an auth token, open the
//! event stream, push envelopes into the ingest queue, reconnect on any
//! failure. Grounded on `nozzle/main.go`'s `Run` (the `Connecting` ->
//! `Streaming` -> `Reconnecting` cycle and the `tokenAttacher` that cancels
//! the stream context on a failed token fetch).
//!
//! The gateway client's wire framing and the legacy websocket's frame
//! format are implementation details of the upstream collaborator, not load
//! bearing to the pipeline; both variants here decode a line-delimited JSON
//! envelope representation into the same [`Envelope`] type so the rest of
//! the pipeline never knows which one is running.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::appclient::AuthTokenProvider;
use crate::envelope::{Envelope, EnvelopeBody, GaugeValue};
use crate::error::NozzleError;
use crate::pipeline::IngestQueue;

/// Wire shape decoded from either upstream: one JSON object per line/frame,
/// tagged by `kind`. Fields absent for a given kind are simply omitted.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    kind: String,
    timestamp: i64,
    origin: String,
    #[serde(default)]
    source_id: Option<String>,
    #[serde(default)]
    deployment: Option<String>,
    #[serde(default)]
    job: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    tags: std::collections::HashMap<String, String>,

    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    value: Option<f64>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    delta: Option<u64>,
    #[serde(default)]
    metrics: Option<std::collections::HashMap<String, GaugeValue>>,
    #[serde(default)]
    application_id: Option<String>,
    #[serde(default)]
    instance_index: Option<i32>,
    #[serde(default)]
    cpu_percentage: Option<f64>,
    #[serde(default)]
    disk_bytes: Option<u64>,
    #[serde(default)]
    disk_bytes_quota: Option<u64>,
    #[serde(default)]
    memory_bytes: Option<u64>,
    #[serde(default)]
    memory_bytes_quota: Option<u64>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = NozzleError;

    fn try_from(w: WireEnvelope) -> Result<Self, Self::Error> {
        let body = match w.kind.as_str() {
            "Counter" => EnvelopeBody::Counter {
                name: w.name.ok_or_else(|| NozzleError::Stream("Counter frame missing name".into()))?,
                total: w.total.unwrap_or_default(),
                delta: w.delta.unwrap_or_default(),
            },
            "CounterEvent" => EnvelopeBody::CounterEvent {
                name: w.name.ok_or_else(|| NozzleError::Stream("CounterEvent frame missing name".into()))?,
                total: w.total.unwrap_or_default(),
                delta: w.delta.unwrap_or_default(),
            },
            "Gauge" => EnvelopeBody::Gauge { metrics: w.metrics.unwrap_or_default() },
            "ValueMetric" => EnvelopeBody::ValueMetric {
                name: w.name.ok_or_else(|| NozzleError::Stream("ValueMetric frame missing name".into()))?,
                unit: w.unit.unwrap_or_default(),
                value: w.value.unwrap_or_default(),
            },
            "ContainerMetric" => EnvelopeBody::ContainerMetric {
                application_id: w
                    .application_id
                    .ok_or_else(|| NozzleError::Stream("ContainerMetric frame missing application_id".into()))?,
                instance_index: w.instance_index.unwrap_or_default(),
                cpu_percentage: w.cpu_percentage.unwrap_or_default(),
                disk_bytes: w.disk_bytes.unwrap_or_default(),
                disk_bytes_quota: w.disk_bytes_quota.unwrap_or_default(),
                memory_bytes: w.memory_bytes.unwrap_or_default(),
                memory_bytes_quota: w.memory_bytes_quota.unwrap_or_default(),
            },
            "Log" => EnvelopeBody::Log,
            "Timer" => EnvelopeBody::Timer,
            "Event" => EnvelopeBody::Event,
            "HttpStartStop" => EnvelopeBody::HttpStartStop,
            other => return Err(NozzleError::Stream(format!("unrecognized envelope kind {other:?}"))),
        };
        Ok(Envelope {
            timestamp: w.timestamp,
            origin: w.origin,
            source_id: w.source_id,
            deployment: w.deployment,
            job: w.job,
            ip: w.ip,
            tags: w.tags,
            body,
        })
    }
}

fn decode_line(line: &str) -> Option<Result<Envelope, NozzleError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<WireEnvelope>(line)
            .map_err(|e| NozzleError::Stream(format!("decoding envelope frame: {e}")))
            .and_then(Envelope::try_from),
    )
}

/// A connected upstream producing envelopes, selected at construction time
/// by `legacy` (§4.6 "Legacy path").
#[async_trait]
pub trait EnvelopeSource: Send + Sync {
    async fn connect(&self, token: &str) -> Result<BoxStream<'static, Result<Envelope, NozzleError>>, NozzleError>;
}

/// The gateway-streaming client: a long-lived HTTP GET carrying newline
/// delimited envelope frames, selectors and shard id passed as query
/// parameters, token attached as a bearer header per request (mirrors the
/// `tokenAttacher`/`RLPGatewayClient` pairing in `nozzle/main.go`).
pub struct GatewayEnvelopeSource {
    client: reqwest::Client,
    log_stream_url: String,
    shard_id: String,
}

impl GatewayEnvelopeSource {
    pub fn new(log_stream_url: String, shard_id: String) -> Self {
        Self { client: reqwest::Client::new(), log_stream_url, shard_id }
    }
}

#[async_trait]
impl EnvelopeSource for GatewayEnvelopeSource {
    async fn connect(&self, token: &str) -> Result<BoxStream<'static, Result<Envelope, NozzleError>>, NozzleError> {
        let resp = self
            .client
            .get(format!("{}/v2/read", self.log_stream_url))
            .query(&[("shard_id", self.shard_id.as_str()), ("selector", "counter,gauge")])
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| NozzleError::Stream(format!("opening gateway stream: {e}")))?;

        if resp.status().as_u16() == 404 {
            return Err(NozzleError::Stream("token expired (404)".to_string()));
        }
        let resp = resp
            .error_for_status()
            .map_err(|e| NozzleError::Stream(format!("gateway stream rejected: {e}")))?;

        let mut buf = String::new();
        let byte_stream = resp.bytes_stream().map(|chunk| chunk.map_err(|e| NozzleError::Stream(e.to_string())));

        let envelopes = byte_stream.flat_map(move |chunk| {
            let mut out = Vec::new();
            match chunk {
                Ok(bytes) => {
                    buf.push_str(&String::from_utf8_lossy(&bytes));
                    while let Some(pos) = buf.find('\n') {
                        let line: String = buf.drain(..=pos).collect();
                        if let Some(decoded) = decode_line(&line) {
                            out.push(decoded);
                        }
                    }
                }
                Err(e) => out.push(Err(e)),
            }
            futures::stream::iter(out)
        });

        Ok(Box::pin(envelopes))
    }
}

/// The legacy websocket firehose client (§4.6 "Legacy path"): text frames,
/// one envelope per frame, selected via `NOZZLE_LEGACY`/`legacy_mode`.
pub struct LegacyEnvelopeSource {
    firehose_url: String,
}

impl LegacyEnvelopeSource {
    pub fn new(firehose_url: String) -> Self {
        Self { firehose_url }
    }
}

#[async_trait]
impl EnvelopeSource for LegacyEnvelopeSource {
    async fn connect(&self, token: &str) -> Result<BoxStream<'static, Result<Envelope, NozzleError>>, NozzleError> {
        use tokio_tungstenite::tungstenite::client::IntoClientRequest;
        use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;

        let mut request = self
            .firehose_url
            .clone()
            .into_client_request()
            .map_err(|e| NozzleError::Stream(format!("building legacy firehose request: {e}")))?;
        let auth_value = format!("bearer {token}")
            .parse()
            .map_err(|e| NozzleError::Stream(format!("invalid auth token for header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, auth_value);

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| NozzleError::Stream(format!("connecting legacy firehose: {e}")))?;

        if response.status().as_u16() == 404 {
            return Err(NozzleError::Stream("token expired (404)".to_string()));
        }

        let envelopes = ws.filter_map(|msg| async move {
            match msg {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => decode_line(&text),
                Ok(tokio_tungstenite::tungstenite::Message::Close(frame)) => {
                    Some(Err(NozzleError::Stream(format!("legacy firehose closed: {frame:?}"))))
                }
                Ok(_) => None,
                Err(e) => Some(Err(NozzleError::Stream(format!("legacy firehose read: {e}")))),
            }
        });

        Ok(Box::pin(envelopes))
    }
}

/// Drives the `Connecting -> Streaming -> Reconnecting` cycle (§4.6). Never
/// returns under normal operation; intended to be the binary's terminal
/// `.await`.
pub struct StreamController {
    auth: Arc<dyn AuthTokenProvider>,
    source: Arc<dyn EnvelopeSource>,
    queue: IngestQueue,
}

impl StreamController {
    pub fn new(auth: Arc<dyn AuthTokenProvider>, source: Arc<dyn EnvelopeSource>, queue: IngestQueue) -> Self {
        Self { auth, source, queue }
    }

    /// Builds the gateway or legacy variant per `legacy`, both adapting into
    /// the same `Envelope` type so the caller never branches on which one it
    /// is running.
    pub fn build_source(legacy: bool, log_stream_url: &str, shard_id: &str) -> Arc<dyn EnvelopeSource> {
        if legacy {
            Arc::new(LegacyEnvelopeSource::new(log_stream_url.to_string()))
        } else {
            Arc::new(GatewayEnvelopeSource::new(log_stream_url.to_string(), shard_id.to_string()))
        }
    }

    /// Runs the cycle forever. Each iteration re-authenticates (Connecting),
    /// drains the stream until it ends for any reason (Streaming), then
    /// logs and loops back (Reconnecting) with no backoff, per spec.
    pub async fn run(&self) -> ! {
        loop {
            let cancel = CancellationToken::new();
            match self.connect_and_stream(&cancel).await {
                Ok(()) => info!("upstream stream ended cleanly, reconnecting"),
                Err(e) if e.to_string().contains("404") => {
                    warn!("auth token expired, reacquiring");
                    let _ = e;
                }
                Err(e) => warn!(error = %e, "upstream stream failed, reconnecting"),
            }
        }
    }

    async fn connect_and_stream(&self, cancel: &CancellationToken) -> Result<(), NozzleError> {
        let token = self
            .auth
            .fetch_token()
            .await
            .map_err(|e| NozzleError::Stream(format!("fetching auth token: {e}")))?;
        debug!("acquired auth token, opening stream");

        let mut stream = self.source.connect(&token).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stream context cancelled");
                    return Ok(());
                }
                next = stream.next() => {
                    match next {
                        Some(Ok(envelope)) => self.queue.try_put(envelope),
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
