// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The downstream metrics-backend sender: a black-box `SendMetric(name,
//! value, ts, source, tags)` contract per spec.md §1. Construction-time
//! selection between direct (HTTPS+token) and proxy (local TCP relay) modes
//! mirrors `senders.NewDirectSender`/`senders.NewProxySender` in
//! `internal/wavefront/wavefront.go`; batching/flushing internals are the
//! sender library's own concern, not the pipeline's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::config::SenderConfig;
use crate::error::NozzleError;

/// The sender contract every worker calls into. Implementations are
/// internally synchronized — §5 requires workers be able to call from any
/// thread without holding a lock across the network I/O.
#[async_trait]
pub trait MetricSender: Send + Sync {
    async fn send_metric(
        &self,
        name: &str,
        value: f64,
        ts: i64,
        source: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), NozzleError>;
}

/// Formats one sample as a Wavefront plaintext metric line:
/// `"<name>" <value> <ts> source=<source> <tagk>=<tagv> ...`
fn metric_line(name: &str, value: f64, ts: i64, source: &str, tags: &HashMap<String, String>) -> String {
    let mut line = format!("\"{name}\" {value} {ts} source=\"{source}\"");
    for (k, v) in tags {
        line.push(' ');
        line.push_str(&format!("\"{k}\"=\"{v}\""));
    }
    line.push('\n');
    line
}

/// Direct mode: batches lines and flushes them to the backend's report
/// endpoint over HTTPS with a bearer token, per `senders.DirectConfiguration`.
pub struct DirectSender {
    client: reqwest::Client,
    url: String,
    token: String,
    buffer: Mutex<Vec<String>>,
    batch_size: usize,
    max_buffer_size: usize,
}

impl DirectSender {
    pub fn new(
        url: String,
        token: String,
        batch_size: usize,
        max_buffer_size: usize,
        flush_interval: Duration,
    ) -> Arc<Self> {
        let sender = Arc::new(Self {
            client: reqwest::Client::new(),
            url,
            token,
            buffer: Mutex::new(Vec::new()),
            batch_size,
            max_buffer_size,
        });
        let flushed = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            loop {
                ticker.tick().await;
                flushed.flush().await;
            }
        });
        sender
    }

    async fn flush(&self) {
        let batch: Vec<String> = {
            let mut buf = self.buffer.lock().await;
            if buf.is_empty() {
                return;
            }
            std::mem::take(&mut *buf)
        };
        let body = batch.join("");
        let _ = self
            .client
            .post(format!("{}/report?f=wavefront", self.url))
            .bearer_auth(&self.token)
            .header("content-type", "text/plain")
            .body(body)
            .send()
            .await;
    }
}

#[async_trait]
impl MetricSender for DirectSender {
    async fn send_metric(
        &self,
        name: &str,
        value: f64,
        ts: i64,
        source: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), NozzleError> {
        let line = metric_line(name, value, ts, source, tags);
        let should_flush = {
            let mut buf = self.buffer.lock().await;
            if buf.len() >= self.max_buffer_size {
                return Err(NozzleError::Send(format!(
                    "buffer full ({} lines), dropping {name}",
                    self.max_buffer_size
                )));
            }
            buf.push(line);
            buf.len() >= self.batch_size
        };
        if should_flush {
            self.flush().await;
        }
        Ok(())
    }
}

/// Proxy mode: one TCP connection per sender instance to a local Wavefront
/// proxy relay, per `senders.ProxyConfiguration`. A metric and histogram
/// sender are distinct instances bound to distinct ports when configured
/// (§4.3).
pub struct ProxySender {
    conn: Mutex<Option<TcpStream>>,
    addr: String,
    port: u16,
}

impl ProxySender {
    pub fn new(addr: String, port: u16) -> Self {
        Self { conn: Mutex::new(None), addr, port }
    }

    async fn connection(&self) -> Result<tokio::sync::MutexGuard<'_, Option<TcpStream>>, NozzleError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect((self.addr.as_str(), self.port))
                .await
                .map_err(|e| NozzleError::Send(format!("connecting to proxy {}:{}: {e}", self.addr, self.port)))?;
            *guard = Some(stream);
        }
        Ok(guard)
    }
}

#[async_trait]
impl MetricSender for ProxySender {
    async fn send_metric(
        &self,
        name: &str,
        value: f64,
        ts: i64,
        source: &str,
        tags: &HashMap<String, String>,
    ) -> Result<(), NozzleError> {
        let line = metric_line(name, value, ts, source, tags);
        let mut guard = self.connection().await?;
        let stream = guard.as_mut().expect("connection() always populates the slot");
        if let Err(e) = stream.write_all(line.as_bytes()).await {
            *guard = None; // reconnect on next send
            return Err(NozzleError::Send(format!("writing to proxy: {e}")));
        }
        Ok(())
    }
}

/// The metric sender and, when configured separately, the histogram sender
/// (§4.3 construction rules).
pub struct Senders {
    pub metric: Arc<dyn MetricSender>,
    pub histogram: Arc<dyn MetricSender>,
}

impl Senders {
    pub fn build(config: &SenderConfig) -> Result<Self, NozzleError> {
        match config {
            SenderConfig::Direct { url, token, batch_size, max_buffer_size, flush_interval } => {
                let sender: Arc<dyn MetricSender> = DirectSender::new(
                    url.clone(),
                    token.clone(),
                    *batch_size,
                    *max_buffer_size,
                    *flush_interval,
                );
                Ok(Self { metric: Arc::clone(&sender), histogram: sender })
            }
            SenderConfig::Proxy { addr, metrics_port, histogram_port, .. } => {
                let metric: Arc<dyn MetricSender> = Arc::new(ProxySender::new(addr.clone(), *metrics_port));
                let histogram: Arc<dyn MetricSender> = match histogram_port {
                    Some(port) if *port != *metrics_port => Arc::new(ProxySender::new(addr.clone(), *port)),
                    _ => Arc::clone(&metric),
                };
                Ok(Self { metric, histogram })
            }
        }
    }
}
