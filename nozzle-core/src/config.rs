// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Environment-variable configuration, read once at process start (§6).
//!
//! Out of scope per spec.md §1 ("external collaborators"), but still part of
//! the ambient stack a complete binary needs — ground truth is
//! `internal/config/config.go` from original_source.

use std::collections::HashMap;
use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::appclient::{AppClientConfig, Credentials};
use crate::envelope::EnvelopeKind;
use crate::error::NozzleError;
use crate::filter::FilterSpec;

/// Fully resolved configuration for one process run.
#[derive(Debug, Clone)]
pub struct Config {
    pub app_client: AppClientConfig,
    pub log_stream_url: String,
    pub firehose_subscription_id: String,
    pub legacy: bool,

    pub app_cache_expiration: Duration,
    pub app_cache_size: usize,
    pub enable_app_cache: bool,

    pub selected_events: Vec<EnvelopeKind>,
    pub channel_size: usize,
    pub workers: usize,

    pub prefix: String,
    pub foundation: String,

    pub sender: SenderConfig,
    pub filter: FilterSpec,
}

/// Construction-time choice between direct and proxy Wavefront senders,
/// resolved the same way `internal/wavefront/wavefront.go` picks a
/// `senders.Sender` (§4.3).
#[derive(Debug, Clone)]
pub enum SenderConfig {
    Direct {
        url: String,
        token: String,
        batch_size: usize,
        max_buffer_size: usize,
        flush_interval: Duration,
    },
    Proxy {
        addr: String,
        metrics_port: u16,
        histogram_port: Option<u16>,
        flush_interval: Duration,
    },
}

/// `ADVANCED_CONFIG`'s recognized JSON fields (§9), nested the same way the
/// source's `selected_option` wrapper is.
#[derive(Debug, Default, Deserialize)]
struct AdvancedConfig {
    #[serde(default)]
    selected_option: AdvancedConfigValues,
}

#[derive(Debug, Default, Deserialize)]
struct AdvancedConfigValues {
    #[serde(default, rename = "custom_wf_proxy_addr")]
    proxy_addr: Option<String>,
    #[serde(default, rename = "custom_wf_proxy_port")]
    proxy_port: Option<u16>,
    #[serde(default, rename = "custom_wf_proxy_his_min_port")]
    proxy_his_min_port: Option<u16>,
    #[serde(default)]
    selected_events: Option<Vec<String>>,
    #[serde(default, rename = "filter_metrics_black_list")]
    metrics_black_list: Option<String>,
    #[serde(default, rename = "filter_metrics_white_list")]
    metrics_white_list: Option<String>,
    #[serde(default, rename = "metrics_to_histogram_filter")]
    metrics_to_his_list: Option<String>,
    #[serde(default)]
    legacy_mode: Option<bool>,
}

fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn require(name: &str) -> Result<String, NozzleError> {
    env_var(name).ok_or_else(|| NozzleError::Config(format!("missing required variable {name}")))
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> Result<usize, NozzleError> {
    match env_var(name) {
        Some(v) => v
            .parse()
            .map_err(|_| NozzleError::Config(format!("{name} must be a non-negative integer, got {v:?}"))),
        None => Ok(default),
    }
}

fn env_u16(name: &str) -> Result<Option<u16>, NozzleError> {
    match env_var(name) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| NozzleError::Config(format!("{name} must be a port number, got {v:?}"))),
        None => Ok(None),
    }
}

/// Parses a duration suffix of `s`/`m`/`h` the way Go's `time.ParseDuration`
/// does for the subset this config uses (`"6h"`, `"5s"`, ...).
fn env_duration(name: &str, default: Duration) -> Result<Duration, NozzleError> {
    match env_var(name) {
        None => Ok(default),
        Some(v) => parse_duration(&v)
            .ok_or_else(|| NozzleError::Config(format!("{name} is not a valid duration: {v:?}"))),
    }
}

fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let (num, unit) = s.split_at(s.len().checked_sub(1)?);
    let n: u64 = num.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(n)),
        "m" => Some(Duration::from_secs(n * 60)),
        "h" => Some(Duration::from_secs(n * 3600)),
        _ => None,
    }
}

/// `X=A; X_1=B; X_2=C` -> `"A,B,C"`; a gap at `X_3` leaves `X_4` unread
/// (matches `parseIndexedVars` in `internal/config/config.go`).
fn indexed_concat(base: &str) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if let Some(v) = env_var(base) {
        parts.push(v);
    }
    let mut idx = 1u32;
    loop {
        match env_var(&format!("{base}_{idx}")) {
            Some(v) => {
                parts.push(v);
                idx += 1;
            }
            None => break,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect()
}

/// Parses the `tag:[pat,pat],tag2:[pat]` grammar (§6), rejecting a bare
/// `tag:word` with no brackets as a syntax error, matching
/// `filter.TagFilter.Decode`.
fn parse_tag_filter(s: &str) -> Result<HashMap<String, Vec<String>>, NozzleError> {
    if s.trim().is_empty() {
        return Ok(HashMap::new());
    }
    // A `:WORD` with no following `[` is the source's bad-format guard.
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b':' {
            let next = bytes.get(i + 1).copied();
            if next.is_some_and(|b| b != b'[' && (b as char).is_alphanumeric()) {
                return Err(NozzleError::Config(format!(
                    "bad format for tag filter {s:?}: want 'tagName:[pat,pat,...]'"
                )));
            }
        }
        i += 1;
    }

    let mut out = HashMap::new();
    let mut rest = s;
    while let Some(colon) = rest.find(':') {
        let name = rest[..colon].trim();
        let after = &rest[colon + 1..];
        let open = after
            .find('[')
            .ok_or_else(|| NozzleError::Config(format!("bad format for tag filter {s:?}")))?;
        let close = after
            .find(']')
            .ok_or_else(|| NozzleError::Config(format!("bad format for tag filter {s:?}")))?;
        if open != 0 {
            // leading junk before '[' belongs to a name that isn't of the form tag:[...]
            return Err(NozzleError::Config(format!("bad format for tag filter {s:?}")));
        }
        let patterns = split_csv(&after[open + 1..close]);
        if !name.is_empty() {
            out.insert(name.to_string(), patterns);
        }
        rest = &after[close + 1..];
        let rest_trimmed = rest.trim_start_matches(',');
        rest = rest_trimmed;
    }
    Ok(out)
}

fn parse_selected_events(s: &str) -> Vec<EnvelopeKind> {
    let trimmed = s.trim().trim_start_matches('[').trim_end_matches(']');
    trimmed
        .split([',', ' '])
        .filter_map(|p| EnvelopeKind::parse(p.trim()))
        .collect()
}

const DEFAULT_SELECTED_EVENTS: &[EnvelopeKind] =
    &[EnvelopeKind::ValueMetric, EnvelopeKind::CounterEvent, EnvelopeKind::ContainerMetric];

impl Config {
    /// Reads every variable named in spec.md §6 from the process
    /// environment. Returns `NozzleError::Config` on the first problem
    /// (missing required variable, conflicting credential pair, unparseable
    /// filter, no sender configuration) so `main` can log-and-exit.
    pub fn from_env() -> Result<Self, NozzleError> {
        let api_url = require("NOZZLE_API_URL")?;

        let userpass = (env_var("NOZZLE_USERNAME"), env_var("NOZZLE_PASSWORD"));
        let clientcreds = (env_var("NOZZLE_CLIENT_ID"), env_var("NOZZLE_CLIENT_SECRET"));
        let credentials = match (userpass, clientcreds) {
            ((Some(username), Some(password)), (None, None)) => {
                Credentials::UserPass { username, password }
            }
            ((None, None), (Some(client_id), Some(client_secret))) => {
                Credentials::ClientCredentials { client_id, client_secret }
            }
            ((None, None), (None, None)) => {
                return Err(NozzleError::Config(
                    "exactly one of NOZZLE_USERNAME/NOZZLE_PASSWORD or NOZZLE_CLIENT_ID/NOZZLE_CLIENT_SECRET must be set"
                        .to_string(),
                ))
            }
            _ => {
                return Err(NozzleError::Config(
                    "NOZZLE_USERNAME/PASSWORD and NOZZLE_CLIENT_ID/SECRET are mutually exclusive"
                        .to_string(),
                ))
            }
        };

        let log_stream_url = require("NOZZLE_LOG_STREAM_URL")?;
        let firehose_subscription_id = require("NOZZLE_FIREHOSE_SUBSCRIPTION_ID")?;
        let skip_ssl = env_bool("NOZZLE_SKIP_SSL", false);

        let app_cache_expiration = env_duration("NOZZLE_APP_CACHE_EXPIRATION", Duration::from_secs(6 * 3600))?;
        let app_cache_size = env_usize("NOZZLE_APP_CACHE_SIZE", 50_000)?;
        let enable_app_cache = env_bool("NOZZLE_ENABLE_APP_CACHE", true);

        let channel_size = env_usize("NOZZLE_CHANNEL_SIZE", 10_000)?;
        let workers = env_usize("NOZZLE_WORKERS", 2)?;
        let mut legacy = env_bool("NOZZLE_LEGACY", false);

        let prefix = require("WAVEFRONT_PREFIX")?.trim().to_string();
        let foundation = require("WAVEFRONT_FOUNDATION")?.trim().to_string();

        let advanced = match env_var("ADVANCED_CONFIG") {
            Some(raw) => serde_json::from_str::<AdvancedConfig>(&raw)
                .map_err(|e| NozzleError::Config(format!("invalid ADVANCED_CONFIG json: {e}")))?,
            None => AdvancedConfig::default(),
        };
        if let Some(true) = advanced.selected_option.legacy_mode {
            legacy = true;
        }

        let selected_events = match &advanced.selected_option.selected_events {
            Some(events) if !events.is_empty() => {
                events.iter().filter_map(|e| EnvelopeKind::parse(e)).collect()
            }
            _ => match env_var("NOZZLE_SELECTED_EVENTS") {
                Some(raw) => parse_selected_events(&raw),
                None => DEFAULT_SELECTED_EVENTS.to_vec(),
            },
        };

        let mut proxy_addr = env_var("WAVEFRONT_PROXY_ADDR");
        let mut proxy_port = env_u16("WAVEFRONT_PROXY_PORT")?;
        let mut proxy_his_port = env_u16("WAVEFRONT_PROXY_HISTOGRAM_MINUTE_PORT")?.or(Some(40001));
        if let Some(custom_addr) = advanced.selected_option.proxy_addr.clone() {
            if advanced.selected_option.proxy_port.is_some_and(|p| p > 0) && !custom_addr.is_empty() {
                proxy_addr = Some(custom_addr);
                proxy_port = advanced.selected_option.proxy_port;
                if let Some(his_port) = advanced.selected_option.proxy_his_min_port {
                    proxy_his_port = Some(his_port);
                }
            }
        }

        let url = env_var("WAVEFRONT_URL");
        let token = env_var("WAVEFRONT_API_TOKEN");
        let flush_interval =
            Duration::from_secs(env_usize("WAVEFRONT_FLUSH_INTERVAL", 5)? as u64);

        let sender = if let (Some(url), Some(token)) = (url, token) {
            SenderConfig::Direct {
                url,
                token,
                batch_size: env_usize("WAVEFRONT_BATCH_SIZE", 10_000)?,
                max_buffer_size: env_usize("WAVEFRONT_MAX_BUFFER_SIZE", 100_000)?,
                flush_interval,
            }
        } else if let (Some(addr), Some(port)) = (proxy_addr, proxy_port) {
            SenderConfig::Proxy {
                addr,
                metrics_port: port,
                histogram_port: proxy_his_port,
                flush_interval,
            }
        } else {
            return Err(NozzleError::Config(
                "no Wavefront sender configuration found: set WAVEFRONT_URL+WAVEFRONT_API_TOKEN or WAVEFRONT_PROXY_ADDR+WAVEFRONT_PROXY_PORT"
                    .to_string(),
            ));
        };

        let metrics_black_list = match advanced.selected_option.metrics_black_list.clone() {
            Some(v) if !v.is_empty() => split_csv(&v),
            _ => indexed_concat("FILTER_METRICS_BLACK_LIST").map(|s| split_csv(&s)).unwrap_or_default(),
        };
        let metrics_white_list = match advanced.selected_option.metrics_white_list.clone() {
            Some(v) if !v.is_empty() => split_csv(&v),
            _ => indexed_concat("FILTER_METRICS_WHITE_LIST").map(|s| split_csv(&s)).unwrap_or_default(),
        };
        let metrics_to_his_list = match advanced.selected_option.metrics_to_his_list.clone() {
            Some(v) if !v.is_empty() => split_csv(&v),
            _ => indexed_concat("FILTER_METRICS_TO_HIS_LIST").map(|s| split_csv(&s)).unwrap_or_default(),
        };
        let tag_whitelist = match indexed_concat("FILTER_METRICS_TAG_WHITE_LIST") {
            Some(v) => parse_tag_filter(&v)?,
            None => HashMap::new(),
        };
        let tag_blacklist = match indexed_concat("FILTER_METRICS_TAG_BLACK_LIST") {
            Some(v) => parse_tag_filter(&v)?,
            None => HashMap::new(),
        };
        let tag_include = env_var("FILTER_TAG_INCLUDE").map(|s| split_csv(&s)).unwrap_or_default();
        let tag_exclude = env_var("FILTER_TAG_EXCLUDE").map(|s| split_csv(&s)).unwrap_or_default();

        Ok(Config {
            app_client: AppClientConfig { api_url, credentials, skip_ssl },
            log_stream_url,
            firehose_subscription_id,
            legacy,
            app_cache_expiration,
            app_cache_size,
            enable_app_cache,
            selected_events,
            channel_size,
            workers,
            prefix,
            foundation,
            sender,
            filter: FilterSpec {
                metric_whitelist: metrics_white_list,
                metric_blacklist: metrics_black_list,
                histogram_list: metrics_to_his_list,
                tag_whitelist,
                tag_blacklist,
                tag_include,
                tag_exclude,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_nozzle_env() {
        for (k, _) in env::vars() {
            if k.starts_with("NOZZLE_") || k.starts_with("WAVEFRONT_") || k.starts_with("FILTER_") || k == "ADVANCED_CONFIG" {
                env::remove_var(k);
            }
        }
    }

    #[test]
    fn indexed_variable_concatenation() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_nozzle_env();
        env::set_var("FILTER_METRICS_WHITE_LIST", "A");
        env::set_var("FILTER_METRICS_WHITE_LIST_1", "B");
        env::set_var("FILTER_METRICS_WHITE_LIST_2", "C");
        env::set_var("FILTER_METRICS_WHITE_LIST_4", "unreachable");
        assert_eq!(indexed_concat("FILTER_METRICS_WHITE_LIST").as_deref(), Some("A,B,C"));
        clear_nozzle_env();
    }

    #[test]
    fn tag_filter_rejects_bare_word_without_brackets() {
        assert!(parse_tag_filter("tag:word").is_err());
    }

    #[test]
    fn tag_filter_parses_bracketed_lists() {
        let parsed = parse_tag_filter("tag1:[a,b],tag2:[c]").unwrap();
        assert_eq!(parsed.get("tag1").unwrap(), &vec!["a".to_string(), "b".to_string()]);
        assert_eq!(parsed.get("tag2").unwrap(), &vec!["c".to_string()]);
    }

    #[test]
    fn missing_required_variable_is_a_config_error() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_nozzle_env();
        let result = Config::from_env();
        assert!(matches!(result, Err(NozzleError::Config(_))));
        clear_nozzle_env();
    }

    #[test]
    fn both_credential_pairs_set_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_nozzle_env();
        env::set_var("NOZZLE_API_URL", "https://api.example.com");
        env::set_var("NOZZLE_USERNAME", "u");
        env::set_var("NOZZLE_PASSWORD", "p");
        env::set_var("NOZZLE_CLIENT_ID", "id");
        env::set_var("NOZZLE_CLIENT_SECRET", "secret");
        let result = Config::from_env();
        assert!(matches!(result, Err(NozzleError::Config(_))));
        clear_nozzle_env();
    }

    #[test]
    fn full_direct_sender_config_parses() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_nozzle_env();
        env::set_var("NOZZLE_API_URL", "https://api.example.com");
        env::set_var("NOZZLE_USERNAME", "u");
        env::set_var("NOZZLE_PASSWORD", "p");
        env::set_var("NOZZLE_LOG_STREAM_URL", "https://logs.example.com");
        env::set_var("NOZZLE_FIREHOSE_SUBSCRIPTION_ID", "shard-1");
        env::set_var("WAVEFRONT_PREFIX", "pcf");
        env::set_var("WAVEFRONT_FOUNDATION", "fA");
        env::set_var("WAVEFRONT_URL", "https://wavefront.example.com");
        env::set_var("WAVEFRONT_API_TOKEN", "tok");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.prefix, "pcf");
        assert!(matches!(cfg.sender, SenderConfig::Direct { .. }));
        assert_eq!(cfg.selected_events.len(), 3);
        clear_nozzle_env();
    }
}
