// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The narrow "app lookup" capability injected into the cache, and its HTTP
//! implementation against the platform's management API.
//!
//! Defining this as a trait rather than handing the cache the full API
//! client breaks the cyclic reference described in the design notes: the
//! client owns credentials and a token cache, the cache owns a `dyn
//! AppLookup`, and neither needs to know the other's concrete type.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::cache::AppInfo;
use crate::error::NozzleError;

/// Credentials accepted by the management API: exactly one of these two
/// pairs must be configured (see §6).
#[derive(Debug, Clone)]
pub enum Credentials {
    UserPass { username: String, password: String },
    ClientCredentials { client_id: String, client_secret: String },
}

#[derive(Debug, Clone)]
pub struct AppClientConfig {
    pub api_url: String,
    pub credentials: Credentials,
    pub skip_ssl: bool,
}

/// The lookup capability the cache depends on. `HttpAppLookup` is the
/// production implementation; tests provide an in-memory fake.
#[async_trait]
pub trait AppLookup: Send + Sync {
    async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>>;
    async fn lookup_one(&self, guid: &str) -> anyhow::Result<AppInfo>;
}

/// The capability the stream controller (C6) depends on to authenticate its
/// upstream connection. `HttpAppLookup` backs both this and [`AppLookup`]
/// from the same cached token, since both talk to the same management API.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn fetch_token(&self) -> anyhow::Result<String>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    600
}

#[derive(Deserialize)]
struct AppResource {
    metadata: AppMetadata,
    entity: AppEntity,
}

#[derive(Deserialize)]
struct AppMetadata {
    guid: String,
}

#[derive(Deserialize)]
struct AppEntity {
    name: String,
    space_guid: String,
}

#[derive(Deserialize)]
struct AppListResponse {
    resources: Vec<AppResource>,
    next_url: Option<String>,
}

#[derive(Deserialize)]
struct SpaceResource {
    entity: SpaceEntity,
}

#[derive(Deserialize)]
struct SpaceEntity {
    name: String,
    organization_guid: String,
}

#[derive(Deserialize)]
struct OrgResource {
    entity: OrgEntity,
}

#[derive(Deserialize)]
struct OrgEntity {
    name: String,
}

struct CachedToken {
    token: String,
    fetched_at: Instant,
    ttl: Duration,
}

/// Management-API backed implementation of [`AppLookup`], grounded on the
/// platform's v2 apps/spaces/organizations endpoints.
pub struct HttpAppLookup {
    client: reqwest::Client,
    api_url: String,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl HttpAppLookup {
    pub fn new(config: AppClientConfig) -> Result<Arc<Self>, NozzleError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_ssl)
            .build()
            .map_err(|e| NozzleError::Config(format!("failed to build http client: {e}")))?;
        Ok(Arc::new(Self {
            client,
            api_url: config.api_url,
            credentials: config.credentials,
            token: Mutex::new(None),
        }))
    }

    async fn auth_token(&self) -> anyhow::Result<String> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fetched_at.elapsed() < cached.ttl {
                return Ok(cached.token.clone());
            }
        }

        let params: Vec<(&str, &str)> = match &self.credentials {
            Credentials::UserPass { username, password } => vec![
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
            Credentials::ClientCredentials { client_id, client_secret } => vec![
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ],
        };

        let resp = self
            .client
            .post(format!("{}/oauth/token", self.api_url))
            .form(&params)
            .send()
            .await?
            .error_for_status()?
            .json::<TokenResponse>()
            .await?;

        let cached = CachedToken {
            token: resp.access_token.clone(),
            fetched_at: Instant::now(),
            ttl: Duration::from_secs(resp.expires_in.saturating_sub(30).max(1)),
        };
        *guard = Some(cached);
        Ok(resp.access_token)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str) -> anyhow::Result<T> {
        let token = self.auth_token().await?;
        let resp = self
            .client
            .get(format!("{}{}", self.api_url, path))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json::<T>()
            .await?;
        Ok(resp)
    }

    async fn resolve_space_org(&self, space_guid: &str) -> (String, String) {
        let space: Result<SpaceResource, _> = self
            .get_json(&format!("/v2/spaces/{space_guid}"))
            .await;
        let Ok(space) = space else {
            return ("not_found".to_string(), "not_found".to_string());
        };
        let org: Result<OrgResource, _> = self
            .get_json(&format!("/v2/organizations/{}", space.entity.organization_guid))
            .await;
        let org_name = org.map(|o| o.entity.name).unwrap_or_else(|_| "not_found".to_string());
        (space.entity.name, org_name)
    }
}

#[async_trait]
impl AuthTokenProvider for HttpAppLookup {
    async fn fetch_token(&self) -> anyhow::Result<String> {
        self.auth_token().await
    }
}

#[async_trait]
impl AppLookup for HttpAppLookup {
    async fn list_all(&self) -> anyhow::Result<Vec<AppInfo>> {
        let mut apps = Vec::new();
        let mut next: Option<String> = Some("/v2/apps".to_string());
        while let Some(path) = next {
            let page: AppListResponse = self.get_json(&path).await?;
            for resource in page.resources {
                let (space, org) = self.resolve_space_org(&resource.entity.space_guid).await;
                apps.push(AppInfo {
                    guid: resource.metadata.guid,
                    name: resource.entity.name,
                    space,
                    org,
                });
            }
            next = page.next_url;
        }
        Ok(apps)
    }

    async fn lookup_one(&self, guid: &str) -> anyhow::Result<AppInfo> {
        let resource: AppResource = self.get_json(&format!("/v2/apps/{guid}")).await?;
        let (space, org) = self.resolve_space_org(&resource.entity.space_guid).await;
        Ok(AppInfo {
            guid: resource.metadata.guid,
            name: resource.entity.name,
            space,
            org,
        })
    }
}
