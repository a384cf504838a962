//! HTTP-backed `NodeCatalog`: login once, list projects/nodes/regions with
//! jittered-exponential-backoff retry on idempotent reads.
//!
//! Grounded on the teacher's `registration/client.rs::AetherClient` —
//! `send_with_retry`/`should_retry_status`/`jitter_delay` are carried over
//! almost verbatim, since catalog reads are exactly the kind of idempotent
//! request that policy was built for.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::time::sleep;
use tracing::debug;

use super::{CatalogError, NodeCatalog, Project, Region};

pub struct HttpNodeCatalog {
    http: Client,
    base_url: String,
    user_name: String,
    password: String,
    retry_max_attempts: u32,
    retry_base_delay: Duration,
    retry_max_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct ProjectDto {
    id: String,
    nodes: Vec<NodeDto>,
}

#[derive(Debug, Deserialize)]
struct NodeDto {
    id: String,
    url: String,
    #[serde(default)]
    area_id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct RegionDto {
    id: String,
    name: String,
}

impl HttpNodeCatalog {
    pub fn new(base_url: String, user_name: String, password: String) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build catalog HTTP client");

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            user_name,
            password,
            retry_max_attempts: 4,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_secs(5),
        }
    }

    async fn login(&self) -> Result<String, CatalogError> {
        #[derive(serde::Serialize)]
        struct LoginRequest<'a> {
            user_name: &'a str,
            password: &'a str,
        }
        #[derive(Deserialize)]
        struct LoginResponse {
            token: String,
        }

        let url = format!("{}/api/login", self.base_url);
        let body = LoginRequest {
            user_name: &self.user_name,
            password: &self.password,
        };
        let resp = self
            .send_with_retry(|| self.http.post(&url).json(&body), "login")
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            return Err(CatalogError::Unauthorized);
        }
        if !resp.status().is_success() {
            return Err(CatalogError::Request(format!(
                "login failed: HTTP {}",
                resp.status()
            )));
        }
        let parsed: LoginResponse = resp
            .json()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;
        Ok(parsed.token)
    }

    async fn send_with_retry<F>(
        &self,
        mut make_req: F,
        label: &str,
    ) -> Result<reqwest::Response, reqwest::Error>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt: u32 = 0;
        let mut delay = self.retry_base_delay;

        loop {
            attempt = attempt.saturating_add(1);
            let resp = make_req().send().await;
            match resp {
                Ok(resp) => {
                    if should_retry_status(resp.status()) && attempt < self.retry_max_attempts {
                        let sleep_for = jitter_delay(delay);
                        debug!(attempt, status = %resp.status(), label, "catalog request retrying");
                        sleep(sleep_for).await;
                        let next_delay = delay.checked_mul(2).unwrap_or(self.retry_max_delay);
                        delay = std::cmp::min(next_delay, self.retry_max_delay);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt < self.retry_max_attempts {
                        let sleep_for = jitter_delay(delay);
                        debug!(attempt, error = %e, label, "catalog request retrying");
                        sleep(sleep_for).await;
                        let next_delay = delay.checked_mul(2).unwrap_or(self.retry_max_delay);
                        delay = std::cmp::min(next_delay, self.retry_max_delay);
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait]
impl NodeCatalog for HttpNodeCatalog {
    async fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
        let token = self.login().await?;
        let url = format!("{}/api/projects", self.base_url);
        let resp = self
            .send_with_retry(
                || self.http.get(&url).bearer_auth(&token),
                "list_projects",
            )
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CatalogError::Request(format!(
                "list_projects failed: HTTP {}",
                resp.status()
            )));
        }
        let projects: Vec<ProjectDto> = resp
            .json()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        Ok(projects
            .into_iter()
            .map(|p| Project {
                id: p.id,
                nodes: p
                    .nodes
                    .into_iter()
                    .map(|n| super::Node {
                        id: n.id,
                        url: n.url,
                        area_id: n.area_id,
                        status: n.status,
                    })
                    .collect(),
            })
            .collect())
    }

    async fn list_regions(&self) -> Result<Vec<Region>, CatalogError> {
        let token = self.login().await?;
        let url = format!("{}/api/regions", self.base_url);
        let resp = self
            .send_with_retry(|| self.http.get(&url).bearer_auth(&token), "list_regions")
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(CatalogError::Request(format!(
                "list_regions failed: HTTP {}",
                resp.status()
            )));
        }
        let regions: Vec<RegionDto> = resp
            .json()
            .await
            .map_err(|e| CatalogError::Request(e.to_string()))?;

        Ok(regions
            .into_iter()
            .map(|r| Region {
                id: r.id,
                name: r.name,
            })
            .collect())
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn jitter_delay(base: Duration) -> Duration {
    if base.is_zero() {
        return base;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    let jitter_ms = nanos % 100;
    base + Duration::from_millis(jitter_ms)
}
