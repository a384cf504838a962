//! Area-filtered selector with pre-flight connectivity probing.
//!
//! Grounded on `original_source/selector/autoselector.go`: nodes are
//! filtered by a case-insensitive substring match against `area_id`, then
//! probed in batches of `count` — each candidate gets a real WebSocket
//! dial with a `User-Timestamp` header and the node's `Relay` headers, and
//! only survivors are returned. Batches continue until `count` usable
//! candidates accumulate or the catalog is exhausted.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http;
use tracing::{debug, warn};

use crate::catalog::{tunnel_url_for, NodeCatalog};

use super::{Selector, TunInfo};

pub struct AutoSelector {
    catalog: Arc<dyn NodeCatalog>,
    area_id: String,
    auth: String,
    probe_timeout: Duration,
}

impl AutoSelector {
    pub fn new(
        catalog: Arc<dyn NodeCatalog>,
        area_id: String,
        auth: String,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            area_id,
            auth,
            probe_timeout,
        }
    }

    async fn candidate_pool(&self) -> Vec<TunInfo> {
        let projects = match self.catalog.list_projects().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "AutoSelector: failed to list projects");
                return Vec::new();
            }
        };

        let area_needle = self.area_id.to_lowercase();
        let mut candidates = Vec::new();
        for project in &projects {
            for node in &project.nodes {
                if !node.area_id.to_lowercase().contains(&area_needle) {
                    continue;
                }
                candidates.push(TunInfo {
                    node_id: node.id.clone(),
                    url: tunnel_url_for(project, node),
                    relays: Vec::new(),
                    auth: self.auth.clone(),
                });
            }
        }
        candidates
    }
}

#[async_trait]
impl Selector for AutoSelector {
    async fn get_tun_infos(&self, count: usize) -> Vec<TunInfo> {
        if count == 0 {
            return Vec::new();
        }
        let candidates = self.candidate_pool().await;
        let mut accepted = Vec::new();

        for batch in candidates.chunks(count.max(1)) {
            if accepted.len() >= count {
                break;
            }
            let probes = batch
                .iter()
                .map(|info| probe(info.clone(), self.probe_timeout));
            let results = futures_util::future::join_all(probes).await;
            for (info, ok) in batch.iter().zip(results) {
                if ok {
                    accepted.push(info.clone());
                    if accepted.len() >= count {
                        break;
                    }
                }
            }
        }
        accepted
    }
}

/// Dial `info.url` with a `User-Timestamp` header and the node's `Relay`
/// headers; return true iff the WebSocket handshake succeeds within
/// `timeout`.
async fn probe(info: TunInfo, timeout: Duration) -> bool {
    let Ok(mut request) = info.url.clone().into_client_request() else {
        return false;
    };
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let headers = request.headers_mut();
    if let Ok(v) = http::HeaderValue::from_str(&now.to_string()) {
        headers.insert("User-Timestamp", v);
    }
    for relay in &info.relays {
        if let Ok(v) = http::HeaderValue::from_str(relay) {
            headers.append("Relay", v);
        }
    }

    let dial = tokio_tungstenite::connect_async(request);
    match tokio::time::timeout(timeout, dial).await {
        Ok(Ok((mut ws, _))) => {
            use futures_util::SinkExt;
            let _ = ws.close(None).await;
            debug!(node_id = %info.node_id, "AutoSelector probe ok");
            true
        }
        Ok(Err(e)) => {
            debug!(node_id = %info.node_id, error = %e, "AutoSelector probe failed");
            false
        }
        Err(_) => {
            debug!(node_id = %info.node_id, "AutoSelector probe timed out");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, Node, Project, Region};

    struct FakeCatalog {
        projects: Vec<Project>,
    }

    #[async_trait]
    impl NodeCatalog for FakeCatalog {
        async fn list_projects(&self) -> Result<Vec<Project>, CatalogError> {
            Ok(self.projects.clone())
        }
        async fn list_regions(&self) -> Result<Vec<Region>, CatalogError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn area_filter_is_case_insensitive_substring() {
        let catalog = Arc::new(FakeCatalog {
            projects: vec![Project {
                id: "p1".into(),
                nodes: vec![
                    Node {
                        id: "n1".into(),
                        url: "wss://host1".into(),
                        area_id: "US-West".into(),
                        status: "up".into(),
                    },
                    Node {
                        id: "n2".into(),
                        url: "wss://host2".into(),
                        area_id: "eu-central".into(),
                        status: "up".into(),
                    },
                ],
            }],
        });
        let sel = AutoSelector::new(
            catalog,
            "us".into(),
            "token".into(),
            Duration::from_secs(1),
        );
        let candidates = sel.candidate_pool().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "n1");
    }

    #[tokio::test]
    async fn no_candidates_returns_empty() {
        let catalog = Arc::new(FakeCatalog { projects: vec![] });
        let sel = AutoSelector::new(
            catalog,
            "us".into(),
            String::new(),
            Duration::from_millis(50),
        );
        assert!(sel.get_tun_infos(3).await.is_empty());
    }
}
