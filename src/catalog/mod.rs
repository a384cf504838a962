//! `NodeCatalog` — the management-API client, out of scope per spec §1
//! beyond the shape it presents to the core. Grounded on the teacher's
//! `registration/client.rs` (`AetherClient`) for the retry-with-backoff HTTP
//! client pattern, and on `original_source`'s `web/handler.go` /
//! `selector/autoselector.go` for what a `Project`/`Node` needs to carry.

pub mod client;

use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub url: String,
    pub area_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub id: String,
    pub nodes: Vec<Node>,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Request(String),
    #[error("authentication failed")]
    Unauthorized,
    #[error("node {0} not found in any project")]
    NodeNotFound(String),
}

#[async_trait]
pub trait NodeCatalog: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<Project>, CatalogError>;
    async fn list_regions(&self) -> Result<Vec<Region>, CatalogError>;

    /// Convenience lookup used by the admin surface's `POST /change` and by
    /// `WebSelector`'s URL construction. Default impl scans `list_projects`.
    async fn find_node(&self, node_id: &str) -> Result<(Project, Node), CatalogError> {
        for project in self.list_projects().await? {
            if let Some(node) = project.nodes.iter().find(|n| n.id == node_id) {
                let node = node.clone();
                return Ok((project, node));
            }
        }
        Err(CatalogError::NodeNotFound(node_id.to_string()))
    }
}

/// Builds the `{node.url}/project/{node.id}/{project.id}/tun` tunnel
/// endpoint, per `original_source/selector/webselector.go`.
pub fn tunnel_url_for(project: &Project, node: &Node) -> String {
    let base = node.url.trim_end_matches('/');
    format!("{}/project/{}/{}/tun", base, node.id, project.id)
}
