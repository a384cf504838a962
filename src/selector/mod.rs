//! Candidate-endpoint selection (§4.5).
//!
//! Three variants share one trait: a static list, a single user-pinned node,
//! and an area-filtered, connectivity-probed catalog scan. Grounded on
//! `original_source/selector/selector.go`'s `TunSelector` interface.

pub mod auto;
pub mod fixed;
pub mod web;

use async_trait::async_trait;

pub use auto::AutoSelector;
pub use fixed::FixSelector;
pub use web::WebSelector;

/// An endpoint descriptor the pool can dial. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunInfo {
    pub node_id: String,
    pub url: String,
    pub relays: Vec<String>,
    pub auth: String,
}

#[async_trait]
pub trait Selector: Send + Sync {
    /// Return up to `count` candidate endpoints. May return fewer.
    async fn get_tun_infos(&self, count: usize) -> Vec<TunInfo>;
}
