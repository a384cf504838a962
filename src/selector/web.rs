//! Single user-pinned node, updated by the admin surface's `POST /change`.
//!
//! Grounded on `original_source/selector/webselector.go`'s `WebSelector`,
//! which returns one entry built as
//! `{node.URL}/project/{node.ID}/{projectInfo.ID}/tun`. Here the admin
//! handler resolves that URL once (it already has the catalog in hand) and
//! hands the finished [`TunInfo`] to [`WebSelector::set_current`]; the
//! selector's only job afterward is to keep re-supplying it to the pool's
//! refresh task.

use arc_swap::ArcSwap;
use async_trait::async_trait;

use super::{Selector, TunInfo};

pub struct WebSelector {
    current: ArcSwap<Option<TunInfo>>,
}

impl WebSelector {
    pub fn new(initial: Option<TunInfo>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn set_current(&self, info: TunInfo) {
        self.current.store(std::sync::Arc::new(Some(info)));
    }

    pub fn current(&self) -> Option<TunInfo> {
        (**self.current.load()).clone()
    }
}

#[async_trait]
impl Selector for WebSelector {
    async fn get_tun_infos(&self, count: usize) -> Vec<TunInfo> {
        if count == 0 {
            return Vec::new();
        }
        match self.current() {
            Some(info) => vec![info],
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> TunInfo {
        TunInfo {
            node_id: id.to_string(),
            url: format!("wss://node/project/{id}/p1/tun"),
            relays: vec![],
            auth: String::new(),
        }
    }

    #[tokio::test]
    async fn empty_until_pinned() {
        let sel = WebSelector::new(None);
        assert!(sel.get_tun_infos(5).await.is_empty());
    }

    #[tokio::test]
    async fn returns_single_pinned_entry() {
        let sel = WebSelector::new(None);
        sel.set_current(info("node-a"));
        let infos = sel.get_tun_infos(5).await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].node_id, "node-a");
    }

    #[tokio::test]
    async fn switching_pin_replaces_entry() {
        let sel = WebSelector::new(Some(info("node-a")));
        sel.set_current(info("node-b"));
        let infos = sel.get_tun_infos(5).await;
        assert_eq!(infos[0].node_id, "node-b");
    }
}
