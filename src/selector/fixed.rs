//! A static, pre-supplied candidate list.
//!
//! Grounded on `original_source/selector/fixselector.go`'s `FixSelector`.

use async_trait::async_trait;

use super::{Selector, TunInfo};

pub struct FixSelector {
    infos: Vec<TunInfo>,
}

impl FixSelector {
    pub fn new(infos: Vec<TunInfo>) -> Self {
        Self { infos }
    }
}

#[async_trait]
impl Selector for FixSelector {
    async fn get_tun_infos(&self, count: usize) -> Vec<TunInfo> {
        self.infos.iter().take(count).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str) -> TunInfo {
        TunInfo {
            node_id: id.to_string(),
            url: format!("wss://{id}/tun"),
            relays: vec![],
            auth: String::new(),
        }
    }

    #[tokio::test]
    async fn returns_at_most_count() {
        let sel = FixSelector::new(vec![info("a"), info("b"), info("c")]);
        assert_eq!(sel.get_tun_infos(2).await.len(), 2);
        assert_eq!(sel.get_tun_infos(10).await.len(), 3);
    }
}
