//! Shared application state wiring the catalog, selector, pool and admin
//! surface together, handed to each listener task at startup.

use std::sync::Arc;

use crate::admin::AdminState;
use crate::catalog::NodeCatalog;
use crate::config::ConfigFile;
use crate::pool::TunnelPool;
use crate::selector::WebSelector;

pub struct AppState {
    pub config: ConfigFile,
    pub catalog: Arc<dyn NodeCatalog>,
    pub pool: Arc<TunnelPool>,
    /// Present only when `selector.type = "web"` (including the legacy
    /// `node.id` pin, which boots a `WebSelector` under the hood).
    pub web_selector: Option<Arc<WebSelector>>,
}

impl AppState {
    pub fn admin_state(&self) -> Arc<AdminState> {
        Arc::new(AdminState {
            catalog: Arc::clone(&self.catalog),
            pool: Arc::clone(&self.pool),
            web_selector: self.web_selector.clone(),
            auth_key: self.config.tun.auth_key.clone(),
        })
    }
}
