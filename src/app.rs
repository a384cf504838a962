//! Startup/shutdown orchestration: load config, build the catalog and
//! selector, start the tunnel pool, spawn the client-facing listeners and
//! the admin surface, then wait for a shutdown signal.
//!
//! Grounded on the teacher's `app.rs` for the `init_tracing`/
//! `wait_for_shutdown` ambient-stack shape (ctrl-c + SIGTERM select).

use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::acceptor::{plain_http, socks5};
use crate::admin;
use crate::catalog::client::HttpNodeCatalog;
use crate::catalog::{tunnel_url_for, NodeCatalog};
use crate::config::{self, ConfigFile, SelectorType};
use crate::pool::TunnelPool;
use crate::selector::{AutoSelector, FixSelector, Selector, TunInfo, WebSelector};
use crate::state::AppState;
use crate::tunnel::TunnelDialOptions;

pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let directive = if level.eq_ignore_ascii_case("debug") {
            "debug"
        } else {
            "info"
        };
        EnvFilter::new(directive)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

pub async fn run(cli: config::Cli) -> anyhow::Result<()> {
    let cfg = config::load(&cli.config)?;
    init_tracing(&cfg.log.level);

    tracing::info!(config = %cli.config.display(), "starting meshgate");

    let catalog: Arc<dyn NodeCatalog> = Arc::new(HttpNodeCatalog::new(
        cfg.server.url.clone(),
        cfg.server.user_name.clone(),
        cfg.server.password.clone(),
    ));

    let (selector, web_selector): (Arc<dyn Selector>, Option<Arc<WebSelector>>) =
        build_selector(&cfg, Arc::clone(&catalog)).await?;

    let dial_opts = TunnelDialOptions::default();
    let pool = TunnelPool::start(cfg.tun.count, cfg.tun.cap, selector, dial_opts).await?;

    let state = Arc::new(AppState {
        config: cfg.clone(),
        catalog,
        pool: Arc::clone(&pool),
        web_selector,
    });

    let socks5_addr: SocketAddr = cfg.socks5.listen_address.parse()?;
    let http_addr: SocketAddr = cfg.http.listen_address.parse()?;
    let admin_addr: SocketAddr = cfg.local_http_server.listen_address.parse()?;
    let allow_plain_http = cfg.http.allow_plain_http;

    let socks5_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        if let Err(e) = socks5::run(socks5_addr, socks5_pool).await {
            tracing::error!(error = %e, "socks5 acceptor exited");
        }
    });

    let http_pool = Arc::clone(&pool);
    tokio::spawn(async move {
        if let Err(e) = plain_http::run(http_addr, http_pool, allow_plain_http).await {
            tracing::error!(error = %e, "http acceptor exited");
        }
    });

    let admin_state = state.admin_state();
    tokio::spawn(async move {
        if let Err(e) = admin::run(admin_addr, admin_state).await {
            tracing::error!(error = %e, "admin surface exited");
        }
    });

    wait_for_shutdown().await;
    tracing::info!("shutdown signal received, exiting");
    Ok(())
}

async fn build_selector(
    cfg: &ConfigFile,
    catalog: Arc<dyn NodeCatalog>,
) -> anyhow::Result<(Arc<dyn Selector>, Option<Arc<WebSelector>>)> {
    match cfg.selector.selector_type {
        SelectorType::Fix => {
            if cfg.tun.url.is_empty() {
                anyhow::bail!("selector.type = \"fix\" requires tun.url");
            }
            let info = TunInfo {
                node_id: "fixed".to_string(),
                url: cfg.tun.url.clone(),
                relays: Vec::new(),
                auth: cfg.tun.auth_key.clone(),
            };
            Ok((Arc::new(FixSelector::new(vec![info])), None))
        }
        SelectorType::Auto => {
            let sel = Arc::new(AutoSelector::new(
                catalog,
                cfg.selector.area_id.clone(),
                cfg.tun.auth_key.clone(),
                cfg.selector.probe_timeout(),
            ));
            Ok((sel, None))
        }
        SelectorType::Web => {
            let pinned_id = if !cfg.selector.default_node_id.is_empty() {
                cfg.selector.default_node_id.clone()
            } else {
                cfg.node.id.clone()
            };
            let initial = if pinned_id.is_empty() {
                None
            } else {
                let (project, node) = catalog.find_node(&pinned_id).await?;
                Some(TunInfo {
                    node_id: node.id.clone(),
                    url: tunnel_url_for(&project, &node),
                    relays: Vec::new(),
                    auth: cfg.tun.auth_key.clone(),
                })
            };
            let web = Arc::new(WebSelector::new(initial));
            Ok((web.clone() as Arc<dyn Selector>, Some(web)))
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
