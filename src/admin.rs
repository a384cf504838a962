//! Admin surface (C7, spec.md §4.7): a small operator-facing HTTP API —
//! `GET /query`, `GET /ls`, `POST /change?id=...` — served with hyper as an
//! ordinary request/response service (no hijacking, unlike
//! [`crate::acceptor`]).
//!
//! Grounded on the teacher's admin endpoints in `proxy/server.rs` for the
//! hyper `server::conn::http1` + `service_fn` wiring.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::catalog::{tunnel_url_for, NodeCatalog};
use crate::pool::TunnelPool;
use crate::selector::{TunInfo, WebSelector};

pub struct AdminState {
    pub catalog: Arc<dyn NodeCatalog>,
    pub pool: Arc<TunnelPool>,
    /// `Some` only when `selector.type = "web"` (spec.md §4.5): `/change`
    /// needs somewhere to park the operator's pin so the pool's refresh
    /// task keeps re-supplying it.
    pub web_selector: Option<Arc<WebSelector>>,
    pub auth_key: String,
}

#[derive(Serialize)]
struct QueryResponse {
    #[serde(rename = "NodeID")]
    node_id: String,
    #[serde(rename = "WsURL")]
    ws_url: String,
    status: String,
    #[serde(rename = "GeoID")]
    geo_id: String,
    #[serde(rename = "IP")]
    ip: String,
}

#[derive(Serialize)]
struct NodeDescriptor {
    id: String,
    url: String,
    area_id: String,
    status: String,
    project_id: String,
}

/// `area -> country -> nodes`, following `original_source/web/handler.go`'s
/// `Areas`/`Countrys` grouping of an `area_id` like `Asia-China-Guangdong`.
type AreaListing = std::collections::BTreeMap<String, std::collections::BTreeMap<String, Vec<NodeDescriptor>>>;

fn area_from_area_id(area_id: &str) -> &str {
    area_id.split('-').next().unwrap_or("")
}

fn country_from_area_id(area_id: &str) -> &str {
    area_id.split('-').nth(1).unwrap_or("")
}

pub async fn run(listen_addr: SocketAddr, state: Arc<AdminState>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "admin surface listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "admin accept error");
                continue;
            }
        };
        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = hyper::service::service_fn(move |req| {
                let state = Arc::clone(&state);
                async move { Ok::<_, Infallible>(route(req, state).await) }
            });
            if let Err(e) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                warn!(%peer, error = %e, "admin connection error");
            }
        });
    }
}

async fn route(req: Request<Incoming>, state: Arc<AdminState>) -> Response<Full<Bytes>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/query") => handle_query(&state).await,
        (&Method::GET, "/ls") => handle_ls(&state).await,
        (&Method::POST, "/change") => handle_change(req, &state).await,
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn handle_query(state: &AdminState) -> Response<Full<Bytes>> {
    let current = match &state.web_selector {
        Some(sel) => sel.current(),
        None => None,
    };
    let Some(info) = current else {
        return text_response(StatusCode::BAD_REQUEST, "no node exist");
    };

    let (_, node) = match state.catalog.find_node(&info.node_id).await {
        Ok(v) => v,
        Err(_) => return text_response(StatusCode::BAD_REQUEST, "no node exist"),
    };

    let body = QueryResponse {
        node_id: node.id,
        ws_url: info.url,
        status: node.status,
        geo_id: node.area_id,
        ip: node
            .url
            .strip_prefix("wss://")
            .or_else(|| node.url.strip_prefix("ws://"))
            .unwrap_or(&node.url)
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    json_response(StatusCode::OK, &body)
}

async fn handle_ls(state: &AdminState) -> Response<Full<Bytes>> {
    let projects = match state.catalog.list_projects().await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "admin /ls: catalog lookup failed");
            return text_response(StatusCode::BAD_GATEWAY, "catalog unavailable");
        }
    };

    let mut areas: AreaListing = std::collections::BTreeMap::new();
    for project in &projects {
        for node in &project.nodes {
            let area = area_from_area_id(&node.area_id);
            let country = country_from_area_id(&node.area_id);
            if area.is_empty() || country.is_empty() {
                debug_skip_node(&node.id, &node.area_id);
                continue;
            }
            areas
                .entry(area.to_string())
                .or_default()
                .entry(country.to_string())
                .or_default()
                .push(NodeDescriptor {
                    id: node.id.clone(),
                    url: node.url.clone(),
                    area_id: node.area_id.clone(),
                    status: node.status.clone(),
                    project_id: project.id.clone(),
                });
        }
    }
    json_response(StatusCode::OK, &areas)
}

fn debug_skip_node(node_id: &str, area_id: &str) {
    tracing::debug!(node_id, area_id, "admin /ls: node has no area/country, skipping");
}

async fn handle_change(req: Request<Incoming>, state: &AdminState) -> Response<Full<Bytes>> {
    let Some(node_id) = query_param(req.uri().query().unwrap_or(""), "id") else {
        return text_response(StatusCode::BAD_REQUEST, "missing id parameter");
    };

    let Some(web_selector) = &state.web_selector else {
        return text_response(
            StatusCode::BAD_REQUEST,
            "node switching requires selector.type = \"web\"",
        );
    };

    let (project, node) = match state.catalog.find_node(&node_id).await {
        Ok(v) => v,
        Err(e) => {
            warn!(node_id = %node_id, error = %e, "admin /change: node not found");
            return text_response(StatusCode::BAD_REQUEST, "no node exist");
        }
    };

    let tun_info = TunInfo {
        node_id: node.id.clone(),
        url: tunnel_url_for(&project, &node),
        relays: Vec::new(),
        auth: state.auth_key.clone(),
    };

    if let Err(e) = state.pool.reset(tun_info.clone()).await {
        warn!(node_id = %node_id, error = %e, "admin /change: pool reset failed");
        return text_response(StatusCode::BAD_GATEWAY, "failed to switch node");
    }

    web_selector.set_current(tun_info);
    info!(node_id = %node_id, "admin /change: switched active node");
    text_response(StatusCode::OK, "")
}

fn query_param(query: &str, name: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        if k == name {
            Some(url_decode(v))
        } else {
            None
        }
    })
}

fn url_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '%' => {
                let hex: String = chars.by_ref().take(2).collect();
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                }
            }
            '+' => out.push(' '),
            _ => out.push(c),
        }
    }
    out
}

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response head is always valid")
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(bytes)))
            .expect("static response head is always valid"),
        Err(e) => {
            warn!(error = %e, "admin: failed to serialize response body");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "serialization error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_param_extracts_value() {
        assert_eq!(query_param("id=abc&x=1", "id"), Some("abc".to_string()));
        assert_eq!(query_param("x=1", "id"), None);
    }

    #[test]
    fn url_decode_handles_percent_and_plus() {
        assert_eq!(url_decode("node%20one"), "node one");
        assert_eq!(url_decode("a+b"), "a b");
        assert_eq!(url_decode("plain"), "plain");
    }
}
