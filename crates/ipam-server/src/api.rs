//! HTTP surface of a hosted allocator.
//!
//! Addresses are returned as plain-text CIDRs. A client that disconnects
//! while its request is pending drops the reply channel, which cancels the
//! underlying allocator operation.

use crate::error::ServerError;
use crate::metrics::Metrics;
use crate::transport::PEER_HEADER;
use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use ipam::address::parse_address;
use ipam::{AllocatorHandle, AllocatorStatus, Cidr, PeerName};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state of the HTTP handlers.
pub struct AppState {
    pub handle: AllocatorHandle,
    pub universe: Cidr,
    pub default_subnet: Cidr,
    pub metrics: Metrics,
}

#[derive(Debug, Default, Deserialize)]
struct AllocateParams {
    #[serde(rename = "check-alive", default)]
    check_alive: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ClaimParams {
    #[serde(rename = "noErrorOnUnknown", default)]
    no_error_on_unknown: bool,
    #[serde(rename = "check-alive", default)]
    check_alive: bool,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ip/{id}", post(allocate_default).get(lookup_default).delete(delete_all))
        .route("/ip/{id}/{ip}/{plen}", post(allocate_in).put(claim).get(lookup_in))
        .route("/ip/{id}/{ip}", delete(free_one))
        .route("/ipinfo/defaultsubnet", get(default_subnet))
        .route("/ring", get(ring))
        .route("/peer/{name}", delete(takeover))
        .route("/gossip/broadcast", post(gossip_broadcast))
        .route("/gossip/unicast", post(gossip_unicast))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn same_family(state: &AppState, cidr: Cidr) -> Result<Cidr, ServerError> {
    if cidr.family != state.universe.family {
        return Err(ServerError::BadRequest(format!(
            "{cidr} is not in the address family of {}",
            state.universe
        )));
    }
    Ok(cidr)
}

/// An address with its prefix, as given to a claim.
fn path_cidr(state: &AppState, ip: &str, plen: &str) -> Result<Cidr, ServerError> {
    same_family(state, format!("{ip}/{plen}").parse()?)
}

/// A subnet to allocate or look up in; host bits must be clear.
fn path_subnet(state: &AppState, ip: &str, plen: &str) -> Result<Cidr, ServerError> {
    same_family(state, Cidr::parse_subnet(&format!("{ip}/{plen}"))?)
}

async fn allocate(state: &AppState, id: &str, subnet: Cidr, is_container: bool) -> Result<String, ServerError> {
    let result = state.handle.allocate(id, subnet, is_container).await;
    state.metrics.observe("allocate", &result);
    Ok(subnet.with_addr(result?).to_string())
}

async fn allocate_default(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<AllocateParams>,
) -> Result<String, ServerError> {
    allocate(&state, &id, state.default_subnet, params.check_alive).await
}

async fn allocate_in(
    State(state): State<Arc<AppState>>,
    Path((id, ip, plen)): Path<(String, String, String)>,
    Query(params): Query<AllocateParams>,
) -> Result<String, ServerError> {
    let subnet = path_subnet(&state, &ip, &plen)?;
    allocate(&state, &id, subnet, params.check_alive).await
}

async fn claim(
    State(state): State<Arc<AppState>>,
    Path((id, ip, plen)): Path<(String, String, String)>,
    Query(params): Query<ClaimParams>,
) -> Result<StatusCode, ServerError> {
    let cidr = path_cidr(&state, &ip, &plen)?;
    let result = state
        .handle
        .claim(&id, cidr, params.check_alive, params.no_error_on_unknown)
        .await;
    state.metrics.observe("claim", &result);
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn lookup(state: &AppState, id: &str, subnet: Cidr) -> Result<String, ServerError> {
    let found = state.handle.lookup(id, subnet.range()).await?;
    match found.first() {
        Some(cidr) => Ok(cidr.to_string()),
        None => Err(ServerError::Allocator(ipam::AllocatorError::NotFound(format!(
            "no address for {id} in {subnet}"
        )))),
    }
}

async fn lookup_default(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<String, ServerError> {
    lookup(&state, &id, state.default_subnet).await
}

async fn lookup_in(
    State(state): State<Arc<AppState>>,
    Path((id, ip, plen)): Path<(String, String, String)>,
) -> Result<String, ServerError> {
    let subnet = path_subnet(&state, &ip, &plen)?;
    lookup(&state, &id, subnet).await
}

async fn delete_all(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<StatusCode, ServerError> {
    let result = state.handle.delete(&id).await;
    state.metrics.observe("delete", &result);
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn free_one(
    State(state): State<Arc<AppState>>,
    Path((id, ip)): Path<(String, String)>,
) -> Result<StatusCode, ServerError> {
    let addr = parse_address(&ip, state.universe.family)?;
    let result = state.handle.free(&id, addr).await;
    state.metrics.observe("free", &result);
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn default_subnet(State(state): State<Arc<AppState>>) -> String {
    state.default_subnet.to_string()
}

async fn ring(State(state): State<Arc<AppState>>) -> Result<Json<AllocatorStatus>, ServerError> {
    let status = state.handle.status().await?;
    state.metrics.update(&status);
    Ok(Json(status))
}

async fn takeover(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Result<String, ServerError> {
    let gained = state.handle.admin_takeover(&name).await?;
    info!("Admin takeover of {} gained {} addresses", name, gained);
    Ok(gained.to_string())
}

fn sender(headers: &HeaderMap) -> Result<PeerName, ServerError> {
    headers
        .get(PEER_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(PeerName::from)
        .ok_or_else(|| ServerError::BadRequest(format!("missing {PEER_HEADER} header")))
}

async fn gossip_broadcast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let from = sender(&headers)?;
    state.handle.on_gossip_broadcast(from, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn gossip_unicast(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ServerError> {
    let from = sender(&headers)?;
    state.handle.on_gossip_unicast(from, body.to_vec()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn metrics(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ServerError> {
    let status = state.handle.status().await?;
    state.metrics.update(&status);
    let body = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body))
}
