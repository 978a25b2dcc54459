use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::codec::CONTAINER_MIME;
use crate::error::MeshError;
use crate::peer::PeerRegistry;
use crate::persist::PeerAddress;
use crate::resolve::{Lookup, Resolver};
use crate::staging::StagingArea;
use crate::store::{CachePolicy, ObjectStore};
use crate::types::*;

/// Everything a request handler needs. Built fresh for every server start.
pub struct ServerState {
    pub uuid: NodeId,
    pub base_url: String,
    pub store: Arc<ObjectStore>,
    pub registry: PeerRegistry,
    pub resolver: Resolver,
    pub staging: Arc<StagingArea>,
    pub queries: Arc<AtomicU64>,
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/identity", get(identity).post(introduce))
        .route("/resolve", get(resolve))
        .route("/fetch/{filename}", get(fetch))
        .route("/status", get(status))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn reject(e: MeshError) -> StatusCode {
    let code = e.status_code();
    if code.is_server_error() {
        tracing::error!(error = %e, "Request failed");
    } else {
        tracing::debug!(error = %e, "Request rejected");
    }
    code
}

fn not_found(skip: SkipList) -> Response {
    (StatusCode::NOT_FOUND, Json(ResolveResponse::not_found(skip))).into_response()
}

async fn identity(State(state): State<Arc<ServerState>>) -> String {
    state.uuid.to_string()
}

/// Register the caller as one of our peers and answer with our identity.
async fn introduce(
    State(state): State<Arc<ServerState>>,
    Json(caller): Json<PeerAddress>,
) -> Result<String, StatusCode> {
    if caller.host.trim().is_empty() || caller.port == 0 {
        return Err(reject(MeshError::Protocol(format!("bad callback address '{caller}'"))));
    }
    match state.registry.add(&caller.host, caller.port).await {
        Ok(()) => tracing::info!(peer = %caller, "Peer registered itself"),
        Err(MeshError::DuplicatePeer { .. }) => {}
        Err(e) => return Err(reject(e)),
    }
    Ok(state.uuid.to_string())
}

/// Answer a location query: serve from the local store, or relay to our own
/// peers with ourselves added to the skip list.
async fn resolve(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ResolveQuery>,
) -> Result<Response, StatusCode> {
    state.queries.fetch_add(1, Ordering::Relaxed);

    let raw_id = query
        .id
        .ok_or_else(|| reject(MeshError::Protocol("missing id".into())))?;
    let id: Identifier = raw_id.parse().map_err(reject)?;
    let mut skip = match query.skip.as_deref() {
        Some(raw) => SkipList::from_query_param(raw).map_err(reject)?,
        None => SkipList::default(),
    };

    if skip.contains(&state.uuid) {
        tracing::debug!(id = %id, "Already consulted in this chain");
        return Ok(not_found(skip));
    }

    if let Some(object) = state
        .store
        .resolve_local(&id, CachePolicy::Promote)
        .await
        .map_err(reject)?
    {
        let name = state
            .staging
            .stage(state.store.codec().as_ref(), &object)
            .await
            .map_err(reject)?;
        skip.insert(state.uuid);
        let url = format!("{}/fetch/{name}", state.base_url);
        tracing::info!(id = %id, file = %name, "📦 Staged object for peer");
        return Ok(Json(ResolveResponse::found(url, skip)).into_response());
    }

    match state.resolver.locate(&id, skip).await {
        Lookup::Found { url, skip } => Ok(Json(ResolveResponse::found(url, skip)).into_response()),
        Lookup::NotFound { skip } => Ok(not_found(skip)),
    }
}

async fn fetch(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
) -> Result<Response, StatusCode> {
    let bytes = state.staging.consume(&filename).await.map_err(reject)?;
    Ok(([(header::CONTENT_TYPE, CONTAINER_MIME)], bytes).into_response())
}

async fn status(State(state): State<Arc<ServerState>>) -> Json<NodeStatus> {
    Json(NodeStatus {
        uuid: state.uuid,
        base_url: Some(state.base_url.clone()),
        objects: state.store.len().await,
        resolve_queries: state.queries.load(Ordering::Relaxed),
        peers: state.registry.list().await,
    })
}
