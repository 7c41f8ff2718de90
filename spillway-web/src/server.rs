//! HTTP server assembly and lifecycle.

use std::future::IntoFuture;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use spillway_core::access::AccessResolver;
use spillway_core::cache::LocationCache;
use spillway_core::config::GatewayConfig;
use spillway_core::pool::WorkerPool;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::handlers::stream_message;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Gateway configuration.
    pub config: Arc<GatewayConfig>,
    /// Round-robin pool of upstream workers.
    pub pool: Arc<WorkerPool>,
    /// Channel access-handle resolver.
    pub resolver: Arc<AccessResolver>,
    /// TTL cache of resolved file locations.
    pub cache: Arc<LocationCache>,
}

impl AppState {
    /// Wires the resolver and cache around a connected pool.
    pub fn new(config: GatewayConfig, pool: Arc<WorkerPool>) -> Self {
        let resolver = Arc::new(AccessResolver::load(&config.cache.access_cache_path));
        let cache = Arc::new(LocationCache::new(
            config.cache.location_ttl,
            config.cache.location_capacity,
        ));
        Self {
            config: Arc::new(config),
            pool,
            resolver,
            cache,
        }
    }
}

/// Builds the gateway router around shared state.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/stream", get(stream_message))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Resolves channel access for every worker in the background, so the
/// first requests skip the slow path.
fn spawn_access_bootstrap(state: &AppState) {
    let channel_id = state.config.upstream.channel_id;
    for worker in state.pool.all() {
        let worker = Arc::clone(worker);
        let resolver = Arc::clone(&state.resolver);
        tokio::spawn(async move {
            match resolver.ensure(&worker, channel_id).await {
                Ok(handle) => info!(
                    worker = worker.id(),
                    channel = channel_id,
                    handle,
                    "channel access bootstrapped"
                ),
                Err(err) => warn!(
                    worker = worker.id(),
                    channel = channel_id,
                    %err,
                    "channel access bootstrap failed"
                ),
            }
        });
    }
}

/// Runs the HTTP server until `shutdown` fires, then drains in-flight
/// requests within the configured grace period and persists the access
/// map one final time.
///
/// # Errors
///
/// Returns an error when the listen address cannot be bound.
pub async fn run_server(state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    spawn_access_bootstrap(&state);

    let bind_addr = state.config.http.bind_addr.clone();
    let grace = state.config.http.shutdown_grace;
    let resolver = Arc::clone(&state.resolver);
    let app = build_router(state);

    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server ready");

    let drain = shutdown.clone();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            drain.cancelled().await;
            info!("shutdown initiated, draining connections");
        })
        .into_future();
    tokio::pin!(server);

    let result = tokio::select! {
        result = &mut server => result,
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(grace_secs = grace.as_secs(), "drain grace period elapsed, aborting open connections");
            Ok(())
        }
    };

    resolver.persist().await;
    info!("shutdown complete");
    result
}
