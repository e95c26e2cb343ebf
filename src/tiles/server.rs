//! Tile HTTP server.
//!
//! Serves cached tiles and service statistics over a small [`axum`] router
//! bound to localhost. Misses enqueue a background download and answer 404
//! once; callers poll until the tile lands in the cache. A rolling one-minute
//! rate limiter answers 429 when the configured request budget is exhausted.
//! A companion sweep task periodically re-enqueues tiles older than the
//! configured maximum age.

use crate::tiles::cache::TileCache;
use crate::tiles::download::DownloadQueue;
use crate::tiles::{TileId, TileStats};
use anyhow::Result;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

/// Tile server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind on localhost.
    pub port: u16,
    /// Requests allowed per rolling minute.
    pub rate_limit: u64,
    /// Smallest zoom the server answers.
    pub min_zoom: u32,
    /// Largest zoom the server answers.
    pub max_zoom: u32,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            port: 8080,
            // OSM default limit.
            rate_limit: 15000,
            min_zoom: 0,
            max_zoom: 19,
        }
    }
}

/// Rolling one-minute request counter.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    window: Mutex<(Instant, u64)>,
}

impl RateLimiter {
    /// Creates a limiter allowing `limit` requests per minute.
    pub fn new(limit: u64) -> RateLimiter {
        RateLimiter {
            limit,
            window: Mutex::new((Instant::now(), 0)),
        }
    }

    /// Accounts one request. Returns `false` when the budget for the current
    /// minute is exhausted; the counter resets when the window rolls.
    pub fn check(&self) -> bool {
        let mut window = self.window.lock().unwrap();
        if window.0.elapsed() > Duration::from_secs(60) {
            *window = (Instant::now(), 0);
        }
        if window.1 >= self.limit {
            return false;
        }
        window.1 += 1;
        true
    }
}

#[derive(Clone)]
struct ServerState {
    cache: Arc<TileCache>,
    stats: Arc<TileStats>,
    queue: Arc<DownloadQueue>,
    rate: Arc<RateLimiter>,
    min_zoom: u32,
    max_zoom: u32,
}

/// Tile HTTP server.
///
/// Created with [`new`](TileServer::new) and then driven by
/// [`run`](TileServer::run) concurrently with the rest of the application.
#[derive(Debug)]
pub struct TileServer {
    address: SocketAddr,
    router: Router,
}

impl std::fmt::Debug for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerState").finish_non_exhaustive()
    }
}

impl TileServer {
    /// Builds the router over the shared cache, stats and download queue.
    pub fn new(
        config: &ServerConfig,
        cache: Arc<TileCache>,
        stats: Arc<TileStats>,
        queue: Arc<DownloadQueue>,
    ) -> TileServer {
        let state = ServerState {
            cache,
            stats,
            queue,
            rate: Arc::new(RateLimiter::new(config.rate_limit)),
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom,
        };
        let router = Router::new()
            .route("/tile/:z/:x/:y", get(get_tile))
            .route("/stats", get(get_stats))
            .with_state(state)
            .layer(TraceLayer::new_for_http());
        TileServer {
            address: SocketAddr::from(([127, 0, 0, 1], config.port)),
            router,
        }
    }

    /// Runs the server. Only returns on a fatal error such as a failed bind;
    /// the rest of the process keeps running in that case.
    #[tracing::instrument(name = "tile_server", skip_all)]
    pub async fn run(self) -> Result<()> {
        tracing::info!(address = %self.address, "starting tile server");
        let listener = tokio::net::TcpListener::bind(self.address).await?;
        axum::serve(listener, self.router).await?;
        Ok(())
    }
}

async fn get_tile(
    AxumPath((z, x, y)): AxumPath<(u32, u32, u32)>,
    State(state): State<ServerState>,
) -> Response {
    if !state.rate.check() {
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    if z < state.min_zoom || z > state.max_zoom {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Ok(tile) = TileId::new(z, x, y) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match state.cache.read(tile) {
        Ok(Some(bytes)) => {
            state.stats.record_hit();
            ([(header::CONTENT_TYPE, "image/png")], bytes).into_response()
        }
        Ok(None) => {
            // Single-shot miss: enqueue and let the caller poll. The
            // priority path is reserved for the pre-warmer.
            state.queue.enqueue(tile, false);
            StatusCode::NOT_FOUND.into_response()
        }
        Err(error) => {
            tracing::warn!(%tile, %error, "cached tile unreadable");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

async fn get_stats(State(state): State<ServerState>) -> Json<tdoa_json::TileStats> {
    Json(state.stats.snapshot())
}

/// Background cache refresh sweep.
///
/// Every `check_interval` the sweep scans the cache and re-enqueues tiles
/// older than `max_age` without priority.
#[derive(Debug)]
pub struct UpdateSweeper {
    cache: Arc<TileCache>,
    queue: Arc<DownloadQueue>,
    check_interval: Duration,
    max_age: Duration,
    cancel: CancellationToken,
}

impl UpdateSweeper {
    /// Creates a sweeper over the shared cache and queue.
    pub fn new(
        cache: Arc<TileCache>,
        queue: Arc<DownloadQueue>,
        check_interval: Duration,
        max_age: Duration,
        cancel: CancellationToken,
    ) -> UpdateSweeper {
        UpdateSweeper {
            cache,
            queue,
            check_interval,
            max_age,
            cancel,
        }
    }

    /// Runs the sweep loop until cancelled.
    #[tracing::instrument(name = "tile_sweep", skip_all)]
    pub async fn run(self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.check_interval) => {}
            }
            match self.cache.stale_tiles(self.max_age) {
                Ok(stale) => {
                    if !stale.is_empty() {
                        tracing::info!(count = stale.len(), "re-enqueueing stale tiles");
                    }
                    for tile in stale {
                        self.queue.enqueue(tile, false);
                    }
                }
                Err(error) => tracing::warn!(%error, "cache sweep failed"),
            }
        }
    }
}
