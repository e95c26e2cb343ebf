//! Background tile downloader.
//!
//! A bounded pool of workers drains an unbounded two-class FIFO: requests
//! with the priority bit set are serviced before normal requests regardless
//! of arrival order, and arrival order is kept within each class. Workers
//! fetch from the OSM-style origin, write through the cache, and resolve the
//! per-request completion with the fresh bytes; a transport failure resolves
//! the completion with an empty payload after a short pause.

use crate::tiles::cache::TileCache;
use crate::tiles::{lat_to_y, lon_to_x, TileId, TileStats};
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Default number of download workers.
pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 4;

/// One queued download.
#[derive(Debug)]
pub struct DownloadRequest {
    /// The tile to fetch.
    pub tile: TileId,
    /// Priority requests are serviced before normal ones.
    pub priority: bool,
    /// When the request entered the queue.
    pub enqueued_at: Instant,
    completion: Option<oneshot::Sender<Bytes>>,
}

#[derive(Debug, Default)]
struct Queues {
    priority: VecDeque<DownloadRequest>,
    normal: VecDeque<DownloadRequest>,
}

/// Unbounded download queue with a priority class.
#[derive(Debug, Default)]
pub struct DownloadQueue {
    queues: Mutex<Queues>,
    notify: Notify,
}

impl DownloadQueue {
    /// Creates an empty queue.
    pub fn new() -> DownloadQueue {
        DownloadQueue::default()
    }

    /// Enqueues a fire-and-forget request.
    pub fn enqueue(&self, tile: TileId, priority: bool) {
        self.push(DownloadRequest {
            tile,
            priority,
            enqueued_at: Instant::now(),
            completion: None,
        });
    }

    /// Enqueues a request and returns a receiver for the completion payload.
    /// An empty payload signals a failed download.
    pub fn enqueue_waiting(&self, tile: TileId, priority: bool) -> oneshot::Receiver<Bytes> {
        let (sender, receiver) = oneshot::channel();
        self.push(DownloadRequest {
            tile,
            priority,
            enqueued_at: Instant::now(),
            completion: Some(sender),
        });
        receiver
    }

    fn push(&self, request: DownloadRequest) {
        {
            let mut queues = self.queues.lock().unwrap();
            if request.priority {
                queues.priority.push_back(request);
            } else {
                queues.normal.push_back(request);
            }
        }
        self.notify.notify_one();
    }

    /// Queued requests across both classes.
    pub fn len(&self) -> usize {
        let queues = self.queues.lock().unwrap();
        queues.priority.len() + queues.normal.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dequeues the next request, priority class first. Returns `None` once
    /// `cancel` fires, which is how workers shut down.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<DownloadRequest> {
        loop {
            {
                let mut queues = self.queues.lock().unwrap();
                let request = queues
                    .priority
                    .pop_front()
                    .or_else(|| queues.normal.pop_front());
                if let Some(request) = request {
                    if !queues.priority.is_empty() || !queues.normal.is_empty() {
                        // Wake a sibling worker for the remaining work.
                        self.notify.notify_one();
                    }
                    return Some(request);
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = self.notify.notified() => {}
            }
        }
    }
}

/// Tiles covering a geographic box across a zoom range, per zoom inclusive.
pub fn area_tiles(
    min_lat: f64,
    min_lon: f64,
    max_lat: f64,
    max_lon: f64,
    min_zoom: u32,
    max_zoom: u32,
) -> Vec<TileId> {
    let mut tiles = Vec::new();
    for z in min_zoom..=max_zoom {
        let min_x = lon_to_x(min_lon, z);
        let max_x = lon_to_x(max_lon, z);
        // Rows grow southward, so the north edge has the smaller row.
        let min_y = lat_to_y(max_lat, z);
        let max_y = lat_to_y(min_lat, z);
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                tiles.push(TileId { z, x, y });
            }
        }
    }
    tiles
}

/// Bounded tile download worker pool.
#[derive(Debug)]
pub struct Downloader {
    queue: Arc<DownloadQueue>,
    cache: Arc<TileCache>,
    stats: Arc<TileStats>,
    client: reqwest::Client,
    workers: usize,
    cancel: CancellationToken,
}

impl Downloader {
    /// Creates a pool of `workers` download tasks over the shared queue.
    pub fn new(
        queue: Arc<DownloadQueue>,
        cache: Arc<TileCache>,
        stats: Arc<TileStats>,
        workers: usize,
        cancel: CancellationToken,
    ) -> Downloader {
        Downloader {
            queue,
            cache,
            stats,
            client: reqwest::Client::new(),
            workers: workers.max(1),
            cancel,
        }
    }

    /// The shared queue, for enqueueing from other subsystems.
    pub fn queue(&self) -> &Arc<DownloadQueue> {
        &self.queue
    }

    /// Runs the worker pool until the cancellation token fires.
    #[tracing::instrument(name = "tile_downloader", skip_all)]
    pub async fn run(self) -> anyhow::Result<()> {
        let mut set = JoinSet::new();
        for worker in 0..self.workers {
            let queue = self.queue.clone();
            let cache = self.cache.clone();
            let stats = self.stats.clone();
            let client = self.client.clone();
            let cancel = self.cancel.clone();
            set.spawn(async move {
                while let Some(request) = queue.pop(&cancel).await {
                    process(&cache, &stats, &client, request).await;
                }
                tracing::debug!(worker, "download worker stopped");
            });
        }
        while set.join_next().await.is_some() {}
        Ok(())
    }

    /// Enqueues a tile with the priority bit and waits for its completion.
    /// Empty bytes signal a failed download.
    pub async fn fetch(&self, tile: TileId, priority: bool) -> Bytes {
        match self.queue.enqueue_waiting(tile, priority).await {
            Ok(bytes) => bytes,
            Err(_) => Bytes::new(),
        }
    }

    /// Pre-warms the cache over a geographic box.
    ///
    /// Enqueues every tile of the box across the zoom range with priority,
    /// waiting on each in turn; `progress` is invoked with the completed
    /// fraction after every tile. Returns `false` as soon as any tile yields
    /// an empty payload, leaving the partial state in the cache.
    pub async fn download_area(
        &self,
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
        min_zoom: u32,
        max_zoom: u32,
        mut progress: impl FnMut(f64),
    ) -> bool {
        let tiles = area_tiles(min_lat, min_lon, max_lat, max_lon, min_zoom, max_zoom);
        let total = tiles.len();
        if total == 0 {
            return true;
        }
        let mut done = 0usize;
        for tile in tiles {
            let bytes = self.fetch(tile, true).await;
            done += 1;
            progress(done as f64 / total as f64);
            if bytes.is_empty() {
                tracing::warn!(%tile, "area download aborted");
                return false;
            }
        }
        true
    }

    /// Mirrors another tile server.
    ///
    /// Reads the remote `/stats` document, then re-downloads every locally
    /// cached tile through the remote origin. Returns `false` on the first
    /// failed transfer.
    pub async fn synchronize(
        &self,
        server_url: &str,
        mut progress: impl FnMut(f64),
    ) -> bool {
        let remote: tdoa_json::TileStats = match self
            .client
            .get(format!("{server_url}/stats"))
            .send()
            .await
        {
            Ok(response) => match response.json().await {
                Ok(stats) => stats,
                Err(error) => {
                    tracing::warn!(%error, "remote stats unreadable");
                    return false;
                }
            },
            Err(error) => {
                tracing::warn!(%error, "remote stats unreachable");
                return false;
            }
        };
        let Ok(local) = self.cache.walk() else {
            return false;
        };
        let total = remote.total_tiles.max(1) as f64;
        let mut synced = 0u64;
        for (tile, _) in local {
            let url = format!("{server_url}/tile/{}/{}/{}", tile.z, tile.x, tile.y);
            let bytes = match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    match response.bytes().await {
                        Ok(bytes) => bytes,
                        Err(_) => return false,
                    }
                }
                _ => return false,
            };
            if bytes.is_empty() || self.cache.write(tile, &bytes).is_err() {
                return false;
            }
            synced += 1;
            progress(synced as f64 / total);
        }
        true
    }
}

async fn process(
    cache: &TileCache,
    stats: &TileStats,
    client: &reqwest::Client,
    mut request: DownloadRequest,
) {
    let started = Instant::now();
    let tile = request.tile;
    let completion = request.completion.take();
    match fetch_origin(client, tile).await {
        Ok(bytes) => {
            match cache.write(tile, &bytes) {
                Ok(written) => {
                    stats.record_download(written, started.elapsed().as_secs_f64() * 1e3);
                    tracing::debug!(%tile, bytes = bytes.len(), "tile cached");
                }
                Err(error) => {
                    tracing::warn!(%tile, %error, "tile cache write failed");
                }
            }
            if let Some(completion) = completion {
                let _ = completion.send(bytes);
            }
        }
        Err(error) => {
            tracing::warn!(%tile, %error, "tile download failed");
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Some(completion) = completion {
                let _ = completion.send(Bytes::new());
            }
        }
    }
}

async fn fetch_origin(client: &reqwest::Client, tile: TileId) -> Result<Bytes, crate::tiles::TileError> {
    let response = client
        .get(tile.url())
        .send()
        .await
        .map_err(|e| crate::tiles::TileError::Transport(e.to_string()))?;
    if !response.status().is_success() {
        return Err(crate::tiles::TileError::Transport(format!(
            "origin returned {}",
            response.status()
        )));
    }
    response
        .bytes()
        .await
        .map_err(|e| crate::tiles::TileError::Transport(e.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tiles::{tiles_per_side, lat_to_y, lon_to_x};

    #[tokio::test]
    async fn priority_class_is_served_first() {
        let queue = DownloadQueue::new();
        let cancel = CancellationToken::new();
        queue.enqueue(TileId { z: 1, x: 0, y: 0 }, false);
        queue.enqueue(TileId { z: 2, x: 0, y: 0 }, false);
        queue.enqueue(TileId { z: 3, x: 0, y: 0 }, true);
        queue.enqueue(TileId { z: 4, x: 0, y: 0 }, true);
        let order: Vec<u32> = [
            queue.pop(&cancel).await.unwrap().tile.z,
            queue.pop(&cancel).await.unwrap().tile.z,
            queue.pop(&cancel).await.unwrap().tile.z,
            queue.pop(&cancel).await.unwrap().tile.z,
        ]
        .to_vec();
        // Priority first, FIFO within each class.
        assert_eq!(order, vec![3, 4, 1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancelled_pop_returns_none() {
        let queue = DownloadQueue::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(queue.pop(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn dropped_queue_request_reports_failure() {
        let queue = DownloadQueue::new();
        let receiver = queue.enqueue_waiting(TileId { z: 0, x: 0, y: 0 }, true);
        let cancel = CancellationToken::new();
        // Simulate a worker that drops the request without completing it.
        drop(queue.pop(&cancel).await.unwrap());
        assert!(receiver.await.is_err());
    }

    #[test]
    fn area_enumeration_counts() {
        let (min_lat, min_lon) = (37.7549, -122.4494);
        let (max_lat, max_lon) = (37.7949, -122.3894);
        let tiles = area_tiles(min_lat, min_lon, max_lat, max_lon, 12, 14);
        let mut expected = 0u64;
        for z in 12..=14 {
            let dx = lon_to_x(max_lon, z) - lon_to_x(min_lon, z);
            let dy = lat_to_y(min_lat, z) - lat_to_y(max_lat, z);
            expected += (dx as u64 + 1) * (dy as u64 + 1);
        }
        assert_eq!(tiles.len() as u64, expected);
        // Every tile is valid and distinct.
        assert!(tiles.iter().all(TileId::is_valid));
        let mut deduped = tiles.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), tiles.len());
        // Zoom 14 covers the box with at least as many tiles as zoom 12.
        let at = |z| tiles.iter().filter(|t| t.z == z).count();
        assert!(at(14) >= at(12));
        assert!(at(12) >= 1);
    }

    #[test]
    fn area_enumeration_single_point() {
        // A degenerate box still covers the tile containing the point.
        let tiles = area_tiles(37.7749, -122.4194, 37.7749, -122.4194, 12, 12);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].x, lon_to_x(-122.4194, 12));
        assert_eq!(tiles[0].y, lat_to_y(37.7749, 12));
        assert!(tiles[0].x < tiles_per_side(12) as u32);
    }
}
