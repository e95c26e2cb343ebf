//! Map tile service.
//!
//! A local tile cache with an HTTP server, background downloader and coverage
//! analyzer, supporting offline operation against an OSM-style origin. This
//! module holds the shared pieces: tile identities, spherical-Mercator math,
//! the service statistics counters and the error taxonomy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

pub mod cache;
pub mod coverage;
pub mod download;
pub mod server;

/// Remote tile origin. Single host, no subdomain rotation.
pub const TILE_ORIGIN: &str = "https://tile.openstreetmap.org";

/// Errors surfaced by the tile service.
#[derive(Error, Debug)]
pub enum TileError {
    /// Coordinates outside the valid range for their zoom.
    #[error("invalid tile coordinates {z}/{x}/{y}")]
    InvalidCoordinates {
        /// Zoom level.
        z: u32,
        /// Column.
        x: u32,
        /// Row.
        y: u32,
    },
    /// No tiles exist at the requested zoom.
    #[error("no tiles found at zoom level {zoom}")]
    EmptyCache {
        /// The zoom level that was scanned.
        zoom: u32,
    },
    /// A cache file could not be read or written.
    #[error("tile I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// A transfer against the remote origin failed.
    #[error("tile transport error: {0}")]
    Transport(String),
}

/// Identity of one map tile in spherical-Mercator coordinates.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct TileId {
    /// Zoom level.
    pub z: u32,
    /// Column, in `[0, 2^z)`.
    pub x: u32,
    /// Row, in `[0, 2^z)`.
    pub y: u32,
}

impl TileId {
    /// Creates a tile id, checking the coordinate invariant.
    pub fn new(z: u32, x: u32, y: u32) -> Result<TileId, TileError> {
        let tile = TileId { z, x, y };
        if tile.is_valid() {
            Ok(tile)
        } else {
            Err(TileError::InvalidCoordinates { z, x, y })
        }
    }

    /// Whether `x` and `y` are inside the `2^z` grid.
    pub fn is_valid(&self) -> bool {
        self.z <= 30 && (self.x as u64) < tiles_per_side(self.z) && (self.y as u64) < tiles_per_side(self.z)
    }

    /// Download URL at the remote origin.
    pub fn url(&self) -> String {
        format!("{TILE_ORIGIN}/{}/{}/{}.png", self.z, self.x, self.y)
    }

    /// Path of this tile relative to a cache root.
    pub fn rel_path(&self) -> String {
        format!("{}/{}/{}.png", self.z, self.x, self.y)
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

/// Tiles along one side of the grid at a zoom level.
pub fn tiles_per_side(zoom: u32) -> u64 {
    1u64 << zoom
}

/// Total tiles at a zoom level (`4^z`).
pub fn tiles_at_zoom(zoom: u32) -> u64 {
    tiles_per_side(zoom) * tiles_per_side(zoom)
}

/// Tile column containing a longitude.
pub fn lon_to_x(lon: f64, zoom: u32) -> u32 {
    let n = tiles_per_side(zoom) as f64;
    (((lon + 180.0) / 360.0 * n) as i64).clamp(0, tiles_per_side(zoom) as i64 - 1) as u32
}

/// Tile row containing a latitude. Rows grow southward.
pub fn lat_to_y(lat: f64, zoom: u32) -> u32 {
    let n = tiles_per_side(zoom) as f64;
    let lat_rad = lat.to_radians();
    let y = (1.0 - lat_rad.tan().asinh() / std::f64::consts::PI) / 2.0 * n;
    (y as i64).clamp(0, tiles_per_side(zoom) as i64 - 1) as u32
}

/// Longitude of a tile column's western edge.
pub fn tile_to_lon(x: u32, zoom: u32) -> f64 {
    x as f64 / tiles_per_side(zoom) as f64 * 360.0 - 180.0
}

/// Latitude of a tile row's northern edge.
pub fn tile_to_lat(y: u32, zoom: u32) -> f64 {
    let n = tiles_per_side(zoom) as f64;
    (std::f64::consts::PI * (1.0 - 2.0 * y as f64 / n)).sinh().atan().to_degrees()
}

/// Shared tile service counters.
///
/// Counters are atomic so the HTTP handlers, the download workers and the
/// stats endpoint touch them without locking; only the running latency mean
/// sits behind a mutex because it is updated together with the request count.
#[derive(Debug, Default)]
pub struct TileStats {
    total_tiles: AtomicU64,
    cached_tiles: AtomicU64,
    total_size_bytes: AtomicU64,
    requests_served: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    average_latency_ms: Mutex<f64>,
}

impl TileStats {
    /// Creates zeroed counters.
    pub fn new() -> TileStats {
        TileStats::default()
    }

    /// Records a request answered from the cache.
    pub fn record_hit(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed download of `bytes` written to the cache, taking
    /// `latency_ms` end to end. The latency enters the running mean over all
    /// served requests.
    pub fn record_download(&self, bytes: u64, latency_ms: f64) {
        let mut mean = self.average_latency_ms.lock().unwrap();
        let served = self.requests_served.load(Ordering::Relaxed);
        *mean = (*mean * served as f64 + latency_ms) / (served + 1) as f64;
        self.requests_served.fetch_add(1, Ordering::Relaxed);
        self.total_tiles.fetch_add(1, Ordering::Relaxed);
        self.cached_tiles.fetch_add(1, Ordering::Relaxed);
        self.total_size_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot in the `/stats` wire format.
    pub fn snapshot(&self) -> tdoa_json::TileStats {
        tdoa_json::TileStats {
            total_tiles: self.total_tiles.load(Ordering::Relaxed),
            cached_tiles: self.cached_tiles.load(Ordering::Relaxed),
            total_size_bytes: self.total_size_bytes.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            average_latency_ms: *self.average_latency_ms.lock().unwrap(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tile_url_format() {
        let tile = TileId::new(3, 1, 2).unwrap();
        assert_eq!(tile.url(), "https://tile.openstreetmap.org/3/1/2.png");
        assert_eq!(tile.rel_path(), "3/1/2.png");
    }

    #[test]
    fn coordinate_validity() {
        assert!(TileId::new(0, 0, 0).is_ok());
        assert!(TileId::new(1, 1, 1).is_ok());
        assert!(TileId::new(1, 2, 0).is_err());
        assert!(TileId::new(5, 0, 32).is_err());
        assert!(TileId::new(5, 31, 31).is_ok());
    }

    #[test]
    fn tile_counts() {
        assert_eq!(tiles_at_zoom(0), 1);
        assert_eq!(tiles_at_zoom(1), 4);
        assert_eq!(tiles_at_zoom(10), 1 << 20);
    }

    #[test]
    fn forward_tile_math() {
        // Whole world at zoom 0.
        assert_eq!(lon_to_x(-179.9, 0), 0);
        assert_eq!(lat_to_y(85.0, 0), 0);
        // San Francisco at zoom 12.
        assert_eq!(lon_to_x(-122.4194, 12), 655);
        assert_eq!(lat_to_y(37.7749, 12), 1583);
        // Null island sits on the grid center seam.
        assert_eq!(lon_to_x(0.0, 1), 1);
        assert_eq!(lat_to_y(0.0, 1), 1);
    }

    #[test]
    fn geodetic_round_trip_tolerance() {
        for zoom in [4, 8, 12] {
            let lon_tolerance = 360.0 / tiles_per_side(zoom) as f64;
            let lat_tolerance = 170.0 / tiles_per_side(zoom) as f64;
            for &(lat, lon) in &[(37.7749, -122.4194), (-33.8688, 151.2093), (51.5074, -0.1278)] {
                let x = lon_to_x(lon, zoom);
                let y = lat_to_y(lat, zoom);
                assert!((tile_to_lon(x, zoom) - lon).abs() <= lon_tolerance);
                assert!((tile_to_lat(y, zoom) - lat).abs() <= lat_tolerance);
            }
        }
    }

    #[test]
    fn stats_running_mean() {
        let stats = TileStats::new();
        stats.record_download(1000, 10.0);
        stats.record_download(500, 30.0);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_served, 2);
        assert_eq!(snapshot.total_tiles, 2);
        assert_eq!(snapshot.total_size_bytes, 1500);
        assert_eq!(snapshot.cache_misses, 2);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 1e-9);
        stats.record_hit();
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.requests_served, 3);
        assert_eq!(snapshot.cache_hits, 1);
    }
}
