//! Tile cache coverage analyzer.
//!
//! Walks a cache directory, derives per-zoom coverage against the `4^z`
//! possible tiles, computes tile bounds, and renders a freshness heatmap plus
//! a JSON coverage report. Long walks report progress through an optional
//! callback.

use crate::tiles::{tile_to_lat, tile_to_lon, tiles_at_zoom, TileError, TileId};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Crc};
use regex::Regex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::SystemTime;

/// Coverage statistics over a cache directory.
#[derive(Debug, Clone, PartialEq)]
pub struct CoverageStats {
    /// The analyzed cache root.
    pub cache_path: PathBuf,
    /// Possible tiles summed over the scanned zooms (`Σ 4^z`).
    pub total_tiles: u64,
    /// Cached tiles over the scanned zooms.
    pub cached_tiles: u64,
    /// `100 · cached / total`, 0 when nothing was scanned.
    pub coverage_percentage: f64,
    /// Per-zoom coverage percentages, ascending by zoom.
    pub coverage_by_zoom: Vec<(u32, f64)>,
    /// Bytes of cached payload over the scanned zooms.
    pub cache_size_bytes: u64,
}

/// Tile rectangle covered at one zoom.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TileBounds {
    /// Westernmost column.
    pub min_x: u32,
    /// Northernmost row.
    pub min_y: u32,
    /// Easternmost column.
    pub max_x: u32,
    /// Southernmost row.
    pub max_y: u32,
    /// Zoom level.
    pub zoom: u32,
}

/// Progress callback: completed fraction in `[0, 1]` plus a status line.
pub type ProgressFn = Box<dyn Fn(f32, &str) + Send>;

fn tile_coords_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(\d+)/(\d+)/(\d+)\.png$").expect("tile path pattern"))
}

/// Extracts `(z, x, y)` from a cache-relative tile path.
fn parse_tile_coords(path: &Path) -> Option<TileId> {
    let text = path.to_str()?.replace('\\', "/");
    let captures = tile_coords_pattern().captures(&text)?;
    let z = captures[1].parse().ok()?;
    let x = captures[2].parse().ok()?;
    let y = captures[3].parse().ok()?;
    TileId::new(z, x, y).ok()
}

fn walk_files(dir: &Path, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, files);
        } else if path.is_file() {
            files.push(path);
        }
    }
}

/// Cache coverage analyzer.
///
/// The walk is single-threaded; if it ever needs to parallelize, partition
/// by top-level zoom directory.
#[derive(Default)]
pub struct CoverageAnalyzer {
    progress: Option<ProgressFn>,
}

impl CoverageAnalyzer {
    /// Creates an analyzer without a progress callback.
    pub fn new() -> CoverageAnalyzer {
        CoverageAnalyzer::default()
    }

    /// Installs a progress callback for long walks.
    pub fn set_progress(&mut self, progress: ProgressFn) {
        self.progress = Some(progress);
    }

    fn report_progress(&self, fraction: f32, status: &str) {
        if let Some(progress) = &self.progress {
            progress(fraction, status);
        }
    }

    /// Analyzes the cache, optionally restricted to a set of zooms.
    ///
    /// Unparseable file names are skipped, not deleted.
    pub fn analyze_coverage(
        &self,
        cache_path: &Path,
        zooms: &[u32],
    ) -> Result<CoverageStats, TileError> {
        let mut files = Vec::new();
        walk_files(cache_path, &mut files);
        let total_files = files.len().max(1);
        let mut count_by_zoom: Vec<(u32, u64)> = Vec::new();
        let mut cache_size_bytes = 0;
        for (processed, file) in files.iter().enumerate() {
            if let Some(tile) = parse_tile_coords(file) {
                if zooms.is_empty() || zooms.contains(&tile.z) {
                    match count_by_zoom.iter_mut().find(|(z, _)| *z == tile.z) {
                        Some((_, count)) => *count += 1,
                        None => count_by_zoom.push((tile.z, 1)),
                    }
                    cache_size_bytes += std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
                }
            }
            self.report_progress(
                (processed + 1) as f32 / total_files as f32,
                "Analyzing cache contents...",
            );
        }
        count_by_zoom.sort();
        let mut stats = CoverageStats {
            cache_path: cache_path.to_path_buf(),
            total_tiles: 0,
            cached_tiles: 0,
            coverage_percentage: 0.0,
            coverage_by_zoom: Vec::with_capacity(count_by_zoom.len()),
            cache_size_bytes,
        };
        for (zoom, count) in count_by_zoom {
            let possible = tiles_at_zoom(zoom);
            stats
                .coverage_by_zoom
                .push((zoom, 100.0 * count as f64 / possible as f64));
            stats.total_tiles += possible;
            stats.cached_tiles += count;
        }
        if stats.total_tiles > 0 {
            stats.coverage_percentage =
                100.0 * stats.cached_tiles as f64 / stats.total_tiles as f64;
        }
        Ok(stats)
    }

    /// Tile rectangle covered at `zoom`. Fails when no tiles exist there.
    pub fn bounds(&self, cache_path: &Path, zoom: u32) -> Result<TileBounds, TileError> {
        let mut files = Vec::new();
        walk_files(cache_path, &mut files);
        let total_files = files.len().max(1);
        let mut bounds: Option<TileBounds> = None;
        for (processed, file) in files.iter().enumerate() {
            if let Some(tile) = parse_tile_coords(file) {
                if tile.z == zoom {
                    let b = bounds.get_or_insert(TileBounds {
                        min_x: tile.x,
                        min_y: tile.y,
                        max_x: tile.x,
                        max_y: tile.y,
                        zoom,
                    });
                    b.min_x = b.min_x.min(tile.x);
                    b.min_y = b.min_y.min(tile.y);
                    b.max_x = b.max_x.max(tile.x);
                    b.max_y = b.max_y.max(tile.y);
                }
            }
            self.report_progress(
                (processed + 1) as f32 / total_files as f32,
                "Calculating bounds...",
            );
        }
        bounds.ok_or(TileError::EmptyCache { zoom })
    }

    /// Renders a freshness heatmap over the tiles cached at `zoom`.
    ///
    /// Cached tiles shade from green (fresh) to red (old) with the gradient
    /// `exp(-age_hours / 720)`; missing tiles stay black. The grid is drawn
    /// at four times the tile scale for legibility.
    pub fn generate_heatmap(
        &self,
        output_path: &Path,
        stats: &CoverageStats,
        zoom: u32,
    ) -> Result<(), TileError> {
        const SCALE: usize = 4;
        const GRID: [u8; 3] = [128, 128, 128];
        let bounds = self.bounds(&stats.cache_path, zoom)?;
        let width = (bounds.max_x - bounds.min_x + 1) as usize;
        let height = (bounds.max_y - bounds.min_y + 1) as usize;
        let img_w = width * SCALE;
        let img_h = height * SCALE;
        let mut pixels = vec![0u8; img_w * img_h * 3];

        let mut paint = |px: usize, py: usize, rgb: [u8; 3]| {
            let offset = (py * img_w + px) * 3;
            pixels[offset..offset + 3].copy_from_slice(&rgb);
        };

        let mut files = Vec::new();
        walk_files(&stats.cache_path, &mut files);
        let total_files = files.len().max(1);
        let now = SystemTime::now();
        for (processed, file) in files.iter().enumerate() {
            if let Some(tile) = parse_tile_coords(file) {
                if tile.z == zoom {
                    let age_hours = std::fs::metadata(file)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|written| now.duration_since(written).ok())
                        .map(|age| age.as_secs_f64() / 3600.0)
                        .unwrap_or(0.0);
                    let green = (255.0 * (-age_hours / 720.0).exp()).clamp(0.0, 255.0) as u8;
                    let rgb = [255 - green, green, 0];
                    let x0 = (tile.x - bounds.min_x) as usize * SCALE;
                    let y0 = (tile.y - bounds.min_y) as usize * SCALE;
                    for py in y0..y0 + SCALE {
                        for px in x0..x0 + SCALE {
                            paint(px, py, rgb);
                        }
                    }
                }
            }
            self.report_progress(
                (processed + 1) as f32 / total_files as f32,
                "Generating heatmap...",
            );
        }

        // Grid overlay along both axes.
        for row in 0..=height {
            let py = (row * SCALE).min(img_h - 1);
            for px in 0..img_w {
                paint(px, py, GRID);
            }
        }
        for column in 0..=width {
            let px = (column * SCALE).min(img_w - 1);
            for py in 0..img_h {
                paint(px, py, GRID);
            }
        }

        write_png(output_path, img_w as u32, img_h as u32, &pixels)
    }

    /// Writes a JSON coverage report with totals, per-zoom coverage, tile
    /// bounds and the equivalent geographic boxes.
    pub fn generate_coverage_report(
        &self,
        output_path: &Path,
        stats: &CoverageStats,
    ) -> Result<(), TileError> {
        let mut zoom_coverage = Vec::new();
        for (zoom, coverage) in &stats.coverage_by_zoom {
            zoom_coverage.push(serde_json::json!({
                "zoom": zoom,
                "coverage": coverage,
                "tiles": tiles_at_zoom(*zoom),
            }));
        }
        let mut bounds = Vec::new();
        for (zoom, _) in &stats.coverage_by_zoom {
            // Zooms with no parseable tiles are skipped.
            let Ok(b) = self.bounds(&stats.cache_path, *zoom) else {
                continue;
            };
            bounds.push(serde_json::json!({
                "zoom": zoom,
                "min_x": b.min_x,
                "min_y": b.min_y,
                "max_x": b.max_x,
                "max_y": b.max_y,
                "min_lat": tile_to_lat(b.max_y + 1, *zoom),
                "max_lat": tile_to_lat(b.min_y, *zoom),
                "min_lon": tile_to_lon(b.min_x, *zoom),
                "max_lon": tile_to_lon(b.max_x + 1, *zoom),
            }));
        }
        let report = serde_json::json!({
            "total_tiles": stats.total_tiles,
            "cached_tiles": stats.cached_tiles,
            "coverage_percentage": stats.coverage_percentage,
            "cache_size_mb": stats.cache_size_bytes as f64 / (1024.0 * 1024.0),
            "coverage_by_zoom": zoom_coverage,
            "bounds": bounds,
        });
        let text = serde_json::to_string_pretty(&report)
            .map_err(|e| TileError::Transport(e.to_string()));
        std::fs::write(output_path, text?)?;
        Ok(())
    }
}

/// Writes an 8-bit RGB PNG.
///
/// The fixed chunk layout (IHDR, one IDAT, IEND) is written inline with
/// `flate2` supplying the zlib stream and CRC-32.
fn write_png(path: &Path, width: u32, height: u32, rgb: &[u8]) -> Result<(), TileError> {
    fn chunk(out: &mut Vec<u8>, kind: &[u8; 4], data: &[u8]) {
        out.extend_from_slice(&(data.len() as u32).to_be_bytes());
        out.extend_from_slice(kind);
        out.extend_from_slice(data);
        let mut crc = Crc::new();
        crc.update(kind);
        crc.update(data);
        out.extend_from_slice(&crc.sum().to_be_bytes());
    }

    let mut ihdr = Vec::with_capacity(13);
    ihdr.extend_from_slice(&width.to_be_bytes());
    ihdr.extend_from_slice(&height.to_be_bytes());
    // 8-bit depth, truecolor, default compression/filter, no interlace.
    ihdr.extend_from_slice(&[8, 2, 0, 0, 0]);

    // Raw scanlines, each prefixed with filter type 0.
    let stride = width as usize * 3;
    let mut raw = Vec::with_capacity((stride + 1) * height as usize);
    for row in rgb.chunks(stride) {
        raw.push(0);
        raw.extend_from_slice(row);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let idat = encoder.finish()?;

    let mut out = Vec::new();
    out.extend_from_slice(b"\x89PNG\r\n\x1a\n");
    chunk(&mut out, b"IHDR", &ihdr);
    chunk(&mut out, b"IDAT", &idat);
    chunk(&mut out, b"IEND", &[]);
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn seed_cache(dir: &Path, tiles: &[(u32, u32, u32)]) {
        for (z, x, y) in tiles {
            let parent = dir.join(z.to_string()).join(x.to_string());
            std::fs::create_dir_all(&parent).unwrap();
            std::fs::write(parent.join(format!("{y}.png")), b"\x89PNGtile").unwrap();
        }
    }

    #[test]
    fn parses_tile_coordinates() {
        assert_eq!(
            parse_tile_coords(Path::new("/cache/12/655/1583.png")),
            Some(TileId {
                z: 12,
                x: 655,
                y: 1583
            })
        );
        assert_eq!(parse_tile_coords(Path::new("/cache/readme.txt")), None);
        assert_eq!(parse_tile_coords(Path::new("/cache/a/b/c.png")), None);
        // Out-of-grid coordinates do not parse into a tile.
        assert_eq!(parse_tile_coords(Path::new("/cache/1/5/0.png")), None);
    }

    #[test]
    fn coverage_denominators() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(
            dir.path(),
            &[
                (0, 0, 0),
                (1, 0, 0),
                (1, 0, 1),
                (1, 1, 0),
                (2, 1, 1),
                (2, 2, 2),
            ],
        );
        let analyzer = CoverageAnalyzer::new();
        let stats = analyzer.analyze_coverage(dir.path(), &[0, 1]).unwrap();
        assert_eq!(stats.coverage_by_zoom, vec![(0, 100.0), (1, 75.0)]);
        assert_eq!(stats.total_tiles, 5);
        assert_eq!(stats.cached_tiles, 4);
        assert!((stats.coverage_percentage - 80.0).abs() < 1e-9);
        assert!(stats.cache_size_bytes > 0);
    }

    #[test]
    fn coverage_of_empty_cache_is_zero() {
        let dir = tempfile::tempdir().unwrap();
        let analyzer = CoverageAnalyzer::new();
        let stats = analyzer.analyze_coverage(dir.path(), &[]).unwrap();
        assert_eq!(stats.total_tiles, 0);
        assert_eq!(stats.cached_tiles, 0);
        assert_eq!(stats.coverage_percentage, 0.0);
        assert!(stats.coverage_by_zoom.is_empty());
    }

    #[test]
    fn bounds_over_zoom() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), &[(3, 1, 2), (3, 4, 1), (3, 2, 6), (2, 0, 0)]);
        let analyzer = CoverageAnalyzer::new();
        let bounds = analyzer.bounds(dir.path(), 3).unwrap();
        assert_eq!(
            bounds,
            TileBounds {
                min_x: 1,
                min_y: 1,
                max_x: 4,
                max_y: 6,
                zoom: 3
            }
        );
        assert!(matches!(
            analyzer.bounds(dir.path(), 9),
            Err(TileError::EmptyCache { zoom: 9 })
        ));
    }

    #[test]
    fn progress_reaches_one() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), &[(1, 0, 0), (1, 1, 1), (2, 3, 3)]);
        let mut analyzer = CoverageAnalyzer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let last = Arc::new(Mutex::new(0.0f32));
        let (calls_cb, last_cb) = (calls.clone(), last.clone());
        analyzer.set_progress(Box::new(move |fraction, status| {
            assert!((0.0..=1.0).contains(&fraction));
            assert!(!status.is_empty());
            calls_cb.fetch_add(1, Ordering::Relaxed);
            *last_cb.lock().unwrap() = fraction;
        }));
        analyzer.analyze_coverage(dir.path(), &[]).unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(*last.lock().unwrap(), 1.0);
    }

    #[test]
    fn heatmap_writes_png() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), &[(2, 0, 0), (2, 1, 1), (2, 3, 2)]);
        let analyzer = CoverageAnalyzer::new();
        let stats = analyzer.analyze_coverage(dir.path(), &[]).unwrap();
        let output = dir.path().join("heatmap.png");
        analyzer.generate_heatmap(&output, &stats, 2).unwrap();
        let bytes = std::fs::read(&output).unwrap();
        assert_eq!(&bytes[..8], b"\x89PNG\r\n\x1a\n");
        assert_eq!(&bytes[12..16], b"IHDR");
        // 4 columns by 3 rows of tiles at 4x scale.
        let width = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        let height = u32::from_be_bytes(bytes[20..24].try_into().unwrap());
        assert_eq!(width, 16);
        assert_eq!(height, 12);
        assert_eq!(&bytes[bytes.len() - 8..bytes.len() - 4], b"IEND");
    }

    #[test]
    fn coverage_report_contents() {
        let dir = tempfile::tempdir().unwrap();
        seed_cache(dir.path(), &[(1, 0, 0), (1, 1, 1)]);
        let analyzer = CoverageAnalyzer::new();
        let stats = analyzer.analyze_coverage(dir.path(), &[]).unwrap();
        let output = dir.path().join("coverage.json");
        analyzer.generate_coverage_report(&output, &stats).unwrap();
        let report: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&output).unwrap()).unwrap();
        assert_eq!(report["cached_tiles"], 2);
        assert_eq!(report["total_tiles"], 4);
        assert_eq!(report["coverage_by_zoom"][0]["zoom"], 1);
        assert_eq!(report["coverage_by_zoom"][0]["coverage"], 50.0);
        let bounds = &report["bounds"][0];
        assert_eq!(bounds["zoom"], 1);
        assert_eq!(bounds["min_x"], 0);
        assert_eq!(bounds["max_x"], 1);
        // Zoom 1 bounds cover the whole world.
        assert_eq!(bounds["min_lon"], -180.0);
        assert_eq!(bounds["max_lon"], 180.0);
    }
}
