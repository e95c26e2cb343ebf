//! On-disk tile cache.
//!
//! Tiles live under `<cache>/<z>/<x>/<y>.png`. Payloads are PNG, optionally
//! wrapped in a zlib stream at write time; reads auto-detect the wrapper, so
//! a cache survives a compression config change. Writers create a temp file
//! next to the target and rename it into place so readers never see a partial
//! tile.

use crate::tiles::{TileError, TileId};
use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Tile payload compression settings.
///
/// Applied at write time only; reads auto-detect.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Whether new tiles are zlib-deflated on disk.
    pub enabled: bool,
    /// Deflate level, 1 to 9.
    pub level: u32,
}

impl Default for CompressionConfig {
    fn default() -> CompressionConfig {
        CompressionConfig {
            enabled: true,
            level: 6,
        }
    }
}

/// Deflates a tile payload.
pub fn compress_tile(data: &[u8], level: u32) -> Result<Vec<u8>, TileError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.clamp(1, 9)));
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Inflates a tile payload.
pub fn decompress_tile(data: &[u8]) -> Result<Vec<u8>, TileError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Whether a byte stream begins with a zlib header.
///
/// PNG magic starts with `0x89`, which never satisfies the zlib header
/// checksum, so plain tiles are never misdetected.
pub fn has_zlib_header(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] & 0x0f == 8 && ((data[0] as u16) << 8 | data[1] as u16) % 31 == 0
}

/// On-disk tile cache.
#[derive(Debug, Clone)]
pub struct TileCache {
    root: PathBuf,
    compression: CompressionConfig,
}

impl TileCache {
    /// Opens a cache rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>, compression: CompressionConfig) -> Result<TileCache, TileError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(TileCache { root, compression })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The write-time compression settings.
    pub fn compression(&self) -> CompressionConfig {
        self.compression
    }

    /// Absolute path of a tile.
    pub fn tile_path(&self, tile: TileId) -> PathBuf {
        self.root
            .join(tile.z.to_string())
            .join(tile.x.to_string())
            .join(format!("{}.png", tile.y))
    }

    /// Whether a tile is present.
    pub fn contains(&self, tile: TileId) -> bool {
        self.tile_path(tile).is_file()
    }

    /// Reads a tile, inflating it when the on-disk bytes carry a zlib header.
    /// Returns `None` when the tile is not cached.
    pub fn read(&self, tile: TileId) -> Result<Option<Bytes>, TileError> {
        let path = self.tile_path(tile);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if has_zlib_header(&data) {
            Ok(Some(Bytes::from(decompress_tile(&data)?)))
        } else {
            Ok(Some(Bytes::from(data)))
        }
    }

    /// Writes a tile, deflating when compression is enabled. Returns the
    /// number of bytes that landed on disk.
    pub fn write(&self, tile: TileId, data: &[u8]) -> Result<u64, TileError> {
        let path = self.tile_path(tile);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let payload = if self.compression.enabled {
            compress_tile(data, self.compression.level)?
        } else {
            data.to_vec()
        };
        // Temp file plus rename keeps concurrent readers off partial tiles.
        let tmp = path.with_extension("png.tmp");
        std::fs::write(&tmp, &payload)?;
        std::fs::rename(&tmp, &path)?;
        Ok(payload.len() as u64)
    }

    /// Removes cached tiles, optionally only those last written before
    /// `older_than`. Returns the number of files removed.
    pub fn clear(&self, older_than: Option<SystemTime>) -> Result<u64, TileError> {
        let mut removed = 0;
        for (tile, path) in self.walk()? {
            let _ = tile;
            let delete = match older_than {
                None => true,
                Some(cutoff) => std::fs::metadata(&path)
                    .and_then(|m| m.modified())
                    .map(|written| written < cutoff)
                    .unwrap_or(false),
            };
            if delete {
                std::fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Tiles whose last write is older than `max_age`.
    pub fn stale_tiles(&self, max_age: Duration) -> Result<Vec<TileId>, TileError> {
        let now = SystemTime::now();
        let mut stale = Vec::new();
        for (tile, path) in self.walk()? {
            let written = std::fs::metadata(&path).and_then(|m| m.modified())?;
            if now.duration_since(written).unwrap_or_default() > max_age {
                stale.push(tile);
            }
        }
        Ok(stale)
    }

    /// Every cached tile with its path. Files whose names do not parse as
    /// tile coordinates are skipped, not deleted.
    pub fn walk(&self) -> Result<Vec<(TileId, PathBuf)>, TileError> {
        let mut tiles = Vec::new();
        let Ok(zooms) = std::fs::read_dir(&self.root) else {
            return Ok(tiles);
        };
        for zoom_entry in zooms.flatten() {
            let Some(z) = name_as_u32(&zoom_entry.path()) else {
                continue;
            };
            let Ok(columns) = std::fs::read_dir(zoom_entry.path()) else {
                continue;
            };
            for column_entry in columns.flatten() {
                let Some(x) = name_as_u32(&column_entry.path()) else {
                    continue;
                };
                let Ok(rows) = std::fs::read_dir(column_entry.path()) else {
                    continue;
                };
                for row_entry in rows.flatten() {
                    let path = row_entry.path();
                    if !path.extension().is_some_and(|ext| ext == "png") {
                        continue;
                    }
                    let Some(y) = path
                        .file_stem()
                        .and_then(|s| s.to_str())
                        .and_then(|s| s.parse().ok())
                    else {
                        continue;
                    };
                    if let Ok(tile) = TileId::new(z, x, y) {
                        tiles.push((tile, path));
                    }
                }
            }
        }
        tiles.sort();
        Ok(tiles)
    }
}

fn name_as_u32(path: &Path) -> Option<u32> {
    path.file_name()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod test {
    use super::*;

    const TILE_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake tile payload for tests";

    fn cache(dir: &tempfile::TempDir, compression: CompressionConfig) -> TileCache {
        TileCache::new(dir.path().join("tiles"), compression).unwrap()
    }

    #[test]
    fn compress_round_trip_all_levels() {
        let data: Vec<u8> = (0..4096u32).map(|n| (n % 251) as u8).collect();
        for level in 1..=9 {
            let packed = compress_tile(&data, level).unwrap();
            assert!(has_zlib_header(&packed));
            assert_eq!(decompress_tile(&packed).unwrap(), data);
        }
    }

    #[test]
    fn png_magic_is_not_zlib() {
        assert!(!has_zlib_header(TILE_BYTES));
    }

    #[test]
    fn write_and_read_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, CompressionConfig::default());
        let tile = TileId::new(12, 655, 1583).unwrap();
        cache.write(tile, TILE_BYTES).unwrap();
        assert!(cache.contains(tile));
        // On disk the payload carries the zlib wrapper.
        let raw = std::fs::read(cache.tile_path(tile)).unwrap();
        assert!(has_zlib_header(&raw));
        // Reads hand back the original bytes.
        assert_eq!(cache.read(tile).unwrap().unwrap().as_ref(), TILE_BYTES);
    }

    #[test]
    fn read_auto_detects_uncompressed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(
            &dir,
            CompressionConfig {
                enabled: false,
                level: 6,
            },
        );
        let tile = TileId::new(3, 1, 2).unwrap();
        cache.write(tile, TILE_BYTES).unwrap();
        let raw = std::fs::read(cache.tile_path(tile)).unwrap();
        assert_eq!(raw, TILE_BYTES);
        assert_eq!(cache.read(tile).unwrap().unwrap().as_ref(), TILE_BYTES);
    }

    #[test]
    fn missing_tile_reads_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, CompressionConfig::default());
        assert!(cache.read(TileId::new(0, 0, 0).unwrap()).unwrap().is_none());
    }

    #[test]
    fn walk_finds_tiles_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, CompressionConfig::default());
        for (z, x, y) in [(0, 0, 0), (1, 0, 1), (2, 2, 2)] {
            cache.write(TileId::new(z, x, y).unwrap(), TILE_BYTES).unwrap();
        }
        // Garbage the walk must skip but not delete.
        std::fs::create_dir_all(cache.root().join("not-a-zoom")).unwrap();
        std::fs::write(cache.root().join("not-a-zoom/readme.txt"), b"x").unwrap();
        let tiles: Vec<TileId> = cache.walk().unwrap().into_iter().map(|(t, _)| t).collect();
        assert_eq!(
            tiles,
            vec![
                TileId::new(0, 0, 0).unwrap(),
                TileId::new(1, 0, 1).unwrap(),
                TileId::new(2, 2, 2).unwrap(),
            ]
        );
        assert!(cache.root().join("not-a-zoom/readme.txt").exists());
    }

    #[test]
    fn clear_removes_all_or_old() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, CompressionConfig::default());
        cache.write(TileId::new(0, 0, 0).unwrap(), TILE_BYTES).unwrap();
        cache.write(TileId::new(1, 1, 1).unwrap(), TILE_BYTES).unwrap();
        // A cutoff in the past removes nothing.
        let long_ago = SystemTime::now() - Duration::from_secs(3600);
        assert_eq!(cache.clear(Some(long_ago)).unwrap(), 0);
        // A cutoff in the future removes everything older than it.
        let soon = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(cache.clear(Some(soon)).unwrap(), 2);
        assert!(!cache.contains(TileId::new(0, 0, 0).unwrap()));
        cache.write(TileId::new(0, 0, 0).unwrap(), TILE_BYTES).unwrap();
        assert_eq!(cache.clear(None).unwrap(), 1);
    }

    #[test]
    fn stale_tiles_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache(&dir, CompressionConfig::default());
        let tile = TileId::new(5, 10, 20).unwrap();
        cache.write(tile, TILE_BYTES).unwrap();
        assert!(cache.stale_tiles(Duration::from_secs(3600)).unwrap().is_empty());
        // Give the file time to age past a zero threshold even on
        // coarse-mtime filesystems.
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.stale_tiles(Duration::ZERO).unwrap(), vec![tile]);
    }
}
