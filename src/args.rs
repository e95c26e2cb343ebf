//! tdoa-node CLI arguments.
//!
//! This module contains the definition of the CLI arguments for the
//! tdoa-node daemon. These carry the environment inputs: storage paths, the
//! tile server binding, rate and concurrency limits, and the background task
//! cadences.

use clap::Parser;
use std::path::PathBuf;

/// tdoa-node CLI arguments.
#[derive(Parser, Debug, Clone, PartialEq)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Node identifier reported to the platform
    #[clap(long, default_value = "node001")]
    pub node_id: String,
    /// Signal database file
    #[clap(long, default_value = "signals.db")]
    pub db_path: PathBuf,
    /// Map tile cache root directory
    #[clap(long, default_value = "tiles")]
    pub tile_cache: PathBuf,
    /// Directory for receiver configuration profiles
    #[clap(long, default_value = "config/bb60_profiles")]
    pub profile_dir: PathBuf,
    /// Open the receiver and stream at startup
    #[clap(long)]
    pub enable_receiver: bool,
    /// Tile server port on localhost
    #[clap(long, default_value_t = 8080)]
    pub tile_port: u16,
    /// Tile requests allowed per rolling minute
    #[clap(long, default_value_t = 15000)]
    pub tile_rate_limit: u64,
    /// Concurrent tile download workers
    #[clap(long, default_value_t = crate::tiles::download::DEFAULT_CONCURRENT_DOWNLOADS)]
    pub max_concurrent_downloads: usize,
    /// Hours between tile cache refresh sweeps
    #[clap(long, default_value_t = 24)]
    pub tile_check_interval_hours: u64,
    /// Tile age in hours after which a refresh is enqueued
    #[clap(long, default_value_t = 168)]
    pub tile_max_age_hours: u64,
    /// Disable zlib compression of cached tiles
    #[clap(long)]
    pub no_tile_compression: bool,
    /// Tile compression level (1-9)
    #[clap(long, default_value_t = 6)]
    pub tile_compression_level: u32,
    /// Seconds between report scheduler ticks
    #[clap(long, default_value_t = 60)]
    pub report_tick_secs: u64,
    /// Seconds between node metrics pushes
    #[clap(long, default_value_t = 30)]
    pub metrics_interval_secs: u64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_parse() {
        let args = Args::parse_from(["tdoa-node"]);
        assert_eq!(args.node_id, "node001");
        assert_eq!(args.tile_port, 8080);
        assert_eq!(args.max_concurrent_downloads, 4);
        assert_eq!(args.tile_max_age_hours, 168);
        assert!(!args.enable_receiver);
        assert!(!args.no_tile_compression);
    }

    #[test]
    fn overrides_parse() {
        let args = Args::parse_from([
            "tdoa-node",
            "--node-id",
            "field-07",
            "--tile-port",
            "9090",
            "--no-tile-compression",
            "--enable-receiver",
        ]);
        assert_eq!(args.node_id, "field-07");
        assert_eq!(args.tile_port, 9090);
        assert!(args.no_tile_compression);
        assert!(args.enable_receiver);
    }
}
