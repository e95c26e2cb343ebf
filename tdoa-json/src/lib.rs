//! tdoa-json contains the JSON schemas used by tdoa-node: the on-disk device
//! profile format, the tile server statistics document, node metrics pushes,
//! and configuration change events.

#![warn(missing_docs)]

use serde::{Deserialize, Serialize};

/// Device profile JSON schema.
///
/// This schema corresponds to the profile files stored under the profile
/// directory as `<name>.json`. A profile is a named snapshot of the streaming
/// configuration and the device-specific parameters. Unknown fields are
/// rejected so that a profile written by a newer schema is not silently
/// half-applied.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    /// Streaming configuration snapshot.
    pub streaming: ProfileStreaming,
    /// Device parameter snapshot.
    pub parameters: ProfileParameters,
}

/// Streaming section of a device profile.
///
/// Field names and the integer `format` encoding match the legacy profile
/// files, so profiles written by existing field deployments load unchanged.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileStreaming {
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Sample rate in samples per second.
    pub sample_rate: f64,
    /// Sample format as its integer wire value (0 = float32, 1 = int16).
    pub format: u32,
    /// Whether GPS time stamping is requested.
    pub enable_time_stamp: bool,
    /// Buffer capacity in complex samples.
    pub buffer_size: usize,
}

/// Parameters section of a device profile.
///
/// The mode fields carry the integer values of the vendor ABI enumerations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProfileParameters {
    /// Decimation factor.
    pub decimation: u32,
    /// IO port 1 mode (vendor ABI integer value).
    pub port1_mode: i32,
    /// IO port 2 mode (vendor ABI integer value).
    pub port2_mode: i32,
    /// Gain control mode (vendor ABI integer value).
    pub gain_mode: i32,
    /// Manual RF gain in dB.
    pub rf_gain: i32,
    /// Attenuation mode (vendor ABI integer value).
    pub attenuation_mode: i32,
    /// RF input filter mode (vendor ABI integer value).
    pub rf_filter_mode: i32,
    /// Reference level in dBm.
    pub reference_level: f64,
}

/// Tile server statistics JSON schema.
///
/// This schema corresponds to GET requests on `/stats`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TileStats {
    /// Tiles ever downloaded by this server.
    pub total_tiles: u64,
    /// Tiles currently present in the cache.
    pub cached_tiles: u64,
    /// Total bytes written to the cache.
    pub total_size_bytes: u64,
    /// Requests served, cache hits and misses combined.
    pub requests_served: u64,
    /// Running mean download latency in milliseconds.
    pub average_latency_ms: f64,
    /// Requests answered from the cache.
    pub cache_hits: u64,
    /// Requests that required a download.
    pub cache_misses: u64,
}

/// Node metrics push.
///
/// The node core periodically publishes this document for the external node
/// monitor. All usage figures are percentages except where noted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NodeMetrics {
    /// CPU usage percentage.
    pub cpu: f64,
    /// Memory usage percentage.
    pub memory: f64,
    /// Disk usage percentage.
    pub disk: f64,
    /// Network throughput in MB/s.
    pub network: f64,
    /// Signal processing load percentage.
    pub signal_load: f64,
    /// Number of active signals being processed.
    pub active_signals: u64,
    /// Number of queued tasks.
    pub queued_tasks: u64,
    /// Collection time as epoch milliseconds.
    pub timestamp: i64,
}

/// Configuration change event.
///
/// Produced by the external configuration manager and observed by the node
/// core over the event bus.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConfigChangeEvent {
    /// Dotted path of the changed setting.
    pub path: String,
    /// Previous value, serialized.
    pub old_value: String,
    /// New value, serialized.
    pub new_value: String,
    /// User that made the change.
    pub user: String,
    /// Change time as epoch milliseconds.
    pub timestamp: i64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn profile_round_trip() {
        let profile = Profile {
            streaming: ProfileStreaming {
                center_frequency: 915e6,
                bandwidth: 5e6,
                sample_rate: 10e6,
                format: 0,
                enable_time_stamp: true,
                buffer_size: 32768,
            },
            parameters: ProfileParameters {
                decimation: 4,
                port1_mode: 0,
                port2_mode: 0,
                gain_mode: 0,
                rf_gain: 0,
                attenuation_mode: 0,
                rf_filter_mode: 0,
                reference_level: -30.0,
            },
        };
        let json = serde_json::to_string_pretty(&profile).unwrap();
        let parsed: Profile = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, profile);
    }

    #[test]
    fn profile_uses_legacy_keys() {
        let profile = Profile {
            streaming: ProfileStreaming {
                center_frequency: 145.5e6,
                bandwidth: 12.5e3,
                sample_rate: 5e6,
                format: 1,
                enable_time_stamp: false,
                buffer_size: 16384,
            },
            parameters: ProfileParameters {
                decimation: 8,
                port1_mode: 1,
                port2_mode: 4,
                gain_mode: 2,
                rf_gain: -10,
                attenuation_mode: 0,
                rf_filter_mode: 0,
                reference_level: -20.0,
            },
        };
        let json = serde_json::to_string(&profile).unwrap();
        assert!(json.contains("\"centerFrequency\""));
        assert!(json.contains("\"enableTimeStamp\""));
        assert!(json.contains("\"port1Mode\""));
        assert!(json.contains("\"referenceLevel\""));
    }

    #[test]
    fn profile_rejects_unknown_fields() {
        let json = r#"{
            "streaming": {
                "centerFrequency": 915000000.0,
                "bandwidth": 5000000.0,
                "sampleRate": 10000000.0,
                "format": 0,
                "enableTimeStamp": false,
                "bufferSize": 32768,
                "mystery": 1
            },
            "parameters": {
                "decimation": 4,
                "port1Mode": 0,
                "port2Mode": 0,
                "gainMode": 0,
                "rfGain": 0,
                "attenuationMode": 0,
                "rfFilterMode": 0,
                "referenceLevel": -30.0
            }
        }"#;
        assert!(serde_json::from_str::<Profile>(json).is_err());
    }

    #[test]
    fn tile_stats_keys() {
        let stats = TileStats {
            total_tiles: 10,
            cached_tiles: 8,
            total_size_bytes: 123456,
            requests_served: 42,
            average_latency_ms: 17.5,
            cache_hits: 30,
            cache_misses: 12,
        };
        let json = serde_json::to_string(&stats).unwrap();
        for key in [
            "total_tiles",
            "cached_tiles",
            "total_size_bytes",
            "requests_served",
            "average_latency_ms",
            "cache_hits",
            "cache_misses",
        ] {
            assert!(json.contains(&format!("\"{key}\"")), "missing key {key}");
        }
    }
}
