//! BB60-series receiver driver.
//!
//! Implements [`SignalSource`] for the BB60 wideband receivers (9 kHz to
//! 6 GHz, up to 40 MS/s complex I/Q). The driver validates every parameter
//! before the hardware is touched, persists named configuration profiles as
//! JSON files, and ships reproducible use-case presets for the common field
//! configurations.

use crate::device::vendor::{IqConfig, SimVendor, VendorApi, VendorError, BASE_SAMPLE_RATE};
use crate::device::{
    Capabilities, DeviceError, DeviceInfo, DeviceModel, DeviceParams, OperationResult,
    SignalSource,
};
use crate::stream::{
    IqSink, MetricsHandle, SampleFormat, StreamConfig, StreamEngine, StreamingMetrics,
    MAX_BUFFER_SIZE, MIN_BUFFER_SIZE,
};
use regex::Regex;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

/// Valid decimation factors.
pub const VALID_DECIMATIONS: [u32; 14] = [
    1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048, 4096, 8192,
];

/// Lowest tunable frequency in Hz.
pub const MIN_FREQUENCY: f64 = 9.0e3;

/// Highest tunable frequency in Hz.
pub const MAX_FREQUENCY: f64 = 6.0e9;

/// Maximum instantaneous bandwidth in Hz.
pub const MAX_BANDWIDTH: f64 = 27.0e6;

/// Default directory for configuration profiles.
pub const DEFAULT_PROFILE_DIR: &str = "config/bb60_profiles";

/// Returns whether `decimation` is one of the supported powers of two.
pub fn validate_decimation(decimation: u32) -> bool {
    VALID_DECIMATIONS.contains(&decimation)
}

/// Effective sample rate for a decimation factor, if valid.
pub fn sample_rate_for(decimation: u32) -> Option<f64> {
    validate_decimation(decimation).then(|| BASE_SAMPLE_RATE / decimation as f64)
}

/// Closest valid decimation for a target sample rate.
pub fn decimation_for(sample_rate: f64) -> u32 {
    if sample_rate <= 0.0 {
        return 4;
    }
    let target = BASE_SAMPLE_RATE / sample_rate;
    VALID_DECIMATIONS
        .iter()
        .copied()
        .min_by(|a, b| {
            (*a as f64 - target)
                .abs()
                .total_cmp(&(*b as f64 - target).abs())
        })
        .unwrap_or(4)
}

/// Largest bandwidth that the given decimation can carry.
///
/// At no decimation the full 27 MHz front end is available; otherwise the
/// usable bandwidth is 80 % of the effective sample rate.
pub fn max_bandwidth_for(decimation: u32) -> f64 {
    match decimation {
        1 => MAX_BANDWIDTH,
        d => MAX_BANDWIDTH.min(0.8 * BASE_SAMPLE_RATE / d as f64),
    }
}

macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Integer value matching the vendor ABI.
            pub fn wire_value(&self) -> i32 {
                *self as i32
            }

            /// Converts a vendor ABI integer back to the enumeration.
            pub fn from_wire(value: i32) -> Option<$name> {
                match value {
                    $($value => Some($name::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

wire_enum! {
    /// Digital IO port 1 modes. Values match the legacy vendor ABI so
    /// existing field configurations transfer.
    Port1Mode {
        /// Generate a pulse on trigger (default).
        PulseTrigger = 0,
        /// Generate a pulse on frame sync.
        FrameSync = 1,
        /// Direct device IO control.
        DeviceIo = 2,
        /// External reference input.
        ExternalReference = 3,
    }
}

wire_enum! {
    /// Digital IO port 2 modes. Values match the legacy vendor ABI.
    Port2Mode {
        /// External trigger input (default).
        TriggerInput = 0,
        /// Direct device IO control.
        DeviceIo = 4,
        /// 10 MHz output reference.
        OutputReference = 6,
    }
}

wire_enum! {
    /// Gain control modes.
    GainMode {
        /// Automatic gain control (default).
        Auto = 0,
        /// Manual gain control.
        Manual = 1,
        /// Fast attack AGC.
        FastAttack = 2,
        /// Slow attack AGC.
        SlowAttack = 3,
    }
}

wire_enum! {
    /// RF attenuation settings.
    Attenuation {
        /// Automatic attenuation (default).
        Auto = 0,
        /// Low attenuation.
        Low = 1,
        /// Medium attenuation.
        Medium = 2,
        /// High attenuation.
        High = 3,
    }
}

wire_enum! {
    /// RF input filter modes.
    RfFilterMode {
        /// Automatic filter selection (default).
        Auto = 0,
        /// Force the low frequency filter.
        LowFreq = 1,
        /// Force the high frequency filter.
        HighFreq = 2,
    }
}

/// BB60-specific device parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Bb60Params {
    /// Decimation factor; controls the effective sample rate.
    pub decimation: u32,
    /// Digital IO port 1 mode.
    pub port1_mode: Port1Mode,
    /// Digital IO port 2 mode.
    pub port2_mode: Port2Mode,
    /// Gain control mode.
    pub gain_mode: GainMode,
    /// Manual RF gain in dB, used in manual gain mode only.
    pub rf_gain: i32,
    /// RF attenuation mode.
    pub attenuation: Attenuation,
    /// RF input filter mode.
    pub rf_filter: RfFilterMode,
    /// Reference level in dBm.
    pub reference_level: f64,
}

impl Default for Bb60Params {
    fn default() -> Bb60Params {
        Bb60Params {
            // 10 MS/s default
            decimation: 4,
            port1_mode: Port1Mode::PulseTrigger,
            port2_mode: Port2Mode::TriggerInput,
            gain_mode: GainMode::Auto,
            rf_gain: 0,
            attenuation: Attenuation::Auto,
            rf_filter: RfFilterMode::Auto,
            reference_level: -20.0,
        }
    }
}

/// Use-case presets for [`Bb60Device::optimize_for`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum UseCase {
    /// Maximum sensitivity: narrow bandwidth, low attenuation.
    Sensitivity,
    /// Maximum sample rate and bandwidth.
    Speed,
    /// Balance of sample rate and processing load.
    Balanced,
    /// TDOA direction finding: time stamping on, moderate bandwidth.
    Tdoa,
}

impl std::str::FromStr for UseCase {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<UseCase, DeviceError> {
        match s {
            "sensitivity" => Ok(UseCase::Sensitivity),
            "speed" => Ok(UseCase::Speed),
            "balanced" => Ok(UseCase::Balanced),
            "tdoa" => Ok(UseCase::Tdoa),
            other => Err(DeviceError::InvalidParameter(format!(
                "unknown use case: {other}"
            ))),
        }
    }
}

fn profile_name_valid(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9_.-]+$").expect("profile name pattern")
    });
    pattern.is_match(name)
}

fn bb60_capabilities() -> Capabilities {
    Capabilities {
        min_frequency: MIN_FREQUENCY,
        max_frequency: MAX_FREQUENCY,
        max_bandwidth: MAX_BANDWIDTH,
        max_sample_rate: BASE_SAMPLE_RATE,
        supported_formats: vec![SampleFormat::F32c, SampleFormat::I16c],
        time_stamping: true,
        trigger_io: true,
    }
}

/// BB60 receiver.
///
/// Wraps a vendor backend ([`VendorApi`]) and owns the streaming engine while
/// a stream is active. Without the `vendor-bb60` feature the backend is the
/// synthetic source, which keeps the whole driver exercisable off-line.
pub struct Bb60Device {
    vendor: Arc<dyn VendorApi>,
    params: Bb60Params,
    config: StreamConfig,
    engine: Option<StreamEngine>,
    metrics: MetricsHandle,
    profile_dir: PathBuf,
    gps_offset_ns: Option<i64>,
}

impl Bb60Device {
    /// Creates a driver over the default vendor backend.
    pub fn new() -> Bb60Device {
        #[cfg(feature = "vendor-bb60")]
        let vendor: Arc<dyn VendorApi> =
            Arc::new(crate::device::vendor::ffi::FfiVendor::new());
        #[cfg(not(feature = "vendor-bb60"))]
        let vendor: Arc<dyn VendorApi> = Arc::new(SimVendor::new());
        Bb60Device::with_vendor(vendor)
    }

    /// Creates a driver over an explicit vendor backend.
    pub fn with_vendor(vendor: Arc<dyn VendorApi>) -> Bb60Device {
        Bb60Device {
            vendor,
            params: Bb60Params::default(),
            config: StreamConfig::default(),
            engine: None,
            metrics: MetricsHandle::new(),
            profile_dir: PathBuf::from(DEFAULT_PROFILE_DIR),
            gps_offset_ns: None,
        }
    }

    /// Sets the directory where profiles are stored.
    pub fn set_profile_dir(&mut self, dir: impl Into<PathBuf>) {
        self.profile_dir = dir.into();
    }

    /// Currently applied device parameters.
    pub fn params(&self) -> &Bb60Params {
        &self.params
    }

    /// Currently applied streaming configuration.
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Shared handle to the streaming counters.
    ///
    /// The handle stays valid across stream restarts.
    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics.clone()
    }

    /// Installs an established CPU to GPS offset in nanoseconds.
    ///
    /// Buffers of streams started with time stamping enabled carry this
    /// offset; without it timestamps fall back to the monotonic system time.
    pub fn install_gps_offset(&mut self, offset_ns: i64) {
        self.gps_offset_ns = Some(offset_ns);
    }

    fn ensure_open(&self) -> OperationResult {
        if self.vendor.is_open() {
            Ok(())
        } else {
            Err(DeviceError::NotOpen)
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> OperationResult {
        if self.engine.is_some() {
            Err(DeviceError::InvalidState(operation))
        } else {
            Ok(())
        }
    }

    fn validate_params(params: &Bb60Params) -> OperationResult {
        if !validate_decimation(params.decimation) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid decimation value: {}",
                params.decimation
            )));
        }
        if !(-130.0..=20.0).contains(&params.reference_level) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid reference level: {} dBm",
                params.reference_level
            )));
        }
        if params.gain_mode == GainMode::Manual && !(-30..=30).contains(&params.rf_gain) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid RF gain: {} dB",
                params.rf_gain
            )));
        }
        Ok(())
    }

    fn validate_stream_config(&self, config: &StreamConfig) -> OperationResult {
        if !(MIN_FREQUENCY..=MAX_FREQUENCY).contains(&config.center_frequency) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid center frequency: {} Hz",
                config.center_frequency
            )));
        }
        if config.bandwidth <= 0.0 || config.bandwidth > MAX_BANDWIDTH {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid bandwidth: {} Hz",
                config.bandwidth
            )));
        }
        if config.bandwidth > max_bandwidth_for(self.params.decimation) {
            return Err(DeviceError::InvalidParameter(format!(
                "bandwidth {} Hz exceeds the maximum for decimation {}",
                config.bandwidth, self.params.decimation
            )));
        }
        let expected_rate = BASE_SAMPLE_RATE / self.params.decimation as f64;
        if (config.sample_rate - expected_rate).abs() > 1.0 {
            return Err(DeviceError::InvalidParameter(format!(
                "sample rate {} does not match decimation {} (expected {})",
                config.sample_rate, self.params.decimation, expected_rate
            )));
        }
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&config.buffer_size) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid buffer size: {}",
                config.buffer_size
            )));
        }
        Ok(())
    }

    fn map_vendor(error: VendorError) -> DeviceError {
        match error {
            VendorError::DeviceClosed => DeviceError::NotOpen,
            VendorError::NotFound => DeviceError::NotFound,
            VendorError::Timeout | VendorError::Api(_) => {
                DeviceError::Hardware(error.to_string())
            }
        }
    }

    fn profile_path(&self, name: &str) -> Result<PathBuf, DeviceError> {
        if !profile_name_valid(name) {
            return Err(DeviceError::InvalidParameter(format!(
                "invalid profile name: {name:?}"
            )));
        }
        Ok(self.profile_dir.join(format!("{name}.json")))
    }

    /// Saves the currently applied configuration under a profile name.
    pub fn save_profile(&self, name: &str) -> OperationResult {
        let path = self.profile_path(name)?;
        let profile = tdoa_json::Profile {
            streaming: tdoa_json::ProfileStreaming {
                center_frequency: self.config.center_frequency,
                bandwidth: self.config.bandwidth,
                sample_rate: self.config.sample_rate,
                format: self.config.format.wire_value(),
                enable_time_stamp: self.config.enable_time_stamp,
                buffer_size: self.config.buffer_size,
            },
            parameters: tdoa_json::ProfileParameters {
                decimation: self.params.decimation,
                port1_mode: self.params.port1_mode.wire_value(),
                port2_mode: self.params.port2_mode.wire_value(),
                gain_mode: self.params.gain_mode.wire_value(),
                rf_gain: self.params.rf_gain,
                attenuation_mode: self.params.attenuation.wire_value(),
                rf_filter_mode: self.params.rf_filter.wire_value(),
                reference_level: self.params.reference_level,
            },
        };
        std::fs::create_dir_all(&self.profile_dir)
            .map_err(|e| DeviceError::Internal(format!("profile dir: {e}")))?;
        let json = serde_json::to_string_pretty(&profile)
            .map_err(|e| DeviceError::Internal(format!("profile encode: {e}")))?;
        std::fs::write(path, json)
            .map_err(|e| DeviceError::Internal(format!("profile write: {e}")))?;
        Ok(())
    }

    /// Loads a profile, validates it and re-applies it to the device.
    pub fn load_profile(&mut self, name: &str) -> OperationResult {
        self.ensure_open()?;
        let path = self.profile_path(name)?;
        let json = std::fs::read_to_string(&path).map_err(|_| {
            DeviceError::InvalidParameter(format!("profile not found: {name}"))
        })?;
        let profile: tdoa_json::Profile = serde_json::from_str(&json)
            .map_err(|e| DeviceError::Internal(format!("unreadable profile {name}: {e}")))?;
        let format = SampleFormat::from_wire(profile.streaming.format).ok_or_else(|| {
            DeviceError::InvalidParameter(format!(
                "unknown sample format in profile: {}",
                profile.streaming.format
            ))
        })?;
        let params = Bb60Params {
            decimation: profile.parameters.decimation,
            port1_mode: Port1Mode::from_wire(profile.parameters.port1_mode).ok_or_else(
                || DeviceError::InvalidParameter("unknown port 1 mode".to_string()),
            )?,
            port2_mode: Port2Mode::from_wire(profile.parameters.port2_mode).ok_or_else(
                || DeviceError::InvalidParameter("unknown port 2 mode".to_string()),
            )?,
            gain_mode: GainMode::from_wire(profile.parameters.gain_mode).ok_or_else(
                || DeviceError::InvalidParameter("unknown gain mode".to_string()),
            )?,
            rf_gain: profile.parameters.rf_gain,
            attenuation: Attenuation::from_wire(profile.parameters.attenuation_mode)
                .ok_or_else(|| {
                    DeviceError::InvalidParameter("unknown attenuation mode".to_string())
                })?,
            rf_filter: RfFilterMode::from_wire(profile.parameters.rf_filter_mode)
                .ok_or_else(|| {
                    DeviceError::InvalidParameter("unknown RF filter mode".to_string())
                })?,
            reference_level: profile.parameters.reference_level,
        };
        let config = StreamConfig {
            center_frequency: profile.streaming.center_frequency,
            bandwidth: profile.streaming.bandwidth,
            sample_rate: profile.streaming.sample_rate,
            format,
            enable_time_stamp: profile.streaming.enable_time_stamp,
            buffer_size: profile.streaming.buffer_size,
        };
        self.apply_params(&DeviceParams::Bb60(params))?;
        self.configure_stream(&config)
    }

    /// Deletes a profile.
    pub fn delete_profile(&self, name: &str) -> OperationResult {
        let path = self.profile_path(name)?;
        if !path.exists() {
            return Err(DeviceError::InvalidParameter(format!(
                "profile not found: {name}"
            )));
        }
        std::fs::remove_file(path)
            .map_err(|e| DeviceError::Internal(format!("profile delete: {e}")))
    }

    /// Lists the available profile names.
    pub fn list_profiles(&self) -> Vec<String> {
        let mut profiles = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.profile_dir) else {
            return profiles;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    profiles.push(stem.to_string());
                }
            }
        }
        profiles.sort();
        profiles
    }

    /// Applies a reproducible combined parameter and stream snapshot for a
    /// use case. The center frequency is kept from the current configuration.
    pub fn optimize_for(&mut self, use_case: UseCase) -> OperationResult {
        self.ensure_open()?;
        let mut params = Bb60Params::default();
        let mut config = StreamConfig {
            center_frequency: self.config.center_frequency,
            ..StreamConfig::default()
        };
        match use_case {
            UseCase::Sensitivity => {
                params.gain_mode = GainMode::Auto;
                params.attenuation = Attenuation::Low;
                params.reference_level = -50.0;
                params.decimation = 16;
                config.bandwidth = 1.0e6;
                config.buffer_size = 32768;
            }
            UseCase::Speed => {
                params.gain_mode = GainMode::FastAttack;
                params.attenuation = Attenuation::Auto;
                params.reference_level = -20.0;
                params.decimation = 1;
                config.bandwidth = 27.0e6;
                config.buffer_size = 65536;
            }
            UseCase::Balanced => {
                params.gain_mode = GainMode::Auto;
                params.attenuation = Attenuation::Auto;
                params.reference_level = -30.0;
                params.decimation = 4;
                config.bandwidth = 5.0e6;
                config.buffer_size = 32768;
            }
            UseCase::Tdoa => {
                params.gain_mode = GainMode::FastAttack;
                params.attenuation = Attenuation::Auto;
                params.reference_level = -30.0;
                params.decimation = 8;
                config.bandwidth = 2.5e6;
                config.enable_time_stamp = true;
                config.buffer_size = 32768;
            }
        }
        config.sample_rate = BASE_SAMPLE_RATE / params.decimation as f64;
        self.apply_params(&DeviceParams::Bb60(params))?;
        self.configure_stream(&config)
    }
}

impl Default for Bb60Device {
    fn default() -> Bb60Device {
        Bb60Device::new()
    }
}

impl std::fmt::Debug for Bb60Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bb60Device")
            .field("open", &self.vendor.is_open())
            .field("streaming", &self.engine.is_some())
            .field("params", &self.params)
            .field("config", &self.config)
            .finish()
    }
}

impl SignalSource for Bb60Device {
    fn enumerate(&self) -> Vec<DeviceInfo> {
        self.vendor
            .device_list()
            .into_iter()
            .map(|serial| DeviceInfo {
                serial,
                model: DeviceModel::Bb60c,
                firmware: String::new(),
                capabilities: bb60_capabilities(),
            })
            .collect()
    }

    fn open(&mut self, serial: Option<&str>) -> OperationResult {
        if self.vendor.is_open() {
            return Err(DeviceError::InvalidState("device already open"));
        }
        self.vendor.open(serial).map_err(Self::map_vendor)?;
        // Preset so the reported state matches the documented defaults.
        self.vendor.preset().map_err(Self::map_vendor)?;
        self.params = Bb60Params::default();
        self.config = StreamConfig::default();
        self.metrics.reset();
        tracing::info!(serial = ?serial, "BB60 device opened");
        Ok(())
    }

    fn close(&mut self) -> OperationResult {
        self.ensure_open()?;
        if let Some(engine) = self.engine.take() {
            engine.stop();
        }
        self.vendor.close();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.vendor.is_open()
    }

    fn info(&self) -> Result<DeviceInfo, DeviceError> {
        self.ensure_open()?;
        Ok(DeviceInfo {
            serial: self.vendor.serial_number().map_err(Self::map_vendor)?,
            model: DeviceModel::Bb60c,
            firmware: self.vendor.firmware_version().map_err(Self::map_vendor)?,
            capabilities: bb60_capabilities(),
        })
    }

    fn apply_params(&mut self, params: &DeviceParams) -> OperationResult {
        self.ensure_open()?;
        self.ensure_idle("cannot change parameters while streaming")?;
        let DeviceParams::Bb60(params) = params;
        Self::validate_params(params)?;
        self.vendor
            .configure_io(params.port1_mode.wire_value(), params.port2_mode.wire_value())
            .map_err(Self::map_vendor)?;
        self.params = params.clone();
        Ok(())
    }

    fn configure_stream(&mut self, config: &StreamConfig) -> OperationResult {
        self.ensure_open()?;
        self.ensure_idle("cannot reconfigure while streaming")?;
        self.validate_stream_config(config)?;
        self.vendor
            .configure_iq(&IqConfig {
                center_freq: config.center_frequency,
                decimation: self.params.decimation,
                bandwidth: config.bandwidth,
                use_float: config.format == SampleFormat::F32c,
            })
            .map_err(Self::map_vendor)?;
        self.config = config.clone();
        Ok(())
    }

    fn start_stream(&mut self, sink: Box<dyn IqSink>) -> OperationResult {
        self.ensure_open()?;
        self.ensure_idle("streaming already active")?;
        self.vendor.initiate_streaming().map_err(Self::map_vendor)?;
        self.metrics.reset();
        let gps_offset = if self.config.enable_time_stamp {
            self.gps_offset_ns
        } else {
            None
        };
        self.engine = Some(StreamEngine::start(
            self.vendor.clone(),
            self.config.clone(),
            gps_offset,
            sink,
            self.metrics.clone(),
        ));
        Ok(())
    }

    fn stop_stream(&mut self) -> OperationResult {
        self.ensure_open()?;
        if let Some(engine) = self.engine.take() {
            engine.stop();
            self.vendor.abort().map_err(Self::map_vendor)?;
        }
        Ok(())
    }

    fn metrics(&self) -> StreamingMetrics {
        self.metrics.snapshot()
    }

    fn reset(&mut self) -> OperationResult {
        self.ensure_open()?;
        if let Some(engine) = self.engine.take() {
            engine.stop();
        }
        self.vendor.preset().map_err(Self::map_vendor)?;
        self.params = Bb60Params::default();
        self.config = StreamConfig::default();
        self.metrics.reset();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::path::Path;
    use std::sync::Mutex;
    use std::time::Duration;

    fn open_device(dir: &Path) -> Bb60Device {
        let mut device = Bb60Device::with_vendor(Arc::new(SimVendor::new()));
        device.set_profile_dir(dir);
        device.open(None).unwrap();
        device
    }

    #[test]
    fn decimation_set() {
        for d in VALID_DECIMATIONS {
            assert!(validate_decimation(d));
        }
        for d in [0, 3, 5, 6, 7, 9, 100, 16384] {
            assert!(!validate_decimation(d));
        }
        assert_eq!(sample_rate_for(8), Some(5.0e6));
        assert_eq!(sample_rate_for(1), Some(40.0e6));
        assert_eq!(sample_rate_for(3), None);
    }

    #[test]
    fn decimation_for_target_rate() {
        assert_eq!(decimation_for(40.0e6), 1);
        assert_eq!(decimation_for(10.0e6), 4);
        assert_eq!(decimation_for(5.0e6), 8);
        assert_eq!(decimation_for(0.0), 4);
    }

    #[test]
    fn operations_require_open_device() {
        let mut device = Bb60Device::with_vendor(Arc::new(SimVendor::new()));
        assert!(matches!(device.info(), Err(DeviceError::NotOpen)));
        assert!(matches!(
            device.configure_stream(&StreamConfig::default()),
            Err(DeviceError::NotOpen)
        ));
        assert!(matches!(
            device.optimize_for(UseCase::Tdoa),
            Err(DeviceError::NotOpen)
        ));
    }

    #[test]
    fn rejects_invalid_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        let bad_decimation = Bb60Params {
            decimation: 3,
            ..Default::default()
        };
        assert!(matches!(
            device.apply_params(&DeviceParams::Bb60(bad_decimation)),
            Err(DeviceError::InvalidParameter(_))
        ));
        let bad_ref = Bb60Params {
            reference_level: 30.0,
            ..Default::default()
        };
        assert!(device.apply_params(&DeviceParams::Bb60(bad_ref)).is_err());
        let bad_gain = Bb60Params {
            gain_mode: GainMode::Manual,
            rf_gain: 40,
            ..Default::default()
        };
        assert!(device.apply_params(&DeviceParams::Bb60(bad_gain)).is_err());
        // Manual gain inside the range is accepted.
        let good_gain = Bb60Params {
            gain_mode: GainMode::Manual,
            rf_gain: 15,
            ..Default::default()
        };
        device
            .apply_params(&DeviceParams::Bb60(good_gain))
            .unwrap();
    }

    #[test]
    fn rejects_invalid_stream_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        let bad_center = StreamConfig {
            center_frequency: 7.0e9,
            ..Default::default()
        };
        assert!(device.configure_stream(&bad_center).is_err());
        let bad_bandwidth = StreamConfig {
            bandwidth: 30.0e6,
            ..Default::default()
        };
        assert!(device.configure_stream(&bad_bandwidth).is_err());
        let bad_buffer = StreamConfig {
            buffer_size: 100,
            ..Default::default()
        };
        assert!(device.configure_stream(&bad_buffer).is_err());
        let rate_mismatch = StreamConfig {
            sample_rate: 5.0e6,
            ..Default::default()
        };
        // Device decimation is 4, so 5 MS/s does not match.
        assert!(device.configure_stream(&rate_mismatch).is_err());
    }

    #[test]
    fn tdoa_preset_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        device.optimize_for(UseCase::Tdoa).unwrap();
        assert_eq!(device.params().decimation, 8);
        assert_eq!(device.params().gain_mode, GainMode::FastAttack);
        assert_eq!(device.params().reference_level, -30.0);
        assert_eq!(device.config().bandwidth, 2.5e6);
        assert_eq!(device.config().sample_rate, 5.0e6);
        assert!(device.config().enable_time_stamp);
        assert_eq!(device.config().buffer_size, 32768);
    }

    #[test]
    fn speed_preset_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        device.optimize_for(UseCase::Speed).unwrap();
        assert_eq!(device.params().decimation, 1);
        assert_eq!(device.config().bandwidth, 27.0e6);
        assert_eq!(device.config().sample_rate, 40.0e6);
        assert_eq!(device.config().buffer_size, 65536);
    }

    #[test]
    fn profile_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        device.optimize_for(UseCase::Tdoa).unwrap();
        device.save_profile("tdoa_field").unwrap();
        let saved = std::fs::read_to_string(dir.path().join("tdoa_field.json")).unwrap();

        // Change everything, then load the profile back.
        device.optimize_for(UseCase::Speed).unwrap();
        device.load_profile("tdoa_field").unwrap();
        assert_eq!(device.params().decimation, 8);
        assert_eq!(device.config().bandwidth, 2.5e6);

        // Saving again reproduces the file byte for byte.
        device.save_profile("tdoa_field").unwrap();
        let resaved = std::fs::read_to_string(dir.path().join("tdoa_field.json")).unwrap();
        assert_eq!(saved, resaved);
    }

    #[test]
    fn profile_names_validated() {
        let dir = tempfile::tempdir().unwrap();
        let device = open_device(dir.path());
        assert!(matches!(
            device.save_profile("../escape"),
            Err(DeviceError::InvalidParameter(_))
        ));
        assert!(device.save_profile("").is_err());
        assert!(device.save_profile("has space").is_err());
        device.save_profile("ok-name_1.2").unwrap();
    }

    #[test]
    fn list_and_delete_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let device = open_device(dir.path());
        device.save_profile("alpha").unwrap();
        device.save_profile("beta").unwrap();
        assert_eq!(device.list_profiles(), ["alpha", "beta"]);
        device.delete_profile("alpha").unwrap();
        assert_eq!(device.list_profiles(), ["beta"]);
        assert!(device.delete_profile("alpha").is_err());
    }

    #[test]
    fn streaming_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        device.optimize_for(UseCase::Balanced).unwrap();
        let received: Arc<Mutex<u64>> = Arc::new(Mutex::new(0));
        let sink_received = received.clone();
        device
            .start_stream(Box::new(move |_buffer: &crate::stream::IqBuffer| {
                *sink_received.lock().unwrap() += 1;
            }))
            .unwrap();
        // Reconfiguration is rejected while streaming.
        assert!(matches!(
            device.configure_stream(&StreamConfig::default()),
            Err(DeviceError::InvalidState(_))
        ));
        assert!(matches!(
            device.start_stream(Box::new(|_: &crate::stream::IqBuffer| {})),
            Err(DeviceError::InvalidState(_))
        ));
        std::thread::sleep(Duration::from_millis(50));
        device.stop_stream().unwrap();
        let callbacks = *received.lock().unwrap();
        assert!(callbacks > 0);
        let metrics = device.metrics();
        assert_eq!(metrics.callback_count, callbacks);
        assert_eq!(metrics.dropped_buffers, 0);
        // Stopping again is a no-op.
        device.stop_stream().unwrap();
    }

    #[test]
    fn reset_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = open_device(dir.path());
        device.optimize_for(UseCase::Speed).unwrap();
        device.reset().unwrap();
        assert_eq!(device.params(), &Bb60Params::default());
        assert_eq!(device.config(), &StreamConfig::default());
    }
}
