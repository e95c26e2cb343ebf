//! Signal source abstraction.
//!
//! This module defines the hardware-agnostic receiver interface
//! ([`SignalSource`]), device descriptions and capabilities, the operation
//! error taxonomy, and a name-keyed factory registry so that callers can
//! instantiate receivers without depending on a concrete driver.

use crate::stream::{IqSink, SampleFormat, StreamConfig, StreamingMetrics};
use std::collections::HashMap;
use thiserror::Error;

pub mod bb60;
pub mod vendor;

/// Errors returned by device operations.
///
/// Every driver translates its vendor library errors into one of these kinds
/// before returning; raw vendor codes never cross the module boundary.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// No matching device is connected.
    #[error("device not found")]
    NotFound,
    /// The operation requires an open device.
    #[error("device not open")]
    NotOpen,
    /// An input failed validation; hardware was not touched.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    /// The operation is not legal in the current state, for example
    /// reconfiguring while streaming.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// The vendor library reported a hardware failure.
    #[error("hardware error: {0}")]
    Hardware(String),
    /// An internal failure such as unreadable profile storage.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for device operations that return no value.
pub type OperationResult = Result<(), DeviceError>;

/// Receiver model.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DeviceModel {
    /// BB60A receiver.
    Bb60a,
    /// BB60C receiver.
    Bb60c,
    /// BB60D receiver.
    Bb60d,
    /// No or unknown model.
    None,
}

impl DeviceModel {
    /// Human-readable model name.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceModel::Bb60a => "BB60A",
            DeviceModel::Bb60c => "BB60C",
            DeviceModel::Bb60d => "BB60D",
            DeviceModel::None => "None",
        }
    }
}

/// Constant capabilities of a device.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    /// Lowest tunable frequency in Hz.
    pub min_frequency: f64,
    /// Highest tunable frequency in Hz.
    pub max_frequency: f64,
    /// Maximum instantaneous bandwidth in Hz.
    pub max_bandwidth: f64,
    /// Maximum sample rate in complex samples per second.
    pub max_sample_rate: f64,
    /// Sample formats the device can deliver.
    pub supported_formats: Vec<SampleFormat>,
    /// Whether the device supports GPS time stamping.
    pub time_stamping: bool,
    /// Whether the device exposes trigger IO ports.
    pub trigger_io: bool,
}

/// Description of a connected device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceInfo {
    /// Device serial number.
    pub serial: String,
    /// Device model.
    pub model: DeviceModel,
    /// Firmware version string.
    pub firmware: String,
    /// Constant capabilities for this serial.
    pub capabilities: Capabilities,
}

/// Device-specific parameter bundles.
///
/// Each driver accepts only its own variant; applying a bundle of the wrong
/// kind fails with [`DeviceError::InvalidParameter`] without touching
/// hardware.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceParams {
    /// Parameters for the BB60 family.
    Bb60(bb60::Bb60Params),
}

/// Hardware-agnostic receiver interface.
///
/// Apart from [`metrics`](SignalSource::metrics) and
/// [`is_open`](SignalSource::is_open), operations are not re-entrant on a
/// single handle; attempts to reconfigure while streaming fail with
/// [`DeviceError::InvalidState`].
pub trait SignalSource: Send {
    /// Lists the connected devices of this kind.
    fn enumerate(&self) -> Vec<DeviceInfo>;

    /// Opens a device, by serial number or the first one found.
    ///
    /// Opening physical hardware blocks for around three seconds; it is only
    /// interruptible by a process signal.
    fn open(&mut self, serial: Option<&str>) -> OperationResult;

    /// Closes the device, stopping any active stream.
    fn close(&mut self) -> OperationResult;

    /// Whether the device is open.
    fn is_open(&self) -> bool;

    /// Returns the device description. Valid only when open.
    fn info(&self) -> Result<DeviceInfo, DeviceError>;

    /// Validates and applies device-specific parameters.
    fn apply_params(&mut self, params: &DeviceParams) -> OperationResult;

    /// Validates and applies a streaming configuration.
    fn configure_stream(&mut self, config: &StreamConfig) -> OperationResult;

    /// Starts streaming into the given sink.
    fn start_stream(&mut self, sink: Box<dyn IqSink>) -> OperationResult;

    /// Stops streaming. A no-op if no stream is active.
    fn stop_stream(&mut self) -> OperationResult;

    /// Returns a snapshot of the streaming counters.
    fn metrics(&self) -> StreamingMetrics;

    /// Resets the device to its documented default state.
    fn reset(&mut self) -> OperationResult;
}

type DeviceCtor = fn() -> Box<dyn SignalSource>;

/// Factory registry mapping type names to device constructors.
///
/// Lookups are case-insensitive. Unknown names yield no device rather than an
/// error, so callers can probe for optional hardware support.
#[derive(Default)]
pub struct DeviceRegistry {
    ctors: HashMap<String, DeviceCtor>,
    names: Vec<String>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> DeviceRegistry {
        DeviceRegistry::default()
    }

    /// Creates a registry with the built-in device types registered.
    pub fn with_builtin() -> DeviceRegistry {
        let mut registry = DeviceRegistry::new();
        registry.register("BB60C", || Box::new(bb60::Bb60Device::new()));
        registry
    }

    /// Registers a device type under a name.
    ///
    /// Re-registering a name replaces the previous constructor.
    pub fn register(&mut self, name: &str, ctor: DeviceCtor) {
        let key = name.to_ascii_lowercase();
        if self.ctors.insert(key, ctor).is_none() {
            self.names.push(name.to_string());
        }
    }

    /// Creates a device by type name, or `None` for unknown names.
    pub fn create(&self, name: &str) -> Option<Box<dyn SignalSource>> {
        self.ctors.get(&name.to_ascii_lowercase()).map(|ctor| ctor())
    }

    /// Whether a type name is registered.
    pub fn is_supported(&self, name: &str) -> bool {
        self.ctors.contains_key(&name.to_ascii_lowercase())
    }

    /// Lists the registered type names.
    pub fn supported_types(&self) -> &[String] {
        &self.names
    }
}
