//! Vendor receiver ABI seam.
//!
//! The BB60 family is reached through a vendor C library. This module keeps
//! that surface behind the [`VendorApi`] trait so the driver and the
//! streaming engine never see raw status codes. The default backend is
//! [`SimVendor`], a deterministic synthetic source that paces itself at the
//! configured sample rate; the real library is linked when the `vendor-bb60`
//! feature is enabled.

use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// I/Q front-end configuration passed to the vendor library.
#[derive(Debug, Clone, PartialEq)]
pub struct IqConfig {
    /// Center frequency in Hz.
    pub center_freq: f64,
    /// Downsample factor from the 40 MS/s base rate.
    pub decimation: u32,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Deliver float32 samples instead of int16.
    pub use_float: bool,
}

impl Default for IqConfig {
    fn default() -> IqConfig {
        IqConfig {
            center_freq: 100.0e6,
            decimation: 4,
            bandwidth: 5.0e6,
            use_float: true,
        }
    }
}

/// Outcome of one raw fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    /// Complex samples written into the caller's buffer.
    pub samples: usize,
    /// Whether the device reported an internal sample break.
    pub sample_loss: bool,
    /// Trigger positions as sample indices, ordered and distinct.
    pub triggers: Vec<usize>,
}

/// Errors surfaced by a vendor backend.
#[derive(Error, Debug)]
pub enum VendorError {
    /// The device is closed; streaming loops terminate on this.
    #[error("device not open")]
    DeviceClosed,
    /// No device is connected.
    #[error("no device available")]
    NotFound,
    /// A USB transfer timed out; callers retry.
    #[error("transfer timeout")]
    Timeout,
    /// Any other vendor library failure.
    #[error("vendor API error: {0}")]
    Api(String),
}

/// Raw vendor library surface.
///
/// Methods take `&self`; implementations synchronize internally because the
/// streaming engine fetches from a dedicated producer thread while the driver
/// may concurrently query serial or firmware information.
pub trait VendorApi: Send + Sync {
    /// Opens a device, by serial number or the first one found.
    fn open(&self, serial: Option<&str>) -> Result<(), VendorError>;
    /// Closes the device.
    fn close(&self);
    /// Whether a device is open.
    fn is_open(&self) -> bool;
    /// Resets the device to its power-on defaults.
    fn preset(&self) -> Result<(), VendorError>;
    /// Serial number of the open device.
    fn serial_number(&self) -> Result<String, VendorError>;
    /// Firmware version of the open device.
    fn firmware_version(&self) -> Result<String, VendorError>;
    /// Serial numbers of all connected devices.
    fn device_list(&self) -> Vec<String>;
    /// Applies the I/Q front-end configuration.
    fn configure_iq(&self, config: &IqConfig) -> Result<(), VendorError>;
    /// Wires the two digital IO ports. Values are the vendor ABI integers.
    fn configure_io(&self, port1: i32, port2: i32) -> Result<(), VendorError>;
    /// Puts the device into I/Q streaming mode.
    fn initiate_streaming(&self) -> Result<(), VendorError>;
    /// Aborts the current measurement mode.
    fn abort(&self) -> Result<(), VendorError>;
    /// Fetches interleaved float32 I/Q pairs into `data`.
    fn fetch_f32(&self, data: &mut [f32]) -> Result<FetchResult, VendorError>;
    /// Fetches interleaved int16 I/Q pairs into `data`.
    fn fetch_i16(&self, data: &mut [i16]) -> Result<FetchResult, VendorError>;
}

/// Base sample rate of the BB60 family in complex samples per second.
pub const BASE_SAMPLE_RATE: f64 = 40.0e6;

#[derive(Debug)]
struct SimState {
    open: bool,
    streaming: bool,
    config: IqConfig,
    phase: f64,
}

/// Deterministic synthetic receiver.
///
/// Generates a complex tone at five percent of the effective sample rate and
/// paces each fetch so that delivery matches the configured rate. Used for
/// tests and for running the node without hardware attached.
#[derive(Debug)]
pub struct SimVendor {
    state: Mutex<SimState>,
    serial: String,
}

impl Default for SimVendor {
    fn default() -> SimVendor {
        SimVendor::new()
    }
}

impl SimVendor {
    /// Creates a closed synthetic receiver.
    pub fn new() -> SimVendor {
        SimVendor {
            state: Mutex::new(SimState {
                open: false,
                streaming: false,
                config: IqConfig::default(),
                phase: 0.0,
            }),
            serial: "SIM60-0001".to_string(),
        }
    }

    fn fetch(
        &self,
        samples: usize,
        mut write: impl FnMut(usize, f32, f32),
    ) -> Result<FetchResult, VendorError> {
        let (rate, phase0, step);
        {
            let mut state = self.state.lock().unwrap();
            if !state.open {
                return Err(VendorError::DeviceClosed);
            }
            if !state.streaming {
                return Err(VendorError::Api("not in streaming mode".to_string()));
            }
            rate = BASE_SAMPLE_RATE / state.config.decimation as f64;
            step = 2.0 * std::f64::consts::PI * 0.05;
            phase0 = state.phase;
            state.phase = (state.phase + step * samples as f64)
                % (2.0 * std::f64::consts::PI);
        }
        for n in 0..samples {
            let phase = phase0 + step * n as f64;
            write(n, phase.cos() as f32, phase.sin() as f32);
        }
        // Pace delivery at the effective sample rate.
        std::thread::sleep(Duration::from_secs_f64(samples as f64 / rate));
        Ok(FetchResult {
            samples,
            sample_loss: false,
            triggers: Vec::new(),
        })
    }
}

impl VendorApi for SimVendor {
    fn open(&self, serial: Option<&str>) -> Result<(), VendorError> {
        let mut state = self.state.lock().unwrap();
        if state.open {
            return Err(VendorError::Api("device already open".to_string()));
        }
        if let Some(serial) = serial {
            if serial != self.serial {
                return Err(VendorError::NotFound);
            }
        }
        state.open = true;
        Ok(())
    }

    fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.open = false;
        state.streaming = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    fn preset(&self) -> Result<(), VendorError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(VendorError::DeviceClosed);
        }
        state.streaming = false;
        state.config = IqConfig::default();
        state.phase = 0.0;
        Ok(())
    }

    fn serial_number(&self) -> Result<String, VendorError> {
        if !self.is_open() {
            return Err(VendorError::DeviceClosed);
        }
        Ok(self.serial.clone())
    }

    fn firmware_version(&self) -> Result<String, VendorError> {
        if !self.is_open() {
            return Err(VendorError::DeviceClosed);
        }
        Ok("sim-1.0".to_string())
    }

    fn device_list(&self) -> Vec<String> {
        vec![self.serial.clone()]
    }

    fn configure_iq(&self, config: &IqConfig) -> Result<(), VendorError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(VendorError::DeviceClosed);
        }
        state.config = config.clone();
        Ok(())
    }

    fn configure_io(&self, _port1: i32, _port2: i32) -> Result<(), VendorError> {
        if !self.is_open() {
            return Err(VendorError::DeviceClosed);
        }
        Ok(())
    }

    fn initiate_streaming(&self) -> Result<(), VendorError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(VendorError::DeviceClosed);
        }
        state.streaming = true;
        state.phase = 0.0;
        Ok(())
    }

    fn abort(&self) -> Result<(), VendorError> {
        let mut state = self.state.lock().unwrap();
        if !state.open {
            return Err(VendorError::DeviceClosed);
        }
        state.streaming = false;
        Ok(())
    }

    fn fetch_f32(&self, data: &mut [f32]) -> Result<FetchResult, VendorError> {
        let samples = data.len() / 2;
        self.fetch(samples, |n, i, q| {
            data[2 * n] = i;
            data[2 * n + 1] = q;
        })
    }

    fn fetch_i16(&self, data: &mut [i16]) -> Result<FetchResult, VendorError> {
        const SCALE: f32 = 8192.0;
        let samples = data.len() / 2;
        self.fetch(samples, |n, i, q| {
            data[2 * n] = (i * SCALE) as i16;
            data[2 * n + 1] = (q * SCALE) as i16;
        })
    }
}

/// Bindings against the vendor `bb_api` shared library.
#[cfg(feature = "vendor-bb60")]
pub mod ffi {
    use super::{FetchResult, IqConfig, VendorApi, VendorError};
    use std::ffi::CStr;
    use std::os::raw::{c_char, c_double, c_int, c_void};
    use std::sync::Mutex;

    const BB_NO_ERROR: c_int = 0;
    const BB_DEVICE_NOT_OPEN_ERR: c_int = -8;
    const BB_MAX_DEVICES: usize = 8;
    const BB_STREAMING: u32 = 4;
    const BB_STREAM_IQ: u32 = 0x0;

    #[link(name = "bb_api")]
    extern "C" {
        fn bbGetSerialNumberList(serials: *mut c_int, count: *mut c_int) -> c_int;
        fn bbOpenDevice(device: *mut c_int) -> c_int;
        fn bbOpenDeviceBySerialNumber(device: *mut c_int, serial: c_int) -> c_int;
        fn bbCloseDevice(device: c_int) -> c_int;
        fn bbPreset(device: c_int) -> c_int;
        fn bbGetSerialNumber(device: c_int, serial: *mut u32) -> c_int;
        fn bbGetFirmwareVersion(device: c_int, version: *mut c_int) -> c_int;
        fn bbConfigureIQCenter(device: c_int, center: c_double) -> c_int;
        fn bbConfigureIQ(device: c_int, downsample: c_int, bandwidth: c_double) -> c_int;
        fn bbConfigureIQDataType(device: c_int, data_type: c_int) -> c_int;
        fn bbConfigureIO(device: c_int, port1: u32, port2: u32) -> c_int;
        fn bbInitiate(device: c_int, mode: u32, flag: u32) -> c_int;
        fn bbAbort(device: c_int) -> c_int;
        fn bbGetIQUnpacked(
            device: c_int,
            iq_data: *mut c_void,
            iq_count: c_int,
            triggers: *mut c_int,
            trigger_count: c_int,
            purge: c_int,
            data_remaining: *mut c_int,
            sample_loss: *mut c_int,
            sec: *mut c_int,
            nano: *mut c_int,
        ) -> c_int;
        fn bbGetErrorString(status: c_int) -> *const c_char;
    }

    fn check(status: c_int) -> Result<(), VendorError> {
        match status {
            BB_NO_ERROR => Ok(()),
            BB_DEVICE_NOT_OPEN_ERR => Err(VendorError::DeviceClosed),
            status => {
                let message = unsafe { CStr::from_ptr(bbGetErrorString(status)) }
                    .to_string_lossy()
                    .into_owned();
                Err(VendorError::Api(message))
            }
        }
    }

    /// Vendor backend over the real `bb_api` library.
    #[derive(Debug, Default)]
    pub struct FfiVendor {
        handle: Mutex<Option<c_int>>,
    }

    impl FfiVendor {
        /// Creates a closed backend.
        pub fn new() -> FfiVendor {
            FfiVendor::default()
        }

        fn handle(&self) -> Result<c_int, VendorError> {
            self.handle.lock().unwrap().ok_or(VendorError::DeviceClosed)
        }

        fn fetch(
            &self,
            data: *mut c_void,
            iq_count: usize,
        ) -> Result<FetchResult, VendorError> {
            let device = self.handle()?;
            let mut triggers = [0 as c_int; 64];
            let mut remaining = 0;
            let mut sample_loss = 0;
            let (mut sec, mut nano) = (0, 0);
            check(unsafe {
                bbGetIQUnpacked(
                    device,
                    data,
                    iq_count as c_int,
                    triggers.as_mut_ptr(),
                    triggers.len() as c_int,
                    0,
                    &mut remaining,
                    &mut sample_loss,
                    &mut sec,
                    &mut nano,
                )
            })?;
            Ok(FetchResult {
                samples: iq_count,
                sample_loss: sample_loss != 0,
                triggers: triggers
                    .iter()
                    .take_while(|&&t| t > 0)
                    .map(|&t| t as usize)
                    .collect(),
            })
        }
    }

    impl VendorApi for FfiVendor {
        fn open(&self, serial: Option<&str>) -> Result<(), VendorError> {
            let mut handle = self.handle.lock().unwrap();
            if handle.is_some() {
                return Err(VendorError::Api("device already open".to_string()));
            }
            let mut device = -1;
            let status = match serial.and_then(|s| s.parse::<c_int>().ok()) {
                Some(serial) => unsafe { bbOpenDeviceBySerialNumber(&mut device, serial) },
                None => unsafe { bbOpenDevice(&mut device) },
            };
            check(status)?;
            *handle = Some(device);
            Ok(())
        }

        fn close(&self) {
            if let Some(device) = self.handle.lock().unwrap().take() {
                unsafe {
                    bbCloseDevice(device);
                }
            }
        }

        fn is_open(&self) -> bool {
            self.handle.lock().unwrap().is_some()
        }

        fn preset(&self) -> Result<(), VendorError> {
            check(unsafe { bbPreset(self.handle()?) })
        }

        fn serial_number(&self) -> Result<String, VendorError> {
            let mut serial = 0;
            check(unsafe { bbGetSerialNumber(self.handle()?, &mut serial) })?;
            Ok(serial.to_string())
        }

        fn firmware_version(&self) -> Result<String, VendorError> {
            let mut version = 0;
            check(unsafe { bbGetFirmwareVersion(self.handle()?, &mut version) })?;
            Ok(version.to_string())
        }

        fn device_list(&self) -> Vec<String> {
            let mut serials = [0 as c_int; BB_MAX_DEVICES];
            let mut count = 0;
            if unsafe { bbGetSerialNumberList(serials.as_mut_ptr(), &mut count) }
                != BB_NO_ERROR
            {
                return Vec::new();
            }
            serials[..count.max(0) as usize]
                .iter()
                .map(|s| s.to_string())
                .collect()
        }

        fn configure_iq(&self, config: &IqConfig) -> Result<(), VendorError> {
            let device = self.handle()?;
            check(unsafe { bbConfigureIQCenter(device, config.center_freq) })?;
            check(unsafe {
                bbConfigureIQ(device, config.decimation as c_int, config.bandwidth)
            })?;
            check(unsafe { bbConfigureIQDataType(device, !config.use_float as c_int) })
        }

        fn configure_io(&self, port1: i32, port2: i32) -> Result<(), VendorError> {
            check(unsafe { bbConfigureIO(self.handle()?, port1 as u32, port2 as u32) })
        }

        fn initiate_streaming(&self) -> Result<(), VendorError> {
            check(unsafe { bbInitiate(self.handle()?, BB_STREAMING, BB_STREAM_IQ) })
        }

        fn abort(&self) -> Result<(), VendorError> {
            check(unsafe { bbAbort(self.handle()?) })
        }

        fn fetch_f32(&self, data: &mut [f32]) -> Result<FetchResult, VendorError> {
            self.fetch(data.as_mut_ptr() as *mut c_void, data.len() / 2)
        }

        fn fetch_i16(&self, data: &mut [i16]) -> Result<FetchResult, VendorError> {
            self.fetch(data.as_mut_ptr() as *mut c_void, data.len() / 2)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn open_close_cycle() {
        let vendor = SimVendor::new();
        assert!(!vendor.is_open());
        vendor.open(None).unwrap();
        assert!(vendor.is_open());
        assert_eq!(vendor.serial_number().unwrap(), "SIM60-0001");
        vendor.close();
        assert!(!vendor.is_open());
        assert!(matches!(
            vendor.serial_number(),
            Err(VendorError::DeviceClosed)
        ));
    }

    #[test]
    fn open_by_unknown_serial_fails() {
        let vendor = SimVendor::new();
        assert!(matches!(
            vendor.open(Some("12345")),
            Err(VendorError::NotFound)
        ));
        vendor.open(Some("SIM60-0001")).unwrap();
    }

    #[test]
    fn fetch_requires_streaming_mode() {
        let vendor = SimVendor::new();
        vendor.open(None).unwrap();
        let mut data = vec![0.0f32; 256];
        assert!(vendor.fetch_f32(&mut data).is_err());
        vendor.initiate_streaming().unwrap();
        let result = vendor.fetch_f32(&mut data).unwrap();
        assert_eq!(result.samples, 128);
        assert!(!result.sample_loss);
        // The tone has unit amplitude.
        assert!(data.iter().any(|&x| x.abs() > 0.5));
    }

    #[test]
    fn preset_restores_defaults() {
        let vendor = SimVendor::new();
        vendor.open(None).unwrap();
        vendor
            .configure_iq(&IqConfig {
                center_freq: 2.4e9,
                decimation: 16,
                bandwidth: 1.0e6,
                use_float: false,
            })
            .unwrap();
        vendor.initiate_streaming().unwrap();
        vendor.preset().unwrap();
        let mut data = vec![0i16; 64];
        // Streaming mode was cleared by the preset.
        assert!(vendor.fetch_i16(&mut data).is_err());
    }
}
