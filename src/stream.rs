//! I/Q streaming engine.
//!
//! This module contains the buffer pool and producer loop that move I/Q
//! samples from a receiver to a consumer callback. The engine owns a fixed
//! pool of pre-allocated [`IqBuffer`]s which are recycled between the producer
//! and the consumer, so steady-state streaming performs no per-packet
//! allocation. Buffers are stamped with epoch nanoseconds before delivery and
//! loss is accounted in [`StreamingMetrics`].

use crate::device::vendor::{VendorApi, VendorError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Number of buffers in the streaming pool.
pub const MAX_BUFFER_COUNT: usize = 32;

/// Default buffer capacity in complex samples.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Smallest accepted buffer capacity in complex samples.
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Largest accepted buffer capacity in complex samples.
pub const MAX_BUFFER_SIZE: usize = 1 << 20;

/// Sample formats delivered by a receiver.
///
/// Samples are interleaved complex pairs in either 32-bit float or 16-bit
/// integer precision.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SampleFormat {
    /// Interleaved complex float32.
    F32c,
    /// Interleaved complex int16.
    I16c,
}

impl SampleFormat {
    /// Returns the integer wire value used in profile files.
    pub fn wire_value(&self) -> u32 {
        match self {
            SampleFormat::F32c => 0,
            SampleFormat::I16c => 1,
        }
    }

    /// Converts a profile wire value back into a format.
    pub fn from_wire(value: u32) -> Option<SampleFormat> {
        match value {
            0 => Some(SampleFormat::F32c),
            1 => Some(SampleFormat::I16c),
            _ => None,
        }
    }

    /// Bytes per complex sample (both components).
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::F32c => 2 * std::mem::size_of::<f32>(),
            SampleFormat::I16c => 2 * std::mem::size_of::<i16>(),
        }
    }
}

/// Streaming configuration.
///
/// Describes one I/Q streaming session: tuning, format and buffering. The
/// effective sample rate is derived from the device decimation; the rate
/// recorded here must agree with it, which the driver cross-checks before
/// touching hardware.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamConfig {
    /// Center frequency in Hz.
    pub center_frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    /// Sample rate in complex samples per second.
    pub sample_rate: f64,
    /// Sample format.
    pub format: SampleFormat,
    /// Whether buffers should be stamped against GPS time.
    pub enable_time_stamp: bool,
    /// Buffer capacity in complex samples.
    pub buffer_size: usize,
}

impl Default for StreamConfig {
    fn default() -> StreamConfig {
        StreamConfig {
            center_frequency: 100.0e6,
            bandwidth: 5.0e6,
            sample_rate: 10.0e6,
            format: SampleFormat::F32c,
            enable_time_stamp: false,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Interleaved I/Q payload in one of the two supported precisions.
#[derive(Debug, Clone)]
pub enum IqPayload {
    /// float32 I/Q pairs.
    F32(Vec<f32>),
    /// int16 I/Q pairs.
    I16(Vec<i16>),
}

/// One buffer of I/Q samples.
///
/// The payload holds interleaved real/imaginary pairs; `sample_count` is the
/// number of valid complex samples, which may be less than the capacity. The
/// buffer is mutated only by the producer; consumers receive a shared
/// reference and must copy out anything they need before returning.
#[derive(Debug, Clone)]
pub struct IqBuffer {
    payload: IqPayload,
    sample_count: usize,
    timestamp_ns: i64,
    trigger_offsets: Vec<usize>,
    sample_loss: bool,
}

impl IqBuffer {
    /// Creates a buffer with the given capacity in complex samples.
    pub fn new(capacity: usize, format: SampleFormat) -> IqBuffer {
        let payload = match format {
            SampleFormat::F32c => IqPayload::F32(vec![0.0; capacity * 2]),
            SampleFormat::I16c => IqPayload::I16(vec![0; capacity * 2]),
        };
        IqBuffer {
            payload,
            sample_count: 0,
            timestamp_ns: 0,
            trigger_offsets: Vec::new(),
            sample_loss: false,
        }
    }

    /// Buffer capacity in complex samples.
    pub fn capacity(&self) -> usize {
        match &self.payload {
            IqPayload::F32(v) => v.len() / 2,
            IqPayload::I16(v) => v.len() / 2,
        }
    }

    /// Sample format of the payload.
    pub fn format(&self) -> SampleFormat {
        match &self.payload {
            IqPayload::F32(_) => SampleFormat::F32c,
            IqPayload::I16(_) => SampleFormat::I16c,
        }
    }

    /// Number of valid complex samples.
    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Epoch nanoseconds of the first sample.
    pub fn timestamp_ns(&self) -> i64 {
        self.timestamp_ns
    }

    /// Trigger positions as sample indices, ordered and distinct.
    pub fn trigger_offsets(&self) -> &[usize] {
        &self.trigger_offsets
    }

    /// Whether the device reported a sample break for this buffer.
    ///
    /// Distinct from pool exhaustion: this flag means the hardware dropped
    /// samples internally before the fetch.
    pub fn sample_loss(&self) -> bool {
        self.sample_loss
    }

    /// Valid samples as interleaved float32 pairs, if that is the format.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.payload {
            IqPayload::F32(v) => Some(&v[..self.sample_count * 2]),
            IqPayload::I16(_) => None,
        }
    }

    /// Valid samples as interleaved int16 pairs, if that is the format.
    pub fn as_i16(&self) -> Option<&[i16]> {
        match &self.payload {
            IqPayload::I16(v) => Some(&v[..self.sample_count * 2]),
            IqPayload::F32(_) => None,
        }
    }
}

/// Consumer of streamed I/Q buffers.
///
/// The producer invokes [`on_iq`](IqSink::on_iq) once per buffer,
/// synchronously and in acquisition order. The reference is only valid for
/// the duration of the call: implementations must not retain it or hand it to
/// other threads, and should copy out whatever they need before returning.
pub trait IqSink: Send {
    /// Receives one buffer of I/Q samples.
    fn on_iq(&mut self, buffer: &IqBuffer);
}

impl<F: FnMut(&IqBuffer) + Send> IqSink for F {
    fn on_iq(&mut self, buffer: &IqBuffer) {
        self(buffer)
    }
}

/// Snapshot of streaming performance counters.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct StreamingMetrics {
    /// Measured sample rate in complex samples per second.
    pub sample_rate: f64,
    /// Measured byte rate.
    pub byte_rate: f64,
    /// Buffers allocated because the pool was exhausted. Signals that the
    /// consumer callback is not keeping pace; no samples are lost.
    pub dropped_buffers: u64,
    /// Mean callback duration in microseconds.
    pub avg_callback_time_us: f64,
    /// Number of callback invocations.
    pub callback_count: u64,
}

#[derive(Debug)]
struct MetricsInner {
    total_samples: AtomicU64,
    total_bytes: AtomicU64,
    dropped_buffers: AtomicU64,
    callback_time_us: AtomicU64,
    callback_count: AtomicU64,
    started: Mutex<Instant>,
}

/// Shared handle to the streaming counters.
///
/// Cheaply clonable; all counters are atomic so the snapshot can be taken
/// while the producer is running.
#[derive(Debug, Clone)]
pub struct MetricsHandle(Arc<MetricsInner>);

impl Default for MetricsHandle {
    fn default() -> MetricsHandle {
        MetricsHandle::new()
    }
}

impl MetricsHandle {
    /// Creates a zeroed metrics handle.
    pub fn new() -> MetricsHandle {
        MetricsHandle(Arc::new(MetricsInner {
            total_samples: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            dropped_buffers: AtomicU64::new(0),
            callback_time_us: AtomicU64::new(0),
            callback_count: AtomicU64::new(0),
            started: Mutex::new(Instant::now()),
        }))
    }

    /// Resets every counter and restarts the rate clock.
    pub fn reset(&self) {
        self.0.total_samples.store(0, Ordering::Relaxed);
        self.0.total_bytes.store(0, Ordering::Relaxed);
        self.0.dropped_buffers.store(0, Ordering::Relaxed);
        self.0.callback_time_us.store(0, Ordering::Relaxed);
        self.0.callback_count.store(0, Ordering::Relaxed);
        *self.0.started.lock().unwrap() = Instant::now();
    }

    /// Takes a snapshot of the counters.
    pub fn snapshot(&self) -> StreamingMetrics {
        let elapsed = self.0.started.lock().unwrap().elapsed().as_secs_f64();
        let samples = self.0.total_samples.load(Ordering::Relaxed);
        let bytes = self.0.total_bytes.load(Ordering::Relaxed);
        let callback_count = self.0.callback_count.load(Ordering::Relaxed);
        let callback_time_us = self.0.callback_time_us.load(Ordering::Relaxed);
        StreamingMetrics {
            sample_rate: if elapsed > 0.0 {
                samples as f64 / elapsed
            } else {
                0.0
            },
            byte_rate: if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            },
            dropped_buffers: self.0.dropped_buffers.load(Ordering::Relaxed),
            avg_callback_time_us: if callback_count > 0 {
                callback_time_us as f64 / callback_count as f64
            } else {
                0.0
            },
            callback_count,
        }
    }

    fn add_fetch(&self, samples: usize, bytes: usize) {
        self.0
            .total_samples
            .fetch_add(samples as u64, Ordering::Relaxed);
        self.0.total_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn add_callback(&self, duration: Duration) {
        self.0
            .callback_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.0.callback_count.fetch_add(1, Ordering::Relaxed);
    }

    fn add_dropped_buffer(&self) {
        self.0.dropped_buffers.fetch_add(1, Ordering::Relaxed);
    }
}

/// Stream time base.
///
/// Buffer timestamps come from a monotonic clock anchored to the system epoch
/// when the stream starts, which keeps them monotone per stream even if the
/// wall clock steps. When a CPU to GPS offset has been established it is
/// applied on top; otherwise the anchor alone is the documented fallback.
#[derive(Debug)]
struct TimeBase {
    epoch_anchor_ns: i64,
    anchor: Instant,
    gps_offset_ns: i64,
}

impl TimeBase {
    fn new(gps_offset_ns: Option<i64>) -> TimeBase {
        let epoch_anchor_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        TimeBase {
            epoch_anchor_ns,
            anchor: Instant::now(),
            gps_offset_ns: gps_offset_ns.unwrap_or(0),
        }
    }

    fn now_ns(&self) -> i64 {
        self.epoch_anchor_ns + self.anchor.elapsed().as_nanos() as i64 + self.gps_offset_ns
    }
}

/// Streaming engine.
///
/// Owns the producer thread for one streaming session. Created by
/// [`start`](StreamEngine::start) and torn down cooperatively by
/// [`stop`](StreamEngine::stop): the in-flight fetch completes before the
/// producer exits.
#[derive(Debug)]
pub struct StreamEngine {
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StreamEngine {
    /// Starts the producer thread.
    ///
    /// The `gps_offset_ns` parameter carries an established CPU to GPS offset
    /// or `None` for the monotonic fallback. Counters accumulate into
    /// `metrics`, which the caller retains for snapshots.
    pub fn start(
        vendor: Arc<dyn VendorApi>,
        config: StreamConfig,
        gps_offset_ns: Option<i64>,
        mut sink: Box<dyn IqSink>,
        metrics: MetricsHandle,
    ) -> StreamEngine {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = std::thread::spawn(move || {
            let timebase = TimeBase::new(gps_offset_ns);
            let mut pool: Vec<IqBuffer> = (0..MAX_BUFFER_COUNT)
                .map(|_| IqBuffer::new(config.buffer_size, config.format))
                .collect();
            while !stop_flag.load(Ordering::Relaxed) {
                let mut buffer = match pool.pop() {
                    Some(buffer) => buffer,
                    None => {
                        // Pool exhaustion records loss of pacing, not of
                        // samples.
                        metrics.add_dropped_buffer();
                        IqBuffer::new(config.buffer_size, config.format)
                    }
                };
                let fetch = match &mut buffer.payload {
                    IqPayload::F32(data) => vendor.fetch_f32(data),
                    IqPayload::I16(data) => vendor.fetch_i16(data),
                };
                match fetch {
                    Ok(result) => {
                        buffer.sample_count = result.samples.min(buffer.capacity());
                        buffer.sample_loss = result.sample_loss;
                        buffer.timestamp_ns = timebase.now_ns();
                        buffer.trigger_offsets = result.triggers;
                        metrics.add_fetch(
                            buffer.sample_count,
                            buffer.sample_count * config.format.bytes_per_sample(),
                        );
                        let start = Instant::now();
                        sink.on_iq(&buffer);
                        metrics.add_callback(start.elapsed());
                        pool.push(buffer);
                    }
                    Err(VendorError::DeviceClosed) => break,
                    Err(error) => {
                        tracing::warn!(%error, "I/Q fetch failed, retrying");
                        pool.push(buffer);
                        std::thread::sleep(Duration::from_millis(10));
                    }
                }
            }
        });
        StreamEngine {
            stop,
            join: Some(join),
        }
    }

    /// Stops the producer and waits for it to exit.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for StreamEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::vendor::{IqConfig, SimVendor};

    fn sim_streaming(format: SampleFormat) -> Arc<SimVendor> {
        let vendor = Arc::new(SimVendor::new());
        vendor.open(None).unwrap();
        vendor
            .configure_iq(&IqConfig {
                center_freq: 915.0e6,
                decimation: 4,
                bandwidth: 5.0e6,
                use_float: format == SampleFormat::F32c,
            })
            .unwrap();
        vendor.initiate_streaming().unwrap();
        vendor
    }

    #[test]
    fn buffer_formats() {
        let buffer = IqBuffer::new(1024, SampleFormat::F32c);
        assert_eq!(buffer.capacity(), 1024);
        assert_eq!(buffer.format(), SampleFormat::F32c);
        assert!(buffer.as_f32().is_some());
        assert!(buffer.as_i16().is_none());
        let buffer = IqBuffer::new(2048, SampleFormat::I16c);
        assert_eq!(buffer.capacity(), 2048);
        assert!(buffer.as_i16().is_some());
    }

    #[test]
    fn streams_ordered_buffers() {
        let vendor = sim_streaming(SampleFormat::F32c);
        let metrics = MetricsHandle::new();
        let counts: Arc<Mutex<Vec<i64>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_counts = counts.clone();
        let config = StreamConfig {
            buffer_size: 4096,
            ..Default::default()
        };
        let engine = StreamEngine::start(
            vendor.clone(),
            config,
            None,
            Box::new(move |buffer: &IqBuffer| {
                assert!(buffer.sample_count() > 0);
                assert!(buffer.as_f32().is_some());
                sink_counts.lock().unwrap().push(buffer.timestamp_ns());
            }),
            metrics.clone(),
        );
        std::thread::sleep(Duration::from_millis(50));
        engine.stop();
        let timestamps = counts.lock().unwrap();
        assert!(timestamps.len() >= 2);
        // Timestamps are monotone per stream.
        assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.callback_count, timestamps.len() as u64);
        assert_eq!(snapshot.dropped_buffers, 0);
        assert!(snapshot.sample_rate > 0.0);
        vendor.close();
    }

    #[test]
    fn stops_when_device_closes() {
        let vendor = sim_streaming(SampleFormat::I16c);
        let metrics = MetricsHandle::new();
        let engine = StreamEngine::start(
            vendor.clone(),
            StreamConfig {
                format: SampleFormat::I16c,
                buffer_size: 2048,
                ..Default::default()
            },
            None,
            Box::new(|buffer: &IqBuffer| {
                assert!(buffer.as_i16().is_some());
            }),
            metrics,
        );
        std::thread::sleep(Duration::from_millis(20));
        // Closing the device makes the producer exit on its own.
        vendor.close();
        std::thread::sleep(Duration::from_millis(20));
        engine.stop();
    }

    #[test]
    fn metrics_reset_clears_counters() {
        let metrics = MetricsHandle::new();
        metrics.add_fetch(1000, 8000);
        metrics.add_callback(Duration::from_micros(120));
        metrics.add_dropped_buffer();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.callback_count, 1);
        assert_eq!(snapshot.dropped_buffers, 1);
        metrics.reset();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.callback_count, 0);
        assert_eq!(snapshot.dropped_buffers, 0);
        assert_eq!(snapshot.avg_callback_time_us, 0.0);
    }

    #[test]
    fn sample_format_wire_values() {
        assert_eq!(SampleFormat::F32c.wire_value(), 0);
        assert_eq!(SampleFormat::I16c.wire_value(), 1);
        assert_eq!(SampleFormat::from_wire(0), Some(SampleFormat::F32c));
        assert_eq!(SampleFormat::from_wire(1), Some(SampleFormat::I16c));
        assert_eq!(SampleFormat::from_wire(7), None);
    }
}
