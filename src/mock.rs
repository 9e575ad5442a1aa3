//! Mock camera platform for testing without hardware.
//!
//! Behaves like an asynchronous camera stack: open, configure and capture
//! results are delivered from spawned threads after a small latency, frames
//! come from a bounded buffer pool, and each camera or shot can be scripted
//! to fail, hang or misbehave.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{CaptureError, Result};
use crate::traits::{
    CameraDevice, CameraPlatform, Capability, CaptureFailure, CaptureListener, CaptureMetadata,
    CaptureRequest, CaptureSession, DeviceCharacteristics, DeviceId, DeviceStateListener,
    FailureReason, FourCC, MetadataValue, OutputTarget, RawFrame, SessionStateListener, Size,
};

const EVENT_LATENCY: Duration = Duration::from_millis(2);
const FRAME_LAG: Duration = Duration::from_millis(3);
const FRAME_INTERVAL_NS: u64 = 33_333_333; // ~30fps
const WHITE_LEVEL: u16 = 1023;

/// What happens when a camera is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenBehavior {
    /// Report the device opened.
    Open,
    /// Report an asynchronous device error with this code.
    Fail(i32),
    /// Report the device disconnected.
    Disconnect,
    /// Never report anything.
    Hang,
    /// Refuse synchronously with a permission error.
    Deny,
}

/// What happens when a session is configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigureBehavior {
    /// Report the session configured.
    Configure,
    /// Report configuration failure.
    Fail,
    /// Never report anything.
    Hang,
}

/// Scripted outcome of one capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShotBehavior {
    /// Deliver the frame shortly after the completion.
    Succeed,
    /// Report the capture as failed, without a frame.
    FailCompletion,
    /// Deliver the frame but never report completion.
    NeverComplete,
    /// Report completion now and deliver the frame after this delay.
    LateFrame(Duration),
    /// Report completion but never deliver a frame.
    NoFrame,
    /// Raise a device error with this code, then fail the capture.
    DeviceError(i32),
}

/// Test pattern used for generated Bayer frames.
#[derive(Debug, Clone, Copy)]
pub enum TestPattern {
    /// Eight vertical color bars mosaicked onto the RGGB grid.
    ColorBars,
    /// Horizontal gradient from black to the exposure level.
    Gradient,
    /// Every sample at the same value.
    Solid(u16),
}

/// One scripted camera.
#[derive(Debug, Clone)]
pub struct MockCamera {
    id: DeviceId,
    characteristics: DeviceCharacteristics,
    open: OpenBehavior,
    configure: ConfigureBehavior,
    pattern: TestPattern,
}

impl MockCamera {
    /// A camera advertising raw capture at two sizes.
    pub fn raw(id: &str) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            "sensor.info.color_filter_arrangement".to_owned(),
            MetadataValue::Text("RGGB".to_owned()),
        );
        entries.insert(
            "sensor.info.white_level".to_owned(),
            MetadataValue::Int(i64::from(WHITE_LEVEL)),
        );
        entries.insert(
            "sensor.black_level_pattern".to_owned(),
            MetadataValue::IntArray(vec![64; 4]),
        );
        entries.insert(
            "sensor.info.physical_size".to_owned(),
            MetadataValue::FloatArray(vec![4.6, 3.4]),
        );
        entries.insert(
            "lens.info.available_apertures".to_owned(),
            MetadataValue::FloatArray(vec![1.8]),
        );
        entries.insert(
            "sensor.forward_matrix1".to_owned(),
            MetadataValue::Rational(1024, 1024),
        );
        entries.insert(
            "vendor.calibration".to_owned(),
            MetadataValue::Opaque("CalibrationBlob".to_owned()),
        );

        Self {
            id: DeviceId::new(id),
            characteristics: DeviceCharacteristics {
                capabilities: vec![
                    Capability::BackwardCompatible,
                    Capability::ManualSensor,
                    Capability::Raw,
                ],
                raw_formats: vec![FourCC::RGGB],
                raw_output_sizes: vec![Size::new(64, 48), Size::new(128, 96)],
                sensor_orientation: 90,
                entries,
            },
            open: OpenBehavior::Open,
            configure: ConfigureBehavior::Configure,
            pattern: TestPattern::ColorBars,
        }
    }

    /// A camera with processed output only.
    pub fn processed_only(id: &str) -> Self {
        Self {
            id: DeviceId::new(id),
            characteristics: DeviceCharacteristics {
                capabilities: vec![Capability::BackwardCompatible],
                sensor_orientation: 270,
                ..DeviceCharacteristics::default()
            },
            open: OpenBehavior::Open,
            configure: ConfigureBehavior::Configure,
            pattern: TestPattern::ColorBars,
        }
    }

    /// Replace the advertised raw output sizes.
    #[must_use]
    pub fn with_raw_sizes(mut self, sizes: Vec<Size>) -> Self {
        self.characteristics.raw_output_sizes = sizes;
        self
    }

    /// Script the open outcome.
    #[must_use]
    pub const fn with_open(mut self, open: OpenBehavior) -> Self {
        self.open = open;
        self
    }

    /// Script the configure outcome.
    #[must_use]
    pub const fn with_configure(mut self, configure: ConfigureBehavior) -> Self {
        self.configure = configure;
        self
    }

    /// Set the pattern for generated frames.
    #[must_use]
    pub const fn with_pattern(mut self, pattern: TestPattern) -> Self {
        self.pattern = pattern;
        self
    }
}

struct MockState {
    cameras: Vec<MockCamera>,
    shots: Mutex<VecDeque<ShotBehavior>>,
    requests: Mutex<Vec<CaptureRequest>>,
    active: Mutex<Vec<(u64, Arc<dyn DeviceStateListener>)>>,
    parked_sessions: Mutex<Vec<Arc<dyn SessionStateListener>>>,
    parked_captures: Mutex<Vec<Arc<dyn CaptureListener>>>,
    open_attempts: AtomicUsize,
    open_devices: AtomicUsize,
    max_concurrent_open: AtomicUsize,
    outstanding_buffers: Arc<AtomicUsize>,
    frames_produced: AtomicU64,
    starved_frames: AtomicU64,
    next_serial: AtomicU64,
    next_frame: AtomicU64,
}

impl MockState {
    fn device_opened(&self, listener: Arc<dyn DeviceStateListener>) -> u64 {
        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst);
        let open = self.open_devices.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_open.fetch_max(open, Ordering::SeqCst);
        self.active.lock().push((serial, listener));
        serial
    }

    fn device_closed(&self, serial: u64) {
        self.open_devices.fetch_sub(1, Ordering::SeqCst);
        self.active.lock().retain(|(s, _)| *s != serial);
    }

    /// Take a buffer from the pool, or `None` when every buffer is outstanding.
    fn allocate_frame(
        &self,
        size: Size,
        fourcc: FourCC,
        max_buffers: usize,
        sequence: u64,
        data: Vec<u8>,
    ) -> Option<RawFrame> {
        let pool = Arc::clone(&self.outstanding_buffers);
        let taken = pool.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
            (n < max_buffers).then_some(n + 1)
        });
        if taken.is_err() {
            self.starved_frames.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(sequence, max_buffers, "mock buffer pool exhausted; dropping frame");
            return None;
        }

        self.frames_produced.fetch_add(1, Ordering::SeqCst);
        Some(
            RawFrame::new(data, size, fourcc, sequence, sequence * FRAME_INTERVAL_NS).with_release(
                move || {
                    pool.fetch_sub(1, Ordering::SeqCst);
                },
            ),
        )
    }
}

/// Scriptable in-process camera platform. Clones share state.
#[derive(Clone)]
pub struct MockPlatform {
    state: Arc<MockState>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    /// A platform with one raw-capable camera `"0"`.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cameras(vec![MockCamera::raw("0")])
    }

    /// A platform with the given cameras, in enumeration order.
    #[must_use]
    pub fn with_cameras(cameras: Vec<MockCamera>) -> Self {
        Self {
            state: Arc::new(MockState {
                cameras,
                shots: Mutex::new(VecDeque::new()),
                requests: Mutex::new(Vec::new()),
                active: Mutex::new(Vec::new()),
                parked_sessions: Mutex::new(Vec::new()),
                parked_captures: Mutex::new(Vec::new()),
                open_attempts: AtomicUsize::new(0),
                open_devices: AtomicUsize::new(0),
                max_concurrent_open: AtomicUsize::new(0),
                outstanding_buffers: Arc::new(AtomicUsize::new(0)),
                frames_produced: AtomicU64::new(0),
                starved_frames: AtomicU64::new(0),
                next_serial: AtomicU64::new(0),
                next_frame: AtomicU64::new(1),
            }),
        }
    }

    /// Script the next capture requests, in order. Unscripted requests succeed.
    pub fn queue_shots(&self, shots: Vec<ShotBehavior>) {
        self.state.shots.lock().extend(shots);
    }

    /// Every request submitted so far.
    pub fn requests(&self) -> Vec<CaptureRequest> {
        self.state.requests.lock().clone()
    }

    /// Number of `open_device` calls.
    pub fn open_attempts(&self) -> usize {
        self.state.open_attempts.load(Ordering::SeqCst)
    }

    /// Devices currently open.
    pub fn open_devices(&self) -> usize {
        self.state.open_devices.load(Ordering::SeqCst)
    }

    /// Highest number of devices that were ever open at once.
    pub fn max_concurrent_open(&self) -> usize {
        self.state.max_concurrent_open.load(Ordering::SeqCst)
    }

    /// Buffers handed out and not yet released.
    pub fn outstanding_buffers(&self) -> usize {
        self.state.outstanding_buffers.load(Ordering::SeqCst)
    }

    /// Frames delivered to outputs.
    pub fn frames_produced(&self) -> u64 {
        self.state.frames_produced.load(Ordering::SeqCst)
    }

    /// Frames dropped because the buffer pool was exhausted.
    pub fn starved_frames(&self) -> u64 {
        self.state.starved_frames.load(Ordering::SeqCst)
    }

    /// Listeners the platform is holding without ever answering.
    pub fn parked_listeners(&self) -> usize {
        self.state.parked_sessions.lock().len() + self.state.parked_captures.lock().len()
    }

    /// Report an asynchronous error on every open device.
    pub fn raise_device_error(&self, code: i32) {
        let listeners: Vec<_> = self
            .state
            .active
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            after(EVENT_LATENCY, move || listener.on_error(code));
        }
    }

    fn camera(&self, id: &DeviceId) -> Result<&MockCamera> {
        self.state
            .cameras
            .iter()
            .find(|camera| &camera.id == id)
            .ok_or_else(|| CaptureError::DeviceFault(format!("unknown device {id}")))
    }
}

impl CameraPlatform for MockPlatform {
    fn device_ids(&self) -> Result<Vec<DeviceId>> {
        Ok(self.state.cameras.iter().map(|camera| camera.id.clone()).collect())
    }

    fn characteristics(&self, id: &DeviceId) -> Result<DeviceCharacteristics> {
        Ok(self.camera(id)?.characteristics.clone())
    }

    fn open_device(&self, id: &DeviceId, listener: Arc<dyn DeviceStateListener>) -> Result<()> {
        self.state.open_attempts.fetch_add(1, Ordering::SeqCst);
        let camera = self.camera(id)?.clone();

        match camera.open {
            OpenBehavior::Open => {
                let state = Arc::clone(&self.state);
                after(EVENT_LATENCY, move || {
                    let serial = state.device_opened(Arc::clone(&listener));
                    let device = MockDevice {
                        camera,
                        state,
                        listener: Arc::clone(&listener),
                        serial,
                        closed: false,
                    };
                    listener.on_opened(Box::new(device));
                });
            }
            OpenBehavior::Fail(code) => after(EVENT_LATENCY, move || listener.on_error(code)),
            OpenBehavior::Disconnect => after(EVENT_LATENCY, move || listener.on_disconnected()),
            OpenBehavior::Hang => {}
            OpenBehavior::Deny => {
                return Err(CaptureError::AccessDenied(format!(
                    "permission to open {id} refused"
                )));
            }
        }
        Ok(())
    }
}

struct MockDevice {
    camera: MockCamera,
    state: Arc<MockState>,
    listener: Arc<dyn DeviceStateListener>,
    serial: u64,
    closed: bool,
}

impl CameraDevice for MockDevice {
    fn id(&self) -> &DeviceId {
        &self.camera.id
    }

    fn create_session(
        &mut self,
        output: OutputTarget,
        listener: Arc<dyn SessionStateListener>,
    ) -> Result<()> {
        if self.closed {
            return Err(CaptureError::DeviceFault("device already closed".to_owned()));
        }
        if !self.camera.characteristics.raw_output_sizes.contains(&output.size) {
            return Err(CaptureError::DeviceFault(format!(
                "unsupported output size {}",
                output.size
            )));
        }

        match self.camera.configure {
            ConfigureBehavior::Configure => {
                let session = MockSession {
                    state: Arc::clone(&self.state),
                    device_listener: Arc::clone(&self.listener),
                    output,
                    pattern: self.camera.pattern,
                    closed: Arc::new(AtomicBool::new(false)),
                };
                after(EVENT_LATENCY, move || listener.on_configured(Box::new(session)));
            }
            ConfigureBehavior::Fail => after(EVENT_LATENCY, move || listener.on_configure_failed()),
            ConfigureBehavior::Hang => self.state.parked_sessions.lock().push(listener),
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.state.device_closed(self.serial);
        }
        Ok(())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

struct MockSession {
    state: Arc<MockState>,
    device_listener: Arc<dyn DeviceStateListener>,
    output: OutputTarget,
    pattern: TestPattern,
    closed: Arc<AtomicBool>,
}

impl MockSession {
    fn metadata(request: &CaptureRequest, frame_number: u64) -> CaptureMetadata {
        let mut entries = BTreeMap::new();
        entries.insert(
            "sensor.sensitivity".to_owned(),
            MetadataValue::Int(i64::from(request.sensitivity)),
        );
        entries.insert(
            "sensor.exposure_time".to_owned(),
            MetadataValue::Int(i64::try_from(request.exposure_duration_ns).unwrap_or(i64::MAX)),
        );
        entries.insert(
            "sensor.frame_duration".to_owned(),
            MetadataValue::Int(i64::try_from(FRAME_INTERVAL_NS).unwrap_or(i64::MAX)),
        );
        entries.insert(
            "color_correction.gains".to_owned(),
            MetadataValue::FloatArray(vec![2.0, 1.0, 1.0, 1.8]),
        );
        entries.insert(
            "sensor.neutral_color_point".to_owned(),
            MetadataValue::FloatArray(vec![0.5, f64::NAN, 0.6]),
        );
        entries.insert(
            "vendor.tuning".to_owned(),
            MetadataValue::Opaque("TuningBlob".to_owned()),
        );

        CaptureMetadata {
            frame_number,
            sensor_timestamp_ns: frame_number * FRAME_INTERVAL_NS,
            entries,
        }
    }
}

impl CaptureSession for MockSession {
    fn capture(&mut self, request: &CaptureRequest, listener: Arc<dyn CaptureListener>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceFault("session already closed".to_owned()));
        }
        self.state.requests.lock().push(request.clone());

        let behavior = self
            .state
            .shots
            .lock()
            .pop_front()
            .unwrap_or(ShotBehavior::Succeed);
        let frame_number = self.state.next_frame.fetch_add(1, Ordering::SeqCst);
        let metadata = Self::metadata(request, frame_number);
        let level = exposure_level(request.sensitivity, request.exposure_duration_ns);
        tracing::trace!(frame_number, ?behavior, "mock capture");

        let deliver = {
            let state = Arc::clone(&self.state);
            let output = self.output.clone();
            let pattern = self.pattern;
            let closed = Arc::clone(&self.closed);
            move || {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let data = generate_bayer_frame(output.size, pattern, level);
                if let Some(frame) = state.allocate_frame(
                    output.size,
                    output.fourcc,
                    output.max_buffers,
                    frame_number,
                    data,
                ) {
                    output.listener.on_frame(frame);
                }
            }
        };
        let failure = CaptureFailure {
            frame_number,
            reason: FailureReason::Error,
        };

        match behavior {
            ShotBehavior::Succeed => after(EVENT_LATENCY, move || {
                listener.on_completed(metadata);
                thread::sleep(FRAME_LAG);
                deliver();
            }),
            ShotBehavior::FailCompletion => after(EVENT_LATENCY, move || listener.on_failed(failure)),
            ShotBehavior::NeverComplete => {
                self.state.parked_captures.lock().push(listener);
                after(EVENT_LATENCY, deliver);
            }
            ShotBehavior::LateFrame(delay) => after(EVENT_LATENCY, move || {
                listener.on_completed(metadata);
                thread::sleep(delay);
                deliver();
            }),
            ShotBehavior::NoFrame => after(EVENT_LATENCY, move || listener.on_completed(metadata)),
            ShotBehavior::DeviceError(code) => {
                let device = Arc::clone(&self.device_listener);
                after(EVENT_LATENCY, move || {
                    device.on_error(code);
                    listener.on_failed(failure);
                });
            }
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn after<F>(delay: Duration, event: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::spawn(move || {
        thread::sleep(delay);
        event();
    });
}

/// Brightest sample for a shot, scaled from sensitivity times exposure.
fn exposure_level(sensitivity: u32, exposure_duration_ns: u64) -> u16 {
    let level = (u64::from(sensitivity) * exposure_duration_ns / 1_000_000).min(u64::from(WHITE_LEVEL));
    u16::try_from(level).unwrap_or(WHITE_LEVEL)
}

/// Generate a 16-bit little-endian RGGB frame.
fn generate_bayer_frame(size: Size, pattern: TestPattern, level: u16) -> Vec<u8> {
    let mut data = vec![0u8; (size.width * size.height * 2) as usize];

    match pattern {
        TestPattern::ColorBars => generate_color_bars(&mut data, size, level),
        TestPattern::Gradient => generate_gradient(&mut data, size, level),
        TestPattern::Solid(value) => generate_solid(&mut data, value.min(WHITE_LEVEL)),
    }

    data
}

fn put_sample(data: &mut [u8], size: Size, x: u32, y: u32, value: u16) {
    let offset = ((y * size.width + x) * 2) as usize;
    if offset + 1 < data.len() {
        data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }
}

/// Color of the Bayer site at (x, y) for an RGGB mosaic.
const fn bayer_site(x: u32, y: u32, (r, g, b): (u16, u16, u16)) -> u16 {
    match (y % 2, x % 2) {
        (0, 0) => r,
        (1, 1) => b,
        _ => g,
    }
}

/// Eight vertical bars: White, Yellow, Cyan, Green, Magenta, Red, Blue, Black.
fn generate_color_bars(data: &mut [u8], size: Size, level: u16) {
    let bars: [(u16, u16, u16); 8] = [
        (1, 1, 1),
        (1, 1, 0),
        (0, 1, 1),
        (0, 1, 0),
        (1, 0, 1),
        (1, 0, 0),
        (0, 0, 1),
        (0, 0, 0),
    ];
    let bar_width = (size.width / 8).max(1);

    for y in 0..size.height {
        for x in 0..size.width {
            let bar = bars[(x / bar_width).min(7) as usize];
            put_sample(data, size, x, y, bayer_site(x, y, bar) * level);
        }
    }
}

fn generate_gradient(data: &mut [u8], size: Size, level: u16) {
    for y in 0..size.height {
        for x in 0..size.width {
            #[allow(clippy::cast_possible_truncation)]
            let value = (u64::from(x) * u64::from(level) / u64::from(size.width.max(1))) as u16;
            put_sample(data, size, x, y, value);
        }
    }
}

fn generate_solid(data: &mut [u8], value: u16) {
    for sample in data.chunks_exact_mut(2) {
        sample.copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::FrameBridge;
    use crate::latch::{latch, LatchSender};
    use crate::traits::ExposureParameters;

    fn sample(data: &[u8], size: Size, x: u32, y: u32) -> u16 {
        let offset = ((y * size.width + x) * 2) as usize;
        u16::from_le_bytes([data[offset], data[offset + 1]])
    }

    struct Opened(Mutex<Option<LatchSender<Box<dyn CameraDevice>>>>);

    impl DeviceStateListener for Opened {
        fn on_opened(&self, device: Box<dyn CameraDevice>) {
            if let Some(sender) = self.0.lock().take() {
                let _ = sender.fire(device);
            }
        }
        fn on_disconnected(&self) {}
        fn on_error(&self, _code: i32) {}
    }

    struct Configured(Mutex<Option<LatchSender<Box<dyn CaptureSession>>>>);

    impl SessionStateListener for Configured {
        fn on_configured(&self, session: Box<dyn CaptureSession>) {
            if let Some(sender) = self.0.lock().take() {
                let _ = sender.fire(session);
            }
        }
        fn on_configure_failed(&self) {}
    }

    struct Ignore;

    impl CaptureListener for Ignore {
        fn on_completed(&self, _metadata: CaptureMetadata) {}
        fn on_failed(&self, _failure: CaptureFailure) {}
    }

    fn open_session(platform: &MockPlatform, max_buffers: usize) -> (Box<dyn CameraDevice>, Box<dyn CaptureSession>, Arc<FrameBridge>) {
        let (sender, opened) = latch();
        platform
            .open_device(&DeviceId::new("0"), Arc::new(Opened(Mutex::new(Some(sender)))))
            .expect("open_device");
        let mut device = opened.wait_timeout(Duration::from_secs(1)).expect("opened");

        let bridge = Arc::new(FrameBridge::new());
        let (sender, configured) = latch();
        device
            .create_session(
                OutputTarget {
                    size: Size::new(128, 96),
                    fourcc: FourCC::RGGB,
                    max_buffers,
                    listener: Arc::clone(&bridge) as Arc<dyn crate::traits::FrameListener>,
                },
                Arc::new(Configured(Mutex::new(Some(sender)))),
            )
            .expect("create_session");
        let session = configured.wait_timeout(Duration::from_secs(1)).expect("configured");
        (device, session, bridge)
    }

    #[test]
    fn test_mock_platform_enumeration() {
        let platform = MockPlatform::with_cameras(vec![
            MockCamera::processed_only("1"),
            MockCamera::raw("0"),
        ]);
        let ids = platform.device_ids().expect("device_ids should succeed");
        assert_eq!(ids, vec![DeviceId::new("1"), DeviceId::new("0")]);

        let raw = platform.characteristics(&DeviceId::new("0")).expect("characteristics");
        assert!(raw.supports_raw());
        assert_eq!(raw.sensor_orientation, 90);
        let processed = platform.characteristics(&DeviceId::new("1")).expect("characteristics");
        assert!(!processed.supports_raw());
        assert!(platform.characteristics(&DeviceId::new("9")).is_err());
    }

    #[test]
    fn test_device_counters_follow_open_and_close() {
        let platform = MockPlatform::new();
        let (mut device, mut session, _bridge) = open_session(&platform, 3);
        assert_eq!(platform.open_attempts(), 1);
        assert_eq!(platform.open_devices(), 1);

        session.close().expect("session close");
        device.close().expect("device close");
        device.close().expect("second close");
        assert_eq!(platform.open_devices(), 0);
        assert_eq!(platform.max_concurrent_open(), 1);
    }

    #[test]
    fn test_buffer_pool_starves_when_frames_are_held() {
        let platform = MockPlatform::new();
        let (_device, mut session, bridge) = open_session(&platform, 1);
        let request = CaptureRequest::manual(&ExposureParameters::new(100, 1_000_000));

        session.capture(&request, Arc::new(Ignore)).expect("capture");
        thread::sleep(Duration::from_millis(30));
        let held = bridge.take_pending().expect("first frame");

        session.capture(&request, Arc::new(Ignore)).expect("capture");
        thread::sleep(Duration::from_millis(30));
        assert!(bridge.take_pending().is_none());
        assert_eq!(platform.starved_frames(), 1);
        assert_eq!(platform.outstanding_buffers(), 1);

        drop(held);
        assert_eq!(platform.outstanding_buffers(), 0);
    }

    #[test]
    fn test_color_bars_pattern() {
        let size = Size::new(64, 8);
        let data = generate_bayer_frame(size, TestPattern::ColorBars, 1000);
        assert_eq!(data.len(), 64 * 8 * 2);

        // First bar is white: every site lit.
        assert_eq!(sample(&data, size, 0, 0), 1000);
        assert_eq!(sample(&data, size, 1, 1), 1000);
        // Last bar is black.
        assert_eq!(sample(&data, size, 63, 7), 0);
        // Red bar (sixth): only the R site is lit.
        assert_eq!(sample(&data, size, 40, 0), 1000);
        assert_eq!(sample(&data, size, 41, 0), 0);
    }

    #[test]
    fn test_gradient_pattern() {
        let size = Size::new(64, 4);
        let data = generate_bayer_frame(size, TestPattern::Gradient, 1023);
        assert!(sample(&data, size, 0, 0) < 20);
        assert!(sample(&data, size, 63, 3) > 950);
    }

    #[test]
    fn test_solid_pattern_is_clamped() {
        let size = Size::new(4, 4);
        let data = generate_bayer_frame(size, TestPattern::Solid(5000), 0);
        assert!(data.chunks_exact(2).all(|s| u16::from_le_bytes([s[0], s[1]]) == WHITE_LEVEL));
    }

    #[test]
    fn test_exposure_level_scales_and_clamps() {
        assert_eq!(exposure_level(100, 1_000_000), 100);
        assert_eq!(exposure_level(800, 250_000), 200);
        assert_eq!(exposure_level(3200, 33_000_000), WHITE_LEVEL);
    }
}
