//! V4L2 camera platform using the v4l crate.
//!
//! Bayer capture formats are treated as the raw capability. Every capture
//! request applies manual exposure controls, then pulls one frame from a
//! short-lived mmap stream on a background thread, skipping warm-up frames
//! that may still carry the previous exposure.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use v4l::buffer::Type;
use v4l::control::{Control, Description, Value};
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream as _;
use v4l::video::Capture;
use v4l::Device;

use crate::error::{CaptureError, Result};
use crate::traits::{
    AwbMode, CameraDevice, CameraPlatform, Capability, CaptureFailure, CaptureListener,
    CaptureMetadata, CaptureRequest, CaptureSession, DeviceCharacteristics, DeviceId,
    DeviceStateListener, FailureReason, FourCC, MetadataValue, OutputTarget, RawFrame,
    SessionStateListener, Size,
};

const CID_AUTO_WHITE_BALANCE: u32 = 0x0098_090c;
const CID_GAIN: u32 = 0x0098_0913;
const CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const CID_ISO_SENSITIVITY: u32 = 0x009a_0917;
const CID_ISO_SENSITIVITY_AUTO: u32 = 0x009a_0918;

const EXPOSURE_MANUAL: i64 = 1;
const ISO_SENSITIVITY_MANUAL: i64 = 0;
/// `V4L2_CID_EXPOSURE_ABSOLUTE` counts in 100 microsecond units.
const EXPOSURE_UNIT_NS: u64 = 100_000;
/// Frames discarded after stream start before one is kept.
const WARMUP_FRAMES: usize = 2;
const ENODEV: i32 = 19;

fn device_error(id: &DeviceId, err: &io::Error) -> CaptureError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        CaptureError::AccessDenied(format!("{id}: {err}"))
    } else {
        CaptureError::DeviceFault(format!("{id}: {err}"))
    }
}

fn spawn_named<F>(name: &str, event: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new().name(name.to_owned()).spawn(event)?;
    Ok(())
}

/// All `/dev/video*` nodes.
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Platform;

impl V4l2Platform {
    /// Create the platform.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn open(id: &DeviceId) -> Result<Device> {
        Device::with_path(PathBuf::from(id.as_str())).map_err(|err| device_error(id, &err))
    }
}

impl CameraPlatform for V4l2Platform {
    fn device_ids(&self) -> Result<Vec<DeviceId>> {
        let mut nodes = v4l::context::enum_devices();
        nodes.sort_by_key(v4l::context::Node::index);
        Ok(nodes
            .iter()
            .map(|node| DeviceId::new(node.path().display().to_string()))
            .collect())
    }

    fn characteristics(&self, id: &DeviceId) -> Result<DeviceCharacteristics> {
        let device = Self::open(id)?;
        let caps = device.query_caps().map_err(|err| device_error(id, &err))?;

        let mut characteristics = DeviceCharacteristics::default();
        characteristics
            .entries
            .insert("v4l2.driver".to_owned(), MetadataValue::Text(caps.driver));
        characteristics
            .entries
            .insert("v4l2.card".to_owned(), MetadataValue::Text(caps.card));
        characteristics
            .entries
            .insert("v4l2.bus".to_owned(), MetadataValue::Text(caps.bus));

        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Ok(characteristics);
        }

        let formats = device.enum_formats().map_err(|err| device_error(id, &err))?;
        let mut processed = false;
        for description in &formats {
            let fourcc = FourCC::from(description.fourcc);
            if !fourcc.is_raw_bayer() {
                processed = true;
                continue;
            }
            characteristics.raw_formats.push(fourcc);
            match device.enum_framesizes(description.fourcc) {
                Ok(sizes) => {
                    for frame_size in sizes {
                        let size = match frame_size.size {
                            FrameSizeEnum::Discrete(discrete) => {
                                Size::new(discrete.width, discrete.height)
                            }
                            FrameSizeEnum::Stepwise(stepwise) => {
                                Size::new(stepwise.max_width, stepwise.max_height)
                            }
                        };
                        if !characteristics.raw_output_sizes.contains(&size) {
                            characteristics.raw_output_sizes.push(size);
                        }
                    }
                }
                Err(err) => debug!(device = %id, %fourcc, %err, "no frame sizes for format"),
            }
        }

        characteristics.entries.insert(
            "v4l2.formats".to_owned(),
            MetadataValue::Text(
                formats
                    .iter()
                    .map(|description| FourCC::from(description.fourcc).to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
        );

        if processed {
            characteristics.capabilities.push(Capability::BackwardCompatible);
        }
        let controls = device.query_controls().unwrap_or_default();
        if controls.iter().any(|control| control.id == CID_EXPOSURE_ABSOLUTE) {
            characteristics.capabilities.push(Capability::ManualSensor);
        }
        if !characteristics.raw_formats.is_empty() {
            characteristics.capabilities.push(Capability::Raw);
        }

        debug!(
            device = %id,
            raw_formats = characteristics.raw_formats.len(),
            raw_sizes = characteristics.raw_output_sizes.len(),
            "queried characteristics"
        );
        Ok(characteristics)
    }

    fn open_device(&self, id: &DeviceId, listener: Arc<dyn DeviceStateListener>) -> Result<()> {
        let device = Self::open(id)?;
        let camera = V4l2Camera {
            id: id.clone(),
            device: Arc::new(device),
            listener: Arc::clone(&listener),
            closed: false,
        };
        info!(device = %id, "opened V4L2 device");
        spawn_named("v4l2-open", move || listener.on_opened(Box::new(camera)))
    }
}

/// An open V4L2 node.
pub struct V4l2Camera {
    id: DeviceId,
    device: Arc<Device>,
    listener: Arc<dyn DeviceStateListener>,
    closed: bool,
}

impl CameraDevice for V4l2Camera {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn create_session(
        &mut self,
        output: OutputTarget,
        listener: Arc<dyn SessionStateListener>,
    ) -> Result<()> {
        if self.closed {
            return Err(CaptureError::DeviceFault(format!("{} already closed", self.id)));
        }

        let requested = v4l::Format::new(output.size.width, output.size.height, output.fourcc.into());
        let applied = self.device.set_format(&requested);
        let session = match applied {
            Ok(format)
                if format.width == output.size.width
                    && format.height == output.size.height
                    && FourCC::from(format.fourcc) == output.fourcc =>
            {
                info!(
                    device = %self.id,
                    size = %output.size,
                    fourcc = %output.fourcc,
                    "raw format applied"
                );
                Some(V4l2Session {
                    device: Arc::clone(&self.device),
                    device_listener: Arc::clone(&self.listener),
                    output,
                    streaming: Arc::new(Mutex::new(())),
                    closed: Arc::new(AtomicBool::new(false)),
                })
            }
            Ok(format) => {
                warn!(
                    device = %self.id,
                    width = format.width,
                    height = format.height,
                    fourcc = %FourCC::from(format.fourcc),
                    "driver substituted a different format"
                );
                None
            }
            Err(err) => {
                warn!(device = %self.id, %err, "set_format failed");
                None
            }
        };

        spawn_named("v4l2-configure", move || match session {
            Some(session) => listener.on_configured(Box::new(session)),
            None => listener.on_configure_failed(),
        })
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            debug!(device = %self.id, "V4L2 device closed");
        }
        Ok(())
    }
}

/// Streaming session on an open node.
pub struct V4l2Session {
    device: Arc<Device>,
    device_listener: Arc<dyn DeviceStateListener>,
    output: OutputTarget,
    streaming: Arc<Mutex<()>>,
    closed: Arc<AtomicBool>,
}

fn find_control(controls: &[Description], id: u32) -> Option<&Description> {
    controls.iter().find(|control| control.id == id)
}

fn set_integer(device: &Device, controls: &[Description], id: u32, value: i64) -> io::Result<bool> {
    let Some(description) = find_control(controls, id) else {
        trace!(control = id, "control not supported");
        return Ok(false);
    };
    let value = value.clamp(description.minimum, description.maximum);
    device.set_control(Control {
        id,
        value: Value::Integer(value),
    })?;
    trace!(control = %description.name, value, "control set");
    Ok(true)
}

/// Apply the request's manual exposure to the device controls.
fn apply_request(device: &Device, request: &CaptureRequest) -> io::Result<()> {
    let controls = device.query_controls()?;

    set_integer(device, &controls, CID_EXPOSURE_AUTO, EXPOSURE_MANUAL)?;
    let units = (request.exposure_duration_ns / EXPOSURE_UNIT_NS).max(1);
    set_integer(
        device,
        &controls,
        CID_EXPOSURE_ABSOLUTE,
        i64::try_from(units).unwrap_or(i64::MAX),
    )?;

    set_integer(device, &controls, CID_ISO_SENSITIVITY_AUTO, ISO_SENSITIVITY_MANUAL)?;
    let sensitivity = i64::from(request.sensitivity);
    if !set_integer(device, &controls, CID_ISO_SENSITIVITY, sensitivity)? {
        // No ISO control: treat ISO 100 as unity analogue gain.
        set_integer(device, &controls, CID_GAIN, sensitivity / 100)?;
    }

    set_integer(
        device,
        &controls,
        CID_AUTO_WHITE_BALANCE,
        i64::from(request.awb_mode == AwbMode::Auto),
    )?;
    Ok(())
}

struct Grab {
    data: Vec<u8>,
    sequence: u64,
    timestamp_ns: u64,
}

fn grab_frame(device: &Device, buffers: u32) -> io::Result<Grab> {
    let mut stream = Stream::with_buffers(device, Type::VideoCapture, buffers)?;
    for _ in 0..WARMUP_FRAMES {
        stream.next()?;
    }
    let (buf, meta) = stream.next()?;
    let used = usize::try_from(meta.bytesused).map_or(buf.len(), |used| used.min(buf.len()));

    // V4L2 timestamps are non-negative in practice.
    let secs = u64::try_from(meta.timestamp.sec).unwrap_or(0);
    let usecs = u64::try_from(meta.timestamp.usec).unwrap_or(0);
    Ok(Grab {
        data: buf.get(..used).unwrap_or(buf).to_vec(),
        sequence: u64::from(meta.sequence),
        timestamp_ns: secs * 1_000_000_000 + usecs * 1_000,
    })
}

impl CaptureSession for V4l2Session {
    fn capture(&mut self, request: &CaptureRequest, listener: Arc<dyn CaptureListener>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CaptureError::DeviceFault("session already closed".to_owned()));
        }
        apply_request(&self.device, request)
            .map_err(|err| CaptureError::ShotFailed(format!("exposure controls rejected: {err}")))?;

        let device = Arc::clone(&self.device);
        let device_listener = Arc::clone(&self.device_listener);
        let output = self.output.clone();
        let streaming = Arc::clone(&self.streaming);
        let closed = Arc::clone(&self.closed);
        let sensitivity = request.sensitivity;
        let exposure_ns = request.exposure_duration_ns;
        let buffers = u32::try_from(output.max_buffers).unwrap_or(u32::MAX).max(1);

        spawn_named("v4l2-capture", move || {
            let grabbed = {
                let _streaming = streaming.lock();
                grab_frame(&device, buffers)
            };
            match grabbed {
                Ok(grab) => {
                    if closed.load(Ordering::SeqCst) {
                        return;
                    }
                    let mut entries = std::collections::BTreeMap::new();
                    entries.insert(
                        "sensor.sensitivity".to_owned(),
                        MetadataValue::Int(i64::from(sensitivity)),
                    );
                    entries.insert(
                        "sensor.exposure_time".to_owned(),
                        MetadataValue::Int(i64::try_from(exposure_ns).unwrap_or(i64::MAX)),
                    );
                    entries.insert(
                        "v4l2.bytes_used".to_owned(),
                        MetadataValue::Int(i64::try_from(grab.data.len()).unwrap_or(i64::MAX)),
                    );
                    listener.on_completed(CaptureMetadata {
                        frame_number: grab.sequence,
                        sensor_timestamp_ns: grab.timestamp_ns,
                        entries,
                    });
                    output.listener.on_frame(RawFrame::new(
                        grab.data,
                        output.size,
                        output.fourcc,
                        grab.sequence,
                        grab.timestamp_ns,
                    ));
                }
                Err(err) => {
                    warn!(%err, "V4L2 capture failed");
                    if err.raw_os_error() == Some(ENODEV) {
                        device_listener.on_disconnected();
                    }
                    listener.on_failed(CaptureFailure {
                        frame_number: 0,
                        reason: FailureReason::Error,
                    });
                }
            }
        })
    }

    fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
