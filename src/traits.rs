//! Core traits and types for the camera platform abstraction.
//!
//! The platform is event driven: opening a device, configuring a session and
//! completing a capture all report back through listener traits, possibly on
//! threads owned by the platform. The session controller turns those events
//! into blocking, timeout-bounded steps.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Pixel format representation (e.g., RGGB, BA81, pRAA).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// 8-bit Bayer RGGB.
    pub const RGGB: Self = Self::new(b"RGGB");
    /// 8-bit Bayer BGGR.
    pub const BA81: Self = Self::new(b"BA81");
    /// 8-bit Bayer GBRG.
    pub const GBRG: Self = Self::new(b"GBRG");
    /// 8-bit Bayer GRBG.
    pub const GRBG: Self = Self::new(b"GRBG");
    /// 10-bit Bayer RGGB, padded to 16 bits.
    pub const RG10: Self = Self::new(b"RG10");
    /// 10-bit Bayer BGGR, padded to 16 bits.
    pub const BG10: Self = Self::new(b"BG10");
    /// 10-bit Bayer GBRG, padded to 16 bits.
    pub const GB10: Self = Self::new(b"GB10");
    /// 10-bit Bayer GRBG, padded to 16 bits.
    pub const BA10: Self = Self::new(b"BA10");
    /// 10-bit Bayer RGGB, MIPI packed.
    pub const P_RAA: Self = Self::new(b"pRAA");
    /// 10-bit Bayer BGGR, MIPI packed.
    pub const P_BAA: Self = Self::new(b"pBAA");
    /// 10-bit Bayer GBRG, MIPI packed.
    pub const P_GAA: Self = Self::new(b"pGAA");
    /// 10-bit Bayer GRBG, MIPI packed.
    pub const P_G_AA: Self = Self::new(b"pgAA");
    /// 12-bit Bayer RGGB, padded to 16 bits.
    pub const RG12: Self = Self::new(b"RG12");
    /// 12-bit Bayer BGGR, padded to 16 bits.
    pub const BG12: Self = Self::new(b"BG12");
    /// 12-bit Bayer GBRG, padded to 16 bits.
    pub const GB12: Self = Self::new(b"GB12");
    /// 12-bit Bayer GRBG, padded to 16 bits.
    pub const BA12: Self = Self::new(b"BA12");
    /// 16-bit Bayer BGGR.
    pub const BYR2: Self = Self::new(b"BYR2");

    /// Every FourCC treated as a raw (undemosaiced) sensor layout.
    pub const RAW_BAYER: [Self; 17] = [
        Self::RGGB,
        Self::BA81,
        Self::GBRG,
        Self::GRBG,
        Self::RG10,
        Self::BG10,
        Self::GB10,
        Self::BA10,
        Self::P_RAA,
        Self::P_BAA,
        Self::P_GAA,
        Self::P_G_AA,
        Self::RG12,
        Self::BG12,
        Self::GB12,
        Self::BA12,
        Self::BYR2,
    ];

    /// Whether this format carries raw Bayer sensor data.
    #[must_use]
    pub fn is_raw_bayer(self) -> bool {
        Self::RAW_BAYER.contains(&self)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(feature = "v4l2")]
impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

#[cfg(feature = "v4l2")]
impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Output dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Size {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Size {
    /// Create a new size.
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Pixel area, used to pick the largest output configuration.
    #[must_use]
    pub const fn area(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Platform identifier of a camera device (a node path for V4L2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(pub String);

impl DeviceId {
    /// Create a device id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capabilities a device can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Plain processed capture.
    BackwardCompatible,
    /// Manual sensitivity and exposure control.
    ManualSensor,
    /// Raw sensor output.
    Raw,
}

/// A characteristic or capture-result value.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// Floating point value; non-finite values cannot be serialized.
    Float(f64),
    /// Text value.
    Text(String),
    /// Integer array (e.g. black level pattern).
    IntArray(Vec<i64>),
    /// Float array (e.g. color transform).
    FloatArray(Vec<f64>),
    /// Rational value as numerator/denominator.
    Rational(i32, i32),
    /// Platform value without a portable representation; carries its type name.
    Opaque(String),
}

impl MetadataValue {
    /// Convert to JSON, or explain why the value cannot be represented.
    pub fn to_json(&self) -> std::result::Result<serde_json::Value, String> {
        use serde_json::Value;

        let finite = |v: f64| {
            serde_json::Number::from_f64(v)
                .map(Value::Number)
                .ok_or_else(|| format!("non-finite float {v}"))
        };

        match self {
            Self::Bool(v) => Ok(Value::Bool(*v)),
            Self::Int(v) => Ok(Value::from(*v)),
            Self::Float(v) => finite(*v),
            Self::Text(v) => Ok(Value::String(v.clone())),
            Self::IntArray(v) => Ok(Value::from(v.clone())),
            Self::FloatArray(v) => v
                .iter()
                .map(|x| finite(*x))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Self::Rational(_, 0) => Err("rational with zero denominator".to_owned()),
            Self::Rational(n, d) => Ok(serde_json::json!({ "numerator": n, "denominator": d })),
            Self::Opaque(kind) => Err(format!("opaque value of type {kind}")),
        }
    }
}

/// Static description of a camera device.
#[derive(Debug, Clone, Default)]
pub struct DeviceCharacteristics {
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// Raw formats the device can stream.
    pub raw_formats: Vec<FourCC>,
    /// Output sizes available for raw formats.
    pub raw_output_sizes: Vec<Size>,
    /// Clockwise rotation of the sensor relative to the device, in degrees.
    pub sensor_orientation: u32,
    /// Free-form calibration and identity entries.
    pub entries: BTreeMap<String, MetadataValue>,
}

impl DeviceCharacteristics {
    /// Whether the device advertises raw capture.
    #[must_use]
    pub fn supports_raw(&self) -> bool {
        self.capabilities.contains(&Capability::Raw)
    }
}

/// Manual exposure settings for one shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposureParameters {
    /// Sensor gain (ISO).
    #[serde(rename = "iso")]
    pub sensitivity: u32,
    /// Exposure duration in nanoseconds.
    #[serde(rename = "exposure_time_ns")]
    pub exposure_duration_ns: u64,
}

impl ExposureParameters {
    /// Create a parameter set.
    #[must_use]
    pub const fn new(sensitivity: u32, exposure_duration_ns: u64) -> Self {
        Self {
            sensitivity,
            exposure_duration_ns,
        }
    }
}

/// Request template, mirroring the intent of the shot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTemplate {
    /// High quality single still.
    StillCapture,
}

/// Auto-exposure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeMode {
    /// Sensitivity and exposure are taken from the request.
    Off,
    /// The device picks exposure itself.
    On,
}

/// Auto-white-balance mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwbMode {
    /// White balance is not applied.
    Off,
    /// The device estimates white balance (raw data is unaffected).
    Auto,
}

/// One exposure request submitted to a capture session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    /// Request template.
    pub template: RequestTemplate,
    /// Requested sensor gain.
    pub sensitivity: u32,
    /// Requested exposure duration in nanoseconds.
    pub exposure_duration_ns: u64,
    /// Auto-exposure mode.
    pub ae_mode: AeMode,
    /// Auto-white-balance mode.
    pub awb_mode: AwbMode,
}

impl CaptureRequest {
    /// Build a still request that honors `params` exactly (auto-exposure off).
    #[must_use]
    pub const fn manual(params: &ExposureParameters) -> Self {
        Self {
            template: RequestTemplate::StillCapture,
            sensitivity: params.sensitivity,
            exposure_duration_ns: params.exposure_duration_ns,
            ae_mode: AeMode::Off,
            awb_mode: AwbMode::Auto,
        }
    }
}

/// Result metadata reported when a capture completes.
#[derive(Debug, Clone, Default)]
pub struct CaptureMetadata {
    /// Platform frame counter.
    pub frame_number: u64,
    /// Start-of-exposure timestamp; matches [`RawFrame::timestamp_ns`], 0 if unknown.
    pub sensor_timestamp_ns: u64,
    /// Per-capture entries (applied exposure, gains, ...).
    pub entries: BTreeMap<String, MetadataValue>,
}

/// Why a capture failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The device dropped or aborted the capture.
    Error,
    /// The request was flushed before it could run.
    Flushed,
}

/// Failure report for a capture request.
#[derive(Debug, Clone)]
pub struct CaptureFailure {
    /// Platform frame counter.
    pub frame_number: u64,
    /// Failure reason.
    pub reason: FailureReason,
}

/// A raw sensor buffer delivered by the streaming output.
///
/// The buffer belongs to a bounded pool; dropping the frame returns it.
pub struct RawFrame {
    /// Raw sensor bytes.
    pub data: Vec<u8>,
    /// Frame dimensions.
    pub size: Size,
    /// Sensor layout of `data`.
    pub fourcc: FourCC,
    /// Frame sequence number.
    pub sequence: u64,
    /// Start-of-exposure timestamp in nanoseconds.
    pub timestamp_ns: u64,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl RawFrame {
    /// Create a frame that needs no release.
    #[must_use]
    pub fn new(
        data: Vec<u8>,
        size: Size,
        fourcc: FourCC,
        sequence: u64,
        timestamp_ns: u64,
    ) -> Self {
        Self {
            data,
            size,
            fourcc,
            sequence,
            timestamp_ns,
            release: None,
        }
    }

    /// Attach a hook that returns the buffer to its pool when the frame is dropped.
    #[must_use]
    pub fn with_release<F>(mut self, release: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.release = Some(Box::new(release));
        self
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("bytes", &self.data.len())
            .field("size", &self.size)
            .field("fourcc", &self.fourcc)
            .field("sequence", &self.sequence)
            .field("timestamp_ns", &self.timestamp_ns)
            .finish_non_exhaustive()
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// The single streaming output negotiated for a session.
#[derive(Clone)]
pub struct OutputTarget {
    /// Output dimensions.
    pub size: Size,
    /// Raw layout to stream.
    pub fourcc: FourCC,
    /// Maximum number of buffers that may be outstanding at once.
    pub max_buffers: usize,
    /// Receiver of delivered frames.
    pub listener: Arc<dyn FrameListener>,
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputTarget")
            .field("size", &self.size)
            .field("fourcc", &self.fourcc)
            .field("max_buffers", &self.max_buffers)
            .finish_non_exhaustive()
    }
}

/// Entry point to the camera hardware.
pub trait CameraPlatform: Send + Sync {
    /// Identifiers of all available devices.
    fn device_ids(&self) -> Result<Vec<DeviceId>>;

    /// Static characteristics of a device.
    fn characteristics(&self, id: &DeviceId) -> Result<DeviceCharacteristics>;

    /// Start opening a device. Returns once the request is accepted; the
    /// outcome and any later fault are reported to `listener`.
    fn open_device(&self, id: &DeviceId, listener: Arc<dyn DeviceStateListener>) -> Result<()>;
}

/// Receives device lifecycle notifications.
pub trait DeviceStateListener: Send + Sync {
    /// The device finished opening.
    fn on_opened(&self, device: Box<dyn CameraDevice>);

    /// The device went away.
    fn on_disconnected(&self);

    /// The device reported a fatal error.
    fn on_error(&self, code: i32);
}

/// An open camera device.
pub trait CameraDevice: Send {
    /// Device identifier.
    fn id(&self) -> &DeviceId;

    /// Start configuring a session with exactly one streaming output.
    fn create_session(
        &mut self,
        output: OutputTarget,
        listener: Arc<dyn SessionStateListener>,
    ) -> Result<()>;

    /// Close the device. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Receives session configuration outcomes.
pub trait SessionStateListener: Send + Sync {
    /// The session is configured and ready for requests.
    fn on_configured(&self, session: Box<dyn CaptureSession>);

    /// The output configuration was rejected.
    fn on_configure_failed(&self);
}

/// A configured streaming session.
pub trait CaptureSession: Send {
    /// Submit one request; its outcome is reported to `listener`.
    fn capture(&mut self, request: &CaptureRequest, listener: Arc<dyn CaptureListener>)
        -> Result<()>;

    /// Close the session. Calling it again is a no-op.
    fn close(&mut self) -> Result<()>;
}

/// Receives the completion of a single capture request.
pub trait CaptureListener: Send + Sync {
    /// The capture completed.
    fn on_completed(&self, metadata: CaptureMetadata);

    /// The capture failed.
    fn on_failed(&self, failure: CaptureFailure);
}

/// Receives frames from the streaming output.
pub trait FrameListener: Send + Sync {
    /// A frame was delivered.
    fn on_frame(&self, frame: RawFrame);
}
