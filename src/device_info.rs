//! Static device snapshot written into every metadata sidecar.
//!
//! The snapshot describes the host (identity, OS, CPU count), the cameras the
//! platform enumerates and any motion/environment sensors exposed through
//! Linux IIO. It is read-only and never touches an open capture session.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::traits::{CameraPlatform, Capability};

const UNKNOWN: &str = "unknown";

/// Host identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceIdentity {
    /// Vendor of the machine or board.
    pub manufacturer: String,
    /// Product or board model.
    pub model: String,
    /// Operating system release.
    pub os_version: String,
    /// Hardware platform (board name or CPU architecture).
    pub hardware: String,
    /// Logical CPUs available.
    pub cpu_cores: usize,
}

/// One enumerated camera.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CameraDescriptor {
    /// Sensor rotation in degrees.
    pub sensor_orientation: u32,
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
}

/// One motion/environment sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorDescriptor {
    /// Driver-reported name.
    pub name: String,
    /// Sensor category (`accelerometer`, `gyroscope`, ...).
    pub kind: String,
    /// Vendor, when the driver exposes one.
    pub vendor: String,
    /// Scale of one raw count, when known.
    pub resolution: Option<f64>,
}

/// Everything the sidecar records about the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    /// Host identity.
    pub device: DeviceIdentity,
    /// Cameras keyed by device id.
    pub cameras: BTreeMap<String, CameraDescriptor>,
    /// Sensors keyed by IIO device name.
    pub sensors: BTreeMap<String, SensorDescriptor>,
}

/// Source of the static device snapshot.
pub trait DeviceInfoSource: Send + Sync {
    /// Return the snapshot.
    fn snapshot(&self) -> Result<DeviceSnapshot>;
}

/// Fixed snapshot, for tests and for callers that collect it themselves.
#[derive(Debug, Clone)]
pub struct StaticDeviceInfo(pub DeviceSnapshot);

impl DeviceInfoSource for StaticDeviceInfo {
    fn snapshot(&self) -> Result<DeviceSnapshot> {
        Ok(self.0.clone())
    }
}

/// Snapshot built from the camera platform and the host filesystem.
///
/// The first successful snapshot is cached.
pub struct PlatformDeviceInfo {
    platform: Arc<dyn CameraPlatform>,
    root: PathBuf,
    cached: Mutex<Option<DeviceSnapshot>>,
}

impl PlatformDeviceInfo {
    /// Read host data from `/`.
    pub fn new(platform: Arc<dyn CameraPlatform>) -> Self {
        Self::with_root(platform, "/")
    }

    /// Read host data below `root` instead of `/`.
    pub fn with_root<P: Into<PathBuf>>(platform: Arc<dyn CameraPlatform>, root: P) -> Self {
        Self {
            platform,
            root: root.into(),
            cached: Mutex::new(None),
        }
    }

    fn collect(&self) -> Result<DeviceSnapshot> {
        let ids = self
            .platform
            .device_ids()
            .map_err(|err| CaptureError::DeviceInfo(format!("cannot enumerate cameras: {err}")))?;

        let mut cameras = BTreeMap::new();
        for id in ids {
            match self.platform.characteristics(&id) {
                Ok(characteristics) => {
                    cameras.insert(
                        id.to_string(),
                        CameraDescriptor {
                            sensor_orientation: characteristics.sensor_orientation,
                            capabilities: characteristics.capabilities,
                        },
                    );
                }
                Err(err) => warn!(device = %id, %err, "camera left out of device snapshot"),
            }
        }

        Ok(DeviceSnapshot {
            device: self.identity(),
            cameras,
            sensors: self.iio_sensors(),
        })
    }

    fn identity(&self) -> DeviceIdentity {
        let dmi = self.root.join("sys/class/dmi/id");
        let device_tree = self.root.join("proc/device-tree");

        let model = read_attr(&device_tree.join("model"))
            .or_else(|| read_attr(&dmi.join("product_name")))
            .unwrap_or_else(|| UNKNOWN.to_owned());
        let hardware = read_attr(&device_tree.join("compatible"))
            .or_else(|| read_attr(&dmi.join("board_name")))
            .unwrap_or_else(|| std::env::consts::ARCH.to_owned());

        DeviceIdentity {
            manufacturer: read_attr(&dmi.join("sys_vendor")).unwrap_or_else(|| UNKNOWN.to_owned()),
            model,
            os_version: os_release(&self.root.join("etc/os-release"))
                .unwrap_or_else(|| std::env::consts::OS.to_owned()),
            hardware,
            cpu_cores: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
        }
    }

    fn iio_sensors(&self) -> BTreeMap<String, SensorDescriptor> {
        let mut sensors = BTreeMap::new();
        let Ok(entries) = fs::read_dir(self.root.join("sys/bus/iio/devices")) else {
            return sensors;
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = read_attr(&path.join("name")) else {
                continue;
            };
            let Some((kind, prefix)) = sensor_kind(&path) else {
                debug!(sensor = %name, "IIO device with no known channels");
                continue;
            };
            let resolution = read_attr(&path.join(format!("{prefix}_scale")))
                .and_then(|scale| scale.parse::<f64>().ok());
            let vendor = read_attr(&path.join("vendor")).unwrap_or_else(|| UNKNOWN.to_owned());

            let key = entry.file_name().to_string_lossy().into_owned();
            sensors.insert(
                key,
                SensorDescriptor {
                    name,
                    kind: kind.to_owned(),
                    vendor,
                    resolution,
                },
            );
        }
        sensors
    }
}

impl DeviceInfoSource for PlatformDeviceInfo {
    fn snapshot(&self) -> Result<DeviceSnapshot> {
        let mut cached = self.cached.lock();
        if let Some(snapshot) = cached.as_ref() {
            return Ok(snapshot.clone());
        }
        let snapshot = self.collect()?;
        debug!(
            cameras = snapshot.cameras.len(),
            sensors = snapshot.sensors.len(),
            "collected device snapshot"
        );
        *cached = Some(snapshot.clone());
        Ok(snapshot)
    }
}

/// Read a sysfs-style attribute: trimmed, NUL-terminated strings cut at the first NUL.
fn read_attr(path: &Path) -> Option<String> {
    let raw = fs::read(path).ok()?;
    let text = String::from_utf8_lossy(&raw);
    let value = text.split('\0').next().unwrap_or_default().trim();
    (!value.is_empty()).then(|| value.to_owned())
}

fn os_release(path: &Path) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    let field = |key: &str| {
        text.lines()
            .find_map(|line| line.strip_prefix(key)?.strip_prefix('='))
            .map(|value| value.trim_matches('"').to_owned())
    };
    field("PRETTY_NAME").or_else(|| field("NAME"))
}

/// Classify an IIO device by its first recognised channel prefix.
fn sensor_kind(device: &Path) -> Option<(&'static str, &'static str)> {
    const KINDS: [(&str, &str); 6] = [
        ("accelerometer", "in_accel"),
        ("gyroscope", "in_anglvel"),
        ("magnetometer", "in_magn"),
        ("light", "in_illuminance"),
        ("pressure", "in_pressure"),
        ("temperature", "in_temp"),
    ];

    let channels: Vec<String> = fs::read_dir(device)
        .ok()?
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();

    KINDS
        .into_iter()
        .find(|(_, prefix)| channels.iter().any(|channel| channel.starts_with(prefix)))
}
