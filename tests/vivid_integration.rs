//! Integration tests using vivid virtual camera.
//!
//! These tests require:
//! - The `integration` feature flag: `cargo test --features integration`
//! - The vivid kernel module loaded, e.g. `sudo modprobe vivid n_devs=1`
//! - Access to /dev/video* devices (may require sudo or video group membership)
//!
//! vivid's webcam input advertises 8/10/12-bit Bayer formats alongside its
//! processed ones, which is what the raw capture path selects.
//!
//! Tests will fail if vivid is not available.

#![cfg(feature = "integration")]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use raw_burst_capture::config::CaptureConfig;
use raw_burst_capture::device_info::{DeviceIdentity, DeviceSnapshot, StaticDeviceInfo};
use raw_burst_capture::session::{SessionController, SessionSettings};
use raw_burst_capture::shot::{capture_one, ShotPolicy};
use raw_burst_capture::traits::{
    CameraPlatform, DeviceCharacteristics, DeviceId, DeviceStateListener,
};
use raw_burst_capture::validation::{validate_burst_order, validate_outcome};
use raw_burst_capture::{
    AccessGate, BurstCapture, ExposureParameters, PersistenceWriter, RawDumpWriter,
    V4l2Platform,
};
use serial_test::serial;

/// Find all available vivid virtual camera nodes.
///
/// Uses sysfs to check the driver name before opening, avoiding
/// unnecessary device opens on real cameras.
fn find_vivid_devices() -> Vec<DeviceId> {
    let video4linux = Path::new("/sys/class/video4linux");
    if !video4linux.exists() {
        return Vec::new();
    }

    let platform = V4l2Platform::new();
    let mut devices = Vec::new();
    for index in 0..10 {
        let name_path = video4linux.join(format!("video{index}")).join("name");
        let Ok(name) = fs::read_to_string(&name_path) else {
            continue;
        };

        if !name.to_lowercase().contains("vivid") {
            continue;
        }

        // Verify we can actually query it
        let id = DeviceId::new(format!("/dev/video{index}"));
        if platform.characteristics(&id).is_ok() {
            devices.push(id);
        }
    }
    devices
}

/// Macro to fail test if vivid is not available.
///
/// Returns the first vivid node that advertises raw output.
/// Integration tests MUST have vivid loaded - they should fail, not silently skip.
macro_rules! require_vivid {
    () => {
        match find_vivid_devices()
            .into_iter()
            .find(|id| V4l2Platform::new().characteristics(id).is_ok_and(|c| c.supports_raw()))
        {
            Some(id) => id,
            None => {
                panic!(
                    "vivid virtual camera with raw formats not available.\n\
                     Load vivid with: sudo modprobe vivid n_devs=1\n\
                     Or run unit tests only: cargo test --lib"
                );
            }
        }
    };
}

/// Restricts enumeration to one node so bursts never touch a real camera.
struct SingleNode {
    inner: V4l2Platform,
    id: DeviceId,
}

impl CameraPlatform for SingleNode {
    fn device_ids(&self) -> raw_burst_capture::Result<Vec<DeviceId>> {
        Ok(vec![self.id.clone()])
    }

    fn characteristics(&self, id: &DeviceId) -> raw_burst_capture::Result<DeviceCharacteristics> {
        self.inner.characteristics(id)
    }

    fn open_device(
        &self,
        id: &DeviceId,
        listener: Arc<dyn DeviceStateListener>,
    ) -> raw_burst_capture::Result<()> {
        self.inner.open_device(id, listener)
    }
}

fn single_node(id: &DeviceId) -> Arc<SingleNode> {
    Arc::new(SingleNode {
        inner: V4l2Platform::new(),
        id: id.clone(),
    })
}

fn test_config(dir: &Path) -> CaptureConfig {
    CaptureConfig {
        output_dir: dir.to_path_buf(),
        settle_delay: std::time::Duration::from_millis(50),
        ..CaptureConfig::default()
    }
}

#[test]
#[serial]
fn test_vivid_enumerated() {
    let id = require_vivid!();

    let ids = V4l2Platform::new().device_ids().expect("Failed to enumerate");
    println!("Enumerated nodes: {ids:?}");
    assert!(ids.contains(&id), "vivid node {id} should be enumerated");
}

#[test]
#[serial]
fn test_vivid_raw_characteristics() {
    let id = require_vivid!();

    let characteristics = V4l2Platform::new()
        .characteristics(&id)
        .expect("Failed to query characteristics");

    println!("vivid characteristics:");
    println!("  Capabilities: {:?}", characteristics.capabilities);
    println!("  Raw formats: {:?}", characteristics.raw_formats);
    println!("  Raw sizes: {:?}", characteristics.raw_output_sizes);

    assert!(characteristics.supports_raw(), "vivid should advertise raw");
    assert!(
        characteristics.raw_formats.iter().all(|fourcc| fourcc.is_raw_bayer()),
        "only Bayer formats count as raw"
    );
    assert!(!characteristics.raw_output_sizes.is_empty());
    assert!(characteristics.entries.contains_key("v4l2.driver"));
}

#[test]
#[serial]
fn test_vivid_open_configure_close_releases_gate() {
    let id = require_vivid!();
    let gate = AccessGate::new();
    let config = CaptureConfig::default();

    let mut controller =
        SessionController::new(single_node(&id), gate.clone(), SessionSettings::from(&config));
    let selected = controller.select_capable_device().expect("select vivid");
    assert_eq!(selected, id);

    let size = controller
        .negotiate_output_size(&selected)
        .expect("negotiate size");
    println!("Negotiated raw size: {size}");

    controller.open(&selected).expect("open vivid");
    assert!(gate.is_held(), "gate is held while the device is open");
    controller.configure_session(size).expect("configure vivid");

    controller.close();
    assert!(!gate.is_held(), "gate released after close");
}

#[test]
#[serial]
fn test_vivid_single_shot() {
    let id = require_vivid!();
    let config = CaptureConfig::default();

    let mut controller = SessionController::new(
        single_node(&id),
        AccessGate::new(),
        SessionSettings::from(&config),
    );
    let size = controller.negotiate_output_size(&id).expect("negotiate size");
    controller.open(&id).expect("open vivid");
    controller.configure_session(size).expect("configure vivid");

    let shot = capture_one(
        &mut controller,
        &ExposureParameters::new(400, 10_000_000),
        &ShotPolicy::from(&config),
    )
    .expect("Failed to capture");

    println!(
        "Captured {} ({}) with {} bytes, sequence {}",
        shot.frame.size,
        shot.frame.fourcc,
        shot.frame.data.len(),
        shot.frame.sequence
    );
    assert_eq!(shot.frame.size, size);
    assert!(shot.frame.fourcc.is_raw_bayer());
    assert!(!shot.frame.data.is_empty());

    drop(shot);
    controller.close();
}

#[test]
#[serial]
fn test_vivid_burst_persists_every_shot() {
    let id = require_vivid!();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = test_config(dir.path());
    let shots = config.shots.clone();

    let device_info = StaticDeviceInfo(DeviceSnapshot {
        device: DeviceIdentity {
            manufacturer: "vivid".to_owned(),
            model: "virtual".to_owned(),
            os_version: "Linux".to_owned(),
            hardware: std::env::consts::ARCH.to_owned(),
            cpu_cores: 1,
        },
        cameras: std::collections::BTreeMap::new(),
        sensors: std::collections::BTreeMap::new(),
    });
    let persistence = PersistenceWriter::new(
        dir.path().to_path_buf(),
        Arc::new(RawDumpWriter),
        Arc::new(device_info),
    );
    let gate = AccessGate::new();
    let burst = BurstCapture::new(single_node(&id), gate.clone(), config, persistence)
        .expect("Failed to start burst capture");

    let outcomes = burst.capture_burst_blocking(shots.clone());

    for outcome in &outcomes {
        println!(
            "ISO {} / {} ns -> {}",
            outcome.parameters.sensitivity,
            outcome.parameters.exposure_duration_ns,
            outcome.image_file.display()
        );
        validate_outcome(outcome).expect("outcome should validate");
    }
    assert_eq!(outcomes.len(), shots.len(), "vivid should deliver every shot");
    validate_burst_order(&outcomes, &shots).expect("order preserved");
    assert!(!gate.is_held(), "gate released after the burst");
}
