//! Persistence of captured shots.
//!
//! Each shot becomes two siblings sharing a base name derived from the
//! current time: `<base>.<ext>` written by a [`ContainerWriter`] and
//! `<base>.json`, a pretty-printed sidecar. A failed write removes the partial
//! file; a failed sidecar also removes the raw sibling, so an outcome is only
//! ever produced for a complete pair.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::device_info::DeviceInfoSource;
use crate::error::{CaptureError, Result};
use crate::shot::CapturedShot;
use crate::traits::{CaptureMetadata, DeviceCharacteristics, ExposureParameters, MetadataValue, RawFrame};

/// Writes a raw buffer as a sensor-native container.
pub trait ContainerWriter: Send + Sync {
    /// File extension, without the dot.
    fn extension(&self) -> &str;

    /// Write `frame`, tagged with the capture result and device characteristics.
    fn write(
        &self,
        frame: &RawFrame,
        capture: &CaptureMetadata,
        characteristics: &DeviceCharacteristics,
        out: &mut dyn Write,
    ) -> io::Result<()>;
}

/// Writes the sensor bytes unchanged; all tagging lives in the sidecar.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDumpWriter;

impl ContainerWriter for RawDumpWriter {
    fn extension(&self) -> &str {
        "raw"
    }

    fn write(
        &self,
        frame: &RawFrame,
        _capture: &CaptureMetadata,
        _characteristics: &DeviceCharacteristics,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        out.write_all(&frame.data)
    }
}

/// A fully persisted shot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaptureOutcome {
    /// Raw container file.
    pub image_file: PathBuf,
    /// JSON sidecar.
    pub metadata_file: PathBuf,
    /// Parameters the shot was requested with.
    pub parameters: ExposureParameters,
}

/// Outcomes of one burst, in request order; failed shots are omitted.
pub type BurstResult = Vec<CaptureOutcome>;

/// Writes shots into one output directory.
pub struct PersistenceWriter {
    output_dir: PathBuf,
    container: Arc<dyn ContainerWriter>,
    device_info: Arc<dyn DeviceInfoSource>,
}

impl PersistenceWriter {
    /// Create a writer targeting `output_dir` (created on first use).
    pub fn new(
        output_dir: PathBuf,
        container: Arc<dyn ContainerWriter>,
        device_info: Arc<dyn DeviceInfoSource>,
    ) -> Self {
        Self {
            output_dir,
            container,
            device_info,
        }
    }

    /// Directory receiving the files.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the raw container and the sidecar for one shot.
    pub fn persist(
        &self,
        shot: &CapturedShot,
        characteristics: &DeviceCharacteristics,
        parameters: &ExposureParameters,
    ) -> Result<CaptureOutcome> {
        let snapshot = self.device_info.snapshot()?;
        fs::create_dir_all(&self.output_dir).map_err(|source| CaptureError::Persistence {
            path: self.output_dir.clone(),
            source,
        })?;

        let captured_at = Utc::now();
        let base = unique_base(&self.output_dir, captured_at.timestamp_millis(), self.container.extension());
        let image_file = self.output_dir.join(format!("{base}.{}", self.container.extension()));
        let metadata_file = self.output_dir.join(format!("{base}.json"));

        let image = write_file(&image_file, |out| {
            self.container
                .write(&shot.frame, &shot.metadata, characteristics, out)
        })?;

        let sidecar = json!({
            "captured_at": captured_at.to_rfc3339(),
            "image_file": file_name(&image_file),
            "device": snapshot,
            "parameters": parameters,
            "frame": {
                "width": shot.frame.size.width,
                "height": shot.frame.size.height,
                "fourcc": shot.frame.fourcc.to_string(),
                "sequence": shot.frame.sequence,
                "timestamp_ns": shot.frame.timestamp_ns,
            },
            "characteristics": flatten_entries("characteristics", &characteristics.entries),
            "capture_result": flatten_entries("capture_result", &shot.metadata.entries),
        });

        // On error the image guard drops here and takes the raw sibling with it.
        let metadata = write_file(&metadata_file, |out| {
            serde_json::to_writer_pretty(&mut *out, &sidecar).map_err(io::Error::from)
        })?;
        image.keep();
        metadata.keep();

        info!(
            image = %image_file.display(),
            iso = parameters.sensitivity,
            exposure_ns = parameters.exposure_duration_ns,
            "shot persisted"
        );
        Ok(CaptureOutcome {
            image_file,
            metadata_file,
            parameters: *parameters,
        })
    }
}

/// `raw_<millis>`, suffixed with `_<n>` until neither sibling exists.
fn unique_base(dir: &Path, millis: i64, extension: &str) -> String {
    let stem = format!("raw_{millis}");
    let mut base = stem.clone();
    let mut n = 1u32;
    while dir.join(format!("{base}.{extension}")).exists() || dir.join(format!("{base}.json")).exists() {
        base = format!("{stem}_{n}");
        n += 1;
    }
    base
}

/// A file written by this module that is deleted on drop unless kept.
///
/// Covers both error returns and panics unwinding out of a container writer.
struct PartialFile<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> PartialFile<'a> {
    const fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if !self.keep {
            remove_partial(self.path);
        }
    }
}

/// Create `path` exclusively, fill it and sync it to disk.
///
/// The returned guard removes the file again unless [`PartialFile::keep`] is called.
fn write_file<'a, F>(path: &'a Path, fill: F) -> Result<PartialFile<'a>>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| CaptureError::Persistence {
            path: path.to_path_buf(),
            source,
        })?;

    let guard = PartialFile::new(path);
    fill_and_sync(file, fill).map_err(|source| CaptureError::Persistence {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(guard)
}

fn fill_and_sync<F>(file: File, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut dyn Write) -> io::Result<()>,
{
    let mut out = BufWriter::new(file);
    fill(&mut out)?;
    out.flush()?;
    out.into_inner().map_err(io::IntoInnerError::into_error)?.sync_all()
}

fn remove_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), %err, "could not remove partial file"),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Best-effort JSON view of a metadata map; unrepresentable entries are logged and skipped.
fn flatten_entries(section: &str, entries: &BTreeMap<String, MetadataValue>) -> Value {
    let mut map = Map::new();
    for (key, value) in entries {
        match value.to_json() {
            Ok(json) => {
                map.insert(key.clone(), json);
            }
            Err(reason) => warn!(section, key = %key, %reason, "skipping metadata entry"),
        }
    }
    Value::Object(map)
}

/// Parse the capture time recorded in a sidecar.
pub fn sidecar_captured_at(sidecar: &Value) -> Option<DateTime<Utc>> {
    let text = sidecar.get("captured_at")?.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_info::{DeviceIdentity, DeviceSnapshot, StaticDeviceInfo};
    use crate::traits::{FourCC, Size};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    fn snapshot() -> DeviceSnapshot {
        DeviceSnapshot {
            device: DeviceIdentity {
                manufacturer: "Acme".to_owned(),
                model: "Test Rig".to_owned(),
                os_version: "Linux".to_owned(),
                hardware: "aarch64".to_owned(),
                cpu_cores: 4,
            },
            cameras: BTreeMap::new(),
            sensors: BTreeMap::new(),
        }
    }

    fn writer(dir: &Path, container: Arc<dyn ContainerWriter>) -> PersistenceWriter {
        PersistenceWriter::new(
            dir.to_path_buf(),
            container,
            Arc::new(StaticDeviceInfo(snapshot())),
        )
    }

    fn shot(released: &Arc<AtomicUsize>) -> CapturedShot {
        let counter = Arc::clone(released);
        let mut entries = BTreeMap::new();
        entries.insert("sensor.sensitivity".to_owned(), MetadataValue::Int(400));
        entries.insert("sensor.neutral".to_owned(), MetadataValue::Float(f64::NAN));
        entries.insert("vendor.blob".to_owned(), MetadataValue::Opaque("Blob".to_owned()));
        CapturedShot {
            frame: RawFrame::new(vec![1, 2, 3, 4, 5, 6, 7, 8], Size::new(2, 2), FourCC::RGGB, 9, 900)
                .with_release(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            metadata: CaptureMetadata {
                frame_number: 9,
                sensor_timestamp_ns: 900,
                entries,
            },
        }
    }

    fn characteristics() -> DeviceCharacteristics {
        let mut characteristics = DeviceCharacteristics::default();
        characteristics
            .entries
            .insert("sensor.info.white_level".to_owned(), MetadataValue::Int(1023));
        characteristics
            .entries
            .insert("vendor.calibration".to_owned(), MetadataValue::Opaque("Blob".to_owned()));
        characteristics
    }

    fn files_in(dir: &Path) -> usize {
        fs::read_dir(dir).map_or(0, Iterator::count)
    }

    struct FailingWriter;

    impl ContainerWriter for FailingWriter {
        fn extension(&self) -> &str {
            "raw"
        }

        fn write(
            &self,
            _frame: &RawFrame,
            _capture: &CaptureMetadata,
            _characteristics: &DeviceCharacteristics,
            out: &mut dyn Write,
        ) -> io::Result<()> {
            out.write_all(b"partial")?;
            Err(io::Error::other("encoder failed"))
        }
    }

    /// Writes the raw file, then occupies the sidecar path so the sidecar cannot be created.
    struct SidecarBlocker {
        dir: PathBuf,
    }

    impl ContainerWriter for SidecarBlocker {
        fn extension(&self) -> &str {
            "raw"
        }

        fn write(
            &self,
            frame: &RawFrame,
            _capture: &CaptureMetadata,
            _characteristics: &DeviceCharacteristics,
            out: &mut dyn Write,
        ) -> io::Result<()> {
            for entry in fs::read_dir(&self.dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "raw") {
                    fs::create_dir(path.with_extension("json"))?;
                }
            }
            out.write_all(&frame.data)
        }
    }

    struct PanickingWriter;

    impl ContainerWriter for PanickingWriter {
        fn extension(&self) -> &str {
            "raw"
        }

        #[allow(clippy::panic)]
        fn write(
            &self,
            _frame: &RawFrame,
            _capture: &CaptureMetadata,
            _characteristics: &DeviceCharacteristics,
            out: &mut dyn Write,
        ) -> io::Result<()> {
            out.write_all(b"partial")?;
            out.flush()?;
            panic!("encoder bug");
        }
    }

    struct NoDeviceInfo;

    impl DeviceInfoSource for NoDeviceInfo {
        fn snapshot(&self) -> Result<DeviceSnapshot> {
            Err(CaptureError::DeviceInfo("collector offline".to_owned()))
        }
    }

    #[test]
    #[traced_test]
    fn test_persist_writes_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let released = Arc::new(AtomicUsize::new(0));
        let shot = shot(&released);
        let params = ExposureParameters::new(400, 500_000);

        let outcome = writer(dir.path(), Arc::new(RawDumpWriter))
            .persist(&shot, &characteristics(), &params)
            .expect("persist");

        assert_eq!(outcome.parameters, params);
        assert_eq!(fs::read(&outcome.image_file).expect("raw"), shot.frame.data);
        let stem = outcome.image_file.file_stem().expect("stem").to_string_lossy().into_owned();
        assert!(stem.starts_with("raw_"));
        assert_eq!(outcome.metadata_file, dir.path().join(format!("{stem}.json")));

        let sidecar: Value =
            serde_json::from_slice(&fs::read(&outcome.metadata_file).expect("sidecar"))
                .expect("valid json");
        assert_eq!(sidecar["parameters"]["iso"], 400);
        assert_eq!(sidecar["parameters"]["exposure_time_ns"], 500_000);
        assert_eq!(sidecar["device"]["device"]["model"], "Test Rig");
        assert_eq!(sidecar["frame"]["timestamp_ns"], 900);
        assert_eq!(sidecar["image_file"], format!("{stem}.raw"));
        assert_eq!(sidecar["characteristics"]["sensor.info.white_level"], 1023);
        assert_eq!(sidecar["capture_result"]["sensor.sensitivity"], 400);
        assert!(sidecar["capture_result"].get("vendor.blob").is_none());
        assert!(sidecar["capture_result"].get("sensor.neutral").is_none());
        assert!(sidecar["characteristics"].get("vendor.calibration").is_none());
        assert!(sidecar_captured_at(&sidecar).is_some());
        assert!(logs_contain("skipping metadata entry"));

        drop(shot);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_same_millisecond_gets_distinct_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert_eq!(unique_base(dir.path(), 42, "raw"), "raw_42");

        fs::write(dir.path().join("raw_42.raw"), b"x").expect("write");
        assert_eq!(unique_base(dir.path(), 42, "raw"), "raw_42_1");

        fs::write(dir.path().join("raw_42_1.json"), b"{}").expect("write");
        assert_eq!(unique_base(dir.path(), 42, "raw"), "raw_42_2");
    }

    #[test]
    fn test_container_failure_leaves_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let released = Arc::new(AtomicUsize::new(0));
        let err = writer(dir.path(), Arc::new(FailingWriter))
            .persist(&shot(&released), &characteristics(), &ExposureParameters::new(100, 1_000))
            .expect_err("writer fails");

        assert!(matches!(err, CaptureError::Persistence { .. }));
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_sidecar_failure_removes_raw_sibling() {
        let dir = tempfile::tempdir().expect("tempdir");
        let released = Arc::new(AtomicUsize::new(0));
        let blocker = SidecarBlocker {
            dir: dir.path().to_path_buf(),
        };
        let err = writer(dir.path(), Arc::new(blocker))
            .persist(&shot(&released), &characteristics(), &ExposureParameters::new(100, 1_000))
            .expect_err("sidecar fails");

        assert!(matches!(err, CaptureError::Persistence { .. }));
        let leftovers: Vec<PathBuf> = fs::read_dir(dir.path())
            .expect("read_dir")
            .map(|entry| entry.expect("entry").path())
            .collect();
        // Only the directory squatting on the sidecar name remains.
        assert!(leftovers.iter().all(|path| path.is_dir()), "{leftovers:?}");
    }

    #[test]
    fn test_panicking_container_leaves_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let released = Arc::new(AtomicUsize::new(0));
        let writer = writer(dir.path(), Arc::new(PanickingWriter));
        let shot = shot(&released);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            writer.persist(&shot, &characteristics(), &ExposureParameters::new(100, 1_000))
        }));

        assert!(result.is_err(), "writer panic propagates");
        assert_eq!(files_in(dir.path()), 0);
    }

    #[test]
    fn test_device_info_failure_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let released = Arc::new(AtomicUsize::new(0));
        let writer = PersistenceWriter::new(
            dir.path().join("out"),
            Arc::new(RawDumpWriter),
            Arc::new(NoDeviceInfo),
        );

        let err = writer
            .persist(&shot(&released), &characteristics(), &ExposureParameters::new(100, 1_000))
            .expect_err("no snapshot");
        assert!(matches!(err, CaptureError::DeviceInfo(_)));
        assert!(!dir.path().join("out").exists());
    }
}
