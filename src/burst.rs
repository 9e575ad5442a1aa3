//! Burst sequencer.
//!
//! A burst opens the device once, runs every exposure in order on the
//! background worker, persists the shots that succeed and hands the collected
//! outcomes back on the caller's context. Per-shot failures are skipped;
//! fatal errors end the burst early with whatever already succeeded.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::config::CaptureConfig;
use crate::device_info::PlatformDeviceInfo;
use crate::error::Result;
use crate::executor::{CallerContext, Inline, Worker};
use crate::gate::AccessGate;
use crate::latch::latch;
use crate::persist::{BurstResult, PersistenceWriter, RawDumpWriter};
use crate::session::{find_raw_capable, SessionController, SessionSettings};
use crate::shot::{capture_one, ShotPolicy};
use crate::traits::{CameraPlatform, ExposureParameters};

/// Burst capture front end. Owns the worker thread that talks to the hardware.
pub struct BurstCapture {
    platform: Arc<dyn CameraPlatform>,
    gate: AccessGate,
    config: Arc<CaptureConfig>,
    persistence: Arc<PersistenceWriter>,
    worker: Worker,
}

impl BurstCapture {
    /// Create a burst front end sharing `gate` with any other users of the hardware.
    pub fn new(
        platform: Arc<dyn CameraPlatform>,
        gate: AccessGate,
        config: CaptureConfig,
        persistence: PersistenceWriter,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            platform,
            gate,
            config: Arc::new(config),
            persistence: Arc::new(persistence),
            worker: Worker::spawn("raw-burst")?,
        })
    }

    /// Raw dumps into `config.output_dir`, device info from the platform and host, private gate.
    pub fn with_defaults(platform: Arc<dyn CameraPlatform>, config: CaptureConfig) -> Result<Self> {
        let persistence = PersistenceWriter::new(
            config.output_dir.clone(),
            Arc::new(RawDumpWriter),
            Arc::new(PlatformDeviceInfo::new(Arc::clone(&platform))),
        );
        Self::new(platform, AccessGate::new(), config, persistence)
    }

    /// Whether some device advertises raw capture.
    pub fn is_raw_supported(&self) -> bool {
        match find_raw_capable(self.platform.as_ref()) {
            Ok((id, _)) => {
                debug!(device = %id, "raw capture supported");
                true
            }
            Err(err) => {
                info!(%err, "raw capture not supported");
                false
            }
        }
    }

    /// Configuration in effect.
    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Directory receiving the files.
    pub fn output_dir(&self) -> PathBuf {
        self.persistence.output_dir().to_path_buf()
    }

    /// Run a burst on the worker and deliver the result through `context`.
    ///
    /// `on_done` runs exactly once. Without a raw-capable device it receives an
    /// empty result before this returns and nothing is queued; if the worker
    /// has stopped the empty result is posted to `context` instead.
    pub fn capture_burst<F>(
        &self,
        params: Vec<ExposureParameters>,
        context: Arc<dyn CallerContext>,
        on_done: F,
    ) where
        F: FnOnce(BurstResult) + Send + 'static,
    {
        if !self.is_raw_supported() {
            on_done(Vec::new());
            return;
        }

        let platform = Arc::clone(&self.platform);
        let gate = self.gate.clone();
        let config = Arc::clone(&self.config);
        let persistence = Arc::clone(&self.persistence);

        let delivery = Delivery::new(context, on_done);
        let queued = self.worker.submit(Box::new(move || {
            let mut outcomes = BurstResult::new();
            let run = panic::catch_unwind(AssertUnwindSafe(|| {
                run_burst(platform, gate, &config, &persistence, &params, &mut outcomes);
            }));
            if run.is_err() {
                error!(kept = outcomes.len(), "burst panicked; session torn down");
            }
            delivery.deliver(outcomes);
        }));
        if !queued {
            // The rejected job and its delivery are already dropped.
            error!(worker = self.worker.name(), "worker stopped; burst not run");
        }
    }

    /// Run a burst and wait for its result on the calling thread.
    pub fn capture_burst_blocking(&self, params: Vec<ExposureParameters>) -> BurstResult {
        let (sender, done) = latch();
        self.capture_burst(params, Arc::new(Inline), move |result| {
            let _ = sender.fire(result);
        });
        done.wait().unwrap_or_default()
    }
}

/// Hands a burst result to the caller's context once.
///
/// Dropped undelivered, e.g. with a job the worker never ran, it posts an
/// empty result so the caller is not left waiting.
struct Delivery<F>
where
    F: FnOnce(BurstResult) + Send + 'static,
{
    context: Arc<dyn CallerContext>,
    on_done: Option<F>,
}

impl<F> Delivery<F>
where
    F: FnOnce(BurstResult) + Send + 'static,
{
    fn new(context: Arc<dyn CallerContext>, on_done: F) -> Self {
        Self {
            context,
            on_done: Some(on_done),
        }
    }

    fn deliver(mut self, outcomes: BurstResult) {
        self.post(outcomes);
    }

    fn post(&mut self, outcomes: BurstResult) {
        if let Some(on_done) = self.on_done.take() {
            self.context.post(Box::new(move || on_done(outcomes)));
        }
    }
}

impl<F> Drop for Delivery<F>
where
    F: FnOnce(BurstResult) + Send + 'static,
{
    fn drop(&mut self) {
        if self.on_done.is_some() {
            warn!("burst result never produced; delivering empty result");
            self.post(BurstResult::new());
        }
    }
}

fn run_burst(
    platform: Arc<dyn CameraPlatform>,
    gate: AccessGate,
    config: &CaptureConfig,
    persistence: &PersistenceWriter,
    params: &[ExposureParameters],
    outcomes: &mut BurstResult,
) {
    let mut controller = SessionController::new(platform, gate, SessionSettings::from(config));
    let policy = ShotPolicy::from(config);

    if let Err(err) = run_shots(&mut controller, config, &policy, persistence, params, outcomes) {
        error!(%err, kept = outcomes.len(), "burst aborted");
    }
    controller.close();
    info!(
        requested = params.len(),
        captured = outcomes.len(),
        state = ?controller.state(),
        "burst finished"
    );
}

fn run_shots(
    controller: &mut SessionController,
    config: &CaptureConfig,
    policy: &ShotPolicy,
    persistence: &PersistenceWriter,
    params: &[ExposureParameters],
    outcomes: &mut BurstResult,
) -> Result<()> {
    let id = controller.select_capable_device()?;
    let size = controller.negotiate_output_size(&id)?;
    controller.open(&id)?;
    controller.configure_session(size)?;
    let characteristics = controller.characteristics().cloned().unwrap_or_default();
    info!(device = %id, %size, shots = params.len(), "burst started");

    for (index, shot_params) in params.iter().enumerate() {
        if index > 0 && !config.settle_delay.is_zero() {
            thread::sleep(config.settle_delay);
        }

        let shot = match capture_one(controller, shot_params, policy) {
            Ok(shot) => shot,
            Err(err) if err.is_fatal() => return Err(err),
            Err(_) => continue,
        };

        match persistence.persist(&shot, &characteristics, shot_params) {
            Ok(outcome) => outcomes.push(outcome),
            Err(err) => warn!(index, %err, "discarding shot that could not be persisted"),
        }
    }
    Ok(())
}
