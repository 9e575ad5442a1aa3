//! Single-shot capture driver.
//!
//! A shot needs two independent events: the request's completion (which
//! carries the metadata used for tagging) and the delivery of its buffer
//! through the [`FrameBridge`](crate::bridge::FrameBridge). Completion is
//! awaited on a latch; the buffer is then picked up with a short bounded retry,
//! since nothing guarantees it arrives before the completion.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::latch::{latch, LatchSender, WaitError};
use crate::session::SessionController;
use crate::traits::{
    CaptureFailure, CaptureListener, CaptureMetadata, CaptureRequest, ExposureParameters, RawFrame,
};

/// Waiting limits for one shot.
#[derive(Debug, Clone, Copy)]
pub struct ShotPolicy {
    /// Wait for the completion signal.
    pub timeout: Duration,
    /// Attempts to pick up the frame after completion.
    pub frame_retry_attempts: u32,
    /// Pause between pickup attempts.
    pub frame_retry_backoff: Duration,
}

impl From<&CaptureConfig> for ShotPolicy {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            timeout: config.shot_timeout,
            frame_retry_attempts: config.frame_retry_attempts,
            frame_retry_backoff: config.frame_retry_backoff,
        }
    }
}

/// A completed shot: its buffer plus the completion metadata.
#[derive(Debug)]
pub struct CapturedShot {
    /// Raw buffer; dropping it returns the buffer to the pool.
    pub frame: RawFrame,
    /// Completion metadata for container tagging.
    pub metadata: CaptureMetadata,
}

enum ShotEvent {
    Completed(CaptureMetadata),
    Failed(CaptureFailure),
}

struct ShotEvents {
    done: Mutex<Option<LatchSender<ShotEvent>>>,
}

impl ShotEvents {
    fn fire(&self, event: ShotEvent) {
        if let Some(sender) = self.done.lock().take() {
            if sender.fire(event).is_err() {
                trace!("shot result arrived after the wait ended");
            }
        }
    }
}

impl CaptureListener for ShotEvents {
    fn on_completed(&self, metadata: CaptureMetadata) {
        self.fire(ShotEvent::Completed(metadata));
    }

    fn on_failed(&self, failure: CaptureFailure) {
        self.fire(ShotEvent::Failed(failure));
    }
}

/// Capture one manual exposure on a ready session.
///
/// Per-shot problems come back as [`CaptureError::ShotTimeout`] or
/// [`CaptureError::ShotFailed`]; a device fault noticed along the way comes
/// back as the fatal [`CaptureError::DeviceFault`]. The session is back in
/// `Ready` (or `Closing` after a fault) when this returns.
pub fn capture_one(
    controller: &mut SessionController,
    params: &ExposureParameters,
    policy: &ShotPolicy,
) -> Result<CapturedShot> {
    controller.begin_capture()?;
    let result = drive_shot(controller, params, policy);
    controller.end_capture();

    if let Err(err) = &result {
        warn!(
            iso = params.sensitivity,
            exposure_ns = params.exposure_duration_ns,
            %err,
            "capture failed"
        );
    }
    result
}

fn drive_shot(
    controller: &mut SessionController,
    params: &ExposureParameters,
    policy: &ShotPolicy,
) -> Result<CapturedShot> {
    let bridge = controller.bridge();
    if let Some(stale) = bridge.take_pending() {
        debug!(sequence = stale.sequence, "draining frame left over from an earlier shot");
        bridge.note_discarded();
    }

    let request = CaptureRequest::manual(params);
    let (sender, done) = latch();
    let listener = Arc::new(ShotEvents {
        done: Mutex::new(Some(sender)),
    });
    controller.submit(&request, listener)?;

    let metadata = match done.wait_timeout(policy.timeout) {
        Ok(ShotEvent::Completed(metadata)) => metadata,
        Ok(ShotEvent::Failed(failure)) => {
            controller.check_fault()?;
            return Err(CaptureError::ShotFailed(format!(
                "frame {} reported {:?}",
                failure.frame_number, failure.reason
            )));
        }
        Err(WaitError::TimedOut) => {
            controller.check_fault()?;
            return Err(CaptureError::ShotTimeout(policy.timeout));
        }
        Err(WaitError::Abandoned) => {
            controller.check_fault()?;
            return Err(CaptureError::ShotFailed(
                "platform dropped the capture request".to_owned(),
            ));
        }
    };
    trace!(
        frame_number = metadata.frame_number,
        timestamp_ns = metadata.sensor_timestamp_ns,
        "capture completed"
    );

    for attempt in 0..policy.frame_retry_attempts {
        if attempt > 0 {
            thread::sleep(policy.frame_retry_backoff);
        }
        let Some(frame) = bridge.take_pending() else {
            trace!(attempt, "frame not delivered yet");
            continue;
        };
        if metadata.sensor_timestamp_ns != 0 && frame.timestamp_ns != metadata.sensor_timestamp_ns {
            debug!(
                expected = metadata.sensor_timestamp_ns,
                got = frame.timestamp_ns,
                "discarding frame from another request"
            );
            bridge.note_discarded();
            continue;
        }
        return Ok(CapturedShot { frame, metadata });
    }

    controller.check_fault()?;
    Err(CaptureError::ShotFailed(format!(
        "no frame delivered after {} attempts",
        policy.frame_retry_attempts
    )))
}
