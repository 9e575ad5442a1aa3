//! Device session controller.
//!
//! Drives one device through
//! `Idle -> Opening -> Configuring -> Ready -> (Capturing <-> Ready)* -> Closing -> Closed`.
//! Every platform callback lands on a single-fire latch; the controller itself
//! is only ever touched by the worker thread, so its state needs no locking.
//! Asynchronous device errors are recorded by the device listener, which also
//! wakes whatever wait the worker is blocked in. The worker then forces the
//! session closed; the gate is only released once the device is closed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bridge::FrameBridge;
use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};
use crate::gate::{AccessGate, GatePermit};
use crate::latch::{latch, LatchSender, WaitError};
use crate::traits::{
    CameraDevice, CameraPlatform, CaptureFailure, CaptureListener, CaptureRequest,
    CaptureSession, DeviceCharacteristics, DeviceId, DeviceStateListener, FailureReason,
    FourCC, FrameListener, OutputTarget, SessionStateListener, Size,
};

/// Lifecycle of one controlled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Opening,
    Configuring,
    Ready,
    Capturing,
    Closing,
    Closed,
}

/// Timeouts and pool size the controller needs.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Wait for the exclusive access gate.
    pub gate_timeout: Duration,
    /// Wait for the open-complete signal.
    pub open_timeout: Duration,
    /// Wait for the configure-complete signal.
    pub configure_timeout: Duration,
    /// Buffers the streaming output may have outstanding.
    pub max_buffers: usize,
}

impl From<&CaptureConfig> for SessionSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            gate_timeout: config.gate_timeout,
            open_timeout: config.open_timeout,
            configure_timeout: config.configure_timeout,
            max_buffers: config.max_buffers,
        }
    }
}

/// Find the first device advertising raw capture.
pub fn find_raw_capable(platform: &dyn CameraPlatform) -> Result<(DeviceId, DeviceCharacteristics)> {
    let ids = platform.device_ids()?;
    if ids.is_empty() {
        return Err(CaptureError::CapabilityAbsent(
            "no camera devices registered".to_owned(),
        ));
    }

    for id in ids {
        match platform.characteristics(&id) {
            Ok(characteristics) if characteristics.supports_raw() => {
                return Ok((id, characteristics));
            }
            Ok(_) => debug!(device = %id, "device lacks raw capability"),
            Err(err) => warn!(device = %id, %err, "skipping device with unreadable characteristics"),
        }
    }

    Err(CaptureError::CapabilityAbsent(
        "no device advertises raw capture".to_owned(),
    ))
}

enum OpenEvent {
    Opened(Box<dyn CameraDevice>),
    Failed(CaptureError),
}

enum ConfigureEvent {
    Configured(Box<dyn CaptureSession>),
    Failed,
}

/// Device listener. Lives as long as the device and may fire after the open wait.
struct DeviceEvents {
    device_id: DeviceId,
    opened: Mutex<Option<LatchSender<OpenEvent>>>,
    configuring: Mutex<Option<Arc<SessionEvents>>>,
    in_flight: Mutex<Option<Arc<dyn CaptureListener>>>,
    fault: Mutex<Option<String>>,
}

impl DeviceEvents {
    fn new(device_id: DeviceId, opened: LatchSender<OpenEvent>) -> Self {
        Self {
            device_id,
            opened: Mutex::new(Some(opened)),
            configuring: Mutex::new(None),
            in_flight: Mutex::new(None),
            fault: Mutex::new(None),
        }
    }

    /// Record the fault, then wake the worker out of whichever wait it is in.
    fn record_fault(&self, reason: String) {
        error!(device = %self.device_id, %reason, "device fault");
        // Recorded before waking so the woken worker always sees it.
        self.fault.lock().get_or_insert_with(|| reason.clone());

        let opened = self.opened.lock().take();
        if let Some(sender) = opened {
            // Waiter gone means the open already timed out; nothing to hand back.
            let _ = sender.fire(OpenEvent::Failed(CaptureError::DeviceFault(reason)));
        }
        let configuring = self.configuring.lock().take();
        if let Some(session) = configuring {
            session.on_configure_failed();
        }
        let shot = self.in_flight.lock().take();
        if let Some(shot) = shot {
            debug!(device = %self.device_id, "failing in-flight shot on device fault");
            shot.on_failed(CaptureFailure {
                frame_number: 0,
                reason: FailureReason::Error,
            });
        }
    }

    fn take_fault(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    fn abandon(&self) {
        self.opened.lock().take();
    }
}

impl DeviceStateListener for DeviceEvents {
    fn on_opened(&self, device: Box<dyn CameraDevice>) {
        let sender = self.opened.lock().take();
        let unwanted = match sender {
            Some(sender) => match sender.fire(OpenEvent::Opened(device)) {
                Ok(()) => None,
                Err(OpenEvent::Opened(device)) => Some(device),
                Err(OpenEvent::Failed(_)) => None,
            },
            None => Some(device),
        };

        if let Some(mut device) = unwanted {
            warn!(device = %self.device_id, "device opened after the wait ended; closing it");
            teardown_step("late device close", || device.close());
        }
    }

    fn on_disconnected(&self) {
        self.record_fault("device disconnected".to_owned());
    }

    fn on_error(&self, code: i32) {
        self.record_fault(format!("device error {code}"));
    }
}

/// Session listener for one configure attempt.
struct SessionEvents {
    configured: Mutex<Option<LatchSender<ConfigureEvent>>>,
}

impl SessionStateListener for SessionEvents {
    fn on_configured(&self, session: Box<dyn CaptureSession>) {
        let sender = self.configured.lock().take();
        let unwanted = match sender {
            Some(sender) => match sender.fire(ConfigureEvent::Configured(session)) {
                Ok(()) => None,
                Err(ConfigureEvent::Configured(session)) => Some(session),
                Err(ConfigureEvent::Failed) => None,
            },
            None => Some(session),
        };

        if let Some(mut session) = unwanted {
            warn!("session configured after the wait ended; closing it");
            teardown_step("late session close", || session.close());
        }
    }

    fn on_configure_failed(&self) {
        if let Some(sender) = self.configured.lock().take() {
            let _ = sender.fire(ConfigureEvent::Failed);
        }
    }
}

/// Run one teardown step, logging errors and panics instead of propagating them.
fn teardown_step<F>(what: &str, step: F)
where
    F: FnOnce() -> Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(%err, "{what} failed"),
        Err(_) => error!("{what} panicked"),
    }
}

/// Owns the device, its session and the gate permit for one burst.
pub struct SessionController {
    platform: Arc<dyn CameraPlatform>,
    gate: AccessGate,
    settings: SessionSettings,
    state: SessionState,
    characteristics: Option<(DeviceId, DeviceCharacteristics)>,
    permit: Option<GatePermit>,
    events: Option<Arc<DeviceEvents>>,
    device: Option<Box<dyn CameraDevice>>,
    session: Option<Box<dyn CaptureSession>>,
    bridge: Arc<FrameBridge>,
}

impl SessionController {
    /// Create an idle controller.
    pub fn new(platform: Arc<dyn CameraPlatform>, gate: AccessGate, settings: SessionSettings) -> Self {
        Self {
            platform,
            gate,
            settings,
            state: SessionState::Idle,
            characteristics: None,
            permit: None,
            events: None,
            device: None,
            session: None,
            bridge: Arc::new(FrameBridge::new()),
        }
    }

    pub(crate) const fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "session state");
            self.state = next;
        }
    }

    fn expect_state(&self, expected: SessionState, action: &str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::DeviceFault(format!(
                "cannot {action} while {:?}",
                self.state
            )))
        }
    }

    /// Pick the first raw-capable device and remember its characteristics.
    pub fn select_capable_device(&mut self) -> Result<DeviceId> {
        self.expect_state(SessionState::Idle, "select a device")?;
        let (id, characteristics) = find_raw_capable(self.platform.as_ref())?;
        info!(device = %id, "selected raw-capable device");
        self.characteristics = Some((id.clone(), characteristics));
        Ok(id)
    }

    /// Largest raw output by pixel area.
    pub fn negotiate_output_size(&mut self, id: &DeviceId) -> Result<Size> {
        let characteristics = match &self.characteristics {
            Some((cached, characteristics)) if cached == id => characteristics.clone(),
            _ => {
                let characteristics = self.platform.characteristics(id)?;
                self.characteristics = Some((id.clone(), characteristics.clone()));
                characteristics
            }
        };

        let size = characteristics
            .raw_output_sizes
            .iter()
            .copied()
            .max_by_key(|size| size.area())
            .ok_or_else(|| {
                CaptureError::CapabilityAbsent(format!("device {id} has no raw output configuration"))
            })?;
        debug!(device = %id, %size, "negotiated raw output size");
        Ok(size)
    }

    /// Characteristics of the selected device.
    pub fn characteristics(&self) -> Option<&DeviceCharacteristics> {
        self.characteristics.as_ref().map(|(_, characteristics)| characteristics)
    }

    /// Acquire the gate and open the device, blocking until it reports back.
    pub fn open(&mut self, id: &DeviceId) -> Result<()> {
        self.expect_state(SessionState::Idle, "open")?;
        self.transition(SessionState::Opening);

        let permit = self.gate.acquire(self.settings.gate_timeout).ok_or_else(|| {
            CaptureError::AccessDenied(format!(
                "camera gate still held after {:?}",
                self.settings.gate_timeout
            ))
        })?;

        let (sender, opened) = latch();
        let events = Arc::new(DeviceEvents::new(id.clone(), sender));
        self.permit = Some(permit);
        self.events = Some(Arc::clone(&events));

        let listener = Arc::clone(&events) as Arc<dyn DeviceStateListener>;
        if let Err(err) = self.platform.open_device(id, listener) {
            self.release_gate();
            return Err(err);
        }

        match opened.wait_timeout(self.settings.open_timeout) {
            Ok(OpenEvent::Opened(device)) => {
                info!(device = %id, "device opened");
                self.device = Some(device);
                self.transition(SessionState::Configuring);
                Ok(())
            }
            Ok(OpenEvent::Failed(err)) => {
                self.release_gate();
                Err(err)
            }
            Err(WaitError::TimedOut) => {
                events.abandon();
                self.release_gate();
                Err(CaptureError::DeviceFault(format!(
                    "device {id} did not open within {:?}",
                    self.settings.open_timeout
                )))
            }
            Err(WaitError::Abandoned) => {
                self.release_gate();
                Err(CaptureError::DeviceFault(format!(
                    "platform dropped the open request for {id}"
                )))
            }
        }
    }

    /// Negotiate the single streaming output and wait for the session.
    pub fn configure_session(&mut self, size: Size) -> Result<()> {
        self.expect_state(SessionState::Configuring, "configure")?;
        self.check_fault()?;

        let fourcc = self
            .characteristics()
            .and_then(|characteristics| characteristics.raw_formats.first().copied())
            .unwrap_or(FourCC::RGGB);
        let output = OutputTarget {
            size,
            fourcc,
            max_buffers: self.settings.max_buffers,
            listener: Arc::clone(&self.bridge) as Arc<dyn FrameListener>,
        };

        let (sender, configured) = latch();
        let listener = Arc::new(SessionEvents {
            configured: Mutex::new(Some(sender)),
        });
        if let Some(events) = &self.events {
            *events.configuring.lock() = Some(Arc::clone(&listener));
        }
        // A fault recorded before the listener was registered woke nobody.
        self.check_fault()?;

        let device = self
            .device
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceFault("no open device".to_owned()))?;
        if let Err(err) = device.create_session(output, listener) {
            self.invalidate_device();
            return Err(err);
        }

        let outcome = configured.wait_timeout(self.settings.configure_timeout);
        if let Some(events) = &self.events {
            events.configuring.lock().take();
        }
        match outcome {
            Ok(ConfigureEvent::Configured(session)) => {
                info!(%size, %fourcc, "capture session ready");
                self.session = Some(session);
                self.transition(SessionState::Ready);
                Ok(())
            }
            Ok(ConfigureEvent::Failed) => {
                self.invalidate_device();
                self.check_fault()?;
                Err(CaptureError::DeviceFault(
                    "session configuration failed".to_owned(),
                ))
            }
            Err(WaitError::TimedOut) => {
                self.invalidate_device();
                Err(CaptureError::DeviceFault(format!(
                    "session not configured within {:?}",
                    self.settings.configure_timeout
                )))
            }
            Err(WaitError::Abandoned) => {
                self.invalidate_device();
                Err(CaptureError::DeviceFault(
                    "platform dropped the configure request".to_owned(),
                ))
            }
        }
    }

    /// Fail with the recorded device fault, if any, moving to `Closing`.
    pub fn check_fault(&mut self) -> Result<()> {
        let fault = self.events.as_ref().and_then(|events| events.take_fault());
        match fault {
            Some(reason) => {
                self.transition(SessionState::Closing);
                Err(CaptureError::DeviceFault(reason))
            }
            None => Ok(()),
        }
    }

    /// Shared frame slot fed by the streaming output.
    pub fn bridge(&self) -> Arc<FrameBridge> {
        Arc::clone(&self.bridge)
    }

    /// Enter `Capturing` for one shot.
    pub fn begin_capture(&mut self) -> Result<()> {
        self.check_fault()?;
        self.expect_state(SessionState::Ready, "capture")?;
        self.transition(SessionState::Capturing);
        Ok(())
    }

    /// Submit a request to the active session.
    ///
    /// A device fault recorded while the request is in flight fails it through
    /// `listener` right away.
    pub fn submit(&mut self, request: &CaptureRequest, listener: Arc<dyn CaptureListener>) -> Result<()> {
        self.expect_state(SessionState::Capturing, "submit a request")?;
        if let Some(events) = &self.events {
            *events.in_flight.lock() = Some(Arc::clone(&listener));
        }
        // A fault recorded before the listener was registered woke nobody.
        self.check_fault()?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| CaptureError::DeviceFault("no active session".to_owned()))?;
        session.capture(request, listener)
    }

    /// Return to `Ready` after a shot.
    pub fn end_capture(&mut self) {
        if let Some(events) = &self.events {
            events.in_flight.lock().take();
        }
        if self.state == SessionState::Capturing {
            self.transition(SessionState::Ready);
        }
    }

    /// Release buffers, session, device and gate. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closing);

        if self.bridge.clear() {
            debug!("released pending frame on close");
        }
        if let Some(mut session) = self.session.take() {
            teardown_step("session close", || session.close());
        }
        if let Some(mut device) = self.device.take() {
            teardown_step("device close", || device.close());
        }
        if let Some(events) = self.events.take() {
            events.abandon();
        }
        self.release_gate();

        self.transition(SessionState::Closed);
        debug!("session closed");
    }

    fn invalidate_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            teardown_step("device close", || device.close());
        }
        self.release_gate();
    }

    fn release_gate(&mut self) {
        if let Some(permit) = self.permit.take() {
            if permit.release() {
                debug!("gate released");
            }
        }
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.close();
    }
}
