//! Raw-Burst-Capture: manual-exposure raw bursts from a camera sensor
//!
//! This library drives one camera through a burst of manual exposures and
//! persists each successful shot as a raw file plus a JSON sidecar. Hardware
//! sits behind the trait seam in [`traits`], with a V4L2 implementation for
//! real devices and a scriptable mock for tests and simulation.

pub mod bridge;
pub mod burst;
pub mod config;
#[cfg(feature = "v4l2")]
pub mod device;
pub mod device_info;
pub mod error;
pub mod executor;
pub mod gate;
pub mod latch;
pub mod mock;
pub mod persist;
pub mod session;
pub mod shot;
pub mod traits;
pub mod validation;

pub use burst::BurstCapture;
pub use config::CaptureConfig;
#[cfg(feature = "v4l2")]
pub use device::V4l2Platform;
pub use error::{CaptureError, Result};
pub use executor::{CallerContext, CallerQueue, Inline};
pub use gate::AccessGate;
pub use persist::{BurstResult, CaptureOutcome, ContainerWriter, PersistenceWriter, RawDumpWriter};
pub use traits::{CameraPlatform, ExposureParameters};
