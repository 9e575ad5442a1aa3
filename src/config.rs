//! Capture configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! output_dir = "captures"
//! gate_timeout = "2500ms"
//! shot_timeout = "5s"
//! settle_delay = "300ms"
//!
//! [[shots]]
//! iso = 100
//! exposure_time_ns = 1000000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CaptureError, Result};
use crate::traits::ExposureParameters;

/// Tunables for a burst.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    /// Directory receiving raw files and sidecars.
    pub output_dir: PathBuf,
    /// How long to wait for the exclusive access gate.
    #[serde(with = "humantime_serde")]
    pub gate_timeout: Duration,
    /// How long to wait for the device to open.
    #[serde(with = "humantime_serde")]
    pub open_timeout: Duration,
    /// How long to wait for the session to configure.
    #[serde(with = "humantime_serde")]
    pub configure_timeout: Duration,
    /// How long to wait for a shot's completion signal.
    #[serde(with = "humantime_serde")]
    pub shot_timeout: Duration,
    /// Attempts to pick up the frame after completion.
    pub frame_retry_attempts: u32,
    /// Pause between frame pickup attempts.
    #[serde(with = "humantime_serde")]
    pub frame_retry_backoff: Duration,
    /// Pause between consecutive shots so the sensor can settle.
    #[serde(with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Buffers the streaming output may have outstanding.
    pub max_buffers: usize,
    /// Exposure bracket used when the caller supplies none.
    pub shots: Vec<ExposureParameters>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("captures"),
            gate_timeout: Duration::from_millis(2500),
            open_timeout: Duration::from_secs(5),
            configure_timeout: Duration::from_secs(5),
            shot_timeout: Duration::from_secs(5),
            frame_retry_attempts: 5,
            frame_retry_backoff: Duration::from_millis(20),
            settle_delay: Duration::from_millis(300),
            max_buffers: 3,
            shots: vec![
                ExposureParameters::new(100, 1_000_000),
                ExposureParameters::new(400, 500_000),
                ExposureParameters::new(800, 250_000),
            ],
        }
    }
}

impl CaptureConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| CaptureError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            CaptureError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), "loaded capture config");
        Ok(config)
    }

    /// Reject values the capture pipeline cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffers == 0 {
            return Err(CaptureError::Config("max_buffers must be at least 1".to_owned()));
        }
        if self.frame_retry_attempts == 0 {
            return Err(CaptureError::Config(
                "frame_retry_attempts must be at least 1".to_owned(),
            ));
        }
        if self.shot_timeout.is_zero() {
            return Err(CaptureError::Config("shot_timeout must be non-zero".to_owned()));
        }
        if let Some(bad) = self
            .shots
            .iter()
            .find(|shot| shot.sensitivity == 0 || shot.exposure_duration_ns == 0)
        {
            return Err(CaptureError::Config(format!(
                "shot {bad:?} needs a non-zero iso and exposure"
            )));
        }
        Ok(())
    }

    /// Worst-case extra time a single shot can add to a burst.
    pub fn shot_budget(&self) -> Duration {
        self.shot_timeout + self.frame_retry_backoff * self.frame_retry_attempts
    }
}
