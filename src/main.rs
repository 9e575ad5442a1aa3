//! Raw-burst-capture binary: runs one burst and prints the outcomes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use raw_burst_capture::device_info::{DeviceInfoSource, PlatformDeviceInfo};
use raw_burst_capture::mock::MockPlatform;
use raw_burst_capture::validation::{validate_burst_order, validate_outcome};
use raw_burst_capture::{
    BurstCapture, BurstResult, CallerContext, CallerQueue, CameraPlatform, CaptureConfig,
    CaptureError, ExposureParameters,
};

/// Capture a burst of raw exposures.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output directory (overrides the configuration).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Use the simulated camera instead of V4L2 hardware.
    #[arg(long)]
    simulate: bool,

    /// Print the device snapshot and exit.
    #[arg(long)]
    device_info: bool,

    /// Check every outcome's files after the burst.
    #[arg(long)]
    verify: bool,

    /// Exposures as ISO:EXPOSURE_NS (defaults to the configured bracket).
    #[arg(value_parser = parse_exposure)]
    shots: Vec<ExposureParameters>,
}

fn parse_exposure(text: &str) -> Result<ExposureParameters, String> {
    let (iso, exposure) = text
        .split_once(':')
        .ok_or_else(|| format!("expected ISO:EXPOSURE_NS, got {text:?}"))?;
    let iso = iso.parse().map_err(|err| format!("bad ISO {iso:?}: {err}"))?;
    let exposure = exposure
        .parse()
        .map_err(|err| format!("bad exposure {exposure:?}: {err}"))?;
    Ok(ExposureParameters::new(iso, exposure))
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Args::parse()) {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

fn platform(simulate: bool) -> raw_burst_capture::Result<Arc<dyn CameraPlatform>> {
    if simulate {
        return Ok(Arc::new(MockPlatform::new()));
    }
    #[cfg(feature = "v4l2")]
    {
        Ok(Arc::new(raw_burst_capture::V4l2Platform::new()))
    }
    #[cfg(not(feature = "v4l2"))]
    {
        Err(CaptureError::Config(
            "built without the v4l2 feature; use --simulate".to_owned(),
        ))
    }
}

fn run(args: Args) -> raw_burst_capture::Result<()> {
    let mut config = match &args.config {
        Some(path) => CaptureConfig::load(path)?,
        None => CaptureConfig::default(),
    };
    if let Some(output) = args.output {
        config.output_dir = output;
    }
    let shots = if args.shots.is_empty() {
        config.shots.clone()
    } else {
        args.shots
    };

    let platform = platform(args.simulate)?;

    if args.device_info {
        let snapshot = PlatformDeviceInfo::new(Arc::clone(&platform)).snapshot()?;
        let text = serde_json::to_string_pretty(&snapshot)
            .map_err(|err| CaptureError::DeviceInfo(err.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    let burst = BurstCapture::with_defaults(platform, config)?;
    if !burst.is_raw_supported() {
        return Err(CaptureError::CapabilityAbsent(
            "no camera advertises raw capture".to_owned(),
        ));
    }
    println!(
        "Capturing {} shots into {}",
        shots.len(),
        burst.output_dir().display()
    );

    let queue = Arc::new(CallerQueue::new());
    let result: Arc<Mutex<Option<BurstResult>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    burst.capture_burst(
        shots.clone(),
        Arc::clone(&queue) as Arc<dyn CallerContext>,
        move |outcomes| *slot.lock() = Some(outcomes),
    );
    let outcomes = loop {
        queue.run_next(Duration::from_millis(100));
        if let Some(outcomes) = result.lock().take() {
            break outcomes;
        }
    };

    for outcome in &outcomes {
        println!(
            "ISO {:>5}  {:>10} ns  {}",
            outcome.parameters.sensitivity,
            outcome.parameters.exposure_duration_ns,
            outcome.image_file.display()
        );
    }
    println!("{} of {} shots captured", outcomes.len(), shots.len());

    if args.verify {
        validate_burst_order(&outcomes, &shots)?;
        for outcome in &outcomes {
            validate_outcome(outcome)?;
        }
        println!("All outcomes verified");
    }
    Ok(())
}
