//! Outcome validation utilities.
//!
//! This module provides functions to check that a burst's persisted outcomes
//! are complete and consistent with what was requested. Used by the CLI's
//! `--verify` mode and by integration tests.

use std::fs;

use serde_json::Value;

use crate::error::{CaptureError, Result};
use crate::persist::{sidecar_captured_at, CaptureOutcome};
use crate::traits::ExposureParameters;

/// Validates that one outcome's files exist and agree with its parameters.
///
/// # Arguments
///
/// * `outcome` - The outcome to validate
///
/// # Returns
///
/// * `Ok(())` if the outcome is valid
/// * `Err(CaptureError::Validation)` if validation fails
///
/// # Errors
///
/// Returns `Validation` if:
/// - Either file is missing, or the raw file is empty
/// - The files do not share a base name
/// - The sidecar is not JSON or lacks a capture time
/// - The sidecar's `iso`/`exposure_time_ns` differ from the outcome's parameters
pub fn validate_outcome(outcome: &CaptureOutcome) -> Result<()> {
    let raw = fs::metadata(&outcome.image_file).map_err(|err| {
        CaptureError::Validation(format!("{}: {err}", outcome.image_file.display()))
    })?;
    if raw.len() == 0 {
        return Err(CaptureError::Validation(format!(
            "{} is empty",
            outcome.image_file.display()
        )));
    }

    if outcome.image_file.file_stem() != outcome.metadata_file.file_stem() {
        return Err(CaptureError::Validation(format!(
            "{} and {} do not share a base name",
            outcome.image_file.display(),
            outcome.metadata_file.display()
        )));
    }

    let text = fs::read(&outcome.metadata_file).map_err(|err| {
        CaptureError::Validation(format!("{}: {err}", outcome.metadata_file.display()))
    })?;
    let sidecar: Value = serde_json::from_slice(&text).map_err(|err| {
        CaptureError::Validation(format!("{}: {err}", outcome.metadata_file.display()))
    })?;

    if sidecar_captured_at(&sidecar).is_none() {
        return Err(CaptureError::Validation(format!(
            "{} has no capture time",
            outcome.metadata_file.display()
        )));
    }

    let recorded: ExposureParameters = sidecar
        .get("parameters")
        .cloned()
        .ok_or_else(|| CaptureError::Validation("sidecar has no parameters".to_owned()))
        .and_then(|parameters| {
            serde_json::from_value(parameters)
                .map_err(|err| CaptureError::Validation(format!("bad parameters: {err}")))
        })?;
    if recorded != outcome.parameters {
        return Err(CaptureError::Validation(format!(
            "sidecar records {recorded:?}, outcome says {:?}",
            outcome.parameters
        )));
    }

    Ok(())
}

/// Validates that outcomes are an order-preserving subsequence of the request.
///
/// Failed shots leave gaps, so outcomes may be fewer than requested, but each
/// one must match a later request than the outcome before it.
///
/// # Errors
///
/// Returns `Validation` if there are more outcomes than requests, or an
/// outcome matches no remaining request.
pub fn validate_burst_order(outcomes: &[CaptureOutcome], requested: &[ExposureParameters]) -> Result<()> {
    if outcomes.len() > requested.len() {
        return Err(CaptureError::Validation(format!(
            "{} outcomes for {} requests",
            outcomes.len(),
            requested.len()
        )));
    }

    let mut remaining = requested.iter();
    for (index, outcome) in outcomes.iter().enumerate() {
        if !remaining.any(|params| *params == outcome.parameters) {
            return Err(CaptureError::Validation(format!(
                "outcome {index} ({:?}) is out of request order",
                outcome.parameters
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};

    fn outcome(dir: &Path, base: &str, iso: u32, exposure_ns: u64) -> CaptureOutcome {
        CaptureOutcome {
            image_file: dir.join(format!("{base}.raw")),
            metadata_file: dir.join(format!("{base}.json")),
            parameters: ExposureParameters::new(iso, exposure_ns),
        }
    }

    fn write_pair(outcome: &CaptureOutcome, sidecar_iso: u32) {
        fs::write(&outcome.image_file, [1u8, 2, 3, 4]).expect("write raw");
        let sidecar = serde_json::json!({
            "captured_at": "2024-05-01T12:00:00+00:00",
            "parameters": {
                "iso": sidecar_iso,
                "exposure_time_ns": outcome.parameters.exposure_duration_ns,
            },
        });
        fs::write(&outcome.metadata_file, sidecar.to_string()).expect("write sidecar");
    }

    #[test]
    fn test_validate_outcome_success() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = outcome(dir.path(), "raw_1", 400, 500_000);
        write_pair(&outcome, 400);

        let result = validate_outcome(&outcome);
        assert!(result.is_ok(), "outcome should validate: {result:?}");
    }

    #[test]
    fn test_validate_outcome_parameter_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = outcome(dir.path(), "raw_1", 400, 500_000);
        write_pair(&outcome, 800);

        assert!(matches!(
            validate_outcome(&outcome),
            Err(CaptureError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_outcome_missing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outcome = outcome(dir.path(), "raw_1", 100, 1_000);
        assert!(validate_outcome(&outcome).is_err());

        fs::write(&outcome.image_file, b"").expect("write empty raw");
        assert!(validate_outcome(&outcome).is_err(), "empty raw must fail");
    }

    #[test]
    fn test_validate_outcome_mismatched_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut outcome = outcome(dir.path(), "raw_1", 100, 1_000);
        write_pair(&outcome, 100);
        outcome.metadata_file = PathBuf::from("raw_2.json");
        assert!(validate_outcome(&outcome).is_err());
    }

    #[test]
    fn test_validate_burst_order() {
        let dir = Path::new("/tmp");
        let requested = [
            ExposureParameters::new(100, 1_000_000),
            ExposureParameters::new(400, 500_000),
            ExposureParameters::new(800, 250_000),
        ];

        let gapped = [outcome(dir, "a", 100, 1_000_000), outcome(dir, "c", 800, 250_000)];
        assert!(validate_burst_order(&gapped, &requested).is_ok());
        assert!(validate_burst_order(&[], &requested).is_ok());

        let swapped = [outcome(dir, "c", 800, 250_000), outcome(dir, "a", 100, 1_000_000)];
        assert!(validate_burst_order(&swapped, &requested).is_err());

        let unknown = [outcome(dir, "x", 3200, 1)];
        assert!(validate_burst_order(&unknown, &requested).is_err());
    }

    #[test]
    fn test_validate_burst_order_repeated_parameters() {
        let dir = Path::new("/tmp");
        let requested = [ExposureParameters::new(100, 1_000); 2];
        let twice = [outcome(dir, "a", 100, 1_000), outcome(dir, "b", 100, 1_000)];
        assert!(validate_burst_order(&twice, &requested).is_ok());

        let thrice = [
            outcome(dir, "a", 100, 1_000),
            outcome(dir, "b", 100, 1_000),
            outcome(dir, "c", 100, 1_000),
        ];
        assert!(validate_burst_order(&thrice, &requested).is_err());
    }
}
