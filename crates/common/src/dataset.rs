//! Synthetic training rows: the quantized steering profile for every survey position.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::beamforming::BeamformingEngine;
use crate::error::{TestbedError, TestbedResult};
use crate::geometry::PhaseQuantizer;
use crate::logger::{LogRecord, TelemetryLogger};
use crate::survey::{SurveyPlan, SurveyPosition};

/// Stand-in RF level for a synthetic row at `range`.
pub fn synthetic_rfdc(range: u32) -> u16 {
    range.saturating_mul(10).min(u16::MAX as u32) as u16
}

pub fn record_for(
    engine: &BeamformingEngine,
    quantizer: &PhaseQuantizer,
    position: SurveyPosition,
) -> LogRecord {
    let codes = engine
        .desired_phase(position.theta_deg as f64, position.phi_deg as f64)
        .quantize(quantizer)
        .into_iter()
        .map(|c| c as i8)
        .collect();
    LogRecord {
        peripheral: 1,
        range: position.range,
        theta_deg: position.theta_deg as f64,
        phi_deg: position.phi_deg as f64,
        phase_codes: codes,
        scan_rfdc: synthetic_rfdc(position.range),
    }
}

pub fn generate(
    engine: &BeamformingEngine,
    quantizer: &PhaseQuantizer,
    plan: &SurveyPlan,
) -> Vec<LogRecord> {
    plan.positions()
        .iter()
        .map(|&pos| record_for(engine, quantizer, pos))
        .collect()
}

/// Writes the whole dataset to a new CSV file in `dir` and returns its path.
pub fn write_dataset(
    dir: &Path,
    engine: &BeamformingEngine,
    quantizer: &PhaseQuantizer,
    plan: &SurveyPlan,
) -> TestbedResult<PathBuf> {
    let mut logger = TelemetryLogger::create(dir, engine.geometry().element_count())?;
    logger.log(&generate(engine, quantizer, plan))?;
    let path = logger
        .path()
        .map(Path::to_path_buf)
        .ok_or_else(|| TestbedError::Io(std::io::Error::other("logger has no backing file")))?;
    info!(rows = logger.rows_written(), path = %path.display(), "dataset written");
    Ok(path)
}
