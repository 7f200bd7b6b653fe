//! Append-only CSV log of completed scans and steers.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::info;

use crate::error::TestbedResult;
use crate::survey::SurveyPosition;
use crate::telemetry::TelemetrySnapshot;

/// One row: a present peripheral after a completed command.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// 1-based peripheral slot.
    pub peripheral: usize,
    pub range: u32,
    pub theta_deg: f64,
    pub phi_deg: f64,
    pub phase_codes: Vec<i8>,
    pub scan_rfdc: u16,
}

impl LogRecord {
    /// Rows for every present peripheral. During a survey the ground-truth
    /// position replaces the estimated direction.
    pub fn from_snapshot(
        snapshot: &TelemetrySnapshot,
        position: Option<SurveyPosition>,
    ) -> Vec<LogRecord> {
        snapshot
            .present()
            .map(|p| {
                let (range, direction) = match position {
                    Some(pos) => (pos.range, pos.direction()),
                    None => (0, p.direction),
                };
                LogRecord {
                    peripheral: p.index + 1,
                    range,
                    theta_deg: direction.theta_deg,
                    phi_deg: direction.phi_deg,
                    phase_codes: p.info.phase_codes.clone(),
                    scan_rfdc: p.info.scan_rfdc,
                }
            })
            .collect()
    }

    fn fields(&self) -> Vec<String> {
        let mut fields = Vec::with_capacity(5 + self.phase_codes.len());
        fields.push(self.peripheral.to_string());
        fields.push(self.range.to_string());
        fields.push(format!("{:.0}", self.theta_deg));
        fields.push(format!("{:.0}", self.phi_deg));
        fields.extend(self.phase_codes.iter().map(|c| c.to_string()));
        fields.push(self.scan_rfdc.to_string());
        fields
    }
}

/// Column names for an array of `elements` phase shifters.
pub fn header(elements: usize) -> Vec<String> {
    let mut cols = vec!["rx#".to_string(), "R".into(), "θ".into(), "φ".into()];
    cols.extend((0..elements).map(|i| format!("ps#{i}")));
    cols.push("v_rfdc".into());
    cols
}

pub struct TelemetryLogger {
    writer: csv::Writer<Box<dyn Write + Send>>,
    path: Option<PathBuf>,
    rows: u64,
}

impl std::fmt::Debug for TelemetryLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryLogger")
            .field("path", &self.path)
            .field("rows", &self.rows)
            .finish()
    }
}

impl TelemetryLogger {
    /// Opens a new timestamped file in `dir`, creating the directory if needed.
    /// Existing logs are never reopened.
    pub fn create(dir: &Path, elements: usize) -> TestbedResult<Self> {
        fs::create_dir_all(dir)?;
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let (path, file) = open_unique(dir, stamp)?;
        let mut logger = Self::from_writer(Box::new(file), elements)?;
        logger.path = Some(path.clone());
        info!(path = %path.display(), "CSV log opened");
        Ok(logger)
    }

    /// Writes the header to `out` immediately.
    pub fn from_writer(out: Box<dyn Write + Send>, elements: usize) -> TestbedResult<Self> {
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(out);
        writer.write_record(header(elements))?;
        writer.flush()?;
        Ok(Self {
            writer,
            path: None,
            rows: 0,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn rows_written(&self) -> u64 {
        self.rows
    }

    /// Appends `records` and flushes, so a crash loses at most the current batch.
    pub fn log(&mut self, records: &[LogRecord]) -> TestbedResult<()> {
        for record in records {
            self.writer.write_record(record.fields())?;
            self.rows += 1;
        }
        self.writer.flush()?;
        Ok(())
    }
}

/// `wpt_<stamp>.csv`, or `wpt_<stamp>_<n>.csv` when that name is taken.
fn open_unique(dir: &Path, stamp: u64) -> io::Result<(PathBuf, File)> {
    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => format!("wpt_{stamp}.csv"),
            n => format!("wpt_{stamp}_{n}.csv"),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => return Ok((path, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => return Err(e),
        }
    }
}
