//! Planar array geometry and phase-shifter quantization.

use std::f64::consts::PI;

use crate::error::GeometryError;

/// Speed of light in mm/s; all array lengths are in millimetres.
pub const SPEED_OF_LIGHT_MM: f64 = 3e11;

/// Immutable description of an `rows x cols` planar array with half-wavelength spacing.
///
/// Element positions are centred on the array origin. Row 0 is the top row
/// (largest y), column 0 the leftmost (smallest x). Flat element arrays are
/// row-major: `index = cols * row + col`.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayGeometry {
    cols: usize,
    rows: usize,
    frequency_hz: f64,
    wavelength: f64,
    wavenumber: f64,
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl ArrayGeometry {
    pub fn new(cols: usize, rows: usize, frequency_hz: f64) -> Result<Self, GeometryError> {
        if cols == 0 || rows == 0 {
            return Err(GeometryError::Empty { cols, rows });
        }
        if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
            return Err(GeometryError::BadFrequency(frequency_hz));
        }

        let wavelength = SPEED_OF_LIGHT_MM / frequency_hz;
        let spacing = wavelength / 2.0;
        let xs = (0..cols)
            .map(|m| (m as f64 + 0.5 - cols as f64 / 2.0) * spacing)
            .collect();
        let ys = (0..rows)
            .map(|n| (rows as f64 / 2.0 - 0.5 - n as f64) * spacing)
            .collect();

        Ok(Self {
            cols,
            rows,
            frequency_hz,
            wavelength,
            wavenumber: 2.0 * PI / wavelength,
            xs,
            ys,
        })
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn element_count(&self) -> usize {
        self.cols * self.rows
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    pub fn wavelength(&self) -> f64 {
        self.wavelength
    }

    pub fn wavenumber(&self) -> f64 {
        self.wavenumber
    }

    pub fn spacing(&self) -> f64 {
        self.wavelength / 2.0
    }

    /// Column x positions, left to right.
    pub fn xs(&self) -> &[f64] {
        &self.xs
    }

    /// Row y positions, top to bottom.
    pub fn ys(&self) -> &[f64] {
        &self.ys
    }

    pub fn index(&self, row: usize, col: usize) -> usize {
        self.cols * row + col
    }
}

/// Maps phases in degrees to n-bit phase-shifter codes and back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseQuantizer {
    bits: u32,
}

impl PhaseQuantizer {
    /// Wire sentinel for an element without a commanded phase.
    pub const NO_PHASE: i8 = -1;

    /// `bits` must be 1..=7 so every code fits the signed byte used on the wire.
    pub fn new(bits: u32) -> Result<Self, GeometryError> {
        if !(1..=7).contains(&bits) {
            return Err(GeometryError::BadPhaseBits(bits));
        }
        Ok(Self { bits })
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn levels(&self) -> u32 {
        1 << self.bits
    }

    /// Degrees per code step.
    pub fn step_deg(&self) -> f64 {
        360.0 / self.levels() as f64
    }

    /// Nearest code for `angle_deg`, always in `[0, 2^bits)`.
    pub fn encode(&self, angle_deg: f64) -> u8 {
        let levels = self.levels() as i64;
        let steps = (angle_deg / self.step_deg()).round() as i64;
        steps.rem_euclid(levels) as u8
    }

    pub fn decode(&self, code: u8) -> f64 {
        code as f64 * self.step_deg()
    }

    /// Decodes a signed code as reported by the hardware. The `-1` sentinel reads as 0°.
    pub fn decode_wire(&self, code: i8) -> f64 {
        if code == Self::NO_PHASE {
            return 0.0;
        }
        let code = (code as i32).rem_euclid(self.levels() as i32);
        code as f64 * self.step_deg()
    }

    /// Largest possible `|decode(encode(x)) - x|` (mod 360).
    pub fn max_error_deg(&self) -> f64 {
        180.0 / self.levels() as f64
    }
}
