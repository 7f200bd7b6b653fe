//! Far-field array factor, phase-conjugate steering and direction estimation.
//!
//! The engine evaluates the classic planar array factor
//!
//! ```text
//! AF(θ, φ) = | Σ w[n,m] · exp(i·(k·(x[m]·u + y[n]·v) + ψ[n,m])) |
//! u = sin θ cos φ,  v = sin θ sin φ
//! ```
//!
//! over a fixed angular grid. Direction estimation is a pattern search: the
//! grid cell with the largest magnitude wins, and its signed `(θ, φ)` is folded
//! into the public convention `θ ∈ [0, 90]`, `φ ∈ [0, 360)`.

use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::geometry::{ArrayGeometry, PhaseQuantizer};

/// Default per-element amplitude.
pub const DEFAULT_AMPLITUDE: f64 = 8.0;

/// Largest attenuation code accepted by the array's step attenuator.
pub const MAX_ATTENUATION_CODE: u8 = 127;

/// Attenuator resolution in dB per code step.
pub const ATTENUATION_STEP_DB: f64 = 0.25;

/// Pointing direction in the public convention.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Direction {
    /// Elevation from broadside, `[0, 90]`.
    pub theta_deg: f64,
    /// Azimuth, `[0, 360)`.
    pub phi_deg: f64,
}

impl Direction {
    pub const BROADSIDE: Direction = Direction {
        theta_deg: 0.0,
        phi_deg: 0.0,
    };

    pub fn new(theta_deg: f64, phi_deg: f64) -> Self {
        Self { theta_deg, phi_deg }
    }

    /// Folds a raw, possibly signed grid angle pair into `θ ∈ [0, 90]`, `φ ∈ [0, 360)`.
    pub fn normalized(theta_deg: f64, phi_deg: f64) -> Self {
        let (theta, phi) = if theta_deg == 0.0 {
            (0.0, 0.0)
        } else if theta_deg < 0.0 {
            (theta_deg.abs(), phi_deg + 180.0)
        } else {
            (theta_deg, phi_deg)
        };
        let phi = phi.rem_euclid(360.0);
        // rem_euclid can round up to exactly 360.0 for tiny negative inputs
        let phi = if phi >= 360.0 { 0.0 } else { phi };
        Self {
            theta_deg: theta,
            phi_deg: phi,
        }
    }

    /// Direction cosines `(u, v)`.
    pub fn uv(&self) -> (f64, f64) {
        uv(self.theta_deg.to_radians(), self.phi_deg.to_radians())
    }
}

fn uv(theta_rad: f64, phi_rad: f64) -> (f64, f64) {
    let s = theta_rad.sin();
    (s * phi_rad.cos(), s * phi_rad.sin())
}

/// Per-element phases in degrees, row-major `rows x cols`.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseProfile {
    rows: usize,
    cols: usize,
    values: Vec<f64>,
}

impl PhaseProfile {
    pub fn zeros(geometry: &ArrayGeometry) -> Self {
        Self {
            rows: geometry.rows(),
            cols: geometry.cols(),
            values: vec![0.0; geometry.element_count()],
        }
    }

    /// Builds a profile from row-major degrees. Missing trailing elements read as 0°.
    pub fn from_degrees(geometry: &ArrayGeometry, degrees: &[f64]) -> Self {
        let mut profile = Self::zeros(geometry);
        for (dst, src) in profile.values.iter_mut().zip(degrees) {
            *dst = *src;
        }
        profile
    }

    /// Converts hardware phase codes (signed, `-1` = no phase) into degrees.
    pub fn from_codes(geometry: &ArrayGeometry, quantizer: &PhaseQuantizer, codes: &[i8]) -> Self {
        let degrees: Vec<f64> = codes.iter().map(|&c| quantizer.decode_wire(c)).collect();
        Self::from_degrees(geometry, &degrees)
    }

    /// Nearest shifter code per element.
    pub fn quantize(&self, quantizer: &PhaseQuantizer) -> Vec<u8> {
        self.values.iter().map(|&deg| quantizer.encode(deg)).collect()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.values[self.cols * row + col]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Non-negative per-element gains.
#[derive(Debug, Clone, PartialEq)]
pub struct AmplitudeWeights {
    values: Vec<f64>,
}

impl AmplitudeWeights {
    pub fn uniform(geometry: &ArrayGeometry, amplitude: f64) -> Self {
        Self {
            values: vec![sanitize(amplitude); geometry.element_count()],
        }
    }

    /// Weights as seen through the step attenuator: code 0 drives 10.0, code 127 drives 4.0.
    pub fn from_attenuation(geometry: &ArrayGeometry, code: u8) -> Self {
        Self::uniform(geometry, amplitude_for_attenuation(code))
    }

    pub fn set_uniform(&mut self, amplitude: f64) {
        let amplitude = sanitize(amplitude);
        self.values.iter_mut().for_each(|w| *w = amplitude);
    }

    pub fn set(&mut self, index: usize, amplitude: f64) {
        if let Some(w) = self.values.get_mut(index) {
            *w = sanitize(amplitude);
        }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

fn sanitize(amplitude: f64) -> f64 {
    if amplitude.is_finite() {
        amplitude.max(0.0)
    } else {
        0.0
    }
}

pub fn amplitude_for_attenuation(code: u8) -> f64 {
    let code = code.min(MAX_ATTENUATION_CODE) as f64;
    let max = MAX_ATTENUATION_CODE as f64;
    4.0 + 6.0 * (max - code) / max
}

pub fn attenuation_db(code: u8) -> f64 {
    code.min(MAX_ATTENUATION_CODE) as f64 * ATTENUATION_STEP_DB
}

/// Angular search grid. Points are ordered φ-major (φ outer, θ inner).
#[derive(Debug, Clone)]
pub struct AngleGrid {
    step_deg: f64,
    thetas: Vec<f64>,
    phis: Vec<f64>,
    uv: Vec<(f64, f64)>,
}

impl AngleGrid {
    /// θ over `[-90, 90]` and φ over `[-180, 180]`, both inclusive.
    pub fn new(step_deg: f64) -> Self {
        let thetas = inclusive_range(-90.0, 90.0, step_deg);
        let phis = inclusive_range(-180.0, 180.0, step_deg);
        let mut points = Vec::with_capacity(thetas.len() * phis.len());
        for &phi in &phis {
            for &theta in &thetas {
                points.push(uv(f64::to_radians(theta), f64::to_radians(phi)));
            }
        }
        Self {
            step_deg,
            thetas,
            phis,
            uv: points,
        }
    }

    pub fn step_deg(&self) -> f64 {
        self.step_deg
    }

    pub fn len(&self) -> usize {
        self.uv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uv.is_empty()
    }

    /// Signed `(θ, φ)` of the flat point index.
    pub fn angles(&self, index: usize) -> (f64, f64) {
        let n_theta = self.thetas.len();
        (self.thetas[index % n_theta], self.phis[index / n_theta])
    }

    pub fn thetas(&self) -> &[f64] {
        &self.thetas
    }

    pub fn phis(&self) -> &[f64] {
        &self.phis
    }
}

fn inclusive_range(start: f64, end: f64, step: f64) -> Vec<f64> {
    let count = ((end - start) / step).floor() as usize + 1;
    (0..count).map(|i| start + i as f64 * step).collect()
}

/// Beamforming engine bound to one array geometry.
#[derive(Debug, Clone)]
pub struct BeamformingEngine {
    geometry: ArrayGeometry,
    weights: AmplitudeWeights,
    grid: AngleGrid,
}

impl BeamformingEngine {
    pub fn new(geometry: ArrayGeometry, grid_step_deg: f64) -> Self {
        let weights = AmplitudeWeights::uniform(&geometry, DEFAULT_AMPLITUDE);
        Self {
            geometry,
            weights,
            grid: AngleGrid::new(grid_step_deg),
        }
    }

    pub fn geometry(&self) -> &ArrayGeometry {
        &self.geometry
    }

    pub fn grid(&self) -> &AngleGrid {
        &self.grid
    }

    pub fn weights(&self) -> &AmplitudeWeights {
        &self.weights
    }

    pub fn set_weights(&mut self, weights: AmplitudeWeights) {
        self.weights = weights;
    }

    /// Applies an attenuation command to the model weights.
    pub fn apply_attenuation(&mut self, code: u8) {
        self.weights.set_uniform(amplitude_for_attenuation(code));
    }

    /// Array factor magnitude at every grid point, in grid order.
    pub fn array_factor(
        &self,
        grid: &AngleGrid,
        profile: &PhaseProfile,
        weights: &AmplitudeWeights,
    ) -> Vec<f64> {
        let phasors = self.element_phasors(profile, weights);
        grid.uv
            .iter()
            .map(|&(u, v)| self.sum_at(&phasors, u, v).norm())
            .collect()
    }

    /// Array factor magnitude toward a single direction using the engine's weights.
    pub fn pattern_toward(&self, profile: &PhaseProfile, direction: Direction) -> f64 {
        let phasors = self.element_phasors(profile, &self.weights);
        let (u, v) = direction.uv();
        self.sum_at(&phasors, u, v).norm()
    }

    /// Upper bound of the array factor (all elements in phase).
    pub fn peak_gain(&self) -> f64 {
        self.weights.total()
    }

    /// Phase-conjugate steering profile toward `(theta_deg, phi_deg)`, degrees in (-180, 180].
    pub fn desired_phase(&self, theta_deg: f64, phi_deg: f64) -> PhaseProfile {
        let (u0, v0) = uv(theta_deg.to_radians(), phi_deg.to_radians());
        let k = self.geometry.wavenumber();
        let mut degrees = Vec::with_capacity(self.geometry.element_count());
        for &y in self.geometry.ys() {
            for &x in self.geometry.xs() {
                let propagation = Complex64::from_polar(1.0, -k * (x * u0 + y * v0));
                degrees.push(propagation.arg().to_degrees());
            }
        }
        PhaseProfile::from_degrees(&self.geometry, &degrees)
    }

    /// Locates the main lobe of `profile` on the engine's grid.
    ///
    /// Ties go to the first maximum in grid order. Never fails: an all-zero
    /// profile yields broadside.
    pub fn estimate_direction(&self, profile: &PhaseProfile) -> Direction {
        let magnitudes = self.array_factor(&self.grid, profile, &self.weights);
        let mut best = 0;
        for (i, &m) in magnitudes.iter().enumerate() {
            if m > magnitudes[best] {
                best = i;
            }
        }
        if magnitudes.is_empty() {
            return Direction::BROADSIDE;
        }
        let (theta, phi) = self.grid.angles(best);
        Direction::normalized(theta, phi)
    }

    fn element_phasors(&self, profile: &PhaseProfile, weights: &AmplitudeWeights) -> Vec<Complex64> {
        let values = profile.values();
        (0..self.geometry.element_count())
            .map(|i| {
                let w = weights.values().get(i).copied().unwrap_or(0.0);
                let psi = values.get(i).copied().unwrap_or(0.0).to_radians();
                Complex64::from_polar(w, psi)
            })
            .collect()
    }

    fn sum_at(&self, phasors: &[Complex64], u: f64, v: f64) -> Complex64 {
        let k = self.geometry.wavenumber();
        let cols = self.geometry.cols();
        let mut acc = Complex64::new(0.0, 0.0);
        for (n, &y) in self.geometry.ys().iter().enumerate() {
            for (m, &x) in self.geometry.xs().iter().enumerate() {
                let geometric = Complex64::from_polar(1.0, k * (x * u + y * v));
                acc += phasors[cols * n + m] * geometric;
            }
        }
        acc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(cols: usize, rows: usize) -> BeamformingEngine {
        BeamformingEngine::new(ArrayGeometry::new(cols, rows, 5.8e9).unwrap(), 5.0)
    }

    fn phi_diff(a: f64, b: f64) -> f64 {
        let d = (a - b).rem_euclid(360.0);
        d.min(360.0 - d)
    }

    #[test]
    fn grid_covers_both_hemispheres_inclusive() {
        let grid = AngleGrid::new(5.0);
        assert_eq!(grid.thetas().len(), 37);
        assert_eq!(grid.phis().len(), 73);
        assert_eq!(grid.len(), 37 * 73);
        assert_eq!(grid.angles(0), (-90.0, -180.0));
        assert_eq!(grid.angles(1), (-85.0, -180.0));
        assert_eq!(grid.angles(37), (-90.0, -175.0));
    }

    #[test]
    fn normalization_folds_signed_theta() {
        assert_eq!(Direction::normalized(0.0, 135.0), Direction::new(0.0, 0.0));
        assert_eq!(Direction::normalized(-30.0, -135.0), Direction::new(30.0, 45.0));
        assert_eq!(Direction::normalized(30.0, -90.0), Direction::new(30.0, 270.0));
        assert_eq!(Direction::normalized(45.0, 180.0), Direction::new(45.0, 180.0));
        assert_eq!(Direction::normalized(-45.0, 180.0), Direction::new(45.0, 0.0));
    }

    #[test]
    fn zero_profile_points_broadside() {
        let e = engine(4, 4);
        let zeros = PhaseProfile::zeros(e.geometry());
        assert_eq!(e.estimate_direction(&zeros), Direction::BROADSIDE);
    }

    #[test]
    fn broadside_peak_equals_total_weight() {
        let e = engine(4, 4);
        let zeros = PhaseProfile::zeros(e.geometry());
        let peak = e.pattern_toward(&zeros, Direction::BROADSIDE);
        assert!((peak - e.peak_gain()).abs() < 1e-9);
        assert!((peak - 16.0 * DEFAULT_AMPLITUDE).abs() < 1e-9);
    }

    #[test]
    fn desired_phase_is_conjugate_of_propagation() {
        let e = engine(4, 4);
        let profile = e.desired_phase(30.0, 45.0);
        for &deg in profile.values() {
            assert!(deg > -180.0 - 1e-9 && deg <= 180.0 + 1e-9);
        }
        // steering toward the target reaches the coherent maximum there
        let toward = e.pattern_toward(&profile, Direction::new(30.0, 45.0));
        assert!((toward - e.peak_gain()).abs() < 1e-6);
        // and is antisymmetric about the array centre
        let v = profile.values();
        assert!((v[0] + v[15]).abs() < 1e-9);
    }

    #[test]
    fn steering_round_trips_on_the_grid() {
        let e = engine(4, 4);
        let step = e.grid().step_deg();
        let mut theta = step;
        while theta < 90.0 {
            let mut phi = 0.0;
            while phi < 360.0 {
                let found = e.estimate_direction(&e.desired_phase(theta, phi));
                assert!(
                    (found.theta_deg - theta).abs() <= step + 1e-9,
                    "target ({theta}, {phi}) found {found:?}"
                );
                assert!(
                    phi_diff(found.phi_deg, phi) <= step + 1e-9,
                    "target ({theta}, {phi}) found {found:?}"
                );
                phi += step;
            }
            theta += step;
        }
    }

    #[test]
    fn endfire_resolves_up_to_its_mirror_lobe() {
        let e = engine(4, 4);
        let step = e.grid().step_deg();
        let mut phi = 0.0;
        while phi < 360.0 {
            let found = e.estimate_direction(&e.desired_phase(90.0, phi));
            assert!((found.theta_deg - 90.0).abs() <= step + 1e-9, "phi {phi}: {found:?}");
            // half-wavelength spacing: the opposite endfire can tie as a grating lobe
            let error = phi_diff(found.phi_deg, phi).min(phi_diff(found.phi_deg, phi + 180.0));
            assert!(error <= step + 1e-9, "phi {phi}: {found:?}");
            phi += step;
        }
    }

    #[test]
    fn estimate_always_lands_in_public_range() {
        let e = engine(2, 3);
        for seed in 0..20u32 {
            let degrees: Vec<f64> = (0..6).map(|i| ((seed * 37 + i * i * 91 + seed * i * 13) % 360) as f64).collect();
            let d = e.estimate_direction(&PhaseProfile::from_degrees(e.geometry(), &degrees));
            assert!((0.0..=90.0).contains(&d.theta_deg), "{d:?}");
            assert!((0.0..360.0).contains(&d.phi_deg), "{d:?}");
        }
    }

    #[test]
    fn attenuation_maps_onto_amplitude() {
        assert!((amplitude_for_attenuation(0) - 10.0).abs() < 1e-12);
        assert!((amplitude_for_attenuation(127) - 4.0).abs() < 1e-12);
        assert!((amplitude_for_attenuation(255) - 4.0).abs() < 1e-12);
        assert_eq!(attenuation_db(8), 2.0);
    }

    #[test]
    fn weights_stay_non_negative() {
        let g = ArrayGeometry::new(2, 2, 5.8e9).unwrap();
        let mut w = AmplitudeWeights::uniform(&g, -3.0);
        assert!(w.values().iter().all(|&v| v == 0.0));
        w.set(1, f64::NAN);
        w.set(2, 2.5);
        assert_eq!(w.values(), &[0.0, 0.0, 2.5, 0.0]);
    }

    #[test]
    fn codes_with_sentinel_become_degrees() {
        let g = ArrayGeometry::new(2, 2, 5.8e9).unwrap();
        let q = PhaseQuantizer::new(4).unwrap();
        let p = PhaseProfile::from_codes(&g, &q, &[-1, 1, 2, 15]);
        assert_eq!(p.values(), &[0.0, 22.5, 45.0, 337.5]);
        assert_eq!(p.get(1, 1), 337.5);
        assert_eq!(p.quantize(&q), vec![0, 1, 2, 15]);
    }
}
