//! Last-known controller and peripheral state, plus the derived pointing directions.

use serde::Serialize;

use crate::beamforming::{BeamformingEngine, Direction, PhaseProfile};
use crate::geometry::PhaseQuantizer;
use crate::protocol::{CommandTag, ControllerStatus, PeripheralInfo, TelemetryFrame};
use crate::LinkStatus;

/// PA power readings below this mean the amplifier is not producing RF.
pub const PA_FAULT_THRESHOLD: u16 = 295;

/// Battery ADC span mapped onto 0..=100 %.
pub const BATTERY_ADC_EMPTY: u16 = 2150;
pub const BATTERY_ADC_FULL: u16 = 3600;

/// RF-DC ADC upper bounds of signal levels 0..=4; anything above is level 5.
pub const RFDC_LEVELS: [u16; 5] = [150, 300, 400, 700, 1000];

pub fn battery_percent(adc: u16) -> u8 {
    let clamped = adc.clamp(BATTERY_ADC_EMPTY, BATTERY_ADC_FULL);
    ((clamped - BATTERY_ADC_EMPTY) as u32 * 100 / (BATTERY_ADC_FULL - BATTERY_ADC_EMPTY) as u32) as u8
}

pub fn signal_level(rfdc_adc: u16) -> u8 {
    RFDC_LEVELS
        .iter()
        .position(|&upper| rfdc_adc < upper)
        .unwrap_or(RFDC_LEVELS.len()) as u8
}

/// One peripheral slot as seen by collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeripheralView {
    pub index: usize,
    pub present: bool,
    pub info: PeripheralInfo,
    /// Broadside for absent peripherals.
    pub direction: Direction,
    pub battery_percent: u8,
    pub signal_level: u8,
    /// The array is currently applying this peripheral's phase profile.
    pub targeted: bool,
}

/// Immutable copy of everything the control loop knows, handed to other tasks.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Number of frames received so far.
    pub frames: u64,
    pub link: LinkStatus,
    pub controller: ControllerStatus,
    pub echoed: CommandTag,
    pub attenuation: u8,
    pub current_phases: Vec<i8>,
    pub pa_powers: Vec<u16>,
    pub pa_faults: Vec<usize>,
    pub peripherals: Vec<PeripheralView>,
}

impl TelemetrySnapshot {
    pub fn present(&self) -> impl Iterator<Item = &PeripheralView> {
        self.peripherals.iter().filter(|p| p.present)
    }
}

/// Owned by the control loop; replaced wholesale on every decoded frame.
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    engine: BeamformingEngine,
    quantizer: PhaseQuantizer,
    frame: TelemetryFrame,
    directions: Vec<Direction>,
    // codes each cached direction was computed from
    solved_codes: Vec<Option<Vec<i8>>>,
    frames: u64,
}

impl TelemetryStore {
    pub fn new(engine: BeamformingEngine, quantizer: PhaseQuantizer) -> Self {
        Self {
            engine,
            quantizer,
            frame: TelemetryFrame::default(),
            directions: Vec::new(),
            solved_codes: Vec::new(),
            frames: 0,
        }
    }

    pub fn engine(&self) -> &BeamformingEngine {
        &self.engine
    }

    pub fn quantizer(&self) -> &PhaseQuantizer {
        &self.quantizer
    }

    pub fn frame(&self) -> &TelemetryFrame {
        &self.frame
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn direction(&self, index: usize) -> Direction {
        self.directions.get(index).copied().unwrap_or_default()
    }

    /// Replaces the stored frame and refreshes directions whose phase codes changed.
    pub fn update(&mut self, frame: TelemetryFrame) {
        if frame.attenuation != self.frame.attenuation || self.frames == 0 {
            self.engine.apply_attenuation(frame.attenuation);
        }

        let count = frame.peripherals.len();
        self.directions.resize(count, Direction::BROADSIDE);
        self.solved_codes.resize(count, None);

        for (i, peri) in frame.peripherals.iter().enumerate() {
            if !peri.is_present() {
                self.directions[i] = Direction::BROADSIDE;
                self.solved_codes[i] = None;
                continue;
            }
            if self.solved_codes[i].as_deref() == Some(peri.phase_codes.as_slice()) {
                continue;
            }
            let profile =
                PhaseProfile::from_codes(self.engine.geometry(), &self.quantizer, &peri.phase_codes);
            self.directions[i] = self.engine.estimate_direction(&profile);
            self.solved_codes[i] = Some(peri.phase_codes.clone());
        }

        self.frame = frame;
        self.frames += 1;
    }

    /// Indices of power amplifiers reading below [`PA_FAULT_THRESHOLD`].
    pub fn pa_faults(&self) -> Vec<usize> {
        self.frame
            .pa_powers
            .iter()
            .enumerate()
            .filter(|(_, &p)| p < PA_FAULT_THRESHOLD)
            .map(|(i, _)| i)
            .collect()
    }

    /// Direction the array itself is currently pointing.
    pub fn array_direction(&self) -> Direction {
        let profile = PhaseProfile::from_codes(
            self.engine.geometry(),
            &self.quantizer,
            &self.frame.current_phases,
        );
        self.engine.estimate_direction(&profile)
    }

    pub fn snapshot(&self, link: LinkStatus) -> TelemetrySnapshot {
        let peripherals = self
            .frame
            .peripherals
            .iter()
            .enumerate()
            .map(|(index, info)| {
                let present = info.is_present();
                PeripheralView {
                    index,
                    present,
                    direction: self.direction(index),
                    battery_percent: battery_percent(info.battery_adc),
                    signal_level: signal_level(info.rfdc_adc),
                    targeted: present && info.phase_codes == self.frame.current_phases,
                    info: info.clone(),
                }
            })
            .collect();

        TelemetrySnapshot {
            frames: self.frames,
            link,
            controller: self.frame.status,
            echoed: self.frame.echoed,
            attenuation: self.frame.attenuation,
            current_phases: self.frame.current_phases.clone(),
            pa_powers: self.frame.pa_powers.clone(),
            pa_faults: self.pa_faults(),
            peripherals,
        }
    }
}
