//! Software model of the array controller firmware.
//!
//! The model is sans-IO: feed it each command datagram and send back the
//! telemetry datagram it returns. A command is echoed for a configurable number
//! of responses, then takes effect and the echo falls back to NOP.

use tracing::{debug, warn};

use crate::beamforming::{
    amplitude_for_attenuation, BeamformingEngine, Direction, PhaseProfile, MAX_ATTENUATION_CODE,
};
use crate::config::{EmulatorConfig, TestbedConfig};
use crate::error::{ConfigError, FrameError};
use crate::geometry::PhaseQuantizer;
use crate::protocol::{
    decode_command, CommandFrame, ControllerStatus, FrameLayout, PeripheralInfo, TelemetryFrame,
};

/// Full-scale RF-DC reading for a perfectly steered, unattenuated array.
const RFDC_FULL_SCALE: f64 = 1000.0;

#[derive(Debug, Clone)]
struct SimulatedPeripheral {
    address: [u8; 6],
    direction: Direction,
    battery_adc: u16,
    scan_rfdc: u16,
    phase_codes: Vec<i8>,
}

#[derive(Debug, Clone)]
struct RunningCommand {
    frame: CommandFrame,
    remaining: u32,
}

#[derive(Debug, Clone)]
pub struct ArrayEmulator {
    layout: FrameLayout,
    engine: BeamformingEngine,
    quantizer: PhaseQuantizer,
    busy_cycles: u32,
    attenuation: u8,
    current_phases: Vec<i8>,
    pa_powers: Vec<u16>,
    peripherals: Vec<SimulatedPeripheral>,
    running: Option<RunningCommand>,
}

impl ArrayEmulator {
    pub fn new(
        layout: FrameLayout,
        engine: BeamformingEngine,
        quantizer: PhaseQuantizer,
        config: &EmulatorConfig,
    ) -> Self {
        let elements = layout.elements;
        let peripherals = config
            .peripherals
            .iter()
            .take(layout.peripherals)
            .enumerate()
            .map(|(i, &direction)| SimulatedPeripheral {
                address: [0x02, 0x57, 0x50, 0x54, 0x00, i as u8 + 1],
                direction,
                battery_adc: config.battery_adc,
                scan_rfdc: 0,
                phase_codes: vec![0; elements],
            })
            .collect();
        let mut engine = engine;
        engine.apply_attenuation(MAX_ATTENUATION_CODE);

        Self {
            layout,
            engine,
            quantizer,
            busy_cycles: config.busy_cycles.max(1),
            attenuation: MAX_ATTENUATION_CODE,
            current_phases: vec![0; elements],
            pa_powers: vec![config.pa_power; elements],
            peripherals,
            running: None,
        }
    }

    pub fn from_config(config: &TestbedConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(
            config.layout()?,
            config.engine()?,
            config.quantizer()?,
            &config.emulator,
        ))
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Command currently being executed, if any.
    pub fn running(&self) -> Option<&CommandFrame> {
        self.running.as_ref().map(|r| &r.frame)
    }

    /// Overrides one PA power reading, e.g. to simulate a dead amplifier.
    pub fn set_pa_power(&mut self, element: usize, reading: u16) {
        if let Some(p) = self.pa_powers.get_mut(element) {
            *p = reading;
        }
    }

    /// Processes one command datagram and returns the telemetry reply.
    pub fn handle(&mut self, datagram: &[u8]) -> Result<Vec<u8>, FrameError> {
        let command = decode_command(datagram, self.layout.elements)?;
        Ok(self.step(command))
    }

    fn step(&mut self, command: CommandFrame) -> Vec<u8> {
        if self.running.is_none() && command != CommandFrame::Nop {
            debug!(tag = %command.tag(), "emulator accepted command");
            self.running = Some(RunningCommand {
                frame: command,
                remaining: self.busy_cycles,
            });
        }

        let mut finished = None;
        if let Some(run) = self.running.as_mut() {
            if run.remaining == 0 {
                finished = Some(run.frame.clone());
            } else {
                run.remaining -= 1;
            }
        }
        if let Some(frame) = finished {
            self.running = None;
            self.apply(&frame);
        }

        let frame = self.telemetry();
        self.layout.encode(&frame)
    }

    fn apply(&mut self, frame: &CommandFrame) {
        match frame {
            CommandFrame::Nop => {}
            CommandFrame::Reset => {
                self.current_phases.iter_mut().for_each(|c| *c = 0);
                for p in &mut self.peripherals {
                    p.phase_codes.iter_mut().for_each(|c| *c = 0);
                    p.scan_rfdc = 0;
                }
            }
            CommandFrame::Scan(_) => {
                for i in 0..self.peripherals.len() {
                    let target = self.peripherals[i].direction;
                    let codes: Vec<i8> = self
                        .engine
                        .desired_phase(target.theta_deg, target.phi_deg)
                        .quantize(&self.quantizer)
                        .into_iter()
                        .map(|c| c as i8)
                        .collect();
                    let level = self.rfdc_toward(&codes, target);
                    let p = &mut self.peripherals[i];
                    p.phase_codes = codes;
                    p.scan_rfdc = level;
                }
            }
            CommandFrame::Steer(target) => match self.peripherals.get(*target as usize) {
                Some(p) => self.current_phases = p.phase_codes.clone(),
                None => warn!(index = *target, "steer target has no peripheral"),
            },
            CommandFrame::SetPhase(codes) => {
                for (dst, &src) in self.current_phases.iter_mut().zip(codes) {
                    *dst = src as i8;
                }
            }
            CommandFrame::SetLoss(code) => {
                self.attenuation = (*code).min(MAX_ATTENUATION_CODE);
                self.engine.apply_attenuation(self.attenuation);
            }
        }
    }

    fn rfdc_toward(&self, codes: &[i8], direction: Direction) -> u16 {
        let profile = PhaseProfile::from_codes(self.engine.geometry(), &self.quantizer, codes);
        let full = self.layout.elements as f64 * amplitude_for_attenuation(0);
        let level = self.engine.pattern_toward(&profile, direction) / full * RFDC_FULL_SCALE;
        level.round().clamp(0.0, u16::MAX as f64) as u16
    }

    /// Frame the controller would report right now.
    pub fn telemetry(&self) -> TelemetryFrame {
        let status = if self.peripherals.is_empty() {
            ControllerStatus::NoConnection
        } else if self.running.is_some() {
            ControllerStatus::Busy
        } else {
            ControllerStatus::Ready
        };
        let echoed = self
            .running
            .as_ref()
            .map(|r| r.frame.tag())
            .unwrap_or_default();

        let mut peripherals: Vec<PeripheralInfo> = self
            .peripherals
            .iter()
            .map(|p| PeripheralInfo {
                address: p.address,
                rfdc_adc: self.rfdc_toward(&self.current_phases, p.direction),
                battery_adc: p.battery_adc,
                scan_rfdc: p.scan_rfdc,
                phase_codes: p.phase_codes.clone(),
            })
            .collect();
        peripherals.resize(
            self.layout.peripherals,
            PeripheralInfo {
                phase_codes: vec![0; self.layout.elements],
                ..Default::default()
            },
        );

        TelemetryFrame {
            status,
            echoed,
            attenuation: self.attenuation,
            current_phases: self.current_phases.clone(),
            pa_powers: self.pa_powers.clone(),
            peripherals,
        }
    }
}
