use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::beamforming::{BeamformingEngine, Direction};
use crate::error::ConfigError;
use crate::geometry::{ArrayGeometry, PhaseQuantizer};
use crate::logging::LogLevel;
use crate::protocol::FrameLayout;
use crate::LinkStatus;

/// Everything the testbed reads from its TOML file. Every field has a default,
/// so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestbedConfig {
    pub network: NetworkConfig,
    pub array: ArrayConfig,
    pub beam: BeamConfig,
    pub sequencer: SequencerConfig,
    pub protocol: ProtocolConfig,
    pub log: LogConfig,
    pub survey: SurveyConfig,
    pub emulator: EmulatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local address of the controller link.
    pub bind: SocketAddr,
    /// Address of the array controller.
    pub peer: SocketAddr,
    pub recv_timeout_ready_ms: u64,
    pub recv_timeout_busy_ms: u64,
    /// Pause between poll cycles.
    pub poll_interval_ms: u64,
    /// Capacity of the loop's event channel.
    pub event_capacity: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([192, 168, 0, 10], 1248)),
            peer: SocketAddr::from(([192, 168, 0, 20], 1248)),
            recv_timeout_ready_ms: 2000,
            recv_timeout_busy_ms: 5000,
            poll_interval_ms: 20,
            event_capacity: 64,
        }
    }
}

impl NetworkConfig {
    /// Receive deadline for the next cycle given the current link status.
    pub fn recv_timeout(&self, status: LinkStatus) -> Duration {
        match status {
            LinkStatus::Busy => Duration::from_millis(self.recv_timeout_busy_ms),
            LinkStatus::Ready | LinkStatus::Disconnected => {
                Duration::from_millis(self.recv_timeout_ready_ms)
            }
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    pub cols: usize,
    pub rows: usize,
    pub frequency_hz: f64,
    pub phase_bits: u32,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            cols: 4,
            rows: 4,
            frequency_hz: 5.8e9,
            phase_bits: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    pub grid_step_deg: f64,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self { grid_step_deg: 5.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Frames without an echo before an in-flight command is given up.
    pub ack_timeout_cycles: u32,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            ack_timeout_cycles: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Row of the telemetry layout table.
    pub revision: u8,
    /// Peripheral slots carried in each telemetry frame.
    pub peripherals: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            revision: FrameLayout::CANONICAL.revision,
            peripherals: FrameLayout::CANONICAL.peripherals,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    /// Print tracing output to stderr.
    pub enable_console: bool,
    /// Write CSV rows for completed SCAN/STEER commands.
    pub enable_csv: bool,
    pub csv_dir: PathBuf,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            enable_console: true,
            enable_csv: true,
            csv_dir: PathBuf::from("logs"),
        }
    }
}

/// Ground-truth positions visited by an equipment survey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SurveyConfig {
    pub range_start: u32,
    pub range_end: u32,
    pub range_step: u32,
    pub theta_start: u32,
    pub theta_end: u32,
    pub theta_step: u32,
    pub phi_start: u32,
    pub phi_end: u32,
    pub phi_step: u32,
    /// First position to visit (index into the full plan).
    pub start_index: usize,
    /// One past the last position to visit; the whole plan when absent.
    pub end_index: Option<usize>,
}

impl Default for SurveyConfig {
    fn default() -> Self {
        Self {
            range_start: 50,
            range_end: 300,
            range_step: 100,
            theta_start: 0,
            theta_end: 45,
            theta_step: 10,
            phi_start: 180,
            phi_end: 360,
            phi_step: 60,
            start_index: 0,
            end_index: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub bind: SocketAddr,
    /// Responses that echo a command before it takes effect.
    pub busy_cycles: u32,
    pub pa_power: u16,
    pub battery_adc: u16,
    /// Simulated receivers, one per peripheral slot.
    pub peripherals: Vec<Direction>,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([192, 168, 0, 20], 1248)),
            busy_cycles: 3,
            pa_power: 300,
            battery_adc: 3300,
            peripherals: vec![Direction::new(30.0, 45.0), Direction::new(20.0, 200.0)],
        }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<TestbedConfig, ConfigError> {
    TestbedConfig::from_file(path)
}

impl TestbedConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: TestbedConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.geometry()?;
        self.quantizer()?;
        self.layout()?;

        if !(self.beam.grid_step_deg > 0.0 && self.beam.grid_step_deg <= 90.0) {
            return Err(ConfigError::Invalid(format!(
                "beam.grid_step_deg must be in (0, 90], got {}",
                self.beam.grid_step_deg
            )));
        }
        if self.network.recv_timeout_ready_ms == 0 || self.network.recv_timeout_busy_ms == 0 {
            return Err(ConfigError::Invalid("receive timeouts must be non-zero".into()));
        }
        if self.network.event_capacity == 0 {
            return Err(ConfigError::Invalid("network.event_capacity must be non-zero".into()));
        }
        let s = &self.survey;
        if s.range_step == 0 || s.theta_step == 0 || s.phi_step == 0 {
            return Err(ConfigError::Invalid("survey steps must be non-zero".into()));
        }
        if self.emulator.peripherals.len() > self.protocol.peripherals {
            return Err(ConfigError::Invalid(format!(
                "{} emulated peripherals but only {} slots",
                self.emulator.peripherals.len(),
                self.protocol.peripherals
            )));
        }
        Ok(())
    }

    /// Phase shifters on the configured array.
    pub fn elements(&self) -> usize {
        self.array.cols * self.array.rows
    }

    pub fn geometry(&self) -> Result<ArrayGeometry, ConfigError> {
        ArrayGeometry::new(self.array.cols, self.array.rows, self.array.frequency_hz)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn quantizer(&self) -> Result<PhaseQuantizer, ConfigError> {
        PhaseQuantizer::new(self.array.phase_bits).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn layout(&self) -> Result<FrameLayout, ConfigError> {
        FrameLayout::for_revision(
            self.protocol.revision,
            self.elements(),
            self.protocol.peripherals,
        )
        .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn engine(&self) -> Result<BeamformingEngine, ConfigError> {
        Ok(BeamformingEngine::new(self.geometry()?, self.beam.grid_step_deg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_file_gives_defaults() {
        let config: TestbedConfig = toml::from_str("").unwrap();
        assert_eq!(config, TestbedConfig::default());
        assert!(config.validate().is_ok());
        assert_eq!(config.network.peer.port(), 1248);
        assert_eq!(config.layout().unwrap(), FrameLayout::CANONICAL);
    }

    #[test]
    fn partial_sections_override_only_named_fields() {
        let config: TestbedConfig = toml::from_str(
            r#"
            [array]
            cols = 8
            rows = 8

            [network]
            peer = "127.0.0.1:9000"

            [log]
            level = "debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.array.cols, 8);
        assert_eq!(config.array.phase_bits, 4);
        assert_eq!(config.network.peer, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.network.recv_timeout_busy_ms, 5000);
        assert_eq!(config.log.level, LogLevel::Debug);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn oversized_array_is_rejected() {
        let mut config = TestbedConfig::default();
        config.array.cols = 9;
        config.array.rows = 8;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn bad_phase_bits_are_rejected() {
        let mut config = TestbedConfig::default();
        config.array.phase_bits = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_follows_link_status() {
        let net = NetworkConfig::default();
        assert_eq!(net.recv_timeout(LinkStatus::Ready), Duration::from_secs(2));
        assert_eq!(net.recv_timeout(LinkStatus::Disconnected), Duration::from_secs(2));
        assert_eq!(net.recv_timeout(LinkStatus::Busy), Duration::from_secs(5));
    }

    #[test]
    fn loads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[beam]\ngrid_step_deg = 2.5").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.beam.grid_step_deg, 2.5);

        assert!(matches!(
            load_config("/definitely/not/here.toml"),
            Err(ConfigError::Read(_))
        ));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[array\ncols = ").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn shipped_configs_are_valid() {
        let bench: TestbedConfig =
            toml::from_str(include_str!("../../../configs/testbed.toml")).unwrap();
        bench.validate().unwrap();
        assert_eq!(bench, TestbedConfig::default());

        let loopback: TestbedConfig =
            toml::from_str(include_str!("../../../configs/loopback.toml")).unwrap();
        loopback.validate().unwrap();
        assert_eq!(loopback.network.peer, loopback.emulator.bind);
        assert_eq!(loopback.emulator.peripherals.len(), 3);
    }
}
